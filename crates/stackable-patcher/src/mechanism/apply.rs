use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
use serde_json::json;
use snafu::{OptionExt, ResultExt};

use super::Target;
use crate::error::{ApplySnafu, FieldManagementDisabledSnafu, Result};

/// Merges server-side apply configurations, tracking the ownership of every
/// applied field.
///
/// This is the only mechanism which can create objects.
#[derive(Debug)]
pub struct ApplyPatcher {
    patch: Vec<u8>,
    force: bool,
    pub(super) target: Target,
}

impl ApplyPatcher {
    pub fn new(patch: &[u8], force: bool, target: Target) -> Self {
        Self {
            patch: patch.to_vec(),
            force,
            target,
        }
    }

    pub(super) fn apply_to_current(&self, current: &DynamicObject) -> Result<DynamicObject> {
        let field_manager =
            self.target
                .field_manager
                .as_ref()
                .context(FieldManagementDisabledSnafu {
                    resource: &self.target.resource.plural,
                })?;

        field_manager
            .apply(current, &self.patch, &self.target.manager, self.force)
            .context(ApplySnafu)
    }

    /// Applies the configuration to an empty object of the target's kind.
    pub(super) fn create_new(&self) -> Result<DynamicObject> {
        let empty = DynamicObject {
            types: Some(TypeMeta {
                api_version: self.target.resource.api_version.clone(),
                kind: self.target.resource.kind.clone(),
            }),
            metadata: ObjectMeta::default(),
            data: json!({}),
        };
        self.apply_to_current(&empty)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use kube::core::{ApiResource, GroupVersionKind};
    use stackable_field_manager::FieldManager;

    use super::*;
    use crate::ErrorKind;

    const CONFIG: &str = indoc! {"
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: settings
        data:
          mode: fast
    "};

    fn target(field_manager: Option<FieldManager>) -> Target {
        Target {
            resource: ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap")),
            name: "settings".to_owned(),
            manager: "kubectl".to_owned(),
            field_manager,
        }
    }

    #[test]
    fn creates_object() {
        let patcher = ApplyPatcher::new(
            CONFIG.as_bytes(),
            false,
            target(Some(FieldManager::default())),
        );
        let created = patcher.create_new().expect("apply creates object");

        assert_eq!(created.metadata.name.as_deref(), Some("settings"));
        assert_eq!(created.data["data"]["mode"], "fast");
        assert!(created.metadata.uid.is_none());
        assert!(created.metadata.managed_fields.is_some());
    }

    #[test]
    fn applying_twice_changes_nothing() {
        let patcher = ApplyPatcher::new(
            CONFIG.as_bytes(),
            false,
            target(Some(FieldManager::default())),
        );
        let created = patcher.create_new().expect("apply creates object");
        let applied = patcher
            .apply_to_current(&created)
            .expect("second apply succeeds");

        assert_eq!(applied, created);
    }

    #[test]
    fn conflicting_apply_is_a_conflict() {
        let created = ApplyPatcher::new(
            CONFIG.as_bytes(),
            false,
            target(Some(FieldManager::default())),
        )
        .create_new()
        .expect("apply creates object");

        let other = indoc! {"
            apiVersion: v1
            kind: ConfigMap
            metadata:
              name: settings
            data:
              mode: slow
        "};
        let mut other_target = target(Some(FieldManager::default()));
        other_target.manager = "operator".to_owned();

        let err = ApplyPatcher::new(other.as_bytes(), false, other_target.clone())
            .apply_to_current(&created)
            .expect_err("mode is owned by kubectl");
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let forced = ApplyPatcher::new(other.as_bytes(), true, other_target)
            .apply_to_current(&created)
            .expect("forced apply succeeds");
        assert_eq!(forced.data["data"]["mode"], "slow");
    }

    #[test]
    fn malformed_configuration_is_bad_request() {
        let err = ApplyPatcher::new(b"- a\n- b\n", false, target(Some(FieldManager::default())))
            .create_new()
            .expect_err("configuration must be an object");

        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn requires_field_management() {
        let err = ApplyPatcher::new(CONFIG.as_bytes(), false, target(None))
            .create_new()
            .expect_err("field management is disabled");

        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
