//! The per-attempt protocol of a patch request.
use async_trait::async_trait;
use kube::core::{DynamicObject, ObjectMeta, admission::Operation};
use snafu::ensure;

use crate::{
    admission::{self, AdmissionAttributes, AdmissionGate},
    error::{
        NameMismatchSnafu, NamespaceMismatchSnafu, Result, UidMismatchOnCreateSnafu,
        UidMismatchSnafu,
    },
    mechanism::Mechanism,
    store::UpdateObject,
};

/// Computes the next revision of an object for a patch request.
///
/// The patcher is handed to the store as the update callback. It only holds
/// request-scoped, immutable data, every call computes the candidate from
/// scratch based on the current object it is given.
pub struct Patcher<'a> {
    mechanism: Mechanism,
    admission: &'a dyn AdmissionGate,

    /// Template for the attributes passed to admission, the operation is set
    /// per attempt.
    attributes: AdmissionAttributes,
}

impl<'a> Patcher<'a> {
    pub fn new(
        mechanism: Mechanism,
        admission: &'a dyn AdmissionGate,
        attributes: AdmissionAttributes,
    ) -> Self {
        Self {
            mechanism,
            admission,
            attributes,
        }
    }

    /// Runs the mechanism and checks the identity of the result.
    fn apply_patch(&self, current: &DynamicObject) -> Result<DynamicObject> {
        let current_uid = current.metadata.uid.as_deref();

        let mut candidate = match current_uid {
            Some(_) => self.mechanism.apply_to_current(current)?,
            None => self.mechanism.create_new()?,
        };

        let candidate_uid = candidate.metadata.uid.clone();
        match (current_uid, candidate_uid.as_deref()) {
            (None, Some(uid)) => {
                return UidMismatchOnCreateSnafu {
                    resource: &self.attributes.resource,
                    name: &self.attributes.name,
                    uid,
                }
                .fail();
            }
            (Some(expected), Some(found)) => ensure!(
                expected == found,
                UidMismatchSnafu {
                    resource: &self.attributes.resource,
                    name: &self.attributes.name,
                    expected,
                    found,
                }
            ),
            // The patch removed the UID, which is immutable anyway
            (Some(uid), None) => candidate.metadata.uid = Some(uid.to_owned()),
            (None, None) => {}
        }

        self.check_name(&mut candidate)?;
        Ok(candidate)
    }

    /// Ensures the candidate is the object the request was addressed to.
    fn check_name(&self, candidate: &mut DynamicObject) -> Result<()> {
        let name = candidate.metadata.name.as_deref().unwrap_or_default();
        ensure!(
            name == self.attributes.name,
            NameMismatchSnafu {
                expected: &self.attributes.name,
                found: name,
            }
        );

        check_namespace(
            &mut candidate.metadata,
            self.attributes.namespace.as_deref(),
        )
    }

    /// Runs mutating admission on the candidate.
    async fn apply_admission(
        &self,
        mut candidate: DynamicObject,
        current: &DynamicObject,
    ) -> Result<DynamicObject> {
        let (operation, old_object) = match current.metadata.uid {
            Some(_) => (Operation::Update, Some(current)),
            None => (Operation::Create, None),
        };

        let attributes = AdmissionAttributes {
            operation,
            ..self.attributes.clone()
        };
        admission::admit(self.admission, &attributes, &mut candidate, old_object).await?;
        Ok(candidate)
    }
}

/// Ensures the namespace of an object matches the namespace of the request,
/// which is [`None`] for cluster scoped resources. Objects without a
/// namespace inherit the one of the request.
pub(crate) fn check_namespace(metadata: &mut ObjectMeta, expected: Option<&str>) -> Result<()> {
    let found = metadata.namespace.as_deref().unwrap_or_default();
    if found.is_empty() {
        metadata.namespace = expected.map(ToOwned::to_owned);
        return Ok(());
    }

    let expected = expected.unwrap_or_default();
    ensure!(
        found == expected,
        NamespaceMismatchSnafu { expected, found }
    );
    Ok(())
}

#[async_trait]
impl UpdateObject for Patcher<'_> {
    #[tracing::instrument(
        name = "apply patch",
        skip_all,
        fields(k8s.object.uid = ?current.metadata.uid, k8s.object.resource_version = ?current.metadata.resource_version)
    )]
    async fn updated_object(&self, current: &DynamicObject) -> Result<DynamicObject> {
        let candidate = self.apply_patch(current)?;
        self.apply_admission(candidate, current).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use k8s_openapi::api::authentication::v1::UserInfo;
    use kube::core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    use super::*;
    use crate::{
        ErrorKind,
        admission::{AdmissionError, AlwaysAdmit},
        mechanism::{JsonPatchOperations, JsonPatcher, Target},
    };

    fn resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"))
    }

    fn attributes() -> AdmissionAttributes {
        AdmissionAttributes {
            kind: GroupVersionKind::gvk("", "v1", "ConfigMap"),
            resource: "configmaps".to_owned(),
            namespace: Some("default".to_owned()),
            name: "cm".to_owned(),
            operation: Operation::Update,
            dry_run: false,
            user_info: UserInfo::default(),
        }
    }

    fn merge(patch: &[u8]) -> Mechanism {
        Mechanism::Json(JsonPatcher::new(JsonPatchOperations::merge(patch), Target {
            resource: resource(),
            name: "cm".to_owned(),
            manager: "test".to_owned(),
            field_manager: None,
        }))
    }

    fn stored() -> DynamicObject {
        let mut object = DynamicObject::new("cm", &resource())
            .within("default")
            .data(json!({"data": {"a": "1"}}));
        object.metadata.uid = Some("uid-1".to_owned());
        object
    }

    fn empty() -> DynamicObject {
        let mut object = DynamicObject::new("", &resource()).data(json!({}));
        object.metadata.name = None;
        object
    }

    #[tokio::test]
    async fn patches_existing_object() {
        let patcher = Patcher::new(merge(br#"{"data":{"a":"2"}}"#), &AlwaysAdmit, attributes());
        let patched = patcher
            .updated_object(&stored())
            .await
            .expect("patch applies");

        assert_eq!(patched.data["data"]["a"], "2");
        assert_eq!(patched.metadata.uid.as_deref(), Some("uid-1"));
    }

    #[tokio::test]
    async fn stripped_uid_is_restored() {
        let patcher = Patcher::new(
            merge(br#"{"metadata":{"uid":null}}"#),
            &AlwaysAdmit,
            attributes(),
        );
        let patched = patcher
            .updated_object(&stored())
            .await
            .expect("patch applies");

        assert_eq!(patched.metadata.uid.as_deref(), Some("uid-1"));
    }

    #[tokio::test]
    async fn changed_uid_is_a_conflict() {
        let patcher = Patcher::new(
            merge(br#"{"metadata":{"uid":"uid-2"}}"#),
            &AlwaysAdmit,
            attributes(),
        );
        let err = patcher
            .updated_object(&stored())
            .await
            .expect_err("uid must not change");

        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let patcher = Patcher::new(merge(br#"{"data":{"a":"2"}}"#), &AlwaysAdmit, attributes());
        let err = patcher
            .updated_object(&empty())
            .await
            .expect_err("merge patches can't create");

        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn renaming_is_a_bad_request() {
        let patcher = Patcher::new(
            merge(br#"{"metadata":{"name":"other"}}"#),
            &AlwaysAdmit,
            attributes(),
        );
        let err = patcher
            .updated_object(&stored())
            .await
            .expect_err("name must not change");

        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(
            err.to_string(),
            "the name of the object (other) does not match the name on the URL (cm)"
        );
    }

    #[tokio::test]
    async fn moving_namespace_is_a_bad_request() {
        let patcher = Patcher::new(
            merge(br#"{"metadata":{"namespace":"kube-system"}}"#),
            &AlwaysAdmit,
            attributes(),
        );
        let err = patcher
            .updated_object(&stored())
            .await
            .expect_err("namespace must not change");

        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn cluster_scoped_objects_stay_without_namespace() {
        let attributes = AdmissionAttributes {
            namespace: None,
            ..attributes()
        };
        let mut stored = stored();
        stored.metadata.namespace = None;

        let patcher = Patcher::new(
            merge(br#"{"metadata":{"namespace":"kube-system"}}"#),
            &AlwaysAdmit,
            attributes.clone(),
        );
        let err = patcher
            .updated_object(&stored)
            .await
            .expect_err("cluster scoped objects can't gain a namespace");
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let patcher = Patcher::new(merge(br#"{"data":{"a":"2"}}"#), &AlwaysAdmit, attributes);
        let patched = patcher
            .updated_object(&stored)
            .await
            .expect("patch applies");
        assert_eq!(patched.metadata.namespace, None);
    }

    /// Counts admission calls and stamps the operation onto the object.
    #[derive(Default)]
    struct RecordingGate {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AdmissionGate for RecordingGate {
        fn handles(&self, _operation: &Operation) -> bool {
            true
        }

        async fn admit(
            &self,
            attributes: &AdmissionAttributes,
            object: &mut DynamicObject,
            old_object: Option<&DynamicObject>,
        ) -> Result<(), AdmissionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if object.data["data"]["a"] == "forbidden" {
                return Err(AdmissionError::Denied {
                    reason: "value is forbidden".to_owned(),
                });
            }

            object.data["data"]["operation"] = json!(format!("{:?}", attributes.operation));
            object.data["data"]["hadOld"] = json!(old_object.is_some());
            Ok(())
        }
    }

    #[tokio::test]
    async fn admission_sees_every_attempt() {
        let gate = Arc::new(RecordingGate::default());
        let patcher = Patcher::new(merge(br#"{"data":{"a":"2"}}"#), gate.as_ref(), attributes());

        for _ in 0..3 {
            let patched = patcher
                .updated_object(&stored())
                .await
                .expect("patch applies");
            assert_eq!(patched.data["data"]["operation"], "Update");
            assert_eq!(patched.data["data"]["hadOld"], true);
        }

        assert_eq!(gate.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn admission_rejection_is_forbidden() {
        let gate = RecordingGate::default();
        let patcher = Patcher::new(merge(br#"{"data":{"a":"forbidden"}}"#), &gate, attributes());

        let err = patcher
            .updated_object(&stored())
            .await
            .expect_err("admission rejects");
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }
}
