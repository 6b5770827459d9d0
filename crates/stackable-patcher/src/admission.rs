//! Admission control hooks.
//!
//! An [`AdmissionGate`] is consulted twice during a write: the mutating
//! [`AdmissionGate::admit`] step runs right after the candidate object has
//! been computed, the validating [`AdmissionGate::validate`] step runs inside
//! the store right before the object is persisted.
use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::UserInfo;
use kube::core::{DynamicObject, GroupVersionKind, admission::Operation};
use snafu::{ResultExt, Snafu};

use crate::{
    error::{AdmissionSnafu, Result},
    store::ValidateObject,
};

#[derive(Debug, Snafu)]
pub enum AdmissionError {
    /// The request was rejected by a policy.
    #[snafu(display("request denied: {reason}"))]
    Denied { reason: String },

    /// The admission plugin itself failed.
    #[snafu(display("admission failed: {reason}"))]
    Failed { reason: String },
}

/// Everything an admission plugin knows about a request, apart from the
/// objects themselves.
#[derive(Clone, Debug, PartialEq)]
pub struct AdmissionAttributes {
    pub kind: GroupVersionKind,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: String,
    pub operation: Operation,
    pub dry_run: bool,
    pub user_info: UserInfo,
}

impl AdmissionAttributes {
    fn with_operation(&self, operation: Operation) -> Self {
        Self {
            operation,
            ..self.clone()
        }
    }
}

// We still need to use the async-trait crate, as dynamic dispatch is not
// supported in combination with async functions.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Whether the gate wants to see requests of the given `operation` at all.
    fn handles(&self, operation: &Operation) -> bool;

    /// Mutating admission. `old_object` is [`None`] for creates.
    ///
    /// The gate can change `object` in place, or reject the request.
    async fn admit(
        &self,
        attributes: &AdmissionAttributes,
        object: &mut DynamicObject,
        old_object: Option<&DynamicObject>,
    ) -> Result<(), AdmissionError>;

    /// Validating admission, called right before the object is persisted.
    async fn validate(
        &self,
        _attributes: &AdmissionAttributes,
        _object: &DynamicObject,
        _old_object: Option<&DynamicObject>,
    ) -> Result<(), AdmissionError> {
        Ok(())
    }
}

/// An [`AdmissionGate`] admitting every request unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAdmit;

#[async_trait]
impl AdmissionGate for AlwaysAdmit {
    fn handles(&self, _operation: &Operation) -> bool {
        false
    }

    async fn admit(
        &self,
        _attributes: &AdmissionAttributes,
        _object: &mut DynamicObject,
        _old_object: Option<&DynamicObject>,
    ) -> Result<(), AdmissionError> {
        Ok(())
    }
}

/// Runs mutating admission if the `gate` handles the operation of the
/// `attributes`.
pub(crate) async fn admit(
    gate: &dyn AdmissionGate,
    attributes: &AdmissionAttributes,
    object: &mut DynamicObject,
    old_object: Option<&DynamicObject>,
) -> Result<()> {
    if !gate.handles(&attributes.operation) {
        return Ok(());
    }

    tracing::debug!(operation = ?attributes.operation, "running mutating admission");
    gate.admit(attributes, object, old_object)
        .await
        .context(AdmissionSnafu {
            operation: attributes.operation.clone(),
        })
}

/// Adapts the validating step of an [`AdmissionGate`] to the store's
/// [`ValidateObject`] hook, using fixed request attributes.
pub(crate) struct AdmissionValidation<'a> {
    pub gate: &'a dyn AdmissionGate,
    pub attributes: AdmissionAttributes,
}

impl AdmissionValidation<'_> {
    async fn validate(
        &self,
        operation: Operation,
        object: &DynamicObject,
        old_object: Option<&DynamicObject>,
    ) -> Result<()> {
        let attributes = self.attributes.with_operation(operation.clone());
        self.gate
            .validate(&attributes, object, old_object)
            .await
            .context(AdmissionSnafu { operation })
    }
}

#[async_trait]
impl ValidateObject for AdmissionValidation<'_> {
    async fn validate_create(&self, object: &DynamicObject) -> Result<()> {
        self.validate(Operation::Create, object, None).await
    }

    async fn validate_update(&self, object: &DynamicObject, old_object: &DynamicObject) -> Result<()> {
        self.validate(Operation::Update, object, Some(old_object))
            .await
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ApiResource;
    use serde_json::json;

    use super::*;
    use crate::ErrorKind;

    /// Only mutates creates, and only accepts objects without a `blocked` key.
    struct CreateOnly;

    #[async_trait]
    impl AdmissionGate for CreateOnly {
        fn handles(&self, operation: &Operation) -> bool {
            matches!(operation, Operation::Create)
        }

        async fn admit(
            &self,
            _attributes: &AdmissionAttributes,
            object: &mut DynamicObject,
            _old_object: Option<&DynamicObject>,
        ) -> Result<(), AdmissionError> {
            object.data["admitted"] = json!(true);
            Ok(())
        }

        async fn validate(
            &self,
            _attributes: &AdmissionAttributes,
            object: &DynamicObject,
            _old_object: Option<&DynamicObject>,
        ) -> Result<(), AdmissionError> {
            match object.data.get("blocked") {
                Some(_) => Err(AdmissionError::Denied {
                    reason: "blocked objects are not allowed".to_owned(),
                }),
                None => Ok(()),
            }
        }
    }

    fn attributes(operation: Operation) -> AdmissionAttributes {
        AdmissionAttributes {
            kind: GroupVersionKind::gvk("", "v1", "ConfigMap"),
            resource: "configmaps".to_owned(),
            namespace: Some("default".to_owned()),
            name: "cm".to_owned(),
            operation,
            dry_run: false,
            user_info: UserInfo::default(),
        }
    }

    fn object() -> DynamicObject {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        DynamicObject::new("cm", &resource).data(json!({}))
    }

    #[tokio::test]
    async fn skips_unhandled_operations() {
        let mut created = object();
        admit(&CreateOnly, &attributes(Operation::Create), &mut created, None)
            .await
            .expect("create is admitted");
        assert_eq!(created.data["admitted"], true);

        let old = object();
        let mut updated = object();
        admit(
            &CreateOnly,
            &attributes(Operation::Update),
            &mut updated,
            Some(&old),
        )
        .await
        .expect("update is not handled");
        assert!(updated.data.get("admitted").is_none());
    }

    #[tokio::test]
    async fn validation_rejection_carries_operation() {
        let validation = AdmissionValidation {
            gate: &CreateOnly,
            attributes: attributes(Operation::Create),
        };
        let mut blocked = object();
        blocked.data["blocked"] = json!(true);

        let err = validation
            .validate_update(&blocked, &object())
            .await
            .expect_err("blocked objects are rejected");
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(err.to_string(), "admission webhook rejected the Update request");
    }
}
