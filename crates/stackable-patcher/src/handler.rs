//! The request handlers tying dispatch, the patcher, admission and the store
//! together.
use std::{future::Future, sync::Arc, time::Duration};

use http::StatusCode;
use kube::core::{DynamicObject, admission::Operation};
use serde_json::json;
use snafu::{OptionExt, ResultExt, ensure};

use crate::{
    PatcherOptions,
    admission::{self, AdmissionAttributes, AdmissionGate, AdmissionValidation},
    dispatcher::{build_mechanism, negotiate_patch_type},
    error::{
        ApiVersionMismatchSnafu, DecodeObjectSnafu, DryRunDisabledSnafu, MissingNameSnafu,
        MissingNamespaceSnafu, Result, TimeoutSnafu, UpdateManagedFieldsSnafu,
    },
    mechanism::Target,
    patcher::{Patcher, check_namespace},
    request::{
        CreateRequest, PatchRequest, RequestContext, ResourceScope, field_manager_name,
        parse_timeout,
    },
    store::{ObjectKey, ObjectStore},
};

/// The result of a successful request.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchOutcome {
    pub object: DynamicObject,

    /// Whether the object didn't exist before the request.
    pub created: bool,
}

impl PatchOutcome {
    /// `201 Created` for new objects, `200 OK` otherwise.
    pub fn status_code(&self) -> StatusCode {
        if self.created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        }
    }
}

/// Handles write requests for a single resource.
pub struct ResourceHandler {
    scope: ResourceScope,
    store: Arc<dyn ObjectStore>,
    admission: Arc<dyn AdmissionGate>,
    options: PatcherOptions,
}

impl ResourceHandler {
    /// Creates a handler for the resource in `scope`.
    ///
    /// Conflicting updates are retried by `store`, so the retry options in
    /// `options` have no effect here. Configure the store with
    /// [`PatcherOptions::retry_policy`] instead.
    pub fn new(
        scope: ResourceScope,
        store: Arc<dyn ObjectStore>,
        admission: Arc<dyn AdmissionGate>,
        options: PatcherOptions,
    ) -> Self {
        Self {
            scope,
            store,
            admission,
            options,
        }
    }

    pub fn scope(&self) -> &ResourceScope {
        &self.scope
    }

    /// Applies the patch in `request` to the addressed object.
    ///
    /// The object is created if it doesn't exist and the patch is an apply
    /// patch (or the scope allows creating objects on update).
    #[tracing::instrument(
        name = "patch resource",
        skip_all,
        fields(
            k8s.resource = %self.scope.resource.plural,
            k8s.object.name = %request.name,
            k8s.object.namespace = ?request.namespace,
            patch.type = %request.content_type,
        )
    )]
    pub async fn patch_resource(&self, request: PatchRequest) -> Result<PatchOutcome> {
        let dry_run = request.options.is_dry_run();
        ensure!(
            !dry_run || self.options.dry_run_enabled(),
            DryRunDisabledSnafu
        );

        let patch_type = negotiate_patch_type(&request.content_type, &self.scope)?;
        let timeout = self.timeout(&request.context);
        request.options.validate(patch_type)?;
        let namespace = self.namespace(request.namespace.as_deref())?;

        let manager = field_manager_name(
            request.options.field_manager.as_deref(),
            request.context.user_agent.as_deref(),
        );
        let mechanism = build_mechanism(
            patch_type,
            &request.body,
            request.options.force(),
            &self.scope,
            Target {
                resource: self.scope.resource.clone(),
                name: request.name.clone(),
                manager,
                field_manager: self.scope.field_manager.clone(),
            },
        )?;

        let attributes = self.admission_attributes(
            namespace.clone(),
            request.name.clone(),
            dry_run,
            &request.context,
        );
        let validation = AdmissionValidation {
            gate: self.admission.as_ref(),
            attributes: attributes.clone(),
        };
        let patcher = Patcher::new(mechanism, self.admission.as_ref(), attributes);

        let key = ObjectKey {
            namespace,
            name: request.name,
        };
        let allow_create = self.scope.allow_create_on_update || patch_type.can_create();

        tracing::debug!(%patch_type, allow_create, dry_run, "patching object");
        let written = with_timeout(
            timeout,
            self.store
                .guaranteed_update(&key, &patcher, &validation, allow_create, dry_run),
        )
        .await?;

        tracing::info!(created = written.created, "patched object");
        Ok(PatchOutcome {
            object: written.object,
            created: written.created,
        })
    }

    /// Creates the object in `request`.
    #[tracing::instrument(
        name = "create resource",
        skip_all,
        fields(
            k8s.resource = %self.scope.resource.plural,
            k8s.object.namespace = ?request.namespace,
        )
    )]
    pub async fn create_resource(&self, request: CreateRequest) -> Result<PatchOutcome> {
        let dry_run = request.options.is_dry_run();
        ensure!(
            !dry_run || self.options.dry_run_enabled(),
            DryRunDisabledSnafu
        );

        let timeout = self.timeout(&request.context);
        let namespace = self.namespace(request.namespace.as_deref())?;
        request.options.validate()?;

        let mut object: DynamicObject =
            serde_json::from_slice(&request.body).context(DecodeObjectSnafu)?;
        self.check_api_version(&object)?;

        let name = object
            .metadata
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .context(MissingNameSnafu)?;
        check_namespace(&mut object.metadata, namespace.as_deref())?;

        let attributes =
            self.admission_attributes(namespace.clone(), name.clone(), dry_run, &request.context);
        admission::admit(self.admission.as_ref(), &attributes, &mut object, None).await?;

        if let Some(field_manager) = &self.scope.field_manager {
            let manager = field_manager_name(
                request.options.field_manager.as_deref(),
                request.context.user_agent.as_deref(),
            );
            let live = DynamicObject {
                types: object.types.clone(),
                metadata: Default::default(),
                data: json!({}),
            };
            object = field_manager
                .update(&live, object, &manager)
                .context(UpdateManagedFieldsSnafu)?;
        }

        let key = ObjectKey { namespace, name };
        let validation = AdmissionValidation {
            gate: self.admission.as_ref(),
            attributes,
        };

        let object = with_timeout(
            timeout,
            self.store.create(&key, object, &validation, dry_run),
        )
        .await?;

        tracing::info!(k8s.object.name = %key.name, "created object");
        Ok(PatchOutcome {
            object,
            created: true,
        })
    }

    fn timeout(&self, context: &RequestContext) -> Duration {
        parse_timeout(context.timeout.as_deref(), *self.options.request_timeout)
    }

    /// Returns the namespace of the object, which is [`None`] for cluster
    /// scoped resources.
    fn namespace(&self, namespace: Option<&str>) -> Result<Option<String>> {
        if !self.scope.namespaced {
            return Ok(None);
        }

        namespace
            .filter(|namespace| !namespace.is_empty())
            .map(|namespace| Some(namespace.to_owned()))
            .context(MissingNamespaceSnafu {
                resource: &self.scope.resource.plural,
            })
    }

    fn check_api_version(&self, object: &DynamicObject) -> Result<()> {
        let found = object
            .types
            .as_ref()
            .map(|types| types.api_version.as_str())
            .unwrap_or_default();

        ensure!(
            found == self.scope.resource.api_version,
            ApiVersionMismatchSnafu {
                expected: &self.scope.resource.api_version,
                found,
            }
        );
        Ok(())
    }

    fn admission_attributes(
        &self,
        namespace: Option<String>,
        name: String,
        dry_run: bool,
        context: &RequestContext,
    ) -> AdmissionAttributes {
        AdmissionAttributes {
            kind: self.scope.gvk(),
            resource: self.scope.resource.plural.clone(),
            namespace,
            name,
            operation: Operation::Create,
            dry_run,
            user_info: context.user.clone(),
        }
    }
}

/// Bounds the whole operation, including all retries, by `timeout`.
async fn with_timeout<T>(timeout: Duration, operation: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(timeout = %humantime::format_duration(timeout), "request timed out");
            TimeoutSnafu { timeout }.fail()
        }
    }
}
