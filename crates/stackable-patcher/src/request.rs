//! The per-resource scope and the per-request inputs of the handlers.
use std::{fmt, sync::Arc, time::Duration};

use k8s_openapi::api::authentication::v1::UserInfo;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use snafu::ensure;
use stackable_field_manager::FieldManager;
use stackable_strategic_merge::SchemaReference;
use strum::IntoEnumIterator;

use crate::{
    error::{InvalidOptionsSnafu, Result},
    patch_type::PatchType,
};

/// The only value accepted for the `dryRun` option.
pub const DRY_RUN_ALL: &str = "All";

const MAX_FIELD_MANAGER_LENGTH: usize = 128;

/// Sets default values on objects after they were merged.
pub trait Defaulter: Send + Sync {
    fn apply_defaults(&self, object: &mut DynamicObject);
}

impl<F> Defaulter for F
where
    F: Fn(&mut DynamicObject) + Send + Sync,
{
    fn apply_defaults(&self, object: &mut DynamicObject) {
        self(object);
    }
}

/// Everything the handlers need to know about the resource they serve.
///
/// Use [`ResourceScope::builder`] to construct one.
#[derive(Clone, educe::Educe)]
#[educe(Debug)]
pub struct ResourceScope {
    pub resource: ApiResource,
    pub namespaced: bool,
    pub supported_patch_types: Vec<PatchType>,

    /// Merge strategies used for strategic merge patches.
    pub schema: SchemaReference,

    #[educe(Debug(ignore))]
    pub defaulter: Option<Arc<dyn Defaulter>>,

    /// Field ownership tracking. Apply patches are only possible if set.
    pub field_manager: Option<FieldManager>,

    /// Whether updates may create objects which don't exist yet. Apply
    /// patches can always create objects.
    pub allow_create_on_update: bool,
}

impl ResourceScope {
    pub fn builder(resource: ApiResource) -> ResourceScopeBuilder {
        ResourceScopeBuilder::new(resource)
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(
            &self.resource.group,
            &self.resource.version,
            &self.resource.kind,
        )
    }

    /// Returns `true` if requests with the given patch type are accepted.
    pub fn supports(&self, patch_type: PatchType) -> bool {
        let field_managed = patch_type != PatchType::Apply || self.field_manager.is_some();
        field_managed && self.supported_patch_types.contains(&patch_type)
    }
}

/// Builds a [`ResourceScope`].
///
/// By default the resource is namespaced, supports every patch type, tracks
/// field ownership with the default [`FieldManager`], has an empty schema and
/// doesn't allow creating objects on update.
pub struct ResourceScopeBuilder {
    scope: ResourceScope,
}

impl ResourceScopeBuilder {
    fn new(resource: ApiResource) -> Self {
        Self {
            scope: ResourceScope {
                resource,
                namespaced: true,
                supported_patch_types: PatchType::iter().collect(),
                schema: SchemaReference::default(),
                defaulter: None,
                field_manager: Some(FieldManager::default()),
                allow_create_on_update: false,
            },
        }
    }

    pub fn namespaced(mut self, namespaced: bool) -> Self {
        self.scope.namespaced = namespaced;
        self
    }

    pub fn supported_patch_types(mut self, patch_types: impl IntoIterator<Item = PatchType>) -> Self {
        self.scope.supported_patch_types = patch_types.into_iter().collect();
        self
    }

    pub fn schema(mut self, schema: SchemaReference) -> Self {
        self.scope.schema = schema;
        self
    }

    pub fn defaulter(mut self, defaulter: impl Defaulter + 'static) -> Self {
        self.scope.defaulter = Some(Arc::new(defaulter));
        self
    }

    /// Sets the field manager, or disables field ownership tracking if
    /// [`None`] is passed.
    pub fn field_manager(mut self, field_manager: Option<FieldManager>) -> Self {
        self.scope.field_manager = field_manager;
        self
    }

    pub fn allow_create_on_update(mut self, allow: bool) -> Self {
        self.scope.allow_create_on_update = allow;
        self
    }

    pub fn build(self) -> ResourceScope {
        self.scope
    }
}

/// Options of a patch request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchOptions {
    /// Either empty or `["All"]`.
    pub dry_run: Vec<String>,

    /// Take ownership of conflicting fields. Only valid for apply patches.
    pub force: Option<bool>,
    pub field_manager: Option<String>,
}

impl PatchOptions {
    pub fn is_dry_run(&self) -> bool {
        !self.dry_run.is_empty()
    }

    pub fn force(&self) -> bool {
        self.force.unwrap_or_default()
    }

    pub fn validate(&self, patch_type: PatchType) -> Result<()> {
        validate_dry_run(&self.dry_run)?;
        if let Some(field_manager) = &self.field_manager {
            validate_field_manager(field_manager)?;
        }

        if patch_type == PatchType::Apply {
            ensure!(
                self.field_manager
                    .as_deref()
                    .is_some_and(|field_manager| !field_manager.is_empty()),
                InvalidOptionsSnafu {
                    reason: "fieldManager is required for apply patch"
                }
            );
        } else {
            ensure!(
                self.force.is_none(),
                InvalidOptionsSnafu {
                    reason: "force may not be specified for non-apply patch"
                }
            );
        }

        Ok(())
    }
}

/// Options of a create request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Either empty or `["All"]`.
    pub dry_run: Vec<String>,
    pub field_manager: Option<String>,
}

impl CreateOptions {
    pub fn is_dry_run(&self) -> bool {
        !self.dry_run.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        validate_dry_run(&self.dry_run)?;
        match &self.field_manager {
            Some(field_manager) => validate_field_manager(field_manager),
            None => Ok(()),
        }
    }
}

fn validate_dry_run(dry_run: &[String]) -> Result<()> {
    for value in dry_run {
        ensure!(
            value == DRY_RUN_ALL,
            InvalidOptionsSnafu {
                reason: format!("dryRun: unsupported value {value:?}, supported values: {DRY_RUN_ALL:?}")
            }
        );
    }
    Ok(())
}

fn validate_field_manager(field_manager: &str) -> Result<()> {
    ensure!(
        field_manager.chars().count() <= MAX_FIELD_MANAGER_LENGTH,
        InvalidOptionsSnafu {
            reason: format!(
                "fieldManager: may not be longer than {MAX_FIELD_MANAGER_LENGTH} characters"
            )
        }
    );
    ensure!(
        field_manager.chars().all(is_printable),
        InvalidOptionsSnafu {
            reason: "fieldManager: may only contain printable characters"
        }
    );
    Ok(())
}

/// Whether `c` is a graphic character or the ASCII space. Control, format
/// and private use characters as well as every other kind of white space are
/// not printable.
fn is_printable(c: char) -> bool {
    if c == ' ' {
        return true;
    }

    let format_or_private = matches!(
        c,
        '\u{ad}'
            | '\u{600}'..='\u{605}'
            | '\u{61c}'
            | '\u{6dd}'
            | '\u{70f}'
            | '\u{180e}'
            | '\u{200b}'..='\u{200f}'
            | '\u{202a}'..='\u{202e}'
            | '\u{2060}'..='\u{206f}'
            | '\u{feff}'
            | '\u{fff9}'..='\u{fffb}'
            | '\u{e000}'..='\u{f8ff}'
    );
    !(c.is_control() || c.is_whitespace() || format_or_private)
}

/// Returns the field manager name derived from a `User-Agent` header: the
/// part in front of the first `/`, for example `kubectl` for
/// `kubectl/v1.30.0 (linux/amd64)`.
pub fn prefix_from_user_agent(user_agent: &str) -> &str {
    user_agent
        .split_once('/')
        .map_or(user_agent, |(prefix, _)| prefix)
}

/// Picks the field manager name: the explicitly requested one, or else the
/// prefix of the user agent.
pub(crate) fn field_manager_name(requested: Option<&str>, user_agent: Option<&str>) -> String {
    match requested {
        Some(manager) if !manager.is_empty() => manager.to_owned(),
        _ => {
            let prefix = prefix_from_user_agent(user_agent.unwrap_or_default());
            if prefix.chars().all(is_printable) {
                prefix.chars().take(MAX_FIELD_MANAGER_LENGTH).collect()
            } else {
                "unknown".to_owned()
            }
        }
    }
}

/// Parses the `timeout` request parameter, falling back to `default` if it
/// is empty or invalid.
pub fn parse_timeout(timeout: Option<&str>, default: Duration) -> Duration {
    match timeout.map(str::trim) {
        None | Some("") => default,
        Some(timeout) => humantime::parse_duration(timeout).unwrap_or_else(|error| {
            tracing::warn!(
                %error,
                timeout,
                default = %humantime::format_duration(default),
                "failed to parse request timeout, using default"
            );
            default
        }),
    }
}

/// Common inputs of every request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestContext {
    pub user: UserInfo,
    pub user_agent: Option<String>,

    /// The raw `timeout` query parameter.
    pub timeout: Option<String>,
}

/// A patch request against a single object.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchRequest {
    pub namespace: Option<String>,
    pub name: String,

    /// The value of the `Content-Type` header.
    pub content_type: String,
    pub body: Vec<u8>,
    pub options: PatchOptions,
    pub context: RequestContext,
}

impl PatchRequest {
    pub fn new(
        name: impl Into<String>,
        patch_type: PatchType,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            namespace: None,
            name: name.into(),
            content_type: patch_type.to_string(),
            body: body.into(),
            options: PatchOptions::default(),
            context: RequestContext::default(),
        }
    }

    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_options(mut self, options: PatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}

impl fmt::Display for PatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A request creating a new object.
#[derive(Clone, Debug, PartialEq)]
pub struct CreateRequest {
    pub namespace: Option<String>,

    /// The JSON encoded object.
    pub body: Vec<u8>,
    pub options: CreateOptions,
    pub context: RequestContext,
}

impl CreateRequest {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace: None,
            body: body.into(),
            options: CreateOptions::default(),
            context: RequestContext::default(),
        }
    }

    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_options(mut self, options: CreateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }
}
