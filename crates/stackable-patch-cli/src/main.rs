//! Applies a patch to a Kubernetes object without an API server.
//!
//! The current object (if any) is loaded into an in-memory store, then the
//! patch is applied through the same code path the API server uses for
//! `PATCH` requests. The resulting object is printed as YAML.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, ValueEnum};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_patcher::{
    AlwaysAdmit, InMemoryStore, PatchOptions, PatchRequest, PatchType, PatcherOptions,
    RequestContext, ResourceHandler, ResourceScope,
};
use stackable_strategic_merge::SchemaReference;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

const LOG_ENV_VAR: &str = "PATCHER_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to read {path:?}"))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse current object from {path:?}"))]
    ParseObject {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("invalid merge key {value:?}, expected <path>=<key>"))]
    InvalidMergeKey { value: String },

    #[snafu(display("no object name given, either pass --name or a named current object"))]
    MissingName,

    #[snafu(display("failed to patch object"))]
    Patch { source: stackable_patcher::Error },

    #[snafu(display("failed to serialize object"))]
    SerializeObject { source: serde_yaml::Error },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PatchKind {
    Json,
    Merge,
    Strategic,
    Apply,
}

impl From<PatchKind> for PatchType {
    fn from(kind: PatchKind) -> Self {
        match kind {
            PatchKind::Json => Self::Json,
            PatchKind::Merge => Self::Merge,
            PatchKind::Strategic => Self::StrategicMerge,
            PatchKind::Apply => Self::Apply,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "stackable-patch", version, about)]
struct Cli {
    /// The patch to apply.
    patch: PathBuf,

    /// The object to patch. Omit it to patch an object which doesn't exist.
    #[arg(long)]
    current: Option<PathBuf>,

    /// How the patch is interpreted.
    #[arg(long = "type", value_enum, default_value_t = PatchKind::Strategic)]
    patch_type: PatchKind,

    /// Name of the object, defaults to the name of the current object.
    #[arg(long)]
    name: Option<String>,

    #[arg(long, default_value = "default")]
    namespace: String,

    /// The resource is not namespaced.
    #[arg(long)]
    cluster_scoped: bool,

    #[arg(long = "api-group", default_value = "")]
    group: String,

    #[arg(long = "api-version", default_value = "v1")]
    api_version: String,

    #[arg(long, default_value = "ConfigMap")]
    kind: String,

    /// Lists merged by key in strategic merge patches, as `<path>=<key>`,
    /// for example `spec.containers=name`.
    #[arg(long = "merge-key")]
    merge_keys: Vec<String>,

    /// Lists of primitives merged as sets in strategic merge patches.
    #[arg(long = "merge-set")]
    merge_sets: Vec<String>,

    #[arg(long)]
    field_manager: Option<String>,

    /// Take ownership of conflicting fields. Only valid for apply patches.
    #[arg(long)]
    force: bool,

    /// Print the result without keeping it.
    #[arg(long)]
    dry_run: bool,

    /// The request timeout, for example `5s`.
    #[arg(long)]
    timeout: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    #[command(flatten)]
    options: PatcherOptions,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

impl Cli {
    fn resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            &self.group,
            &self.api_version,
            &self.kind,
        ))
    }

    fn schema(&self) -> Result<SchemaReference, Error> {
        let mut builder = SchemaReference::builder().with_object_meta();
        for value in &self.merge_keys {
            let (path, key) = value
                .split_once('=')
                .context(InvalidMergeKeySnafu { value })?;
            builder = builder.merge_list(path, key);
        }
        for path in &self.merge_sets {
            builder = builder.merge_set(path);
        }
        Ok(builder.build())
    }

    fn namespace(&self) -> Option<String> {
        (!self.cluster_scoped).then(|| self.namespace.clone())
    }
}

fn initialize_logging(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Plain => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path).await.context(ReadFileSnafu { path })
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    initialize_logging(cli.log_format);

    let resource = cli.resource();
    let store = Arc::new(
        InMemoryStore::new(resource.clone()).with_retry_policy(cli.options.retry_policy()),
    );

    let mut name = cli.name.clone();
    if let Some(path) = &cli.current {
        let mut current: DynamicObject =
            serde_yaml::from_slice(&read(path).await?).context(ParseObjectSnafu { path })?;
        if current.metadata.namespace.is_none() {
            current.metadata.namespace = cli.namespace();
        }
        name = name.or_else(|| current.metadata.name.clone());

        let current = store.insert(current).await;
        tracing::info!(
            k8s.object.uid = ?current.metadata.uid,
            k8s.object.resource_version = ?current.metadata.resource_version,
            "loaded current object"
        );
    }
    let name = name.context(MissingNameSnafu)?;

    let scope = ResourceScope::builder(resource)
        .namespaced(!cli.cluster_scoped)
        .schema(cli.schema()?)
        .build();
    let handler = ResourceHandler::new(scope, store, Arc::new(AlwaysAdmit), cli.options.clone());

    let mut request = PatchRequest::new(name, cli.patch_type.into(), read(&cli.patch).await?)
        .with_options(PatchOptions {
            dry_run: if cli.dry_run {
                vec![stackable_patcher::DRY_RUN_ALL.to_owned()]
            } else {
                Vec::new()
            },
            force: cli.force.then_some(true),
            field_manager: cli.field_manager.clone(),
        })
        .with_context(RequestContext {
            user_agent: Some(format!("{}/{}", env!("CARGO_BIN_NAME"), env!("CARGO_PKG_VERSION"))),
            timeout: cli.timeout.clone(),
            ..Default::default()
        });
    request.namespace = cli.namespace();

    let outcome = match handler.patch_resource(request).await {
        Ok(outcome) => outcome,
        Err(error) => {
            // Mirror the API server, which answers with a Status object
            let status = serde_yaml::to_string(&error.to_status()).context(SerializeObjectSnafu)?;
            print!("{status}");
            return Err(error).context(PatchSnafu);
        }
    };

    tracing::info!(
        created = outcome.created,
        status = %outcome.status_code(),
        "patch applied"
    );
    let object = serde_yaml::to_string(&outcome.object).context(SerializeObjectSnafu)?;
    print!("{object}");

    Ok(())
}
