//! Tracks which manager owns which field of a Kubernetes object.
//!
//! Ownership is recorded in `metadata.managedFields` using the FieldsV1
//! format. The [`FieldManager`] offers two operations:
//!
//! - [`FieldManager::update`] records the fields changed by an imperative
//!   update (for example a JSON patch) as owned by the updating manager.
//! - [`FieldManager::apply`] merges a declarative apply configuration into
//!   the live object and detects conflicts with fields owned by other
//!   managers (server-side apply).
use std::fmt;

use kube::core::DynamicObject;
use serde_json::Value;
use snafu::{ResultExt, Snafu, ensure};

mod field_set;
mod managed_fields;

pub use field_set::{FieldPath, FieldSet, decode_fields_v1, encode_fields_v1};
pub use managed_fields::{ManagedEntry, ManagedFields, Operation};

use crate::field_set::{leaves, remove_at, value_at};

/// Fields which are maintained by the API server and never owned by a manager.
const IGNORED_FIELDS: &[&str] = &[
    "apiVersion",
    "kind",
    "metadata.name",
    "metadata.namespace",
    "metadata.uid",
    "metadata.resourceVersion",
    "metadata.generation",
    "metadata.creationTimestamp",
    "metadata.managedFields",
    "metadata.selfLink",
    "status",
];

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to encode object"))]
    EncodeObject { source: serde_json::Error },

    #[snafu(display("failed to decode merged object"))]
    DecodeObject { source: serde_json::Error },

    #[snafu(display("failed to parse apply configuration"))]
    ParseApplyConfiguration { source: serde_yaml::Error },

    #[snafu(display("invalid apply configuration: {reason}"))]
    InvalidApplyConfiguration { reason: String },

    #[snafu(display(
        "apply configuration is for {found:?}, but the object is of type {expected:?}"
    ))]
    TypeMismatch { expected: String, found: String },

    #[snafu(display("invalid managed fields of manager {manager:?}: {reason}"))]
    DecodeManagedFields { manager: String, reason: String },

    #[snafu(display(
        "Apply failed with {} conflict(s): {}",
        conflicts.len(),
        conflicts.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    ))]
    Conflicts { conflicts: Vec<Conflict> },
}

impl Error {
    /// Returns `true` if the error was caused by the input of the caller
    /// rather than the stored object.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::DecodeObject { .. }
                | Self::ParseApplyConfiguration { .. }
                | Self::InvalidApplyConfiguration { .. }
                | Self::TypeMismatch { .. }
        )
    }
}

/// A field set by an apply configuration which is owned by another manager
/// with a different value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub manager: String,
    pub field: FieldPath,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conflict with {:?}: {}", self.manager, self.field)
    }
}

/// Computes and records field ownership.
///
/// The field manager itself is stateless, all ownership information lives in
/// the objects passed to it.
#[derive(Clone, Debug)]
pub struct FieldManager {
    ignored_fields: Vec<FieldPath>,
}

impl Default for FieldManager {
    fn default() -> Self {
        Self {
            ignored_fields: IGNORED_FIELDS
                .iter()
                .copied()
                .map(FieldPath::parse)
                .collect(),
        }
    }
}

impl FieldManager {
    /// Excludes the field at the dotted `path` (and everything below it) from
    /// ownership tracking.
    pub fn ignore_field(mut self, path: &str) -> Self {
        self.ignored_fields.push(FieldPath::parse(path));
        self
    }

    /// Records the fields `proposed` adds or changes compared to `live` as
    /// owned by `manager`.
    ///
    /// Changed fields are taken away from every other manager. Fields removed
    /// by `proposed` are no longer owned by anyone.
    #[tracing::instrument(skip_all, fields(field_manager = manager))]
    pub fn update(
        &self,
        live: &DynamicObject,
        mut proposed: DynamicObject,
        manager: &str,
    ) -> Result<DynamicObject> {
        let live_value = serde_json::to_value(live).context(EncodeObjectSnafu)?;
        let proposed_value = serde_json::to_value(&proposed).context(EncodeObjectSnafu)?;

        let live_leaves = leaves(&live_value, &self.ignored_fields);
        let proposed_leaves = leaves(&proposed_value, &self.ignored_fields);

        let changed: FieldSet = proposed_leaves
            .iter()
            .filter(|(path, value)| live_leaves.get(*path) != Some(*value))
            .map(|(path, _)| path.clone())
            .collect();
        let removed: FieldSet = live_leaves
            .keys()
            .filter(|path| !proposed_leaves.contains_key(*path))
            .cloned()
            .collect();

        let mut managed = ManagedFields::decode(
            proposed
                .metadata
                .managed_fields
                .as_deref()
                .or(live.metadata.managed_fields.as_deref()),
        )?;

        managed.release(&removed);
        managed.release(&changed);
        if !changed.is_empty() {
            tracing::debug!(fields = changed.len(), "recording updated fields");
            let api_version = proposed.types.as_ref().map(|t| t.api_version.as_str());
            managed
                .entry_mut(manager, Operation::Update, api_version)
                .fields
                .extend(changed);
        }

        proposed.metadata.managed_fields = managed.encode();
        Ok(proposed)
    }

    /// Merges the apply configuration `config` (YAML or JSON) into `live` on
    /// behalf of `manager`.
    ///
    /// Fails with [`Error::Conflicts`] if the configuration changes fields
    /// owned by other managers, unless `force` is set. In that case the
    /// ownership of those fields is transferred to `manager`.
    #[tracing::instrument(skip_all, fields(field_manager = manager, force = force))]
    pub fn apply(
        &self,
        live: &DynamicObject,
        config: &[u8],
        manager: &str,
        force: bool,
    ) -> Result<DynamicObject> {
        let config: Value = serde_yaml::from_slice(config).context(ParseApplyConfigurationSnafu)?;
        ensure!(config.is_object(), InvalidApplyConfigurationSnafu {
            reason: "apply configuration must be an object"
        });
        Self::check_type(live, &config)?;

        let live_value = serde_json::to_value(live).context(EncodeObjectSnafu)?;
        let config_leaves = leaves(&config, &self.ignored_fields);
        let mut managed = ManagedFields::decode(live.metadata.managed_fields.as_deref())?;

        let conflicts: Vec<Conflict> = managed
            .entries()
            .iter()
            .filter(|entry| entry.manager != manager)
            .flat_map(|entry| {
                entry
                    .fields
                    .iter()
                    .filter(|field| {
                        config_leaves
                            .get(*field)
                            .is_some_and(|value| value_at(&live_value, field) != Some(value))
                    })
                    .map(|field| Conflict {
                        manager: entry.manager.clone(),
                        field: field.clone(),
                    })
            })
            .collect();

        if !conflicts.is_empty() {
            ensure!(force, ConflictsSnafu { conflicts });
            tracing::info!(
                conflicts = conflicts.len(),
                "forcing ownership of conflicting fields"
            );
            for conflict in &conflicts {
                for entry in managed.entries_mut() {
                    if entry.manager == conflict.manager {
                        entry.fields.remove(&conflict.field);
                    }
                }
            }
        }

        let config_fields: FieldSet = config_leaves.keys().cloned().collect();
        let mut merged = live_value;

        // Fields this manager applied before but no longer specifies are
        // removed, unless somebody else still cares about them.
        if let Some(previous) = managed.get(manager, Operation::Apply) {
            for field in previous.fields.difference(&config_fields) {
                if !managed.owned_by_others(field, manager) {
                    tracing::debug!(%field, "removing field no longer applied");
                    remove_at(&mut merged, field);
                }
            }
        }

        merge_config(&mut merged, config);

        let api_version = merged
            .get("apiVersion")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        managed
            .entry_mut(manager, Operation::Apply, api_version.as_deref())
            .fields = config_fields;

        let mut merged: DynamicObject = serde_json::from_value(merged).context(DecodeObjectSnafu)?;
        merged.metadata.managed_fields = managed.encode();
        Ok(merged)
    }

    fn check_type(live: &DynamicObject, config: &Value) -> Result<()> {
        let config_type = |key: &str| config.get(key).and_then(Value::as_str).unwrap_or_default();
        let (api_version, kind) = (config_type("apiVersion"), config_type("kind"));

        ensure!(
            !api_version.is_empty() && !kind.is_empty(),
            InvalidApplyConfigurationSnafu {
                reason: "apiVersion and kind must be set"
            }
        );

        if let Some(types) = &live.types {
            ensure!(
                types.api_version == api_version && types.kind == kind,
                TypeMismatchSnafu {
                    expected: format!("{}/{}", types.api_version, types.kind),
                    found: format!("{api_version}/{kind}"),
                }
            );
        }

        Ok(())
    }
}

/// Recursively merges `config` into `target`. Objects are merged, everything
/// else is replaced. A `null` removes the field.
fn merge_config(target: &mut Value, config: Value) {
    match (target, config) {
        (Value::Object(target), Value::Object(config)) => {
            for (key, value) in config {
                if value.is_null() {
                    target.remove(&key);
                } else if let Some(existing) = target.get_mut(&key) {
                    merge_config(existing, value);
                } else {
                    target.insert(key, value);
                }
            }
        }
        (target, config) => *target = config,
    }
}
