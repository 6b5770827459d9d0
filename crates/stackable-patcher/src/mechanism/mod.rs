//! The patch mechanisms, one per [`PatchType`](crate::PatchType) family.
//!
//! Every mechanism computes a candidate object either from the currently
//! stored object ([`Mechanism::apply_to_current`]) or from scratch if nothing
//! is stored yet ([`Mechanism::create_new`]). Mechanisms are immutable and
//! don't have side effects, so they can be called any number of times.
use kube::core::{ApiResource, DynamicObject};
use snafu::ResultExt;
use stackable_field_manager::FieldManager;

use crate::error::{NotFoundSnafu, Result, UpdateManagedFieldsSnafu};

pub use self::{
    apply::ApplyPatcher,
    json::{JsonPatchOperations, JsonPatcher},
    strategic::StrategicPatcher,
};

mod apply;
mod json;
mod strategic;

#[derive(Debug)]
pub enum Mechanism {
    Json(JsonPatcher),
    StrategicMerge(StrategicPatcher),
    Apply(ApplyPatcher),
}

impl Mechanism {
    pub fn apply_to_current(&self, current: &DynamicObject) -> Result<DynamicObject> {
        match self {
            Self::Json(patcher) => patcher.apply_to_current(current),
            Self::StrategicMerge(patcher) => patcher.apply_to_current(current),
            Self::Apply(patcher) => patcher.apply_to_current(current),
        }
    }

    pub fn create_new(&self) -> Result<DynamicObject> {
        match self {
            Self::Json(patcher) => patcher.target.not_found(),
            Self::StrategicMerge(patcher) => patcher.target.not_found(),
            Self::Apply(patcher) => patcher.create_new(),
        }
    }
}

/// The object a mechanism patches, and who patches it.
#[derive(Clone, Debug)]
pub struct Target {
    pub resource: ApiResource,
    pub name: String,

    /// The name field ownership is recorded for.
    pub manager: String,

    /// Field ownership tracking, disabled if [`None`].
    pub field_manager: Option<FieldManager>,
}

impl Target {
    fn not_found<T>(&self) -> Result<T> {
        NotFoundSnafu {
            resource: &self.resource.plural,
            name: &self.name,
        }
        .fail()
    }

    /// Records the fields changed from `current` to `patched` as owned by the
    /// manager, if field ownership is tracked.
    fn update_managed_fields(
        &self,
        current: &DynamicObject,
        patched: DynamicObject,
    ) -> Result<DynamicObject> {
        match &self.field_manager {
            Some(field_manager) => field_manager
                .update(current, patched, &self.manager)
                .context(UpdateManagedFieldsSnafu),
            None => Ok(patched),
        }
    }
}
