use kube::core::DynamicObject;
use serde_json::Value;
use snafu::ResultExt;

use super::Target;
use crate::error::{
    ApplyJsonPatchSnafu, DecodePatchedObjectSnafu, EncodeObjectSnafu, ParseJsonPatchSnafu,
    ParseMergePatchSnafu, Result,
};

/// The operations of a JSON based patch.
#[derive(Clone, Debug, PartialEq)]
pub enum JsonPatchOperations {
    /// The parsed, ordered operations of a JSON patch.
    Ordered(json_patch::Patch),

    /// The raw bytes of a merge patch.
    Merge(Vec<u8>),
}

impl JsonPatchOperations {
    /// Parses the body of a JSON patch. Fails if it is not a list of valid
    /// operations.
    pub fn ordered(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map(Self::Ordered)
            .context(ParseJsonPatchSnafu)
    }

    pub fn merge(body: &[u8]) -> Self {
        Self::Merge(body.to_vec())
    }
}

/// Applies JSON patches (RFC 6902) and merge patches (RFC 7386) to the JSON
/// encoding of the current object.
#[derive(Debug)]
pub struct JsonPatcher {
    pub(super) operations: JsonPatchOperations,
    pub(super) target: Target,
}

impl JsonPatcher {
    pub fn new(operations: JsonPatchOperations, target: Target) -> Self {
        Self { operations, target }
    }

    pub(super) fn apply_to_current(&self, current: &DynamicObject) -> Result<DynamicObject> {
        let mut document = serde_json::to_value(current).context(EncodeObjectSnafu)?;

        match &self.operations {
            JsonPatchOperations::Ordered(patch) => {
                json_patch::patch(&mut document, &patch.0).context(ApplyJsonPatchSnafu)?;
            }
            JsonPatchOperations::Merge(body) => {
                let patch: Value = serde_json::from_slice(body).context(ParseMergePatchSnafu)?;
                json_patch::merge(&mut document, &patch);
            }
        }

        let patched = serde_json::from_value(document).context(DecodePatchedObjectSnafu)?;
        self.target.update_managed_fields(current, patched)
    }
}
