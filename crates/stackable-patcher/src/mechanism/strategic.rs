use std::sync::Arc;

use kube::core::DynamicObject;
use serde_json::Value;
use snafu::ResultExt;
use stackable_strategic_merge::{Map, SchemaReference, parse_patch, strategic_merge_map_patch};

use super::Target;
use crate::{
    error::{DecodePatchedObjectSnafu, EncodeObjectSnafu, Result, StrategicMergeSnafu},
    request::Defaulter,
};

/// Applies strategic merge patches, merging lists according to the merge
/// strategies of the resource's schema.
#[derive(educe::Educe)]
#[educe(Debug)]
pub struct StrategicPatcher {
    patch: Vec<u8>,
    schema: SchemaReference,
    #[educe(Debug(ignore))]
    defaulter: Option<Arc<dyn Defaulter>>,
    pub(super) target: Target,
}

impl StrategicPatcher {
    pub fn new(
        patch: &[u8],
        schema: SchemaReference,
        defaulter: Option<Arc<dyn Defaulter>>,
        target: Target,
    ) -> Self {
        Self {
            patch: patch.to_vec(),
            schema,
            defaulter,
            target,
        }
    }

    pub(super) fn apply_to_current(&self, current: &DynamicObject) -> Result<DynamicObject> {
        let original: Map = serde_json::to_value(current)
            .and_then(serde_json::from_value)
            .context(EncodeObjectSnafu)?;
        let patch = parse_patch(&self.patch).context(StrategicMergeSnafu)?;

        let merged = strategic_merge_map_patch(&original, &patch, &self.schema)
            .context(StrategicMergeSnafu)?;
        let mut patched: DynamicObject =
            serde_json::from_value(Value::Object(merged)).context(DecodePatchedObjectSnafu)?;

        // Decoding a versioned object applies defaults, so do the same here
        if let Some(defaulter) = &self.defaulter {
            defaulter.apply_defaults(&mut patched);
        }

        self.target.update_managed_fields(current, patched)
    }
}
