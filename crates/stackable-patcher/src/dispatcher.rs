use snafu::OptionExt;

use crate::{
    error::{Result, UnsupportedMediaTypeSnafu},
    mechanism::{ApplyPatcher, JsonPatchOperations, JsonPatcher, Mechanism, StrategicPatcher, Target},
    patch_type::PatchType,
    request::ResourceScope,
};

/// Determines the patch type of a request from its `Content-Type` header.
///
/// Fails with an unsupported media type error if the content type is unknown
/// or not supported by the resource.
pub fn negotiate_patch_type(content_type: &str, scope: &ResourceScope) -> Result<PatchType> {
    PatchType::from_content_type(content_type)
        .filter(|patch_type| scope.supports(*patch_type))
        .with_context(|| UnsupportedMediaTypeSnafu {
            content_type,
            supported: scope
                .supported_patch_types
                .iter()
                .copied()
                .filter(|patch_type| scope.supports(*patch_type))
                .collect::<Vec<_>>(),
        })
}

/// Selects and configures the mechanism for `patch_type`.
///
/// Only JSON patches are parsed upfront. All other patch bodies are
/// interpreted when they are applied.
pub fn build_mechanism(
    patch_type: PatchType,
    body: &[u8],
    force: bool,
    scope: &ResourceScope,
    target: Target,
) -> Result<Mechanism> {
    let mechanism = match patch_type {
        PatchType::Json => {
            Mechanism::Json(JsonPatcher::new(JsonPatchOperations::ordered(body)?, target))
        }
        PatchType::Merge => Mechanism::Json(JsonPatcher::new(JsonPatchOperations::merge(body), target)),
        PatchType::StrategicMerge => Mechanism::StrategicMerge(StrategicPatcher::new(
            body,
            scope.schema.clone(),
            scope.defaulter.clone(),
            target,
        )),
        PatchType::Apply => Mechanism::Apply(ApplyPatcher::new(body, force, target)),
    };

    Ok(mechanism)
}
