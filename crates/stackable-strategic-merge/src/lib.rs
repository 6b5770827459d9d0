//! Schema-aware ("strategic") merging of Kubernetes objects.
//!
//! A strategic merge patch looks like a JSON merge patch, but lists are not
//! necessarily replaced as a whole. A [`SchemaReference`] declares, per field,
//! whether a list is merged by a merge key (for example containers by `name`),
//! merged as a set of primitives (for example finalizers) or replaced.
//!
//! Additionally the patch can carry directives:
//!
//! - `$patch: replace | delete | merge` on objects and list elements
//! - `$retainKeys: [...]` to drop every key of an object not listed
//! - `$deleteFromPrimitiveList/<field>: [...]` to remove values from a set
//! - `$setElementOrder/<field>: [...]` to define the order of a merged list
//!
//! ```
//! use serde_json::json;
//! use stackable_strategic_merge::{SchemaReference, strategic_merge_map_patch};
//!
//! let schema = SchemaReference::builder()
//!     .merge_list("spec.containers", "name")
//!     .build();
//!
//! let original = json!({"spec": {"containers": [
//!     {"name": "app", "image": "app:1"},
//!     {"name": "sidecar", "image": "sidecar:1"},
//! ]}});
//! let patch = json!({"spec": {"containers": [{"name": "app", "image": "app:2"}]}});
//!
//! let merged = strategic_merge_map_patch(
//!     original.as_object().unwrap(),
//!     patch.as_object().unwrap(),
//!     &schema,
//! )
//! .unwrap();
//!
//! assert_eq!(merged["spec"]["containers"][0]["image"], "app:2");
//! assert_eq!(merged["spec"]["containers"][1]["image"], "sidecar:1");
//! ```
use snafu::Snafu;

mod merge;
mod schema;

pub use merge::*;
pub use schema::*;

/// A JSON object, the unit strategic merges operate on.
pub type Map = serde_json::Map<String, serde_json::Value>;

/// Errors which can be encountered when merging a patch into an object.
///
/// The variants mirror the error set the Kubernetes API server distinguishes
/// when interpreting strategic merge patches. Use [`Error::is_unprocessable`]
/// to tell malformed patches apart from well-formed but inapplicable ones.
#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("invalid JSON document: {reason}"))]
    BadDoc { reason: String },

    #[snafu(display("invalid patch format of primitive list {field:?}"))]
    BadPrimitiveListFormat { field: String },

    #[snafu(display("invalid patch format of retainKeys"))]
    BadRetainKeysFormat,

    #[snafu(display("invalid patch format of setElementOrder list {field:?}"))]
    BadSetElementOrderFormat { field: String },

    #[snafu(display("strategic merge patch format {directive:?} is not supported"))]
    UnsupportedFormat { directive: String },

    #[snafu(display("lists of lists are not supported, found one at {field:?}"))]
    NoListOfLists { field: String },

    #[snafu(display("patch content doesn't match retainKeys list, {key:?} is not retained"))]
    RetainKeysMismatch { key: String },

    #[snafu(display("list element of {field:?} does not contain declared merge key {merge_key:?}"))]
    MissingMergeKey { field: String, merge_key: String },
}

impl Error {
    /// Returns `true` if the patch is syntactically valid, but cannot be
    /// applied to the object. All other errors indicate a malformed patch.
    pub fn is_unprocessable(&self) -> bool {
        matches!(
            self,
            Self::NoListOfLists { .. } | Self::RetainKeysMismatch { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
