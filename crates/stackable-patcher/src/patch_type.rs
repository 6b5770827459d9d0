use std::str::FromStr;

/// The supported patch formats, identified by their content type.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
pub enum PatchType {
    /// An ordered list of operations (RFC 6902).
    #[strum(serialize = "application/json-patch+json")]
    Json,

    /// A recursive merge patch (RFC 7386).
    #[strum(serialize = "application/merge-patch+json")]
    Merge,

    /// A merge patch which merges lists according to the schema of the resource.
    #[strum(serialize = "application/strategic-merge-patch+json")]
    StrategicMerge,

    /// A server-side apply configuration.
    #[strum(serialize = "application/apply-patch+yaml")]
    Apply,
}

impl PatchType {
    /// Parses the value of a `Content-Type` header. Parameters like
    /// `; charset=utf-8` are ignored.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let media_type = content_type
            .split_once(';')
            .map_or(content_type, |(media_type, _)| media_type);

        Self::from_str(media_type.trim()).ok()
    }

    /// Returns `true` if this patch type can create objects which don't exist
    /// yet.
    pub fn can_create(self) -> bool {
        self == Self::Apply
    }
}
