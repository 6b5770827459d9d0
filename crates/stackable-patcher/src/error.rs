use std::error::Error as _;

use http::StatusCode;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use snafu::Snafu;

use crate::{admission::AdmissionError, patch_type::PatchType};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The machine-readable class of an [`Error`].
///
/// The [`Display`](std::fmt::Display) implementation returns the reason used
/// in [`Status`] objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    BadRequest,
    UnsupportedMediaType,
    #[strum(serialize = "Invalid")]
    Unprocessable,
    Conflict,
    NotFound,
    Forbidden,
    #[strum(serialize = "InternalError")]
    Internal,
    Timeout,
}

impl ErrorKind {
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Unprocessable => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict => StatusCode::CONFLICT,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("the dryRun feature is disabled"))]
    DryRunDisabled,

    #[snafu(display(
        "the body of the request was in an unknown format {content_type:?} - accepted media types include: {}",
        supported.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    ))]
    UnsupportedMediaType {
        content_type: String,
        supported: Vec<PatchType>,
    },

    #[snafu(display("invalid request options: {reason}"))]
    InvalidOptions { reason: String },

    #[snafu(display("namespace is required for namespaced resource {resource:?}"))]
    MissingNamespace { resource: String },

    #[snafu(display("name is required to create an object"))]
    MissingName,

    #[snafu(display("failed to decode JSON patch"))]
    ParseJsonPatch { source: serde_json::Error },

    #[snafu(display("failed to apply JSON patch"))]
    ApplyJsonPatch { source: json_patch::PatchError },

    #[snafu(display("failed to decode merge patch"))]
    ParseMergePatch { source: serde_json::Error },

    #[snafu(display("failed to apply strategic merge patch"))]
    StrategicMerge {
        source: stackable_strategic_merge::Error,
    },

    #[snafu(display("failed to apply configuration"))]
    Apply {
        source: stackable_field_manager::Error,
    },

    #[snafu(display("failed to update object managed fields"))]
    UpdateManagedFields {
        source: stackable_field_manager::Error,
    },

    #[snafu(display("field management must be enabled to apply {resource:?}"))]
    FieldManagementDisabled { resource: String },

    #[snafu(display("failed to encode object"))]
    EncodeObject { source: serde_json::Error },

    #[snafu(display("failed to decode patched object"))]
    DecodePatchedObject { source: serde_json::Error },

    #[snafu(display("failed to decode object"))]
    DecodeObject { source: serde_json::Error },

    #[snafu(display(
        "the API version in the data ({found}) does not match the expected API version ({expected})"
    ))]
    ApiVersionMismatch { expected: String, found: String },

    #[snafu(display("{resource} {name:?} not found"))]
    NotFound { resource: String, name: String },

    #[snafu(display("{resource} {name:?} already exists"))]
    AlreadyExists { resource: String, name: String },

    #[snafu(display(
        "the name of the object ({found}) does not match the name on the URL ({expected})"
    ))]
    NameMismatch { expected: String, found: String },

    #[snafu(display(
        "the namespace of the object ({found}) does not match the namespace on the request ({expected})"
    ))]
    NamespaceMismatch { expected: String, found: String },

    #[snafu(display(
        "Operation cannot be fulfilled on {resource} {name:?}: uid mismatch: the provided object specified uid {uid}, and no existing object was found"
    ))]
    UidMismatchOnCreate {
        resource: String,
        name: String,
        uid: String,
    },

    #[snafu(display(
        "Operation cannot be fulfilled on {resource} {name:?}: Precondition failed: UID in precondition: {expected}, UID in object meta: {found}"
    ))]
    UidMismatch {
        resource: String,
        name: String,
        expected: String,
        found: String,
    },

    #[snafu(display("resourceVersion should not be set on objects to be created"))]
    ResourceVersionOnCreate,

    #[snafu(display(
        "Operation cannot be fulfilled on {resource} {name:?}: the provided resourceVersion {found} does not match the current resourceVersion {expected}"
    ))]
    ResourceVersionMismatch {
        resource: String,
        name: String,
        expected: String,
        found: String,
    },

    #[snafu(display(
        "Operation cannot be fulfilled on {resource} {name:?}: the object has been modified; please apply your changes to the latest version and try again"
    ))]
    RetriesExhausted {
        resource: String,
        name: String,
        attempts: u32,
    },

    #[snafu(display("admission webhook rejected the {operation:?} request"))]
    Admission {
        source: AdmissionError,
        operation: kube::core::admission::Operation,
    },

    #[snafu(display("request did not complete within {timeout}"))]
    Timeout { timeout: humantime::Duration },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DryRunDisabled
            | Self::InvalidOptions { .. }
            | Self::MissingNamespace { .. }
            | Self::MissingName
            | Self::ParseJsonPatch { .. }
            | Self::ParseMergePatch { .. }
            | Self::DecodeObject { .. }
            | Self::ApiVersionMismatch { .. }
            | Self::NameMismatch { .. }
            | Self::NamespaceMismatch { .. }
            | Self::ResourceVersionOnCreate => ErrorKind::BadRequest,

            Self::UnsupportedMediaType { .. } => ErrorKind::UnsupportedMediaType,

            Self::ApplyJsonPatch { .. } | Self::DecodePatchedObject { .. } => {
                ErrorKind::Unprocessable
            }

            Self::StrategicMerge { source } if source.is_unprocessable() => {
                ErrorKind::Unprocessable
            }
            Self::StrategicMerge { .. } => ErrorKind::BadRequest,

            Self::Apply { source } => match source {
                stackable_field_manager::Error::Conflicts { .. } => ErrorKind::Conflict,
                source if source.is_invalid_input() => ErrorKind::BadRequest,
                _ => ErrorKind::Internal,
            },

            Self::AlreadyExists { .. }
            | Self::UidMismatchOnCreate { .. }
            | Self::UidMismatch { .. }
            | Self::ResourceVersionMismatch { .. }
            | Self::RetriesExhausted { .. } => ErrorKind::Conflict,

            Self::NotFound { .. } => ErrorKind::NotFound,

            Self::Admission { source, .. } => match source {
                AdmissionError::Denied { .. } => ErrorKind::Forbidden,
                AdmissionError::Failed { .. } => ErrorKind::Internal,
            },

            Self::UpdateManagedFields { .. }
            | Self::FieldManagementDisabled { .. }
            | Self::EncodeObject { .. } => ErrorKind::Internal,

            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }

    /// Returns the full message, including every error in the source chain.
    pub fn message(&self) -> String {
        let mut message = self.to_string();
        let mut source = self.source();
        while let Some(error) = source {
            message.push_str(": ");
            message.push_str(&error.to_string());
            source = error.source();
        }
        message
    }

    /// Converts the error into a failed [`Status`] as returned by the
    /// Kubernetes API.
    pub fn to_status(&self) -> Status {
        let kind = self.kind();
        Status {
            code: Some(i32::from(kind.status_code().as_u16())),
            message: Some(self.message()),
            reason: Some(kind.to_string()),
            status: Some("Failure".to_owned()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(ErrorKind::BadRequest, 400, "BadRequest")]
    #[case(ErrorKind::UnsupportedMediaType, 415, "UnsupportedMediaType")]
    #[case(ErrorKind::Unprocessable, 422, "Invalid")]
    #[case(ErrorKind::Conflict, 409, "Conflict")]
    #[case(ErrorKind::NotFound, 404, "NotFound")]
    #[case(ErrorKind::Forbidden, 403, "Forbidden")]
    #[case(ErrorKind::Internal, 500, "InternalError")]
    #[case(ErrorKind::Timeout, 504, "Timeout")]
    fn kind_status(#[case] kind: ErrorKind, #[case] code: u16, #[case] reason: &str) {
        assert_eq!(kind.status_code().as_u16(), code);
        assert_eq!(kind.to_string(), reason);
    }

    #[test]
    fn strategic_merge_errors() {
        let bad_request = Error::StrategicMerge {
            source: stackable_strategic_merge::Error::BadRetainKeysFormat,
        };
        assert_eq!(bad_request.kind(), ErrorKind::BadRequest);

        let unprocessable = Error::StrategicMerge {
            source: stackable_strategic_merge::Error::NoListOfLists {
                field: "spec.matrix".to_owned(),
            },
        };
        assert_eq!(unprocessable.kind(), ErrorKind::Unprocessable);
    }

    #[test]
    fn status_contains_source_chain() {
        let error = Error::Admission {
            source: AdmissionError::Denied {
                reason: "replicas must not exceed 10".to_owned(),
            },
            operation: kube::core::admission::Operation::Update,
        };

        let status = error.to_status();
        assert_eq!(status.code, Some(403));
        assert_eq!(status.reason.as_deref(), Some("Forbidden"));
        assert_eq!(
            status.message.as_deref(),
            Some(
                "admission webhook rejected the Update request: request denied: replicas must not exceed 10"
            )
        );
    }
}
