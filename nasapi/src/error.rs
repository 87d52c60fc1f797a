//! The typed failure surface of the appliance client. Appliance error
//! payloads carry an `errname` (errno name) and a human readable reason;
//! both are used to classify the error into one of a handful of categories
//! that the CSI engine maps onto gRPC codes.

use snafu::Snafu;
use tonic::Status;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    /// The websocket session is down or mid-reconnect. Idempotent callers
    /// may retry.
    #[snafu(display("appliance transport unavailable: {source}"))]
    Transport { source: jsonrpc::Error },
    #[snafu(display("not found: {detail}"))]
    NotFound { detail: String },
    #[snafu(display("already exists: {detail}"))]
    Conflict { detail: String },
    /// Replication or clone dependency in the way.
    #[snafu(display("resource busy: {detail}"))]
    Busy { detail: String },
    #[snafu(display("permission denied by appliance: {detail}"))]
    PermissionDenied { detail: String },
    #[snafu(display("malformed reply from {method}: {source}"))]
    InvalidReply {
        method: String,
        source: serde_json::Error,
    },
    #[snafu(display("{method} failed: {detail}"))]
    Unknown { method: String, detail: String },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport { .. })
    }
}

impl From<ApiError> for Status {
    fn from(error: ApiError) -> Status {
        let message = error.to_string();
        match error {
            ApiError::Transport { .. } => Status::unavailable(message),
            ApiError::NotFound { .. } => Status::not_found(message),
            ApiError::Conflict { .. } => Status::already_exists(message),
            ApiError::Busy { .. } => Status::failed_precondition(message),
            ApiError::PermissionDenied { .. } => Status::permission_denied(message),
            ApiError::InvalidReply { .. } | ApiError::Unknown { .. } => Status::internal(message),
        }
    }
}

/// Classify a raw json-rpc failure for `method`. Appliance errors carry
/// `data.errname` (ENOENT, EEXIST, ...) when the failure maps to an errno;
/// validation errors only have a reason string, hence the substring
/// fallback.
pub(crate) fn classify(method: &str, error: jsonrpc::Error) -> ApiError {
    if error.is_transport() {
        return ApiError::Transport { source: error };
    }

    let jsonrpc::Error::Rpc { message, data, .. } = &error else {
        return ApiError::Unknown {
            method: method.to_string(),
            detail: error.to_string(),
        };
    };

    let errname = data
        .as_ref()
        .and_then(|data| data.get("errname"))
        .and_then(|name| name.as_str())
        .unwrap_or("");
    let reason = data
        .as_ref()
        .and_then(|data| data.get("reason"))
        .and_then(|reason| reason.as_str())
        .unwrap_or(message)
        .trim()
        .to_string();

    match errname {
        "ENOENT" => return ApiError::NotFound { detail: reason },
        "EEXIST" => return ApiError::Conflict { detail: reason },
        "EBUSY" => return ApiError::Busy { detail: reason },
        "EPERM" | "EACCES" => return ApiError::PermissionDenied { detail: reason },
        _ => {}
    }

    let lowered = reason.to_lowercase();
    if lowered.contains("does not exist") || lowered.contains("not found") {
        ApiError::NotFound { detail: reason }
    } else if lowered.contains("already exists") {
        ApiError::Conflict { detail: reason }
    } else if lowered.contains("dependent clones")
        || lowered.contains("dataset is busy")
        || lowered.contains("currently in use")
    {
        ApiError::Busy { detail: reason }
    } else if lowered.contains("not authorized") || lowered.contains("permission denied") {
        ApiError::PermissionDenied { detail: reason }
    } else {
        ApiError::Unknown {
            method: method.to_string(),
            detail: reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rpc_error(message: &str, errname: Option<&str>) -> jsonrpc::Error {
        jsonrpc::Error::Rpc {
            code: -32001,
            message: message.to_string(),
            data: errname.map(|name| json!({ "errname": name, "reason": message })),
        }
    }

    #[test]
    fn errname_classification() {
        assert!(classify("pool.dataset.delete", rpc_error("gone", Some("ENOENT"))).is_not_found());
        assert!(classify("zfs.snapshot.create", rpc_error("dup", Some("EEXIST"))).is_conflict());
        assert!(matches!(
            classify("pool.dataset.delete", rpc_error("clones", Some("EBUSY"))),
            ApiError::Busy { .. }
        ));
        assert!(matches!(
            classify("pool.dataset.create", rpc_error("no", Some("EPERM"))),
            ApiError::PermissionDenied { .. }
        ));
    }

    #[test]
    fn message_fallback_classification() {
        assert!(classify(
            "zfs.snapshot.delete",
            rpc_error("snapshot does not exist", None)
        )
        .is_not_found());
        assert!(matches!(
            classify(
                "pool.dataset.delete",
                rpc_error("filesystem has dependent clones", None)
            ),
            ApiError::Busy { .. }
        ));
        assert!(matches!(
            classify("pool.dataset.create", rpc_error("I have no idea", None)),
            ApiError::Unknown { .. }
        ));
    }

    #[test]
    fn transport_errors_stay_retryable() {
        let error = jsonrpc::Error::ConnectionLost {
            endpoint: "wss://nas/websocket".into(),
        };
        let classified = classify("pool.dataset.query", error);
        assert!(classified.is_transport());
        let status: Status = classified.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[test]
    fn grpc_code_mapping() {
        let status: Status = ApiError::NotFound {
            detail: "x".into(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::NotFound);
        let status: Status = ApiError::Conflict {
            detail: "x".into(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::AlreadyExists);
        let status: Status = ApiError::Busy {
            detail: "x".into(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }
}
