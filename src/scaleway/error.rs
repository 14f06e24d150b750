//! Maps Scaleway HTTP and SDK failures onto [`ProviderError`].

use reqwest::StatusCode;
use serde::Deserialize;

use crate::provider::ProviderError;

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: String,
}

/// Classifies a non-success response.
///
/// Rate limiting and server-side errors are transient; authentication
/// failures are configuration errors.
pub(super) fn from_status(
    status: StatusCode,
    body: &[u8],
    operation: &str,
    target: &str,
) -> ProviderError {
    let message = serde_json::from_slice::<ApiErrorBody>(body).map_or_else(
        |_| String::from_utf8_lossy(body).trim().to_owned(),
        |parsed| format!("{}: {}", parsed.kind, parsed.message),
    );
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound {
            kind: resource_kind(operation).to_owned(),
            id: target.to_owned(),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Config(format!("scaleway rejected credentials: {message}"))
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::Transient {
            operation: operation.to_owned(),
            message,
        },
        other if other.is_server_error() => ProviderError::Transient {
            operation: operation.to_owned(),
            message: format!("{other}: {message}"),
        },
        other => ProviderError::Api {
            message: format!("{operation} returned {other}: {message}"),
        },
    }
}

/// Connection failures and client timeouts are worth retrying.
pub(super) fn from_transport(err: &reqwest::Error, operation: &str) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        return ProviderError::Transient {
            operation: operation.to_owned(),
            message: err.to_string(),
        };
    }
    ProviderError::Api {
        message: format!("{operation}: {err}"),
    }
}

pub(super) fn from_sdk(err: &scaleway_rs::ScalewayError) -> ProviderError {
    ProviderError::Api {
        message: err.to_string(),
    }
}

fn resource_kind(operation: &str) -> &'static str {
    if operation.contains("image") {
        "image"
    } else if operation.contains("ip") {
        "floating IP"
    } else if operation.contains("snapshot") {
        "snapshot"
    } else {
        "server"
    }
}
