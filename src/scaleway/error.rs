//! Conversions from Scaleway failures into provider errors.

use reqwest::StatusCode;
use scaleway_rs::{ScalewayApiError, ScalewayError};

use crate::config::ConfigError;
use crate::provider::ProviderError;

impl From<ScalewayError> for ProviderError {
    fn from(value: ScalewayError) -> Self {
        match value {
            ScalewayError::Api(api_err) => api_failure(StatusCode::BAD_REQUEST, &api_err),
            other => Self::Api {
                message: other.to_string(),
            },
        }
    }
}

impl From<ConfigError> for ProviderError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

pub(crate) fn transport(err: &reqwest::Error) -> ProviderError {
    ProviderError::Api {
        message: err.to_string(),
    }
}

pub(crate) fn decode(err: &serde_json::Error) -> ProviderError {
    ProviderError::Decode {
        message: err.to_string(),
    }
}

/// Interprets a non-success response body.
pub(crate) fn response_failure(status: StatusCode, body: &[u8]) -> ProviderError {
    serde_json::from_slice::<ScalewayApiError>(body).map_or_else(
        |_| {
            if status == StatusCode::NOT_FOUND {
                ProviderError::not_found("resource", String::from_utf8_lossy(body))
            } else {
                ProviderError::Api {
                    message: format!("{status}: {}", String::from_utf8_lossy(body).trim()),
                }
            }
        },
        |api_err| api_failure(status, &api_err),
    )
}

fn api_failure(status: StatusCode, api_err: &ScalewayApiError) -> ProviderError {
    if status == StatusCode::NOT_FOUND || api_err.etype == "not_found" {
        return ProviderError::not_found(
            api_err.resource.as_deref().unwrap_or("resource"),
            api_err
                .resource_id
                .clone()
                .unwrap_or_else(|| api_err.message.clone()),
        );
    }
    ProviderError::Api {
        message: format!("{} ({})", api_err.message, api_err.etype),
    }
}
