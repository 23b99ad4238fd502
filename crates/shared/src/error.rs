use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the control plane on non-success responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub detail: String,
}

impl ApiError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Control-plane rejection carried back to callers as a typed error.
#[derive(Debug, Error)]
#[error("{detail}")]
pub struct ApiRejection {
    pub detail: String,
}

impl ApiRejection {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl From<ApiError> for ApiRejection {
    fn from(value: ApiError) -> Self {
        Self {
            detail: value.detail,
        }
    }
}
