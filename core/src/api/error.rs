// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! API error handling.
//!
//! Client errors answer `{error, field?}`, license violations answer 402
//! `{reason}`, repository unavailability is an opaque 5xx. Probe-layer
//! errors never reach this module.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::license::LicenseError;
use crate::repository::RepositoryError;
use crate::scan::ScanError;

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    /// Bad request (400), optionally naming the offending field
    BadRequest {
        error: String,
        field: Option<String>,
    },
    /// License limit (402)
    PaymentRequired { reason: String },
    /// Not found (404)
    NotFound(String),
    /// Conflict (409)
    Conflict(String),
    /// Internal server error (500)
    Internal(String),
}

impl ApiError {
    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::BadRequest {
            error: error.into(),
            field: None,
        }
    }

    pub fn bad_field(error: impl Into<String>, field: impl Into<String>) -> Self {
        Self::BadRequest {
            error: error.into(),
            field: Some(field.into()),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::PaymentRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { error, field } => match field {
                Some(field) => write!(f, "{error} (field {field})"),
                None => write!(f, "{error}"),
            },
            Self::PaymentRequired { reason } => write!(f, "{reason}"),
            Self::NotFound(msg) | Self::Conflict(msg) | Self::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            Self::BadRequest { error, field } => match field {
                Some(field) => json!({ "error": error, "field": field }),
                None => json!({ "error": error }),
            },
            Self::PaymentRequired { reason } => json!({ "reason": reason }),
            Self::NotFound(msg) | Self::Conflict(msg) => json!({ "error": msg }),
            // Repository detail stays out of responses.
            Self::Internal(_) => json!({ "error": "internal error" }),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(msg) => Self::NotFound(msg),
            RepositoryError::DuplicateKey(msg) => Self::Conflict(msg),
            RepositoryError::InvalidInput(msg) | RepositoryError::ConstraintViolation(msg) => {
                Self::bad_request(msg)
            }
            RepositoryError::Unavailable(msg) => Self::Internal(format!("repository: {msg}")),
            RepositoryError::Serialization(e) => Self::Internal(format!("repository: {e}")),
        }
    }
}

impl From<LicenseError> for ApiError {
    fn from(err: LicenseError) -> Self {
        match err {
            LicenseError::LimitExceeded { reason } => Self::PaymentRequired { reason },
            LicenseError::Invalid(msg) => Self::bad_request(msg),
            LicenseError::Io(e) => Self::Internal(format!("license file: {e}")),
        }
    }
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::InvalidRange(msg) => Self::bad_field(msg, "ipRange"),
            ScanError::TooLarge { .. } => Self::bad_field(err.to_string(), "ipRange"),
            ScanError::Repository(e) => e.into(),
        }
    }
}
