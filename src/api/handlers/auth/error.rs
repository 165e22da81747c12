//! Error taxonomy for session verification and magic links.
//!
//! Every variant maps to a status and a machine-readable code; no internal error
//! text reaches the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::token::TokenError;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("credentials missing")]
    CredentialsMissing,
    #[error("session invalid")]
    SessionInvalid,
    #[error("session expired")]
    SessionExpired,
    #[error("session revoked")]
    SessionRevoked,
    #[error("malformed tenant id")]
    MalformedTenantId,
    #[error("magic link invalid")]
    LinkInvalid,
    #[error("magic link expired")]
    LinkExpired,
    #[error("magic link already used")]
    LinkAlreadyUsed,
    #[error("permission denied")]
    PermissionDenied,
    #[error("identity store unavailable")]
    StoreUnavailable,
}

impl AuthError {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::CredentialsMissing => "credentials_missing",
            Self::SessionInvalid => "session_invalid",
            Self::SessionExpired => "session_expired",
            Self::SessionRevoked => "session_revoked",
            Self::MalformedTenantId => "malformed_tenant_id",
            Self::LinkInvalid => "link_invalid",
            Self::LinkExpired => "link_expired",
            Self::LinkAlreadyUsed => "link_already_used",
            Self::PermissionDenied => "permission_denied",
            Self::StoreUnavailable => "store_unavailable",
        }
    }

    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::CredentialsMissing
            | Self::SessionInvalid
            | Self::SessionExpired
            | Self::SessionRevoked
            | Self::LinkInvalid
            | Self::LinkExpired
            | Self::LinkAlreadyUsed => StatusCode::UNAUTHORIZED,
            Self::MalformedTenantId | Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Value of the `reason` query parameter used when redirecting to the login page.
    #[must_use]
    pub const fn login_reason(self) -> &'static str {
        match self {
            Self::LinkExpired => "link_expired",
            Self::LinkAlreadyUsed => "link_used",
            Self::StoreUnavailable => "system_error",
            _ => "invalid_token",
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => Self::SessionExpired,
            TokenError::Malformed | TokenError::InvalidSignature => Self::SessionInvalid,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorBody {
    pub code: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorBody {
                code: self.code().to_string(),
            }),
        )
            .into_response()
    }
}
