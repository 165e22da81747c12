//! Session endpoints for cookie and bearer auth.
//!
//! Every response that sets or clears the session cookie recomputes the
//! [`CookiePolicy`] from the request headers.

use axum::{
    extract::{Extension, Path, Query},
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use secrecy::ExposeSecret;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{
    cookie::CookiePolicy,
    error::{AuthError, ErrorBody},
    host_assertion::HostUser,
    magic_link::link_url,
    roles::Action,
    state::AuthState,
    store::Identity,
    token::NewSession,
    types::{
        EmbeddedLoginRequest, MagicLinkQuery, MagicLinkRequest, MagicLinkResponse,
        RedeemMagicLinkRequest, SessionGrant, SessionResponse,
    },
    utils::{extract_bearer_token, safe_redirect_target, secrets_match},
    verifier::extract_credential,
};

fn cookie_policy(auth_state: &AuthState, headers: &HeaderMap) -> CookiePolicy {
    let config = auth_state.config();
    CookiePolicy::from_headers(headers, config.tunnel_hosts(), config.cookie_domain())
}

/// `Set-Cookie` headers that drop the session cookie.
fn clear_cookie_headers(auth_state: &AuthState, headers: &HeaderMap) -> HeaderMap {
    let mut response_headers = HeaderMap::new();
    match cookie_policy(auth_state, headers).clear_cookie() {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build clear cookie: {err}"),
    }
    response_headers
}

/// Issue a session token for `identity` and the cookie carrying it.
fn start_session(
    auth_state: &AuthState,
    headers: &HeaderMap,
    identity: Identity,
) -> Result<(SessionGrant, HeaderMap), AuthError> {
    let issued = auth_state
        .codec()
        .issue(&NewSession {
            identity_id: identity.id,
            role: identity.role,
            tenant_id: identity.tenant_id,
            security_stamp: identity.security_stamp.clone(),
        })
        .map_err(|err| {
            error!("Failed to issue session token: {err}");
            AuthError::StoreUnavailable
        })?;
    let cookie = cookie_policy(auth_state, headers)
        .session_cookie(&issued.token, issued.ttl_seconds())
        .map_err(|err| {
            error!("Failed to build session cookie: {err}");
            AuthError::StoreUnavailable
        })?;
    let mut response_headers = HeaderMap::new();
    response_headers.insert(SET_COOKIE, cookie);
    info!(identity_id = %identity.id, role = %identity.role, "Session started");
    Ok((
        SessionGrant {
            token: issued.token,
            expires_at: issued.expires_at,
            identity,
        },
        response_headers,
    ))
}

fn grant_response(auth_state: &AuthState, headers: &HeaderMap, identity: Identity) -> Response {
    match start_session(auth_state, headers, identity) {
        Ok((grant, cookie_headers)) => (StatusCode::OK, cookie_headers, Json(grant)).into_response(),
        Err(err) => err.into_response(),
    }
}

fn login_redirect(auth_state: &AuthState, reason: &str) -> Redirect {
    Redirect::to(&format!("{}?reason={reason}", auth_state.config().login_path()))
}

fn missing_payload() -> Response {
    (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response()
}

#[utoipa::path(
    get,
    path = "/v1/auth/session",
    responses(
        (status = 200, description = "Session is active", body = SessionResponse),
        (status = 204, description = "No credential presented"),
        (status = 401, description = "Session invalid, expired or revoked", body = ErrorBody),
        (status = 403, description = "Malformed tenant reference", body = ErrorBody),
        (status = 503, description = "Identity store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn session(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    // No credential at all is "no session", not an error.
    if extract_credential(&headers).is_none() {
        return StatusCode::NO_CONTENT.into_response();
    }
    match auth_state.verifier().verify(&headers).await {
        Ok(context) => (StatusCode::OK, Json(SessionResponse::from(context))).into_response(),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    responses(
        (status = 204, description = "Session cookie cleared")
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    // Stateless tokens: clearing the cookie is all a single-device logout does.
    (
        StatusCode::NO_CONTENT,
        clear_cookie_headers(&auth_state, &headers),
    )
        .into_response()
}

#[utoipa::path(
    post,
    path = "/v1/auth/revoke",
    responses(
        (status = 204, description = "All sessions of the caller revoked"),
        (status = 401, description = "Not authenticated", body = ErrorBody),
        (status = 503, description = "Identity store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn revoke_self(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let context = match auth_state.verifier().verify(&headers).await {
        Ok(context) => context,
        Err(err) => return err.into_response(),
    };
    match auth_state.identities().rotate_stamp(context.identity_id).await {
        Ok(_) => {
            info!(identity_id = %context.identity_id, "Revoked all sessions");
            (
                StatusCode::NO_CONTENT,
                clear_cookie_headers(&auth_state, &headers),
            )
                .into_response()
        }
        Err(err) => {
            error!("Failed to rotate security stamp: {err}");
            AuthError::StoreUnavailable.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/identities/{id}/revoke",
    params(
        ("id" = Uuid, Path, description = "Identity whose sessions are revoked")
    ),
    responses(
        (status = 204, description = "Sessions revoked"),
        (status = 401, description = "Not authenticated", body = ErrorBody),
        (status = 403, description = "Caller lacks REVOKE_SESSIONS", body = ErrorBody),
        (status = 404, description = "Unknown identity"),
        (status = 503, description = "Identity store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn revoke_identity(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let context = match auth_state.verifier().verify(&headers).await {
        Ok(context) => context,
        Err(err) => return err.into_response(),
    };
    if let Err(err) = context.require(Action::RevokeSessions) {
        return err.into_response();
    }
    match auth_state.identities().rotate_stamp(id).await {
        Ok(Some(_)) => {
            info!(identity_id = %id, revoked_by = %context.identity_id, "Revoked all sessions");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!("Failed to rotate security stamp: {err}");
            AuthError::StoreUnavailable.into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/magic-link",
    request_body = MagicLinkRequest,
    params(
        ("Authorization" = String, Header, description = "Bearer bot API key")
    ),
    responses(
        (status = 200, description = "Magic link issued", body = MagicLinkResponse),
        (status = 400, description = "Missing payload", body = String),
        (status = 401, description = "Missing or wrong bot API key", body = ErrorBody),
        (status = 403, description = "Identity disabled", body = ErrorBody),
        (status = 404, description = "Bot issuance not configured"),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn issue_magic_link(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<MagicLinkRequest>>,
) -> impl IntoResponse {
    let Some(expected) = auth_state.config().bot_api_key() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(presented) = extract_bearer_token(&headers) else {
        return AuthError::CredentialsMissing.into_response();
    };
    if !secrets_match(&presented, expected.expose_secret()) {
        debug!("Magic link request with wrong bot API key");
        return AuthError::SessionInvalid.into_response();
    }
    let Some(Json(request)) = payload else {
        return missing_payload();
    };

    let host_user = HostUser {
        id: request.host_user_id,
        display_name: request.display_name,
    };
    let identity = match auth_state
        .identities()
        .find_or_create_external(&host_user.external_id(), host_user.display_name.as_deref())
        .await
    {
        Ok(Some(identity)) => identity,
        Ok(None) => return AuthError::PermissionDenied.into_response(),
        Err(err) => {
            error!("Failed to resolve external identity: {err}");
            return AuthError::StoreUnavailable.into_response();
        }
    };

    let broker = auth_state.broker();
    let issued = if request.exclusive {
        broker.issue_exclusive(identity.id).await
    } else {
        broker.issue(identity.id).await
    };
    let issued = match issued {
        Ok(issued) => issued,
        Err(err) => return err.into_response(),
    };
    match link_url(auth_state.config().public_base_url(), &issued.token) {
        Ok(url) => (
            StatusCode::OK,
            Json(MagicLinkResponse {
                url,
                expires_at: issued.expires_at,
            }),
        )
            .into_response(),
        Err(err) => {
            error!("Failed to build magic link URL: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[utoipa::path(
    get,
    path = "/auth/magic",
    params(MagicLinkQuery),
    responses(
        (status = 303, description = "Redirect to `next` with a session cookie, or to the login page with a `reason`")
    ),
    tag = "auth"
)]
pub async fn redeem_magic_link_redirect(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    Query(query): Query<MagicLinkQuery>,
) -> impl IntoResponse {
    let Some(token) = query
        .token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
    else {
        return login_redirect(&auth_state, "no_token").into_response();
    };

    let result = match auth_state.broker().redeem(token).await {
        Ok(identity) => start_session(&auth_state, &headers, identity),
        Err(err) => Err(err),
    };
    match result {
        Ok((_, cookie_headers)) => {
            let target = safe_redirect_target(query.next.as_deref());
            (cookie_headers, Redirect::to(&target)).into_response()
        }
        Err(err) => {
            debug!("Magic link redemption failed: {err}");
            login_redirect(&auth_state, err.login_reason()).into_response()
        }
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/magic-link/redeem",
    request_body = RedeemMagicLinkRequest,
    responses(
        (status = 200, description = "Session issued (cookie and bearer token)", body = SessionGrant),
        (status = 400, description = "Missing payload", body = String),
        (status = 401, description = "Link invalid, expired or already used", body = ErrorBody),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn redeem_magic_link_json(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<RedeemMagicLinkRequest>>,
) -> impl IntoResponse {
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    match auth_state.broker().redeem(&request.token).await {
        Ok(identity) => grant_response(&auth_state, &headers, identity),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/embedded",
    request_body = EmbeddedLoginRequest,
    responses(
        (status = 200, description = "Session issued (cookie and bearer token)", body = SessionGrant),
        (status = 400, description = "Missing payload", body = String),
        (status = 401, description = "Init data invalid or stale", body = ErrorBody),
        (status = 403, description = "Identity disabled", body = ErrorBody),
        (status = 404, description = "Embedded login not configured"),
        (status = 503, description = "Store unavailable", body = ErrorBody)
    ),
    tag = "auth"
)]
pub async fn embedded_login(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<EmbeddedLoginRequest>>,
) -> impl IntoResponse {
    let Some(host_assertion) = auth_state.host_assertion() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(Json(request)) = payload else {
        return missing_payload();
    };
    let host_user = match host_assertion.verify(
        &request.init_data,
        OffsetDateTime::now_utc().unix_timestamp(),
    ) {
        Ok(host_user) => host_user,
        Err(err) => return err.into_response(),
    };
    match auth_state
        .identities()
        .find_or_create_external(&host_user.external_id(), host_user.display_name.as_deref())
        .await
    {
        Ok(Some(identity)) => grant_response(&auth_state, &headers, identity),
        Ok(None) => AuthError::PermissionDenied.into_response(),
        Err(err) => {
            error!("Failed to resolve external identity: {err}");
            AuthError::StoreUnavailable.into_response()
        }
    }
}
