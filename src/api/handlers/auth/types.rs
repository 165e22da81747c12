//! Request/response types for auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::{
    roles::{Action, Role},
    store::Identity,
    verifier::{AuthContext, CredentialChannel},
};

#[derive(ToSchema, Serialize, Debug)]
pub struct SessionResponse {
    pub identity_id: Uuid,
    pub role: Role,
    pub tenant_id: Option<Uuid>,
    pub expires_at: i64,
    pub channel: CredentialChannel,
    /// Every action the role may perform.
    pub permissions: Vec<Action>,
}

impl From<AuthContext> for SessionResponse {
    fn from(context: AuthContext) -> Self {
        let permissions = Action::ALL
            .into_iter()
            .filter(|action| context.can(*action))
            .collect();
        Self {
            identity_id: context.identity_id,
            role: context.role,
            tenant_id: context.tenant_id,
            expires_at: context.expires_at,
            channel: context.channel,
            permissions,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MagicLinkRequest {
    /// User id on the messaging host.
    pub host_user_id: i64,
    pub display_name: Option<String>,
    /// Invalidate unused links of the identity first.
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MagicLinkResponse {
    pub url: String,
    pub expires_at: i64,
}

#[derive(Deserialize, Debug, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct MagicLinkQuery {
    pub token: Option<String>,
    pub next: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RedeemMagicLinkRequest {
    pub token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct EmbeddedLoginRequest {
    /// Raw init data string handed to the mini-app by the host.
    pub init_data: String,
}

/// A session issued for bearer use; the cookie is set alongside.
#[derive(ToSchema, Serialize, Debug)]
pub struct SessionGrant {
    pub token: String,
    pub expires_at: i64,
    pub identity: Identity,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn magic_link_request_defaults_exclusive() -> Result<()> {
        let request: MagicLinkRequest =
            serde_json::from_value(serde_json::json!({ "host_user_id": 42 }))?;
        assert_eq!(request.host_user_id, 42);
        assert!(!request.exclusive);
        assert!(request.display_name.is_none());
        Ok(())
    }

    #[test]
    fn session_response_lists_permissions() -> Result<()> {
        let response = SessionResponse::from(AuthContext {
            identity_id: Uuid::nil(),
            role: Role::Agent,
            tenant_id: None,
            expires_at: 10,
            channel: CredentialChannel::Bearer,
        });
        let value = serde_json::to_value(&response)?;
        let permissions = value
            .get("permissions")
            .and_then(serde_json::Value::as_array)
            .context("missing permissions")?;
        assert_eq!(permissions.len(), 3);
        assert_eq!(value.get("role"), Some(&serde_json::json!("agent")));
        assert_eq!(value.get("channel"), Some(&serde_json::json!("bearer")));
        Ok(())
    }

    #[test]
    fn session_grant_hides_security_stamp() -> Result<()> {
        let grant = SessionGrant {
            token: "v1.a.b".to_string(),
            expires_at: 1,
            identity: Identity {
                id: Uuid::nil(),
                external_id: Some("host:1".to_string()),
                display_name: None,
                role: Role::Owner,
                tenant_id: None,
                security_stamp: "secret-stamp".to_string(),
            },
        };
        let rendered = serde_json::to_string(&grant)?;
        assert!(!rendered.contains("secret-stamp"));
        assert!(rendered.contains("host:1"));
        Ok(())
    }
}
