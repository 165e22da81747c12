use crate::api::handlers::{auth::session, health};
use utoipa::openapi::{Contact, Info, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Routes registered here are both served and documented.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(session::session))
        .routes(routes!(session::logout))
        .routes(routes!(session::revoke_self))
        .routes(routes!(session::revoke_identity))
        .routes(routes!(session::issue_magic_link))
        .routes(routes!(session::redeem_magic_link_redirect))
        .routes(routes!(session::redeem_magic_link_json))
        .routes(routes!(session::embedded_login));

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Sessions, revocation and magic links".to_string());
    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Service health".to_string());
    router.get_openapi_mut().tags = Some(vec![auth_tag, health_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    OpenApiBuilder::new().info(cargo_info()).build()
}

/// API info taken from the package manifest rather than utoipa's defaults.
fn cargo_info() -> Info {
    let mut info = Info::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info.description = non_empty(env!("CARGO_PKG_DESCRIPTION")).map(str::to_string);

    // Only the first of the `;` separated authors becomes the contact.
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next().unwrap_or_default();
    info.contact = match parse_author(primary) {
        (None, None) => None,
        (name, email) => {
            let mut contact = Contact::new();
            contact.name = name.map(str::to_string);
            contact.email = email.map(str::to_string);
            Some(contact)
        }
    };

    info.license = non_empty(env!("CARGO_PKG_LICENSE")).map(|spdx| {
        let mut license = License::new(spdx);
        license.identifier = Some(spdx.to_string());
        license
    });
    info
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|v| !v.is_empty())
}

/// Split `Name <email>` into its parts.
fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, rest)) => (
            non_empty(name),
            rest.split('>').next().and_then(non_empty),
        ),
        None => (non_empty(author), None),
    }
}
