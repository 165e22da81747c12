//! # Tessera (Identity & Session Service)
//!
//! `tessera` authenticates people for a merchant subscription dashboard and decides
//! what they may do.
//!
//! ## Sessions
//!
//! A session is a stateless signed token carried either in an `HttpOnly` cookie or
//! as a bearer header (the cookie wins when both are present). Each token embeds
//! the identity's **security stamp**; rotating the stamp revokes every outstanding
//! token for that identity at once, without a session table.
//!
//! Token lifetime depends on the role: staff roles get short sessions, tenant roles
//! longer ones.
//!
//! ## Authorization
//!
//! Roles form two ordered hierarchies:
//!
//! - **Staff:** `super_admin` > `platform_manager` > `platform_support`
//! - **Tenant:** `owner` > `admin` > `agent`
//!
//! Any staff role is treated as a tenant `owner` for tenant actions.
//!
//! ## Magic Links
//!
//! A trusted bot requests single-use, short-lived login links for external users.
//! Only the SHA-256 of a link token is persisted, and redemption is a single
//! conditional write, so concurrent clicks admit at most one session.
//!
//! ## Embedded Contexts
//!
//! Cookie attributes are chosen per request from the forwarded host and protocol so
//! sessions survive third-party iframes and dev tunnels. The [`sync`] module
//! describes how a tab that finished logging in hands the session to the tab that
//! is waiting for it.
//!
//! The schema lives in `sql/schema.sql`.

pub mod api;
pub mod cli;
pub mod sync;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
