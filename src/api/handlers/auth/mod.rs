//! Session and identity handlers plus the protocol pieces behind them.
//!
//! A request is admitted by [`verifier::SessionVerifier`]: the token comes from the
//! session cookie or, when no cookie is present, from `Authorization: Bearer`. The
//! token is checked by [`token::TokenCodec`] and then against the identity's live
//! security stamp, so rotating the stamp revokes every outstanding session.
//!
//! ## Staff override
//!
//! Staff roles pass every tenant-scoped permission check. Platform support acts on
//! a merchant's behalf through this rule, so it is part of the permission model and
//! covered by tests.
//!
//! ## Magic links
//!
//! Links are one-time tokens stored as SHA-256 hashes. Redemption is one
//! conditional write; a second redeem of the same token reports
//! `link_already_used`.

pub mod cookie;
pub mod error;
pub(crate) mod host_assertion;
pub mod magic_link;
pub mod memory;
pub mod roles;
pub(crate) mod session;
mod state;
pub mod storage;
pub mod store;
pub mod token;
pub(crate) mod types;
mod utils;
pub mod verifier;

pub use error::AuthError;
pub use memory::MemoryStore;
pub use roles::{has_permission, Action, Role};
pub use state::{AuthState, SessionConfig, TtlTiers, DEFAULT_TUNNEL_HOST_PATTERNS};
pub use storage::PgStore;
pub use verifier::{AuthContext, CredentialChannel};
