//! Caller authentication for Tianji.
//!
//! A request is resolved to a [`Principal`] by, in order: the master key, a JWT
//! validated against a JWKS endpoint, or a credential store lookup by token
//! fingerprint.

#![deny(missing_docs)]

mod authenticator;
mod error;
mod extract;
mod fingerprint;
mod jwt;
mod principal;
mod rbac;
mod store;

pub use authenticator::Authenticator;
pub use error::{AuthError, StoreError};
pub use extract::extract_token;
pub use fingerprint::{MasterKey, fingerprint};
pub use jwt::{JwtValidator, TokenClaims};
pub use principal::{Principal, Role, TokenInfo};
pub use rbac::RbacPolicy;
pub use store::{CredentialStore, SpendRecord, StaticCredentialStore};
