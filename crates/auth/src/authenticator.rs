use std::sync::Arc;

use config::AuthConfig;
use http::HeaderMap;
use secrecy::ExposeSecret;

use crate::error::AuthError;
use crate::extract::extract_token;
use crate::fingerprint::{MasterKey, fingerprint};
use crate::jwt::{JwtValidator, TokenClaims};
use crate::principal::{Principal, TokenInfo};
use crate::rbac::RbacPolicy;
use crate::store::CredentialStore;

/// Resolves the caller of a request.
pub struct Authenticator {
    master_key: Option<MasterKey>,
    jwt: Option<JwtValidator>,
    rbac: Option<RbacPolicy>,
    store: Arc<dyn CredentialStore>,
}

impl Authenticator {
    /// Create an authenticator backed by the given credential store.
    pub fn new(config: &AuthConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            master_key: config.master_key.as_ref().map(MasterKey::new),
            jwt: config.jwt.clone().map(JwtValidator::new),
            rbac: config.rbac.as_ref().map(RbacPolicy::new),
            store,
        }
    }

    /// The credential store, also used to record spend.
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Extract the token from the headers and resolve it for `path`.
    pub async fn authenticate(&self, headers: &HeaderMap, path: &str) -> Result<Principal, AuthError> {
        let token = extract_token(headers)?;
        self.resolve(token.expose_secret(), path).await
    }

    /// Master key, then JWT, then credential store.
    pub async fn resolve(&self, token: &str, path: &str) -> Result<Principal, AuthError> {
        let fingerprint = fingerprint(token);

        if self.master_key.as_ref().is_some_and(|key| key.matches(token)) {
            log::debug!("Master key used");
            return Ok(Principal::admin(fingerprint));
        }

        if let Some(jwt) = self.jwt.as_ref().filter(|_| token.matches('.').count() == 2) {
            let claims = jwt.validate(token).await?;
            let principal = principal_from_claims(fingerprint, claims);

            let denied = self.rbac.as_ref().is_some_and(|rbac| !rbac.is_allowed(principal.role, path));

            if denied {
                return Err(AuthError::AccessDenied {
                    role: principal.role,
                    path: path.to_string(),
                });
            }

            return Ok(principal);
        }

        match self.store.get_verification_token(&fingerprint).await {
            Ok(Some(info)) if info.blocked => {
                log::debug!("Blocked key {fingerprint} rejected");
                Err(AuthError::CredentialBlocked)
            }
            Ok(Some(info)) => Ok(Principal::from_token_info(fingerprint, info)),
            Ok(None) => Err(AuthError::InvalidCredential),
            Err(e) => {
                log::error!("Credential store lookup failed: {e}");
                Err(AuthError::StoreUnavailable(e.to_string()))
            }
        }
    }
}

fn principal_from_claims(fingerprint: String, claims: TokenClaims) -> Principal {
    let role = claims.role();

    let info = TokenInfo {
        user_id: claims.user_id.or(claims.sub),
        team_id: claims.team_id,
        org_id: claims.org_id,
        ..Default::default()
    };

    Principal { fingerprint, role, info }
}
