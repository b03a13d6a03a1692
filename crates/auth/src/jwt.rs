//! JWT validation against the identity provider's key set.

mod claims;
mod jwks;

use std::str::FromStr;

use config::JwtConfig;
use jwt_compact::{Algorithm, AlgorithmExt, TimeOptions, UntrustedToken, jwk::JsonWebKey};

pub use claims::TokenClaims;
use jwks::{Alg, Jwks, JwksCache};

use crate::error::AuthError;

/// Validates signature, expiry, maturity, issuer and audience of bearer JWTs.
pub struct JwtValidator {
    config: JwtConfig,
    jwks_cache: JwksCache,
}

impl JwtValidator {
    /// Create a validator fetching keys from the configured JWKS URL.
    pub fn new(config: JwtConfig) -> Self {
        let jwks_cache = JwksCache::new(config.jwks_url.clone(), config.poll_interval);
        Self { config, jwks_cache }
    }

    #[cfg(test)]
    fn with_jwks(config: JwtConfig, jwks: Jwks<'static>) -> Self {
        Self {
            config,
            jwks_cache: JwksCache::preloaded(jwks),
        }
    }

    /// Validate a token and return its claims.
    pub async fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let token = UntrustedToken::new(token).map_err(|_| AuthError::InvalidToken("malformed token"))?;

        let jwks = self.jwks_cache.get().await.map_err(|e| {
            log::warn!("Failed to fetch JWKS: {e}");
            AuthError::StoreUnavailable("identity provider key set unavailable".to_string())
        })?;

        self.validate_token(&jwks, token)
            .map(|token| token.claims().custom.clone())
            .ok_or(AuthError::InvalidToken("token validation failed"))
    }

    fn validate_token(
        &self,
        jwks: &Jwks<'_>,
        untrusted_token: UntrustedToken<'_>,
    ) -> Option<jwt_compact::Token<TokenClaims>> {
        use jwt_compact::alg::*;

        let time_options = TimeOptions::default();
        let alg = Alg::from_str(untrusted_token.algorithm()).ok()?;

        // Every key is tried so the time spent does not reveal which key matched.
        let mut validated = None;

        for jwk in &jwks.keys {
            let kid_matches = match (&untrusted_token.header().key_id, &jwk.key_id) {
                (Some(expected), Some(kid)) => expected == kid,
                (Some(_), None) => false,
                (None, _) => true,
            };

            let decoded = match alg {
                Alg::HS256 => decode(Hs256, &jwk.key, &untrusted_token),
                Alg::HS384 => decode(Hs384, &jwk.key, &untrusted_token),
                Alg::HS512 => decode(Hs512, &jwk.key, &untrusted_token),
                Alg::ES256 => decode(Es256, &jwk.key, &untrusted_token),
                Alg::RS256 => decode(Rsa::rs256(), &jwk.key, &untrusted_token),
                Alg::RS384 => decode(Rsa::rs384(), &jwk.key, &untrusted_token),
                Alg::RS512 => decode(Rsa::rs512(), &jwk.key, &untrusted_token),
                Alg::PS256 => decode(Rsa::ps256(), &jwk.key, &untrusted_token),
                Alg::PS384 => decode(Rsa::ps384(), &jwk.key, &untrusted_token),
                Alg::PS512 => decode(Rsa::ps512(), &jwk.key, &untrusted_token),
                Alg::EdDSA => decode(Ed25519, &jwk.key, &untrusted_token),
            };

            let Some(token) = decoded else {
                continue;
            };

            let claims = token.claims();

            let time_valid = claims.validate_expiration(&time_options).is_ok()
                && (claims.not_before.is_none() || claims.validate_maturity(&time_options).is_ok());

            let valid = kid_matches && time_valid && self.issuer_valid(&claims.custom) && self.audience_valid(&claims.custom);

            if valid && validated.is_none() {
                validated = Some(token);
            }
        }

        validated
    }

    fn issuer_valid(&self, claims: &TokenClaims) -> bool {
        let Some(expected_issuer) = &self.config.expected_issuer else {
            return true;
        };

        match claims.iss.as_deref() {
            Some(issuer) if issuer == expected_issuer => true,
            Some(_) => {
                log::debug!("Token rejected: invalid issuer");
                false
            }
            None => {
                log::debug!("Token rejected: missing issuer claim");
                false
            }
        }
    }

    fn audience_valid(&self, claims: &TokenClaims) -> bool {
        let Some(expected_audience) = &self.config.expected_audience else {
            return true;
        };

        let valid = claims.has_audience(expected_audience);

        if !valid {
            log::debug!("Token rejected: audience validation failed");
        }

        valid
    }
}

fn decode<A: Algorithm>(
    alg: A,
    jwk: &JsonWebKey<'_>,
    untrusted_token: &UntrustedToken<'_>,
) -> Option<jwt_compact::Token<TokenClaims>>
where
    A::VerifyingKey: std::fmt::Debug + for<'a> TryFrom<&'a JsonWebKey<'a>>,
{
    let key = A::VerifyingKey::try_from(jwk).ok()?;
    alg.validator(&key).validate(untrusted_token).ok()
}

#[cfg(test)]
mod tests {
    use config::JwtConfig;
    use jwt_compact::{
        AlgorithmExt, Claims, Header, TimeOptions,
        alg::{Hs256, Hs256Key},
        jwk::JsonWebKey,
    };
    use serde_json::json;

    use super::*;

    const SECRET: &[u8] = b"an-hs256-secret-of-decent-length!";

    fn config(issuer: Option<&str>, audience: Option<&str>) -> JwtConfig {
        JwtConfig {
            jwks_url: "http://127.0.0.1:1/jwks".parse().unwrap(),
            poll_interval: None,
            expected_issuer: issuer.map(str::to_string),
            expected_audience: audience.map(str::to_string),
        }
    }

    fn validator(config: JwtConfig) -> JwtValidator {
        let key = Hs256Key::new(SECRET);
        let mut jwk = serde_json::to_value(JsonWebKey::from(&key)).unwrap();
        jwk["kid"] = json!("k1");

        let jwks = serde_json::from_value(json!({ "keys": [jwk] })).unwrap();

        JwtValidator::with_jwks(config, jwks)
    }

    fn token(custom: TokenClaims, valid_for: chrono::Duration) -> String {
        let key = Hs256Key::new(SECRET);
        let claims = Claims::new(custom).set_duration(&TimeOptions::default(), valid_for);

        Hs256.token(&Header::empty().with_key_id("k1"), &claims, &key).unwrap()
    }

    #[tokio::test]
    async fn valid_token() {
        let claims = TokenClaims {
            iss: Some("https://idp.example.com".to_string()),
            aud: Some(json!("tianji")),
            team_id: Some("finance".to_string()),
            ..Default::default()
        };

        let validator = validator(config(Some("https://idp.example.com"), Some("tianji")));
        let claims = validator.validate(&token(claims, chrono::Duration::hours(1))).await.unwrap();

        assert_eq!(claims.team_id.as_deref(), Some("finance"));
    }

    #[tokio::test]
    async fn expired_token() {
        let validator = validator(config(None, None));
        let token = token(TokenClaims::default(), chrono::Duration::hours(-1));

        let error = validator.validate(&token).await.unwrap_err();
        insta::assert_snapshot!(error, @"Invalid token: token validation failed");
    }

    #[tokio::test]
    async fn wrong_issuer_and_audience() {
        let claims = TokenClaims {
            iss: Some("https://evil.example.com".to_string()),
            ..Default::default()
        };

        let token = token(claims, chrono::Duration::hours(1));

        assert!(validator(config(Some("https://idp.example.com"), None)).validate(&token).await.is_err());
        assert!(validator(config(None, Some("tianji"))).validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn malformed_token() {
        let error = validator(config(None, None)).validate("a.b.c").await.unwrap_err();
        insta::assert_snapshot!(error, @"Invalid token: malformed token");
    }
}
