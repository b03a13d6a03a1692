//! Response ids bound to the principal that created them.
//!
//! An upstream id `resp_1` is returned as `resp_1.<tag>`, where the tag is the first 16
//! hex characters of an HMAC-SHA256 over the id, user and team. Retrieval with a
//! different principal is denied. Plain ids pass through unchanged.

use auth::Principal;
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::error::{ErrorKind, LlmError};

type HmacSha256 = Hmac<Sha256>;

const TAG_LEN: usize = 16;

pub(crate) struct ResponseIdSigner {
    mac: HmacSha256,
}

impl ResponseIdSigner {
    /// Sign with the configured secret, or with a random one that lives as long as the process.
    pub fn new(secret: Option<&SecretString>) -> anyhow::Result<Self> {
        let mac = match secret {
            Some(secret) => HmacSha256::new_from_slice(secret.expose_secret().as_bytes()),
            None => {
                log::debug!("No response id secret configured, generating one");

                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);

                HmacSha256::new_from_slice(&key)
            }
        }
        .map_err(|e| anyhow::anyhow!("invalid response id secret: {e}"))?;

        Ok(Self { mac })
    }

    fn tag(&self, raw_id: &str, principal: &Principal) -> HmacSha256 {
        let mut mac = self.mac.clone();

        mac.update(
            format!(
                "tianji_proxy:responses_api:response_id:{raw_id};user_id:{};team_id:{}",
                principal.user_id(),
                principal.team_id()
            )
            .as_bytes(),
        );

        mac
    }

    /// The envelope returned to the caller.
    pub fn wrap(&self, raw_id: &str, principal: &Principal) -> String {
        let digest = self.tag(raw_id, principal).finalize().into_bytes();
        let tag = hex::encode(digest);

        format!("{raw_id}.{}", &tag[..TAG_LEN])
    }

    /// The upstream id of an envelope presented by `principal`.
    pub fn unwrap(&self, envelope: &str, principal: &Principal) -> crate::Result<String> {
        let Some((raw_id, tag)) = split(envelope) else {
            return Ok(envelope.to_string());
        };

        if principal.is_admin() {
            return Ok(raw_id.to_string());
        }

        let verified = hex::decode(tag)
            .map(|tag| self.tag(raw_id, principal).verify_truncated_left(&tag).is_ok())
            .unwrap_or(false);

        if !verified {
            log::debug!("Response id verification failed for key {}", principal.api_key_hash());

            return Err(LlmError::new(ErrorKind::Permission, "Access to this response is denied")
                .with_code("response-access-denied"));
        }

        Ok(raw_id.to_string())
    }

    /// Wrap the string `id` field of an upstream JSON body in place.
    pub fn wrap_body(&self, body: &mut serde_json::Value, principal: &Principal) {
        if let Some(id) = body.get_mut("id")
            && let Some(raw_id) = id.as_str()
        {
            let wrapped = self.wrap(raw_id, principal);
            *id = serde_json::Value::String(wrapped);
        }
    }
}

fn split(envelope: &str) -> Option<(&str, &str)> {
    let (raw_id, tag) = envelope.rsplit_once('.')?;

    let is_tag = !raw_id.is_empty() && tag.len() == TAG_LEN && tag.bytes().all(|b| b.is_ascii_hexdigit());

    is_tag.then_some((raw_id, tag))
}

#[cfg(test)]
mod tests {
    use auth::TokenInfo;
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;

    fn principal(user: &str, team: Option<&str>) -> Principal {
        let info = TokenInfo {
            user_id: Some(user.to_string()),
            team_id: team.map(str::to_string),
            ..Default::default()
        };

        Principal::from_token_info("12".repeat(32), info)
    }

    fn signer() -> ResponseIdSigner {
        ResponseIdSigner::new(Some(&SecretString::from("response-secret".to_string()))).unwrap()
    }

    #[test]
    fn envelope_round_trip() {
        let signer = signer();
        let alice = principal("alice", Some("blue"));

        let envelope = signer.wrap("resp_abc123", &alice);

        let (raw_id, tag) = envelope.rsplit_once('.').unwrap();
        assert_eq!(raw_id, "resp_abc123");
        assert_eq!(tag.len(), 16);

        assert_eq!(signer.unwrap(&envelope, &alice).unwrap(), "resp_abc123");
    }

    #[test]
    fn other_principals_are_denied() {
        let signer = signer();
        let envelope = signer.wrap("resp_abc123", &principal("alice", Some("blue")));

        for other in [principal("bob", Some("blue")), principal("alice", Some("red")), principal("alice", None)] {
            let error = signer.unwrap(&envelope, &other).unwrap_err();

            assert_eq!(error.kind(), ErrorKind::Permission);
            assert_eq!(error.code(), "response-access-denied");
        }
    }

    #[test]
    fn admins_bypass_verification() {
        let signer = signer();
        let envelope = signer.wrap("resp_abc123", &principal("alice", None));

        let admin = Principal::admin("ff".repeat(32));
        assert_eq!(signer.unwrap(&envelope, &admin).unwrap(), "resp_abc123");
    }

    #[test]
    fn plain_ids_pass_through() {
        let signer = signer();
        let bob = principal("bob", None);

        assert_eq!(signer.unwrap("resp_abc123", &bob).unwrap(), "resp_abc123");
        assert_eq!(signer.unwrap("resp.v2", &bob).unwrap(), "resp.v2");
    }

    #[test]
    fn generated_secrets_differ() {
        let alice = principal("alice", None);
        let first = ResponseIdSigner::new(None).unwrap();
        let second = ResponseIdSigner::new(None).unwrap();

        let envelope = first.wrap("resp_1", &alice);

        assert!(first.unwrap(&envelope, &alice).is_ok());
        assert!(second.unwrap(&envelope, &alice).is_err());
    }

    #[test]
    fn bodies_are_rewrapped() {
        let signer = signer();
        let alice = principal("alice", None);

        let mut body = json!({"id": "resp_1", "object": "response"});
        signer.wrap_body(&mut body, &alice);

        assert_eq!(body["id"], signer.wrap("resp_1", &alice));
    }
}
