use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use synckit_protocol::{DocumentPermissions, TokenPayload};

/// The access-token claim shape on the wire, matching `auth/jwt.py`'s
/// `generate_access_token` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessClaims {
    #[serde(rename = "userId")]
    user_id: String,
    permissions: DocumentPermissions,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefreshClaims {
    #[serde(rename = "userId")]
    user_id: String,
    iat: i64,
    exp: i64,
}

pub struct TokenIssuer {
    secret: String,
    access_ttl_hours: i64,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(secret: impl Into<String>, access_ttl_hours: i64) -> Self {
        Self {
            secret: secret.into(),
            access_ttl_hours,
        }
    }

    /// Verifies a bearer token against the configured secret. Every
    /// failure mode (bad signature, expiry, missing claims, malformed
    /// token) collapses to `None` — the hub's only wire-visible response
    /// is the opaque `INVALID_TOKEN` error code (§4.2, §7).
    #[must_use]
    pub fn verify(&self, token: &str) -> Option<TokenPayload> {
        let data = decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .ok()?;
        let claims = data.claims;
        Some(TokenPayload {
            user_id: claims.user_id,
            permissions: claims.permissions,
            email: claims.email,
            iat: claims.iat,
            exp: claims.exp,
        })
    }

    #[must_use]
    pub fn generate_access_token(
        &self,
        user_id: &str,
        permissions: DocumentPermissions,
        email: Option<String>,
        now: i64,
    ) -> String {
        let claims = AccessClaims {
            user_id: user_id.to_string(),
            permissions,
            email,
            iat: now,
            exp: now + self.access_ttl_hours * 3600,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .expect("HS256 encoding of a plain struct cannot fail")
    }

    #[must_use]
    pub fn generate_refresh_token(&self, user_id: &str, now: i64) -> String {
        const REFRESH_TTL_SECONDS: i64 = 7 * 24 * 3600;
        let claims = RefreshClaims {
            user_id: user_id.to_string(),
            iat: now,
            exp: now + REFRESH_TTL_SECONDS,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .expect("HS256 encoding of a plain struct cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn now_ts() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is after the epoch")
            .as_secs() as i64
    }

    #[test]
    fn issued_access_token_verifies_back_to_the_same_claims() {
        let issuer = TokenIssuer::new("a-32-byte-or-longer-test-secret!", 24);
        let perms = DocumentPermissions {
            can_read: vec!["doc-1".to_string()],
            can_write: vec![],
            is_admin: false,
        };
        let now = now_ts();
        let token = issuer.generate_access_token("user-1", perms.clone(), None, now);
        let payload = issuer.verify(&token).expect("token should verify");
        assert_eq!(payload.user_id, "user-1");
        assert_eq!(payload.permissions, perms);
        assert_eq!(payload.iat, now);
        assert_eq!(payload.exp, now + 24 * 3600);
    }

    #[test]
    fn token_signed_with_a_different_secret_fails_verification() {
        let issuer_a = TokenIssuer::new("secret-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", 24);
        let issuer_b = TokenIssuer::new("secret-bbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", 24);
        let perms = DocumentPermissions::anonymous();
        let token = issuer_a.generate_access_token("user-1", perms, None, 0);
        assert!(issuer_b.verify(&token).is_none());
    }

    #[test]
    fn expired_token_fails_verification() {
        let issuer = TokenIssuer::new("a-32-byte-or-longer-test-secret!", 0);
        let perms = DocumentPermissions::anonymous();
        // ttl=0 hours means exp == iat; jsonwebtoken treats exp <= now as expired.
        let token = issuer.generate_access_token("user-1", perms, None, 1_000);
        assert!(issuer.verify(&token).is_none());
    }

    #[test]
    fn garbage_token_fails_verification_without_panicking() {
        let issuer = TokenIssuer::new("a-32-byte-or-longer-test-secret!", 24);
        assert!(issuer.verify("not.a.jwt").is_none());
    }

    #[test]
    fn refresh_token_round_trips_but_carries_no_permissions() {
        let issuer = TokenIssuer::new("a-32-byte-or-longer-test-secret!", 24);
        let now = now_ts();
        let token = issuer.generate_refresh_token("user-2", now);
        let decoded = decode::<RefreshClaims>(
            &token,
            &DecodingKey::from_secret(issuer.secret.as_bytes()),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(decoded.claims.user_id, "user-2");
        assert_eq!(decoded.claims.exp - decoded.claims.iat, 7 * 24 * 3600);
    }
}
