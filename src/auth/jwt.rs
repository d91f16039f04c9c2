use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::{auth::repo_types::UserRole, config::JwtConfig, state::AppState};

/// The `typ` claim value for access tokens. Refresh tokens are opaque strings
/// tracked in the database and never pass through this module.
pub const TOKEN_TYPE_ACCESS: &str = "access";

/// JWT payload for access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id as decimal string
    pub typ: String,
    pub iat: usize,
    pub exp: usize,
    pub role: UserRole,
}

impl Claims {
    pub fn user_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}

/// Holds JWT signing and verification keys with config data.
#[derive(Clone)]
pub struct JwtKeys {
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
    pub access_ttl: Duration,
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        Self::from_config(&state.config.jwt)
    }
}

impl JwtKeys {
    pub fn from_config(cfg: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(cfg.secret.as_bytes()),
            decoding: DecodingKey::from_secret(cfg.secret.as_bytes()),
            access_ttl: Duration::from_secs((cfg.access_ttl_minutes as u64) * 60),
        }
    }

    pub fn sign_access(&self, user_id: i64, role: UserRole) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let exp = now + self.access_ttl.as_secs() as i64;
        let claims = Claims {
            sub: user_id.to_string(),
            typ: TOKEN_TYPE_ACCESS.into(),
            iat: now as usize,
            exp: exp as usize,
            role,
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id, "jwt signed");
        Ok(token)
    }

    /// Verifies signature and expiry (leeway 0) and requires `typ ==
    /// "access"`. Missing claims and type mismatches are errors too; callers
    /// collapse all of them into the generic invalid-token response.
    pub fn verify(&self, token: &str) -> anyhow::Result<Claims> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        if data.claims.typ != TOKEN_TYPE_ACCESS {
            anyhow::bail!("not an access token");
        }
        debug!(sub = %data.claims.sub, "jwt verified");
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_keys(secret: &str) -> JwtKeys {
        JwtKeys::from_config(&JwtConfig {
            secret: secret.into(),
            access_ttl_minutes: 15,
            refresh_ttl_days: 30,
        })
    }

    #[test]
    fn sign_and_verify_access_token() {
        let keys = make_keys("dev-secret");
        let token = keys.sign_access(42, UserRole::User).expect("sign access");
        let claims = keys.verify(&token).expect("verify token");
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.user_id(), Some(42));
        assert_eq!(claims.typ, TOKEN_TYPE_ACCESS);
        assert_eq!(claims.role, UserRole::User);
    }

    #[test]
    fn role_claim_round_trips_for_admin() {
        let keys = make_keys("dev-secret");
        let token = keys.sign_access(7, UserRole::Admin).expect("sign access");
        let claims = keys.verify(&token).expect("verify token");
        assert_eq!(claims.role, UserRole::Admin);
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let token = make_keys("secret-a")
            .sign_access(1, UserRole::User)
            .expect("sign access");
        assert!(make_keys("secret-b").verify(&token).is_err());
    }

    #[test]
    fn verify_rejects_expired_token() {
        let keys = make_keys("dev-secret");
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: "1".into(),
            typ: TOKEN_TYPE_ACCESS.into(),
            iat: (now - 120) as usize,
            exp: (now - 60) as usize,
            role: UserRole::User,
        };
        let token = encode(&Header::default(), &claims, &keys.encoding).expect("encode");
        assert!(keys.verify(&token).is_err());
    }

    #[test]
    fn verify_rejects_wrong_token_type() {
        let keys = make_keys("dev-secret");
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: "1".into(),
            typ: "refresh".into(),
            iat: now as usize,
            exp: (now + 600) as usize,
            role: UserRole::User,
        };
        let token = encode(&Header::default(), &claims, &keys.encoding).expect("encode");
        let err = keys.verify(&token).unwrap_err();
        assert!(err.to_string().contains("not an access token"));
    }

    #[test]
    fn verify_rejects_opaque_garbage() {
        let keys = make_keys("dev-secret");
        assert!(keys.verify("b0gusOpaqueRefreshString").is_err());
    }

    #[test]
    fn non_numeric_subject_has_no_user_id() {
        let claims = Claims {
            sub: "not-a-number".into(),
            typ: TOKEN_TYPE_ACCESS.into(),
            iat: 0,
            exp: 0,
            role: UserRole::User,
        };
        assert_eq!(claims.user_id(), None);
    }
}
