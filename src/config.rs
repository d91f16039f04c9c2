use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub cors_origins: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET")?,
            access_ttl_minutes: std::env::var("ACCESS_TOKEN_EXPIRE_MINUTES")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(15),
            refresh_ttl_days: std::env::var("REFRESH_TOKEN_EXPIRE_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(30),
        };
        let cors_origins = std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".into());
        Ok(Self {
            database_url,
            jwt,
            cors_origins,
        })
    }
}

impl JwtConfig {
    /// Access token lifetime in seconds, as reported in `expires_in`.
    pub fn access_ttl_seconds(&self) -> i64 {
        self.access_ttl_minutes * 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_ttl_seconds_is_minutes_times_sixty() {
        let cfg = JwtConfig {
            secret: "s".into(),
            access_ttl_minutes: 15,
            refresh_ttl_days: 30,
        };
        assert_eq!(cfg.access_ttl_seconds(), 900);
    }
}
