use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Length of the opaque refresh token string. 64 alphanumeric characters give
/// well over the 256 bits of entropy needed for unguessability.
const REFRESH_TOKEN_LEN: usize = 64;

/// Refresh token record in the database.
///
/// A token is valid iff `revoked` is false and `expires_at` is in the future.
/// `Active -> Revoked` is terminal; expiry is evaluated lazily at validation
/// time and never written back.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshToken {
    pub id: i64,
    pub token: String,
    pub user_id: i64,
    pub expires_at: OffsetDateTime,
    pub revoked: bool,
    pub created_at: OffsetDateTime,
}

/// Internal reason a refresh token was rejected.
///
/// Handlers log the variant and collapse all of them into the generic
/// `ApiError::InvalidRefreshToken` so the API response stays oracle-free.
#[derive(Debug, Error)]
pub enum RefreshRejection {
    #[error("refresh token not found")]
    NotFound,
    #[error("refresh token revoked")]
    Revoked,
    #[error("refresh token expired")]
    Expired,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Generate a new opaque refresh token from the OS CSPRNG.
pub fn generate_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(REFRESH_TOKEN_LEN)
        .map(char::from)
        .collect()
}

impl RefreshToken {
    async fn insert(
        exec: impl sqlx::PgExecutor<'_>,
        user_id: i64,
        token: &str,
        expires_at: OffsetDateTime,
    ) -> sqlx::Result<RefreshToken> {
        sqlx::query_as::<_, RefreshToken>(
            r#"
            INSERT INTO refresh_tokens (token, user_id, expires_at)
            VALUES ($1, $2, $3)
            RETURNING id, token, user_id, expires_at, revoked, created_at
            "#,
        )
        .bind(token)
        .bind(user_id)
        .bind(expires_at)
        .fetch_one(exec)
        .await
    }

    /// Issue a fresh token for a user. Uniqueness is enforced by the unique
    /// index on `token`; a collision gets one retry with a new string.
    pub async fn issue(db: &PgPool, user_id: i64, ttl: Duration) -> anyhow::Result<RefreshToken> {
        let expires_at = OffsetDateTime::now_utc() + ttl;
        for _ in 0..2 {
            match Self::insert(db, user_id, &generate_token(), expires_at).await {
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => continue,
                Err(e) => return Err(e.into()),
                Ok(rt) => return Ok(rt),
            }
        }
        anyhow::bail!("refresh token collision retry exhausted")
    }

    /// Look up a token by exact string match and return the owning user id if
    /// it is still active.
    pub async fn validate(db: &PgPool, token: &str) -> Result<i64, RefreshRejection> {
        let row: Option<(i64, OffsetDateTime, bool)> = sqlx::query_as(
            r#"
            SELECT user_id, expires_at, revoked
            FROM refresh_tokens
            WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(db)
        .await?;

        match row {
            None => Err(RefreshRejection::NotFound),
            Some((_, _, true)) => Err(RefreshRejection::Revoked),
            Some((_, expires_at, _)) if expires_at <= OffsetDateTime::now_utc() => {
                Err(RefreshRejection::Expired)
            }
            Some((user_id, _, _)) => Ok(user_id),
        }
    }

    /// Atomically revoke `token` and issue its replacement for the same user.
    ///
    /// The UPDATE only matches while `revoked = FALSE`, so of two concurrent
    /// rotations of the same token exactly one claims the row; the loser sees
    /// zero rows and is rejected. Revoke and insert commit together or not at
    /// all.
    pub async fn rotate(
        db: &PgPool,
        token: &str,
        ttl: Duration,
    ) -> Result<(i64, RefreshToken), RefreshRejection> {
        let mut tx = db.begin().await?;

        let claimed: Option<(i64, OffsetDateTime)> = sqlx::query_as(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE
            WHERE token = $1 AND revoked = FALSE
            RETURNING user_id, expires_at
            "#,
        )
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id, expires_at)) = claimed else {
            let known: Option<i64> =
                sqlx::query_scalar(r#"SELECT user_id FROM refresh_tokens WHERE token = $1"#)
                    .bind(token)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match known {
                Some(_) => RefreshRejection::Revoked,
                None => RefreshRejection::NotFound,
            });
        };

        if expires_at <= OffsetDateTime::now_utc() {
            // Undo the claim; an expired token must fail without mutation.
            tx.rollback().await?;
            return Err(RefreshRejection::Expired);
        }

        let replacement = Self::insert(
            &mut *tx,
            user_id,
            &generate_token(),
            OffsetDateTime::now_utc() + ttl,
        )
        .await?;
        tx.commit().await?;

        Ok((user_id, replacement))
    }

    /// Revoke a token. Idempotent: unknown or already-revoked tokens are a
    /// no-op, never an error.
    pub async fn revoke(db: &PgPool, token: &str) -> anyhow::Result<()> {
        sqlx::query(r#"UPDATE refresh_tokens SET revoked = TRUE WHERE token = $1"#)
            .bind(token)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Revoke every active token of a user (logout everywhere). Returns the
    /// number of tokens revoked.
    pub async fn revoke_all_for_user(db: &PgPool, user_id: i64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = $1 AND revoked = FALSE"#,
        )
        .bind(user_id)
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }
}


#[cfg(test)]
mod db_tests {
    use super::*;
    use crate::auth::repo_types::{User, UserRole};
    use sqlx::postgres::PgPoolOptions;

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for DB tests");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("connect postgres");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("run migrations");
        pool
    }

    async fn seed_user(db: &PgPool) -> i64 {
        let email = format!("{}@tokens.test", generate_token()[..16].to_lowercase());
        User::create(db, &email, "irrelevant-hash", UserRole::User)
            .await
            .expect("seed user")
            .id
    }

    fn month() -> Duration {
        Duration::days(30)
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn issue_then_validate_maps_to_user() {
        let pool = test_pool().await;
        let user_id = seed_user(&pool).await;

        let rt = RefreshToken::issue(&pool, user_id, month()).await.expect("issue");
        assert!(!rt.revoked);
        assert_eq!(rt.user_id, user_id);

        let resolved = RefreshToken::validate(&pool, &rt.token).await.expect("validate");
        assert_eq!(resolved, user_id);
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn unknown_token_is_not_found() {
        let pool = test_pool().await;
        let err = RefreshToken::validate(&pool, "no-such-token").await.unwrap_err();
        assert!(matches!(err, RefreshRejection::NotFound));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn rotate_invalidates_the_old_token() {
        let pool = test_pool().await;
        let user_id = seed_user(&pool).await;
        let old = RefreshToken::issue(&pool, user_id, month()).await.expect("issue");

        let (rotated_user, new) = RefreshToken::rotate(&pool, &old.token, month())
            .await
            .expect("rotate");
        assert_eq!(rotated_user, user_id);
        assert_ne!(new.token, old.token);

        let err = RefreshToken::validate(&pool, &old.token).await.unwrap_err();
        assert!(matches!(err, RefreshRejection::Revoked));

        let resolved = RefreshToken::validate(&pool, &new.token).await.expect("new token valid");
        assert_eq!(resolved, user_id);
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn rotated_token_cannot_be_rotated_again() {
        let pool = test_pool().await;
        let user_id = seed_user(&pool).await;
        let old = RefreshToken::issue(&pool, user_id, month()).await.expect("issue");

        RefreshToken::rotate(&pool, &old.token, month()).await.expect("first rotate");
        let err = RefreshToken::rotate(&pool, &old.token, month()).await.unwrap_err();
        assert!(matches!(err, RefreshRejection::Revoked));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn concurrent_rotations_have_exactly_one_winner() {
        let pool = test_pool().await;
        let user_id = seed_user(&pool).await;
        let rt = RefreshToken::issue(&pool, user_id, month()).await.expect("issue");

        let (a, b) = tokio::join!(
            RefreshToken::rotate(&pool, &rt.token, month()),
            RefreshToken::rotate(&pool, &rt.token, month()),
        );

        let winners = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(winners, 1);
        for result in [a, b] {
            if let Err(reject) = result {
                assert!(matches!(reject, RefreshRejection::Revoked));
            }
        }

        let active: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM refresh_tokens WHERE user_id = $1 AND revoked = FALSE"#,
        )
        .bind(user_id)
        .fetch_one(&pool)
        .await
        .expect("count");
        assert_eq!(active, 1);
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn expired_token_is_rejected_without_mutation() {
        let pool = test_pool().await;
        let user_id = seed_user(&pool).await;
        let rt = RefreshToken::issue(&pool, user_id, Duration::seconds(-60))
            .await
            .expect("issue already-expired token");

        let err = RefreshToken::validate(&pool, &rt.token).await.unwrap_err();
        assert!(matches!(err, RefreshRejection::Expired));

        let err = RefreshToken::rotate(&pool, &rt.token, month()).await.unwrap_err();
        assert!(matches!(err, RefreshRejection::Expired));

        // The failed rotation must not have revoked the row.
        let revoked: bool =
            sqlx::query_scalar(r#"SELECT revoked FROM refresh_tokens WHERE token = $1"#)
                .bind(&rt.token)
                .fetch_one(&pool)
                .await
                .expect("row still present");
        assert!(!revoked);
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn revoke_is_idempotent() {
        let pool = test_pool().await;
        let user_id = seed_user(&pool).await;
        let rt = RefreshToken::issue(&pool, user_id, month()).await.expect("issue");

        RefreshToken::revoke(&pool, &rt.token).await.expect("first revoke");
        RefreshToken::revoke(&pool, &rt.token).await.expect("second revoke");
        RefreshToken::revoke(&pool, "never-issued").await.expect("unknown token revoke");

        let err = RefreshToken::validate(&pool, &rt.token).await.unwrap_err();
        assert!(matches!(err, RefreshRejection::Revoked));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn revoke_all_clears_every_active_token() {
        let pool = test_pool().await;
        let user_id = seed_user(&pool).await;
        let a = RefreshToken::issue(&pool, user_id, month()).await.expect("issue");
        let b = RefreshToken::issue(&pool, user_id, month()).await.expect("issue");

        let revoked = RefreshToken::revoke_all_for_user(&pool, user_id)
            .await
            .expect("revoke all");
        assert_eq!(revoked, 2);

        for token in [a.token, b.token] {
            let err = RefreshToken::validate(&pool, &token).await.unwrap_err();
            assert!(matches!(err, RefreshRejection::Revoked));
        }
    }
}
