//! Session and user persistence. Login issues one session per user (spec
//! §4.L scenario 8): creating a new one revokes whatever the user already
//! held, done inside a transaction so a login never races a concurrent
//! login into two simultaneously-valid sessions.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::{Session, User};
use crate::error::Result;
use crate::ids::{SessionId, UserId};

pub struct SessionRepo;

impl SessionRepo {
    pub async fn find_user_by_username(pool: &PgPool, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, created_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(pool)
        .await?;
        Ok(user)
    }

    pub async fn create_user(pool: &PgPool, id: UserId, username: &str, password_hash: &str) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (id, username, password_hash) VALUES ($1, $2, $3)
             RETURNING id, username, password_hash, created_at",
        )
        .bind(id)
        .bind(username)
        .bind(password_hash)
        .fetch_one(pool)
        .await?;
        Ok(user)
    }

    /// Revokes any session the user currently holds, then inserts the new
    /// one, atomically -- the single-session-per-user invariant.
    pub async fn create_session(
        pool: &PgPool,
        id: SessionId,
        user_id: UserId,
        expires_at: DateTime<Utc>,
    ) -> Result<Session> {
        let mut tx = pool.begin().await?;
        sqlx::query("UPDATE sessions SET revoked_at = now() WHERE user_id = $1 AND revoked_at IS NULL")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        let session = sqlx::query_as::<_, Session>(
            "INSERT INTO sessions (id, user_id, expires_at) VALUES ($1, $2, $3)
             RETURNING id, user_id, expires_at, revoked_at",
        )
        .bind(id)
        .bind(user_id)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(session)
    }

    pub async fn find_user_by_id(pool: &PgPool, id: UserId) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(user)
    }

    pub async fn find(pool: &PgPool, id: SessionId) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT id, user_id, expires_at, revoked_at FROM sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(session)
    }

    pub async fn revoke(pool: &PgPool, id: SessionId) -> Result<()> {
        sqlx::query("UPDATE sessions SET revoked_at = now() WHERE id = $1 AND revoked_at IS NULL")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// `codehub-server user list`.
    pub async fn list_users(pool: &PgPool) -> Result<Vec<User>> {
        let users = sqlx::query_as::<_, User>(
            "SELECT id, username, password_hash, created_at FROM users ORDER BY username",
        )
        .fetch_all(pool)
        .await?;
        Ok(users)
    }

    /// `codehub-server user delete`. Cascades to the user's sessions; their
    /// workspaces are untouched since `owner_user_id` is `ON DELETE RESTRICT`
    /// and deletion of a user with existing workspaces must be refused by the
    /// caller first.
    pub async fn delete_user(pool: &PgPool, id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1").bind(id).execute(pool).await?;
        Ok(result.rows_affected() > 0)
    }

    /// `codehub-server user reset-password`.
    pub async fn update_password(pool: &PgPool, id: UserId, password_hash: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(password_hash)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
