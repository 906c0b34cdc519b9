//! Admin bootstrap and the `codehub-server user` CLI subcommands (spec §6
//! "Admin bootstrap" / §4.L). Every mutation here goes through the same
//! `SessionRepo`/`hash_password` the HTTP login path uses, so a
//! CLI-created user is indistinguishable from one the API would create.

use sqlx::PgPool;

use codehub_core::database::SessionRepo;
use codehub_core::ids::UserId;

use crate::auth::password::hash_password;

/// Creates the configured admin user only if the `users` table is empty, so
/// re-running this on every startup is a no-op once any operator account
/// exists (including one created later through `user create`).
pub async fn bootstrap(pool: &PgPool, username: &str, password: &str) -> anyhow::Result<()> {
    let existing = SessionRepo::list_users(pool).await?;
    if !existing.is_empty() {
        return Ok(());
    }
    let password_hash = hash_password(password).map_err(|err| anyhow::anyhow!(err.to_string()))?;
    SessionRepo::create_user(pool, UserId::new(), username, &password_hash).await?;
    tracing::info!(username, "bootstrapped admin user");
    Ok(())
}

pub async fn create_user(pool: &PgPool, username: &str, password: &str) -> anyhow::Result<()> {
    let password_hash = hash_password(password).map_err(|err| anyhow::anyhow!(err.to_string()))?;
    let user = SessionRepo::create_user(pool, UserId::new(), username, &password_hash).await?;
    println!("created user {} ({})", user.username, user.id);
    Ok(())
}

pub async fn reset_password(pool: &PgPool, username: &str, password: &str) -> anyhow::Result<()> {
    let Some(user) = SessionRepo::find_user_by_username(pool, username).await? else {
        anyhow::bail!("no such user: {username}");
    };
    let password_hash = hash_password(password).map_err(|err| anyhow::anyhow!(err.to_string()))?;
    SessionRepo::update_password(pool, user.id, &password_hash).await?;
    println!("password reset for {username}");
    Ok(())
}

pub async fn list_users(pool: &PgPool) -> anyhow::Result<()> {
    let users = SessionRepo::list_users(pool).await?;
    for user in users {
        println!("{}\t{}\t{}", user.id, user.username, user.created_at);
    }
    Ok(())
}

pub async fn delete_user(pool: &PgPool, username: &str) -> anyhow::Result<()> {
    let Some(user) = SessionRepo::find_user_by_username(pool, username).await? else {
        anyhow::bail!("no such user: {username}");
    };
    let deleted = SessionRepo::delete_user(pool, user.id).await?;
    if deleted {
        println!("deleted user {username}");
    }
    Ok(())
}
