//! Short-TTL key/value cache persisted in `cache_entries`.
//!
//! Expired rows are filtered on read and purged opportunistically on write.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;

use crate::DbError;

pub async fn get_cache(pool: &PgPool, key: &str) -> Result<Option<String>, DbError> {
    let value: Option<String> = sqlx::query_scalar(
        "SELECT value FROM cache_entries WHERE key = $1 AND expires_at > $2",
    )
    .bind(key)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;

    Ok(value)
}

pub async fn set_cache(pool: &PgPool, key: &str, value: &str, ttl: Duration) -> Result<(), DbError> {
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));

    sqlx::query(
        r#"
        INSERT INTO cache_entries (key, value, expires_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(now + ttl)
    .execute(pool)
    .await?;

    sqlx::query("DELETE FROM cache_entries WHERE expires_at <= $1")
        .bind(now)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn delete_cache(pool: &PgPool, key: &str) -> Result<(), DbError> {
    sqlx::query("DELETE FROM cache_entries WHERE key = $1")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}
