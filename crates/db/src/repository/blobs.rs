//! Blob storage for oversized execution fields.

use sqlx::PgPool;

use crate::DbError;

pub async fn put_blob(pool: &PgPool, key: &str, data: &[u8]) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO blobs (key, data) VALUES ($1, $2)
        ON CONFLICT (key) DO UPDATE SET data = EXCLUDED.data
        "#,
    )
    .bind(key)
    .bind(data)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_blob(pool: &PgPool, key: &str) -> Result<Option<Vec<u8>>, DbError> {
    let data: Option<Vec<u8>> = sqlx::query_scalar("SELECT data FROM blobs WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(data)
}
