//! Organization, environment and credential lookups.

use sqlx::PgPool;

use crate::{
    DbError,
    models::{AppAuthRow, EnvironmentRow, OrgRow},
};

pub async fn get_org(pool: &PgPool, org_id: &str) -> Result<OrgRow, DbError> {
    sqlx::query_as::<_, OrgRow>("SELECT id, name FROM orgs WHERE id = $1")
        .bind(org_id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn get_environments(pool: &PgPool, org_id: &str) -> Result<Vec<EnvironmentRow>, DbError> {
    let rows = sqlx::query_as::<_, EnvironmentRow>(
        r#"
        SELECT id, org_id, name, env_type, is_default, archived
        FROM environments
        WHERE org_id = $1
        ORDER BY name
        "#,
    )
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

const AUTH_COLUMNS: &str =
    "id, org_id, label, app_name, active, auth_type, encrypted, fields, created";

pub async fn get_app_auth(pool: &PgPool, org_id: &str, id: &str) -> Result<Option<AppAuthRow>, DbError> {
    let row = sqlx::query_as::<_, AppAuthRow>(&format!(
        "SELECT {AUTH_COLUMNS} FROM app_auth WHERE org_id = $1 AND id = $2"
    ))
    .bind(org_id)
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

pub async fn get_all_app_auth(pool: &PgPool, org_id: &str) -> Result<Vec<AppAuthRow>, DbError> {
    let rows = sqlx::query_as::<_, AppAuthRow>(&format!(
        "SELECT {AUTH_COLUMNS} FROM app_auth WHERE org_id = $1 ORDER BY label"
    ))
    .bind(org_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn upsert_app_auth(pool: &PgPool, row: &AppAuthRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO app_auth (id, org_id, label, app_name, active, auth_type, encrypted, fields, created)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (org_id, id) DO UPDATE
            SET label = EXCLUDED.label,
                active = EXCLUDED.active,
                auth_type = EXCLUDED.auth_type,
                encrypted = EXCLUDED.encrypted,
                fields = EXCLUDED.fields
        "#,
    )
    .bind(&row.id)
    .bind(&row.org_id)
    .bind(&row.label)
    .bind(&row.app_name)
    .bind(row.active)
    .bind(&row.auth_type)
    .bind(row.encrypted)
    .bind(&row.fields)
    .bind(row.created)
    .execute(pool)
    .await?;

    Ok(())
}
