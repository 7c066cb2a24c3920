//! Credential resolution for actions.
//!
//! Looks up the credential record an action references, decrypts its
//! fields, refreshes OAuth2 access tokens that are about to expire, and
//! injects the resolved values as (sensitive) action parameters.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use db::models::{AppAuthRow, AuthFieldRow};
use db::Store;

use crate::crypto::{decrypt_field, derive_key, encrypt_field};
use crate::models::{set_parameter, Action, Parameter};
use crate::{EngineConfig, EngineError};

/// Fields that are bookkeeping, not parameters.
const INTERNAL_FIELDS: &[&str] = &["expiration", "token_uri", "client_secret", "refresh_token"];

/// A fresh OAuth2 token pair.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: i64,
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, fields: &HashMap<String, String>) -> Result<RefreshedToken, EngineError>;
}

/// Refresher for deployments without outbound OAuth2 access.
pub struct NoopRefresher;

#[async_trait]
impl TokenRefresher for NoopRefresher {
    async fn refresh(&self, _fields: &HashMap<String, String>) -> Result<RefreshedToken, EngineError> {
        Err(EngineError::Credential("token refresh is not configured".into()))
    }
}

/// Why an action's credential couldn't be resolved.
#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error("authentication '{0}' does not exist")]
    Missing(String),

    #[error("authentication '{0}' is inactive")]
    Inactive(String),

    #[error(transparent)]
    Broken(#[from] EngineError),
}

pub struct AuthResolver {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
    refresher: Arc<dyn TokenRefresher>,
}

impl AuthResolver {
    pub fn new(store: Arc<dyn Store>, config: Arc<EngineConfig>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self { store, config, refresher }
    }

    /// Resolve `action.authentication_id` and inject its fields.
    ///
    /// Actions without an authentication id are left untouched.
    pub async fn resolve(&self, org_id: &str, action: &mut Action) -> Result<(), AuthFailure> {
        if action.authentication_id.is_empty() {
            return Ok(());
        }

        let auth_id = action.authentication_id.clone();
        let record = self
            .store
            .get_app_auth(org_id, &auth_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| AuthFailure::Missing(auth_id.clone()))?;

        if !record.active {
            return Err(AuthFailure::Inactive(auth_id));
        }

        let mut fields = self.decrypt_fields(&record)?;

        if record.auth_type == "oauth2" && self.expires_soon(&fields) {
            match self.refresher.refresh(&fields).await {
                Ok(token) => {
                    info!(auth_id = %record.id, "Refreshed OAuth2 access token");
                    fields.insert("access_token".into(), token.access_token);
                    fields.insert("expiration".into(), token.expires_at.to_string());
                    if let Some(refresh) = token.refresh_token {
                        fields.insert("refresh_token".into(), refresh);
                    }
                    if let Err(e) = self.store_fields(&record, &fields).await {
                        warn!(auth_id = %record.id, error = %e, "Failed persisting refreshed token");
                    }
                }
                // A stale token is still worth a try; the app reports the real failure.
                Err(e) => warn!(auth_id = %record.id, error = %e, "OAuth2 refresh failed"),
            }
        }

        let mut names: Vec<&String> = fields.keys().collect();
        names.sort();
        for name in names {
            if INTERNAL_FIELDS.contains(&name.as_str()) {
                continue;
            }
            set_parameter(
                &mut action.parameters,
                Parameter { name: name.clone(), value: fields[name].clone(), configuration: true },
            );
        }

        debug!(action_id = %action.id, auth_id = %record.id, "Injected credential parameters");
        Ok(())
    }

    /// Inject credentials into actions about to be handed to workers.
    ///
    /// A credential that stopped resolving since preparation is logged and
    /// the action goes out without it; the app reports the failure.
    pub async fn inject_all(&self, org_id: &str, actions: &mut [Action]) {
        for action in actions {
            if let Err(failure) = self.resolve(org_id, action).await {
                warn!(action_id = %action.id, error = %failure, "Dispatching without credentials");
            }
        }
    }

    fn expires_soon(&self, fields: &HashMap<String, String>) -> bool {
        let Some(expiration) = fields.get("expiration").and_then(|e| e.parse::<i64>().ok()) else {
            return false;
        };
        let window = self.config.oauth2_refresh_window.as_secs() as i64;
        expiration - Utc::now().timestamp() < window
    }

    fn field_key(&self, record: &AppAuthRow, field: &str) -> [u8; 32] {
        derive_key(&self.config.encryption_key, &record.org_id, record.created, &record.id, field)
    }

    fn decrypt_fields(&self, record: &AppAuthRow) -> Result<HashMap<String, String>, EngineError> {
        record
            .fields
            .0
            .iter()
            .map(|f| -> Result<(String, String), EngineError> {
                let value = if record.encrypted {
                    decrypt_field(&self.field_key(record, &f.key), &f.value)?
                } else {
                    f.value.clone()
                };
                Ok((f.key.clone(), value))
            })
            .collect()
    }

    async fn store_fields(&self, record: &AppAuthRow, fields: &HashMap<String, String>) -> Result<(), EngineError> {
        let mut updated = record.clone();
        let mut rows = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let value = if record.encrypted {
                encrypt_field(&self.field_key(record, key), value)?
            } else {
                value.clone()
            };
            rows.push(AuthFieldRow { key: key.clone(), value });
        }
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        updated.fields.0 = rows;
        self.store.set_app_auth(updated).await?;
        Ok(())
    }
}

/// Seal a plaintext credential for storage. Used when importing records.
pub fn seal_record(config: &EngineConfig, record: &mut AppAuthRow) -> Result<(), EngineError> {
    if record.encrypted {
        return Ok(());
    }
    for field in &mut record.fields.0 {
        let key = derive_key(&config.encryption_key, &record.org_id, record.created, &record.id, &field.key);
        field.value = encrypt_field(&key, &field.value)?;
    }
    record.encrypted = true;
    Ok(())
}
