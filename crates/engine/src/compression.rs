//! Keeps execution documents under the store's size ceiling.
//!
//! Oversized fields (the execution argument and individual result bodies)
//! are moved to blob storage and replaced in place by a small stub:
//!
//! ```json
//! {"extra": "replace", "size": 2000000, "id": "<blob key>"}
//! ```
//!
//! [`CompressionGuard::expand`] puts them back for readers that need the
//! full document. Looping subflow slot lists always stay inline: child
//! results are merged into them straight from the stored row.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use db::Store;

use crate::models::{ResultBody, WorkflowExecution};
use crate::subflow::parse_slots;
use crate::{EngineConfig, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Argument,
    Result(usize),
}

#[derive(Debug, Clone)]
pub struct CompressionGuard {
    ceiling: usize,
    threshold: usize,
}

impl CompressionGuard {
    pub fn new(config: &EngineConfig) -> Self {
        Self { ceiling: config.compression_ceiling, threshold: config.compression_field_threshold }
    }

    /// Stub out oversized fields if the document exceeds the ceiling.
    ///
    /// Returns `true` if anything was moved. A no-op under the ceiling.
    pub async fn compress(&self, store: &dyn Store, execution: &mut WorkflowExecution) -> Result<bool, EngineError> {
        let size = document_size(execution)?;
        if size <= self.ceiling {
            return Ok(false);
        }

        let mut candidates: Vec<(Field, usize)> = fields(execution)
            .into_iter()
            .filter_map(|f| {
                let body = body(execution, f);
                (!is_stub(body) && !is_slot_list(f, body)).then(|| (f, body.len()))
            })
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut moved = 0usize;
        let mut remaining = size;
        for (field, len) in candidates {
            // Everything above the threshold goes; below it, only as much
            // as it takes to get under the ceiling.
            if len <= self.threshold && remaining <= self.ceiling {
                break;
            }
            remaining = remaining.saturating_sub(self.offload(store, execution, field).await?);
            moved += 1;
        }

        let compressed = document_size(execution)?;
        info!(
            execution_id = %execution.execution_id,
            before = size,
            after = compressed,
            fields = moved,
            "Compressed execution"
        );
        if compressed > self.ceiling {
            warn!(execution_id = %execution.execution_id, size = compressed, "Execution still above ceiling after compression");
        }
        Ok(moved > 0)
    }

    /// Replace every stub with the blob it points to.
    pub async fn expand(&self, store: &dyn Store, execution: &mut WorkflowExecution) -> Result<(), EngineError> {
        for field in fields(execution) {
            let Some(key) = stub_key(body(execution, field)) else {
                continue;
            };
            match store.get_blob(&key).await? {
                Some(data) => {
                    *body_mut(execution, field) = ResultBody::Raw(String::from_utf8_lossy(&data).into_owned());
                }
                None => warn!(execution_id = %execution.execution_id, %key, "Blob for stubbed field is missing"),
            }
        }
        Ok(())
    }

    /// Move one field to blob storage; returns the bytes saved.
    async fn offload(&self, store: &dyn Store, execution: &mut WorkflowExecution, field: Field) -> Result<usize, EngineError> {
        let key = match field {
            Field::Argument => format!("{}_argument", execution.execution_id),
            Field::Result(i) => format!("{}_{}_result", execution.execution_id, execution.results[i].action.id),
        };

        let text = body(execution, field).text().into_owned();
        let size = text.len();
        store.put_blob(&key, text.into_bytes()).await?;

        let stub = ResultBody::Structured(json!({ "extra": "replace", "size": size, "id": key }));
        let saved = size.saturating_sub(stub.len());
        debug!(execution_id = %execution.execution_id, %key, size, "Moved field to blob storage");
        *body_mut(execution, field) = stub;
        Ok(saved)
    }
}

fn document_size(execution: &WorkflowExecution) -> Result<usize, EngineError> {
    Ok(serde_json::to_vec(execution)?.len())
}

fn fields(execution: &WorkflowExecution) -> Vec<Field> {
    std::iter::once(Field::Argument)
        .chain((0..execution.results.len()).map(Field::Result))
        .collect()
}

fn body(execution: &WorkflowExecution, field: Field) -> &ResultBody {
    match field {
        Field::Argument => &execution.execution_argument,
        Field::Result(i) => &execution.results[i].result,
    }
}

fn body_mut(execution: &mut WorkflowExecution, field: Field) -> &mut ResultBody {
    match field {
        Field::Argument => &mut execution.execution_argument,
        Field::Result(i) => &mut execution.results[i].result,
    }
}

fn stub_key(body: &ResultBody) -> Option<String> {
    // Stubs are tiny; don't parse real payloads just to rule them out.
    if body.len() > 512 {
        return None;
    }
    match body.parse()? {
        Value::Object(map) if map.get("extra").and_then(Value::as_str) == Some("replace") => {
            map.get("id").and_then(Value::as_str).map(str::to_owned)
        }
        _ => None,
    }
}

fn is_stub(body: &ResultBody) -> bool {
    stub_key(body).is_some()
}

fn is_slot_list(field: Field, body: &ResultBody) -> bool {
    matches!(field, Field::Result(_)) && parse_slots(body).is_some()
}
