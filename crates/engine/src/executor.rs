//! Workflow execution engine.
//!
//! `WorkflowExecutor` ties the components together for callers that don't
//! want to wire them by hand:
//! 1. [`execute`](WorkflowExecutor::execute) prepares (or resumes) an
//!    execution and schedules its first nodes.
//! 2. [`ingest`](WorkflowExecutor::ingest) applies a worker's result and
//!    schedules whatever became runnable, in that execution and in any
//!    parent it completed.
//! 3. Runnable actions get their credentials injected and go to the
//!    configured [`ActionDispatcher`]; the executor never runs app code
//!    itself. Credential values are never written back to the store.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use db::Store;

use crate::auth::{AuthResolver, NoopRefresher, TokenRefresher};
use crate::compression::CompressionGuard;
use crate::dispatch::ActionDispatcher;
use crate::models::{ActionResult, Workflow, WorkflowExecution};
use crate::notify::{LogNotifier, Notifier};
use crate::persist;
use crate::preparer::{ExecInfo, ExecutionPreparer, ExecutionRequest, Preparation};
use crate::processor::{ProcessOutcome, ResultProcessor};
use crate::scheduler::Scheduler;
use crate::{EngineConfig, EngineError};

/// Result of [`WorkflowExecutor::execute`].
#[derive(Debug)]
pub enum ExecutionOutcome {
    Started { execution: WorkflowExecution, info: ExecInfo },
    Resumed { execution: WorkflowExecution },
    AlreadyExecuted,
}

pub struct WorkflowExecutor {
    store: Arc<dyn Store>,
    config: Arc<EngineConfig>,
    preparer: ExecutionPreparer,
    scheduler: Scheduler,
    processor: ResultProcessor,
    dispatcher: Arc<dyn ActionDispatcher>,
    auth: AuthResolver,
    guard: CompressionGuard,
}

impl WorkflowExecutor {
    /// Executor that logs notifications and never refreshes OAuth2 tokens.
    pub fn new(store: Arc<dyn Store>, config: Arc<EngineConfig>, dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        Self::with_parts(store, config, dispatcher, Arc::new(LogNotifier), Arc::new(NoopRefresher))
    }

    pub fn with_parts(
        store: Arc<dyn Store>,
        config: Arc<EngineConfig>,
        dispatcher: Arc<dyn ActionDispatcher>,
        notifier: Arc<dyn Notifier>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            preparer: ExecutionPreparer::new(store.clone(), config.clone(), refresher.clone()),
            auth: AuthResolver::new(store.clone(), config.clone(), refresher),
            scheduler: Scheduler::new(store.clone(), config.clone()),
            processor: ResultProcessor::new(store.clone(), config.clone(), notifier),
            guard: CompressionGuard::new(&config),
            store,
            config,
            dispatcher,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a workflow, or resume one parked on user input.
    #[instrument(skip_all, fields(workflow_id = %workflow.id))]
    pub async fn execute(&self, workflow: Workflow, request: ExecutionRequest) -> Result<ExecutionOutcome, EngineError> {
        match self.preparer.prepare(workflow, request).await? {
            Preparation::AlreadyExecuted => Ok(ExecutionOutcome::AlreadyExecuted),
            Preparation::Ready { execution, info } => {
                let execution = self.schedule(execution.execution_id).await?;
                Ok(ExecutionOutcome::Started { execution, info })
            }
            Preparation::Resumed { execution, answer } => {
                let outcome = self.processor.process(answer).await?;
                self.schedule_touched(&outcome.touched).await?;
                let execution = self.schedule(execution.execution_id).await?;
                Ok(ExecutionOutcome::Resumed { execution })
            }
        }
    }

    /// Apply a worker's result and schedule the follow-up work.
    ///
    /// The returned outcome carries the execution as it stands after
    /// scheduling.
    #[instrument(skip_all, fields(execution_id = %result.execution_id, node_id = %result.action.id))]
    pub async fn ingest(&self, result: ActionResult) -> Result<ProcessOutcome, EngineError> {
        let mut outcome = self.processor.process(result).await?;
        self.schedule_touched(&outcome.touched).await?;

        if let Some(execution) = outcome.execution.take() {
            let id = execution.execution_id;
            outcome.execution = Some(if execution.is_finished() {
                execution
            } else {
                // Even an ignored duplicate is a chance to run the repair pass.
                self.schedule(id).await?
            });
        }
        Ok(outcome)
    }

    /// Run scheduling cycles for one execution until nothing new happens.
    ///
    /// Dead nodes the scheduler finds are pushed through the result
    /// processor and the cycle repeats, so a fully dead branch settles here.
    /// Parents completed along the way are scheduled too.
    pub async fn schedule(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let mut pending = VecDeque::from([execution_id]);
        let mut latest = None;

        while let Some(id) = pending.pop_front() {
            let (execution, touched) = self.schedule_one(id).await?;
            if id == execution_id {
                latest = Some(execution);
            }
            for other in touched {
                if other != id && !pending.contains(&other) {
                    pending.push_back(other);
                }
            }
        }

        latest.ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    /// Current execution for a results poll, with offloaded fields restored.
    pub async fn get_execution(&self, execution_id: Uuid, authorization: &str) -> Result<WorkflowExecution, EngineError> {
        let mut execution = persist::load_authorized(&*self.store, execution_id, authorization).await?;
        self.guard.expand(&*self.store, &mut execution).await?;
        Ok(execution)
    }

    async fn schedule_touched(&self, touched: &[Uuid]) -> Result<(), EngineError> {
        for id in touched {
            self.schedule(*id).await?;
        }
        Ok(())
    }

    async fn schedule_one(&self, execution_id: Uuid) -> Result<(WorkflowExecution, Vec<Uuid>), EngineError> {
        let mut touched = Vec::new();
        let mut conflicts = 0;
        let mut rounds = 0;

        loop {
            let execution = persist::load_execution(&*self.store, execution_id).await?;
            let limit = execution.workflow.actions.len() + execution.workflow.triggers.len() + 1;

            let decision = match self.scheduler.next_actions(execution).await {
                Ok(decision) => decision,
                Err(e) if persist::is_conflict(&e) && conflicts < self.config.max_write_conflicts => {
                    conflicts += 1;
                    debug!(attempt = conflicts, "Execution changed during scheduling; retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !decision.dispatch.is_empty() {
                // Credentials only ever live in the outgoing copy.
                let mut actions = decision.dispatch;
                self.auth.inject_all(&decision.execution.org_id, &mut actions).await;
                self.dispatcher.dispatch(&decision.execution, &actions).await?;
            }
            if decision.skipped.is_empty() {
                return Ok((decision.execution, touched));
            }

            for skipped in decision.skipped {
                let outcome = self.processor.process(skipped).await?;
                touched.extend(outcome.touched.into_iter().filter(|t| *t != execution_id));
            }

            rounds += 1;
            if rounds >= limit {
                warn!(rounds, "Scheduling did not settle; leaving the rest to the next event");
                let execution = persist::load_execution(&*self.store, execution_id).await?;
                return Ok((execution, touched));
            }
        }
    }
}
