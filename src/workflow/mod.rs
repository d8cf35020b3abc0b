use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::shared::schema::{workflow_runs, workflow_steps};
use crate::shared::utils::DbPool;

pub mod sla;
pub mod triage;

pub const RUN_PENDING: &str = "pending";
pub const RUN_RUNNING: &str = "running";
pub const RUN_SLEEPING: &str = "sleeping";
pub const RUN_COMPLETED: &str = "completed";
pub const RUN_FAILED: &str = "failed";

pub const STEP_COMPLETED: &str = "completed";
pub const STEP_SLEEPING: &str = "sleeping";

const MAX_BACKOFF_SECS: i64 = 300;
const CLAIM_BATCH: i64 = 32;

/// Outcome taxonomy for a single run invocation. `Suspended` is control
/// flow, not a failure: the run parks until `wake_at` and is re-invoked.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Business error that retrying cannot fix; dead-letters immediately.
    #[error("{0}")]
    Fatal(String),
    /// Transient failure, retried against the run's attempt budget.
    #[error("{0}")]
    Retryable(String),
    #[error("suspended until {wake_at}")]
    Suspended { wake_at: DateTime<Utc> },
}

impl From<diesel::result::Error> for RunError {
    fn from(e: diesel::result::Error) -> Self {
        RunError::Retryable(format!("store error: {e}"))
    }
}

impl From<diesel::r2d2::PoolError> for RunError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        RunError::Retryable(format!("pool error: {e}"))
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = workflow_runs)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow: String,
    pub trigger_event: String,
    pub payload: Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub wake_at: DateTime<Utc>,
    pub output: Option<Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = workflow_runs)]
struct NewWorkflowRun {
    id: Uuid,
    workflow: String,
    trigger_event: String,
    payload: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    wake_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = workflow_steps)]
struct NewWorkflowStep {
    id: Uuid,
    run_id: Uuid,
    step_name: String,
    status: String,
    output: Option<Value>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn execute(&self, ctx: &StepContext, payload: Value) -> Result<Value, RunError>;
}

pub struct Registration {
    pub workflow: &'static str,
    pub trigger_event: &'static str,
    /// Total attempt budget: the first invocation plus retries.
    pub max_attempts: i32,
    pub handler: Arc<dyn WorkflowHandler>,
}

/// Durable, event-triggered workflow executor. Runs are rows in
/// `workflow_runs`; completed steps are memoized in `workflow_steps` so a
/// re-invoked handler replays past work instead of repeating side effects.
pub struct Engine {
    pool: DbPool,
    registrations: Vec<Registration>,
    nudge_tx: mpsc::Sender<()>,
    nudge_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    poll_interval: std::time::Duration,
}

impl Engine {
    pub fn new(pool: DbPool) -> Self {
        let (nudge_tx, nudge_rx) = mpsc::channel(64);
        Self {
            pool,
            registrations: Vec::new(),
            nudge_tx,
            nudge_rx: std::sync::Mutex::new(Some(nudge_rx)),
            poll_interval: std::time::Duration::from_secs(1),
        }
    }

    pub fn register(&mut self, reg: Registration) {
        self.registrations.push(reg);
    }

    /// Trigger an event: one pending run per registration listening on it.
    pub fn dispatch(&self, event: &str, payload: Value) -> Result<usize, RunError> {
        let mut conn = self.pool.get()?;
        let count = self.enqueue_runs(&mut conn, event, &payload)?;
        self.nudge();
        Ok(count)
    }

    fn enqueue_runs(
        &self,
        conn: &mut PgConnection,
        event: &str,
        payload: &Value,
    ) -> Result<usize, diesel::result::Error> {
        let now = Utc::now();
        let mut count = 0;
        for reg in self.registrations.iter().filter(|r| r.trigger_event == event) {
            diesel::insert_into(workflow_runs::table)
                .values(&NewWorkflowRun {
                    id: Uuid::new_v4(),
                    workflow: reg.workflow.to_string(),
                    trigger_event: event.to_string(),
                    payload: payload.clone(),
                    status: RUN_PENDING.to_string(),
                    attempts: 0,
                    max_attempts: reg.max_attempts,
                    wake_at: now,
                    created_at: now,
                    updated_at: now,
                })
                .execute(conn)?;
            count += 1;
        }
        Ok(count)
    }

    fn nudge(&self) {
        let _ = self.nudge_tx.try_send(());
    }

    /// Spawn the executor loop: wakes on dispatch nudges and on a steady
    /// poll tick for timer-driven runs (retries, durable sleeps).
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let rx = self.nudge_rx.lock().ok().and_then(|mut g| g.take());
        let Some(mut rx) = rx else {
            warn!("workflow engine already started");
            return tokio::spawn(async {});
        };
        if let Err(e) = self.recover_stranded() {
            error!("failed to recover stranded runs: {e}");
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("workflow engine started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = rx.recv() => {}
                }
                if let Err(e) = engine.drain_due().await {
                    error!("workflow executor error: {e}");
                }
            }
        })
    }

    /// Re-arm runs left in `running` by a previous process. Only `settle`
    /// moves a run out of `running`, so at boot any such row is stale.
    fn recover_stranded(&self) -> Result<(), RunError> {
        let mut conn = self.pool.get()?;
        let now = Utc::now();
        let recovered = diesel::update(
            workflow_runs::table.filter(workflow_runs::status.eq(RUN_RUNNING)),
        )
        .set((
            workflow_runs::status.eq(RUN_PENDING),
            workflow_runs::wake_at.eq(now),
            workflow_runs::updated_at.eq(now),
        ))
        .execute(&mut conn)?;
        if recovered > 0 {
            warn!("re-armed {recovered} runs stranded in running state");
        }
        Ok(())
    }

    async fn drain_due(self: &Arc<Self>) -> Result<(), RunError> {
        loop {
            let claimed = self.claim_due()?;
            if claimed.is_empty() {
                return Ok(());
            }
            for run in claimed {
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.execute_run(run).await;
                });
            }
        }
    }

    /// Atomically move due runs to `running`. The guarded status check makes
    /// the claim exclusive, so a run is never re-entered concurrently.
    fn claim_due(&self) -> Result<Vec<WorkflowRun>, RunError> {
        let mut conn = self.pool.get()?;
        let now = Utc::now();

        let candidates: Vec<WorkflowRun> = workflow_runs::table
            .filter(workflow_runs::wake_at.le(now))
            .filter(
                workflow_runs::status
                    .eq(RUN_PENDING)
                    .or(workflow_runs::status.eq(RUN_SLEEPING)),
            )
            .order(workflow_runs::wake_at.asc())
            .limit(CLAIM_BATCH)
            .load(&mut conn)?;

        let mut claimed = Vec::new();
        for run in candidates {
            let taken = diesel::update(
                workflow_runs::table
                    .find(run.id)
                    .filter(workflow_runs::status.eq(&run.status)),
            )
            .set((
                workflow_runs::status.eq(RUN_RUNNING),
                workflow_runs::updated_at.eq(now),
            ))
            .execute(&mut conn)?;
            if taken != 1 {
                continue;
            }
            if run.status == RUN_SLEEPING {
                // The wake deadline has passed: mark parked sleeps complete
                // so the handler replays through them on re-invocation.
                diesel::update(
                    workflow_steps::table
                        .filter(workflow_steps::run_id.eq(run.id))
                        .filter(workflow_steps::status.eq(STEP_SLEEPING)),
                )
                .set((
                    workflow_steps::status.eq(STEP_COMPLETED),
                    workflow_steps::completed_at.eq(Some(now)),
                ))
                .execute(&mut conn)?;
            }
            claimed.push(run);
        }
        Ok(claimed)
    }

    async fn execute_run(self: Arc<Self>, run: WorkflowRun) {
        let Some(reg) = self
            .registrations
            .iter()
            .find(|r| r.workflow == run.workflow)
        else {
            error!("no handler registered for workflow {}", run.workflow);
            let _ = self.settle(&run, Err(RunError::Fatal("no handler registered".into())));
            return;
        };

        // The handler runs in its own task so a panic surfaces as a join
        // error and the run still settles as retryable.
        let handler = Arc::clone(&reg.handler);
        let engine = Arc::clone(&self);
        let run_id = run.id;
        let payload = run.payload.clone();
        let invocation = tokio::spawn(async move {
            let ctx = StepContext { engine, run_id };
            handler.execute(&ctx, payload).await
        });
        let result = match invocation.await {
            Ok(result) => result,
            Err(e) => Err(RunError::Retryable(format!("handler panicked: {e}"))),
        };
        if let Err(e) = self.settle(&run, result) {
            error!("failed to settle run {}: {e}", run.id);
        }
    }

    fn settle(&self, run: &WorkflowRun, result: Result<Value, RunError>) -> Result<(), RunError> {
        let mut conn = self.pool.get()?;
        let now = Utc::now();
        let target = workflow_runs::table.find(run.id);

        match result {
            Ok(output) => {
                diesel::update(target)
                    .set((
                        workflow_runs::status.eq(RUN_COMPLETED),
                        workflow_runs::output.eq(Some(output)),
                        workflow_runs::updated_at.eq(now),
                    ))
                    .execute(&mut conn)?;
                info!("run {} ({}) completed", run.id, run.workflow);
            }
            Err(RunError::Suspended { wake_at }) => {
                diesel::update(target)
                    .set((
                        workflow_runs::status.eq(RUN_SLEEPING),
                        workflow_runs::wake_at.eq(wake_at),
                        workflow_runs::updated_at.eq(now),
                    ))
                    .execute(&mut conn)?;
            }
            Err(RunError::Fatal(msg)) => {
                diesel::update(target)
                    .set((
                        workflow_runs::status.eq(RUN_FAILED),
                        workflow_runs::last_error.eq(Some(msg.as_str())),
                        workflow_runs::updated_at.eq(now),
                    ))
                    .execute(&mut conn)?;
                warn!("run {} ({}) failed fatally: {msg}", run.id, run.workflow);
            }
            Err(RunError::Retryable(msg)) => {
                let attempts = run.attempts + 1;
                if attempts >= run.max_attempts {
                    diesel::update(target)
                        .set((
                            workflow_runs::status.eq(RUN_FAILED),
                            workflow_runs::attempts.eq(attempts),
                            workflow_runs::last_error.eq(Some(msg.as_str())),
                            workflow_runs::updated_at.eq(now),
                        ))
                        .execute(&mut conn)?;
                    warn!(
                        "run {} ({}) dead-lettered after {attempts} attempts: {msg}",
                        run.id, run.workflow
                    );
                } else {
                    let delay = backoff(attempts);
                    diesel::update(target)
                        .set((
                            workflow_runs::status.eq(RUN_PENDING),
                            workflow_runs::attempts.eq(attempts),
                            workflow_runs::wake_at.eq(now + delay),
                            workflow_runs::last_error.eq(Some(msg.as_str())),
                            workflow_runs::updated_at.eq(now),
                        ))
                        .execute(&mut conn)?;
                    warn!(
                        "run {} ({}) attempt {attempts} failed, retrying in {}s: {msg}",
                        run.id,
                        run.workflow,
                        delay.num_seconds()
                    );
                }
            }
        }
        Ok(())
    }
}

/// Exponential backoff for step retries, capped at five minutes.
pub fn backoff(attempt: i32) -> Duration {
    let shift = attempt.clamp(0, 6) as u32;
    let secs = (5i64 << shift).min(MAX_BACKOFF_SECS);
    Duration::seconds(secs)
}

/// Per-run view handed to workflow handlers: named steps are memoized by
/// `(run_id, step_name)`; sleeps and event emissions are durable.
pub struct StepContext {
    engine: Arc<Engine>,
    run_id: Uuid,
}

impl StepContext {
    pub fn conn(
        &self,
    ) -> Result<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<PgConnection>>, RunError>
    {
        Ok(self.engine.pool.get()?)
    }

    /// Execute a named step once. A completed step's recorded output is
    /// returned on replay without re-running the body.
    pub async fn run<T, Fut>(&self, name: &str, f: impl FnOnce() -> Fut) -> Result<T, RunError>
    where
        T: Serialize + DeserializeOwned,
        Fut: Future<Output = Result<T, RunError>>,
    {
        if let Some(recorded) = self.recorded_output(name)? {
            return serde_json::from_value(recorded)
                .map_err(|e| RunError::Fatal(format!("corrupt output for step {name}: {e}")));
        }

        let out = f().await?;
        let value = serde_json::to_value(&out)
            .map_err(|e| RunError::Fatal(format!("unserializable output for step {name}: {e}")))?;

        let now = Utc::now();
        let mut conn = self.conn()?;
        diesel::insert_into(workflow_steps::table)
            .values(&NewWorkflowStep {
                id: Uuid::new_v4(),
                run_id: self.run_id,
                step_name: name.to_string(),
                status: STEP_COMPLETED.to_string(),
                output: Some(value),
                completed_at: Some(now),
                created_at: now,
            })
            .on_conflict((workflow_steps::run_id, workflow_steps::step_name))
            .do_nothing()
            .execute(&mut conn)?;
        Ok(out)
    }

    /// Durable delay. First execution parks the run and suspends; once the
    /// engine wakes it, the replayed call falls through.
    pub fn sleep(&self, name: &str, duration: Duration) -> Result<(), RunError> {
        let mut conn = self.conn()?;
        let existing: Option<(String, Option<Value>)> = workflow_steps::table
            .filter(workflow_steps::run_id.eq(self.run_id))
            .filter(workflow_steps::step_name.eq(name))
            .select((workflow_steps::status, workflow_steps::output))
            .first(&mut conn)
            .optional()?;

        match existing {
            Some((status, _)) if status == STEP_COMPLETED => Ok(()),
            Some((_, output)) => {
                // Parked but re-entered (crash between park and settle):
                // re-issue the original deadline.
                let wake_at = output
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_else(|| Utc::now() + duration);
                Err(RunError::Suspended { wake_at })
            }
            None => {
                let now = Utc::now();
                let wake_at = now + duration;
                diesel::insert_into(workflow_steps::table)
                    .values(&NewWorkflowStep {
                        id: Uuid::new_v4(),
                        run_id: self.run_id,
                        step_name: name.to_string(),
                        status: STEP_SLEEPING.to_string(),
                        output: Some(serde_json::json!(wake_at)),
                        completed_at: None,
                        created_at: now,
                    })
                    .on_conflict((workflow_steps::run_id, workflow_steps::step_name))
                    .do_nothing()
                    .execute(&mut conn)?;
                Err(RunError::Suspended { wake_at })
            }
        }
    }

    /// Emit an event as a recorded step. The triggered runs are created in
    /// the same transaction as the step row, so a replayed step never
    /// re-emits.
    pub fn send_event(&self, name: &str, event: &str, payload: Value) -> Result<(), RunError> {
        if self.step_completed(name)? {
            return Ok(());
        }
        let now = Utc::now();
        let mut conn = self.conn()?;
        conn.transaction(|conn| {
            diesel::insert_into(workflow_steps::table)
                .values(&NewWorkflowStep {
                    id: Uuid::new_v4(),
                    run_id: self.run_id,
                    step_name: name.to_string(),
                    status: STEP_COMPLETED.to_string(),
                    output: Some(payload.clone()),
                    completed_at: Some(now),
                    created_at: now,
                })
                .execute(conn)?;
            self.engine.enqueue_runs(conn, event, &payload)?;
            Ok::<_, diesel::result::Error>(())
        })?;
        self.engine.nudge();
        Ok(())
    }

    fn recorded_output(&self, name: &str) -> Result<Option<Value>, RunError> {
        let mut conn = self.conn()?;
        let row: Option<Option<Value>> = workflow_steps::table
            .filter(workflow_steps::run_id.eq(self.run_id))
            .filter(workflow_steps::step_name.eq(name))
            .filter(workflow_steps::status.eq(STEP_COMPLETED))
            .select(workflow_steps::output)
            .first(&mut conn)
            .optional()?;
        Ok(row.flatten())
    }

    fn step_completed(&self, name: &str) -> Result<bool, RunError> {
        let mut conn = self.conn()?;
        let count: i64 = workflow_steps::table
            .filter(workflow_steps::run_id.eq(self.run_id))
            .filter(workflow_steps::step_name.eq(name))
            .filter(workflow_steps::status.eq(STEP_COMPLETED))
            .count()
            .get_result(&mut conn)?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(1).num_seconds(), 10);
        assert_eq!(backoff(2).num_seconds(), 20);
        assert_eq!(backoff(3).num_seconds(), 40);
        assert_eq!(backoff(10).num_seconds(), 300);
    }

    #[test]
    fn store_errors_map_to_retryable() {
        let e: RunError = diesel::result::Error::NotFound.into();
        assert!(matches!(e, RunError::Retryable(_)));
    }
}
