#[cfg(test)]
mod workflow_engine_integration_tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use diesel::prelude::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    use ticketserver::shared::schema::{workflow_runs, workflow_steps};
    use ticketserver::shared::utils::{create_conn, run_migrations, DbPool};
    use ticketserver::workflow::{
        Engine, Registration, RunError, StepContext, WorkflowHandler, WorkflowRun, RUN_COMPLETED,
        RUN_RUNNING,
    };

    const COUNTER_WORKFLOW: &str = "durable-counter";
    const FOLLOWUP_WORKFLOW: &str = "followup-recorder";
    const FLAKY_WORKFLOW: &str = "flaky-once";
    const STRANDED_WORKFLOW: &str = "stranded-check";
    const TEST_WORKFLOWS: &[&str] = &[
        COUNTER_WORKFLOW,
        FOLLOWUP_WORKFLOW,
        FLAKY_WORKFLOW,
        STRANDED_WORKFLOW,
    ];

    /// Counts closure executions, then parks on a durable sleep and emits a
    /// follow-up event. On replay the recorded step output must come back
    /// without the closure running again.
    struct CountingHandler {
        executions: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkflowHandler for CountingHandler {
        async fn execute(&self, ctx: &StepContext, _payload: Value) -> Result<Value, RunError> {
            let executions = Arc::clone(&self.executions);
            let n: u64 = ctx
                .run("increment", move || async move {
                    Ok::<u64, RunError>(executions.fetch_add(1, Ordering::SeqCst) as u64 + 1)
                })
                .await?;
            ctx.sleep("short-nap", chrono::Duration::seconds(2))?;
            ctx.send_event("notify-done", "test/counter.done", json!({ "n": n }))?;
            Ok(json!({ "n": n }))
        }
    }

    struct FollowupHandler {
        received: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkflowHandler for FollowupHandler {
        async fn execute(&self, _ctx: &StepContext, _payload: Value) -> Result<Value, RunError> {
            self.received.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "ok": true }))
        }
    }

    /// Panics on its first invocation, succeeds afterwards.
    struct FlakyHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkflowHandler for FlakyHandler {
        async fn execute(&self, _ctx: &StepContext, _payload: Value) -> Result<Value, RunError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("simulated handler crash");
            }
            Ok(json!({ "ok": true }))
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl WorkflowHandler for NoopHandler {
        async fn execute(&self, _ctx: &StepContext, _payload: Value) -> Result<Value, RunError> {
            Ok(json!({ "ok": true }))
        }
    }

    fn test_pool() -> Option<DbPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = create_conn(&url).ok()?;
        pool.get().ok()?;
        run_migrations(&pool).ok()?;
        Some(pool)
    }

    /// Clear leftovers from earlier invocations so run lookups by workflow
    /// name are unambiguous.
    fn clear_test_runs(pool: &DbPool) {
        let mut conn = pool.get().unwrap();
        let stale = workflow_runs::table
            .filter(workflow_runs::workflow.eq_any(TEST_WORKFLOWS))
            .select(workflow_runs::id);
        diesel::delete(workflow_steps::table.filter(workflow_steps::run_id.eq_any(stale)))
            .execute(&mut conn)
            .unwrap();
        diesel::delete(
            workflow_runs::table.filter(workflow_runs::workflow.eq_any(TEST_WORKFLOWS)),
        )
        .execute(&mut conn)
        .unwrap();
    }

    fn run_row(pool: &DbPool, workflow: &str) -> Option<WorkflowRun> {
        let mut conn = pool.get().unwrap();
        workflow_runs::table
            .filter(workflow_runs::workflow.eq(workflow))
            .order(workflow_runs::created_at.desc())
            .first(&mut conn)
            .optional()
            .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, max_secs: u64) -> bool {
        for _ in 0..max_secs * 4 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn engine_memoizes_steps_and_recovers_failed_runs() {
        let Some(pool) = test_pool() else {
            println!("Skipping test - Postgres not available");
            return;
        };
        clear_test_runs(&pool);

        let executions = Arc::new(AtomicUsize::new(0));
        let followups = Arc::new(AtomicUsize::new(0));
        let flaky_calls = Arc::new(AtomicUsize::new(0));

        let mut engine = Engine::new(pool.clone());
        engine.register(Registration {
            workflow: COUNTER_WORKFLOW,
            trigger_event: "test/counter.start",
            max_attempts: 3,
            handler: Arc::new(CountingHandler {
                executions: Arc::clone(&executions),
            }),
        });
        engine.register(Registration {
            workflow: FOLLOWUP_WORKFLOW,
            trigger_event: "test/counter.done",
            max_attempts: 3,
            handler: Arc::new(FollowupHandler {
                received: Arc::clone(&followups),
            }),
        });
        engine.register(Registration {
            workflow: FLAKY_WORKFLOW,
            trigger_event: "test/flaky.start",
            max_attempts: 3,
            handler: Arc::new(FlakyHandler {
                calls: Arc::clone(&flaky_calls),
            }),
        });
        engine.register(Registration {
            workflow: STRANDED_WORKFLOW,
            trigger_event: "test/stranded.start",
            max_attempts: 3,
            handler: Arc::new(NoopHandler),
        });

        // A run left in `running` by a dead process, re-armed at start.
        let stranded_id = Uuid::new_v4();
        {
            let mut conn = pool.get().unwrap();
            let past = Utc::now() - chrono::Duration::minutes(5);
            diesel::insert_into(workflow_runs::table)
                .values((
                    workflow_runs::id.eq(stranded_id),
                    workflow_runs::workflow.eq(STRANDED_WORKFLOW),
                    workflow_runs::trigger_event.eq("test/stranded.start"),
                    workflow_runs::payload.eq(json!({})),
                    workflow_runs::status.eq(RUN_RUNNING),
                    workflow_runs::attempts.eq(0),
                    workflow_runs::max_attempts.eq(3),
                    workflow_runs::wake_at.eq(past),
                    workflow_runs::created_at.eq(past),
                    workflow_runs::updated_at.eq(past),
                ))
                .execute(&mut conn)
                .unwrap();
        }

        let engine = Arc::new(engine);
        engine.start();

        engine.dispatch("test/counter.start", json!({})).unwrap();
        engine.dispatch("test/flaky.start", json!({})).unwrap();

        // The counter run parks on its sleep, wakes, and completes. The
        // replay must return the recorded step output, not re-run the
        // closure, and must not re-emit the follow-up event.
        let completed = wait_until(
            || {
                run_row(&pool, COUNTER_WORKFLOW)
                    .map(|r| r.status == RUN_COMPLETED)
                    .unwrap_or(false)
            },
            20,
        )
        .await;
        assert!(completed, "counter run did not complete in time");
        assert_eq!(executions.load(Ordering::SeqCst), 1);

        let counter_run = run_row(&pool, COUNTER_WORKFLOW).unwrap();
        assert_eq!(counter_run.output, Some(json!({ "n": 1 })));

        let followed = wait_until(|| followups.load(Ordering::SeqCst) >= 1, 10).await;
        assert!(followed, "follow-up run did not execute in time");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(followups.load(Ordering::SeqCst), 1);

        // The panicking handler settles as a retryable failure instead of
        // stranding the run in `running`.
        let retried = wait_until(
            || {
                run_row(&pool, FLAKY_WORKFLOW)
                    .map(|r| r.attempts >= 1)
                    .unwrap_or(false)
            },
            15,
        )
        .await;
        assert!(retried, "panicked run was not settled in time");
        let flaky_run = run_row(&pool, FLAKY_WORKFLOW).unwrap();
        assert!(flaky_run.last_error.as_deref().unwrap_or("").contains("panicked"));
        assert!(flaky_run.wake_at > flaky_run.created_at);
        assert!(flaky_calls.load(Ordering::SeqCst) >= 1);

        // The stranded run was re-armed at engine start and ran to completion.
        let recovered = wait_until(
            || {
                run_row(&pool, STRANDED_WORKFLOW)
                    .map(|r| r.status == RUN_COMPLETED)
                    .unwrap_or(false)
            },
            15,
        )
        .await;
        assert!(recovered, "stranded run was not recovered in time");
    }
}
