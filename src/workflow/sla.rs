use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::shared::models::TicketStatus;
use crate::tickets::store;
use crate::workflow::{RunError, StepContext, WorkflowHandler};

pub const SLA_WORKFLOW: &str = "sla-monitor";
pub const EVENT_SLA_CHECK: &str = "ticket/sla.check";

const RECHECK_INTERVAL_MIN: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaCheckEvent {
    #[serde(rename = "ticketId")]
    pub ticket_id: i32,
    pub priority: String,
}

/// Breach deadline in minutes for a priority; anything unrecognized gets
/// the P3 deadline.
pub fn sla_minutes(priority: &str) -> i64 {
    match priority {
        "P0" => 15,
        "P1" => 60,
        "P2" => 360,
        _ => 1440,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaDecision {
    /// Inside the 80% warning window, not yet breached.
    Warn { elapsed_min: i64, deadline_min: i64 },
    Breach { elapsed_min: i64, deadline_min: i64 },
    /// Nothing to report yet; check again later.
    Reschedule,
}

pub fn evaluate(priority: &str, created_at: DateTime<Utc>, now: DateTime<Utc>) -> SlaDecision {
    let deadline_min = sla_minutes(priority);
    let elapsed_min = (now - created_at).num_minutes();
    let threshold = deadline_min * 8 / 10;

    if elapsed_min >= deadline_min {
        SlaDecision::Breach {
            elapsed_min,
            deadline_min,
        }
    } else if elapsed_min >= threshold {
        SlaDecision::Warn {
            elapsed_min,
            deadline_min,
        }
    } else {
        SlaDecision::Reschedule
    }
}

/// Recurring deadline check for one ticket. Terminal on breach or once the
/// ticket leaves `open`; otherwise re-arms itself as a fresh run after a
/// durable 10 minute sleep.
pub struct SlaMonitorHandler;

#[async_trait]
impl WorkflowHandler for SlaMonitorHandler {
    async fn execute(&self, ctx: &StepContext, payload: Value) -> Result<Value, RunError> {
        let event: SlaCheckEvent = serde_json::from_value(payload)
            .map_err(|e| RunError::Fatal(format!("malformed sla.check payload: {e}")))?;

        let ticket = ctx
            .run("load-ticket", || async {
                let mut conn = ctx.conn()?;
                store::find_ticket(&mut conn, event.ticket_id)?
                    .ok_or_else(|| RunError::Fatal(format!("Ticket not found: {}", event.ticket_id)))
            })
            .await?;

        if ticket.status != TicketStatus::Open.as_str() {
            return Ok(json!({ "ok": true, "ignored": true }));
        }

        match evaluate(&event.priority, ticket.created_at, Utc::now()) {
            SlaDecision::Breach {
                elapsed_min,
                deadline_min,
            } => {
                ctx.run("breach", || async {
                    let mut conn = ctx.conn()?;
                    store::append_event(
                        &mut conn,
                        event.ticket_id,
                        "sla.breached",
                        Some(json!({
                            "priority": event.priority,
                            "elapsedMin": elapsed_min,
                            "mins": deadline_min,
                        })),
                    )?;
                    Ok(())
                })
                .await?;
                return Ok(json!({ "ok": true, "breached": true }));
            }
            SlaDecision::Warn {
                elapsed_min,
                deadline_min,
            } => {
                ctx.run("warn-escalation", || async {
                    let mut conn = ctx.conn()?;
                    store::append_event(
                        &mut conn,
                        event.ticket_id,
                        "sla.warning",
                        Some(json!({
                            "priority": event.priority,
                            "elapsedMin": elapsed_min,
                            "mins": deadline_min,
                        })),
                    )?;
                    Ok(())
                })
                .await?;
            }
            SlaDecision::Reschedule => {}
        }

        ctx.sleep("wait-10m", Duration::minutes(RECHECK_INTERVAL_MIN))?;
        ctx.send_event(
            "reschedule",
            EVENT_SLA_CHECK,
            json!({ "ticketId": event.ticket_id, "priority": event.priority }),
        )?;

        Ok(json!({ "ok": true, "scheduled": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(created: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
        created + Duration::minutes(minutes)
    }

    #[test]
    fn deadlines_per_priority() {
        assert_eq!(sla_minutes("P0"), 15);
        assert_eq!(sla_minutes("P1"), 60);
        assert_eq!(sla_minutes("P2"), 360);
        assert_eq!(sla_minutes("P3"), 1440);
        assert_eq!(sla_minutes("garbage"), 1440);
    }

    #[test]
    fn p1_just_below_threshold_reschedules() {
        let created = Utc::now();
        // threshold for P1 is 48 minutes
        assert_eq!(evaluate("P1", created, at(created, 47)), SlaDecision::Reschedule);
    }

    #[test]
    fn p1_at_threshold_warns() {
        let created = Utc::now();
        assert_eq!(
            evaluate("P1", created, at(created, 48)),
            SlaDecision::Warn {
                elapsed_min: 48,
                deadline_min: 60
            }
        );
    }

    #[test]
    fn p1_still_warns_just_before_deadline() {
        let created = Utc::now();
        assert_eq!(
            evaluate("P1", created, at(created, 59)),
            SlaDecision::Warn {
                elapsed_min: 59,
                deadline_min: 60
            }
        );
    }

    #[test]
    fn p1_past_deadline_breaches() {
        let created = Utc::now();
        assert_eq!(
            evaluate("P1", created, at(created, 61)),
            SlaDecision::Breach {
                elapsed_min: 61,
                deadline_min: 60
            }
        );
    }

    #[test]
    fn exact_deadline_is_a_breach_not_a_warning() {
        let created = Utc::now();
        assert_eq!(
            evaluate("P1", created, at(created, 60)),
            SlaDecision::Breach {
                elapsed_min: 60,
                deadline_min: 60
            }
        );
    }

    #[test]
    fn elapsed_minutes_floor_partial_minutes() {
        let created = Utc::now();
        let now = created + Duration::minutes(47) + Duration::seconds(59);
        assert_eq!(evaluate("P1", created, now), SlaDecision::Reschedule);
    }

    #[test]
    fn unknown_priority_uses_p3_deadline() {
        let created = Utc::now();
        assert_eq!(
            evaluate("wat", created, at(created, 1200)),
            SlaDecision::Warn {
                elapsed_min: 1200,
                deadline_min: 1440
            }
        );
    }
}
