use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::llm::classifier::{Classification, ClassifierGateway};
use crate::llm::LLMProvider;
use crate::shared::models::Ticket;
use crate::tickets::store;
use crate::workflow::sla::EVENT_SLA_CHECK;
use crate::workflow::{RunError, StepContext, WorkflowHandler};

pub const TRIAGE_WORKFLOW: &str = "triage-ticket";
pub const EVENT_TICKET_CREATED: &str = "ticket/created";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketCreatedEvent {
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(rename = "ticketId")]
    pub ticket_id: i32,
}

/// Classifies a freshly created ticket exactly once per triggering event,
/// persists the result, and hands the ticket off to the SLA monitor.
pub struct TriageHandler {
    gateway: ClassifierGateway,
}

impl TriageHandler {
    pub fn new(provider: Arc<dyn LLMProvider>, model: String) -> Self {
        Self {
            gateway: ClassifierGateway::new(provider, model),
        }
    }
}

#[async_trait]
impl WorkflowHandler for TriageHandler {
    async fn execute(&self, ctx: &StepContext, payload: Value) -> Result<Value, RunError> {
        let event: TicketCreatedEvent = serde_json::from_value(payload)
            .map_err(|e| RunError::Fatal(format!("malformed ticket/created payload: {e}")))?;

        // The ledger claim absorbs duplicate deliveries of the same event.
        let already: bool = ctx
            .run("idempotency-check", || async {
                let mut conn = ctx.conn()?;
                let newly_claimed = store::claim_event(&mut conn, &event.event_id)?;
                Ok(!newly_claimed)
            })
            .await?;
        if already {
            return Ok(json!({ "ok": true, "skipped": true }));
        }

        let ticket: Ticket = ctx
            .run("load-ticket", || async {
                let mut conn = ctx.conn()?;
                store::find_ticket(&mut conn, event.ticket_id)?
                    .ok_or_else(|| RunError::Fatal(format!("Ticket not found: {}", event.ticket_id)))
            })
            .await?;

        let ai: Classification = ctx
            .run("summarize-classify", || async {
                self.gateway
                    .classify(&ticket.subject, &ticket.description)
                    .await
                    .map_err(|e| RunError::Retryable(format!("classifier call failed: {e}")))
            })
            .await?;

        ctx.run("save-ai", || async {
            let mut conn = ctx.conn()?;
            store::upsert_ai(&mut conn, event.ticket_id, &ai)?;
            store::update_classification(&mut conn, event.ticket_id, ai.category, ai.priority)?;
            store::append_event(
                &mut conn,
                event.ticket_id,
                "ticket.classified",
                Some(json!({ "category": ai.category, "priority": ai.priority })),
            )?;
            Ok(())
        })
        .await?;

        ctx.send_event(
            "schedule-sla-check",
            EVENT_SLA_CHECK,
            json!({ "ticketId": event.ticket_id, "priority": ai.priority }),
        )?;

        Ok(json!({ "ok": true, "ticketId": event.ticket_id }))
    }
}
