pub mod store;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::notify::TicketCreatedPayload;
use crate::shared::models::{NewTicket, Ticket, TicketAi, TicketEvent, TicketStatus};
use crate::shared::state::AppState;
use crate::workflow::triage::EVENT_TICKET_CREATED;

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub user_id: Option<i32>,
    pub subject: String,
    pub description: String,
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateTicketResponse {
    pub ok: bool,
    #[serde(rename = "ticketId")]
    pub ticket_id: i32,
}

#[derive(Debug, Serialize)]
pub struct ListTicketsResponse {
    pub ok: bool,
    pub rows: Vec<Ticket>,
}

#[derive(Debug, Serialize)]
pub struct TicketDetailResponse {
    pub ok: bool,
    pub ticket: Ticket,
    pub ai: Option<TicketAi>,
    pub events: Vec<TicketEvent>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: String,
}

fn validate_create(req: &CreateTicketRequest) -> Result<(), String> {
    if req.subject.chars().count() < 3 {
        return Err("subject must be at least 3 characters".to_string());
    }
    if req.description.chars().count() < 5 {
        return Err("description must be at least 5 characters".to_string());
    }
    Ok(())
}

/// Intake: the response is sent once the ticket and its creation event are
/// durable. Classification and SLA tracking happen asynchronously and are
/// observable through the ticket's event log.
pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<Json<CreateTicketResponse>, (StatusCode, String)> {
    validate_create(&req).map_err(|msg| (StatusCode::UNPROCESSABLE_ENTITY, msg))?;

    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let now = Utc::now();
    let source = req.source.unwrap_or_else(|| "web".to_string());
    let ticket = store::create_ticket(
        &mut conn,
        NewTicket {
            user_id: req.user_id,
            subject: req.subject,
            description: req.description,
            source: source.clone(),
            status: TicketStatus::Open.as_str().to_string(),
            created_at: now,
            updated_at: now,
        },
    )
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))?;

    store::append_event(
        &mut conn,
        ticket.id,
        "ticket.created",
        Some(serde_json::json!({ "source": source })),
    )
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))?;

    let event_id = Uuid::new_v4().to_string();

    // Bus notification is fire-and-forget; intake does not depend on it.
    let publisher = Arc::clone(&state.publisher);
    let notification = TicketCreatedPayload {
        event_id: event_id.clone(),
        ticket_id: ticket.id,
        user_id: ticket.user_id,
        subject: ticket.subject.clone(),
        description: ticket.description.clone(),
        source: ticket.source.clone(),
        created_at: ticket.created_at,
    };
    tokio::spawn(async move {
        if let Err(e) = publisher.publish_created(&notification).await {
            warn!("ticket-created publish failed for ticket {}: {e}", notification.ticket_id);
        }
    });

    state
        .engine
        .dispatch(
            EVENT_TICKET_CREATED,
            serde_json::json!({ "eventId": event_id, "ticketId": ticket.id }),
        )
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Dispatch error: {e}")))?;

    Ok(Json(CreateTicketResponse {
        ok: true,
        ticket_id: ticket.id,
    }))
}

pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListTicketsResponse>, (StatusCode, String)> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let rows = store::list_tickets(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;

    Ok(Json(ListTicketsResponse { ok: true, rows }))
}

pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<TicketDetailResponse>, (StatusCode, String)> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let ticket = store::find_ticket(&mut conn, id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Ticket not found".to_string()))?;

    let ai = store::find_ai(&mut conn, id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;
    let events = store::list_events(&mut conn, id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;

    Ok(Json(TicketDetailResponse {
        ok: true,
        ticket,
        ai,
        events,
    }))
}

pub async fn change_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(req): Json<ChangeStatusRequest>,
) -> Result<Json<TicketDetailResponse>, (StatusCode, String)> {
    let status = TicketStatus::parse(&req.status).ok_or_else(|| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("unknown status: {}", req.status),
        )
    })?;

    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let updated = store::set_status(&mut conn, id, status)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Update error: {e}")))?;
    if updated == 0 {
        return Err((StatusCode::NOT_FOUND, "Ticket not found".to_string()));
    }

    get_ticket(State(state), Path(id)).await
}

pub fn configure_tickets_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tickets", get(list_tickets).post(create_ticket))
        .route("/api/tickets/:id", get(get_ticket))
        .route("/api/tickets/:id/status", put(change_status))
}
