use chrono::Utc;
use diesel::prelude::*;
use serde_json::Value;

use crate::llm::classifier::Classification;
use crate::shared::models::{
    NewProcessedEvent, NewTicket, NewTicketAi, NewTicketEvent, Ticket, TicketAi, TicketCategory,
    TicketEvent, TicketPriority, TicketStatus,
};
use crate::shared::schema::{processed_events, ticket_ai, ticket_events, tickets};

pub fn create_ticket(conn: &mut PgConnection, new: NewTicket) -> QueryResult<Ticket> {
    diesel::insert_into(tickets::table)
        .values(&new)
        .get_result(conn)
}

pub fn find_ticket(conn: &mut PgConnection, ticket_id: i32) -> QueryResult<Option<Ticket>> {
    tickets::table.find(ticket_id).first(conn).optional()
}

pub fn list_tickets(conn: &mut PgConnection) -> QueryResult<Vec<Ticket>> {
    tickets::table.order(tickets::id.desc()).load(conn)
}

pub fn set_status(
    conn: &mut PgConnection,
    ticket_id: i32,
    status: TicketStatus,
) -> QueryResult<usize> {
    diesel::update(tickets::table.find(ticket_id))
        .set((
            tickets::status.eq(status.as_str()),
            tickets::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
}

/// Copy the classification verdict onto the ticket row itself.
pub fn update_classification(
    conn: &mut PgConnection,
    ticket_id: i32,
    category: TicketCategory,
    priority: TicketPriority,
) -> QueryResult<usize> {
    diesel::update(tickets::table.find(ticket_id))
        .set((
            tickets::category.eq(Some(category.as_str())),
            tickets::priority.eq(Some(priority.as_str())),
            tickets::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
}

pub fn append_event(
    conn: &mut PgConnection,
    ticket_id: i32,
    event_type: &str,
    payload: Option<Value>,
) -> QueryResult<usize> {
    diesel::insert_into(ticket_events::table)
        .values(&NewTicketEvent {
            ticket_id,
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        })
        .execute(conn)
}

pub fn list_events(conn: &mut PgConnection, ticket_id: i32) -> QueryResult<Vec<TicketEvent>> {
    ticket_events::table
        .filter(ticket_events::ticket_id.eq(ticket_id))
        .order(ticket_events::created_at.asc())
        .load(conn)
}

/// Atomic insert-if-absent on the idempotency ledger. Returns whether the
/// event id was newly claimed; a duplicate is the `false` case, never an
/// error.
pub fn claim_event(conn: &mut PgConnection, event_id: &str) -> QueryResult<bool> {
    let inserted = diesel::insert_into(processed_events::table)
        .values(&NewProcessedEvent {
            event_id: event_id.to_string(),
            created_at: Utc::now(),
        })
        .on_conflict(processed_events::event_id)
        .do_nothing()
        .execute(conn)?;
    Ok(inserted == 1)
}

/// At most one classification row per ticket: insert on first
/// classification, overwrite on re-classification.
pub fn upsert_ai(
    conn: &mut PgConnection,
    ticket_id: i32,
    ai: &Classification,
) -> QueryResult<usize> {
    let now = Utc::now();
    let entities = Value::Object(ai.entities.clone());
    diesel::insert_into(ticket_ai::table)
        .values(&NewTicketAi {
            ticket_id,
            summary: Some(ai.summary.clone()),
            category: Some(ai.category.as_str().to_string()),
            priority: Some(ai.priority.as_str().to_string()),
            entities: Some(entities.clone()),
            created_at: now,
            updated_at: now,
        })
        .on_conflict(ticket_ai::ticket_id)
        .do_update()
        .set((
            ticket_ai::summary.eq(Some(ai.summary.as_str())),
            ticket_ai::category.eq(Some(ai.category.as_str())),
            ticket_ai::priority.eq(Some(ai.priority.as_str())),
            ticket_ai::entities.eq(Some(entities)),
            ticket_ai::updated_at.eq(now),
        ))
        .execute(conn)
}

pub fn find_ai(conn: &mut PgConnection, ticket_id: i32) -> QueryResult<Option<TicketAi>> {
    ticket_ai::table
        .filter(ticket_ai::ticket_id.eq(ticket_id))
        .first(conn)
        .optional()
}
