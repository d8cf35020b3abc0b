use std::sync::Arc;

use axum::{routing::get, Json, Router};
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ticketserver::config::AppConfig;
use ticketserver::llm::{LLMProvider, OpenAIClient};
use ticketserver::notify::{NullPublisher, RedisStreamPublisher, TicketPublisher};
use ticketserver::shared::state::AppState;
use ticketserver::shared::utils::{create_conn, run_migrations};
use ticketserver::tickets::configure_tickets_routes;
use ticketserver::workflow::sla::{SlaMonitorHandler, EVENT_SLA_CHECK, SLA_WORKFLOW};
use ticketserver::workflow::triage::{TriageHandler, EVENT_TICKET_CREATED, TRIAGE_WORKFLOW};
use ticketserver::workflow::{Engine, Registration};

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    let pool = create_conn(&config.effective_database_url())?;
    run_migrations(&pool)?;
    info!("database connected");

    let llm_provider: Arc<dyn LLMProvider> = Arc::new(OpenAIClient::new(
        config.llm.api_key.clone(),
        Some(config.llm.base_url.clone()),
        config.llm.model.clone(),
    ));
    let publisher: Arc<dyn TicketPublisher> = if config.redis.url.is_empty() {
        info!("REDIS_URL empty, ticket notifications disabled");
        Arc::new(NullPublisher)
    } else {
        Arc::new(RedisStreamPublisher::new(
            &config.redis.url,
            config.redis.ticket_stream.clone(),
        )?)
    };

    let mut engine = Engine::new(pool.clone());
    engine.register(Registration {
        workflow: TRIAGE_WORKFLOW,
        trigger_event: EVENT_TICKET_CREATED,
        max_attempts: 4,
        handler: Arc::new(TriageHandler::new(
            Arc::clone(&llm_provider),
            config.llm.model.clone(),
        )),
    });
    engine.register(Registration {
        workflow: SLA_WORKFLOW,
        trigger_event: EVENT_SLA_CHECK,
        max_attempts: 3,
        handler: Arc::new(SlaMonitorHandler),
    });
    let engine = Arc::new(engine);
    engine.start();

    let state = Arc::new(AppState {
        config: config.clone(),
        conn: pool,
        llm_provider,
        publisher,
        engine,
    });

    let app = Router::new()
        .route("/health", get(health))
        .merge(configure_tickets_routes())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("ticketserver running on http://{addr}");
    axum::serve(listener, app).await?;

    Ok(())
}
