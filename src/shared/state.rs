use std::sync::Arc;

use crate::config::AppConfig;
use crate::llm::LLMProvider;
use crate::notify::TicketPublisher;
use crate::shared::utils::DbPool;
use crate::workflow::Engine;

pub struct AppState {
    pub config: AppConfig,
    pub conn: DbPool,
    pub llm_provider: Arc<dyn LLMProvider>,
    pub publisher: Arc<dyn TicketPublisher>,
    pub engine: Arc<Engine>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
            llm_provider: Arc::clone(&self.llm_provider),
            publisher: Arc::clone(&self.publisher),
            engine: Arc::clone(&self.engine),
        }
    }
}
