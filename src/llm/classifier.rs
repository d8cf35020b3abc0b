use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::{LLMProvider, LlmError};
use crate::shared::models::{TicketCategory, TicketPriority};

const SUMMARY_DEGRADE_LIMIT: usize = 400;

/// Structured triage result the model is asked to return. Parsing is
/// strict: an unknown category or priority fails the parse and takes the
/// degraded path instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub summary: String,
    pub category: TicketCategory,
    pub priority: TicketPriority,
    #[serde(default)]
    pub entities: Map<String, Value>,
}

pub fn render_prompt(subject: &str, description: &str) -> String {
    format!(
        "\nYou are a support triage assistant.\n\
         Return strict JSON with keys: summary, category, priority, entities.\n\
         Category must be one of: Payments, Login, KYC, Bug, Account, Other.\n\
         Priority must be one of: P0, P1, P2, P3.\n\n\
         Ticket:\nSubject: {subject}\nDescription: {description}\n"
    )
}

/// Best-effort parse of the model output. A malformed response is not an
/// error: it degrades to a default classification carrying a truncated
/// prefix of the raw text as the summary.
pub fn parse_classification(raw: &str) -> Classification {
    match serde_json::from_str::<Classification>(raw) {
        Ok(parsed) => parsed,
        Err(_) => Classification {
            summary: raw.chars().take(SUMMARY_DEGRADE_LIMIT).collect(),
            category: TicketCategory::Other,
            priority: TicketPriority::P3,
            entities: Map::new(),
        },
    }
}

pub struct ClassifierGateway {
    provider: std::sync::Arc<dyn LLMProvider>,
    model: String,
}

impl ClassifierGateway {
    pub fn new(provider: std::sync::Arc<dyn LLMProvider>, model: String) -> Self {
        Self { provider, model }
    }

    /// One deterministic completion call; transport errors propagate so the
    /// engine's retry policy applies, parse failures never do.
    pub async fn classify(
        &self,
        subject: &str,
        description: &str,
    ) -> Result<Classification, LlmError> {
        let prompt = render_prompt(subject, description);
        let config = serde_json::json!({ "model": self.model, "temperature": 0.2 });
        let raw = self.provider.generate(&prompt, &config).await?;
        Ok(parse_classification(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct CannedProvider(String);

    #[async_trait]
    impl LLMProvider for CannedProvider {
        async fn generate(&self, _prompt: &str, _config: &Value) -> Result<String, LlmError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn prompt_mentions_ticket_fields_and_enums() {
        let p = render_prompt("Cannot log in", "Password reset link expired");
        assert!(p.contains("Subject: Cannot log in"));
        assert!(p.contains("Description: Password reset link expired"));
        assert!(p.contains("Payments, Login, KYC, Bug, Account, Other"));
        assert!(p.contains("P0, P1, P2, P3"));
    }

    #[test]
    fn well_formed_json_parses() {
        let raw = r#"{"summary":"User locked out","category":"Login","priority":"P1","entities":{"user":"anna"}}"#;
        let c = parse_classification(raw);
        assert_eq!(c.category, TicketCategory::Login);
        assert_eq!(c.priority, TicketPriority::P1);
        assert_eq!(c.summary, "User locked out");
        assert_eq!(c.entities["user"], "anna");
    }

    #[test]
    fn missing_entities_defaults_to_empty_map() {
        let raw = r#"{"summary":"s","category":"Bug","priority":"P2"}"#;
        let c = parse_classification(raw);
        assert!(c.entities.is_empty());
    }

    #[test]
    fn garbage_degrades_to_default() {
        let c = parse_classification("I think this is about payments, maybe?");
        assert_eq!(c.category, TicketCategory::Other);
        assert_eq!(c.priority, TicketPriority::P3);
        assert_eq!(c.summary, "I think this is about payments, maybe?");
        assert!(c.entities.is_empty());
    }

    #[test]
    fn unknown_category_degrades() {
        let raw = r#"{"summary":"s","category":"Billing","priority":"P1","entities":{}}"#;
        let c = parse_classification(raw);
        assert_eq!(c.category, TicketCategory::Other);
        assert_eq!(c.priority, TicketPriority::P3);
    }

    #[test]
    fn degraded_summary_is_capped_at_400_chars() {
        let raw = "x".repeat(1000);
        let c = parse_classification(&raw);
        assert_eq!(c.summary.chars().count(), 400);
    }

    #[tokio::test]
    async fn classify_parses_provider_output() {
        let provider = Arc::new(CannedProvider(
            r#"{"summary":"s","category":"Account","priority":"P2","entities":{}}"#.into(),
        ));
        let gateway = ClassifierGateway::new(provider, "test-model".into());
        let c = gateway.classify("subj", "desc").await.unwrap();
        assert_eq!(c.category, TicketCategory::Account);
    }
}
