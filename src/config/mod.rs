use anyhow::Result;

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub llm: LlmConfig,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub server: String,
    pub port: u32,
    pub database: String,
}

#[derive(Clone)]
pub struct RedisConfig {
    pub url: String,
    pub ticket_stream: String,
}

#[derive(Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl AppConfig {
    pub fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database.username,
            self.database.password,
            self.database.server,
            self.database.port,
            self.database.database
        )
    }

    pub fn from_env() -> Result<Self> {
        let get_str = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };

        let database = DatabaseConfig {
            username: get_str("TABLES_USERNAME", "ticketuser"),
            password: get_str("TABLES_PASSWORD", ""),
            server: get_str("TABLES_SERVER", "localhost"),
            port: std::env::var("TABLES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: get_str("TABLES_DATABASE", "ticketserver"),
        };

        let server = ServerConfig {
            host: get_str("SERVER_HOST", "0.0.0.0"),
            port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(4000),
        };

        let redis = RedisConfig {
            url: get_str("REDIS_URL", "redis://127.0.0.1/"),
            ticket_stream: get_str("TICKET_STREAM", "tickets.created"),
        };

        let llm = LlmConfig {
            api_key: get_str("LLM_API_KEY", ""),
            base_url: get_str("LLM_BASE_URL", "https://api.openai.com/v1"),
            model: get_str("LLM_MODEL", "gpt-4.1-mini"),
        };

        Ok(Self {
            server,
            database,
            redis,
            llm,
        })
    }

    /// DATABASE_URL wins over the composed TABLES_* parts when set.
    pub fn effective_database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.database_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_is_composed_from_parts() {
        let cfg = AppConfig {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 4000,
            },
            database: DatabaseConfig {
                username: "u".into(),
                password: "p".into(),
                server: "db".into(),
                port: 5433,
                database: "tickets".into(),
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1/".into(),
                ticket_stream: "tickets.created".into(),
            },
            llm: LlmConfig {
                api_key: String::new(),
                base_url: "https://api.openai.com/v1".into(),
                model: "gpt-4.1-mini".into(),
            },
        };
        assert_eq!(cfg.database_url(), "postgres://u:p@db:5433/tickets");
    }
}
