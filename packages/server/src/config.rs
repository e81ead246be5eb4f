use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub nats_url: String,
    pub port: u16,
    pub source_api_base: String,
    pub source_api_token: Option<String>,
    pub embedding_endpoint: String,
    pub vector_index_url: String,
    pub vector_collection: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            nats_url: env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            source_api_base: env::var("SOURCE_API_BASE")
                .context("SOURCE_API_BASE must be set")?,
            source_api_token: env::var("SOURCE_API_TOKEN").ok(),
            embedding_endpoint: env::var("EMBEDDING_ENDPOINT")
                .context("EMBEDDING_ENDPOINT must be set")?,
            vector_index_url: env::var("VECTOR_INDEX_URL")
                .context("VECTOR_INDEX_URL must be set")?,
            vector_collection: env::var("VECTOR_COLLECTION")
                .unwrap_or_else(|_| "tracker_entities".to_string()),
        })
    }
}
