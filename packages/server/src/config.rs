//! Environment-driven configuration.

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Redis backend for the rate-limit counter. When unset the server
    /// falls back to an in-process window, which is fine for a single
    /// worker in development only.
    pub redis_url: Option<String>,
    pub port: u16,
    /// Shared secret required on `/api/*` requests. Unset disables the
    /// check (dev only).
    pub internal_api_secret: Option<String>,
    /// Base URL of the external worker; the default handler derives
    /// callback URLs from it.
    pub worker_base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let redis_url = std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .context("PORT must be a valid port number")?;

        let internal_api_secret = std::env::var("INTERNAL_API_SECRET")
            .ok()
            .filter(|v| !v.is_empty());

        let worker_base_url = std::env::var("WORKER_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string());

        Ok(Self {
            database_url,
            redis_url,
            port,
            internal_api_secret,
            worker_base_url,
        })
    }
}
