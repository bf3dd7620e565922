//! Process configuration assembled from environment variables (§6, §1.1).
//!
//! `Config::from_env()` is the single place defaults and validation live,
//! mirroring the teacher's env-var-first posture. `dotenvy` loads a `.env`
//! file (development convenience) before the environment is read.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub repo_store_dir: PathBuf,
    pub redis_url: String,
    pub worker_concurrency: usize,
    pub bind_addr: SocketAddr,
    pub environment: Environment,

    pub github_app_id: Option<String>,
    pub github_private_key: Option<String>,
    pub github_webhook_secret: Option<String>,
    pub github_client_id: Option<String>,
    pub github_client_secret: Option<String>,

    pub database_encryption_key: Option<String>,
    pub session_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

const DEV_SESSION_SECRET: &str = "dev-only-insecure-session-secret-do-not-use-in-production";

impl Config {
    pub fn from_env() -> Result<Self> {
        // Mirrors the teacher's dev-bootstrap posture: best-effort, never fatal if
        // no .env file is present.
        let _ = dotenvy::dotenv();

        let environment = match std::env::var("ENVIRONMENT")
            .or_else(|_| std::env::var("NODE_ENV"))
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        };

        let database_path = std::env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "./conductor.db".to_string())
            .into();

        let repo_store_dir = std::env::var("REPO_STORE_DIR")
            .unwrap_or_else(|_| "./repo-store".to_string())
            .into();

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        let worker_concurrency: usize = std::env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        if !(1..=100).contains(&worker_concurrency) {
            bail!("WORKER_CONCURRENCY must be between 1 and 100, got {worker_concurrency}");
        }

        let bind_addr: SocketAddr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3141".to_string())
            .parse()
            .context("invalid BIND_ADDR")?;

        let session_secret = match std::env::var("SESSION_SECRET") {
            Ok(v) => v,
            Err(_) if environment.is_production() => {
                bail!("SESSION_SECRET is required in production");
            }
            Err(_) => DEV_SESSION_SECRET.to_string(),
        };

        Ok(Self {
            database_path,
            repo_store_dir,
            redis_url,
            worker_concurrency,
            bind_addr,
            environment,
            github_app_id: std::env::var("GITHUB_APP_ID").ok(),
            github_private_key: std::env::var("GITHUB_PRIVATE_KEY").ok(),
            github_webhook_secret: std::env::var("GITHUB_WEBHOOK_SECRET").ok(),
            github_client_id: std::env::var("GITHUB_CLIENT_ID").ok(),
            github_client_secret: std::env::var("GITHUB_CLIENT_SECRET").ok(),
            database_encryption_key: std::env::var("DATABASE_ENCRYPTION_KEY").ok(),
            session_secret,
        })
    }

    /// Signature verification is required whenever a webhook secret is
    /// configured; otherwise requests are accepted only in development (§4.5).
    pub fn requires_webhook_signature(&self) -> bool {
        self.github_webhook_secret.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_concurrency_out_of_range_is_rejected() {
        // SAFETY: test-only, single-threaded test process.
        unsafe {
            std::env::set_var("WORKER_CONCURRENCY", "0");
        }
        let result = Config::from_env();
        unsafe {
            std::env::remove_var("WORKER_CONCURRENCY");
        }
        assert!(result.is_err());
    }
}
