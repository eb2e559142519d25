use anyhow::{Context, Result};

const DEFAULT_DB_PATH: &str = "pickem.db";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_SETTLE_RETRIES: u32 = 3;

/// Runtime settings, read from the environment (and `.env` if present)
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: String,
    pub cfb_api_key: Option<String>,
    pub bind_addr: String,
    pub settle_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settle_retries = match lookup("PICKEM_SETTLE_RETRIES") {
            Some(value) => value
                .parse()
                .with_context(|| format!("PICKEM_SETTLE_RETRIES must be a number, got {}", value))?,
            None => DEFAULT_SETTLE_RETRIES,
        };

        Ok(Self {
            db_path: lookup("PICKEM_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            cfb_api_key: lookup("COLLEGE_FOOTBALL_DATA_API_KEY").filter(|k| !k.is_empty()),
            bind_addr: lookup("PICKEM_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            settle_retries,
        })
    }

    pub fn require_cfb_api_key(&self) -> Result<&str> {
        self.cfb_api_key
            .as_deref()
            .context("COLLEGE_FOOTBALL_DATA_API_KEY not set in .env file")
    }
}
