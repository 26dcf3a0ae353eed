use anyhow::{Context, Result};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_PROMPT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub prompt_model: String,
    pub image_model: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_API_BASE.to_string(),
            prompt_model: DEFAULT_PROMPT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Sessions untouched for this long, with nothing in flight, are dropped.
    pub session_ttl_secs: u64,
    pub gemini: GeminiConfig,
}

impl Config {
    /// Reads the process environment. Call after `.env` has been loaded.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let port = match lookup("PORT").filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw.trim().parse::<u16>().with_context(|| format!("PORT must be a port number, got '{raw}'"))?,
            None => DEFAULT_PORT,
        };

        let session_ttl_secs = match lookup("SESSION_TTL_SECS").filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw.trim().parse::<u64>().with_context(|| format!("SESSION_TTL_SECS must be a number of seconds, got '{raw}'"))?,
            None => DEFAULT_SESSION_TTL_SECS,
        };

        Ok(Self {
            port,
            session_ttl_secs,
            gemini: GeminiConfig {
                api_key: var("GEMINI_API_KEY", ""),
                base_url: var("GEMINI_API_BASE", DEFAULT_API_BASE),
                prompt_model: var("GEMINI_PROMPT_MODEL", DEFAULT_PROMPT_MODEL),
                image_model: var("GEMINI_IMAGE_MODEL", DEFAULT_IMAGE_MODEL),
            },
        })
    }
}
