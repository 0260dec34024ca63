use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::core::pipeline::Pacer;

pub const DEFAULT_COMPLETIONS_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// The pool a story run draws from when STORY_MODELS is not set.
const DEFAULT_STORY_MODELS: &[&str] = &[
    "sao10k/fimbulvetr-11b-v2",
    "meta-llama/llama-3-70b-instruct",
    "microsoft/wizardlm-2-8x22b",
    "sophosympatheia/midnight-rose-70b",
    "anthropic/claude-3-haiku",
    "nousresearch/nous-hermes-yi-34b",
    "openchat/openchat-7b",
    "mattshumer/reflection-70b",
    "jondurbin/airoboros-l2-70b",
    "perplexity/llama-3.1-sonar-large-128k-chat",
    "openai/gpt-4o-mini-2024-07-18",
    "google/gemma-2-27b-it",
];

// Titles always come from the same model; only story generation is randomized.
const DEFAULT_TITLE_MODEL: &str = "google/gemma-2-27b-it";

#[derive(Clone, Debug)]
pub struct Config {
    pub api_key: String,
    pub site_url: String,
    pub site_name: String,
    pub completions_url: String,
    pub story_models: Vec<String>,
    pub title_model: String,
    pub api_host: String,
    pub api_port: u16,
    pub db_path: PathBuf,
    pub erase_delay_ms: u64,
    pub type_delay_ms: u64,
}

impl Config {
    /// Read the full configuration from the environment. Missing credentials
    /// and an empty model pool fail here, before any network call.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENROUTER_API_KEY").context("OPENROUTER_API_KEY is not set")?;

        let story_models = match env::var("STORY_MODELS") {
            Ok(raw) => parse_model_list(&raw),
            Err(_) => DEFAULT_STORY_MODELS.iter().map(|m| m.to_string()).collect(),
        };
        if story_models.is_empty() {
            bail!("STORY_MODELS is set but contains no model identifiers");
        }

        Ok(Self {
            api_key,
            site_url: env::var("SITE_URL")
                .unwrap_or_else(|_| "https://fabula.example".to_string()),
            site_name: env::var("SITE_NAME").unwrap_or_else(|_| "fabula".to_string()),
            completions_url: env::var("COMPLETIONS_URL")
                .unwrap_or_else(|_| DEFAULT_COMPLETIONS_URL.to_string()),
            story_models,
            title_model: env::var("TITLE_MODEL")
                .unwrap_or_else(|_| DEFAULT_TITLE_MODEL.to_string()),
            api_host: env::var("FABULA_API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            api_port: env_number("FABULA_API_PORT", 17980),
            db_path: env::var("FABULA_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_db_path()),
            erase_delay_ms: env_number("FABULA_ERASE_DELAY_MS", 30),
            type_delay_ms: env_number("FABULA_TYPE_DELAY_MS", 45),
        })
    }

    pub fn pacer(&self) -> Pacer {
        Pacer::new(
            Duration::from_millis(self.erase_delay_ms),
            Duration::from_millis(self.type_delay_ms),
        )
    }
}

fn parse_model_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fabula")
        .join("stories.db")
}
