use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_GEOCODER_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const MAX_GEOCODER_QPS: u32 = 20;
const MAX_INGESTION_CONCURRENCY: usize = 5;
pub(crate) const MAX_GEOCODER_BASE_BACKOFF_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub geocoder_base_url: String,
    pub geocoder_user_agent: String,
    pub geocoder_api_key: Option<SecretString>,
    pub geocoder_timeout_secs: u64,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_max_attempts: u32,
    pub geocoder_base_backoff_ms: u64,
    pub ingestion_concurrency: usize,
    pub ingestion_workers: usize,
    pub job_max_attempts: u32,
    pub job_retry_delay_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub database_file_name: String,
    pub geocoder_base_url: String,
    pub geocoder_user_agent: String,
    pub has_geocoder_api_key: bool,
    pub geocoder_timeout_secs: u64,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_max_attempts: u32,
    pub geocoder_base_backoff_ms: u64,
    pub ingestion_concurrency: usize,
    pub ingestion_workers: usize,
    pub job_max_attempts: u32,
    pub job_retry_delay_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            database_file_name: "restaurants.db".to_string(),
            geocoder_base_url: DEFAULT_GEOCODER_BASE_URL.to_string(),
            geocoder_user_agent: default_user_agent(),
            geocoder_api_key: None,
            geocoder_timeout_secs: 10,
            geocoder_rate_limit_qps: 1,
            geocoder_max_attempts: 3,
            geocoder_base_backoff_ms: 250,
            ingestion_concurrency: 1,
            ingestion_workers: 2,
            job_max_attempts: 3,
            job_retry_delay_ms: 1_000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or(defaults.database_file_name),
            geocoder_base_url: env::var("GEOCODER_BASE_URL")
                .ok()
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.geocoder_base_url),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.geocoder_user_agent),
            geocoder_api_key: env::var("GEOCODER_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoder_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", defaults.geocoder_timeout_secs)
                .max(1),
            geocoder_rate_limit_qps: parse_u32(
                "GEOCODER_RATE_LIMIT_QPS",
                defaults.geocoder_rate_limit_qps,
            )
            .clamp(1, MAX_GEOCODER_QPS),
            geocoder_max_attempts: parse_u32("GEOCODER_MAX_ATTEMPTS", defaults.geocoder_max_attempts)
                .max(1),
            geocoder_base_backoff_ms: parse_u64(
                "GEOCODER_BASE_BACKOFF_MS",
                defaults.geocoder_base_backoff_ms,
            )
            .clamp(1, MAX_GEOCODER_BASE_BACKOFF_MS),
            ingestion_concurrency: parse_usize(
                "INGESTION_CONCURRENCY",
                defaults.ingestion_concurrency,
            )
            .clamp(1, MAX_INGESTION_CONCURRENCY),
            ingestion_workers: parse_usize("INGESTION_WORKERS", defaults.ingestion_workers).max(1),
            job_max_attempts: parse_u32("JOB_MAX_ATTEMPTS", defaults.job_max_attempts).max(1),
            job_retry_delay_ms: parse_u64("JOB_RETRY_DELAY_MS", defaults.job_retry_delay_ms),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file_name)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            geocoder_base_url: self.geocoder_base_url.clone(),
            geocoder_user_agent: self.geocoder_user_agent.clone(),
            has_geocoder_api_key: self.geocoder_api_key.is_some(),
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            geocoder_rate_limit_qps: self.geocoder_rate_limit_qps,
            geocoder_max_attempts: self.geocoder_max_attempts,
            geocoder_base_backoff_ms: self.geocoder_base_backoff_ms,
            ingestion_concurrency: self.ingestion_concurrency,
            ingestion_workers: self.ingestion_workers,
            job_max_attempts: self.job_max_attempts,
            job_retry_delay_ms: self.job_retry_delay_ms,
        }
    }
}

fn default_user_agent() -> String {
    format!("restaurant-onboarding/{}", env!("CARGO_PKG_VERSION"))
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
