use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::{AppConfig, MAX_GEOCODER_BASE_BACKOFF_MS};
use crate::errors::{AppError, AppResult};
use crate::locations::{CandidateLocation, Coordinates};

const RESULT_LIMIT: u8 = 5;
const MIN_INTERVAL_MS: u64 = 50;
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// What the address lookup service said about one address. Service failures
/// are reported through `Err`, never as one of these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeocodeOutcome {
    Located(Coordinates),
    NotFound,
    /// The first result lacked a usable latitude or longitude.
    Incomplete,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &CandidateLocation) -> AppResult<GeocodeOutcome>;
}

/// Rate-limited, retrying front for a [`Geocoder`]. Cloning shares the rate
/// limiter, so every clone draws from the same request budget.
#[derive(Clone)]
pub struct GeocodingClient {
    inner: Arc<dyn Geocoder>,
    rate_limiter: Arc<RateLimiter>,
    jitter_rng: Arc<Mutex<StdRng>>,
    max_attempts: u32,
    base_backoff_ms: u64,
}

impl GeocodingClient {
    pub fn new(inner: Arc<dyn Geocoder>, config: &AppConfig) -> Self {
        Self::with_rng(inner, config, StdRng::from_entropy())
    }

    pub fn with_rng(inner: Arc<dyn Geocoder>, config: &AppConfig, rng: StdRng) -> Self {
        Self {
            inner,
            rate_limiter: Arc::new(RateLimiter::new(config.geocoder_rate_limit_qps)),
            jitter_rng: Arc::new(Mutex::new(rng)),
            max_attempts: config.geocoder_max_attempts.max(1),
            base_backoff_ms: config
                .geocoder_base_backoff_ms
                .clamp(1, MAX_GEOCODER_BASE_BACKOFF_MS),
        }
    }

    pub fn rate_limit_qps(&self) -> u32 {
        self.rate_limiter.qps()
    }

    pub async fn lookup(&self, address: &CandidateLocation) -> AppResult<GeocodeOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.rate_limiter.wait().await;
            match self.inner.geocode(address).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        target: "geocoding",
                        ?err,
                        attempt,
                        address = %address,
                        "geocode lookup failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    return Err(AppError::GeocoderUnavailable {
                        attempts: attempt,
                        message: err.to_string(),
                    })
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(MAX_BACKOFF_EXPONENT);
        let base = Duration::from_millis(self.base_backoff_ms.saturating_mul(1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..self.base_backoff_ms))
        };
        base.saturating_add(jitter)
    }
}

struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval: Duration::from_millis(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn qps(&self) -> u32 {
        let interval = (self.min_interval.as_millis() as u64).max(1);
        let qps = (1000_f64 / interval as f64).round() as u32;
        qps.max(1)
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / safe_qps as f64).ceil() as u64;
        interval_ms.max(MIN_INTERVAL_MS)
    }

    async fn wait(&self) {
        let interval = self.min_interval;
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

/// Structured search against a Nominatim-compatible `/search` endpoint.
pub struct NominatimGeocoder {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl NominatimGeocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.geocoder_user_agent.as_str())
            .timeout(Duration::from_secs(config.geocoder_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.geocoder_base_url.trim_end_matches('/').to_string(),
            api_key: config.geocoder_api_key.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: Option<String>,
    lon: Option<String>,
    display_name: Option<String>,
}

impl NominatimPlace {
    fn coordinates(&self) -> Option<Coordinates> {
        let latitude = self.lat.as_deref()?.trim().parse::<f64>().ok()?;
        let longitude = self.lon.as_deref()?.trim().parse::<f64>().ok()?;
        if !latitude.is_finite() || !longitude.is_finite() {
            return None;
        }
        Some(Coordinates {
            latitude,
            longitude,
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, address: &CandidateLocation) -> AppResult<GeocodeOutcome> {
        let limit = RESULT_LIMIT.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("street", address.route.as_str()),
            ("postalcode", address.postal_code.as_str()),
            ("city", address.city.as_str()),
            ("country", address.country.as_str()),
            ("format", "jsonv2"),
            ("limit", limit.as_str()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("key", key.expose_secret()));
        }

        let response = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Geocoder(format!(
                "search endpoint returned status {status}"
            )));
        }

        let places: Vec<NominatimPlace> = response.json().await?;
        let Some(first) = places.into_iter().next() else {
            return Ok(GeocodeOutcome::NotFound);
        };

        debug!(
            target: "geocoding",
            address = %address,
            matched = first.display_name.as_deref().unwrap_or_default(),
            "geocoder matched address"
        );
        Ok(first
            .coordinates()
            .map(GeocodeOutcome::Located)
            .unwrap_or(GeocodeOutcome::Incomplete))
    }
}
