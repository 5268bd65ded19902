mod clients;
mod config;
mod db;
mod errors;
mod geocoding;
mod jobs;
mod locations;
mod outcome;
mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::Connection as SqlConnection;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::clients::{create_client, Client, NewClient};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::db::{bootstrap, DatabaseContext};
pub use crate::errors::{AppError, AppResult};
pub use crate::geocoding::{GeocodeOutcome, Geocoder, GeocodingClient, NominatimGeocoder};
pub use crate::jobs::{AddRestaurantsJob, IngestionQueue, RetryPolicy};
pub use crate::locations::{
    find_existing, location_exists, CandidateLocation, Coordinates, LocationKey, StoredLocation,
};
pub use crate::outcome::{
    CandidateOutcome, CandidateRecord, FailureReason, IngestionSummary, OutcomeAccumulator,
    SkipReason,
};
pub use crate::pipeline::IngestionPipeline;

#[derive(Debug, Clone, Serialize)]
pub struct ClientRegistration {
    pub client: Client,
    pub message: String,
    pub restaurants_queued: usize,
}

/// Client onboarding front door: creates clients synchronously and hands
/// their restaurant lists to the background ingestion queue.
pub struct OnboardingService {
    db: Arc<Mutex<SqlConnection>>,
    db_path: PathBuf,
    config: AppConfig,
    queue: IngestionQueue,
}

impl OnboardingService {
    /// Boots storage, the Nominatim geocoder and the worker pool. Must be
    /// called from within a tokio runtime.
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let geocoder = NominatimGeocoder::new(&config)?;
        Self::with_geocoder(config, Arc::new(geocoder))
    }

    pub fn with_geocoder(config: AppConfig, geocoder: Arc<dyn Geocoder>) -> AppResult<Self> {
        init_tracing();
        let DatabaseContext { connection, path } =
            bootstrap(&config.data_dir, &config.database_file_name)?;
        let db = Arc::new(Mutex::new(connection));

        let lookup = GeocodingClient::new(geocoder, &config);
        let rate_limit_qps = lookup.rate_limit_qps();
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&db),
            lookup,
            config.ingestion_concurrency,
        ));
        let queue = IngestionQueue::spawn(
            pipeline,
            config.ingestion_workers,
            RetryPolicy {
                max_attempts: config.job_max_attempts,
                delay: Duration::from_millis(config.job_retry_delay_ms),
            },
        );

        info!(
            db_path = %path.display(),
            rate_limit_qps,
            config = ?config.public_profile(),
            "onboarding service ready"
        );
        Ok(Self {
            db,
            db_path: path,
            config,
            queue,
        })
    }

    pub fn register_client(&self, payload: NewClient) -> AppResult<ClientRegistration> {
        info!(target: "clients", "request to add a new client");
        let client = {
            let mut conn = self.db.lock();
            clients::create_client(&mut conn, &payload)?
        };

        let restaurants = payload.restaurants.unwrap_or_default();
        let restaurants_queued = restaurants.len();
        if !restaurants.is_empty() {
            self.queue.dispatch(AddRestaurantsJob {
                client: client.clone(),
                restaurants,
            })?;
        }

        let message = format!(
            "Customer {} with SIREN {} added successfully. Restaurants are currently being added.",
            client.name, client.siren
        );
        info!(target: "clients", client_id = client.id, "{message}");
        Ok(ClientRegistration {
            client,
            message,
            restaurants_queued,
        })
    }

    pub fn list_clients(&self) -> AppResult<Vec<Client>> {
        info!(target: "clients", "request to get all clients");
        clients::list_clients(&self.db.lock())
    }

    pub fn find_client(&self, client_id: i64) -> AppResult<Option<Client>> {
        clients::find_client(&self.db.lock(), client_id)
    }

    pub fn locations_for(&self, client_id: i64) -> AppResult<Vec<StoredLocation>> {
        locations::list_for_client(&self.db.lock(), client_id)
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    pub fn public_config(&self) -> PublicAppConfig {
        self.config.public_profile()
    }

    /// Waits for every queued ingestion job to finish. Registrations made
    /// afterwards are rejected.
    pub async fn shutdown(&mut self) {
        self.queue.shutdown().await;
    }
}

fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,restaurant_onboarding=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
