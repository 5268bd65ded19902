use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::clients::Client;
use crate::errors::{AppError, AppResult};
use crate::geocoding::{GeocodeOutcome, GeocodingClient};
use crate::locations::{
    dedupe_batch, find_existing, insert_if_absent, CandidateLocation, LocationKey,
};
use crate::outcome::{
    CandidateOutcome, FailureReason, IngestionSummary, OutcomeAccumulator, SkipReason,
};

const MAX_CONCURRENCY: usize = 5;

/// Ingests one client's restaurant batch: self-dedup, existence check,
/// geocode, insert. Storage errors other than constraint violations abort
/// the run; everything else is accounted per candidate.
pub struct IngestionPipeline {
    db: Arc<Mutex<Connection>>,
    geocoder: GeocodingClient,
    concurrency: usize,
}

impl IngestionPipeline {
    pub fn new(db: Arc<Mutex<Connection>>, geocoder: GeocodingClient, concurrency: usize) -> Self {
        Self {
            db,
            geocoder,
            concurrency: concurrency.clamp(1, MAX_CONCURRENCY),
        }
    }

    pub async fn run(
        &self,
        client: &Client,
        candidates: &[CandidateLocation],
        cancel_flag: Option<Arc<AtomicBool>>,
    ) -> AppResult<IngestionSummary> {
        info!(
            target: "ingestion",
            client_id = client.id,
            client = %client.name,
            submitted = candidates.len(),
            "ingestion run started"
        );

        let mut outcomes = OutcomeAccumulator::new(client.id);
        let (distinct, repeated) = dedupe_batch(candidates);
        for candidate in repeated {
            warn!(
                target: "ingestion",
                client_id = client.id,
                address = %candidate,
                "restaurant repeated within batch; skipping"
            );
            outcomes.record(
                candidate,
                CandidateOutcome::Skipped {
                    reason: SkipReason::DuplicateInBatch,
                },
            );
        }

        let cancel = cancel_flag.as_deref();
        let mut results = stream::iter(distinct)
            .map(|candidate| self.process_candidate(client, candidate, cancel))
            .buffered(self.concurrency);

        while let Some(result) = results.next().await {
            match result? {
                Some((candidate, outcome)) => outcomes.record(candidate, outcome),
                None => outcomes.mark_unprocessed(),
            }
        }

        let summary = outcomes.finish();
        {
            let conn = self.db.lock();
            if let Err(err) = summary.persist(&conn) {
                warn!(target: "ingestion", ?err, client_id = client.id, "failed to record ingestion run");
            }
        }

        info!(
            target: "ingestion",
            client_id = client.id,
            inserted = summary.inserted,
            skipped = summary.skipped,
            failed = summary.failed,
            unprocessed = summary.unprocessed,
            cancelled = summary.cancelled,
            "ingestion run completed"
        );
        Ok(summary)
    }

    async fn process_candidate(
        &self,
        client: &Client,
        candidate: CandidateLocation,
        cancel: Option<&AtomicBool>,
    ) -> AppResult<Option<(CandidateLocation, CandidateOutcome)>> {
        if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Ok(None);
        }

        let existing = {
            let conn = self.db.lock();
            find_existing(&conn, &LocationKey::new(client.id, &candidate))
                .map_err(|err| storage_abort(client, err))?
        };
        if let Some(location_id) = existing {
            warn!(
                target: "ingestion",
                client_id = client.id,
                location_id,
                address = %candidate,
                "restaurant already exists; skipping"
            );
            return Ok(Some(skipped(candidate, SkipReason::AlreadyExists)));
        }

        let coordinates = match self.geocoder.lookup(&candidate).await {
            Ok(GeocodeOutcome::Located(coordinates)) => coordinates,
            Ok(miss) => {
                warn!(
                    target: "ingestion",
                    client_id = client.id,
                    address = %candidate,
                    outcome = ?miss,
                    "geocoder found no usable coordinates; skipping"
                );
                return Ok(Some(skipped(candidate, SkipReason::GeocodeMiss)));
            }
            Err(err) => {
                error!(
                    target: "ingestion",
                    client_id = client.id,
                    address = %candidate,
                    error = %err,
                    "geocoding failed"
                );
                return Ok(Some(failed(
                    candidate,
                    FailureReason::GeocoderUnavailable(err.to_string()),
                )));
            }
        };

        let inserted = {
            let conn = self.db.lock();
            insert_if_absent(&conn, client.id, &candidate, coordinates)
        };
        match inserted {
            Ok(Some(location_id)) => {
                info!(
                    target: "ingestion",
                    client_id = client.id,
                    location_id,
                    address = %candidate,
                    latitude = coordinates.latitude,
                    longitude = coordinates.longitude,
                    "restaurant added"
                );
                Ok(Some((candidate, CandidateOutcome::Inserted { location_id })))
            }
            Ok(None) => {
                warn!(
                    target: "ingestion",
                    client_id = client.id,
                    address = %candidate,
                    "restaurant inserted concurrently; skipping"
                );
                Ok(Some(skipped(candidate, SkipReason::AlreadyExists)))
            }
            Err(err) if err.is_constraint_violation() => {
                error!(
                    target: "ingestion",
                    client_id = client.id,
                    address = %candidate,
                    error = %err,
                    "restaurant rejected by storage"
                );
                Ok(Some(failed(candidate, FailureReason::Persistence(err.to_string()))))
            }
            Err(err) => Err(storage_abort(client, err)),
        }
    }
}

fn skipped(candidate: CandidateLocation, reason: SkipReason) -> (CandidateLocation, CandidateOutcome) {
    (candidate, CandidateOutcome::Skipped { reason })
}

fn failed(
    candidate: CandidateLocation,
    reason: FailureReason,
) -> (CandidateLocation, CandidateOutcome) {
    (candidate, CandidateOutcome::Failed { reason })
}

fn storage_abort(client: &Client, err: AppError) -> AppError {
    error!(
        target: "ingestion",
        client_id = client.id,
        error = %err,
        "storage unavailable; aborting ingestion run"
    );
    err
}
