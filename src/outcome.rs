use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::errors::AppResult;
use crate::locations::CandidateLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyExists,
    DuplicateInBatch,
    GeocodeMiss,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    GeocoderUnavailable(String),
    Persistence(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CandidateOutcome {
    Inserted { location_id: i64 },
    Skipped { reason: SkipReason },
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    pub candidate: CandidateLocation,
    pub outcome: CandidateOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionSummary {
    pub client_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub unprocessed: usize,
    pub cancelled: bool,
    pub records: Vec<CandidateRecord>,
}

impl IngestionSummary {
    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.records
            .iter()
            .filter(|record| record.outcome == CandidateOutcome::Skipped { reason })
            .count()
    }

    pub fn persist(&self, connection: &Connection) -> AppResult<i64> {
        connection.execute(
            "INSERT INTO ingestion_runs
                (client_id, started_at, finished_at, inserted, skipped, failed, unprocessed, cancelled, details)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                self.client_id,
                self.started_at.to_rfc3339(),
                self.finished_at.to_rfc3339(),
                self.inserted as i64,
                self.skipped as i64,
                self.failed as i64,
                self.unprocessed as i64,
                self.cancelled,
                serde_json::to_string(&self.records)?
            ],
        )?;
        Ok(connection.last_insert_rowid())
    }
}

/// Per-run tally. Counters only ever go up; nothing here outlives the run
/// except the summary it produces.
pub struct OutcomeAccumulator {
    client_id: i64,
    started_at: DateTime<Utc>,
    inserted: usize,
    skipped: usize,
    failed: usize,
    unprocessed: usize,
    records: Vec<CandidateRecord>,
}

impl OutcomeAccumulator {
    pub fn new(client_id: i64) -> Self {
        Self {
            client_id,
            started_at: Utc::now(),
            inserted: 0,
            skipped: 0,
            failed: 0,
            unprocessed: 0,
            records: Vec::new(),
        }
    }

    pub fn record(&mut self, candidate: CandidateLocation, outcome: CandidateOutcome) {
        match &outcome {
            CandidateOutcome::Inserted { .. } => self.inserted += 1,
            CandidateOutcome::Skipped { .. } => self.skipped += 1,
            CandidateOutcome::Failed { .. } => self.failed += 1,
        }
        self.records.push(CandidateRecord { candidate, outcome });
    }

    pub fn mark_unprocessed(&mut self) {
        self.unprocessed += 1;
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn finish(self) -> IngestionSummary {
        IngestionSummary {
            client_id: self.client_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            inserted: self.inserted,
            skipped: self.skipped,
            failed: self.failed,
            cancelled: self.unprocessed > 0,
            unprocessed: self.unprocessed,
            records: self.records,
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::db::bootstrap;

    fn candidate(route: &str) -> CandidateLocation {
        CandidateLocation::new(route, "75001", "Paris", "France")
    }

    #[test]
    fn tallies_each_outcome_kind() {
        let mut outcomes = OutcomeAccumulator::new(1);
        outcomes.record(
            candidate("1 Rue A"),
            CandidateOutcome::Inserted { location_id: 10 },
        );
        outcomes.record(
            candidate("1 Rue A"),
            CandidateOutcome::Skipped {
                reason: SkipReason::DuplicateInBatch,
            },
        );
        outcomes.record(
            candidate("2 Rue B"),
            CandidateOutcome::Skipped {
                reason: SkipReason::GeocodeMiss,
            },
        );
        outcomes.record(
            candidate("3 Rue C"),
            CandidateOutcome::Failed {
                reason: FailureReason::GeocoderUnavailable("timeout".into()),
            },
        );
        assert_eq!(
            (outcomes.inserted(), outcomes.skipped(), outcomes.failed()),
            (1, 2, 1)
        );

        let summary = outcomes.finish();
        assert_eq!(summary.records.len(), 4);
        assert_eq!(summary.skipped_for(SkipReason::GeocodeMiss), 1);
        assert_eq!(summary.skipped_for(SkipReason::AlreadyExists), 0);
        assert!(!summary.cancelled);
        assert!(summary.finished_at >= summary.started_at);
    }

    #[test]
    fn unprocessed_candidates_mark_the_run_cancelled() {
        let mut outcomes = OutcomeAccumulator::new(1);
        outcomes.mark_unprocessed();
        let summary = outcomes.finish();
        assert!(summary.cancelled);
        assert_eq!(summary.unprocessed, 1);
        assert_eq!(summary.inserted + summary.skipped + summary.failed, 0);
    }

    #[test]
    fn persists_run_record_with_details() {
        let dir = tempdir().unwrap();
        let conn = bootstrap(dir.path(), "runs.db").unwrap().connection;
        let mut outcomes = OutcomeAccumulator::new(7);
        outcomes.record(
            candidate("1 Rue A"),
            CandidateOutcome::Skipped {
                reason: SkipReason::AlreadyExists,
            },
        );
        let run_id = outcomes.finish().persist(&conn).unwrap();

        let (skipped, details): (i64, String) = conn
            .query_row(
                "SELECT skipped, details FROM ingestion_runs WHERE id = ?1",
                [run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(skipped, 1);
        assert!(details.contains("already_exists"));
        assert!(details.contains("1 Rue A"));
    }
}
