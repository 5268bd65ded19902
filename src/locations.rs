use std::collections::HashSet;
use std::fmt;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// An address submitted for ingestion. Not persisted until geocoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateLocation {
    pub route: String,
    pub postal_code: String,
    pub city: String,
    pub country: String,
}

impl CandidateLocation {
    pub fn new(
        route: impl Into<String>,
        postal_code: impl Into<String>,
        city: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self {
            route: route.into(),
            postal_code: postal_code.into(),
            city: city.into(),
            country: country.into(),
        }
    }
}

impl fmt::Display for CandidateLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}, {}",
            self.route, self.postal_code, self.city, self.country
        )
    }
}

/// Identity of a physical location inside one client's scope. Fields are
/// compared verbatim: no case folding, trimming or abbreviation handling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationKey<'a> {
    pub client_id: i64,
    pub route: &'a str,
    pub postal_code: &'a str,
    pub city: &'a str,
    pub country: &'a str,
}

impl<'a> LocationKey<'a> {
    pub fn new(client_id: i64, candidate: &'a CandidateLocation) -> Self {
        Self {
            client_id,
            route: &candidate.route,
            postal_code: &candidate.postal_code,
            city: &candidate.city,
            country: &candidate.country,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredLocation {
    pub id: i64,
    pub client_id: i64,
    pub route: String,
    pub postal_code: String,
    pub city: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: String,
}

/// Splits a submitted batch into first occurrences (in input order) and the
/// repeats that follow them.
pub fn dedupe_batch(
    candidates: &[CandidateLocation],
) -> (Vec<CandidateLocation>, Vec<CandidateLocation>) {
    let mut seen = HashSet::with_capacity(candidates.len());
    let mut distinct = Vec::with_capacity(candidates.len());
    let mut repeated = Vec::new();
    for candidate in candidates {
        if seen.insert(candidate) {
            distinct.push(candidate.clone());
        } else {
            repeated.push(candidate.clone());
        }
    }
    (distinct, repeated)
}

pub fn find_existing(connection: &Connection, key: &LocationKey<'_>) -> AppResult<Option<i64>> {
    connection
        .query_row(
            "SELECT id FROM restaurants
            WHERE client_id = ?1 AND route = ?2 AND postal_code = ?3 AND city = ?4 AND country = ?5
            LIMIT 1",
            params![
                key.client_id,
                key.route,
                key.postal_code,
                key.city,
                key.country
            ],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
}

pub fn location_exists(connection: &Connection, key: &LocationKey<'_>) -> AppResult<bool> {
    find_existing(connection, key).map(|id| id.is_some())
}

/// Inserts the location unless its key is already taken. Returns the new id,
/// or `None` when another writer got there first.
pub fn insert_if_absent(
    connection: &Connection,
    client_id: i64,
    candidate: &CandidateLocation,
    coordinates: Coordinates,
) -> AppResult<Option<i64>> {
    let changed = connection.execute(
        "INSERT INTO restaurants (client_id, route, postal_code, city, country, latitude, longitude)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(client_id, route, postal_code, city, country) DO NOTHING",
        params![
            client_id,
            candidate.route,
            candidate.postal_code,
            candidate.city,
            candidate.country,
            coordinates.latitude,
            coordinates.longitude
        ],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    Ok(Some(connection.last_insert_rowid()))
}

pub fn list_for_client(connection: &Connection, client_id: i64) -> AppResult<Vec<StoredLocation>> {
    let mut stmt = connection.prepare(
        "SELECT id, client_id, route, postal_code, city, country, latitude, longitude, created_at
        FROM restaurants
        WHERE client_id = ?1
        ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([client_id], |row| {
            Ok(StoredLocation {
                id: row.get(0)?,
                client_id: row.get(1)?,
                route: row.get(2)?,
                postal_code: row.get(3)?,
                city: row.get(4)?,
                country: row.get(5)?,
                latitude: row.get(6)?,
                longitude: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
