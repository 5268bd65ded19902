use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::locations::CandidateLocation;

const MAX_FIELD_LENGTH: usize = 255;
const SIREN_TAKEN: &str = "The siren has already been taken.";
const EMAIL_TAKEN: &str = "The email has already been taken.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: i64,
    pub name: String,
    pub siren: String,
    pub contact: String,
    pub email: String,
    pub phone: String,
    pub created_at: String,
}

/// Registration payload. `restaurants` is optional and may be empty.
#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub name: String,
    pub siren: String,
    pub contact: String,
    pub email: String,
    pub phone: String,
    #[serde(default)]
    pub restaurants: Option<Vec<CandidateLocation>>,
}

impl NewClient {
    pub fn validate(&self) -> AppResult<()> {
        for (field, value) in [
            ("name", &self.name),
            ("siren", &self.siren),
            ("contact", &self.contact),
            ("email", &self.email),
            ("phone", &self.phone),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!("The {field} field is required.")));
            }
            if value.chars().count() > MAX_FIELD_LENGTH {
                return Err(AppError::Validation(format!(
                    "The {field} may not be greater than {MAX_FIELD_LENGTH} characters."
                )));
            }
        }
        if !looks_like_email(self.email.trim()) {
            return Err(AppError::Validation(
                "The email must be a valid email address.".into(),
            ));
        }
        Ok(())
    }
}

fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !value.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .map(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
            .unwrap_or(false)
}

/// Validates, enforces SIREN and email uniqueness, then stores the client.
pub fn create_client(connection: &mut Connection, payload: &NewClient) -> AppResult<Client> {
    payload.validate()?;

    let tx = connection.transaction()?;
    if taken(&tx, "siren", payload.siren.trim())? {
        warn!(
            target: "clients",
            siren = %payload.siren,
            "a customer already exists with this SIREN number"
        );
        return Err(AppError::Conflict(SIREN_TAKEN.into()));
    }
    if taken(&tx, "email", payload.email.trim())? {
        return Err(AppError::Conflict(EMAIL_TAKEN.into()));
    }

    tx.execute(
        "INSERT INTO clients (name, siren, contact, email, phone) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            payload.name.trim(),
            payload.siren.trim(),
            payload.contact.trim(),
            payload.email.trim(),
            payload.phone.trim()
        ],
    )
    .map_err(uniqueness_conflict)?;
    let id = tx.last_insert_rowid();
    let client = load(&tx, id)?
        .ok_or(AppError::Database(rusqlite::Error::QueryReturnedNoRows))?;
    tx.commit()?;

    info!(
        target: "clients",
        client_id = client.id,
        siren = %client.siren,
        "client created"
    );
    Ok(client)
}

pub fn list_clients(connection: &Connection) -> AppResult<Vec<Client>> {
    let mut stmt = connection.prepare(
        "SELECT id, name, siren, contact, email, phone, created_at FROM clients ORDER BY id ASC",
    )?;
    let clients = stmt
        .query_map([], parse_client)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(clients)
}

pub fn find_client(connection: &Connection, id: i64) -> AppResult<Option<Client>> {
    load(connection, id)
}

fn load(connection: &Connection, id: i64) -> AppResult<Option<Client>> {
    connection
        .query_row(
            "SELECT id, name, siren, contact, email, phone, created_at FROM clients WHERE id = ?1",
            [id],
            parse_client,
        )
        .optional()
        .map_err(AppError::from)
}

fn taken(connection: &Connection, column: &str, value: &str) -> AppResult<bool> {
    let sql = format!("SELECT EXISTS(SELECT 1 FROM clients WHERE {column} = ?1)");
    let exists: bool = connection.query_row(&sql, [value], |row| row.get(0))?;
    Ok(exists)
}

/// A registration racing ours can slip past `taken` and trip the UNIQUE
/// index instead; report it the same way.
fn uniqueness_conflict(err: rusqlite::Error) -> AppError {
    let err = AppError::from(err);
    if err.is_constraint_violation() {
        let detail = err.to_string();
        if detail.contains("clients.siren") {
            return AppError::Conflict(SIREN_TAKEN.into());
        }
        if detail.contains("clients.email") {
            return AppError::Conflict(EMAIL_TAKEN.into());
        }
    }
    err
}

fn parse_client(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        name: row.get(1)?,
        siren: row.get(2)?,
        contact: row.get(3)?,
        email: row.get(4)?,
        phone: row.get(5)?,
        created_at: row.get(6)?,
    })
}
