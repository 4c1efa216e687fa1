//! libSQL backend: async `Database` trait implementation.
//!
//! A single connection sits behind an async mutex. Every trait method holds
//! the lock for its whole duration, so compare-and-set updates and bulk
//! transactions never interleave with another caller's statements.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::consent::model::{OptIn, OptInStatus};
use crate::error::DatabaseError;
use crate::requests::model::{
    ConsentView, RequestStatus, SmsRequest, StatusTransition, derive_initial_status,
};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so lexical order matches chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("{column} is not a UUID ({s}): {e}")))
}

/// Render statuses as a SQL `IN (...)` list. Values come from the fixed
/// enum vocabulary, never from user input.
fn status_list(statuses: &[RequestStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map a write error, surfacing constraint failures distinctly.
fn write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

const OPTIN_COLUMNS: &str = "id, number, codeword, status, created_at, updated_at";

const REQUEST_COLUMNS: &str =
    "id, from_number, to_number, from_optin_id, to_optin_id, status, message, created_at";

/// Map a libsql Row to an OptIn. Column order matches OPTIN_COLUMNS.
fn row_to_optin(row: &libsql::Row) -> Result<OptIn, DatabaseError> {
    let get = |idx: i32| {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("optin row column {idx}: {e}")))
    };
    let status: OptInStatus = get(3)?
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("optin status: {e}")))?;

    Ok(OptIn {
        id: parse_uuid(&get(0)?, "optins.id")?,
        number: get(1)?,
        codeword: get(2)?,
        status,
        created: parse_datetime(&get(4)?),
        updated: parse_datetime(&get(5)?),
    })
}

/// Map a libsql Row to an SmsRequest, reading REQUEST_COLUMNS starting at `offset`.
fn row_to_request(row: &libsql::Row, offset: i32) -> Result<SmsRequest, DatabaseError> {
    let get = |idx: i32| {
        row.get::<String>(offset + idx)
            .map_err(|e| DatabaseError::Query(format!("sms_request row column {idx}: {e}")))
    };
    let status: RequestStatus = get(5)?
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("sms_request status: {e}")))?;

    Ok(SmsRequest {
        id: parse_uuid(&get(0)?, "sms_requests.id")?,
        from_number: get(1)?,
        to_number: get(2)?,
        from_optin_id: parse_uuid(&get(3)?, "sms_requests.from_optin_id")?,
        to_optin_id: parse_uuid(&get(4)?, "sms_requests.to_optin_id")?,
        status,
        message: get(6)?,
        created: parse_datetime(&get(7)?),
    })
}

async fn fetch_optin(
    conn: &Connection,
    clause: &str,
    value: String,
) -> Result<Option<OptIn>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {OPTIN_COLUMNS} FROM optins WHERE {clause} LIMIT 1"),
            params![value],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("fetch_optin: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_optin(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("fetch_optin row: {e}"))),
    }
}

async fn fetch_request(conn: &Connection, id: Uuid) -> Result<Option<SmsRequest>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {REQUEST_COLUMNS} FROM sms_requests WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_request: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_request(&row, 0)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_request row: {e}"))),
    }
}

async fn write_request(
    conn: &Connection,
    request: &SmsRequest,
    op: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO sms_requests ({REQUEST_COLUMNS}, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)"
        ),
        params![
            request.id.to_string(),
            request.from_number.as_str(),
            request.to_number.as_str(),
            request.from_optin_id.to_string(),
            request.to_optin_id.to_string(),
            request.status.as_str(),
            request.message.as_str(),
            format_datetime(&request.created),
        ],
    )
    .await
    .map_err(|e| write_error(op, e))?;
    Ok(())
}

async fn party_status(conn: &Connection, id: Uuid) -> Result<OptInStatus, DatabaseError> {
    fetch_optin(conn, "id = ?1", id.to_string())
        .await?
        .map(|optin| optin.status)
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "optin".into(),
            id: id.to_string(),
        })
}

async fn write_request_with_consent(
    conn: &Connection,
    request: &SmsRequest,
) -> Result<ConsentView, DatabaseError> {
    let from_status = party_status(conn, request.from_optin_id).await?;
    let to_status = party_status(conn, request.to_optin_id).await?;

    let request = SmsRequest {
        status: derive_initial_status(from_status, to_status),
        ..request.clone()
    };
    write_request(conn, &request, "insert_request_with_consent").await?;

    Ok(ConsentView {
        request,
        from_status,
        to_status,
    })
}

async fn execute_transitions(
    conn: &Connection,
    transitions: &[StatusTransition],
    now: &str,
) -> Result<usize, DatabaseError> {
    let mut changed = 0;
    for transition in transitions {
        if transition.from.is_empty() {
            continue;
        }
        let count = conn
            .execute(
                &format!(
                    "UPDATE sms_requests SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})",
                    status_list(transition.from)
                ),
                params![
                    transition.to.as_str(),
                    now,
                    transition.request_id.to_string()
                ],
            )
            .await
            .map_err(|e| write_error("apply_transitions", e))?;
        changed += count as usize;
    }
    Ok(changed)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    // ── Opt-ins ─────────────────────────────────────────────────────

    async fn insert_optin(&self, optin: &OptIn) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO optins ({OPTIN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                optin.id.to_string(),
                optin.number.as_str(),
                optin.codeword.as_str(),
                optin.status.as_str(),
                format_datetime(&optin.created),
                format_datetime(&optin.updated),
            ],
        )
        .await
        .map_err(|e| write_error("insert_optin", e))?;

        debug!(optin_id = %optin.id, number = %optin.number, "Opt-in inserted into DB");
        Ok(())
    }

    async fn get_optin(&self, id: Uuid) -> Result<Option<OptIn>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_optin(&conn, "id = ?1", id.to_string()).await
    }

    async fn get_optin_by_number(&self, number: &str) -> Result<Option<OptIn>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_optin(&conn, "number = ?1", number.to_string()).await
    }

    async fn transition_optin_status(
        &self,
        id: Uuid,
        from: OptInStatus,
        to: OptInStatus,
    ) -> Result<Option<OptIn>, DatabaseError> {
        let conn = self.conn.lock().await;
        let now = format_datetime(&Utc::now());
        let count = conn
            .execute(
                "UPDATE optins SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), now, id.to_string(), from.as_str()],
            )
            .await
            .map_err(|e| write_error("transition_optin_status", e))?;

        if count == 0 {
            debug!(optin_id = %id, from = %from, to = %to, "Opt-in status moved concurrently");
            return Ok(None);
        }
        debug!(optin_id = %id, from = %from, to = %to, "Opt-in status updated in DB");
        fetch_optin(&conn, "id = ?1", id.to_string()).await
    }

    async fn earliest_optin_with_status(
        &self,
        status: OptInStatus,
    ) -> Result<Option<OptIn>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {OPTIN_COLUMNS} FROM optins WHERE status = ?1 ORDER BY created_at ASC, rowid ASC LIMIT 1"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("earliest_optin_with_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_optin(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "earliest_optin_with_status row: {e}"
            ))),
        }
    }

    // ── SMS requests ────────────────────────────────────────────────

    async fn insert_request(&self, request: &SmsRequest) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        write_request(&conn, request, "insert_request").await?;
        debug!(request_id = %request.id, status = %request.status, "SMS request inserted into DB");
        Ok(())
    }

    async fn insert_request_with_consent(
        &self,
        request: &SmsRequest,
    ) -> Result<ConsentView, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(|e| {
            DatabaseError::Query(format!("insert_request_with_consent begin: {e}"))
        })?;

        match write_request_with_consent(&tx, request).await {
            Ok(view) => {
                tx.commit().await.map_err(|e| {
                    DatabaseError::Query(format!("insert_request_with_consent commit: {e}"))
                })?;
                debug!(
                    request_id = %view.request.id,
                    status = %view.request.status,
                    "SMS request inserted into DB"
                );
                Ok(view)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback after failed insert also failed");
                }
                Err(e)
            }
        }
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<SmsRequest>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_request(&conn, id).await
    }

    async fn set_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
    ) -> Result<Option<SmsRequest>, DatabaseError> {
        let conn = self.conn.lock().await;
        let now = format_datetime(&Utc::now());
        let count = conn
            .execute(
                "UPDATE sms_requests SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id.to_string()],
            )
            .await
            .map_err(|e| write_error("set_request_status", e))?;

        if count == 0 {
            return Ok(None);
        }
        debug!(request_id = %id, status = %status, "SMS request status overwritten in DB");
        fetch_request(&conn, id).await
    }

    async fn apply_transitions(
        &self,
        transitions: &[StatusTransition],
    ) -> Result<usize, DatabaseError> {
        if transitions.is_empty() {
            return Ok(0);
        }

        let conn = self.conn.lock().await;
        let now = format_datetime(&Utc::now());
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_transitions begin: {e}")))?;

        match execute_transitions(&tx, transitions, &now).await {
            Ok(changed) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("apply_transitions commit: {e}")))?;
                debug!(
                    requested = transitions.len(),
                    changed, "Status transitions committed"
                );
                Ok(changed)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback after failed transitions also failed");
                }
                Err(e)
            }
        }
    }

    async fn earliest_request_with_status(
        &self,
        status: RequestStatus,
    ) -> Result<Option<SmsRequest>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM sms_requests WHERE status = ?1 ORDER BY created_at ASC, rowid ASC LIMIT 1"
                ),
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("earliest_request_with_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_request(&row, 0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "earliest_request_with_status row: {e}"
            ))),
        }
    }

    async fn list_requests_for_optin(
        &self,
        optin_id: Uuid,
        statuses: &[RequestStatus],
    ) -> Result<Vec<ConsentView>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT f.status, t.status, r.id, r.from_number, r.to_number, r.from_optin_id, \
                            r.to_optin_id, r.status, r.message, r.created_at \
                     FROM sms_requests r \
                     JOIN optins f ON f.id = r.from_optin_id \
                     JOIN optins t ON t.id = r.to_optin_id \
                     WHERE (r.from_optin_id = ?1 OR r.to_optin_id = ?1) AND r.status IN ({}) \
                     ORDER BY r.created_at ASC, r.rowid ASC",
                    status_list(statuses)
                ),
                params![optin_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_requests_for_optin: {e}")))?;

        let mut views = Vec::new();
        loop {
            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => {
                    return Err(DatabaseError::Query(format!(
                        "list_requests_for_optin row: {e}"
                    )));
                }
            };
            let party_status = |idx: i32| -> Result<OptInStatus, DatabaseError> {
                row.get::<String>(idx)
                    .map_err(|e| DatabaseError::Query(format!("party status column {idx}: {e}")))?
                    .parse()
                    .map_err(|e| DatabaseError::Serialization(format!("party status: {e}")))
            };
            views.push(ConsentView {
                from_status: party_status(0)?,
                to_status: party_status(1)?,
                request: row_to_request(&row, 2)?,
            });
        }
        Ok(views)
    }
}
