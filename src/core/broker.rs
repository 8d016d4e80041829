use crate::core::db;
use crate::core::error;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// The DB Broker is the "Thin Waist" for state access.
///
/// Every store operation goes through it so that each one gets a fresh
/// connection, runs mutations inside an `IMMEDIATE` transaction, and leaves a
/// line in the audit ledger. Per-context exclusion lives in `core::locks`;
/// the broker itself takes no process-wide lock.
pub struct DbBroker {
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub intent_ref: Option<String>,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(schemas::BROKER_EVENTS_NAME),
        }
    }

    /// Execute a read-side closure with a fresh connection to the specified DB.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, error::MoltError>
    where
        F: FnOnce(&Connection) -> Result<R, error::MoltError>,
    {
        let db_id = db_id(db_path);
        let conn = db::db_connect(&db_path.to_string_lossy())?;

        let result = f(&conn);

        let status = if result.is_ok() { "success" } else { "error" };
        self.log_event(actor, intent_ref, op_name, &db_id, status)?;

        result
    }

    /// Execute a mutating closure inside one `IMMEDIATE` transaction.
    ///
    /// The transaction commits only when the closure returns `Ok`; any error
    /// (or panic) rolls it back, so a rejected mutation leaves prior state
    /// unchanged.
    pub fn with_tx<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, error::MoltError>
    where
        F: FnOnce(&Connection) -> Result<R, error::MoltError>,
    {
        let db_id = db_id(db_path);
        let mut conn = db::db_connect(&db_path.to_string_lossy())?;

        let result = run_immediate(&mut conn, f);

        let status = if result.is_ok() { "success" } else { "error" };
        if let Err(e) = &result {
            tracing::debug!(op = op_name, error = %e, "transaction rolled back");
        }
        self.log_event(actor, intent_ref, op_name, &db_id, status)?;

        result
    }

    fn log_event(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op: &str,
        db_id: &str,
        status: &str,
    ) -> Result<(), error::MoltError> {
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            intent_ref: intent_ref.map(|s| s.to_string()),
            op: op.to_string(),
            db_id: db_id.to_string(),
            status: status.to_string(),
        };

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(error::MoltError::IoError)?;

        writeln!(f, "{}", serde_json::to_string(&ev)?).map_err(error::MoltError::IoError)?;
        Ok(())
    }

    /// Read back the audit ledger, optionally keeping only the last `last_n` events.
    pub fn audit_events(&self, last_n: Option<usize>) -> Result<Vec<BrokerEvent>, error::MoltError> {
        if !self.audit_log_path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.audit_log_path).map_err(error::MoltError::IoError)?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(error::MoltError::IoError)?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<BrokerEvent>(trimmed)?);
        }
        if let Some(n) = last_n
            && events.len() > n
        {
            events.drain(..events.len() - n);
        }
        Ok(events)
    }
}

fn run_immediate<F, R>(conn: &mut Connection, f: F) -> Result<R, error::MoltError>
where
    F: FnOnce(&Connection) -> Result<R, error::MoltError>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn db_id(db_path: &Path) -> String {
    db_path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string()
}
