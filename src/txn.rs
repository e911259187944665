//! Transaction manager: one `Session` per driver-supplied `lsid`, each
//! holding at most one active, engine-snapshot-isolated transaction.
//!
//! `SessionManager`/`Session` are lsid-keyed behind a monitor, with
//! per-session `txnNumber` bookkeeping and last-activity tracking for
//! cleanup; each active transaction holds a full engine snapshot rather
//! than a database client handle.

use crate::bson_util::canonical_string;
use crate::engine::EngineSnapshot;
use crate::error::{CommandError, Error, ErrorLabel, Result};
use bson::Document;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;

/// An in-progress transaction: the engine snapshot it reads/writes against
/// and the `txnNumber` it was opened at.
pub struct ActiveTransaction {
    pub txn_number: i64,
    pub snapshot: EngineSnapshot,
}

pub struct Session {
    pub last_seen_txn_number: i64,
    pub active: Option<ActiveTransaction>,
    pub last_activity: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            last_seen_txn_number: -1,
            active: None,
            last_activity: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Validated, pre-dispatch view of a command's transaction-related envelope
/// fields.
#[derive(Debug, Clone)]
pub struct TxnEnvelope {
    pub lsid: Document,
    pub txn_number: Option<i64>,
    pub autocommit: Option<bool>,
    pub start_transaction: bool,
}

impl TxnEnvelope {
    pub fn extract(body: &Document) -> Result<Option<Self>> {
        let Some(lsid) = body.get_document("lsid").ok() else {
            return Ok(None);
        };

        let txn_number = match body.get("txnNumber") {
            Some(v) => Some(coerce_txn_number(v)?),
            None => None,
        };

        let autocommit = match body.get("autocommit") {
            Some(bson::Bson::Boolean(b)) => Some(*b),
            Some(_) => {
                return Err(Error::Command(CommandError::TypeMismatch(
                    "autocommit must be a boolean".to_string(),
                )));
            }
            None => None,
        };

        let start_transaction = match body.get("startTransaction") {
            Some(bson::Bson::Boolean(true)) => true,
            Some(bson::Bson::Boolean(false)) => {
                return Err(Error::Command(CommandError::BadValue(
                    "startTransaction must be true if present".to_string(),
                )));
            }
            Some(_) => {
                return Err(Error::Command(CommandError::TypeMismatch(
                    "startTransaction must be a boolean".to_string(),
                )));
            }
            None => false,
        };

        if let Some(autocommit) = autocommit {
            if autocommit {
                return Err(Error::Command(CommandError::BadValue(
                    "autocommit must be false for transactional commands".to_string(),
                )));
            }
        }

        Ok(Some(Self {
            lsid: lsid.clone(),
            txn_number,
            autocommit,
            start_transaction,
        }))
    }
}

/// Validate the transaction-adjacent envelope fields that depend on the
/// command name: `readConcern` only at `startTransaction`, `writeConcern`
/// only at commit/abort, and `readPreference`/`$readPreference` (not both)
/// restricted to `mode="primary"`.
pub fn validate_concerns(body: &Document, command_name: &str, start_transaction: bool) -> Result<()> {
    if body.contains_key("readConcern") && !start_transaction {
        return Err(Error::Command(CommandError::BadValue(
            "readConcern is only allowed when starting a transaction".to_string(),
        )));
    }
    if body.contains_key("writeConcern") && !matches!(command_name, "committransaction" | "aborttransaction") {
        return Err(Error::Command(CommandError::BadValue(
            "writeConcern is only allowed on commitTransaction/abortTransaction".to_string(),
        )));
    }
    if body.contains_key("readPreference") && body.contains_key("$readPreference") {
        return Err(Error::Command(CommandError::BadValue(
            "readPreference and $readPreference must not both be set".to_string(),
        )));
    }
    for key in ["readPreference", "$readPreference"] {
        if let Some(pref) = body.get(key) {
            let mode = pref.as_document().and_then(|d| d.get_str("mode").ok());
            if mode != Some("primary") {
                return Err(Error::Command(CommandError::BadValue(format!(
                    "{} must be a document with mode=\"primary\"",
                    key
                ))));
            }
        }
    }
    Ok(())
}

fn coerce_txn_number(v: &bson::Bson) -> Result<i64> {
    let n = match v {
        bson::Bson::Int32(n) => *n as i64,
        bson::Bson::Int64(n) => *n,
        bson::Bson::Double(n) if n.fract() == 0.0 => *n as i64,
        _ => {
            return Err(Error::Command(CommandError::TypeMismatch(
                "txnNumber must be an integer".to_string(),
            )));
        }
    };
    if n < 0 {
        return Err(Error::Command(CommandError::BadValue(
            "txnNumber must not be negative".to_string(),
        )));
    }
    Ok(n)
}

pub enum TxnOutcome {
    /// Not a transactional command at all (no `lsid`), or a retryable write
    /// that bypasses the manager entirely.
    NotTransactional,
    /// Run against the live engine directly (not inside an open transaction).
    RunLive,
    /// Run against the named active transaction's snapshot.
    RunSnapshot,
    Committed,
    Aborted,
}

pub struct TransactionManager {
    sessions: Mutex<HashMap<String, Session>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn key(lsid: &Document) -> String {
        canonical_string(lsid)
    }

    /// Drive the session state machine for a transactional envelope ahead of
    /// dispatching `command_name`. Returns how the caller should execute the
    /// command; for `RunLive` with `start_transaction=true` the caller must
    /// follow up with `install_snapshot` once it has taken an engine
    /// snapshot, and for `RunSnapshot` with `take_snapshot`/`put_snapshot`.
    pub async fn begin(&self, envelope: &TxnEnvelope, command_name: &str) -> Result<TxnOutcome> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(Self::key(&envelope.lsid)).or_insert_with(Session::new);
        session.touch();

        let Some(txn_number) = envelope.txn_number else {
            return Ok(TxnOutcome::NotTransactional);
        };

        if envelope.autocommit.is_none() {
            // Plain operation carrying lsid+txnNumber only: retryable write,
            // bypasses the manager.
            return Ok(TxnOutcome::NotTransactional);
        }

        if matches!(command_name, "committransaction" | "aborttransaction") && envelope.start_transaction {
            return Err(Error::Command(CommandError::BadValue(format!(
                "startTransaction is not allowed on {}",
                command_name
            ))));
        }

        if envelope.start_transaction {
            if session.active.is_some() {
                return Err(Error::Command(CommandError::BadValue(
                    "transaction already in progress".to_string(),
                )));
            }
            if txn_number <= session.last_seen_txn_number {
                return Err(Error::Command(CommandError::BadValue(
                    "txnNumber must increase to start a new transaction".to_string(),
                )));
            }
            return Ok(TxnOutcome::RunLive);
        }

        match &session.active {
            Some(active) if active.txn_number == txn_number => match command_name {
                "committransaction" => Ok(TxnOutcome::Committed),
                "aborttransaction" => Ok(TxnOutcome::Aborted),
                _ => Ok(TxnOutcome::RunSnapshot),
            },
            _ => Err(Error::Command(CommandError::NoSuchTransaction)),
        }
    }

    /// Install a freshly snapshotted transaction after `begin` returned
    /// `RunLive` with `start_transaction=true`.
    pub async fn install_snapshot(&self, lsid: &Document, txn_number: i64, snapshot: EngineSnapshot) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(Self::key(lsid)).or_insert_with(Session::new);
        session.last_seen_txn_number = txn_number;
        session.active = Some(ActiveTransaction { txn_number, snapshot });
    }

    pub async fn take_snapshot(&self, lsid: &Document) -> Option<EngineSnapshot> {
        let mut sessions = self.sessions.lock().await;
        sessions.get_mut(&Self::key(lsid)).and_then(|s| s.active.take()).map(|a| a.snapshot)
    }

    pub async fn put_snapshot(&self, lsid: &Document, txn_number: i64, snapshot: EngineSnapshot) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(Self::key(lsid)).or_insert_with(Session::new);
        session.active = Some(ActiveTransaction { txn_number, snapshot });
    }

    pub async fn clear(&self, lsid: &Document) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&Self::key(lsid)) {
            session.active = None;
        }
    }

    /// `endSessions`-style cleanup: drop the named sessions' bookkeeping.
    pub async fn end_sessions(&self, lsids: &[Document]) {
        let mut sessions = self.sessions.lock().await;
        for lsid in lsids {
            sessions.remove(&Self::key(lsid));
        }
    }

    pub fn error_label_for(command_name: &str) -> Option<ErrorLabel> {
        match command_name {
            "committransaction" => Some(ErrorLabel::UnknownTransactionCommitResult),
            "aborttransaction" => None,
            _ => Some(ErrorLabel::TransientTransactionError),
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn lsid() -> Document {
        doc! {"id": bson::Bson::Binary(bson::Binary { subtype: bson::spec::BinarySubtype::Uuid, bytes: vec![1, 2, 3] })}
    }

    #[tokio::test]
    async fn start_transaction_requires_increasing_txn_number() {
        let mgr = TransactionManager::new();
        let envelope = TxnEnvelope {
            lsid: lsid(),
            txn_number: Some(5),
            autocommit: Some(false),
            start_transaction: true,
        };
        let outcome = mgr.begin(&envelope, "insert").await;
        assert!(matches!(outcome.unwrap(), TxnOutcome::RunLive));
        mgr.install_snapshot(&envelope.lsid, 5, HashMap::new()).await;

        let reuse = TxnEnvelope {
            txn_number: Some(5),
            start_transaction: true,
            ..envelope.clone()
        };
        let err = mgr.begin(&reuse, "insert").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn unknown_transaction_is_no_such_transaction() {
        let mgr = TransactionManager::new();
        let envelope = TxnEnvelope {
            lsid: lsid(),
            txn_number: Some(1),
            autocommit: Some(false),
            start_transaction: false,
        };
        let outcome = mgr.begin(&envelope, "find").await;
        assert!(matches!(outcome, Err(Error::Command(CommandError::NoSuchTransaction))));
    }

    #[test]
    fn error_labels_match_command() {
        assert_eq!(
            TransactionManager::error_label_for("committransaction").map(|l| l.as_str()),
            Some("UnknownTransactionCommitResult")
        );
        assert_eq!(
            TransactionManager::error_label_for("find").map(|l| l.as_str()),
            Some("TransientTransactionError")
        );
        assert_eq!(TransactionManager::error_label_for("aborttransaction"), None);
    }
}
