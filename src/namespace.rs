//! A `db.collection` namespace, parsed and validated once at the point a
//! command is decoded rather than re-parsed by every downstream consumer.

use crate::error::{CommandError, Error, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, collection: impl Into<String>) -> Result<Self> {
        let db = db.into();
        let collection = collection.into();
        validate_db_name(&db)?;
        validate_collection_name(&collection)?;
        Ok(Self { db, collection })
    }

    /// Parse a full namespace string of the form `db.collection`. Only the
    /// first `.` is significant; collection names may themselves contain
    /// dots (e.g. `system.indexes`).
    pub fn parse(full: &str) -> Result<Self> {
        match full.split_once('.') {
            Some((db, coll)) => Namespace::new(db, coll),
            None => Err(Error::Command(CommandError::BadValue(format!(
                "invalid namespace '{}': expected db.collection",
                full
            )))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.collection)
    }
}

fn validate_db_name(db: &str) -> Result<()> {
    if db.is_empty() {
        return Err(Error::Command(CommandError::BadValue(
            "database name cannot be empty".to_string(),
        )));
    }
    if db.contains('.') || db.contains('$') || db.contains(' ') {
        return Err(Error::Command(CommandError::BadValue(format!(
            "invalid database name '{}'",
            db
        ))));
    }
    Ok(())
}

fn validate_collection_name(coll: &str) -> Result<()> {
    if coll.is_empty() {
        return Err(Error::Command(CommandError::BadValue(
            "collection name cannot be empty".to_string(),
        )));
    }
    if coll.starts_with('$') {
        return Err(Error::Command(CommandError::BadValue(format!(
            "invalid collection name '{}'",
            coll
        ))));
    }
    Ok(())
}
