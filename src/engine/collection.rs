//! A single collection's documents and index definitions.

use crate::bson_util::get_path;
use crate::error::{CommandError, Error, Result};
use crate::matcher::document_matches_filter;
use bson::{Bson, Document};

#[derive(Debug, Clone)]
pub struct IndexDefinition {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
}

impl IndexDefinition {
    pub fn id_index() -> Self {
        Self {
            name: "_id_".to_string(),
            keys: bson::doc! {"_id": 1i32},
            unique: true,
        }
    }

    fn key_fields(&self) -> Vec<&str> {
        self.keys.keys().map(|s| s.as_str()).collect()
    }
}

/// An ordered collection of documents plus the indexes declared over it.
/// Scan order is insertion order; it is the order `find`/`delete`/`update`
/// observe documents in absent an explicit sort.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    pub documents: Vec<Document>,
    pub indexes: Vec<IndexDefinition>,
}

impl Collection {
    pub fn new() -> Self {
        Self {
            documents: Vec::new(),
            indexes: vec![IndexDefinition::id_index()],
        }
    }

    /// Extract the tuple of key values a unique index would store for `doc`.
    /// A missing key field canonicalizes to `Null`, matching MongoDB: a
    /// unique index is not sparse by default, so two documents both missing
    /// the key still collide.
    fn index_values(index: &IndexDefinition, doc: &Document) -> Vec<Bson> {
        index
            .key_fields()
            .into_iter()
            .map(|field| get_path(doc, field).unwrap_or(Bson::Null))
            .collect()
    }

    /// Check whether inserting/updating `doc` (identified by not being
    /// `exclude`, compared by pointer via position) would violate any unique
    /// index.
    pub fn check_unique_conflicts(&self, doc: &Document, exclude_pos: Option<usize>) -> Result<()> {
        for index in &self.indexes {
            if !index.unique {
                continue;
            }
            let values = Self::index_values(index, doc);
            for (pos, existing) in self.documents.iter().enumerate() {
                if Some(pos) == exclude_pos {
                    continue;
                }
                let existing_values = Self::index_values(index, existing);
                if existing_values == values {
                    return Err(Error::Command(CommandError::DuplicateKey(format!(
                        "index: {} dup key: {:?}",
                        index.name, values
                    ))));
                }
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, doc: Document) -> Result<()> {
        self.check_unique_conflicts(&doc, None)?;
        self.documents.push(doc);
        Ok(())
    }

    pub fn find(&self, filter: &Document) -> Vec<&Document> {
        self.documents
            .iter()
            .filter(|d| document_matches_filter(d, filter))
            .collect()
    }

    pub fn create_index(&mut self, def: IndexDefinition) -> Result<()> {
        if let Some(existing) = self.indexes.iter().find(|i| i.name == def.name) {
            if existing.keys == def.keys && existing.unique == def.unique {
                return Ok(());
            }
            return Err(Error::Command(CommandError::BadValue(format!(
                "index '{}' already exists with different options",
                def.name
            ))));
        }
        if def.unique {
            for (pos, doc) in self.documents.iter().enumerate() {
                let values = Self::index_values(&def, doc);
                for other in self.documents.iter().skip(pos + 1) {
                    if Self::index_values(&def, other) == values {
                        return Err(Error::Command(CommandError::DuplicateKey(format!(
                            "index: {} dup key: {:?}",
                            def.name, values
                        ))));
                    }
                }
            }
        }
        self.indexes.push(def);
        Ok(())
    }

    pub fn drop_indexes(&mut self, names: &[String]) {
        if names.iter().any(|n| n == "*") {
            self.indexes.retain(|i| i.name == "_id_");
            return;
        }
        self.indexes.retain(|i| i.name == "_id_" || !names.contains(&i.name));
    }
}
