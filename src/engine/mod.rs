//! The in-memory document engine: one ordered `Collection` per namespace,
//! guarded by a single `RwLock` so reads run concurrently and writes are
//! serialized. This is the storage substrate the dispatcher drives; it has
//! no notion of the wire protocol or of commands.
//!
//! Every operation's real logic lives in a `do_*` free function over a plain
//! `&mut HashMap<Namespace, Collection>` (or `&HashMap` for reads). The async
//! `Engine` methods just acquire the lock and call through. The dispatcher's
//! transaction path reuses the exact same `do_*` functions directly against a
//! transaction's snapshot map, so live and in-transaction execution can never
//! drift apart.

pub mod collection;
pub mod update;

use crate::bson_util::get_path;
use crate::error::{CommandError, Error, Result};
use crate::matcher::document_matches_filter;
use crate::namespace::Namespace;
use bson::{Bson, Document};
use collection::{Collection, IndexDefinition};
use std::collections::HashMap;
use tokio::sync::RwLock;
use update::apply_update;

#[derive(Debug, Clone, Default)]
pub struct WriteError {
    pub index: usize,
    pub code: i32,
    pub code_name: &'static str,
    pub errmsg: String,
}

#[derive(Debug, Clone, Default)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub write_errors: Vec<WriteError>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    pub matched: usize,
    pub modified: usize,
    pub upserted_id: Option<Bson>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    pub deleted: usize,
}

/// A point-in-time copy of every namespace's data, used by the transaction
/// manager to snapshot-isolate an `Active` transaction and roll it back on
/// abort.
pub type EngineSnapshot = HashMap<Namespace, Collection>;

#[derive(Default)]
pub struct Engine {
    namespaces: RwLock<HashMap<Namespace, Collection>>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    pub async fn snapshot(&self) -> EngineSnapshot {
        self.namespaces.read().await.clone()
    }

    pub async fn restore(&self, snapshot: EngineSnapshot) {
        *self.namespaces.write().await = snapshot;
    }

    /// Atomically replace the engine with an empty one. Test-only; never
    /// exposed as a driver-visible command.
    pub async fn reset(&self) {
        self.namespaces.write().await.clear();
    }

    pub async fn insert(&self, ns: &Namespace, docs: Vec<Document>, ordered: bool) -> Result<InsertOutcome> {
        let mut namespaces = self.namespaces.write().await;
        do_insert(&mut namespaces, ns, docs, ordered)
    }

    pub async fn find(
        &self,
        ns: &Namespace,
        filter: &Document,
        projection: Option<&Document>,
        sort: Option<&Document>,
        skip: u64,
        limit: Option<u64>,
    ) -> Vec<Document> {
        let namespaces = self.namespaces.read().await;
        do_find(&namespaces, ns, filter, projection, sort, skip, limit)
    }

    pub async fn count(&self, ns: &Namespace, filter: &Document) -> u64 {
        let namespaces = self.namespaces.read().await;
        do_count(&namespaces, ns, filter)
    }

    pub async fn distinct(&self, ns: &Namespace, field: &str, filter: &Document) -> Vec<Bson> {
        let namespaces = self.namespaces.read().await;
        do_distinct(&namespaces, ns, field, filter)
    }

    pub async fn update(
        &self,
        ns: &Namespace,
        filter: &Document,
        update_spec: &Document,
        array_filters: &[Document],
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let mut namespaces = self.namespaces.write().await;
        do_update(&mut namespaces, ns, filter, update_spec, array_filters, multi, upsert)
    }

    pub async fn delete(&self, ns: &Namespace, filter: &Document, limit_one: bool) -> DeleteOutcome {
        let mut namespaces = self.namespaces.write().await;
        do_delete(&mut namespaces, ns, filter, limit_one)
    }

    pub async fn create_indexes(&self, ns: &Namespace, defs: Vec<IndexDefinition>) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        do_create_indexes(&mut namespaces, ns, defs)
    }

    pub async fn drop_indexes(&self, ns: &Namespace, names: &[String]) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        do_drop_indexes(&mut namespaces, ns, names)
    }

    pub async fn drop_collection(&self, ns: &Namespace) {
        self.namespaces.write().await.remove(ns);
    }

    pub async fn drop_database(&self, db: &str) {
        self.namespaces.write().await.retain(|ns, _| ns.db != db);
    }

    pub async fn create_collection(&self, ns: &Namespace) {
        self.namespaces
            .write()
            .await
            .entry(ns.clone())
            .or_insert_with(Collection::new);
    }

    pub async fn list_collections(&self, db: &str) -> Vec<String> {
        let namespaces = self.namespaces.read().await;
        namespaces
            .keys()
            .filter(|ns| ns.db == db)
            .map(|ns| ns.collection.clone())
            .collect()
    }

    pub async fn list_indexes(&self, ns: &Namespace) -> Result<Vec<IndexDefinition>> {
        let namespaces = self.namespaces.read().await;
        do_list_indexes(&namespaces, ns)
    }

    /// Fetch an entire namespace's documents for the aggregation executor,
    /// which always runs over an isolated clone.
    pub async fn scan(&self, ns: &Namespace) -> Vec<Document> {
        let namespaces = self.namespaces.read().await;
        namespaces.get(ns).map(|c| c.documents.clone()).unwrap_or_default()
    }
}

pub(crate) fn do_insert(
    namespaces: &mut HashMap<Namespace, Collection>,
    ns: &Namespace,
    docs: Vec<Document>,
    ordered: bool,
) -> Result<InsertOutcome> {
    let coll = namespaces.entry(ns.clone()).or_insert_with(Collection::new);

    let mut outcome = InsertOutcome::default();
    for (index, mut doc) in docs.into_iter().enumerate() {
        if !doc.contains_key("_id") {
            doc.insert("_id", Bson::ObjectId(bson::oid::ObjectId::new()));
        }
        match coll.insert(doc) {
            Ok(()) => outcome.inserted += 1,
            Err(Error::Command(cmd_err)) => {
                outcome.write_errors.push(WriteError {
                    index,
                    code: cmd_err.code(),
                    code_name: cmd_err.code_name(),
                    errmsg: cmd_err.to_string(),
                });
                if ordered {
                    break;
                }
            }
            Err(other) => return Err(other),
        }
    }
    Ok(outcome)
}

pub(crate) fn do_find(
    namespaces: &HashMap<Namespace, Collection>,
    ns: &Namespace,
    filter: &Document,
    projection: Option<&Document>,
    sort: Option<&Document>,
    skip: u64,
    limit: Option<u64>,
) -> Vec<Document> {
    let Some(coll) = namespaces.get(ns) else {
        return Vec::new();
    };

    let mut matched: Vec<Document> = coll.find(filter).into_iter().cloned().collect();

    if let Some(sort_spec) = sort {
        sort_documents(&mut matched, sort_spec);
    }

    let mut iter = matched.into_iter().skip(skip as usize);
    let selected: Vec<Document> = match limit {
        Some(n) => iter.by_ref().take(n as usize).collect(),
        None => iter.collect(),
    };

    match projection {
        Some(spec) => selected.iter().map(|d| apply_projection(d, spec)).collect(),
        None => selected,
    }
}

pub(crate) fn do_count(namespaces: &HashMap<Namespace, Collection>, ns: &Namespace, filter: &Document) -> u64 {
    namespaces.get(ns).map(|c| c.find(filter).len() as u64).unwrap_or(0)
}

pub(crate) fn do_distinct(
    namespaces: &HashMap<Namespace, Collection>,
    ns: &Namespace,
    field: &str,
    filter: &Document,
) -> Vec<Bson> {
    let Some(coll) = namespaces.get(ns) else {
        return Vec::new();
    };
    let mut seen: Vec<Bson> = Vec::new();
    for doc in coll.find(filter) {
        match get_path(doc, field) {
            Some(Bson::Array(items)) => {
                for item in items {
                    if !seen.contains(&item) {
                        seen.push(item);
                    }
                }
            }
            Some(value) => {
                if !seen.contains(&value) {
                    seen.push(value);
                }
            }
            None => {}
        }
    }
    seen
}

pub(crate) fn do_update(
    namespaces: &mut HashMap<Namespace, Collection>,
    ns: &Namespace,
    filter: &Document,
    update_spec: &Document,
    array_filters: &[Document],
    multi: bool,
    upsert: bool,
) -> Result<UpdateOutcome> {
    let coll = namespaces.entry(ns.clone()).or_insert_with(Collection::new);

    let matching_positions: Vec<usize> = coll
        .documents
        .iter()
        .enumerate()
        .filter(|(_, d)| document_matches_filter(d, filter))
        .map(|(i, _)| i)
        .collect();

    let mut outcome = UpdateOutcome::default();

    if matching_positions.is_empty() {
        if !upsert {
            return Ok(outcome);
        }
        let seed = synthesize_upsert_seed(filter);
        let (mut inserted, _) = apply_update(&seed, update_spec, array_filters, true)?;
        if !inserted.contains_key("_id") {
            inserted.insert("_id", Bson::ObjectId(bson::oid::ObjectId::new()));
        }
        coll.check_unique_conflicts(&inserted, None)?;
        outcome.upserted_id = inserted.get("_id").cloned();
        coll.documents.push(inserted);
        outcome.matched = 0;
        outcome.modified = 0;
        return Ok(outcome);
    }

    let targets: Vec<usize> = if multi {
        matching_positions
    } else {
        vec![matching_positions[0]]
    };

    for pos in targets {
        let original = coll.documents[pos].clone();
        let (updated, modified) = apply_update(&original, update_spec, array_filters, false)?;
        coll.check_unique_conflicts(&updated, Some(pos))?;
        outcome.matched += 1;
        if modified {
            outcome.modified += 1;
            coll.documents[pos] = updated;
        }
    }

    Ok(outcome)
}

pub(crate) fn do_delete(
    namespaces: &mut HashMap<Namespace, Collection>,
    ns: &Namespace,
    filter: &Document,
    limit_one: bool,
) -> DeleteOutcome {
    let Some(coll) = namespaces.get_mut(ns) else {
        return DeleteOutcome::default();
    };

    let mut deleted = 0usize;
    let mut retained = Vec::with_capacity(coll.documents.len());
    for doc in coll.documents.drain(..) {
        let matches = document_matches_filter(&doc, filter);
        if matches && (!limit_one || deleted == 0) {
            deleted += 1;
            continue;
        }
        retained.push(doc);
    }
    coll.documents = retained;
    DeleteOutcome { deleted }
}

pub(crate) fn do_create_indexes(
    namespaces: &mut HashMap<Namespace, Collection>,
    ns: &Namespace,
    defs: Vec<IndexDefinition>,
) -> Result<()> {
    let coll = namespaces.entry(ns.clone()).or_insert_with(Collection::new);
    for def in defs {
        coll.create_index(def)?;
    }
    Ok(())
}

pub(crate) fn do_drop_indexes(
    namespaces: &mut HashMap<Namespace, Collection>,
    ns: &Namespace,
    names: &[String],
) -> Result<()> {
    let coll = namespaces
        .get_mut(ns)
        .ok_or_else(|| Error::Command(CommandError::NamespaceNotFound(ns.to_string())))?;
    coll.drop_indexes(names);
    Ok(())
}

pub(crate) fn do_list_indexes(
    namespaces: &HashMap<Namespace, Collection>,
    ns: &Namespace,
) -> Result<Vec<IndexDefinition>> {
    namespaces
        .get(ns)
        .map(|c| c.indexes.clone())
        .ok_or_else(|| Error::Command(CommandError::NamespaceNotFound(ns.to_string())))
}

fn synthesize_upsert_seed(filter: &Document) -> Document {
    let mut seed = Document::new();
    for (key, value) in filter.iter() {
        if key.starts_with('$') {
            continue;
        }
        if matches!(value, Bson::Document(d) if d.keys().any(|k| k.starts_with('$'))) {
            continue;
        }
        seed.insert(key.clone(), value.clone());
    }
    seed
}

fn apply_projection(doc: &Document, spec: &Document) -> Document {
    let including = spec
        .iter()
        .filter(|(k, _)| *k != "_id")
        .any(|(_, v)| truthy_projection_value(v));
    let mut out = Document::new();

    if including {
        for (path, value) in spec.iter() {
            if path == "_id" {
                continue;
            }
            if !truthy_projection_value(value) {
                continue;
            }
            if let Some(v) = get_path(doc, path) {
                let _ = crate::bson_util::set_path(&mut out, path, v);
            }
        }
        let include_id = spec.get("_id").map(truthy_projection_value).unwrap_or(true);
        if include_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
    } else {
        out = doc.clone();
        for (path, value) in spec.iter() {
            if truthy_projection_value(value) {
                continue;
            }
            crate::bson_util::unset_path(&mut out, path);
        }
    }

    out
}

fn truthy_projection_value(v: &Bson) -> bool {
    match v {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        _ => true,
    }
}

fn sort_documents(docs: &mut [Document], sort_spec: &Document) {
    let keys: Vec<(String, i32)> = sort_spec
        .iter()
        .map(|(k, v)| (k.clone(), v.as_i32().or_else(|| v.as_i64().map(|n| n as i32)).unwrap_or(1)))
        .collect();
    docs.sort_by(|a, b| {
        for (field, direction) in &keys {
            let av = get_path(a, field);
            let bv = get_path(b, field);
            let cmp = match (&av, &bv) {
                (Some(x), Some(y)) => crate::bson_util::bson_cmp(x, y),
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            let cmp = if *direction < 0 { cmp.reverse() } else { cmp };
            if cmp != std::cmp::Ordering::Equal {
                return cmp;
            }
        }
        std::cmp::Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn ns() -> Namespace {
        Namespace::new("testdb", "items").unwrap()
    }

    #[tokio::test]
    async fn insert_fills_missing_id() {
        let engine = Engine::new();
        let outcome = engine.insert(&ns(), vec![doc! {"a": 1i32}], true).await.unwrap();
        assert_eq!(outcome.inserted, 1);
        let found = engine.find(&ns(), &doc! {}, None, None, 0, None).await;
        assert!(found[0].contains_key("_id"));
    }

    #[tokio::test]
    async fn ordered_insert_stops_at_first_error() {
        let engine = Engine::new();
        engine
            .create_indexes(
                &ns(),
                vec![IndexDefinition {
                    name: "a_1".to_string(),
                    keys: doc! {"a": 1i32},
                    unique: true,
                }],
            )
            .await
            .unwrap();
        let docs = vec![
            doc! {"_id": 1i32, "a": 1i32},
            doc! {"_id": 2i32, "a": 1i32},
            doc! {"_id": 3i32, "a": 2i32},
        ];
        let outcome = engine.insert(&ns(), docs, true).await.unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.write_errors.len(), 1);
    }

    #[tokio::test]
    async fn upsert_synthesizes_seed_from_equality_filter() {
        let engine = Engine::new();
        let outcome = engine
            .update(
                &ns(),
                &doc! {"sku": "abc"},
                &doc! {"$set": {"qty": 5i32}},
                &[],
                false,
                true,
            )
            .await
            .unwrap();
        assert!(outcome.upserted_id.is_some());
        let found = engine.find(&ns(), &doc! {"sku": "abc"}, None, None, 0, None).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get_i32("qty").unwrap(), 5);
    }

    #[tokio::test]
    async fn delete_respects_limit_one() {
        let engine = Engine::new();
        engine
            .insert(&ns(), vec![doc! {"x": 1i32}, doc! {"x": 1i32}], true)
            .await
            .unwrap();
        let outcome = engine.delete(&ns(), &doc! {"x": 1i32}, true).await;
        assert_eq!(outcome.deleted, 1);
        let remaining = engine.find(&ns(), &doc! {}, None, None, 0, None).await;
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn sort_then_skip_then_limit() {
        let engine = Engine::new();
        engine
            .insert(
                &ns(),
                vec![doc! {"x": 3i32}, doc! {"x": 1i32}, doc! {"x": 2i32}],
                true,
            )
            .await
            .unwrap();
        let found = engine
            .find(&ns(), &doc! {}, None, Some(&doc! {"x": 1i32}), 1, Some(1))
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get_i32("x").unwrap(), 2);
    }

    #[tokio::test]
    async fn snapshot_and_restore_round_trip() {
        let engine = Engine::new();
        engine.insert(&ns(), vec![doc! {"x": 1i32}], true).await.unwrap();
        let snap = engine.snapshot().await;
        engine.insert(&ns(), vec![doc! {"x": 2i32}], true).await.unwrap();
        engine.restore(snap).await;
        let found = engine.find(&ns(), &doc! {}, None, None, 0, None).await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn drop_indexes_on_missing_namespace_is_namespace_not_found() {
        let engine = Engine::new();
        let err = engine.drop_indexes(&ns(), &["a_1".to_string()]).await.unwrap_err();
        assert!(matches!(err, Error::Command(CommandError::NamespaceNotFound(_))));
    }
}
