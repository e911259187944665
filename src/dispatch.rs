//! Command dispatcher: validates the command envelope, threads transaction
//! state through the transaction manager, and routes to the in-memory engine
//! or aggregation pipeline. Always produces a response document — command
//! failures become `{ok:0, errmsg, code, codeName}` bodies here rather than
//! escaping as wire-level errors; only framing failures ever close a
//! connection (see `protocol`/`server`).

use crate::aggregation::{ExecContext, ExecResult, Pipeline, execute_pipeline};
use crate::engine::collection::{Collection, IndexDefinition};
use crate::engine::{self, DeleteOutcome, Engine, EngineSnapshot, InsertOutcome, UpdateOutcome};
use crate::error::{CommandError, Error, ErrorLabel, Result};
use crate::namespace::Namespace;
use crate::txn::{TransactionManager, TxnEnvelope, TxnOutcome, validate_concerns};
use bson::{Bson, Document, doc, oid::ObjectId};
use std::collections::HashMap;
use std::sync::Arc;

/// Static server identity surfaced in `hello`/`isMaster` and `buildInfo`.
pub struct Topology {
    pub host: String,
    pub port: u16,
    pub replica_set: Option<String>,
    process_id: ObjectId,
}

impl Topology {
    pub fn new(host: String, port: u16, replica_set: Option<String>) -> Self {
        Self {
            host,
            port,
            replica_set,
            process_id: ObjectId::new(),
        }
    }
}

pub struct Dispatcher {
    engine: Arc<Engine>,
    txns: Arc<TransactionManager>,
    topology: Topology,
}

/// Either the live, lock-guarded engine or a transaction's owned snapshot.
/// Every read/write method here mirrors one on `Engine`, so live and
/// in-transaction execution can never drift apart — both paths ultimately
/// call the same `engine::do_*` function.
enum Store<'a> {
    Live(&'a Engine),
    Snapshot(&'a mut EngineSnapshot),
}

impl Store<'_> {
    async fn insert(&mut self, ns: &Namespace, docs: Vec<Document>, ordered: bool) -> Result<InsertOutcome> {
        match self {
            Store::Live(e) => e.insert(ns, docs, ordered).await,
            Store::Snapshot(s) => engine::do_insert(s, ns, docs, ordered),
        }
    }

    async fn find(
        &mut self,
        ns: &Namespace,
        filter: &Document,
        projection: Option<&Document>,
        sort: Option<&Document>,
        skip: u64,
        limit: Option<u64>,
    ) -> Vec<Document> {
        match self {
            Store::Live(e) => e.find(ns, filter, projection, sort, skip, limit).await,
            Store::Snapshot(s) => engine::do_find(s, ns, filter, projection, sort, skip, limit),
        }
    }

    async fn count(&mut self, ns: &Namespace, filter: &Document) -> u64 {
        match self {
            Store::Live(e) => e.count(ns, filter).await,
            Store::Snapshot(s) => engine::do_count(s, ns, filter),
        }
    }

    async fn distinct(&mut self, ns: &Namespace, field: &str, filter: &Document) -> Vec<Bson> {
        match self {
            Store::Live(e) => e.distinct(ns, field, filter).await,
            Store::Snapshot(s) => engine::do_distinct(s, ns, field, filter),
        }
    }

    async fn update(
        &mut self,
        ns: &Namespace,
        filter: &Document,
        update_spec: &Document,
        array_filters: &[Document],
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        match self {
            Store::Live(e) => e.update(ns, filter, update_spec, array_filters, multi, upsert).await,
            Store::Snapshot(s) => engine::do_update(s, ns, filter, update_spec, array_filters, multi, upsert),
        }
    }

    async fn delete(&mut self, ns: &Namespace, filter: &Document, limit_one: bool) -> DeleteOutcome {
        match self {
            Store::Live(e) => e.delete(ns, filter, limit_one).await,
            Store::Snapshot(s) => engine::do_delete(s, ns, filter, limit_one),
        }
    }

    async fn create_indexes(&mut self, ns: &Namespace, defs: Vec<IndexDefinition>) -> Result<()> {
        match self {
            Store::Live(e) => e.create_indexes(ns, defs).await,
            Store::Snapshot(s) => engine::do_create_indexes(s, ns, defs),
        }
    }

    async fn drop_indexes(&mut self, ns: &Namespace, names: &[String]) -> Result<()> {
        match self {
            Store::Live(e) => e.drop_indexes(ns, names).await,
            Store::Snapshot(s) => engine::do_drop_indexes(s, ns, names),
        }
    }

    async fn list_indexes(&mut self, ns: &Namespace) -> Result<Vec<IndexDefinition>> {
        match self {
            Store::Live(e) => e.list_indexes(ns).await,
            Store::Snapshot(s) => engine::do_list_indexes(s, ns),
        }
    }

    async fn drop_collection(&mut self, ns: &Namespace) {
        match self {
            Store::Live(e) => e.drop_collection(ns).await,
            Store::Snapshot(s) => {
                s.remove(ns);
            }
        }
    }

    async fn drop_database(&mut self, db: &str) {
        match self {
            Store::Live(e) => e.drop_database(db).await,
            Store::Snapshot(s) => s.retain(|ns, _| ns.db != db),
        }
    }

    async fn create_collection(&mut self, ns: &Namespace) {
        match self {
            Store::Live(e) => e.create_collection(ns).await,
            Store::Snapshot(s) => {
                s.entry(ns.clone()).or_insert_with(Collection::new);
            }
        }
    }

    async fn list_collections(&mut self, db: &str) -> Vec<String> {
        match self {
            Store::Live(e) => e.list_collections(db).await,
            Store::Snapshot(s) => s.keys().filter(|ns| ns.db == db).map(|ns| ns.collection.clone()).collect(),
        }
    }

    async fn scan(&mut self, ns: &Namespace) -> Vec<Document> {
        match self {
            Store::Live(e) => e.scan(ns).await,
            Store::Snapshot(s) => s.get(ns).map(|c| c.documents.clone()).unwrap_or_default(),
        }
    }
}

/// Resolve the target namespace out of the command's own value, e.g. for
/// `{insert: "tokens", ...}` this is `ns_from(db, body, "insert")`.
fn ns_from(db: &str, body: &Document, field: &str) -> Result<Namespace> {
    let coll = body
        .get_str(field)
        .map_err(|_| Error::Command(CommandError::BadValue(format!("'{}' must name a collection", field))))?;
    Namespace::new(db, coll)
}

fn default_index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(k, v)| {
            let dir = v.as_i32().or_else(|| v.as_i64().map(|n| n as i32)).unwrap_or(1);
            format!("{}_{}", k, dir)
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// A failure only carries an error label when it is `NoSuchTransaction`, per
/// the transaction manager's labeling rule — ordinary command failures never
/// get one, even inside a transaction.
fn label_for(cmd_name: &str, err: &Error) -> Option<ErrorLabel> {
    if matches!(err, Error::Command(CommandError::NoSuchTransaction)) {
        TransactionManager::error_label_for(cmd_name)
    } else {
        None
    }
}

const TRANSACTIONAL_SURFACE: &[&str] = &[
    "insert",
    "update",
    "delete",
    "find",
    "findandmodify",
    "findoneandupdate",
    "findoneandreplace",
    "findoneanddelete",
    "aggregate",
    "count",
    "countdocuments",
    "distinct",
    "bulkwrite",
    "clientbulkwrite",
    "committransaction",
    "aborttransaction",
];

impl Dispatcher {
    pub fn new(engine: Arc<Engine>, txns: Arc<TransactionManager>, topology: Topology) -> Self {
        Self { engine, txns, topology }
    }

    /// Decode and dispatch one command document to a response document. Never
    /// fails: any internal error is shaped into an `{ok:0, ...}` body.
    pub async fn dispatch(&self, body: Document) -> Document {
        let Some((cmd_key, _)) = body.iter().next() else {
            return self.error_response(&Error::Command(CommandError::BadValue("empty command document".into())), None);
        };
        let cmd_key = cmd_key.clone();
        let cmd_name = cmd_key.to_lowercase();

        let db = match body.get_str("$db") {
            Ok(d) => d.to_string(),
            Err(_) => {
                return self.error_response(&Error::Command(CommandError::BadValue("$db is required".into())), None);
            }
        };

        match self.route(&cmd_key, &cmd_name, &db, &body).await {
            Ok(doc) => doc,
            Err((err, label)) => self.error_response(&err, label),
        }
    }

    async fn route(
        &self,
        cmd_key: &str,
        cmd_name: &str,
        db: &str,
        body: &Document,
    ) -> std::result::Result<Document, (Error, Option<ErrorLabel>)> {
        let envelope = TxnEnvelope::extract(body).map_err(|e| (e, None))?;

        if matches!(cmd_name, "committransaction" | "aborttransaction") && envelope.is_none() {
            return Err((
                Error::Command(CommandError::BadValue(format!("{} requires lsid/txnNumber", cmd_name))),
                None,
            ));
        }

        if let Some(env) = &envelope {
            validate_concerns(body, cmd_name, env.start_transaction).map_err(|e| (e, None))?;
        }

        let transactional = TRANSACTIONAL_SURFACE.contains(&cmd_name);

        let outcome = if transactional {
            match &envelope {
                Some(env) => self.txns.begin(env, cmd_name).await.map_err(|e| {
                    let label = label_for(cmd_name, &e);
                    (e, label)
                })?,
                None => TxnOutcome::NotTransactional,
            }
        } else {
            TxnOutcome::NotTransactional
        };

        match outcome {
            TxnOutcome::Committed => {
                let lsid = &envelope.as_ref().unwrap().lsid;
                if let Some(snapshot) = self.txns.take_snapshot(lsid).await {
                    self.engine.restore(snapshot).await;
                }
                self.txns.clear(lsid).await;
                return Ok(doc! {"ok": 1.0f64});
            }
            TxnOutcome::Aborted => {
                let lsid = &envelope.as_ref().unwrap().lsid;
                self.txns.take_snapshot(lsid).await;
                self.txns.clear(lsid).await;
                return Ok(doc! {"ok": 1.0f64});
            }
            _ => {}
        }

        let mut snapshot: Option<EngineSnapshot> = match outcome {
            TxnOutcome::RunLive => Some(self.engine.snapshot().await),
            TxnOutcome::RunSnapshot => {
                let lsid = &envelope.as_ref().unwrap().lsid;
                Some(self.txns.take_snapshot(lsid).await.ok_or_else(|| {
                    let e = Error::Command(CommandError::NoSuchTransaction);
                    let label = label_for(cmd_name, &e);
                    (e, label)
                })?)
            }
            _ => None,
        };

        let mut store = match &mut snapshot {
            Some(s) => Store::Snapshot(s),
            None => Store::Live(&self.engine),
        };

        let result = self.execute_command(cmd_key, cmd_name, db, body, &mut store).await;

        if let Some(snap) = snapshot {
            let env = envelope.as_ref().unwrap();
            let txn_number = env.txn_number.unwrap();
            match outcome {
                TxnOutcome::RunLive => self.txns.install_snapshot(&env.lsid, txn_number, snap).await,
                TxnOutcome::RunSnapshot => self.txns.put_snapshot(&env.lsid, txn_number, snap).await,
                _ => {}
            }
        }

        result.map_err(|e| {
            let label = label_for(cmd_name, &e);
            (e, label)
        })
    }

    async fn execute_command(
        &self,
        cmd_key: &str,
        cmd_name: &str,
        db: &str,
        body: &Document,
        store: &mut Store<'_>,
    ) -> Result<Document> {
        match cmd_name {
            "ping" => Ok(doc! {"ok": 1.0f64}),
            "buildinfo" => Ok(self.build_info()),
            "hello" | "ismaster" => Ok(self.hello_response()),
            "listcollections" => self.cmd_list_collections(db, store).await,
            "listindexes" => self.cmd_list_indexes(cmd_key, db, body, store).await,
            "collstats" => self.cmd_coll_stats(cmd_key, db, body, store).await,
            "insert" => self.cmd_insert(cmd_key, db, body, store).await,
            "update" => self.cmd_update(cmd_key, db, body, store).await,
            "delete" => self.cmd_delete(cmd_key, db, body, store).await,
            "find" => self.cmd_find(cmd_key, db, body, store).await,
            "findandmodify" | "findoneandupdate" | "findoneandreplace" | "findoneanddelete" => {
                self.cmd_find_and_modify(cmd_name, cmd_key, db, body, store).await
            }
            "count" => self.cmd_count(cmd_key, db, body, store).await,
            "countdocuments" => self.cmd_count_documents(cmd_key, db, body, store).await,
            "distinct" => self.cmd_distinct(cmd_key, db, body, store).await,
            "aggregate" => self.cmd_aggregate(cmd_key, db, body, store).await,
            "bulkwrite" | "clientbulkwrite" => self.cmd_bulk_write(cmd_key, db, body, store).await,
            "createindexes" => self.cmd_create_indexes(cmd_key, db, body, store).await,
            "dropindexes" => self.cmd_drop_indexes(cmd_key, db, body, store).await,
            "drop" => self.cmd_drop(cmd_key, db, body, store).await,
            "dropdatabase" => {
                store.drop_database(db).await;
                Ok(doc! {"ok": 1.0f64, "dropped": db})
            }
            "create" => self.cmd_create(cmd_key, db, body, store).await,
            "endsessions" => self.cmd_end_sessions(body).await,
            "getmore" => Ok(doc! {"ok": 1.0f64, "cursor": {"id": 0i64, "ns": "", "nextBatch": Vec::<Bson>::new()}}),
            "killcursors" => Ok(doc! {
                "ok": 1.0f64,
                "cursorsKilled": Vec::<Bson>::new(),
                "cursorsNotFound": Vec::<Bson>::new(),
                "cursorsAlive": Vec::<Bson>::new(),
                "cursorsUnknown": Vec::<Bson>::new(),
            }),
            "committransaction" | "aborttransaction" => Err(Error::Command(CommandError::BadValue(format!(
                "{} requires a valid transaction envelope",
                cmd_key
            )))),
            _ => Err(Error::Command(CommandError::CommandNotFound(cmd_key.to_string()))),
        }
    }

    fn build_info(&self) -> Document {
        doc! {
            "ok": 1.0f64,
            "version": "7.0.0-jongodb",
            "gitVersion": "unknown",
            "versionArray": [7i32, 0i32, 0i32, 0i32],
            "bits": 64i32,
            "maxBsonObjectSize": 16 * 1024 * 1024i32,
        }
    }

    fn hello_response(&self) -> Document {
        let mut resp = doc! {
            "ok": 1.0f64,
            "ismaster": true,
            "isWritablePrimary": true,
            "maxBsonObjectSize": 16 * 1024 * 1024i32,
            "maxMessageSizeBytes": 48 * 1024 * 1024i32,
            "maxWriteBatchSize": 100_000i32,
            "logicalSessionTimeoutMinutes": 30i32,
            "minWireVersion": 0i32,
            "maxWireVersion": 13i32,
            "readOnly": false,
        };
        if let Some(rs) = &self.topology.replica_set {
            let host_port = format!("{}:{}", self.topology.host, self.topology.port);
            resp.insert("setName", rs.clone());
            resp.insert("hosts", vec![host_port.clone()]);
            resp.insert("primary", host_port);
            resp.insert(
                "topologyVersion",
                doc! {"processId": self.topology.process_id, "counter": 0i64},
            );
        }
        resp
    }

    async fn cmd_list_collections(&self, db: &str, store: &mut Store<'_>) -> Result<Document> {
        let names = store.list_collections(db).await;
        let batch: Vec<Bson> = names
            .into_iter()
            .map(|name| Bson::Document(doc! {"name": name, "type": "collection"}))
            .collect();
        Ok(doc! {
            "ok": 1.0f64,
            "cursor": {"id": 0i64, "ns": format!("{db}.$cmd.listCollections"), "firstBatch": batch},
        })
    }

    async fn cmd_list_indexes(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let indexes = store.list_indexes(&ns).await?;
        let batch: Vec<Bson> = indexes
            .iter()
            .map(|idx| {
                let mut entry = doc! {"v": 2i32, "key": idx.keys.clone(), "name": idx.name.clone()};
                if idx.unique {
                    entry.insert("unique", true);
                }
                Bson::Document(entry)
            })
            .collect();
        Ok(doc! {"ok": 1.0f64, "cursor": {"id": 0i64, "ns": ns.to_string(), "firstBatch": batch}})
    }

    async fn cmd_coll_stats(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let docs = store.scan(&ns).await;
        Ok(doc! {
            "ok": 1.0f64,
            "ns": ns.to_string(),
            "count": docs.len() as i64,
            "size": 0i64,
            "storageSize": 0i64,
        })
    }

    async fn cmd_insert(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let docs_bson = body
            .get_array("documents")
            .map_err(|_| Error::Command(CommandError::BadValue("insert requires a documents array".into())))?;
        let mut docs = Vec::with_capacity(docs_bson.len());
        for d in docs_bson {
            let d = d
                .as_document()
                .ok_or_else(|| Error::Command(CommandError::TypeMismatch("documents must contain documents".into())))?;
            docs.push(d.clone());
        }
        let ordered = body.get_bool("ordered").unwrap_or(true);
        let outcome = store.insert(&ns, docs, ordered).await?;

        let mut resp = doc! {"ok": 1.0f64, "n": outcome.inserted as i32};
        if !outcome.write_errors.is_empty() {
            let errs: Vec<Bson> = outcome
                .write_errors
                .iter()
                .map(|e| {
                    Bson::Document(doc! {
                        "index": e.index as i32,
                        "code": e.code,
                        "codeName": e.code_name,
                        "errmsg": e.errmsg.clone(),
                    })
                })
                .collect();
            resp.insert("writeErrors", errs);
        }
        Ok(resp)
    }

    async fn cmd_update(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let updates = body
            .get_array("updates")
            .map_err(|_| Error::Command(CommandError::BadValue("update requires an updates array".into())))?;
        let ordered = body.get_bool("ordered").unwrap_or(true);

        let mut n = 0i64;
        let mut n_modified = 0i64;
        let mut upserted = Vec::new();
        let mut write_errors = Vec::new();

        for (index, u) in updates.iter().enumerate() {
            let spec = u
                .as_document()
                .ok_or_else(|| Error::Command(CommandError::TypeMismatch("updates entries must be documents".into())))?;
            let filter = spec.get_document("q").cloned().unwrap_or_default();
            let update_doc = spec.get_document("u").cloned().unwrap_or_default();
            let multi = spec.get_bool("multi").unwrap_or(false);
            let upsert = spec.get_bool("upsert").unwrap_or(false);
            let array_filters: Vec<Document> = spec
                .get_array("arrayFilters")
                .ok()
                .map(|arr| arr.iter().filter_map(|v| v.as_document().cloned()).collect())
                .unwrap_or_default();

            match store.update(&ns, &filter, &update_doc, &array_filters, multi, upsert).await {
                Ok(outcome) => {
                    n += outcome.matched as i64;
                    n_modified += outcome.modified as i64;
                    if let Some(id) = outcome.upserted_id {
                        upserted.push(Bson::Document(doc! {"index": index as i32, "_id": id}));
                    }
                }
                Err(Error::Command(cmd_err)) => {
                    write_errors.push(Bson::Document(doc! {
                        "index": index as i32,
                        "code": cmd_err.code(),
                        "codeName": cmd_err.code_name(),
                        "errmsg": cmd_err.to_string(),
                    }));
                    if ordered {
                        break;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        let mut resp = doc! {"ok": 1.0f64, "n": n, "nModified": n_modified};
        if !upserted.is_empty() {
            resp.insert("upserted", upserted);
        }
        if !write_errors.is_empty() {
            resp.insert("writeErrors", write_errors);
        }
        Ok(resp)
    }

    async fn cmd_delete(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let deletes = body
            .get_array("deletes")
            .map_err(|_| Error::Command(CommandError::BadValue("delete requires a deletes array".into())))?;

        let mut n = 0i64;
        for d in deletes {
            let spec = d
                .as_document()
                .ok_or_else(|| Error::Command(CommandError::TypeMismatch("deletes entries must be documents".into())))?;
            let filter = spec.get_document("q").cloned().unwrap_or_default();
            let limit = spec.get_i32("limit").unwrap_or(0);
            let outcome = store.delete(&ns, &filter, limit == 1).await;
            n += outcome.deleted as i64;
        }
        Ok(doc! {"ok": 1.0f64, "n": n})
    }

    async fn cmd_find(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let filter = body.get_document("filter").cloned().unwrap_or_default();
        let projection = body.get_document("projection").ok().cloned();
        let sort = body.get_document("sort").ok().cloned();
        let skip = read_u64(body, "skip").unwrap_or(0);
        let limit = read_u64(body, "limit").filter(|n| *n > 0);

        let mut docs = store.find(&ns, &filter, projection.as_ref(), sort.as_ref(), skip, limit).await;
        // Advisory per-batch cap; no server-side cursor survives past the first batch.
        docs.truncate(1000);

        Ok(doc! {
            "ok": 1.0f64,
            "cursor": {"id": 0i64, "ns": ns.to_string(), "firstBatch": docs},
        })
    }

    async fn cmd_count(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let filter = body.get_document("query").cloned().unwrap_or_default();
        let skip = read_u64(body, "skip").unwrap_or(0);
        let limit = read_u64(body, "limit").filter(|n| *n > 0);
        let docs = store.find(&ns, &filter, None, None, skip, limit).await;
        Ok(doc! {"ok": 1.0f64, "n": docs.len() as i64})
    }

    async fn cmd_count_documents(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let filter = body.get_document("query").cloned().unwrap_or_default();
        let n = store.count(&ns, &filter).await;
        Ok(doc! {"ok": 1.0f64, "n": n as i64})
    }

    async fn cmd_distinct(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let field = body
            .get_str("key")
            .map_err(|_| Error::Command(CommandError::BadValue("distinct requires key".into())))?;
        let filter = body.get_document("query").cloned().unwrap_or_default();
        let values = store.distinct(&ns, field, &filter).await;
        Ok(doc! {"ok": 1.0f64, "values": values})
    }

    async fn cmd_aggregate(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let pipeline = Pipeline::parse(body).map_err(|e| Error::Command(CommandError::BadValue(e.to_string())))?;
        let let_vars: HashMap<String, Bson> = pipeline
            .options
            .let_vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let source = store.scan(&ns).await;
        let ctx = ExecContext::with_vars(db.to_string(), ns.collection.clone(), let_vars);
        let ExecResult::Cursor(mut docs) =
            execute_pipeline(&ctx, source, pipeline).map_err(|e| Error::Command(CommandError::BadValue(e.to_string())))?;
        docs.truncate(1000);
        Ok(doc! {
            "ok": 1.0f64,
            "cursor": {"id": 0i64, "ns": ns.to_string(), "firstBatch": docs},
        })
    }

    async fn cmd_bulk_write(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let requests = body
            .get_array("requests")
            .map_err(|_| Error::Command(CommandError::BadValue("bulkWrite requires a requests array".into())))?;
        let ordered = body.get_bool("ordered").unwrap_or(true);

        let mut inserted = 0i64;
        let mut matched = 0i64;
        let mut modified = 0i64;
        let mut deleted = 0i64;
        let mut upserted = Vec::new();
        let mut write_errors = Vec::new();

        for (index, req) in requests.iter().enumerate() {
            let req_doc = req
                .as_document()
                .ok_or_else(|| Error::Command(CommandError::TypeMismatch("bulkWrite requests must be documents".into())))?;
            let Some((op, op_spec)) = req_doc.iter().next() else {
                return Err(Error::Command(CommandError::BadValue("empty bulkWrite request".into())));
            };
            let op = op.clone();
            let spec = op_spec.as_document().cloned().unwrap_or_default();

            let result: Result<()> = match op.as_str() {
                "insertOne" => {
                    let document = spec.get_document("document").cloned().unwrap_or_default();
                    store.insert(&ns, vec![document], true).await.map(|o| {
                        inserted += o.inserted as i64;
                    })
                }
                "updateOne" | "updateMany" => {
                    let filter = spec.get_document("filter").cloned().unwrap_or_default();
                    let update_doc = spec.get_document("update").cloned().unwrap_or_default();
                    let upsert = spec.get_bool("upsert").unwrap_or(false);
                    let multi = op == "updateMany";
                    store.update(&ns, &filter, &update_doc, &[], multi, upsert).await.map(|o| {
                        matched += o.matched as i64;
                        modified += o.modified as i64;
                        if let Some(id) = o.upserted_id {
                            upserted.push(Bson::Document(doc! {"index": index as i32, "_id": id}));
                        }
                    })
                }
                "replaceOne" => {
                    let filter = spec.get_document("filter").cloned().unwrap_or_default();
                    let replacement = spec.get_document("replacement").cloned().unwrap_or_default();
                    let upsert = spec.get_bool("upsert").unwrap_or(false);
                    store.update(&ns, &filter, &replacement, &[], false, upsert).await.map(|o| {
                        matched += o.matched as i64;
                        modified += o.modified as i64;
                        if let Some(id) = o.upserted_id {
                            upserted.push(Bson::Document(doc! {"index": index as i32, "_id": id}));
                        }
                    })
                }
                "deleteOne" | "deleteMany" => {
                    let filter = spec.get_document("filter").cloned().unwrap_or_default();
                    let outcome = store.delete(&ns, &filter, op == "deleteOne").await;
                    deleted += outcome.deleted as i64;
                    Ok(())
                }
                other => Err(Error::Command(CommandError::BadValue(format!("unsupported bulkWrite op '{}'", other)))),
            };

            match result {
                Ok(()) => {}
                Err(Error::Command(cmd_err)) => {
                    write_errors.push(Bson::Document(doc! {
                        "index": index as i32,
                        "code": cmd_err.code(),
                        "codeName": cmd_err.code_name(),
                        "errmsg": cmd_err.to_string(),
                    }));
                    if ordered {
                        break;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        let mut resp = doc! {
            "ok": 1.0f64,
            "insertedCount": inserted,
            "matchedCount": matched,
            "modifiedCount": modified,
            "deletedCount": deleted,
            "upsertedCount": upserted.len() as i64,
        };
        if !upserted.is_empty() {
            resp.insert("upserted", upserted);
        }
        if !write_errors.is_empty() {
            resp.insert("writeErrors", write_errors);
        }
        Ok(resp)
    }

    async fn cmd_find_and_modify(
        &self,
        cmd_name: &str,
        cmd_key: &str,
        db: &str,
        body: &Document,
        store: &mut Store<'_>,
    ) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;

        let (filter, want_new, upsert, remove, update_spec) = match cmd_name {
            "findandmodify" => {
                let filter = body.get_document("query").cloned().unwrap_or_default();
                let want_new = body.get_bool("new").unwrap_or(false);
                let upsert = body.get_bool("upsert").unwrap_or(false);
                let remove = body.get_bool("remove").unwrap_or(false);
                let update_spec = body.get_document("update").ok().cloned();
                (filter, want_new, upsert, remove, update_spec)
            }
            "findoneandupdate" => {
                let filter = body.get_document("filter").cloned().unwrap_or_default();
                let want_new = body.get_str("returnDocument").ok() == Some("After");
                let upsert = body.get_bool("upsert").unwrap_or(false);
                let update_spec = body.get_document("update").ok().cloned();
                (filter, want_new, upsert, false, update_spec)
            }
            "findoneandreplace" => {
                let filter = body.get_document("filter").cloned().unwrap_or_default();
                let want_new = body.get_str("returnDocument").ok() == Some("After");
                let upsert = body.get_bool("upsert").unwrap_or(false);
                let replacement = body.get_document("replacement").ok().cloned();
                (filter, want_new, upsert, false, replacement)
            }
            "findoneanddelete" => {
                let filter = body.get_document("filter").cloned().unwrap_or_default();
                (filter, false, false, true, None)
            }
            _ => unreachable!("only the four findAndModify-family commands route here"),
        };

        if remove {
            let matched = store.find(&ns, &filter, None, None, 0, Some(1)).await;
            let value = matched.into_iter().next();
            let n: i32 = if value.is_some() { 1 } else { 0 };
            if let Some(d) = &value {
                let id_filter = doc! {"_id": d.get("_id").cloned().unwrap_or(Bson::Null)};
                store.delete(&ns, &id_filter, true).await;
            }
            return Ok(doc! {
                "ok": 1.0f64,
                "value": value.map(Bson::Document).unwrap_or(Bson::Null),
                "lastErrorObject": {"n": n, "updatedExisting": false},
            });
        }

        let update_spec = update_spec
            .ok_or_else(|| Error::Command(CommandError::BadValue(format!("{} requires an update document", cmd_key))))?;

        let before = store.find(&ns, &filter, None, None, 0, Some(1)).await.into_iter().next();
        let outcome = store.update(&ns, &filter, &update_spec, &[], false, upsert).await?;
        let touched = outcome.matched > 0 || outcome.upserted_id.is_some();

        let after = if touched {
            let refilter = match (&before, &outcome.upserted_id) {
                (Some(b), _) => doc! {"_id": b.get("_id").cloned().unwrap_or(Bson::Null)},
                (None, Some(id)) => doc! {"_id": id.clone()},
                (None, None) => filter.clone(),
            };
            store.find(&ns, &refilter, None, None, 0, Some(1)).await.into_iter().next()
        } else {
            None
        };

        let value = if want_new { after } else { before.clone() };
        let mut last_error = doc! {"n": if touched { 1i32 } else { 0i32 }, "updatedExisting": before.is_some()};
        if let Some(id) = &outcome.upserted_id {
            last_error.insert("upserted", id.clone());
        }

        Ok(doc! {
            "ok": 1.0f64,
            "value": value.map(Bson::Document).unwrap_or(Bson::Null),
            "lastErrorObject": last_error,
        })
    }

    async fn cmd_create_indexes(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let specs = body
            .get_array("indexes")
            .map_err(|_| Error::Command(CommandError::BadValue("createIndexes requires an indexes array".into())))?;

        let before = store.list_indexes(&ns).await.map(|v| v.len()).unwrap_or(1);

        let mut defs = Vec::with_capacity(specs.len());
        for spec in specs {
            let spec_doc = spec
                .as_document()
                .ok_or_else(|| Error::Command(CommandError::TypeMismatch("index spec must be a document".into())))?;
            let keys = spec_doc
                .get_document("key")
                .map_err(|_| Error::Command(CommandError::BadValue("index spec requires key".into())))?
                .clone();
            let name = spec_doc
                .get_str("name")
                .map(|s| s.to_string())
                .unwrap_or_else(|_| default_index_name(&keys));
            let unique = spec_doc.get_bool("unique").unwrap_or(false);
            defs.push(IndexDefinition { name, keys, unique });
        }

        store.create_indexes(&ns, defs).await?;
        let after = store.list_indexes(&ns).await?.len();
        Ok(doc! {"ok": 1.0f64, "numIndexesBefore": before as i32, "numIndexesAfter": after as i32})
    }

    async fn cmd_drop_indexes(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        let before = store.list_indexes(&ns).await?.len();
        let names: Vec<String> = match body.get("index") {
            Some(Bson::String(s)) => vec![s.clone()],
            Some(Bson::Array(arr)) => arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect(),
            _ => return Err(Error::Command(CommandError::BadValue("dropIndexes requires index name(s)".into()))),
        };
        store.drop_indexes(&ns, &names).await?;
        Ok(doc! {"ok": 1.0f64, "nIndexesWas": before as i32})
    }

    async fn cmd_drop(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        store.drop_collection(&ns).await;
        Ok(doc! {"ok": 1.0f64})
    }

    async fn cmd_create(&self, cmd_key: &str, db: &str, body: &Document, store: &mut Store<'_>) -> Result<Document> {
        let ns = ns_from(db, body, cmd_key)?;
        store.create_collection(&ns).await;
        Ok(doc! {"ok": 1.0f64})
    }

    async fn cmd_end_sessions(&self, body: &Document) -> Result<Document> {
        let lsids: Vec<Document> = body
            .get_array("endSessions")
            .ok()
            .map(|arr| arr.iter().filter_map(|v| v.as_document().cloned()).collect())
            .unwrap_or_default();
        self.txns.end_sessions(&lsids).await;
        Ok(doc! {"ok": 1.0f64})
    }

    fn error_response(&self, err: &Error, label: Option<ErrorLabel>) -> Document {
        let (code, code_name, errmsg) = match err {
            Error::Command(cmd_err) => (cmd_err.code(), cmd_err.code_name(), cmd_err.to_string()),
            other => (1, "TransientInternal", other.to_string()),
        };
        let mut resp = doc! {"ok": 0.0f64, "errmsg": errmsg, "code": code, "codeName": code_name};
        if let Some(label) = label {
            resp.insert("errorLabels", vec![label.as_str()]);
        }
        resp
    }
}

fn read_u64(body: &Document, field: &str) -> Option<u64> {
    body.get_i64(field)
        .ok()
        .or_else(|| body.get_i32(field).ok().map(|n| n as i64))
        .map(|n| n.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::TransactionManager;
    use bson::doc;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(Engine::new()),
            Arc::new(TransactionManager::new()),
            Topology::new("127.0.0.1".to_string(), 27017, None),
        )
    }

    #[tokio::test]
    async fn ping_responds_ok() {
        let d = dispatcher();
        let resp = d.dispatch(doc! {"ping": 1i32, "$db": "admin"}).await;
        assert_eq!(resp.get_f64("ok").unwrap(), 1.0);
    }

    #[tokio::test]
    async fn missing_db_is_bad_value() {
        let d = dispatcher();
        let resp = d.dispatch(doc! {"ping": 1i32}).await;
        assert_eq!(resp.get_f64("ok").unwrap(), 0.0);
        assert_eq!(resp.get_i32("code").unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_command_is_command_not_found() {
        let d = dispatcher();
        let resp = d.dispatch(doc! {"notACommand": 1i32, "$db": "admin"}).await;
        assert_eq!(resp.get_i32("code").unwrap(), 59);
        assert_eq!(resp.get_str("codeName").unwrap(), "CommandNotFound");
    }

    #[tokio::test]
    async fn insert_then_find_round_trips_in_insertion_order() {
        let d = dispatcher();
        let insert_resp = d
            .dispatch(doc! {
                "insert": "tokens",
                "documents": [{"_id": 1i32, "v": "a"}, {"_id": 2i32, "v": "b"}],
                "$db": "account",
            })
            .await;
        assert_eq!(insert_resp.get_i32("n").unwrap(), 2);

        let find_resp = d
            .dispatch(doc! {"find": "tokens", "filter": {}, "$db": "account"})
            .await;
        let batch = find_resp
            .get_document("cursor")
            .unwrap()
            .get_array("firstBatch")
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].as_document().unwrap().get_str("v").unwrap(), "a");
    }

    #[tokio::test]
    async fn upsert_against_unique_index_reports_duplicate_key() {
        let d = dispatcher();
        d.dispatch(doc! {
            "createIndexes": "accounts",
            "indexes": [{"key": {"email": 1i32}, "name": "email_1", "unique": true}],
            "$db": "app",
        })
        .await;
        d.dispatch(doc! {
            "insert": "accounts",
            "documents": [{"_id": 1i32, "email": "a@x"}],
            "$db": "app",
        })
        .await;
        let resp = d
            .dispatch(doc! {
                "update": "accounts",
                "updates": [{"q": {"_id": 2i32}, "u": {"$set": {"email": "a@x"}}, "upsert": true}],
                "$db": "app",
            })
            .await;
        let errs = resp.get_array("writeErrors").unwrap();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].as_document().unwrap().get_i32("code").unwrap(), 11000);
    }

    #[tokio::test]
    async fn transaction_find_without_active_txn_gets_transient_label() {
        let d = dispatcher();
        let lsid = doc! {"id": Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Uuid,
            bytes: vec![9, 9, 9],
        })};
        let resp = d
            .dispatch(doc! {
                "find": "coll",
                "filter": {},
                "$db": "app",
                "lsid": lsid,
                "txnNumber": 1i64,
                "autocommit": false,
            })
            .await;
        assert_eq!(resp.get_i32("code").unwrap(), 251);
        let labels = resp.get_array("errorLabels").unwrap();
        assert_eq!(labels[0].as_str().unwrap(), "TransientTransactionError");
    }

    #[tokio::test]
    async fn transaction_commit_makes_writes_visible() {
        let d = dispatcher();
        let lsid = doc! {"id": Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Uuid,
            bytes: vec![1, 1, 1],
        })};

        let insert_in_txn = doc! {
            "insert": "coll",
            "documents": [{"_id": "t1"}],
            "$db": "app",
            "lsid": lsid.clone(),
            "txnNumber": 5i64,
            "autocommit": false,
            "startTransaction": true,
        };
        let resp = d.dispatch(insert_in_txn).await;
        assert_eq!(resp.get_f64("ok").unwrap(), 1.0);

        // Not yet committed: a plain find outside the transaction sees nothing.
        let outside = d.dispatch(doc! {"find": "coll", "filter": {}, "$db": "app"}).await;
        assert!(outside.get_document("cursor").unwrap().get_array("firstBatch").unwrap().is_empty());

        let commit_resp = d
            .dispatch(doc! {
                "commitTransaction": 1i32,
                "$db": "admin",
                "lsid": lsid,
                "txnNumber": 5i64,
                "autocommit": false,
            })
            .await;
        assert_eq!(commit_resp.get_f64("ok").unwrap(), 1.0);

        let after = d.dispatch(doc! {"find": "coll", "filter": {}, "$db": "app"}).await;
        assert_eq!(
            after.get_document("cursor").unwrap().get_array("firstBatch").unwrap().len(),
            1
        );
    }
}
