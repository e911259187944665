use crate::aggregation::pipeline::{Pipeline, Stage};
use crate::matcher::document_matches_filter;
use bson::{Bson, Document};
use std::collections::HashMap;

/// Execution context for a pipeline: which namespace it reads from (for
/// stages that need nothing beyond the already-fetched document set, `db`
/// and `coll` are carried only for diagnostics) plus any `let`-bound
/// variables from the aggregate command.
pub struct ExecContext {
    pub db: String,
    pub coll: String,
    pub vars: HashMap<String, Bson>,
}

impl ExecContext {
    pub fn new(db: String, coll: String) -> Self {
        Self {
            db,
            coll,
            vars: HashMap::new(),
        }
    }

    pub fn with_vars(db: String, coll: String, vars: HashMap<String, Bson>) -> Self {
        Self { db, coll, vars }
    }
}

/// Result of running a pipeline. `WriteOut` is retained for symmetry with the
/// richer aggregation surface this crate trims away ($out/$merge are not
/// parsed, so it is never produced today).
pub enum ExecResult {
    Cursor(Vec<Document>),
}

/// Run a pipeline over an already-fetched document set (the caller is
/// responsible for sourcing `source` from the engine, e.g. a full collection
/// scan or a transaction snapshot's view of it).
pub fn execute_pipeline(
    ctx: &ExecContext,
    source: Vec<Document>,
    pipeline: Pipeline,
) -> anyhow::Result<ExecResult> {
    let _ = (&ctx.db, &ctx.coll);
    let mut docs = source;

    for stage in pipeline.stages {
        docs = match stage {
            Stage::Match(filter) => docs
                .into_iter()
                .filter(|d| document_matches_filter(d, &filter))
                .collect(),
            Stage::Project(spec) => {
                crate::aggregation::stages::project::execute(docs, &spec, &ctx.vars)?
            }
            Stage::AddFields(spec) => crate::aggregation::stages::add_fields::execute(docs, &spec)?,
            Stage::Set(spec) => crate::aggregation::stages::set::execute(docs, &spec)?,
            Stage::Unset(fields) => crate::aggregation::stages::unset::execute(docs, &fields)?,
            Stage::ReplaceRoot { replacement } => {
                crate::aggregation::stages::replace_root::execute(docs, &replacement)?
            }
            Stage::ReplaceWith(replacement) => {
                crate::aggregation::stages::replace_root::execute(docs, &replacement)?
            }
            Stage::Sort(spec) => crate::aggregation::stages::sort::execute(docs, &spec)?,
            Stage::Limit(n) => crate::aggregation::stages::limit::execute(docs, n)?,
            Stage::Skip(n) => crate::aggregation::stages::skip::execute(docs, n)?,
            Stage::Count(field) => crate::aggregation::stages::count::execute(docs, &field)?,
            Stage::Group { id, accumulators } => {
                crate::aggregation::stages::group::execute(docs, &id, &accumulators)?
            }
            Stage::Unwind {
                path,
                include_array_index,
                preserve_null_and_empty_arrays,
            } => crate::aggregation::stages::unwind::execute(
                docs,
                &path,
                include_array_index.as_deref(),
                preserve_null_and_empty_arrays,
            )?,
            Stage::Facet(facets) => {
                crate::aggregation::stages::facet::execute(docs, &facets, &ctx.vars)?
            }
            Stage::SortByCount(expr) => {
                crate::aggregation::stages::sort_by_count::execute(docs, &expr)?
            }
        };
    }

    Ok(ExecResult::Cursor(docs))
}
