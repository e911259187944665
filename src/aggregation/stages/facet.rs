use crate::aggregation::pipeline::Stage;
use crate::matcher::document_matches_filter;
use bson::{Bson, Document};
use std::collections::HashMap;

/// Runs each facet's sub-pipeline against an independent clone of the input
/// documents. The enclosing `Stage` enum only models the subset of stages this
/// engine executes at all, so every variant is handled here too.
pub fn execute(
    docs: Vec<Document>,
    facets: &HashMap<String, Vec<Stage>>,
    vars: &HashMap<String, Bson>,
) -> anyhow::Result<Vec<Document>> {
    let mut result = Document::new();

    for (facet_name, stages) in facets.iter() {
        let mut facet_docs = docs.clone();

        for stage in stages {
            facet_docs = match stage {
                Stage::Match(filter) => facet_docs
                    .into_iter()
                    .filter(|d| document_matches_filter(d, filter))
                    .collect(),
                Stage::Project(spec) => {
                    crate::aggregation::stages::project::execute(facet_docs, spec, vars)?
                }
                Stage::AddFields(spec) => {
                    crate::aggregation::stages::add_fields::execute(facet_docs, spec)?
                }
                Stage::Set(spec) => crate::aggregation::stages::set::execute(facet_docs, spec)?,
                Stage::Unset(fields) => {
                    crate::aggregation::stages::unset::execute(facet_docs, fields)?
                }
                Stage::ReplaceRoot { replacement } => {
                    crate::aggregation::stages::replace_root::execute(facet_docs, replacement)?
                }
                Stage::ReplaceWith(expr) => {
                    crate::aggregation::stages::replace_root::execute(facet_docs, expr)?
                }
                Stage::Sort(spec) => crate::aggregation::stages::sort::execute(facet_docs, spec)?,
                Stage::Limit(n) => crate::aggregation::stages::limit::execute(facet_docs, *n)?,
                Stage::Skip(n) => crate::aggregation::stages::skip::execute(facet_docs, *n)?,
                Stage::Group { id, accumulators } => {
                    crate::aggregation::stages::group::execute(facet_docs, id, accumulators)?
                }
                Stage::Count(field) => {
                    crate::aggregation::stages::count::execute(facet_docs, field)?
                }
                Stage::Unwind {
                    path,
                    include_array_index,
                    preserve_null_and_empty_arrays,
                } => crate::aggregation::stages::unwind::execute(
                    facet_docs,
                    path,
                    include_array_index.as_deref(),
                    *preserve_null_and_empty_arrays,
                )?,
                Stage::SortByCount(expr) => {
                    crate::aggregation::stages::sort_by_count::execute(facet_docs, expr)?
                }
                Stage::Facet(_) => return Err(anyhow::anyhow!("$facet may not nest $facet")),
            };
        }

        result.insert(
            facet_name.clone(),
            Bson::Array(facet_docs.into_iter().map(Bson::Document).collect()),
        );
    }

    Ok(vec![result])
}
