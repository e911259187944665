//! The query matcher shared by `find`/`update`/`delete`'s implicit filter and
//! by the `$match` aggregation stage. Consolidates what used to be two
//! near-identical copies (one inline in the aggregation executor, one in the
//! `$match` stage module).

use crate::bson_util::{bson_cmp, coerce_numeric, get_path};
use bson::{Bson, Document};
use std::cmp::Ordering;

/// Evaluate a MongoDB-style filter document against a single document.
pub fn document_matches_filter(doc: &Document, filter: &Document) -> bool {
    for (key, value) in filter.iter() {
        if key.starts_with('$') {
            if !logical_matches(doc, key, value) {
                return false;
            }
            continue;
        }
        let doc_val = get_path(doc, key);
        if !value_matches(doc_val.as_ref(), value) {
            return false;
        }
    }
    true
}

fn logical_matches(doc: &Document, op: &str, value: &Bson) -> bool {
    match op {
        "$and" => match value {
            Bson::Array(arr) => arr.iter().all(|cond| match cond.as_document() {
                Some(cond_doc) => document_matches_filter(doc, cond_doc),
                None => false,
            }),
            _ => false,
        },
        "$or" => match value {
            Bson::Array(arr) => arr.iter().any(|cond| match cond.as_document() {
                Some(cond_doc) => document_matches_filter(doc, cond_doc),
                None => false,
            }),
            _ => false,
        },
        "$nor" => match value {
            Bson::Array(arr) => !arr.iter().any(|cond| match cond.as_document() {
                Some(cond_doc) => document_matches_filter(doc, cond_doc),
                None => false,
            }),
            _ => false,
        },
        "$not" => match value.as_document() {
            Some(cond_doc) => !document_matches_filter(doc, cond_doc),
            None => false,
        },
        _ => true,
    }
}

/// Compare a document field's value against a filter value (either a literal
/// to equality-match, or an operator document).
fn value_matches(doc_val: Option<&Bson>, filter_val: &Bson) -> bool {
    match filter_val {
        Bson::Document(filter_doc) if is_operator_doc(filter_doc) => {
            for (op, op_val) in filter_doc.iter() {
                if !operator_matches(doc_val, op, op_val) {
                    return false;
                }
            }
            true
        }
        _ => scalar_matches(doc_val, filter_val),
    }
}

fn is_operator_doc(doc: &Document) -> bool {
    doc.keys().next().is_some_and(|k| k.starts_with('$'))
}

fn operator_matches(doc_val: Option<&Bson>, op: &str, op_val: &Bson) -> bool {
    match op {
        "$eq" => scalar_matches(doc_val, op_val),
        "$ne" => !scalar_matches(doc_val, op_val),
        "$gt" => compare_matches(doc_val, op_val, |c| c == Ordering::Greater),
        "$gte" => compare_matches(doc_val, op_val, |c| c != Ordering::Less),
        "$lt" => compare_matches(doc_val, op_val, |c| c == Ordering::Less),
        "$lte" => compare_matches(doc_val, op_val, |c| c != Ordering::Greater),
        "$in" => match op_val {
            Bson::Array(arr) => arr.iter().any(|want| scalar_matches(doc_val, want)),
            _ => false,
        },
        "$nin" => !operator_matches(doc_val, "$in", op_val),
        "$exists" => {
            let should_exist = op_val.as_bool().unwrap_or(true);
            should_exist == doc_val.is_some()
        }
        "$not" => !value_matches(doc_val, op_val),
        _ => true,
    }
}

fn compare_matches(doc_val: Option<&Bson>, filter_val: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(dv) = doc_val else { return false };
    match (dv, filter_val) {
        (Bson::Double(a), _) if a.is_nan() => false,
        (_, Bson::Double(b)) if b.is_nan() => false,
        _ => accept(bson_cmp(dv, filter_val)),
    }
}

/// Scalar equality with array-containment: a non-array filter value matches an
/// array-valued field if any element equals it; an array filter value
/// requires whole-value equality (containment is disabled).
fn scalar_matches(doc_val: Option<&Bson>, filter_val: &Bson) -> bool {
    match doc_val {
        Some(Bson::Array(elems)) if !matches!(filter_val, Bson::Array(_)) => {
            elems.iter().any(|e| scalar_eq(e, filter_val))
        }
        Some(dv) => scalar_eq(dv, filter_val),
        None => matches!(filter_val, Bson::Null),
    }
}

/// Value equality with canonical numeric promotion: `1i32`, `1i64`, and `1.0`
/// all compare equal, matching the ordering operators' use of `bson_cmp`. A
/// non-finite double never compares equal to anything, including itself.
fn scalar_eq(a: &Bson, b: &Bson) -> bool {
    match (coerce_numeric(a), coerce_numeric(b)) {
        (Some(na), Some(nb)) => {
            if na.as_f64().is_nan() || nb.as_f64().is_nan() {
                return false;
            }
            bson_cmp(a, b) == Ordering::Equal
        }
        _ => a == b,
    }
}
