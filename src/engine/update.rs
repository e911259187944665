//! The update applier: replacement vs operator-document updates, applied to
//! a single document clone.

use crate::bson_util::{coerce_numeric, get_path, set_path, unset_path};
use crate::error::{CommandError, Error, Result};
use crate::matcher::document_matches_filter;
use bson::{Bson, Document};

/// Whether `update_spec` is a replacement document (no top-level key starts
/// with `$`) or an operator document.
pub fn is_replacement(update_spec: &Document) -> bool {
    !update_spec.keys().any(|k| k.starts_with('$'))
}

/// Apply `update_spec` to a clone of `original`, returning the new document
/// and whether it differs field-wise from the original. `insert_mode` is set
/// when synthesizing an upserted document: `$setOnInsert` only applies then.
pub fn apply_update(
    original: &Document,
    update_spec: &Document,
    array_filters: &[Document],
    insert_mode: bool,
) -> Result<(Document, bool)> {
    if is_replacement(update_spec) {
        let mut replacement = update_spec.clone();
        if let Some(id) = original.get("_id") {
            match replacement.get("_id") {
                Some(new_id) if new_id != id => {
                    return Err(Error::Command(CommandError::ImmutableField("_id".to_string())));
                }
                _ => {
                    replacement.insert("_id", id.clone());
                }
            }
        }
        let modified = &replacement != original;
        return Ok((replacement, modified));
    }

    let mut doc = original.clone();
    for (op, spec) in update_spec.iter() {
        let Some(fields) = spec.as_document() else {
            return Err(Error::Command(CommandError::BadValue(format!(
                "'{}' expects a document of field updates",
                op
            ))));
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields.iter() {
                    apply_set(&mut doc, path, value.clone(), array_filters)?;
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    apply_unset(&mut doc, path, array_filters)?;
                }
            }
            "$inc" => {
                apply_inc(&mut doc, fields)?;
            }
            "$setOnInsert" => {
                if insert_mode {
                    for (path, value) in fields.iter() {
                        apply_set(&mut doc, path, value.clone(), array_filters)?;
                    }
                }
            }
            _ => {
                return Err(Error::Command(CommandError::BadValue(format!(
                    "unsupported update operator '{}'",
                    op
                ))));
            }
        }
    }

    let modified = doc != *original;
    Ok((doc, modified))
}

fn reject_positional(path: &str) -> Result<()> {
    if path.split('.').any(|seg| seg == "$") {
        return Err(Error::Command(CommandError::BadValue(format!(
            "positional operator '$' is not supported in path '{}'",
            path
        ))));
    }
    Ok(())
}

fn apply_set(doc: &mut Document, path: &str, value: Bson, array_filters: &[Document]) -> Result<()> {
    reject_positional(path)?;
    if path == "_id" {
        if let Some(existing) = doc.get("_id") {
            if *existing != value {
                return Err(Error::Command(CommandError::ImmutableField("_id".to_string())));
            }
        }
    }
    if let Some((prefix, ident, suffix)) = split_array_filter_path(path) {
        return apply_array_filter_mutation(doc, &prefix, &ident, &suffix, array_filters, |elem| {
            if suffix.is_empty() {
                *elem = value.clone();
                return Ok(());
            }
            match elem {
                Bson::Document(d) => {
                    set_path(d, &suffix, value.clone()).map_err(|e| Error::Command(CommandError::PathConflict(e)))
                }
                _ => Err(Error::Command(CommandError::PathConflict(format!(
                    "cannot set '{}' on non-document array element",
                    suffix
                )))),
            }
        });
    }
    set_path(doc, path, value).map_err(|e| Error::Command(CommandError::PathConflict(e)))
}

fn apply_unset(doc: &mut Document, path: &str, array_filters: &[Document]) -> Result<()> {
    reject_positional(path)?;
    if let Some((prefix, ident, suffix)) = split_array_filter_path(path) {
        return apply_array_filter_mutation(doc, &prefix, &ident, &suffix, array_filters, |elem| {
            if let Bson::Document(d) = elem {
                unset_path(d, &suffix);
            }
            Ok(())
        });
    }
    unset_path(doc, path);
    Ok(())
}

fn apply_inc(doc: &mut Document, fields: &Document) -> Result<()> {
    // $inc must be atomic: validate every target before mutating anything.
    for (path, delta) in fields.iter() {
        let Some(delta_num) = coerce_numeric(delta) else {
            return Err(Error::Command(CommandError::TypeMismatch(format!(
                "cannot $inc by non-numeric value at '{}'",
                path
            ))));
        };
        if let Some(existing) = get_path(doc, path) {
            if coerce_numeric(&existing).is_none() {
                return Err(Error::Command(CommandError::TypeMismatch(format!(
                    "cannot apply $inc to non-numeric field '{}'",
                    path
                ))));
            }
        }
        let _ = delta_num;
    }
    for (path, delta) in fields.iter() {
        let delta_num = coerce_numeric(delta).expect("validated above");
        let current = get_path(doc, path).and_then(|v| coerce_numeric(&v));
        let new_value = match current {
            Some(n) => n.checked_add(delta_num),
            None => delta_num,
        };
        set_path(doc, path, new_value.to_bson()).map_err(|e| Error::Command(CommandError::PathConflict(e)))?;
    }
    Ok(())
}

/// Split a path like `items.$[tag].field` into (`items`, `tag`, `field`).
/// Returns `None` for paths without an array-filter placeholder.
fn split_array_filter_path(path: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = path.split('.').collect();
    let marker_pos = parts.iter().position(|p| p.starts_with("$[") && p.ends_with(']'))?;
    let ident = parts[marker_pos][2..parts[marker_pos].len() - 1].to_string();
    let prefix = parts[..marker_pos].join(".");
    let suffix = parts[marker_pos + 1..].join(".");
    Some((prefix, ident, suffix))
}

fn apply_array_filter_mutation(
    doc: &mut Document,
    prefix: &str,
    identifier: &str,
    _suffix: &str,
    array_filters: &[Document],
    mutate: impl Fn(&mut Bson) -> Result<()>,
) -> Result<()> {
    let filter_doc = array_filters
        .iter()
        .find(|f| f.keys().any(|k| k.split('.').next() == Some(identifier)))
        .ok_or_else(|| {
            Error::Command(CommandError::BadValue(format!(
                "no array filter found for identifier '{}'",
                identifier
            )))
        })?;

    let array = match doc.get_mut(prefix) {
        Some(Bson::Array(arr)) => arr,
        Some(_) => {
            return Err(Error::Command(CommandError::PathConflict(format!(
                "'{}' is not an array",
                prefix
            ))));
        }
        None => return Ok(()),
    };

    for elem in array.iter_mut() {
        let elem_as_doc = bson::doc! {identifier: elem.clone()};
        let rewritten_filter: Document = filter_doc
            .iter()
            .map(|(k, v)| {
                let rewritten_key = k.replacen(identifier, identifier, 1);
                (rewritten_key, v.clone())
            })
            .collect();
        if document_matches_filter(&elem_as_doc, &rewritten_filter) {
            mutate(elem)?;
        }
    }
    Ok(())
}
