//! Shared BSON helpers: dotted-path access, canonical type-ordered
//! comparison, numeric coercion, and canonical stringification used to key
//! sessions by their `lsid` document.

use bson::{Bson, Document};
use std::cmp::Ordering;

/// Compare two BSON values using MongoDB's cross-type ordering:
/// Null < Numbers < String < Document < Array < Binary < ObjectId < Boolean
/// < DateTime < Timestamp < RegEx < DbPointer < JsCode < Symbol <
/// JsCodeWithScope < Undefined < (everything else, e.g. MinKey/MaxKey).
pub fn bson_cmp(a: &Bson, b: &Bson) -> Ordering {
    let type_order = |v: &Bson| match v {
        Bson::Null => 0,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::ObjectId(_) => 6,
        Bson::Boolean(_) => 7,
        Bson::DateTime(_) => 8,
        Bson::Timestamp(_) => 9,
        Bson::RegularExpression(_) => 10,
        Bson::DbPointer(_) => 11,
        Bson::JavaScriptCode(_) => 12,
        Bson::Symbol(_) => 13,
        Bson::JavaScriptCodeWithScope(_) => 14,
        Bson::Undefined => 15,
        _ => 16,
    };

    let (ord_a, ord_b) = (type_order(a), type_order(b));
    if ord_a != ord_b {
        return ord_a.cmp(&ord_b);
    }

    match (a, b) {
        (Bson::Null, Bson::Null) => Ordering::Equal,
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => a.timestamp_millis().cmp(&b.timestamp_millis()),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => a.to_hex().cmp(&b.to_hex()),
        (Bson::Document(a), Bson::Document(b)) => compare_documents(a, b),
        (Bson::Array(a), Bson::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let c = bson_cmp(x, y);
                if c != Ordering::Equal {
                    return c;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => match (coerce_numeric(a), coerce_numeric(b)) {
            (Some(na), Some(nb)) => numeric_cmp(na, nb),
            _ => Ordering::Equal,
        },
    }
}

fn compare_documents(a: &Document, b: &Document) -> Ordering {
    let mut ai = a.iter();
    let mut bi = b.iter();
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ka, va)), Some((kb, vb))) => {
                let kc = ka.cmp(kb);
                if kc != Ordering::Equal {
                    return kc;
                }
                let vc = bson_cmp(va, vb);
                if vc != Ordering::Equal {
                    return vc;
                }
            }
        }
    }
}

fn numeric_cmp(a: Numeric, b: Numeric) -> Ordering {
    let (fa, fb) = (a.as_f64(), b.as_f64());
    if fa.is_nan() && fb.is_nan() {
        Ordering::Equal
    } else if fa.is_nan() {
        Ordering::Less
    } else if fb.is_nan() {
        Ordering::Greater
    } else {
        fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
    }
}

/// Canonical numeric representation spanning int32/int64/double.
#[derive(Debug, Clone, Copy)]
pub enum Numeric {
    Int32(i32),
    Int64(i64),
    Double(f64),
}

impl Numeric {
    pub fn as_f64(&self) -> f64 {
        match self {
            Numeric::Int32(n) => *n as f64,
            Numeric::Int64(n) => *n as f64,
            Numeric::Double(n) => *n,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Numeric::Int32(n) => *n as i64,
            Numeric::Int64(n) => *n,
            Numeric::Double(n) => *n as i64,
        }
    }

    /// Add two numerics, widening per MongoDB's promotion rule: int32+int32
    /// stays int32 unless it would overflow, anything touching a double
    /// becomes a double, otherwise the result is int64.
    pub fn checked_add(self, other: Numeric) -> Numeric {
        match (self, other) {
            (Numeric::Double(_), _) | (_, Numeric::Double(_)) => {
                Numeric::Double(self.as_f64() + other.as_f64())
            }
            (Numeric::Int32(a), Numeric::Int32(b)) => match a.checked_add(b) {
                Some(v) => Numeric::Int32(v),
                None => Numeric::Int64(a as i64 + b as i64),
            },
            _ => Numeric::Int64(self.as_i64() + other.as_i64()),
        }
    }

    pub fn to_bson(self) -> Bson {
        match self {
            Numeric::Int32(n) => Bson::Int32(n),
            Numeric::Int64(n) => Bson::Int64(n),
            Numeric::Double(n) => Bson::Double(n),
        }
    }
}

/// Coerce a BSON value to a numeric type, if it is one.
pub fn coerce_numeric(val: &Bson) -> Option<Numeric> {
    match val {
        Bson::Int32(n) => Some(Numeric::Int32(*n)),
        Bson::Int64(n) => Some(Numeric::Int64(*n)),
        Bson::Double(n) => Some(Numeric::Double(*n)),
        _ => None,
    }
}

/// Read a dotted field path out of a document, returning a clone of the
/// value found (or `None` if any segment is missing or not a document).
pub fn get_path(doc: &Document, path: &str) -> Option<Bson> {
    let mut current = Bson::Document(doc.clone());
    for part in path.split('.') {
        match current {
            Bson::Document(d) => current = d.get(part)?.clone(),
            _ => return None,
        }
    }
    Some(current)
}

/// Write a value at a dotted field path, creating intermediate documents as
/// needed. Returns an error if an intermediate segment already holds a
/// non-document scalar (a "path conflict").
pub fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<(), String> {
    let parts: Vec<&str> = path.split('.').collect();
    set_path_parts(doc, &parts, value)
}

fn set_path_parts(doc: &mut Document, parts: &[&str], value: Bson) -> Result<(), String> {
    if parts.len() == 1 {
        doc.insert(parts[0].to_string(), value);
        return Ok(());
    }
    let head = parts[0];
    if !doc.contains_key(head) {
        doc.insert(head.to_string(), Bson::Document(Document::new()));
    }
    match doc.get_mut(head) {
        Some(Bson::Document(inner)) => set_path_parts(inner, &parts[1..], value),
        _ => Err(format!("path conflict at '{}'", head)),
    }
}

/// Remove a value at a dotted field path. No-op if any segment is missing.
pub fn unset_path(doc: &mut Document, path: &str) {
    let parts: Vec<&str> = path.split('.').collect();
    unset_path_parts(doc, &parts);
}

fn unset_path_parts(doc: &mut Document, parts: &[&str]) {
    if parts.len() == 1 {
        doc.remove(parts[0]);
        return;
    }
    if let Some(Bson::Document(inner)) = doc.get_mut(parts[0]) {
        unset_path_parts(inner, &parts[1..]);
    }
}

/// Canonical JSON-ish string of a document with keys sorted recursively, used
/// to derive a stable session key from a driver's `lsid` document (which may
/// arrive with fields in different orders across connections).
pub fn canonical_string(doc: &Document) -> String {
    let mut keys: Vec<&String> = doc.keys().collect();
    keys.sort();
    let mut out = String::from("{");
    for (i, k) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!("{:?}:", k));
        out.push_str(&canonical_bson(doc.get(*k).unwrap()));
    }
    out.push('}');
    out
}

fn canonical_bson(val: &Bson) -> String {
    match val {
        Bson::Document(d) => canonical_string(d),
        Bson::Array(arr) => {
            let parts: Vec<String> = arr.iter().map(canonical_bson).collect();
            format!("[{}]", parts.join(","))
        }
        Bson::Binary(b) => format!("bin:{}", hex_encode(&b.bytes)),
        other => format!("{:?}", other),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn dotted_path_round_trip() {
        let mut d = Document::new();
        set_path(&mut d, "a.b.c", Bson::Int32(1)).unwrap();
        assert_eq!(get_path(&d, "a.b.c"), Some(Bson::Int32(1)));
    }

    #[test]
    fn set_path_conflict_on_scalar() {
        let mut d = doc! {"a": 1i32};
        assert!(set_path(&mut d, "a.b", Bson::Int32(2)).is_err());
    }

    #[test]
    fn canonical_string_is_order_independent() {
        let a = doc! {"id": 1i32, "uid": "x"};
        let b = doc! {"uid": "x", "id": 1i32};
        assert_eq!(canonical_string(&a), canonical_string(&b));
    }

    #[test]
    fn numeric_comparison_crosses_types() {
        assert_eq!(bson_cmp(&Bson::Int32(1), &Bson::Double(1.0)), Ordering::Equal);
        assert_eq!(bson_cmp(&Bson::Int32(1), &Bson::Int64(2)), Ordering::Less);
    }
}
