//! Re-exports of the shared BSON comparison/coercion helpers for aggregation
//! stage modules that historically imported them from here.
pub use crate::bson_util::{Numeric, bson_cmp, coerce_numeric};
