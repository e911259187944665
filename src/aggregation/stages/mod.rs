pub mod add_fields;
pub mod count;
pub mod facet;
pub mod group;
pub mod limit;
pub mod project;
pub mod replace_root;
pub mod set;
pub mod skip;
pub mod sort;
pub mod sort_by_count;
pub mod unset;
pub mod unwind;
