pub mod exec;
pub mod expr;
pub mod pipeline;
pub mod stages;
pub mod values;

pub use exec::{ExecContext, ExecResult, execute_pipeline};
pub use expr::{Expr, ExprEvalContext, eval_expr, parse_expr};
pub use pipeline::{AggregateOptions, Pipeline, Stage};
pub use values::{Numeric, bson_cmp, coerce_numeric};
