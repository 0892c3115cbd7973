//! Plan building, SQL generation and static SQL safety checks.

pub mod canonical;
pub mod parse;
pub mod plan;
pub mod sql;
pub mod validator;

pub use canonical::{canonicalize_sql, sql_hash};
pub use parse::SqlParseError;
pub use plan::{PlanError, build_plan};
pub use sql::{CompileError, SqlCompiler};
pub use validator::{SqlValidator, ValidationError};
