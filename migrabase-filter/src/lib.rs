//! migrabase-filter: CEL list filters compiled to parameterized SQL.
//!
//! ```
//! use migrabase_filter::{args, compile_filter, qb, FilterError, FilterSchema, FilterValue};
//!
//! struct Names;
//!
//! impl FilterSchema for Names {
//!     fn equals(&self, variable: &str, value: &FilterValue) -> Result<qb::Query, FilterError> {
//!         match variable {
//!             "name" => Ok(qb::q("t.name = ?", args![value.as_str(variable)?])),
//!             _ => Err(FilterError::UnsupportedVariable(variable.to_owned())),
//!         }
//!     }
//! }
//!
//! let query = compile_filter(r#"name == "a" || name == "b""#, &Names).unwrap().unwrap();
//! let (sql, values) = query.to_sql().unwrap();
//! assert_eq!(sql, "((t.name = $1 OR t.name = $2))");
//! assert_eq!(values.len(), 2);
//! ```

pub mod cel;
pub mod compile;
pub mod error;
pub mod order;
pub mod qb;

pub use compile::{compile_filter, CompareOp, FilterSchema, FilterValue};
pub use error::{FilterError, ParseError, QueryError};
pub use order::{parse_order_by, OrderByKey, SortOrder};
pub use qb::{Placeholder, Query, Value};
