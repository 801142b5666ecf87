//! # Eventflow Mapping
//!
//! The data-mapping language that binds values between a task's input or
//! output and the live model of a flow instance. Statements read
//! `LHS -> RHS` and are evaluated in declaration order.
//!
//! ## Features
//!
//! * Namespace-checked statements (`input.*`, `model.*`, `result.*`, `output.*`, `ext:*`)
//! * Type-cast suffixes such as `model.amount:int` or `model.name:concat(text(!))`
//! * Constant producers: `text(...)`, `int(...)`, `map(k=v)`, `file(json:/a.json)`
//! * Pluggable functions: `f:add(model.a, model.b)`
//! * JSON path lookups through JMESPath: `$.input.body.items[0]`
//!
//! ## Example
//!
//! ```
//! use eventflow_mapping::{MappingEvaluator, ModelStore, TaskResult, Value};
//! use serde_json::json;
//!
//! let evaluator = MappingEvaluator::default();
//! let model = ModelStore::new();
//! model.set("model.count", 41).unwrap();
//!
//! let statements = vec!["f:increment(model.count) -> model.count".to_string()];
//! evaluator
//!     .apply_output(&statements, &model, &Value::Null, &TaskResult::ok(json!({})))
//!     .unwrap();
//! assert_eq!(model.get("model.count"), Some(Value::Long(42)));
//! ```

mod error;

pub mod constants;
pub mod evaluator;
pub mod model;
pub mod operators;
pub mod plugins;
pub mod statement;
pub mod value;

pub use constants::{ConfigReader, FileDescriptor, FileMode, FsResourceReader, ResourceReader};
pub use error::MappingError;
pub use evaluator::{ExtOp, MappingEvaluator, Source, TaskInput, TaskOutput, TaskResult};
pub use model::{Lookup, ModelStore, SharedMap};
pub use plugins::{FnPlugin, PluginFunction, PluginRegistry};
pub use statement::{validate_input, validate_output, MappingStatement, ValidationError};
pub use value::Value;
