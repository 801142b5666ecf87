//! Evaluation of input and output mapping batches.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::constants::{constant_value, ConfigReader, FsResourceReader, ResourceReader};
use crate::error::MappingError;
use crate::model::{lookup_in, parse_path, remove_in, set_in, Lookup, ModelStore, MODEL, MODEL_NAMESPACE};
use crate::operators::apply_type_cast;
use crate::plugins::PluginRegistry;
use crate::statement::{
    is_constant, is_pluggable_function, plugin_call, type_cast_index, MappingStatement, DATA_TYPE,
    DECISION, EXT_NAMESPACE, HEADER, HEADER_NAMESPACE, INPUT, JSON_PATH, OUTPUT_NAMESPACE, RESULT,
    STATUS, WHOLE_PAYLOAD,
};
use crate::value::Value;

const INPUT_HEADER_NAMESPACE: &str = "input.header.";
const ERROR: &str = "error";
const OUTPUT_STATUS: &str = "output.status";
const OUTPUT_HEADER: &str = "output.header";

/// Write against the external state machine produced by an `ext:` destination
#[derive(Debug, Clone, PartialEq)]
pub enum ExtOp {
    Put { key: String, value: Value },
    Remove { key: String },
}

/// Call payload built by an input-mapping batch
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskInput {
    pub body: Value,
    pub headers: BTreeMap<String, String>,
    pub ext_ops: Vec<ExtOp>,
}

/// What a task returned, as seen by output mappings
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    pub body: Value,
    pub status: i32,
    pub headers: BTreeMap<String, String>,
    pub datatype: Option<String>,
}

impl TaskResult {
    pub fn ok(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            status: 200,
            headers: BTreeMap::new(),
            datatype: None,
        }
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Effects of an output-mapping batch beyond the model writes
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskOutput {
    /// Everything written under `output.*`
    pub output: Value,
    /// Value written to `decision`
    pub decision: Option<Value>,
    pub ext_ops: Vec<ExtOp>,
}

/// Resolution scope of one mapping batch: fixed namespaces plus the live model.
pub struct Source<'a> {
    namespaces: Value,
    model: &'a ModelStore,
}

impl<'a> Source<'a> {
    pub fn new(namespaces: Value, model: &'a ModelStore) -> Self {
        Self { namespaces, model }
    }

    fn json_path(&self, expression: &str) -> Option<Value> {
        let mut document = self.namespaces.to_json();
        if let Some(map) = document.as_object_mut() {
            map.insert(MODEL.to_string(), self.model.snapshot().to_json());
        }
        let query = expression.trim().trim_start_matches(JSON_PATH).trim_start_matches('.');
        if query.is_empty() {
            return Some(Value::from(document));
        }
        let compiled = match jmespath::compile(query) {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!("Invalid JSON path {} - {}", expression, e);
                return None;
            }
        };
        match compiled.search(&document) {
            Ok(found) => serde_json::to_value(&*found)
                .ok()
                .map(Value::from)
                .filter(|v| !v.is_null()),
            Err(e) => {
                warn!("Unable to evaluate JSON path {} - {}", expression, e);
                None
            }
        }
    }
}

impl Lookup for Source<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        let path = path.trim();
        if path.starts_with(JSON_PATH) {
            return self.json_path(path);
        }
        if path == MODEL || path.starts_with(MODEL_NAMESPACE) {
            return self.model.get(path);
        }
        if let Some(key) = path.strip_prefix(INPUT_HEADER_NAMESPACE) {
            return lookup_in(&self.namespaces, &format!("{}{}", INPUT_HEADER_NAMESPACE, key.to_lowercase()));
        }
        lookup_in(&self.namespaces, path)
    }
}

/// Evaluates mapping batches against a model store.
///
/// The evaluator is stateless between calls. Configuration and resources are
/// read again on every evaluation.
pub struct MappingEvaluator {
    plugins: Arc<PluginRegistry>,
    config: Arc<dyn ConfigReader>,
    resources: Arc<dyn ResourceReader>,
}

impl Default for MappingEvaluator {
    fn default() -> Self {
        Self::new(
            Arc::new(PluginRegistry::with_builtins()),
            Arc::new(Value::Null),
            Arc::new(FsResourceReader::default()),
        )
    }
}

impl MappingEvaluator {
    pub fn new(
        plugins: Arc<PluginRegistry>,
        config: Arc<dyn ConfigReader>,
        resources: Arc<dyn ResourceReader>,
    ) -> Self {
        Self {
            plugins,
            config,
            resources,
        }
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Resolve the value of a left-hand side.
    pub fn resolve_lhs(&self, lhs: &str, source: &dyn Lookup) -> Result<Option<Value>, MappingError> {
        let lhs = lhs.trim();
        if is_constant(lhs) {
            return Ok(constant_value(lhs, self.config.as_ref(), self.resources.as_ref()));
        }
        if lhs.starts_with(JSON_PATH) {
            return Ok(source.lookup(lhs));
        }
        let colon = type_cast_index(lhs);
        let selector = colon.map(|c| lhs[..c].trim()).unwrap_or(lhs);
        let value = if is_pluggable_function(selector) {
            self.call_plugin(selector, source)?
        } else {
            source.lookup(selector)
        };
        match colon {
            Some(c) => apply_type_cast(&lhs[c + 1..], value, source, lhs),
            None => Ok(value),
        }
    }

    fn call_plugin(&self, selector: &str, source: &dyn Lookup) -> Result<Option<Value>, MappingError> {
        let (name, args) =
            plugin_call(selector).ok_or_else(|| MappingError::InvalidStatement(selector.to_string()))?;
        let resolved: Vec<Value> = args
            .iter()
            .map(|arg| source.lookup(arg).unwrap_or_default())
            .collect();
        let result = self.plugins.invoke(&name, &resolved)?;
        Ok(Some(result).filter(|v| !v.is_null()))
    }

    /// Apply an optional `:type` suffix on a `model.*` destination.
    fn split_destination<'s>(
        &self,
        rhs: &'s str,
        value: Option<Value>,
        source: &dyn Lookup,
    ) -> Result<(&'s str, Option<Value>), MappingError> {
        match type_cast_index(rhs) {
            Some(c) => {
                let cast = apply_type_cast(&rhs[c + 1..], value, source, rhs)?;
                Ok((rhs[..c].trim(), cast))
            }
            None => Ok((rhs, value)),
        }
    }

    /// Run an input-mapping batch in declaration order.
    ///
    /// `input` is the flow's triggering dataset and `error` the error map
    /// handed to an exception handler, if any.
    pub fn build_input(
        &self,
        statements: &[String],
        model: &ModelStore,
        input: &Value,
        error: Option<&Value>,
    ) -> Result<TaskInput, MappingError> {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(INPUT.to_string(), input.clone());
        if let Some(error) = error {
            namespaces.insert(ERROR.to_string(), error.clone());
        }
        let source = Source::new(Value::Map(namespaces), model);
        let mut target = TaskInput {
            body: Value::map(),
            ..TaskInput::default()
        };
        for text in statements {
            let statement = MappingStatement::parse(text)?;
            let value = self.resolve_lhs(&statement.lhs, &source)?;
            debug!(statement = %statement, found = value.is_some(), "Input mapping");
            self.write_input(&statement.rhs, value, &source, model, &mut target)?;
        }
        Ok(target)
    }

    fn write_input(
        &self,
        rhs: &str,
        value: Option<Value>,
        source: &dyn Lookup,
        model: &ModelStore,
        target: &mut TaskInput,
    ) -> Result<(), MappingError> {
        if rhs.starts_with(MODEL_NAMESPACE) {
            let (path, value) = self.split_destination(rhs, value, source)?;
            match value {
                Some(v) => model.set(path, v)?,
                None => {
                    model.remove(path);
                }
            }
            return Ok(());
        }
        if let Some(key) = rhs.strip_prefix(EXT_NAMESPACE) {
            target.ext_ops.push(ext_op(key, value));
            return Ok(());
        }
        let Some(value) = value else {
            return Ok(());
        };
        if rhs == WHOLE_PAYLOAD {
            if value.is_map() {
                target.body = value;
            } else {
                warn!("Unable to map {} to the whole payload - value is not a map", value.to_text());
            }
        } else if rhs == HEADER {
            match value {
                Value::Map(map) => {
                    for (k, v) in map {
                        target.headers.insert(k.to_lowercase(), v.to_text());
                    }
                }
                other => warn!("Unable to map {} to headers - value is not a map", other.to_text()),
            }
        } else if let Some(key) = rhs.strip_prefix(HEADER_NAMESPACE) {
            target.headers.insert(key.trim().to_lowercase(), value.to_text());
        } else {
            set_in(&mut target.body, &parse_path(rhs)?, value);
        }
        Ok(())
    }

    /// Run an output-mapping batch in declaration order.
    pub fn apply_output(
        &self,
        statements: &[String],
        model: &ModelStore,
        input: &Value,
        result: &TaskResult,
    ) -> Result<TaskOutput, MappingError> {
        let mut namespaces = BTreeMap::new();
        namespaces.insert(INPUT.to_string(), input.clone());
        namespaces.insert(RESULT.to_string(), result.body.clone());
        namespaces.insert(STATUS.to_string(), Value::Int(result.status));
        namespaces.insert(
            HEADER.to_string(),
            Value::Map(
                result
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::Text(v.clone())))
                    .collect(),
            ),
        );
        if let Some(datatype) = &result.datatype {
            namespaces.insert(DATA_TYPE.to_string(), Value::Text(datatype.clone()));
        }
        let source = Source::new(Value::Map(namespaces), model);
        let mut target = TaskOutput {
            output: Value::map(),
            ..TaskOutput::default()
        };
        for text in statements {
            let statement = MappingStatement::parse(text)?;
            let value = self.resolve_lhs(&statement.lhs, &source)?;
            debug!(statement = %statement, found = value.is_some(), "Output mapping");
            self.write_output(&statement.rhs, value, &source, model, &mut target)?;
        }
        Ok(target)
    }

    fn write_output(
        &self,
        rhs: &str,
        value: Option<Value>,
        source: &dyn Lookup,
        model: &ModelStore,
        target: &mut TaskOutput,
    ) -> Result<(), MappingError> {
        if rhs == DECISION {
            target.decision = value;
            return Ok(());
        }
        if rhs.starts_with(MODEL_NAMESPACE) {
            let (path, value) = self.split_destination(rhs, value, source)?;
            match value {
                Some(v) => model.set(path, v)?,
                None => {
                    model.remove(path);
                }
            }
            return Ok(());
        }
        if let Some(key) = rhs.strip_prefix(EXT_NAMESPACE) {
            target.ext_ops.push(ext_op(key, value));
            return Ok(());
        }
        let Some(path) = rhs.strip_prefix(OUTPUT_NAMESPACE) else {
            return Err(MappingError::InvalidStatement(format!("unsupported destination {}", rhs)));
        };
        let segments = parse_path(path)?;
        let Some(value) = value else {
            remove_in(&mut target.output, &segments);
            return Ok(());
        };
        if rhs == OUTPUT_STATUS {
            match value.to_long().filter(|s| (100..=599).contains(s)) {
                Some(status) => set_in(&mut target.output, &segments, Value::Int(status as i32)),
                None => warn!("Ignored invalid {} {} - must be 100 to 599", OUTPUT_STATUS, value.to_text()),
            }
        } else if rhs == OUTPUT_HEADER && !value.is_map() {
            warn!("Ignored invalid {} {} - must be a map", OUTPUT_HEADER, value.to_text());
        } else {
            set_in(&mut target.output, &segments, value);
        }
        Ok(())
    }
}

fn ext_op(key: &str, value: Option<Value>) -> ExtOp {
    let key = key.trim().to_string();
    match value {
        Some(value) => ExtOp::Put { key, value },
        None => ExtOp::Remove { key },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn statements(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn input_mapping_builds_body_headers_and_model() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        model.set("model.user", "ada").unwrap();
        let input = Value::from(json!({"body": {"id": 7}, "header": {"x-trace": "t-1"}}));
        let out = evaluator
            .build_input(
                &statements(&[
                    "input.body.id -> order_id",
                    "model.user -> customer.name",
                    "input.header.X-Trace -> header.X-Trace",
                    "text(fetch) -> model.step",
                    "int(3) -> ext:attempts",
                ]),
                &model,
                &input,
                None,
            )
            .unwrap();
        assert_eq!(out.body.to_json(), json!({"order_id": 7, "customer": {"name": "ada"}}));
        assert_eq!(out.headers.get("x-trace").map(String::as_str), Some("t-1"));
        assert_eq!(model.get("model.step"), Some(Value::from("fetch")));
        assert_eq!(
            out.ext_ops,
            vec![ExtOp::Put {
                key: "attempts".into(),
                value: Value::Int(3)
            }]
        );
    }

    #[test]
    fn later_statements_see_earlier_writes() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        let out = evaluator
            .build_input(
                &statements(&["text(42) -> model.raw", "model.raw:int -> amount"]),
                &model,
                &Value::Null,
                None,
            )
            .unwrap();
        assert_eq!(out.body.to_json(), json!({"amount": 42}));
    }

    #[test]
    fn null_source_removes_model_key() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        model.set("model.stale", 1).unwrap();
        evaluator
            .build_input(&statements(&["input.missing -> model.stale"]), &model, &Value::Null, None)
            .unwrap();
        assert!(!model.exists("model.stale"));
    }

    #[test]
    fn whole_payload_and_error_namespace() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        let input = Value::from(json!({"body": {"a": 1}}));
        let error = Value::from(json!({"code": 500, "message": "boom"}));
        let out = evaluator
            .build_input(
                &statements(&["input.body -> *", "error.message -> reason"]),
                &model,
                &input,
                Some(&error),
            )
            .unwrap();
        assert_eq!(out.body.to_json(), json!({"a": 1, "reason": "boom"}));
    }

    #[test]
    fn json_path_reads_across_namespaces() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        model.set("model.items", Value::from(json!([{"sku": "A"}, {"sku": "B"}]))).unwrap();
        let out = evaluator
            .build_input(&statements(&["$.model.items[1].sku -> sku"]), &model, &Value::Null, None)
            .unwrap();
        assert_eq!(out.body.to_json(), json!({"sku": "B"}));
    }

    #[test]
    fn output_mapping_writes_every_destination() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        let result = TaskResult::ok(json!({"id": "o-1", "total": "12"}))
            .with_status(201)
            .with_header("x-region", "eu");
        let out = evaluator
            .apply_output(
                &statements(&[
                    "result.id -> model.order.id",
                    "result.total -> model.order.total:int",
                    "status -> output.status",
                    "header -> output.header",
                    "result -> output.body",
                    "result.id -> ext:last_order",
                ]),
                &model,
                &Value::Null,
                &result,
            )
            .unwrap();
        assert_eq!(model.get("model.order.id"), Some(Value::from("o-1")));
        assert_eq!(model.get("model.order.total"), Some(Value::Int(12)));
        assert_eq!(
            out.output.to_json(),
            json!({"status": 201, "header": {"x-region": "eu"}, "body": {"id": "o-1", "total": "12"}})
        );
        assert_eq!(
            out.ext_ops,
            vec![ExtOp::Put {
                key: "last_order".into(),
                value: Value::from("o-1")
            }]
        );
    }

    #[test]
    fn invalid_status_and_header_are_skipped() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        let out = evaluator
            .apply_output(
                &statements(&["int(999) -> output.status", "text(x) -> output.header"]),
                &model,
                &Value::Null,
                &TaskResult::ok(Value::Null),
            )
            .unwrap();
        assert_eq!(out.output.to_json(), json!({}));
    }

    #[test]
    fn decision_and_ext_removal() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        let out = evaluator
            .apply_output(
                &statements(&["result.approved -> decision", "result.none -> ext:flag"]),
                &model,
                &Value::Null,
                &TaskResult::ok(json!({"approved": true})),
            )
            .unwrap();
        assert_eq!(out.decision, Some(Value::Bool(true)));
        assert_eq!(out.ext_ops, vec![ExtOp::Remove { key: "flag".into() }]);
    }

    #[test]
    fn logical_casts_in_output_mapping() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        model.set("model.positive", true).unwrap();
        model.set("model.negative", false).unwrap();
        let out = evaluator
            .apply_output(
                &statements(&[
                    "model.positive:and(model.negative) -> output.body.and",
                    "model.positive:or(model.negative) -> output.body.or",
                ]),
                &model,
                &Value::Null,
                &TaskResult::ok(Value::Null),
            )
            .unwrap();
        assert_eq!(out.output.to_json(), json!({"body": {"and": false, "or": true}}));
    }

    #[test]
    fn pluggable_functions_resolve_model_arguments() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        model.set("model.a", 2).unwrap();
        model.set("model.b", 3).unwrap();
        evaluator
            .apply_output(
                &statements(&["f:add(model.a, model.b) -> model.sum"]),
                &model,
                &Value::Null,
                &TaskResult::ok(Value::Null),
            )
            .unwrap();
        assert_eq!(model.get("model.sum"), Some(Value::Long(5)));
    }

    #[test]
    fn unknown_function_fails_at_evaluation() {
        let evaluator = MappingEvaluator::default();
        let model = ModelStore::new();
        let err = evaluator
            .apply_output(
                &statements(&["f:missing(model.a) -> model.x"]),
                &model,
                &Value::Null,
                &TaskResult::ok(Value::Null),
            )
            .unwrap_err();
        assert_eq!(err, MappingError::UnknownFunction("missing".into()));
    }
}
