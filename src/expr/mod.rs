//! Expression evaluation for `${...}` references and function calls
//!
//! Property trees, `when` gates, destroy commands and module outputs are all
//! resolved through [`evaluate`]. A string that is exactly one expression
//! yields the expression's native value (numbers stay numbers); a string
//! with embedded expressions has each span replaced by its string form.

mod functions;
mod reference;
mod scanner;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::state::ResourceState;

pub(crate) use scanner::{find_top_level, scan_spans, split_top_level};

/// Errors raised while resolving expressions
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("Unterminated expression in {0:?}")]
    Unterminated(String),

    #[error("Empty reference")]
    EmptyReference,

    #[error("Unknown reference: {0}")]
    UnknownReference(String),

    #[error("Invalid array index in reference: {0}")]
    InvalidIndex(String),

    #[error("Cannot navigate into non-container value: {0}")]
    NotAContainer(String),

    #[error("Unknown resource in reference: {0}")]
    ResourceNotFound(String),

    #[error("Reference {0} resolved to no value")]
    NoValue(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Function {name} expects {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: &'static str,
        got: usize,
    },

    #[error("Invalid map literal: {0}")]
    InvalidMapLiteral(String),
}

pub type ExprResult<T> = Result<T, ExprError>;

/// Read-side view expressions are resolved against: the caller's inputs and
/// every resource already applied in this run.
pub struct EvalContext<'a> {
    pub inputs: &'a Map<String, Value>,
    pub resources: &'a IndexMap<String, ResourceState>,
}

/// Resolve every expression in `value`, recursing into maps and sequences.
pub fn evaluate(value: &Value, ctx: &EvalContext<'_>) -> ExprResult<Value> {
    match value {
        Value::String(s) => evaluate_string(s, ctx),
        Value::Array(items) => {
            let resolved = items
                .iter()
                .map(|item| evaluate(item, ctx))
                .collect::<ExprResult<Vec<_>>>()?;
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), evaluate(item, ctx)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn evaluate_string(s: &str, ctx: &EvalContext<'_>) -> ExprResult<Value> {
    if !s.contains("${") {
        return Ok(Value::String(s.to_string()));
    }

    let spans = scan_spans(s)?;
    if spans.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    // One expression spanning the whole string keeps its native type.
    if spans.len() == 1 && spans[0].start == 0 && spans[0].end == s.len() {
        let inner = &s[spans[0].start + 2..spans[0].end - 1];
        return evaluate_expression(inner, ctx);
    }

    let mut out = String::new();
    let mut cursor = 0;
    for span in &spans {
        out.push_str(&s[cursor..span.start]);
        let inner = &s[span.start + 2..span.end - 1];
        let resolved = evaluate_expression(inner, ctx)?;
        out.push_str(&stringify(&resolved));
        cursor = span.end;
    }
    out.push_str(&s[cursor..]);

    Ok(Value::String(out))
}

/// String form of a resolved value when pasted into a larger string.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Evaluate the text between `${` and `}`.
pub(crate) fn evaluate_expression(expr: &str, ctx: &EvalContext<'_>) -> ExprResult<Value> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ExprError::EmptyReference);
    }

    if expr.starts_with('{') {
        return parse_map_literal(expr, ctx);
    }

    if let Some(call) = as_function_call(expr) {
        let (name, raw_args) = call;
        let mut args = Vec::new();
        for raw in split_top_level(raw_args, ',') {
            let raw = raw.trim();
            if !raw.is_empty() {
                args.push(evaluate_token(raw, ctx)?);
            }
        }
        return functions::call_function(name, &args, ctx);
    }

    match expr.split('.').next() {
        Some("inputs") | Some("resources") => reference::resolve_reference(expr, ctx),
        _ => Err(ExprError::UnknownReference(expr.to_string())),
    }
}

/// Evaluate a function argument or inline-map value.
///
/// Unlike top-level expressions, bare words here fall back to string
/// literals so `coalesce(inputs.tag, latest)` reads naturally.
fn evaluate_token(token: &str, ctx: &EvalContext<'_>) -> ExprResult<Value> {
    let t = token.trim();
    if t.is_empty() {
        return Ok(Value::Null);
    }

    if (t.starts_with('\'') && t.ends_with('\'') && t.len() >= 2)
        || (t.starts_with('"') && t.ends_with('"') && t.len() >= 2)
    {
        return Ok(Value::String(t[1..t.len() - 1].to_string()));
    }

    match t {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }

    if let Ok(n) = t.parse::<i64>() {
        return Ok(Value::from(n));
    }
    if let Ok(f) = t.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Ok(Value::Number(n));
        }
    }

    if t.starts_with('{') {
        return parse_map_literal(t, ctx);
    }

    if as_function_call(t).is_some() {
        return evaluate_expression(t, ctx);
    }

    match t.split('.').next() {
        Some("inputs") | Some("resources") => reference::resolve_reference(t, ctx),
        _ => Ok(Value::String(t.to_string())),
    }
}

/// Recognize `name(...)` where `name` is a plain identifier.
fn as_function_call(expr: &str) -> Option<(&str, &str)> {
    let open = expr.find('(')?;
    if !expr.ends_with(')') {
        return None;
    }
    let name = expr[..open].trim();
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some((name, &expr[open + 1..expr.len() - 1]))
}

/// Parse an inline map literal: `{ KEY: 'value', OTHER: ref }`.
///
/// Splits entries on commas at depth zero only; keys may be bare or quoted.
fn parse_map_literal(expr: &str, ctx: &EvalContext<'_>) -> ExprResult<Value> {
    let expr = expr.trim();
    if !expr.starts_with('{') || !expr.ends_with('}') {
        return Err(ExprError::InvalidMapLiteral(expr.to_string()));
    }

    let inner = &expr[1..expr.len() - 1];
    let mut map = Map::new();

    for entry in split_top_level(inner, ',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let sep = find_top_level(entry, ':')
            .ok_or_else(|| ExprError::InvalidMapLiteral(entry.to_string()))?;
        let key = entry[..sep].trim().trim_matches(|c| c == '\'' || c == '"');
        if key.is_empty() {
            return Err(ExprError::InvalidMapLiteral(entry.to_string()));
        }
        let value = evaluate_token(entry[sep + 1..].trim(), ctx)?;
        map.insert(key.to_string(), value);
    }

    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ResourceType;
    use serde_json::json;

    fn resource(outputs: Value, properties: Value) -> ResourceState {
        ResourceState {
            resource_type: ResourceType::Container,
            id: "cid-1".into(),
            properties,
            outputs,
            destroy_cmd: None,
            extra: Map::new(),
        }
    }

    fn context() -> (Map<String, Value>, IndexMap<String, ResourceState>) {
        let inputs = json!({
            "image": "nginx:1.25",
            "port": 8080,
            "flag": true,
            "nested": {"a": {"b": "deep"}},
            "list": ["one", "two"],
        });
        let Value::Object(inputs) = inputs else {
            unreachable!()
        };

        let mut resources = IndexMap::new();
        resources.insert(
            "api".to_string(),
            resource(
                json!({
                    "container_id": "cid-1",
                    "ports": [{"container": 3000, "host": 54321}],
                }),
                json!({"image": "api:latest", "network": "web"}),
            ),
        );
        (inputs, resources)
    }

    #[test]
    fn test_plain_string_passthrough() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let out = evaluate(&json!("no expressions here"), &ctx).unwrap();
        assert_eq!(out, json!("no expressions here"));
    }

    #[test]
    fn test_whole_string_preserves_type() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        assert_eq!(evaluate(&json!("${inputs.port}"), &ctx).unwrap(), json!(8080));
        assert_eq!(evaluate(&json!("${inputs.flag}"), &ctx).unwrap(), json!(true));
        assert_eq!(
            evaluate(&json!("${inputs.list}"), &ctx).unwrap(),
            json!(["one", "two"])
        );
    }

    #[test]
    fn test_interpolation_into_string() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let out = evaluate(&json!("http://host:${inputs.port}/path"), &ctx).unwrap();
        assert_eq!(out, json!("http://host:8080/path"));
    }

    #[test]
    fn test_recursion_into_containers() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let tree = json!({
            "image": "${inputs.image}",
            "ports": [{"container": "${inputs.port}", "host": 0}],
        });
        let out = evaluate(&tree, &ctx).unwrap();
        assert_eq!(
            out,
            json!({"image": "nginx:1.25", "ports": [{"container": 8080, "host": 0}]})
        );
    }

    #[test]
    fn test_missing_input_is_null() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        assert_eq!(
            evaluate(&json!("${inputs.missing.deep.path}"), &ctx).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_out_of_bounds_index_is_null() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        assert_eq!(evaluate(&json!("${inputs.list[9]}"), &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn test_navigation_into_scalar_is_error() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let err = evaluate(&json!("${inputs.image.field}"), &ctx).unwrap_err();
        assert!(matches!(err, ExprError::NotAContainer(_)));
    }

    #[test]
    fn test_resource_id_and_shorthand() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        assert_eq!(evaluate(&json!("${resources.api.id}"), &ctx).unwrap(), json!("cid-1"));
        // Shorthand: outputs first...
        assert_eq!(
            evaluate(&json!("${resources.api.container_id}"), &ctx).unwrap(),
            json!("cid-1")
        );
        // ...then properties.
        assert_eq!(
            evaluate(&json!("${resources.api.network}"), &ctx).unwrap(),
            json!("web")
        );
        assert_eq!(
            evaluate(&json!("${resources.api.outputs.ports[0].host}"), &ctx).unwrap(),
            json!(54321)
        );
    }

    #[test]
    fn test_shorthand_with_no_value_fails() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let err = evaluate(&json!("${resources.api.absent}"), &ctx).unwrap_err();
        assert!(matches!(err, ExprError::NoValue(_)));
    }

    #[test]
    fn test_unknown_resource_is_error() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let err = evaluate(&json!("${resources.ghost.id}"), &ctx).unwrap_err();
        assert!(matches!(err, ExprError::ResourceNotFound(_)));
    }

    #[test]
    fn test_unknown_head_is_error() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let err = evaluate(&json!("${locals.thing}"), &ctx).unwrap_err();
        assert!(matches!(err, ExprError::UnknownReference(_)));
    }

    #[test]
    fn test_inline_map_with_quoted_and_bare_values() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let out = evaluate(
            &json!("${ merge(inputs.nested.a, { K: 'v', N: 7, REF: inputs.image }) }"),
            &ctx,
        )
        .unwrap();
        assert_eq!(out, json!({"b": "deep", "K": "v", "N": 7, "REF": "nginx:1.25"}));
    }

    #[test]
    fn test_inline_map_commas_split_at_depth_zero_only() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let out = evaluate(&json!("${ { A: 'x,y', B: { C: 'z' } } }"), &ctx).unwrap();
        assert_eq!(out, json!({"A": "x,y", "B": {"C": "z"}}));
    }

    #[test]
    fn test_unterminated_expression() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let err = evaluate(&json!("${inputs.port"), &ctx).unwrap_err();
        assert!(matches!(err, ExprError::Unterminated(_)));
    }

    #[test]
    fn test_null_interpolates_to_empty_string() {
        let (inputs, resources) = context();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        let out = evaluate(&json!("x${inputs.missing}y"), &ctx).unwrap();
        assert_eq!(out, json!("xy"));
    }
}
