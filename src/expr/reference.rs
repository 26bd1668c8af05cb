//! Dotted-path reference resolution
//!
//! Missing keys and out-of-bounds indices resolve to null so optional
//! inputs read naturally; navigating into a scalar is an error.

use serde_json::Value;

use super::{EvalContext, ExprError, ExprResult};

/// One dotted segment with optional trailing `[N]` indices.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    name: String,
    indices: Vec<usize>,
}

/// Resolve a reference path (`inputs.*` or `resources.*`).
pub(crate) fn resolve_reference(path: &str, ctx: &EvalContext<'_>) -> ExprResult<Value> {
    let segments = parse_path(path)?;
    let head = segments.first().ok_or(ExprError::EmptyReference)?;
    if !head.indices.is_empty() {
        return Err(ExprError::InvalidIndex(path.to_string()));
    }

    match head.name.as_str() {
        "inputs" => {
            let root = Value::Object(ctx.inputs.clone());
            navigate(&root, &segments[1..], path)
        }
        "resources" => resolve_resource(path, &segments[1..], ctx),
        _ => Err(ExprError::UnknownReference(path.to_string())),
    }
}

fn resolve_resource(path: &str, segments: &[Segment], ctx: &EvalContext<'_>) -> ExprResult<Value> {
    let name_seg = segments.first().ok_or_else(|| {
        ExprError::UnknownReference(path.to_string())
    })?;
    if !name_seg.indices.is_empty() {
        return Err(ExprError::InvalidIndex(path.to_string()));
    }

    let state = ctx
        .resources
        .get(&name_seg.name)
        .ok_or_else(|| ExprError::ResourceNotFound(name_seg.name.clone()))?;

    let rest = &segments[1..];
    let field = rest
        .first()
        .ok_or_else(|| ExprError::UnknownReference(path.to_string()))?;

    match field.name.as_str() {
        "id" if rest.len() == 1 && field.indices.is_empty() => {
            Ok(Value::String(state.id.clone()))
        }
        "outputs" => {
            let start = apply_indices(&state.outputs, &field.indices, path)?;
            navigate(&start, &rest[1..], path)
        }
        "properties" => {
            let start = apply_indices(&state.properties, &field.indices, path)?;
            navigate(&start, &rest[1..], path)
        }
        _ => {
            // Shorthand: outputs first, then properties. Fails only when
            // neither yields a non-null value.
            if let Ok(found) = navigate(&state.outputs, rest, path) {
                if !found.is_null() {
                    return Ok(found);
                }
            }
            let found = navigate(&state.properties, rest, path)?;
            if found.is_null() {
                return Err(ExprError::NoValue(path.to_string()));
            }
            Ok(found)
        }
    }
}

fn navigate(root: &Value, segments: &[Segment], path: &str) -> ExprResult<Value> {
    let mut current = root.clone();
    for segment in segments {
        current = match current {
            Value::Null => return Ok(Value::Null),
            Value::Object(map) => map.get(&segment.name).cloned().unwrap_or(Value::Null),
            _ => return Err(ExprError::NotAContainer(path.to_string())),
        };
        current = apply_indices(&current, &segment.indices, path)?;
    }
    Ok(current)
}

fn apply_indices(value: &Value, indices: &[usize], path: &str) -> ExprResult<Value> {
    let mut current = value.clone();
    for &idx in indices {
        current = match current {
            Value::Null => Value::Null,
            Value::Array(items) => items.get(idx).cloned().unwrap_or(Value::Null),
            _ => return Err(ExprError::NotAContainer(path.to_string())),
        };
    }
    Ok(current)
}

fn parse_path(path: &str) -> ExprResult<Vec<Segment>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let part = part.trim();
        if part.is_empty() {
            return Err(ExprError::EmptyReference);
        }

        let (name, mut rest) = match part.find('[') {
            Some(open) => (&part[..open], &part[open..]),
            None => (part, ""),
        };

        let mut indices = Vec::new();
        while !rest.is_empty() {
            let close = rest
                .find(']')
                .ok_or_else(|| ExprError::InvalidIndex(path.to_string()))?;
            if !rest.starts_with('[') {
                return Err(ExprError::InvalidIndex(path.to_string()));
            }
            let idx: usize = rest[1..close]
                .trim()
                .parse()
                .map_err(|_| ExprError::InvalidIndex(path.to_string()))?;
            indices.push(idx);
            rest = &rest[close + 1..];
        }

        segments.push(Segment {
            name: name.to_string(),
            indices,
        });
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_path_with_indices() {
        let segments = parse_path("resources.api.ports[0][1].host").unwrap();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[2].name, "ports");
        assert_eq!(segments[2].indices, vec![0, 1]);
        assert!(segments[3].indices.is_empty());
    }

    #[test]
    fn test_parse_path_bad_index() {
        assert!(matches!(
            parse_path("inputs.list[x]"),
            Err(ExprError::InvalidIndex(_))
        ));
    }
}
