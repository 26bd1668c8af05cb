//! Built-in expression functions

use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{EvalContext, ExprError, ExprResult};

const GENERATED_PASSWORD_LEN: usize = 16;

/// Dispatch a function call over already-evaluated arguments.
pub(crate) fn call_function(
    name: &str,
    args: &[Value],
    ctx: &EvalContext<'_>,
) -> ExprResult<Value> {
    match name {
        "random_password" | "random_string" => {
            Ok(Value::String(random_alphanumeric(GENERATED_PASSWORD_LEN)))
        }
        "coalesce" => coalesce(name, args),
        "merge" => merge(name, args),
        "jsonencode" => jsonencode(name, args),
        "dockerfile_cmd" => dockerfile_cmd(name, args),
        "framework_command" => framework_command(name, args),
        "lookup_port" => lookup_port(name, args, ctx),
        _ => Err(ExprError::UnknownFunction(name.to_string())),
    }
}

/// Uniform alphanumeric string from the thread-local CSPRNG.
fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// First argument that is non-null and, for strings and lists, non-empty.
fn coalesce(name: &str, args: &[Value]) -> ExprResult<Value> {
    if args.is_empty() {
        return Err(ExprError::Arity {
            name: name.to_string(),
            expected: "at least 1",
            got: 0,
        });
    }
    for arg in args {
        let usable = match arg {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            _ => true,
        };
        if usable {
            return Ok(arg.clone());
        }
    }
    Ok(Value::Null)
}

/// Map union with the second argument overriding the first. Non-map
/// arguments contribute nothing.
fn merge(name: &str, args: &[Value]) -> ExprResult<Value> {
    if args.len() != 2 {
        return Err(ExprError::Arity {
            name: name.to_string(),
            expected: "2",
            got: args.len(),
        });
    }
    let mut merged = Map::new();
    for arg in args {
        if let Value::Object(map) = arg {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(Value::Object(merged))
}

fn jsonencode(name: &str, args: &[Value]) -> ExprResult<Value> {
    if args.len() != 1 {
        return Err(ExprError::Arity {
            name: name.to_string(),
            expected: "1",
            got: args.len(),
        });
    }
    let encoded = match &args[0] {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    Ok(Value::String(encoded))
}

/// Last `CMD` of a Dockerfile as a command list. Null on any failure so
/// callers can wrap it in `coalesce`.
fn dockerfile_cmd(name: &str, args: &[Value]) -> ExprResult<Value> {
    if args.is_empty() || args.len() > 2 {
        return Err(ExprError::Arity {
            name: name.to_string(),
            expected: "1 or 2",
            got: args.len(),
        });
    }

    let Value::String(context) = &args[0] else {
        return Ok(Value::Null);
    };
    let context = PathBuf::from(context);

    let dockerfile = match args.get(1) {
        Some(Value::String(p)) if Path::new(p).is_absolute() => PathBuf::from(p),
        Some(Value::String(p)) => context.join(p),
        Some(_) => return Ok(Value::Null),
        None => context.join("Dockerfile"),
    };

    let contents = match std::fs::read_to_string(&dockerfile) {
        Ok(c) => c,
        Err(e) => {
            debug!("dockerfile_cmd: cannot read {}: {}", dockerfile.display(), e);
            return Ok(Value::Null);
        }
    };

    let mut last_cmd: Option<&str> = None;
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.len() >= 4 && trimmed[..4].eq_ignore_ascii_case("cmd ") {
            last_cmd = Some(trimmed[4..].trim());
        }
    }

    let Some(cmd) = last_cmd else {
        return Ok(Value::Null);
    };

    if cmd.starts_with('[') {
        // JSON-array (exec) form.
        match serde_json::from_str::<Value>(cmd) {
            Ok(parsed @ Value::Array(_)) => Ok(parsed),
            _ => Ok(Value::Null),
        }
    } else {
        // Shell form.
        Ok(json!(["/bin/sh", "-c", cmd]))
    }
}

/// Canned start command for a recognized framework tag.
fn framework_command(name: &str, args: &[Value]) -> ExprResult<Value> {
    if args.len() != 1 {
        return Err(ExprError::Arity {
            name: name.to_string(),
            expected: "1",
            got: args.len(),
        });
    }
    let tag = match &args[0] {
        Value::String(s) => s.as_str(),
        _ => "",
    };
    let command: Vec<&str> = match tag {
        "nextjs" | "nuxt" => vec!["npm", "run", "start"],
        "react" | "express" => vec!["npm", "start"],
        "vue" => vec!["npm", "run", "serve"],
        "node" => vec!["node", "index.js"],
        "fastapi" => vec!["uvicorn", "main:app", "--host", "0.0.0.0"],
        "flask" => vec!["flask", "run", "--host=0.0.0.0"],
        "django" => vec!["python", "manage.py", "runserver", "0.0.0.0:8000"],
        "go" => vec!["go", "run", "."],
        _ => vec!["npm", "start"],
    };
    Ok(json!(command))
}

/// Host port for a container-port mapping on `resources[target].outputs.ports`.
///
/// Supports the array form `[{container, host}]` and the legacy map form
/// `"80/tcp" -> host`. Falls back to the port argument unchanged.
fn lookup_port(name: &str, args: &[Value], ctx: &EvalContext<'_>) -> ExprResult<Value> {
    if args.len() != 2 {
        return Err(ExprError::Arity {
            name: name.to_string(),
            expected: "2",
            got: args.len(),
        });
    }

    let fallback = args[1].clone();

    let Value::String(target) = &args[0] else {
        return Ok(fallback);
    };
    let Some(state) = ctx.resources.get(target) else {
        return Ok(fallback);
    };
    let Some(ports) = state.outputs.get("ports") else {
        return Ok(fallback);
    };

    let port_str = match &args[1] {
        Value::String(s) => s.trim_end_matches("/tcp").to_string(),
        Value::Number(n) => n.to_string(),
        _ => return Ok(fallback),
    };
    let port_num = port_str.parse::<i64>().ok();

    match ports {
        Value::Array(entries) => {
            for entry in entries {
                let container = entry.get("container");
                let matches = match (container, port_num) {
                    (Some(Value::Number(n)), Some(want)) => n.as_i64() == Some(want),
                    (Some(Value::String(s)), _) => s.trim_end_matches("/tcp") == port_str,
                    _ => false,
                };
                if matches {
                    if let Some(host) = entry.get("host") {
                        return Ok(host.clone());
                    }
                }
            }
            Ok(fallback)
        }
        Value::Object(map) => {
            if let Some(host) = map.get(&port_str) {
                return Ok(host.clone());
            }
            if let Some(host) = map.get(&format!("{}/tcp", port_str)) {
                return Ok(host.clone());
            }
            Ok(fallback)
        }
        _ => Ok(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ResourceType;
    use crate::state::ResourceState;
    use indexmap::IndexMap;
    use std::io::Write;

    fn empty_ctx() -> (Map<String, Value>, IndexMap<String, ResourceState>) {
        (Map::new(), IndexMap::new())
    }

    #[test]
    fn test_random_string_shape() {
        let value = random_alphanumeric(16);
        assert_eq!(value.len(), 16);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
        // Two draws colliding would mean the RNG is broken.
        assert_ne!(value, random_alphanumeric(16));
    }

    #[test]
    fn test_coalesce_laws() {
        let a = json!("a");
        let b = json!("b");
        assert_eq!(coalesce("coalesce", &[a.clone(), b.clone()]).unwrap(), a);
        assert_eq!(coalesce("coalesce", &[Value::Null, b.clone()]).unwrap(), b);
        assert_eq!(coalesce("coalesce", &[json!(""), b.clone()]).unwrap(), b);
        assert_eq!(coalesce("coalesce", &[json!([]), b.clone()]).unwrap(), b);
        assert_eq!(
            coalesce("coalesce", &[Value::Null, Value::Null]).unwrap(),
            Value::Null
        );
        assert!(matches!(
            coalesce("coalesce", &[]),
            Err(ExprError::Arity { .. })
        ));
    }

    #[test]
    fn test_merge_override() {
        let m1 = json!({"a": 1, "b": 1});
        let m2 = json!({"b": 2, "c": 3});
        let merged = merge("merge", &[m1, m2]).unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 2, "c": 3}));

        // Non-map arguments contribute nothing.
        let merged = merge("merge", &[json!("x"), json!({"k": "v"})]).unwrap();
        assert_eq!(merged, json!({"k": "v"}));
    }

    #[test]
    fn test_jsonencode() {
        assert_eq!(jsonencode("jsonencode", &[json!("raw")]).unwrap(), json!("raw"));
        assert_eq!(
            jsonencode("jsonencode", &[json!({"a": 1})]).unwrap(),
            json!("{\"a\":1}")
        );
    }

    #[test]
    fn test_dockerfile_cmd_exec_and_shell_forms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Dockerfile");

        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "FROM node:20\nCMD [\"node\", \"server.js\"]").unwrap();
        let ctx_arg = json!(dir.path().to_string_lossy());
        assert_eq!(
            dockerfile_cmd("dockerfile_cmd", &[ctx_arg.clone()]).unwrap(),
            json!(["node", "server.js"])
        );

        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "FROM node:20\nCMD npm start").unwrap();
        assert_eq!(
            dockerfile_cmd("dockerfile_cmd", &[ctx_arg]).unwrap(),
            json!(["/bin/sh", "-c", "npm start"])
        );
    }

    #[test]
    fn test_dockerfile_cmd_missing_is_null() {
        assert_eq!(
            dockerfile_cmd("dockerfile_cmd", &[json!("/nonexistent/ctx")]).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_framework_command_default() {
        assert_eq!(
            framework_command("framework_command", &[json!("zig")]).unwrap(),
            json!(["npm", "start"])
        );
        assert_eq!(
            framework_command("framework_command", &[json!("django")]).unwrap(),
            json!(["python", "manage.py", "runserver", "0.0.0.0:8000"])
        );
    }

    #[test]
    fn test_lookup_port_array_and_legacy_forms() {
        let (inputs, mut resources) = empty_ctx();
        resources.insert(
            "api".into(),
            ResourceState {
                resource_type: ResourceType::Container,
                id: "c1".into(),
                properties: Value::Null,
                outputs: json!({"ports": [{"container": 3000, "host": 54321}]}),
                destroy_cmd: None,
                extra: Map::new(),
            },
        );
        resources.insert(
            "legacy".into(),
            ResourceState {
                resource_type: ResourceType::Container,
                id: "c2".into(),
                properties: Value::Null,
                outputs: json!({"ports": {"80/tcp": 8080}}),
                destroy_cmd: None,
                extra: Map::new(),
            },
        );
        let ctx = EvalContext { inputs: &inputs, resources: &resources };

        assert_eq!(
            lookup_port("lookup_port", &[json!("api"), json!(3000)], &ctx).unwrap(),
            json!(54321)
        );
        assert_eq!(
            lookup_port("lookup_port", &[json!("legacy"), json!("80")], &ctx).unwrap(),
            json!(8080)
        );
        // No match falls back to the port argument.
        assert_eq!(
            lookup_port("lookup_port", &[json!("api"), json!(9999)], &ctx).unwrap(),
            json!(9999)
        );
        assert_eq!(
            lookup_port("lookup_port", &[json!("ghost"), json!(80)], &ctx).unwrap(),
            json!(80)
        );
    }

    #[test]
    fn test_unknown_function() {
        let (inputs, resources) = empty_ctx();
        let ctx = EvalContext { inputs: &inputs, resources: &resources };
        assert!(matches!(
            call_function("b64encode", &[], &ctx),
            Err(ExprError::UnknownFunction(_))
        ));
    }
}
