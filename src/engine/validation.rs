use std::{
    path::{Component, Path},
    sync::Arc,
};

use serde_json::{Map, Value};

use crate::engine::{
    error::{EngineError, EngineResult},
    limits::{LimitAxis, Limits, Phase},
    models::{FileEncoding, JobFile, Testcase},
    runtime::{Runtime, RuntimeRegistry},
};

/// Everything a job needs, checked and resolved against its runtime.
#[derive(Debug, Clone)]
pub struct JobParams {
    pub runtime: Arc<Runtime>,
    pub args: Vec<String>,
    pub files: Vec<JobFile>,
    pub limits: Limits,
    pub testcases: Vec<Testcase>,
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::Validation(message.into())
}

/// Validates an execute request body. Pure: touches no sandbox state.
pub fn validate_request(body: &Value, registry: &RuntimeRegistry) -> EngineResult<JobParams> {
    let body = body
        .as_object()
        .ok_or_else(|| invalid("request body must be a JSON object"))?;

    let language = required_string(body, "language")?;
    let version = required_string(body, "version")?;

    let raw_files = match body.get("files") {
        Some(Value::Array(files)) => files,
        _ => return Err(invalid("files is required as an array")),
    };
    if raw_files.is_empty() {
        return Err(invalid("files must contain at least one file"));
    }
    let files = raw_files
        .iter()
        .enumerate()
        .map(|(i, file)| parse_file(i, file))
        .collect::<EngineResult<Vec<_>>>()?;

    let testcases = match body.get("testcases") {
        Some(Value::Array(cases)) => cases
            .iter()
            .enumerate()
            .map(|(i, case)| {
                serde_json::from_value::<Testcase>(case.clone())
                    .map_err(|e| invalid(format!("testcases[{i}] is invalid: {e}")))
            })
            .collect::<EngineResult<Vec<_>>>()?,
        _ => return Err(invalid("testcases is required as an array")),
    };

    let args = match body.get("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(value) => serde_json::from_value::<Vec<String>>(value.clone())
            .map_err(|_| invalid("args must be an array of strings"))?,
    };

    let runtime = registry
        .lookup(language, version)
        .ok_or_else(|| EngineError::UnknownRuntime {
            language: language.to_string(),
            version: version.to_string(),
        })?;

    if !runtime.is_file_passthrough() && !files.iter().any(|f| f.encoding == FileEncoding::Utf8) {
        return Err(invalid("files must include at least one utf8 encoded file"));
    }

    let limits = resolve_limits(body, &runtime)?;

    Ok(JobParams {
        runtime,
        args,
        files,
        limits,
        testcases,
    })
}

fn required_string<'a>(body: &'a Map<String, Value>, field: &str) -> EngineResult<&'a str> {
    match body.get(field).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(invalid(format!("{field} is required as a string"))),
    }
}

fn parse_file(index: usize, file: &Value) -> EngineResult<JobFile> {
    let content = file
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(format!("files[{index}].content is required as a string")))?;

    let encoding = match file.get("encoding") {
        None | Some(Value::Null) => FileEncoding::Utf8,
        Some(Value::String(raw)) => FileEncoding::parse(raw).ok_or_else(|| {
            invalid(format!("files[{index}].encoding must be one of utf8, base64, hex"))
        })?,
        Some(_) => {
            return Err(invalid(format!(
                "files[{index}].encoding must be one of utf8, base64, hex"
            )));
        }
    };

    let name = match file.get("name") {
        None | Some(Value::Null) => format!("file{index}.code"),
        Some(Value::String(name)) if is_workspace_relative(name) => name.clone(),
        Some(_) => {
            return Err(invalid(format!(
                "files[{index}].name must be a relative path inside the workspace"
            )));
        }
    };

    let content = encoding
        .decode(content)
        .map_err(|e| invalid(format!("files[{index}].content is not valid {encoding:?}: {e}")))?;

    Ok(JobFile {
        name,
        content,
        encoding,
    })
}

fn is_workspace_relative(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && !name.contains('\0')
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

fn resolve_limits(body: &Map<String, Value>, runtime: &Runtime) -> EngineResult<Limits> {
    let mut limits = runtime.limits;

    for axis in LimitAxis::ALL {
        for phase in Phase::ALL {
            let field = axis.field_name(phase);
            let raw = match body.get(&field) {
                None | Some(Value::Null) => continue,
                Some(raw) => raw,
            };
            let value = raw
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| invalid(format!("If specified, {field} must be a number")))?;
            if value < 0.0 {
                return Err(invalid(format!("{field} must be non-negative")));
            }
            // Fractions round up so 0.5 cannot collapse into "unbounded".
            let value = value.ceil() as u64;
            let value = match runtime.ceiling(phase, axis) {
                Some(ceiling) if value > ceiling => {
                    return Err(invalid(format!(
                        "{field} cannot exceed the configured limit of {ceiling}"
                    )));
                }
                // 0 means unbounded, which a ceiling never allows.
                Some(ceiling) if value == 0 => ceiling,
                _ => value,
            };
            limits.phase_mut(phase).set(axis, value);
        }
    }

    Ok(limits)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registry() -> RuntimeRegistry {
        RuntimeRegistry::builtin()
    }

    fn base() -> Value {
        json!({
            "language": "python",
            "version": "3.10.0",
            "files": [{ "content": "print('hi')" }],
            "testcases": [{ "stdin": "" }],
        })
    }

    fn message(body: Value) -> String {
        match validate_request(&body, &registry()) {
            Err(EngineError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_minimal_request_with_runtime_defaults() {
        let params = validate_request(&base(), &registry()).unwrap();
        assert_eq!(params.runtime.language, "python");
        assert_eq!(params.files[0].name, "file0.code");
        assert_eq!(params.files[0].content, b"print('hi')");
        assert_eq!(params.testcases.len(), 1);
        assert_eq!(params.limits, params.runtime.limits);
        assert!(params.args.is_empty());
    }

    #[test]
    fn overrides_replace_defaults_within_ceiling() {
        let mut body = base();
        body["run_timeout"] = json!(1000);
        body["run_memory_limit"] = json!(16000);
        body["compile_cpu_time"] = json!(2500);
        let params = validate_request(&body, &registry()).unwrap();
        assert_eq!(params.limits.run.timeout, 1000);
        assert_eq!(params.limits.run.memory_limit, 16000);
        assert_eq!(params.limits.compile.cpu_time, 2500);
        assert_eq!(params.limits.run.cpu_time, 3000);
    }

    fn capped_registry() -> RuntimeRegistry {
        let mut runtimes = builtin_runtimes();
        for runtime in &mut runtimes {
            runtime.limits.run.memory_limit = 64_000;
            runtime.limits.compile.memory_limit = 128_000;
        }
        RuntimeRegistry::new(runtimes)
    }

    fn builtin_runtimes() -> Vec<Runtime> {
        registry().iter().map(|rt| Runtime::clone(rt)).collect()
    }

    #[test]
    fn zero_overrides_resolve_to_the_ceiling_on_every_axis() {
        let mut body = base();
        for axis in LimitAxis::ALL {
            for phase in Phase::ALL {
                body[axis.field_name(phase)] = json!(0);
            }
        }
        let registry = capped_registry();
        let params = validate_request(&body, &registry).unwrap();
        assert_eq!(params.limits.run.timeout, 3000);
        assert_eq!(params.limits.run.cpu_time, 3000);
        assert_eq!(params.limits.run.memory_limit, 64_000);
        assert_eq!(params.limits.compile.timeout, 10_000);
        assert_eq!(params.limits.compile.cpu_time, 10_000);
        assert_eq!(params.limits.compile.memory_limit, 128_000);
    }

    #[test]
    fn zero_override_stays_unbounded_without_a_ceiling() {
        let mut body = base();
        body["run_memory_limit"] = json!(0);
        let params = validate_request(&body, &registry()).unwrap();
        assert_eq!(params.limits.run.memory_limit, 0);
    }

    #[test]
    fn fractional_overrides_round_up() {
        let mut body = base();
        body["run_timeout"] = json!(0.5);
        body["run_cpu_time"] = json!(0.25);
        body["run_memory_limit"] = json!(1500.2);
        let params = validate_request(&body, &capped_registry()).unwrap();
        assert_eq!(params.limits.run.timeout, 1);
        assert_eq!(params.limits.run.cpu_time, 1);
        assert_eq!(params.limits.run.memory_limit, 1501);

        let mut body = base();
        body["run_timeout"] = json!(3000.5);
        assert_eq!(
            message(body),
            "run_timeout cannot exceed the configured limit of 3000"
        );
    }

    #[test]
    fn rejects_override_over_ceiling_naming_the_field() {
        let mut body = base();
        body["run_timeout"] = json!(3001);
        assert_eq!(
            message(body),
            "run_timeout cannot exceed the configured limit of 3000"
        );
    }

    #[test]
    fn rejects_negative_overrides_even_without_a_ceiling() {
        let mut body = base();
        body["run_memory_limit"] = json!(-1);
        assert_eq!(message(body), "run_memory_limit must be non-negative");
    }

    #[test]
    fn rejects_non_numeric_overrides() {
        let mut body = base();
        body["compile_timeout"] = json!("10");
        assert_eq!(message(body), "If specified, compile_timeout must be a number");
    }

    #[test]
    fn rejects_missing_required_fields() {
        let mut body = base();
        body["language"] = json!("");
        assert_eq!(message(body), "language is required as a string");

        let mut body = base();
        body.as_object_mut().unwrap().remove("version");
        assert_eq!(message(body), "version is required as a string");

        let mut body = base();
        body["files"] = json!("main.py");
        assert_eq!(message(body), "files is required as an array");

        let mut body = base();
        body["files"] = json!([]);
        assert_eq!(message(body), "files must contain at least one file");

        let mut body = base();
        body["files"] = json!([{ "content": 5 }]);
        assert_eq!(message(body), "files[0].content is required as a string");

        let mut body = base();
        body.as_object_mut().unwrap().remove("testcases");
        assert_eq!(message(body), "testcases is required as an array");
    }

    #[test]
    fn unknown_runtime_is_its_own_error() {
        let mut body = base();
        body["language"] = json!("cobol");
        assert!(matches!(
            validate_request(&body, &registry()),
            Err(EngineError::UnknownRuntime { .. })
        ));
    }

    #[test]
    fn requires_a_utf8_file_except_for_file_runtime() {
        let mut body = base();
        body["files"] = json!([{ "content": "aGk=", "encoding": "base64" }]);
        assert_eq!(message(body.clone()), "files must include at least one utf8 encoded file");

        body["language"] = json!("file");
        body["version"] = json!("*");
        let params = validate_request(&body, &registry()).unwrap();
        assert_eq!(params.files[0].content, b"hi");
    }

    #[test]
    fn rejects_names_escaping_the_workspace() {
        for name in ["../etc/passwd", "/etc/passwd", "", "a/../../b"] {
            let mut body = base();
            body["files"] = json!([{ "content": "x", "name": name }]);
            assert_eq!(
                message(body),
                "files[0].name must be a relative path inside the workspace"
            );
        }
        let mut body = base();
        body["files"] = json!([{ "content": "x", "name": "src/main.py" }]);
        assert!(validate_request(&body, &registry()).is_ok());
    }

    #[test]
    fn rejects_unknown_encodings_and_bad_payloads() {
        let mut body = base();
        body["files"] = json!([{ "content": "x", "encoding": "latin1" }]);
        assert_eq!(message(body), "files[0].encoding must be one of utf8, base64, hex");

        let mut body = base();
        body["files"] = json!([{ "content": "main" }, { "content": "zz", "encoding": "hex" }]);
        assert!(message(body).starts_with("files[1].content is not valid Hex"));
    }

    #[test]
    fn args_must_be_strings() {
        let mut body = base();
        body["args"] = json!([1, 2]);
        assert_eq!(message(body), "args must be an array of strings");

        let mut body = base();
        body["args"] = json!(["a", "b"]);
        assert_eq!(validate_request(&body, &registry()).unwrap().args, vec!["a", "b"]);
    }
}
