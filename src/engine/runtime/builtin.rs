use std::collections::BTreeMap;

use super::{PhaseValues, Runtime, RuntimeConfig};

const COMPILE_TIMEOUT_MS: i64 = 10_000;
const RUN_TIMEOUT_MS: i64 = 3_000;

struct BuiltinSpec {
    language: &'static str,
    version: &'static str,
    aliases: &'static [&'static str],
    compile: Option<&'static [&'static str]>,
    run: &'static [&'static str],
}

const BUILTINS: &[BuiltinSpec] = &[
    BuiltinSpec {
        language: "python",
        version: "3.10.0",
        aliases: &["py", "py3", "python3"],
        compile: None,
        run: &["python3", "-I", "{main}"],
    },
    BuiltinSpec {
        language: "javascript",
        version: "18.15.0",
        aliases: &["node", "js", "node-js"],
        compile: None,
        run: &["node", "{main}"],
    },
    BuiltinSpec {
        language: "bash",
        version: "5.2.0",
        aliases: &["sh"],
        compile: None,
        run: &["/bin/sh", "{main}"],
    },
    BuiltinSpec {
        language: "c",
        version: "10.2.0",
        aliases: &["gcc"],
        compile: Some(&["gcc", "-O2", "-o", "a.out", "{files}", "-lm"]),
        run: &["./a.out"],
    },
    BuiltinSpec {
        language: "rust",
        version: "1.68.2",
        aliases: &["rs"],
        compile: Some(&["rustc", "-O", "-o", "binary", "{main}"]),
        run: &["./binary"],
    },
    BuiltinSpec {
        language: super::FILE_LANGUAGE,
        version: "0.0.1",
        aliases: &["binary"],
        compile: None,
        run: &["./{main}"],
    },
];

fn owned(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

pub(super) fn runtimes() -> Vec<Runtime> {
    BUILTINS
        .iter()
        .filter_map(|spec| {
            let config = RuntimeConfig {
                language: spec.language.to_string(),
                version: spec.version.to_string(),
                aliases: owned(spec.aliases),
                compile: spec.compile.map(owned),
                run: owned(spec.run),
                env: BTreeMap::new(),
                timeouts: PhaseValues {
                    compile: COMPILE_TIMEOUT_MS,
                    run: RUN_TIMEOUT_MS,
                },
                cpu_times: PhaseValues {
                    compile: COMPILE_TIMEOUT_MS,
                    run: RUN_TIMEOUT_MS,
                },
                memory_limits: PhaseValues {
                    compile: -1,
                    run: -1,
                },
            };
            Runtime::try_from(config).ok()
        })
        .collect()
}
