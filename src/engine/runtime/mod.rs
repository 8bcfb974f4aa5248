mod builtin;

use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::Context;
use semver::{Version, VersionReq};
use serde::Deserialize;

use crate::engine::limits::{LimitAxis, Limits, Phase, PhaseLimits};

/// Language that takes the submitted file itself as the executable.
pub const FILE_LANGUAGE: &str = "file";

const MAIN_PLACEHOLDER: &str = "{main}";
const FILES_PLACEHOLDER: &str = "{files}";

/// Immutable description of one installed language version.
///
/// `limits` holds both the defaults a job gets when it does not override an
/// axis and the ceiling an override may not exceed; 0 means unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runtime {
    pub language: String,
    pub version: Version,
    pub aliases: Vec<String>,
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub limits: Limits,
}

impl Runtime {
    pub fn compiled(&self) -> bool {
        self.compile_command.is_some()
    }

    pub fn is_file_passthrough(&self) -> bool {
        self.language == FILE_LANGUAGE
    }

    pub fn default_limit(&self, phase: Phase, axis: LimitAxis) -> u64 {
        self.limits.phase(phase).get(axis)
    }

    pub fn ceiling(&self, phase: Phase, axis: LimitAxis) -> Option<u64> {
        PhaseLimits::bounded(self.default_limit(phase, axis))
    }

    pub fn matches_language(&self, language: &str) -> bool {
        self.language == language || self.aliases.iter().any(|alias| alias == language)
    }

    pub fn compile_invocation(&self, files: &[String]) -> Option<Vec<String>> {
        self.compile_command
            .as_ref()
            .map(|template| expand_template(template, files))
    }

    pub fn run_invocation(&self, files: &[String], args: &[String]) -> Vec<String> {
        let mut command = expand_template(&self.run_command, files);
        command.extend(args.iter().cloned());
        command
    }
}

fn expand_template(template: &[String], files: &[String]) -> Vec<String> {
    let main = files.first().map(String::as_str).unwrap_or_default();
    let mut out = Vec::with_capacity(template.len() + files.len());
    for token in template {
        if token == FILES_PLACEHOLDER {
            out.extend(files.iter().cloned());
        } else {
            out.push(token.replace(MAIN_PLACEHOLDER, main));
        }
    }
    out
}

/// On-disk shape of a runtime entry in `RUNTIMES_PATH`.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub language: String,
    pub version: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: PhaseValues,
    #[serde(default)]
    pub cpu_times: PhaseValues,
    #[serde(default)]
    pub memory_limits: PhaseValues,
}

/// Negative values are accepted and mean unbounded.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PhaseValues {
    #[serde(default)]
    pub compile: i64,
    #[serde(default)]
    pub run: i64,
}

impl PhaseValues {
    fn get(&self, phase: Phase) -> u64 {
        let raw = match phase {
            Phase::Compile => self.compile,
            Phase::Run => self.run,
        };
        raw.max(0) as u64
    }
}

impl TryFrom<RuntimeConfig> for Runtime {
    type Error = anyhow::Error;

    fn try_from(value: RuntimeConfig) -> anyhow::Result<Self> {
        let version = Version::parse(&value.version)
            .with_context(|| format!("invalid version for {}: {}", value.language, value.version))?;
        if value.run.is_empty() {
            anyhow::bail!("runtime {}-{} has an empty run command", value.language, version);
        }

        let mut limits = Limits::default();
        for phase in Phase::ALL {
            let target = limits.phase_mut(phase);
            target.set(LimitAxis::Timeout, value.timeouts.get(phase));
            target.set(LimitAxis::CpuTime, value.cpu_times.get(phase));
            target.set(LimitAxis::MemoryLimit, value.memory_limits.get(phase));
        }

        Ok(Self {
            language: value.language,
            version,
            aliases: value.aliases,
            compile_command: value.compile.filter(|c| !c.is_empty()),
            run_command: value.run,
            env: value.env,
            limits,
        })
    }
}

/// Read-only set of installed runtimes, loaded once at start.
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    runtimes: Vec<Arc<Runtime>>,
}

impl RuntimeRegistry {
    pub fn new(runtimes: Vec<Runtime>) -> Self {
        Self {
            runtimes: runtimes.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(builtin::runtimes())
    }

    pub fn from_configs(configs: Vec<RuntimeConfig>) -> anyhow::Result<Self> {
        let runtimes = configs
            .into_iter()
            .map(Runtime::try_from)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::new(runtimes))
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtimes from {}", path.display()))?;
        let configs: Vec<RuntimeConfig> =
            serde_json::from_str(&raw).context("runtimes file is not a valid runtime list")?;
        Self::from_configs(configs)
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Runtime>> {
        self.runtimes.iter()
    }

    /// Latest runtime whose language or alias matches and whose version
    /// satisfies the (possibly partial) specifier.
    pub fn lookup(&self, language: &str, version: &str) -> Option<Arc<Runtime>> {
        let req = version_req(version)?;
        self.runtimes
            .iter()
            .filter(|rt| rt.matches_language(language) && req.matches(&rt.version))
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned()
    }
}

/// `3.10` selects any `3.10.x`, `*` anything; explicit operators pass through.
fn version_req(spec: &str) -> Option<VersionReq> {
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }
    if spec == "*" || spec.eq_ignore_ascii_case("x") || spec == "latest" {
        return Some(VersionReq::STAR);
    }
    let starts_numeric = spec.chars().next().is_some_and(|c| c.is_ascii_digit());
    let normalized = if starts_numeric {
        format!("={spec}")
    } else {
        spec.to_string()
    };
    VersionReq::parse(&normalized).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(language: &str, version: &str) -> Runtime {
        Runtime::try_from(RuntimeConfig {
            language: language.into(),
            version: version.into(),
            aliases: vec![format!("{language}-alias")],
            compile: None,
            run: vec!["run".into(), "{main}".into()],
            env: BTreeMap::new(),
            timeouts: PhaseValues { compile: 10_000, run: 3_000 },
            cpu_times: PhaseValues { compile: 10_000, run: 3_000 },
            memory_limits: PhaseValues { compile: -1, run: -1 },
        })
        .unwrap()
    }

    fn registry() -> RuntimeRegistry {
        RuntimeRegistry::new(vec![
            runtime("python", "3.9.4"),
            runtime("python", "3.10.0"),
            runtime("python", "3.10.7"),
            runtime("python", "2.7.18"),
        ])
    }

    #[test]
    fn exact_version_resolves() {
        let rt = registry().lookup("python", "3.10.0").unwrap();
        assert_eq!(rt.version, Version::new(3, 10, 0));
    }

    #[test]
    fn partial_version_picks_latest_match() {
        let reg = registry();
        assert_eq!(reg.lookup("python", "3.10").unwrap().version, Version::new(3, 10, 7));
        assert_eq!(reg.lookup("python", "3").unwrap().version, Version::new(3, 10, 7));
        assert_eq!(reg.lookup("python", "*").unwrap().version, Version::new(3, 10, 7));
        assert_eq!(reg.lookup("python", "2").unwrap().version, Version::new(2, 7, 18));
    }

    #[test]
    fn aliases_and_misses() {
        let reg = registry();
        assert!(reg.lookup("python-alias", "3.9").is_some());
        assert!(reg.lookup("python", "4").is_none());
        assert!(reg.lookup("ruby", "*").is_none());
        assert!(reg.lookup("python", "").is_none());
        assert!(reg.lookup("python", "not a version").is_none());
    }

    #[test]
    fn negative_config_limits_are_unbounded() {
        let rt = runtime("python", "3.10.0");
        assert_eq!(rt.ceiling(Phase::Run, LimitAxis::MemoryLimit), None);
        assert_eq!(rt.ceiling(Phase::Run, LimitAxis::Timeout), Some(3_000));
        assert_eq!(rt.default_limit(Phase::Compile, LimitAxis::CpuTime), 10_000);
    }

    #[test]
    fn templates_expand_main_and_files() {
        let mut rt = runtime("c", "10.2.0");
        rt.compile_command = Some(vec![
            "gcc".into(),
            "-o".into(),
            "a.out".into(),
            "{files}".into(),
        ]);
        let files = vec!["main.c".to_string(), "util.c".to_string()];
        assert_eq!(
            rt.compile_invocation(&files).unwrap(),
            vec!["gcc", "-o", "a.out", "main.c", "util.c"]
        );
        assert_eq!(
            rt.run_invocation(&files, &["x".to_string()]),
            vec!["run", "main.c", "x"]
        );
    }

    #[test]
    fn rejects_bad_configs() {
        let mut config = RuntimeConfig {
            language: "python".into(),
            version: "three".into(),
            aliases: vec![],
            compile: None,
            run: vec!["python3".into()],
            env: BTreeMap::new(),
            timeouts: PhaseValues::default(),
            cpu_times: PhaseValues::default(),
            memory_limits: PhaseValues::default(),
        };
        assert!(Runtime::try_from(config.clone()).is_err());
        config.version = "3.10.0".into();
        config.run.clear();
        assert!(Runtime::try_from(config).is_err());
    }

    #[test]
    fn builtin_registry_has_python_and_file() {
        let reg = RuntimeRegistry::builtin();
        assert!(reg.lookup("python", "3.10.0").is_some());
        assert!(reg.lookup(FILE_LANGUAGE, "*").unwrap().is_file_passthrough());
        assert!(reg.lookup("c", "*").unwrap().compiled());
    }
}
