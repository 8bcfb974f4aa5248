use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::limits::LimitAxis;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEncoding {
    #[default]
    Utf8,
    Base64,
    Hex,
}

impl FileEncoding {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "utf8" => Some(Self::Utf8),
            "base64" => Some(Self::Base64),
            "hex" => Some(Self::Hex),
            _ => None,
        }
    }

    pub fn decode(&self, content: &str) -> Result<Vec<u8>, String> {
        match self {
            FileEncoding::Utf8 => Ok(content.as_bytes().to_vec()),
            FileEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(content)
                .map_err(|e| e.to_string()),
            FileEncoding::Hex => hex::decode(content).map_err(|e| e.to_string()),
        }
    }
}

/// A submitted file, already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFile {
    pub name: String,
    pub content: Vec<u8>,
    pub encoding: FileEncoding,
}

/// One stdin/expectation pair. `input` and `expectedOutput` are accepted as
/// alternate spellings; when both spellings are sent, `stdin` and
/// `expected_output` win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TestcaseWire")]
pub struct Testcase {
    pub id: Option<String>,
    pub stdin: String,
    pub args: Option<Vec<String>>,
    pub expected_output: Option<String>,
}

#[derive(Deserialize)]
struct TestcaseWire {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    stdin: Option<String>,
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    expected_output: Option<String>,
    #[serde(default, rename = "expectedOutput")]
    expected_output_camel: Option<String>,
}

impl From<TestcaseWire> for Testcase {
    fn from(wire: TestcaseWire) -> Self {
        Self {
            id: wire.id,
            stdin: wire.stdin.or(wire.input).unwrap_or_default(),
            args: wire.args,
            expected_output: wire.expected_output.or(wire.expected_output_camel),
        }
    }
}

impl Testcase {
    pub fn with_stdin(stdin: impl Into<String>) -> Self {
        Self {
            stdin: stdin.into(),
            ..Self::default()
        }
    }

    /// Compares trimmed stdout with the trimmed expectation, if one was given.
    pub fn check(&self, stdout: &str) -> Option<bool> {
        self.expected_output
            .as_ref()
            .map(|expected| stdout.trim() == expected.trim())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Ok,
    TimedOut,
    MemoryExceeded,
    RuntimeError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Interleaved stdout and stderr, bounded like the individual streams.
    pub output: String,
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub status: ExecutionStatus,
    /// Milliseconds.
    pub cpu_time: u64,
    /// Milliseconds.
    pub wall_time: u64,
    /// Peak memory in kilobytes.
    pub memory: u64,
    /// Which limit ended the run. Diagnostic only, never sent to callers.
    #[serde(skip)]
    pub limit: Option<LimitAxis>,
}

impl ExecutionResult {
    pub fn is_ok(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }
}

/// One testcase outcome as returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub result: ExecutionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
}

impl RunResult {
    pub fn new(testcase: &Testcase, result: ExecutionResult) -> Self {
        Self {
            id: testcase.id.clone(),
            passed: testcase.check(&result.stdout),
            expected_output: testcase.expected_output.clone(),
            result,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<ExecutionResult>,
    pub run: Vec<RunResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub language: String,
    pub version: String,
    #[serde(flatten)]
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeSummary {
    pub language: String,
    pub version: String,
    pub aliases: Vec<String>,
    pub compiled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveJobSummary {
    pub id: Uuid,
    pub language: String,
    pub version: String,
    pub stage: String,
    pub box_id: Option<usize>,
    pub started_at: DateTime<Utc>,
}
