use std::fmt;

use serde::{Deserialize, Serialize};

/// The two stages a job's program goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Compile,
    Run,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Compile, Phase::Run];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Compile => "compile",
            Phase::Run => "run",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource axes a phase is limited on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAxis {
    /// Wall clock, milliseconds.
    Timeout,
    /// Cumulative cpu time of the process tree, milliseconds.
    CpuTime,
    /// Memory of the process tree, kilobytes.
    MemoryLimit,
}

impl LimitAxis {
    pub const ALL: [LimitAxis; 3] = [LimitAxis::MemoryLimit, LimitAxis::Timeout, LimitAxis::CpuTime];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitAxis::Timeout => "timeout",
            LimitAxis::CpuTime => "cpu_time",
            LimitAxis::MemoryLimit => "memory_limit",
        }
    }

    /// Request field carrying the override for this axis, e.g. `run_cpu_time`.
    pub fn field_name(&self, phase: Phase) -> String {
        format!("{}_{}", phase.as_str(), self.as_str())
    }
}

impl fmt::Display for LimitAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limits for one phase. A value of 0 leaves the axis unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseLimits {
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub cpu_time: u64,
    #[serde(default)]
    pub memory_limit: u64,
}

impl PhaseLimits {
    pub fn get(&self, axis: LimitAxis) -> u64 {
        match axis {
            LimitAxis::Timeout => self.timeout,
            LimitAxis::CpuTime => self.cpu_time,
            LimitAxis::MemoryLimit => self.memory_limit,
        }
    }

    pub fn set(&mut self, axis: LimitAxis, value: u64) {
        match axis {
            LimitAxis::Timeout => self.timeout = value,
            LimitAxis::CpuTime => self.cpu_time = value,
            LimitAxis::MemoryLimit => self.memory_limit = value,
        }
    }

    pub fn bounded(value: u64) -> Option<u64> {
        (value > 0).then_some(value)
    }
}

/// `{compile, run} × {timeout, cpu_time, memory_limit}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub compile: PhaseLimits,
    #[serde(default)]
    pub run: PhaseLimits,
}

impl Limits {
    pub fn phase(&self, phase: Phase) -> &PhaseLimits {
        match phase {
            Phase::Compile => &self.compile,
            Phase::Run => &self.run,
        }
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseLimits {
        match phase {
            Phase::Compile => &mut self.compile,
            Phase::Run => &mut self.run,
        }
    }
}
