//! Cgroup v2 accounting for a single run.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};

use super::monitor::Usage;

/// A delegated cgroup v2 directory runs are created under.
#[derive(Debug, Clone)]
pub struct CgroupRoot {
    path: PathBuf,
}

impl CgroupRoot {
    /// Accepts the directory only if it looks like a writable cgroup v2 node.
    pub fn detect(path: &Path) -> Option<Self> {
        if !path.join("cgroup.controllers").is_file() {
            return None;
        }
        let probe = path.join(format!(".jobbox-probe-{}", std::process::id()));
        fs::create_dir(&probe).ok()?;
        let _ = fs::remove_dir(&probe);
        // Children only get memory/pids files if the controllers are delegated.
        let _ = fs::write(path.join("cgroup.subtree_control"), "+memory +pids +cpu");
        Some(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn create_run(&self, name: &str) -> anyhow::Result<RunCgroup> {
        let path = self.path.join(name);
        if path.exists() {
            let stale = RunCgroup { path: path.clone() };
            stale.kill();
            let _ = fs::remove_dir(&path);
        }
        fs::create_dir(&path)
            .with_context(|| format!("failed to create cgroup {}", path.display()))?;
        Ok(RunCgroup { path })
    }
}

#[derive(Debug)]
pub struct RunCgroup {
    path: PathBuf,
}

impl RunCgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_memory_limit(&self, limit_kb: u64) -> anyhow::Result<()> {
        let bytes = limit_kb.saturating_mul(1024);
        fs::write(self.path.join("memory.max"), bytes.to_string())
            .context("failed to write memory.max")?;
        // Swap and group OOM are optional depending on kernel config.
        let _ = fs::write(self.path.join("memory.swap.max"), "0");
        let _ = fs::write(self.path.join("memory.oom.group"), "1");
        Ok(())
    }

    pub fn set_pids_max(&self, max: u64) -> anyhow::Result<()> {
        fs::write(self.path.join("pids.max"), max.to_string()).context("failed to write pids.max")
    }

    /// Opened before spawning so the child can join without allocating.
    pub fn open_procs(&self) -> anyhow::Result<fs::File> {
        fs::OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
            .context("failed to open cgroup.procs")
    }

    pub fn usage(&self) -> Usage {
        let cpu_ms = read_keyed(&self.path.join("cpu.stat"), "usage_usec")
            .map(|usec| usec / 1000)
            .unwrap_or(0);
        let memory_bytes = read_single(&self.path.join("memory.peak"))
            .or_else(|| read_single(&self.path.join("memory.current")))
            .unwrap_or(0);
        Usage {
            cpu_ms,
            memory_kb: memory_bytes / 1024,
        }
    }

    pub fn oom_killed(&self) -> bool {
        read_keyed(&self.path.join("memory.events"), "oom_kill").unwrap_or(0) > 0
    }

    pub fn kill(&self) {
        if fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return;
        }
        if let Ok(procs) = fs::read_to_string(self.path.join("cgroup.procs")) {
            for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }

    /// Removes the cgroup once its processes are gone.
    pub async fn remove(self) -> anyhow::Result<()> {
        let mut last_err = None;
        for _ in 0..20 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    self.kill();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        match last_err {
            Some(err) => Err(err)
                .with_context(|| format!("failed to remove cgroup {}", self.path.display())),
            None => Ok(()),
        }
    }
}

fn read_single(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_keyed(path: &Path, key: &str) -> Option<u64> {
    parse_keyed(&fs::read_to_string(path).ok()?, key)
}

fn parse_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}
