use std::{
    fs::File,
    io::{self, Write},
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::{
        prctl,
        resource::{Resource, setrlimit},
        signal::{Signal, kill, killpg},
    },
    unistd::{Gid, Pid, Uid, setgroups, setpgid, setresgid, setresuid},
};
use tokio::{io::AsyncWriteExt, process::Command, sync::mpsc, time::MissedTickBehavior};

use crate::engine::{
    config::BoxLimits,
    limits::{LimitAxis, PhaseLimits},
    models::{ExecutionResult, ExecutionStatus},
    sandbox::{
        Executor, RunSpec, SandboxBox,
        cgroup::{CgroupRoot, RunCgroup},
        monitor::{self, Tree, Usage},
        output::{self, OutputSink, Stream},
    },
};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);
const DRAIN_GRACE: Duration = Duration::from_millis(250);
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const OWNER_KILL_ROUNDS: usize = 64;
/// Headroom above twice the memory limit for the RLIMIT_DATA backstop.
const DATA_SLACK_BYTES: u64 = 64 * 1024 * 1024;
/// Lowercased stderr fragments runtimes print when an allocation fails.
const ALLOCATION_FAILURES: &[&str] = &[
    "memoryerror",
    "cannot allocate",
    "out of memory",
    "bad_alloc",
    "memory allocation of",
    "out of space",
];

/// Runs process trees directly on the host, isolated by a per-box uid,
/// process group, rlimits and (when available) a cgroup v2 node per box.
pub struct ProcessExecutor {
    box_limits: BoxLimits,
    cgroup: Option<CgroupRoot>,
}

impl ProcessExecutor {
    pub fn new(box_limits: BoxLimits, cgroup: Option<CgroupRoot>) -> Self {
        Self { box_limits, cgroup }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(
        &self,
        sandbox: &mut SandboxBox,
        spec: RunSpec,
    ) -> anyhow::Result<ExecutionResult> {
        let Some((program, args)) = spec.command.split_first() else {
            anyhow::bail!("empty {} command", spec.phase);
        };
        let program = resolve_program(sandbox, program);
        let run_no = sandbox.begin_run(spec.limits);

        let run_cgroup = match &self.cgroup {
            Some(root) => Some(self.prepare_cgroup(root, sandbox.id(), &spec.limits)?),
            None => None,
        };
        let procs = run_cgroup.as_ref().map(RunCgroup::open_procs).transpose()?;

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .current_dir(sandbox.workspace())
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", sandbox.workspace())
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let owner = sandbox.owner();
        let rlimits = RlimitPlan::new(
            &self.box_limits,
            &spec.limits,
            run_cgroup.is_some(),
            owner.is_some(),
        );
        // SAFETY: the hook only issues raw syscalls and does not allocate.
        unsafe {
            cmd.pre_exec(move || {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                if let Some(procs) = &procs {
                    let mut procs: &File = procs;
                    procs.write_all(b"0")?;
                }
                rlimits.apply()?;
                // Groups before gid before uid, or the saved ids keep root.
                if let Some(owner) = owner {
                    let gid = Gid::from_raw(owner.gid);
                    let uid = Uid::from_raw(owner.uid);
                    setgroups(&[])?;
                    setresgid(gid, gid, gid)?;
                    setresuid(uid, uid, uid)?;
                }
                prctl::set_no_new_privs()?;
                Ok(())
            });
        }

        tracing::debug!(
            box_id = sandbox.id(),
            run = run_no,
            phase = %spec.phase,
            program = %program.display(),
            "spawning sandboxed process"
        );

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) if program.starts_with(sandbox.workspace()) && is_exec_refusal(&err) => {
                if let Some(cgroup) = run_cgroup {
                    discard_cgroup(cgroup).await;
                }
                tracing::debug!(box_id = sandbox.id(), error = %err, "artifact refused to execute");
                return Ok(exec_refused(&program, &err));
            }
            Err(err) => {
                if let Some(cgroup) = run_cgroup {
                    discard_cgroup(cgroup).await;
                }
                return Err(err)
                    .with_context(|| format!("failed to spawn {}", program.display()));
            }
        };

        let mut guard = TreeGuard {
            pgid: child.id().map(|pid| pid as i32),
            owner: owner.map(|owner| owner.uid),
            cgroup: run_cgroup,
        };

        if let Some(mut stdin) = child.stdin.take() {
            let stdin_bytes = spec.stdin.into_bytes();
            tokio::spawn(async move {
                let _ = stdin.write_all(&stdin_bytes).await;
            });
        }

        let stdout = child.stdout.take().context("missing stdout pipe")?;
        let stderr = child.stderr.take().context("missing stderr pipe")?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(output::pump(stdout, Stream::Stdout, tx.clone()));
        tokio::spawn(output::pump(stderr, Stream::Stderr, tx));

        let wall_limit = PhaseLimits::bounded(spec.limits.timeout)
            .unwrap_or(self.box_limits.max_wall_timeout_ms);
        let mut sink = OutputSink::new(self.box_limits.output_max_bytes);
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut peak = Usage::default();
        let mut tripped: Option<LimitAxis> = None;
        let mut streams_open = true;

        let status: ExitStatus = loop {
            tokio::select! {
                chunk = rx.recv(), if streams_open => match chunk {
                    Some((stream, data)) => sink.push(stream, &data),
                    None => streams_open = false,
                },
                status = child.wait() => {
                    break status.context("failed to wait for sandboxed process")?;
                }
                _ = ticker.tick() => {
                    peak = peak.max(guard.usage());
                    let elapsed = started.elapsed().as_millis() as u64;
                    if tripped.is_none()
                        && let Some(axis) = check_limits(&spec.limits, wall_limit, peak, elapsed)
                    {
                        tracing::info!(
                            box_id = sandbox.id(),
                            phase = %spec.phase,
                            limit = %axis,
                            cpu_ms = peak.cpu_ms,
                            memory_kb = peak.memory_kb,
                            wall_ms = elapsed,
                            "limit exceeded, killing process tree"
                        );
                        tripped = Some(axis);
                        guard.kill();
                    }
                }
            }
        };
        let wall_time = started.elapsed().as_millis() as u64;
        peak = peak.max(guard.usage());
        // A tree can overrun and exit between two samples.
        if tripped.is_none() {
            tripped = check_limits(&spec.limits, wall_limit, peak, wall_time);
        }
        let oom = guard.oom_killed();

        // The leader is gone; nothing else in the tree may outlive the run.
        guard.kill();
        if streams_open {
            let _ = tokio::time::timeout(DRAIN_GRACE, async {
                while let Some((stream, data)) = rx.recv().await {
                    sink.push(stream, &data);
                }
            })
            .await;
        }
        if let Some(cgroup) = guard.disarm() {
            discard_cgroup(cgroup).await;
        }

        let signal = status.signal().and_then(|sig| Signal::try_from(sig).ok());
        // Under the RLIMIT_DATA backstop an overrun shows up as a failed
        // allocation inside the program rather than as a sampled peak.
        let refused_allocation = rlimits.data_bytes.is_some()
            && status.code() != Some(0)
            && allocation_failed(sink.stderr_tail());
        let (status_kind, limit) = classify(signal, tripped, oom || refused_allocation);
        if sink.truncated() {
            tracing::debug!(box_id = sandbox.id(), phase = %spec.phase, "output truncated");
        }
        let captured = sink.finish();

        tracing::debug!(
            box_id = sandbox.id(),
            run = run_no,
            phase = %spec.phase,
            status = ?status_kind,
            code = ?status.code(),
            cpu_ms = peak.cpu_ms,
            memory_kb = peak.memory_kb,
            wall_ms = wall_time,
            "sandboxed process finished"
        );

        Ok(ExecutionResult {
            stdout: captured.stdout,
            stderr: captured.stderr,
            output: captured.combined,
            code: status.code(),
            signal: signal.map(|sig| sig.as_str().to_string()),
            status: status_kind,
            cpu_time: peak.cpu_ms,
            wall_time,
            memory: peak.memory_kb,
            limit,
        })
    }
}

impl ProcessExecutor {
    fn prepare_cgroup(
        &self,
        root: &CgroupRoot,
        box_id: usize,
        limits: &PhaseLimits,
    ) -> anyhow::Result<RunCgroup> {
        let cgroup = root.create_run(&format!("box-{box_id}"))?;
        if let Some(memory_kb) = PhaseLimits::bounded(limits.memory_limit) {
            cgroup.set_memory_limit(memory_kb)?;
        }
        if self.box_limits.max_process_count > 0 {
            cgroup.set_pids_max(self.box_limits.max_process_count)?;
        }
        Ok(cgroup)
    }
}

/// `./name` is relative to the workspace, not to the engine's cwd.
fn resolve_program(sandbox: &SandboxBox, program: &str) -> PathBuf {
    match program.strip_prefix("./") {
        Some(rest) => sandbox.workspace().join(rest),
        None => PathBuf::from(program),
    }
}

fn is_exec_refusal(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENOEXEC | Errno::EACCES | Errno::ENOENT)
    )
}

fn exec_refused(program: &std::path::Path, err: &io::Error) -> ExecutionResult {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let message = format!("cannot execute {name}: {err}\n");
    ExecutionResult {
        stdout: String::new(),
        stderr: message.clone(),
        output: message,
        code: None,
        signal: None,
        status: ExecutionStatus::RuntimeError,
        cpu_time: 0,
        wall_time: 0,
        memory: 0,
        limit: None,
    }
}

async fn discard_cgroup(cgroup: RunCgroup) {
    let path = cgroup.path().to_path_buf();
    if let Err(err) = cgroup.remove().await {
        tracing::warn!(cgroup = %path.display(), error = %err, "failed to remove run cgroup");
    }
}

/// Checked in classification order: memory, cpu, wall.
fn check_limits(
    limits: &PhaseLimits,
    wall_limit: u64,
    usage: Usage,
    wall_ms: u64,
) -> Option<LimitAxis> {
    if let Some(max) = PhaseLimits::bounded(limits.memory_limit)
        && usage.memory_kb > max
    {
        return Some(LimitAxis::MemoryLimit);
    }
    if let Some(max) = PhaseLimits::bounded(limits.cpu_time)
        && usage.cpu_ms > max
    {
        return Some(LimitAxis::CpuTime);
    }
    (wall_ms > wall_limit).then_some(LimitAxis::Timeout)
}

fn allocation_failed(stderr_tail: &[u8]) -> bool {
    let text = String::from_utf8_lossy(stderr_tail).to_ascii_lowercase();
    ALLOCATION_FAILURES.iter().any(|marker| text.contains(marker))
}

/// `oom` covers both the kernel's cgroup OOM kill and a refused allocation.
fn classify(
    signal: Option<Signal>,
    tripped: Option<LimitAxis>,
    oom: bool,
) -> (ExecutionStatus, Option<LimitAxis>) {
    match (tripped, signal) {
        (Some(LimitAxis::MemoryLimit), _) => {
            (ExecutionStatus::MemoryExceeded, Some(LimitAxis::MemoryLimit))
        }
        _ if oom => (ExecutionStatus::MemoryExceeded, Some(LimitAxis::MemoryLimit)),
        (Some(axis), _) => (ExecutionStatus::TimedOut, Some(axis)),
        (None, Some(Signal::SIGXCPU)) => (ExecutionStatus::TimedOut, Some(LimitAxis::CpuTime)),
        (None, _) => (ExecutionStatus::Ok, None),
    }
}

/// Resource limits computed up front so the child only makes syscalls.
#[derive(Debug, Clone, Copy)]
struct RlimitPlan {
    nofile: Option<u64>,
    fsize: Option<u64>,
    nproc: Option<u64>,
    cpu_secs: Option<u64>,
    data_bytes: Option<u64>,
}

impl RlimitPlan {
    fn new(
        box_limits: &BoxLimits,
        limits: &PhaseLimits,
        has_cgroup: bool,
        dedicated_uid: bool,
    ) -> Self {
        Self {
            nofile: PhaseLimits::bounded(box_limits.max_open_files),
            fsize: PhaseLimits::bounded(box_limits.max_file_size_bytes),
            // RLIMIT_NPROC counts every process of the uid. On a shared uid
            // pids.max is preferred whenever a cgroup exists.
            nproc: if has_cgroup && !dedicated_uid {
                None
            } else {
                PhaseLimits::bounded(box_limits.max_process_count)
            },
            // Backstop for the poller: SIGXCPU one second past the budget.
            cpu_secs: PhaseLimits::bounded(limits.cpu_time).map(|ms| ms.div_ceil(1000) + 1),
            // memory.max bounds committed memory when a cgroup exists. Without
            // one, RLIMIT_DATA caps it while the poller still classifies
            // resident overruns below the cap.
            data_bytes: if has_cgroup {
                None
            } else {
                PhaseLimits::bounded(limits.memory_limit).map(|kb| {
                    kb.saturating_mul(2 * 1024)
                        .saturating_add(DATA_SLACK_BYTES)
                })
            },
        }
    }

    fn apply(&self) -> io::Result<()> {
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        if let Some(n) = self.nofile {
            setrlimit(Resource::RLIMIT_NOFILE, n, n)?;
        }
        if let Some(n) = self.fsize {
            setrlimit(Resource::RLIMIT_FSIZE, n, n)?;
        }
        if let Some(n) = self.nproc {
            setrlimit(Resource::RLIMIT_NPROC, n, n)?;
        }
        if let Some(secs) = self.cpu_secs {
            setrlimit(Resource::RLIMIT_CPU, secs, secs + 1)?;
        }
        if let Some(bytes) = self.data_bytes {
            setrlimit(Resource::RLIMIT_DATA, bytes, bytes)?;
        }
        Ok(())
    }
}

/// Kills the whole process tree when dropped while still armed, so a
/// cancelled run leaves nothing behind.
struct TreeGuard {
    pgid: Option<i32>,
    /// Box uid. Every process it owns belongs to the run.
    owner: Option<u32>,
    cgroup: Option<RunCgroup>,
}

impl TreeGuard {
    fn usage(&self) -> Usage {
        match (&self.cgroup, self.owner, self.pgid) {
            (Some(cgroup), _, _) => cgroup.usage(),
            (None, Some(uid), _) => monitor::tree_usage(Tree::Owner(uid)),
            (None, None, Some(pgid)) => monitor::tree_usage(Tree::Group(pgid)),
            (None, None, None) => Usage::default(),
        }
    }

    fn oom_killed(&self) -> bool {
        self.cgroup.as_ref().is_some_and(RunCgroup::oom_killed)
    }

    fn kill(&self) {
        if let Some(cgroup) = &self.cgroup {
            cgroup.kill();
        }
        if let Some(pgid) = self.pgid {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
        if let Some(uid) = self.owner {
            kill_owner(uid);
        }
    }

    fn disarm(&mut self) -> Option<RunCgroup> {
        self.pgid = None;
        self.owner = None;
        self.cgroup.take()
    }
}

/// Kills every process of a box uid, rescanning because a fork can land
/// between a scan and its signals.
fn kill_owner(uid: u32) {
    for _ in 0..OWNER_KILL_ROUNDS {
        let pids = monitor::live_pids(Tree::Owner(uid));
        if pids.is_empty() {
            return;
        }
        for pid in pids {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        std::thread::yield_now();
    }
    tracing::warn!(uid, "box uid still has live processes after kill");
}

impl Drop for TreeGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::engine::{limits::Phase, sandbox::BoxOwner};

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(
            BoxLimits {
                output_max_bytes: 64,
                max_process_count: 0,
                max_open_files: 256,
                max_file_size_bytes: 1_000_000,
                max_wall_timeout_ms: 10_000,
            },
            None,
        )
    }

    fn sh(script: &str, limits: PhaseLimits) -> RunSpec {
        RunSpec {
            phase: Phase::Run,
            command: vec!["/bin/sh".into(), "-c".into(), script.into()],
            stdin: String::new(),
            limits,
            env: BTreeMap::new(),
        }
    }

    async fn sandbox() -> (tempfile::TempDir, SandboxBox) {
        let root = tempfile::tempdir().unwrap();
        let sandbox = SandboxBox::create(root.path(), 0, None).await.unwrap();
        (root, sandbox)
    }

    /// Boxes with their own uids. Switching uid needs root. Tests run in
    /// parallel, so each picks its own `uid_base`.
    async fn owned_boxes(
        uid_base: u32,
        count: usize,
    ) -> Option<(tempfile::TempDir, Vec<SandboxBox>)> {
        if !nix::unistd::geteuid().is_root() {
            return None;
        }
        let root = tempfile::tempdir().unwrap();
        let mut boxes = Vec::new();
        for id in 0..count {
            let owner = BoxOwner::for_box(uid_base, id).unwrap();
            boxes.push(SandboxBox::create(root.path(), id, Some(owner)).await.unwrap());
        }
        Some((root, boxes))
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let (_root, mut sandbox) = sandbox().await;
        let result = executor()
            .execute(&mut sandbox, sh("echo hello; echo oops >&2", PhaseLimits::default()))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.code, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "oops\n");
        assert!(result.output.contains("hello"));
        assert!(result.signal.is_none());
    }

    #[tokio::test]
    async fn non_zero_exit_is_still_ok() {
        let (_root, mut sandbox) = sandbox().await;
        let result = executor()
            .execute(&mut sandbox, sh("exit 3", PhaseLimits::default()))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.code, Some(3));
    }

    #[tokio::test]
    async fn self_signalled_process_reports_signal() {
        let (_root, mut sandbox) = sandbox().await;
        let result = executor()
            .execute(&mut sandbox, sh("kill -TERM $$", PhaseLimits::default()))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.code, None);
        assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
    }

    #[tokio::test]
    async fn wall_clock_kills_the_tree() {
        let (_root, mut sandbox) = sandbox().await;
        let limits = PhaseLimits {
            timeout: 300,
            ..PhaseLimits::default()
        };
        let result = executor()
            .execute(&mut sandbox, sh("sleep 5; echo late", limits))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.limit, Some(LimitAxis::Timeout));
        assert!(result.wall_time >= 300);
        assert!(result.wall_time < 5000);
        assert!(!result.stdout.contains("late"));
    }

    #[tokio::test]
    async fn cpu_budget_kills_busy_loops() {
        let (_root, mut sandbox) = sandbox().await;
        let limits = PhaseLimits {
            cpu_time: 200,
            ..PhaseLimits::default()
        };
        let result = executor()
            .execute(&mut sandbox, sh("while :; do :; done", limits))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert_eq!(result.limit, Some(LimitAxis::CpuTime));
        assert!(result.cpu_time > 200);
    }

    #[tokio::test]
    async fn memory_overrun_is_reported() {
        let (_root, mut sandbox) = sandbox().await;
        let limits = PhaseLimits {
            memory_limit: 16_000,
            ..PhaseLimits::default()
        };
        let script = "x=$(head -c 64000000 /dev/zero | tr '\\0' a); sleep 2";
        let result = executor()
            .execute(&mut sandbox, sh(script, limits))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::MemoryExceeded);
        assert_eq!(result.limit, Some(LimitAxis::MemoryLimit));
        assert!(result.memory > 16_000);
    }

    #[tokio::test]
    async fn output_is_bounded_without_blocking() {
        let (_root, mut sandbox) = sandbox().await;
        let result = executor()
            .execute(
                &mut sandbox,
                sh("head -c 1000000 /dev/zero | tr '\\0' x; echo done >&2", PhaseLimits::default()),
            )
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.stdout.len(), 64);
        assert_eq!(result.stderr, "done\n");
        assert_eq!(result.output.len(), 64);
    }

    #[tokio::test]
    async fn stdin_reaches_the_process() {
        let (_root, mut sandbox) = sandbox().await;
        let mut spec = sh("cat", PhaseLimits::default());
        spec.stdin = "ping\n".to_string();
        let result = executor().execute(&mut sandbox, spec).await.unwrap();
        assert_eq!(result.stdout, "ping\n");
    }

    #[tokio::test]
    async fn environment_is_scrubbed() {
        let (_root, mut sandbox) = sandbox().await;
        let mut spec = sh("echo \"$HOME|$GREETING|${CARGO:-none}\"", PhaseLimits::default());
        spec.env.insert("GREETING".into(), "hi".into());
        let result = executor().execute(&mut sandbox, spec).await.unwrap();
        let expected = format!("{}|hi|none\n", sandbox.workspace().display());
        assert_eq!(result.stdout, expected);
    }

    #[tokio::test]
    async fn workspace_relative_programs_run() {
        let (_root, mut sandbox) = sandbox().await;
        sandbox
            .write_file("prog", b"#!/bin/sh\necho from-box\n", true)
            .await
            .unwrap();
        let spec = RunSpec {
            command: vec!["./prog".into()],
            ..sh("", PhaseLimits::default())
        };
        let result = executor().execute(&mut sandbox, spec).await.unwrap();
        assert_eq!(result.stdout, "from-box\n");
    }

    #[tokio::test]
    async fn non_executable_artifact_is_a_runtime_error() {
        let (_root, mut sandbox) = sandbox().await;
        sandbox.write_file("prog", b"not a binary", false).await.unwrap();
        let spec = RunSpec {
            command: vec!["./prog".into()],
            ..sh("", PhaseLimits::default())
        };
        let result = executor().execute(&mut sandbox, spec).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
        assert!(result.stderr.contains("prog"));
    }

    #[tokio::test]
    async fn missing_host_program_is_an_infrastructure_error() {
        let (_root, mut sandbox) = sandbox().await;
        let spec = RunSpec {
            command: vec!["/definitely/not/here".into()],
            ..sh("", PhaseLimits::default())
        };
        assert!(executor().execute(&mut sandbox, spec).await.is_err());
    }

    #[tokio::test]
    async fn background_children_do_not_survive() {
        let (_root, mut sandbox) = sandbox().await;
        let marker = sandbox.workspace().join("marker");
        let script = format!("(sleep 1; touch {}) & echo started", marker.display());
        let result = executor()
            .execute(&mut sandbox, sh(&script, PhaseLimits::default()))
            .await
            .unwrap();
        assert_eq!(result.stdout, "started\n");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn owned_box_runs_as_its_uid() {
        let Some((_root, mut boxes)) = owned_boxes(62_000, 1).await else {
            return;
        };
        let result = executor()
            .execute(&mut boxes[0], sh("id -u; id -g", PhaseLimits::default()))
            .await
            .unwrap();
        assert_eq!(result.stdout, "62000\n62000\n");
    }

    #[tokio::test]
    async fn boxes_cannot_write_into_each_other() {
        let Some((root, mut boxes)) = owned_boxes(62_100, 2).await else {
            return;
        };
        let victim = boxes[1]
            .write_file("main.py", b"print('mine')\n", false)
            .await
            .unwrap();
        let script = "echo 'print(\"pwned\")' > ../box-1/main.py; ls .. ; echo done";
        let result = executor()
            .execute(&mut boxes[0], sh(script, PhaseLimits::default()))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert!(result.stdout.ends_with("done\n"));
        assert!(!result.stdout.contains("box-1"));
        assert_eq!(std::fs::read(&victim).unwrap(), b"print('mine')\n");

        let result = executor()
            .execute(&mut boxes[0], sh("touch ../planted", PhaseLimits::default()))
            .await
            .unwrap();
        assert_ne!(result.code, Some(0));
        assert!(!root.path().join("planted").exists());
    }

    #[tokio::test]
    async fn setsid_children_die_with_the_run() {
        let setsid_available = ["/usr/bin/setsid", "/bin/setsid"]
            .iter()
            .any(|path| std::path::Path::new(path).exists());
        if !setsid_available {
            return;
        }
        let Some((_root, mut boxes)) = owned_boxes(62_200, 1).await else {
            return;
        };
        let sandbox = &mut boxes[0];
        let marker = sandbox.workspace().join("leaked");
        let script = format!(
            "setsid sh -c 'sleep 1; touch {}' & echo started",
            marker.display()
        );
        let limits = PhaseLimits {
            timeout: 500,
            ..PhaseLimits::default()
        };
        let result = executor().execute(sandbox, sh(&script, limits)).await.unwrap();
        assert_eq!(result.stdout, "started\n");
        assert!(monitor::live_pids(Tree::Owner(62_200)).is_empty());

        sandbox.reset().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn memory_backstop_applies_only_without_a_cgroup() {
        let limits = PhaseLimits {
            memory_limit: 16_000,
            ..PhaseLimits::default()
        };
        let plan = RlimitPlan::new(&BoxLimits::default(), &limits, false, true);
        assert_eq!(plan.data_bytes, Some(16_000 * 2048 + DATA_SLACK_BYTES));
        assert_eq!(plan.nproc, Some(BoxLimits::default().max_process_count));

        let plan = RlimitPlan::new(&BoxLimits::default(), &limits, true, false);
        assert_eq!(plan.data_bytes, None);
        assert_eq!(plan.nproc, None);

        let plan = RlimitPlan::new(&BoxLimits::default(), &PhaseLimits::default(), false, false);
        assert_eq!(plan.data_bytes, None);
    }

    #[tokio::test]
    async fn refused_allocation_is_a_memory_overrun() {
        let (_root, mut sandbox) = sandbox().await;
        let limits = PhaseLimits {
            memory_limit: 16_000,
            ..PhaseLimits::default()
        };
        let script = "echo 'Traceback (most recent call last):' >&2; echo MemoryError >&2; exit 1";
        let result = executor()
            .execute(&mut sandbox, sh(script, limits))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::MemoryExceeded);
        assert_eq!(result.limit, Some(LimitAxis::MemoryLimit));

        let result = executor()
            .execute(&mut sandbox, sh(script, PhaseLimits::default()))
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.code, Some(1));
    }

    #[test]
    fn recognises_allocation_failures() {
        assert!(allocation_failed(b"Traceback ...\nMemoryError\n"));
        assert!(allocation_failed(b"FATAL ERROR: JavaScript heap out of memory"));
        assert!(allocation_failed(b"terminate called after throwing 'std::bad_alloc'"));
        assert!(!allocation_failed(b"IndexError: list index out of range"));
    }

    #[test]
    fn classification_precedence() {
        assert_eq!(
            classify(Some(Signal::SIGKILL), Some(LimitAxis::MemoryLimit), false),
            (ExecutionStatus::MemoryExceeded, Some(LimitAxis::MemoryLimit))
        );
        assert_eq!(
            classify(Some(Signal::SIGKILL), Some(LimitAxis::Timeout), true),
            (ExecutionStatus::MemoryExceeded, Some(LimitAxis::MemoryLimit))
        );
        assert_eq!(
            classify(Some(Signal::SIGKILL), Some(LimitAxis::CpuTime), false),
            (ExecutionStatus::TimedOut, Some(LimitAxis::CpuTime))
        );
        assert_eq!(
            classify(Some(Signal::SIGXCPU), None, false),
            (ExecutionStatus::TimedOut, Some(LimitAxis::CpuTime))
        );
        assert_eq!(
            classify(Some(Signal::SIGSEGV), None, false),
            (ExecutionStatus::Ok, None)
        );
    }

    #[test]
    fn limits_are_checked_memory_first() {
        let limits = PhaseLimits {
            timeout: 100,
            cpu_time: 50,
            memory_limit: 1000,
        };
        let hog = Usage {
            cpu_ms: 60,
            memory_kb: 2000,
        };
        assert_eq!(check_limits(&limits, 100, hog, 200), Some(LimitAxis::MemoryLimit));
        let busy = Usage {
            cpu_ms: 60,
            memory_kb: 10,
        };
        assert_eq!(check_limits(&limits, 100, busy, 200), Some(LimitAxis::CpuTime));
        assert_eq!(check_limits(&limits, 100, Usage::default(), 200), Some(LimitAxis::Timeout));
        assert_eq!(check_limits(&PhaseLimits::default(), 100, hog, 50), None);
    }

    #[test]
    fn cpu_rlimit_rounds_up_with_slack() {
        let plan = RlimitPlan::new(
            &BoxLimits::default(),
            &PhaseLimits {
                cpu_time: 1500,
                ..PhaseLimits::default()
            },
            true,
            false,
        );
        assert_eq!(plan.cpu_secs, Some(3));
        assert_eq!(plan.nproc, None);
    }
}
