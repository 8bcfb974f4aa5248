use std::sync::Arc;

use uuid::Uuid;

use crate::engine::{
    error::{EngineError, EngineResult},
    limits::Phase,
    metrics::MetricsRegistry,
    models::{BatchOutcome, ExecutionResult, RunResult, Testcase},
    pool::SandboxPool,
    sandbox::{Executor, RunSpec, SandboxBox},
    tracker::{ActiveJobs, JobStage},
    validation::JobParams,
};

/// Shared services a job borrows for its lifetime.
#[derive(Clone)]
pub struct JobContext {
    pub pool: Arc<SandboxPool>,
    pub executor: Arc<dyn Executor>,
    pub metrics: Arc<MetricsRegistry>,
    pub tracker: ActiveJobs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Primed,
    BatchDone,
    CleanedUp,
}

/// Result of driving a job end to end. Cleanup is reported separately so a
/// cleanup failure never rewrites what the batch produced.
#[derive(Debug)]
pub struct JobOutcome {
    pub result: EngineResult<BatchOutcome>,
    pub cleanup: EngineResult<()>,
}

/// One submission: prime (box + files + compile), run a batch of testcases,
/// clean up. Holds at most one box at a time.
pub struct Job {
    id: Uuid,
    params: JobParams,
    state: JobState,
    failed: bool,
    sandbox: Option<SandboxBox>,
    compile: Option<ExecutionResult>,
    ctx: JobContext,
}

impl Job {
    pub fn new(params: JobParams, ctx: JobContext) -> Self {
        let id = Uuid::new_v4();
        ctx.tracker.register(
            id,
            &params.runtime.language,
            &params.runtime.version.to_string(),
        );
        ctx.metrics.job_submitted();
        Self {
            id,
            params,
            state: JobState::Created,
            failed: false,
            sandbox: None,
            compile: None,
            ctx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Runs the whole lifecycle. Cleanup happens on every path.
    pub async fn run(mut self) -> JobOutcome {
        let testcases = std::mem::take(&mut self.params.testcases);
        let result = match self.prime().await {
            Ok(()) => self.execute_batch(&testcases).await,
            Err(err) => Err(err),
        };
        let cleanup = self.cleanup().await;
        match &result {
            Ok(_) => self.ctx.metrics.job_completed(),
            Err(_) => self.ctx.metrics.job_failed(),
        }
        JobOutcome { result, cleanup }
    }

    /// Acquires a box, writes the submitted files and compiles if needed.
    pub async fn prime(&mut self) -> EngineResult<()> {
        if self.state != JobState::Created {
            return Err(EngineError::InvalidState("prime"));
        }
        let sandbox = self.ctx.pool.acquire().await.inspect_err(|_| self.failed = true)?;
        let box_id = sandbox.id();
        self.sandbox = Some(sandbox);
        tracing::info!(
            job_id = %self.id,
            box_id,
            language = %self.params.runtime.language,
            version = %self.params.runtime.version,
            "job primed with box"
        );

        if let Err(err) = self.write_files().await {
            self.failed = true;
            return Err(err);
        }

        let names = self.file_names();
        if let Some(command) = self.params.runtime.compile_invocation(&names) {
            self.ctx
                .tracker
                .update(&self.id, JobStage::Compiling, Some(box_id));
            let spec = RunSpec {
                phase: Phase::Compile,
                command,
                stdin: String::new(),
                limits: self.params.limits.compile,
                env: self.params.runtime.env.clone(),
            };
            let result = self.execute(spec).await?;
            if !compile_succeeded(&result) {
                tracing::info!(job_id = %self.id, status = ?result.status, code = ?result.code, "compile failed");
            }
            self.compile = Some(result);
        }

        self.state = JobState::Primed;
        Ok(())
    }

    /// Runs every testcase in order in the primed box. A failed compile
    /// yields just the compile result and no runs.
    pub async fn execute_batch(&mut self, testcases: &[Testcase]) -> EngineResult<BatchOutcome> {
        if self.state != JobState::Primed {
            return Err(EngineError::InvalidState("execute a batch"));
        }

        if let Some(compile) = &self.compile
            && !compile_succeeded(compile)
        {
            self.state = JobState::BatchDone;
            return Ok(BatchOutcome {
                compile: Some(compile.clone()),
                run: Vec::new(),
            });
        }

        let box_id = self.sandbox.as_ref().map(SandboxBox::id);
        self.ctx.tracker.update(&self.id, JobStage::Running, box_id);
        let names = self.file_names();
        let mut runs = Vec::with_capacity(testcases.len());
        for testcase in testcases {
            let args = testcase.args.as_deref().unwrap_or(&self.params.args);
            let spec = RunSpec {
                phase: Phase::Run,
                command: self.params.runtime.run_invocation(&names, args),
                stdin: testcase.stdin.clone(),
                limits: self.params.limits.run,
                env: self.params.runtime.env.clone(),
            };
            let result = self.execute(spec).await?;
            runs.push(RunResult::new(testcase, result));
        }

        tracing::info!(job_id = %self.id, runs = runs.len(), "batch finished");
        self.state = JobState::BatchDone;
        Ok(BatchOutcome {
            compile: self.compile.clone(),
            run: runs,
        })
    }

    /// Releases the box if one is held. Safe to call from any state and any
    /// number of times.
    pub async fn cleanup(&mut self) -> EngineResult<()> {
        if self.state == JobState::CleanedUp {
            return Ok(());
        }
        self.state = JobState::CleanedUp;
        let outcome = match self.sandbox.take() {
            Some(sandbox) => {
                self.ctx
                    .tracker
                    .update(&self.id, JobStage::CleaningUp, Some(sandbox.id()));
                self.ctx.pool.release(sandbox).await
            }
            None => Ok(()),
        };
        self.ctx.tracker.remove(&self.id);
        if let Err(err) = &outcome {
            self.ctx.metrics.cleanup_failed();
            tracing::error!(job_id = %self.id, error = %err, "job cleanup failed");
        }
        outcome
    }

    async fn write_files(&mut self) -> EngineResult<()> {
        let executable = self.params.runtime.is_file_passthrough();
        let sandbox = self
            .sandbox
            .as_ref()
            .ok_or(EngineError::InvalidState("write files without a box"))?;
        for file in &self.params.files {
            sandbox
                .write_file(&file.name, &file.content, executable)
                .await?;
        }
        Ok(())
    }

    async fn execute(&mut self, spec: RunSpec) -> EngineResult<ExecutionResult> {
        let Some(sandbox) = self.sandbox.as_mut() else {
            self.failed = true;
            return Err(EngineError::InvalidState("execute without a box"));
        };
        match self.ctx.executor.execute(sandbox, spec).await {
            Ok(result) => {
                self.ctx.metrics.record_execution(&result);
                Ok(result)
            }
            Err(err) => {
                self.failed = true;
                tracing::error!(
                    job_id = %self.id,
                    executor = self.ctx.executor.name(),
                    error = %format!("{err:#}"),
                    "sandbox execution failed"
                );
                Err(err.into())
            }
        }
    }

    fn file_names(&self) -> Vec<String> {
        self.params.files.iter().map(|f| f.name.clone()).collect()
    }
}

fn compile_succeeded(result: &ExecutionResult) -> bool {
    result.is_ok() && result.code == Some(0)
}

impl Drop for Job {
    fn drop(&mut self) {
        self.ctx.tracker.remove(&self.id);
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };
        tracing::warn!(job_id = %self.id, box_id = sandbox.id(), "job dropped while holding a box");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.ctx.pool.clone();
                handle.spawn(async move {
                    let _ = pool.release(sandbox).await;
                });
            }
            Err(_) => self.ctx.pool.reclaim(sandbox),
        }
    }
}
