mod cgroup;
mod monitor;
mod output;
mod process;

use std::{
    collections::BTreeMap,
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use nix::unistd::{Gid, Uid, chown};

use crate::engine::{
    config::EngineConfig,
    limits::{Phase, PhaseLimits},
    models::ExecutionResult,
};

pub use cgroup::CgroupRoot;
pub use process::ProcessExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxState {
    Free,
    Acquired,
}

/// Unprivileged credentials every process of one box runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxOwner {
    pub uid: u32,
    pub gid: u32,
}

impl BoxOwner {
    pub fn for_box(uid_base: u32, id: usize) -> anyhow::Result<Self> {
        let uid = u32::try_from(id)
            .ok()
            .and_then(|id| uid_base.checked_add(id))
            .with_context(|| format!("box {id} has no uid above base {uid_base}"))?;
        Ok(Self { uid, gid: uid })
    }
}

/// One isolated workspace. Owned by the pool while free and by exactly one
/// job while acquired.
#[derive(Debug)]
pub struct SandboxBox {
    id: usize,
    workspace: PathBuf,
    state: BoxState,
    owner: Option<BoxOwner>,
    applied_limits: Option<PhaseLimits>,
    needs_reset: bool,
    runs: u64,
}

impl SandboxBox {
    /// Creates box `id` under `root`. With an owner, the workspace belongs to
    /// that uid and no other box can enter it.
    pub async fn create(root: &Path, id: usize, owner: Option<BoxOwner>) -> anyhow::Result<Self> {
        // Programs are resolved against the workspace after chdir.
        let root = std::path::absolute(root)
            .with_context(|| format!("failed to resolve {}", root.display()))?;
        let mut sandbox = Self {
            id,
            workspace: root.join(format!("box-{id}")),
            state: BoxState::Free,
            owner,
            applied_limits: None,
            needs_reset: false,
            runs: 0,
        };
        sandbox.reset().await?;
        if owner.is_some() {
            // Boxes can pass through the root but not list or write it.
            tokio::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o711))
                .await
                .with_context(|| format!("failed to chmod {}", root.display()))?;
        }
        Ok(sandbox)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn owner(&self) -> Option<BoxOwner> {
        self.owner
    }

    pub fn state(&self) -> BoxState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: BoxState) {
        self.state = state;
    }

    pub fn applied_limits(&self) -> Option<&PhaseLimits> {
        self.applied_limits.as_ref()
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.needs_reset = true;
    }

    /// Records the limits about to be enforced and returns a per-box run number.
    pub fn begin_run(&mut self, limits: PhaseLimits) -> u64 {
        self.applied_limits = Some(limits);
        self.runs += 1;
        self.runs
    }

    pub async fn write_file(
        &self,
        name: &str,
        content: &[u8],
        executable: bool,
    ) -> anyhow::Result<PathBuf> {
        let relative = Path::new(name);
        if name.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("refusing to write {name:?} outside the workspace");
        }

        let path = self.workspace.join(relative);
        if let Some(parent) = relative.parent() {
            tokio::fs::create_dir_all(self.workspace.join(parent))
                .await
                .with_context(|| format!("failed to create directory for {name}"))?;
            let mut dir = self.workspace.clone();
            for component in parent.components() {
                dir.push(component);
                self.hand_over(&dir)?;
            }
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {name} into box {}", self.id))?;
        let mode = if executable { 0o755 } else { 0o644 };
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("failed to chmod {name}"))?;
        self.hand_over(&path)?;
        Ok(path)
    }

    fn hand_over(&self, path: &Path) -> anyhow::Result<()> {
        let Some(owner) = self.owner else {
            return Ok(());
        };
        chown(
            path,
            Some(Uid::from_raw(owner.uid)),
            Some(Gid::from_raw(owner.gid)),
        )
        .with_context(|| format!("failed to chown {} to uid {}", path.display(), owner.uid))
    }

    /// Wipes the workspace and forgets applied limits.
    pub async fn reset(&mut self) -> anyhow::Result<()> {
        match tokio::fs::remove_dir_all(&self.workspace).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                self.needs_reset = true;
                return Err(err).with_context(|| {
                    format!("failed to wipe workspace {}", self.workspace.display())
                });
            }
        }
        if let Err(err) = tokio::fs::create_dir_all(&self.workspace).await {
            self.needs_reset = true;
            return Err(err).with_context(|| {
                format!("failed to create workspace {}", self.workspace.display())
            });
        }
        let mode = if self.owner.is_some() { 0o700 } else { 0o755 };
        tokio::fs::set_permissions(&self.workspace, std::fs::Permissions::from_mode(mode))
            .await
            .context("failed to chmod workspace")?;
        self.hand_over(&self.workspace)?;
        self.applied_limits = None;
        self.needs_reset = false;
        Ok(())
    }
}

/// One process invocation inside a box.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub phase: Phase,
    pub command: Vec<String>,
    pub stdin: String,
    pub limits: PhaseLimits,
    pub env: BTreeMap<String, String>,
}

/// Runs one process tree under limits. Sandboxed misbehaviour is reported in
/// the result; `Err` is reserved for infrastructure faults.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(
        &self,
        sandbox: &mut SandboxBox,
        spec: RunSpec,
    ) -> anyhow::Result<ExecutionResult>;
}

/// Picks the uid base for boxes. Switching credentials needs root, so an
/// unprivileged engine refuses to start unless shared-uid mode is allowed.
pub fn box_uid_base(config: &EngineConfig, privileged: bool) -> anyhow::Result<Option<u32>> {
    if privileged {
        anyhow::ensure!(config.box_uid_base > 0, "BOX_UID_BASE must not be 0");
        return Ok(Some(config.box_uid_base));
    }
    if config.allow_shared_uid {
        tracing::warn!("engine is not root, boxes share its uid and can reach each other");
        return Ok(None);
    }
    anyhow::bail!(
        "per-box uids need root; run the engine as root or set ALLOW_SHARED_UID=true"
    )
}

pub fn executor_from_config(config: &EngineConfig) -> Arc<dyn Executor> {
    let cgroup = config.cgroup_root.as_deref().and_then(|root| {
        let detected = CgroupRoot::detect(root);
        if detected.is_none() {
            tracing::warn!(
                cgroup_root = %root.display(),
                "cgroup root unusable, falling back to /proc accounting"
            );
        }
        detected
    });
    Arc::new(ProcessExecutor::new(config.box_limits, cgroup))
}
