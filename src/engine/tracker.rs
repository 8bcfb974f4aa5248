use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::engine::models::ActiveJobSummary;

/// Stage labels reported for in-flight jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    WaitingForBox,
    Compiling,
    Running,
    CleaningUp,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::WaitingForBox => "waiting_for_box",
            JobStage::Compiling => "compiling",
            JobStage::Running => "running",
            JobStage::CleaningUp => "cleaning_up",
        }
    }
}

/// In-memory view of jobs currently holding or waiting for a box.
#[derive(Clone, Default)]
pub struct ActiveJobs {
    jobs: Arc<DashMap<Uuid, ActiveJobSummary>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, language: &str, version: &str) {
        self.jobs.insert(
            id,
            ActiveJobSummary {
                id,
                language: language.to_string(),
                version: version.to_string(),
                stage: JobStage::WaitingForBox.as_str().to_string(),
                box_id: None,
                started_at: Utc::now(),
            },
        );
    }

    pub fn update(&self, id: &Uuid, stage: JobStage, box_id: Option<usize>) {
        if let Some(mut entry) = self.jobs.get_mut(id) {
            entry.stage = stage.as_str().to_string();
            entry.box_id = box_id;
        }
    }

    pub fn remove(&self, id: &Uuid) {
        self.jobs.remove(id);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<ActiveJobSummary> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }
}
