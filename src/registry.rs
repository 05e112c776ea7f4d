use crate::{CaravanError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// One step of a migration task. Owned exclusively by its task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub log: String,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            log: String::new(),
        }
    }
}

/// Durable record of one migration task. Steps are pre-populated at
/// creation so progress totals are known up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTask {
    pub id: String,
    pub source_host: String,
    pub target_host: String,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub steps: Vec<Step>,
    pub progress: u32,
    pub total_steps: u32,
    pub current_step: Option<String>,
    /// Shared append-only log stream; appends keep arrival order.
    #[serde(default)]
    pub log: String,
}

impl MigrationTask {
    pub fn new(source_host: &str, target_host: &str, steps: Vec<Step>) -> Self {
        let total_steps = steps.len() as u32;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_host: source_host.to_string(),
            target_host: target_host.to_string(),
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            steps,
            progress: 0,
            total_steps,
            current_step: None,
            log: String::new(),
        }
    }
}

/// Storage port for migration tasks. Injected into the orchestrator at
/// construction; `update_step` is the only mutation path while a task is
/// executing.
pub trait TaskStore: Send + Sync {
    fn create(&self, task: MigrationTask) -> Result<()>;
    fn get(&self, id: &str) -> Result<MigrationTask>;
    /// Newest first, at most `limit` entries.
    fn list(&self, limit: usize) -> Result<Vec<MigrationTask>>;
    fn update_step(
        &self,
        task_id: &str,
        step_name: &str,
        status: StepStatus,
        log_append: &str,
    ) -> Result<()>;
    fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()>;
    fn append_log(&self, task_id: &str, line: &str) -> Result<()>;
    /// Remove finished tasks, keeping pending/running ones. Returns the
    /// number of deleted records.
    fn delete_history(&self) -> Result<usize>;
}

/// One JSON document per task under `<state_dir>/tasks/`, with a
/// read-through map for pollers. Readers always get a cloned snapshot;
/// only the owning orchestration worker mutates.
pub struct JsonTaskStore {
    dir: PathBuf,
    tasks: RwLock<HashMap<String, MigrationTask>>,
}

impl JsonTaskStore {
    /// Load persisted tasks. Tasks that were mid-flight when the process
    /// died are marked failed: the design is at-most-one-in-flight plus
    /// manual retry, not resume-across-crash.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("tasks");
        fs::create_dir_all(&dir)?;
        let mut tasks = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            match serde_json::from_str::<MigrationTask>(&text) {
                Ok(mut task) => {
                    if !task.status.is_terminal() {
                        warn!(task = %task.id, "marking interrupted task as failed");
                        task.status = TaskStatus::Failed;
                        task.log
                            .push_str("[recovery] process restarted mid-task; marked failed\n");
                        let _ = write_task(&dir, &task);
                    }
                    tasks.insert(task.id.clone(), task);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable task record"),
            }
        }
        Ok(Self {
            dir,
            tasks: RwLock::new(tasks),
        })
    }

    fn mutate<F>(&self, task_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut MigrationTask) -> Result<()>,
    {
        let mut tasks = self.tasks.write().expect("task store lock");
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CaravanError::TaskNotFound(task_id.to_string()))?;
        f(task)?;
        write_task(&self.dir, task)
    }
}

fn write_task(dir: &Path, task: &MigrationTask) -> Result<()> {
    let path = dir.join(format!("{}.json", task.id));
    let text = serde_json::to_string_pretty(task)?;
    fs::write(path, text)?;
    Ok(())
}

fn log_line(step_name: &str, fragment: &str) -> String {
    format!("{} [{}] {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S"), step_name, fragment)
}

impl TaskStore for JsonTaskStore {
    fn create(&self, task: MigrationTask) -> Result<()> {
        let mut tasks = self.tasks.write().expect("task store lock");
        write_task(&self.dir, &task)?;
        info!(task = %task.id, steps = task.total_steps, "task created");
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<MigrationTask> {
        let tasks = self.tasks.read().expect("task store lock");
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| CaravanError::TaskNotFound(id.to_string()))
    }

    fn list(&self, limit: usize) -> Result<Vec<MigrationTask>> {
        let tasks = self.tasks.read().expect("task store lock");
        let mut all: Vec<MigrationTask> = tasks.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }

    fn update_step(
        &self,
        task_id: &str,
        step_name: &str,
        status: StepStatus,
        log_append: &str,
    ) -> Result<()> {
        self.mutate(task_id, |task| {
            let step = task
                .steps
                .iter_mut()
                .find(|s| s.name == step_name)
                .ok_or_else(|| {
                    CaravanError::TaskNotFound(format!("{}/{}", task_id, step_name))
                })?;
            match status {
                StepStatus::Running => {
                    step.started_at.get_or_insert_with(Utc::now);
                    task.current_step = Some(step_name.to_string());
                }
                s if s.is_terminal() => {
                    step.ended_at.get_or_insert_with(Utc::now);
                }
                _ => {}
            }
            step.status = status;
            if !log_append.is_empty() {
                step.log.push_str(log_append);
                step.log.push('\n');
                task.log.push_str(&log_line(step_name, log_append));
            }
            let done = task.steps.iter().filter(|s| s.status.is_terminal()).count() as u32;
            debug_assert!(done <= task.total_steps);
            task.progress = done.min(task.total_steps);
            Ok(())
        })
    }

    fn set_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        self.mutate(task_id, |task| {
            if task.status.is_terminal() {
                warn!(task = %task.id, ?status, "ignoring transition out of terminal status");
                return Ok(());
            }
            task.status = status;
            Ok(())
        })
    }

    fn append_log(&self, task_id: &str, line: &str) -> Result<()> {
        self.mutate(task_id, |task| {
            task.log.push_str(&log_line("task", line));
            Ok(())
        })
    }

    fn delete_history(&self) -> Result<usize> {
        let mut tasks = self.tasks.write().expect("task store lock");
        let finished: Vec<String> = tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in &finished {
            tasks.remove(id);
            let _ = fs::remove_file(self.dir.join(format!("{}.json", id)));
        }
        info!(removed = finished.len(), "task history pruned");
        Ok(finished.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, JsonTaskStore) {
        let dir = TempDir::new().unwrap();
        let store = JsonTaskStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn sample_task() -> MigrationTask {
        MigrationTask::new(
            "pve1",
            "pve2",
            vec![Step::new("100/validate"), Step::new("100/export")],
        )
    }

    #[test]
    fn progress_tracks_terminal_steps_and_stays_bounded() {
        let (_dir, store) = store();
        let task = sample_task();
        let id = task.id.clone();
        store.create(task).unwrap();

        store
            .update_step(&id, "100/validate", StepStatus::Running, "checking")
            .unwrap();
        assert_eq!(store.get(&id).unwrap().progress, 0);

        store
            .update_step(&id, "100/validate", StepStatus::Success, "ok")
            .unwrap();
        store
            .update_step(&id, "100/export", StepStatus::Skipped, "")
            .unwrap();
        let task = store.get(&id).unwrap();
        assert_eq!(task.progress, 2);
        assert!(task.progress <= task.total_steps);
        assert_eq!(task.current_step.as_deref(), Some("100/validate"));
    }

    #[test]
    fn terminal_status_is_monotonic() {
        let (_dir, store) = store();
        let task = sample_task();
        let id = task.id.clone();
        store.create(task).unwrap();

        store.set_status(&id, TaskStatus::Running).unwrap();
        store.set_status(&id, TaskStatus::Failed).unwrap();
        store.set_status(&id, TaskStatus::Running).unwrap();
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn interrupted_tasks_fail_on_reload() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = JsonTaskStore::open(dir.path()).unwrap();
            let task = sample_task();
            let id = task.id.clone();
            store.create(task).unwrap();
            store.set_status(&id, TaskStatus::Running).unwrap();
            id
        };
        let store = JsonTaskStore::open(dir.path()).unwrap();
        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.log.contains("recovery"));
    }

    #[test]
    fn history_pruning_keeps_active_tasks() {
        let (_dir, store) = store();
        let active = sample_task();
        let active_id = active.id.clone();
        store.create(active).unwrap();
        store.set_status(&active_id, TaskStatus::Running).unwrap();

        let finished = sample_task();
        let finished_id = finished.id.clone();
        store.create(finished).unwrap();
        store.set_status(&finished_id, TaskStatus::Completed).unwrap();

        assert_eq!(store.delete_history().unwrap(), 1);
        assert!(store.get(&active_id).is_ok());
        assert!(store.get(&finished_id).is_err());
    }

    #[test]
    fn step_logs_append_into_the_shared_stream() {
        let (_dir, store) = store();
        let task = sample_task();
        let id = task.id.clone();
        store.create(task).unwrap();
        store
            .update_step(&id, "100/validate", StepStatus::Running, "first")
            .unwrap();
        store
            .update_step(&id, "100/export", StepStatus::Running, "second")
            .unwrap();
        let log = store.get(&id).unwrap().log;
        let first = log.find("first").unwrap();
        let second = log.find("second").unwrap();
        assert!(first < second);
    }
}
