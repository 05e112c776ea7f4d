use crate::arbiter::IdArbiter;
use crate::config::CaravanConfig;
use crate::host::{Host, HostKind};
use crate::inventory::{is_volume_key, ComputeUnit, InventoryReader, RunState, UnitKind};
use crate::mapping::{resolve_network, resolve_storage, ResourceMapper, UnitMapping};
use crate::registry::{MigrationTask, Step, StepStatus, TaskStatus, TaskStore};
use crate::remote::{RemoteExec, SessionFactory};
use crate::{CaravanError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// One compute unit in a migration request, with its per-unit plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSpec {
    pub id: u32,
    pub kind: UnitKind,
    #[serde(default)]
    pub mapping: UnitMapping,
}

/// Batch-level options, validated once at submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Live handoff: the unit keeps running on the source until cutover.
    #[serde(default)]
    pub online: bool,
    /// Remove the source-side unit after a successful migration. Off by
    /// default; the source is never deleted unless explicitly requested.
    #[serde(default)]
    pub delete_source: bool,
    /// Proceed with explicit target ids that collide with the target
    /// inventory. Without this, a collision fails the unit's validation.
    #[serde(default)]
    pub acknowledge_conflicts: bool,
}

/// A migration request as submitted by the CLI or reconstructed from a
/// scheduled job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub source_host: String,
    pub target_host: String,
    pub units: Vec<UnitSpec>,
    #[serde(default)]
    pub options: MigrationOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Validate,
    Export,
    Transfer,
    Rewrite,
    Import,
    NetworkAttach,
    Cutover,
    Cleanup,
}

impl Phase {
    const ALL: [Phase; 8] = [
        Phase::Validate,
        Phase::Export,
        Phase::Transfer,
        Phase::Rewrite,
        Phase::Import,
        Phase::NetworkAttach,
        Phase::Cutover,
        Phase::Cleanup,
    ];

    /// Phases driven after validation, in execution order.
    const EXECUTION: [Phase; 7] = [
        Phase::Export,
        Phase::Transfer,
        Phase::Rewrite,
        Phase::Import,
        Phase::NetworkAttach,
        Phase::Cutover,
        Phase::Cleanup,
    ];

    fn suffix(self) -> &'static str {
        match self {
            Phase::Validate => "validate",
            Phase::Export => "export",
            Phase::Transfer => "transfer",
            Phase::Rewrite => "rewrite",
            Phase::Import => "import",
            Phase::NetworkAttach => "network",
            Phase::Cutover => "cutover",
            Phase::Cleanup => "cleanup",
        }
    }
}

fn step_name(unit_id: u32, phase: Phase) -> String {
    format!("{}/{}", unit_id, phase.suffix())
}

/// Everything the execution phases need for one unit, assembled during
/// validation and immutable from then on (except the artifacts the
/// phases themselves produce).
struct UnitPlan {
    unit: ComputeUnit,
    target_id: u32,
    storage: Option<String>,
    bindings: BTreeMap<String, String>,
    config: String,
    was_running: bool,
    archive: Option<String>,
    rewritten: Option<String>,
}

enum UnitOutcome {
    Done,
    Failed,
    Cancelled,
}

/// Drives migration tasks through their per-unit state machines.
///
/// One tokio task per migration task; units within a task run strictly
/// serially so both remote hosts see bounded connection pressure and the
/// task log stays readable. All state flows through the injected
/// [`TaskStore`]; nothing global.
pub struct Orchestrator {
    config: Arc<CaravanConfig>,
    store: Arc<dyn TaskStore>,
    sessions: Arc<dyn SessionFactory>,
    inventory: InventoryReader,
    mapper: ResourceMapper,
    cancels: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<CaravanConfig>,
        store: Arc<dyn TaskStore>,
        sessions: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            config,
            store,
            sessions,
            inventory: InventoryReader::new(),
            mapper: ResourceMapper::new(),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Validate and register a migration task, then start its worker.
    /// Returns the task id immediately; progress is observed through the
    /// registry.
    pub fn submit(self: &Arc<Self>, request: MigrationRequest) -> Result<String> {
        self.validate_request(&request)?;
        let steps = plan_steps(&request);
        let task = MigrationTask::new(&request.source_host, &request.target_host, steps);
        let task_id = task.id.clone();
        self.store.create(task)?;
        self.cancels
            .lock()
            .expect("cancel registry lock")
            .insert(task_id.clone(), Arc::new(AtomicBool::new(false)));

        let this = Arc::clone(self);
        let worker_task_id = task_id.clone();
        tokio::spawn(async move {
            this.run(worker_task_id, request).await;
        });
        info!(task = %task_id, "migration task submitted");
        Ok(task_id)
    }

    /// Request cancellation. Honored at the unit's next step boundary;
    /// refused once the task has finished.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let task = self.store.get(task_id)?;
        if task.status.is_terminal() {
            return Err(CaravanError::MigrationRefused(format!(
                "task {} already finished",
                task_id
            )));
        }
        let cancels = self.cancels.lock().expect("cancel registry lock");
        match cancels.get(task_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(task = %task_id, "cancellation requested");
                Ok(())
            }
            None => Err(CaravanError::MigrationRefused(format!(
                "task {} has no running worker",
                task_id
            ))),
        }
    }

    fn validate_request(&self, request: &MigrationRequest) -> Result<()> {
        if request.units.is_empty() {
            return Err(CaravanError::MigrationRefused("no units selected".into()));
        }
        if request.source_host == request.target_host {
            return Err(CaravanError::MigrationRefused(
                "source and target host are the same".into(),
            ));
        }
        for host_name in [&request.source_host, &request.target_host] {
            let host = self.config.host(host_name)?;
            if host.kind != HostKind::Hypervisor {
                return Err(CaravanError::MigrationRefused(format!(
                    "host '{}' is not a hypervisor",
                    host_name
                )));
            }
        }
        for (i, unit) in request.units.iter().enumerate() {
            if request.units[..i].iter().any(|u| u.id == unit.id) {
                return Err(CaravanError::MigrationRefused(format!(
                    "unit {} listed twice",
                    unit.id
                )));
            }
        }
        Ok(())
    }

    fn cancel_requested(&self, task_id: &str) -> bool {
        self.cancels
            .lock()
            .expect("cancel registry lock")
            .get(task_id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn run(self: Arc<Self>, task_id: String, request: MigrationRequest) {
        if let Err(e) = self.drive(&task_id, &request).await {
            error!(task = %task_id, error = %e, "migration task aborted");
            let _ = self
                .store
                .append_log(&task_id, &format!("task aborted: {}", e));
            self.skip_open_steps(&task_id);
            let _ = self.store.set_status(&task_id, TaskStatus::Failed);
        }
        self.cancels
            .lock()
            .expect("cancel registry lock")
            .remove(&task_id);
    }

    async fn drive(&self, task_id: &str, request: &MigrationRequest) -> Result<()> {
        self.store.set_status(task_id, TaskStatus::Running)?;
        self.store.append_log(
            task_id,
            &format!(
                "migrating {} unit(s) from '{}' to '{}' ({})",
                request.units.len(),
                request.source_host,
                request.target_host,
                if request.options.online {
                    "online"
                } else {
                    "offline"
                }
            ),
        )?;

        let source_host = self.config.host(&request.source_host)?.clone();
        let target_host = self.config.host(&request.target_host)?.clone();

        let source = self.sessions.connect(&source_host).await?;
        let target = match self.sessions.connect(&target_host).await {
            Ok(session) => session,
            Err(e) => {
                let _ = source.disconnect().await;
                return Err(e);
            }
        };

        let result = self
            .drive_units(
                task_id,
                request,
                &source_host,
                &target_host,
                source.as_ref(),
                target.as_ref(),
            )
            .await;

        let _ = source.disconnect().await;
        let _ = target.disconnect().await;
        result
    }

    async fn drive_units(
        &self,
        task_id: &str,
        request: &MigrationRequest,
        source_host: &Host,
        target_host: &Host,
        source: &dyn RemoteExec,
        target: &dyn RemoteExec,
    ) -> Result<()> {
        // Planning snapshots. Staleness window is the validation phase
        // only; ids are re-checked by the import itself.
        let source_inventory = self.inventory.list_units(source_host, source).await?;
        let target_inventory = self.inventory.list_units(target_host, target).await?;
        let resources = self.mapper.target_resources(target_host, target).await?;
        let mut arbiter = IdArbiter::new(&target_inventory, self.config.migration.id_floor);

        // Validate the whole batch before executing anything. A unit's
        // validation error fails that unit only; siblings continue.
        let mut plans = Vec::new();
        let mut any_failed = false;
        for spec in &request.units {
            let name = step_name(spec.id, Phase::Validate);
            self.store
                .update_step(task_id, &name, StepStatus::Running, "")?;
            match self
                .validate_unit(
                    task_id,
                    spec,
                    &request.options,
                    &source_inventory,
                    &mut arbiter,
                    &resources,
                    source_host,
                    source,
                    target_host,
                )
                .await
            {
                Ok(plan) => {
                    self.store.update_step(
                        task_id,
                        &name,
                        StepStatus::Success,
                        &format!(
                            "resolved target id {} (storage: {}, {} interface(s))",
                            plan.target_id,
                            plan.storage.as_deref().unwrap_or("keep source"),
                            plan.bindings.len()
                        ),
                    )?;
                    plans.push(plan);
                }
                Err(e) => {
                    warn!(task = %task_id, unit = spec.id, error = %e, "unit failed validation");
                    self.store
                        .update_step(task_id, &name, StepStatus::Failed, &e.to_string())?;
                    self.skip_unit_steps(task_id, spec.id, &Phase::EXECUTION);
                    any_failed = true;
                }
            }
        }

        // Serial execution: both hosts are finite-connection remote
        // targets and the log must stay ordered.
        let mut any_cancelled = false;
        for mut plan in plans {
            if self.cancel_requested(task_id) {
                self.skip_unit_steps(task_id, plan.unit.id, &Phase::EXECUTION);
                self.store.append_log(
                    task_id,
                    &format!("unit {} cancelled before start", plan.unit.id),
                )?;
                any_cancelled = true;
                continue;
            }
            match self
                .run_unit(task_id, &mut plan, request, target_host, source, target)
                .await
            {
                UnitOutcome::Done => {
                    self.store.append_log(
                        task_id,
                        &format!(
                            "unit {} migrated as {} on '{}'",
                            plan.unit.id, plan.target_id, target_host.name
                        ),
                    )?;
                }
                UnitOutcome::Failed => any_failed = true,
                UnitOutcome::Cancelled => any_cancelled = true,
            }
        }

        let final_status = if any_cancelled {
            TaskStatus::Cancelled
        } else if any_failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        self.store
            .append_log(task_id, &format!("task finished: {:?}", final_status))?;
        self.store.set_status(task_id, final_status)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn validate_unit(
        &self,
        task_id: &str,
        spec: &UnitSpec,
        options: &MigrationOptions,
        source_inventory: &[ComputeUnit],
        arbiter: &mut IdArbiter,
        resources: &crate::mapping::TargetResources,
        source_host: &Host,
        source: &dyn RemoteExec,
        target_host: &Host,
    ) -> Result<UnitPlan> {
        let unit = source_inventory
            .iter()
            .find(|u| u.id == spec.id && u.kind == spec.kind)
            .ok_or(CaravanError::UnitNotFound(spec.id))?
            .clone();

        let target_id = match arbiter.resolve(&spec.mapping.id) {
            Ok(id) => id,
            Err(CaravanError::IdentifierConflict(id)) if options.acknowledge_conflicts => {
                self.store.append_log(
                    task_id,
                    &format!(
                        "warning: target id {} is in use; proceeding as acknowledged",
                        id
                    ),
                )?;
                arbiter.acknowledge(id)
            }
            Err(e) => return Err(e),
        };

        let storage = resolve_storage(&spec.mapping, resources)?;
        let bindings = resolve_network(&target_host.name, &unit.nics, &spec.mapping, resources)?;
        let config = self
            .inventory
            .get_config(source_host, source, unit.id, unit.kind)
            .await?;
        let was_running = unit.state == RunState::Running;

        Ok(UnitPlan {
            unit,
            target_id,
            storage,
            bindings,
            config,
            was_running,
            archive: None,
            rewritten: None,
        })
    }

    async fn run_unit(
        &self,
        task_id: &str,
        plan: &mut UnitPlan,
        request: &MigrationRequest,
        target_host: &Host,
        source: &dyn RemoteExec,
        target: &dyn RemoteExec,
    ) -> UnitOutcome {
        let mut cutover_started = false;
        for (index, phase) in Phase::EXECUTION.iter().copied().enumerate() {
            // Cancellation is only honored at step boundaries, and never
            // once cutover has begun: a half-cut-over unit would leave
            // both hosts claiming it.
            if !cutover_started && self.cancel_requested(task_id) {
                self.skip_unit_steps(task_id, plan.unit.id, &Phase::EXECUTION[index..]);
                let _ = self.store.append_log(
                    task_id,
                    &format!(
                        "unit {} cancelled at the {} boundary",
                        plan.unit.id,
                        phase.suffix()
                    ),
                );
                return UnitOutcome::Cancelled;
            }
            if phase == Phase::Cutover {
                cutover_started = true;
            }

            let name = step_name(plan.unit.id, phase);
            if let Err(e) = self
                .store
                .update_step(task_id, &name, StepStatus::Running, "")
            {
                error!(task = %task_id, step = %name, error = %e, "registry update failed");
                return UnitOutcome::Failed;
            }

            let result = match phase {
                Phase::Export => self.export_unit(task_id, plan, &request.options, source).await,
                Phase::Transfer => {
                    self.transfer_unit(plan, source, target, target_host).await
                }
                Phase::Rewrite => self.rewrite_unit(plan),
                Phase::Import => self.import_unit(plan, target).await,
                Phase::NetworkAttach => self.attach_network(plan, target).await,
                Phase::Cutover => self.cutover_unit(plan, &request.options, source, target).await,
                Phase::Cleanup => {
                    self.cleanup_unit(plan, &request.options, source, target).await
                }
                Phase::Validate => unreachable!("validation runs before execution"),
            };

            match result {
                Ok(message) => {
                    let _ = self
                        .store
                        .update_step(task_id, &name, StepStatus::Success, &message);
                }
                Err(e) => {
                    warn!(task = %task_id, unit = plan.unit.id, phase = phase.suffix(), error = %e, "step failed");
                    let _ = self
                        .store
                        .update_step(task_id, &name, StepStatus::Failed, &e.to_string());
                    self.skip_unit_steps(task_id, plan.unit.id, &Phase::EXECUTION[index + 1..]);
                    return UnitOutcome::Failed;
                }
            }
        }
        UnitOutcome::Done
    }

    async fn export_unit(
        &self,
        task_id: &str,
        plan: &mut UnitPlan,
        options: &MigrationOptions,
        source: &dyn RemoteExec,
    ) -> Result<String> {
        let id = plan.unit.id;
        let cli = plan.unit.kind.cli();
        let export_dir = self.config.migration.export_dir.display().to_string();

        let mode = if options.online { "snapshot" } else { "stop" };
        if plan.was_running && !options.online {
            source.exec(&format!("{} stop {}", cli, id)).await?;
            self.store.append_log(
                task_id,
                &format!(
                    "unit {} was running and mode is offline: stopped for export, will auto-restart on target",
                    id
                ),
            )?;
        }

        source.exec(&format!("mkdir -p {}", export_dir)).await?;
        source
            .exec(&format!(
                "vzdump {} --mode {} --compress zstd --dumpdir {} --quiet 1",
                id, mode, export_dir
            ))
            .await?;

        let listed = source
            .exec(&format!(
                "ls -t {}/vzdump-{}-{}-*.{} | head -n 1",
                export_dir,
                plan.unit.kind.api_segment(),
                id,
                match plan.unit.kind {
                    UnitKind::Vm => "vma.zst",
                    UnitKind::Container => "tar.zst",
                }
            ))
            .await?;
        let archive = listed.trim().to_string();
        if archive.is_empty() {
            return Err(CaravanError::MigrationRefused(format!(
                "export produced no archive for unit {}",
                id
            )));
        }
        plan.archive = Some(archive.clone());
        Ok(format!("exported {}", archive))
    }

    async fn transfer_unit(
        &self,
        plan: &UnitPlan,
        source: &dyn RemoteExec,
        target: &dyn RemoteExec,
        target_host: &Host,
    ) -> Result<String> {
        let archive = plan.archive.as_deref().expect("export ran first");
        let export_dir = self.config.migration.export_dir.display().to_string();
        target.exec(&format!("mkdir -p {}", export_dir)).await?;

        // Preferred data plane: the source pushes straight to the target
        // over the fleet's SSH trust, avoiding a double hop through us.
        let direct = format!(
            "scp -o BatchMode=yes -o StrictHostKeyChecking=accept-new {} {}:{}",
            archive,
            target_host.ssh.destination(),
            archive
        );
        match source.exec(&direct).await {
            Ok(_) => Ok(format!("pushed {} host-to-host", archive)),
            Err(CaravanError::Command { stderr, .. }) if direct_unsupported(&stderr) => {
                // No trust between the pair: spool through us, disk-bounded.
                let bytes = self.spooled_transfer(plan, source, target, archive).await?;
                Ok(format!("streamed {} ({} bytes) via spool", archive, bytes))
            }
            Err(CaravanError::Command { exit_code, stderr }) => {
                Err(CaravanError::TransferInterrupted(format!(
                    "direct push exited with status {}: {}",
                    exit_code,
                    stderr.trim()
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn spooled_transfer(
        &self,
        plan: &UnitPlan,
        source: &dyn RemoteExec,
        target: &dyn RemoteExec,
        archive: &str,
    ) -> Result<u64> {
        let spool_dir = self.config.state_dir.join("spool");
        tokio::fs::create_dir_all(&spool_dir).await?;
        let spool = spool_dir.join(format!("{}-{}.archive", uuid::Uuid::new_v4(), plan.unit.id));

        let result = async {
            let mut file = tokio::fs::File::create(&spool).await?;
            let bytes = source
                .stream_command(&format!("cat {}", archive), &mut file)
                .await?;
            file.flush().await?;
            drop(file);
            target
                .upload_file(&spool, Path::new(archive))
                .await
                .map_err(|e| match e {
                    CaravanError::Command { stderr, .. } => {
                        CaravanError::TransferInterrupted(stderr)
                    }
                    other => other,
                })?;
            Ok(bytes)
        }
        .await;

        let _ = tokio::fs::remove_file(&spool).await;
        result
    }

    fn rewrite_unit(&self, plan: &mut UnitPlan) -> Result<String> {
        let rewritten = rewrite_config(
            &plan.config,
            plan.unit.id,
            plan.target_id,
            plan.storage.as_deref(),
            &plan.bindings,
        );
        let bytes = rewritten.len();
        plan.rewritten = Some(rewritten);
        Ok(format!(
            "config rewritten for target id {} ({} bytes)",
            plan.target_id, bytes
        ))
    }

    async fn import_unit(&self, plan: &UnitPlan, target: &dyn RemoteExec) -> Result<String> {
        let archive = plan.archive.as_deref().expect("export ran first");
        let rewritten = plan.rewritten.as_deref().expect("rewrite ran first");
        let id = plan.target_id;
        let storage_flag = plan
            .storage
            .as_deref()
            .map(|pool| format!(" --storage {}", pool))
            .unwrap_or_default();

        let restore = match plan.unit.kind {
            UnitKind::Vm => format!("qmrestore {} {}{}", archive, id, storage_flag),
            UnitKind::Container => format!("pct restore {} {}{}", id, archive, storage_flag),
        };
        target.exec(&restore).await?;

        // The rewritten text, not the archive's embedded copy, is the
        // definition of record on the target.
        let staged = self.stage_local_file(rewritten).await?;
        let installed = target
            .upload_file(&staged, Path::new(&plan.unit.kind.config_path(id)))
            .await;
        let _ = tokio::fs::remove_file(&staged).await;
        installed?;
        Ok(format!("registered unit {} on target", id))
    }

    async fn stage_local_file(&self, contents: &str) -> Result<PathBuf> {
        let spool_dir = self.config.state_dir.join("spool");
        tokio::fs::create_dir_all(&spool_dir).await?;
        let path = spool_dir.join(format!("{}.conf", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, contents).await?;
        Ok(path)
    }

    async fn attach_network(&self, plan: &UnitPlan, target: &dyn RemoteExec) -> Result<String> {
        let rewritten = plan.rewritten.as_deref().expect("rewrite ran first");
        let cli = plan.unit.kind.cli();
        for (nic, bridge) in &plan.bindings {
            // Imports do not always honor inline bridge directives, so the
            // binding is re-applied explicitly.
            let value = config_value(rewritten, nic)
                .unwrap_or_else(|| format!("bridge={}", bridge));
            target
                .exec(&format!(
                    "{} set {} -{} '{}'",
                    cli, plan.target_id, nic, value
                ))
                .await?;
        }
        Ok(format!(
            "verified {} interface binding(s)",
            plan.bindings.len()
        ))
    }

    async fn cutover_unit(
        &self,
        plan: &UnitPlan,
        options: &MigrationOptions,
        source: &dyn RemoteExec,
        target: &dyn RemoteExec,
    ) -> Result<String> {
        let cli = plan.unit.kind.cli();
        if options.online {
            if plan.was_running {
                source.exec(&format!("{} stop {}", cli, plan.unit.id)).await?;
            }
            target
                .exec(&format!("{} start {}", cli, plan.target_id))
                .await?;
            Ok("live handoff complete; unit running on target".into())
        } else if plan.was_running {
            target
                .exec(&format!("{} start {}", cli, plan.target_id))
                .await?;
            Ok("unit was running on source; auto-restarted on target".into())
        } else {
            Ok("offline migration; cutover is a pass-through".into())
        }
    }

    async fn cleanup_unit(
        &self,
        plan: &UnitPlan,
        options: &MigrationOptions,
        source: &dyn RemoteExec,
        target: &dyn RemoteExec,
    ) -> Result<String> {
        let archive = plan.archive.as_deref().expect("export ran first");
        source.exec(&format!("rm -f {}", archive)).await?;
        target.exec(&format!("rm -f {}", archive)).await?;

        if options.delete_source {
            let destroy = match plan.unit.kind {
                UnitKind::Vm => format!("qm destroy {} --purge", plan.unit.id),
                UnitKind::Container => format!("pct destroy {} --purge", plan.unit.id),
            };
            source.exec(&destroy).await?;
            Ok("export artifacts removed; source unit deleted".into())
        } else {
            Ok("export artifacts removed; source unit left intact".into())
        }
    }

    /// Mark the given execution phases of one unit as skipped.
    fn skip_unit_steps(&self, task_id: &str, unit_id: u32, phases: &[Phase]) {
        for phase in phases {
            let name = step_name(unit_id, *phase);
            let _ = self
                .store
                .update_step(task_id, &name, StepStatus::Skipped, "");
        }
    }

    /// After a task-global abort, close out every step still open.
    fn skip_open_steps(&self, task_id: &str) {
        let Ok(task) = self.store.get(task_id) else {
            return;
        };
        for step in task
            .steps
            .iter()
            .filter(|s| !s.status.is_terminal())
        {
            let _ = self
                .store
                .update_step(task_id, &step.name, StepStatus::Skipped, "");
        }
    }
}

fn plan_steps(request: &MigrationRequest) -> Vec<Step> {
    let mut steps = Vec::with_capacity(request.units.len() * Phase::ALL.len());
    for unit in &request.units {
        for phase in Phase::ALL {
            steps.push(Step::new(step_name(unit.id, phase)));
        }
    }
    steps
}

/// Whether a failed direct host-to-host push means "these hosts have no
/// data-plane trust" (fall back to spooling) rather than a genuine
/// mid-transfer drop (surface `TransferInterrupted`).
fn direct_unsupported(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("permission denied")
        || lower.contains("host key verification failed")
        || lower.contains("connection refused")
        || lower.contains("could not resolve")
}

/// Value of a `key: value` line in config text.
fn config_value(config: &str, key: &str) -> Option<String> {
    config.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        (k.trim() == key).then(|| v.trim().to_string())
    })
}

/// Rewrite a unit's configuration text for its destination: substitute
/// the storage pool per the resolved mapping, rebind bridges per NIC, and
/// rename id-derived volume names. `target_storage` of `None` means "keep
/// the source value" and leaves storage references byte-identical.
pub fn rewrite_config(
    config: &str,
    source_id: u32,
    target_id: u32,
    target_storage: Option<&str>,
    bindings: &BTreeMap<String, String>,
) -> String {
    let mut out = String::with_capacity(config.len());
    for line in config.lines() {
        let rewritten = match line.split_once(':') {
            Some((key, value)) if is_volume_key(key.trim()) => {
                rewrite_volume_line(key, value, source_id, target_id, target_storage)
                    .unwrap_or_else(|| line.to_string())
            }
            Some((key, value)) if bindings.contains_key(key.trim()) => {
                rewrite_nic_line(key, value, &bindings[key.trim()])
            }
            _ => line.to_string(),
        };
        out.push_str(&rewritten);
        out.push('\n');
    }
    out
}

fn rewrite_volume_line(
    key: &str,
    value: &str,
    source_id: u32,
    target_id: u32,
    target_storage: Option<&str>,
) -> Option<String> {
    if target_storage.is_none() && source_id == target_id {
        return None; // nothing to change; keep the line byte-identical
    }
    let value = value.trim();
    let mut parts = value.split(',');
    let volume_ref = parts.next()?;
    let rest: Vec<&str> = parts.collect();

    let rebuilt_ref = match volume_ref.split_once(':') {
        Some((pool, volume)) => {
            let pool = target_storage.unwrap_or(pool);
            let volume = rename_volume(volume, source_id, target_id);
            format!("{}:{}", pool, volume)
        }
        // e.g. "none" for an empty cdrom drive
        None => volume_ref.to_string(),
    };

    let mut rebuilt = format!("{}: {}", key, rebuilt_ref);
    for part in rest {
        rebuilt.push(',');
        rebuilt.push_str(part);
    }
    Some(rebuilt)
}

/// Volume names embed the owning unit's id (`vm-100-disk-0`,
/// `subvol-100-disk-0`, `100/vm-100-disk-0.qcow2`); rename them for the
/// destination id.
fn rename_volume(volume: &str, source_id: u32, target_id: u32) -> String {
    if source_id == target_id {
        return volume.to_string();
    }
    volume
        .replace(
            &format!("vm-{}-", source_id),
            &format!("vm-{}-", target_id),
        )
        .replace(
            &format!("subvol-{}-", source_id),
            &format!("subvol-{}-", target_id),
        )
        .replace(&format!("{}/", source_id), &format!("{}/", target_id))
}

fn rewrite_nic_line(key: &str, value: &str, bridge: &str) -> String {
    let mut params: Vec<String> = value
        .trim()
        .split(',')
        .map(|p| p.to_string())
        .collect();
    let mut replaced = false;
    for param in params.iter_mut() {
        if param.starts_with("bridge=") {
            *param = format!("bridge={}", bridge);
            replaced = true;
        }
    }
    if !replaced {
        params.push(format!("bridge={}", bridge));
    }
    format!("{}: {}", key, params.join(","))
}
