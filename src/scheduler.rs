use crate::config::CaravanConfig;
use crate::host::HostKind;
use crate::orchestrator::{MigrationRequest, Orchestrator};
use crate::remote::SessionFactory;
use crate::{CaravanError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// One field of a cron expression, expanded to its matching values.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    any: bool,
    values: BTreeSet<u8>,
}

impl CronField {
    fn parse(text: &str, min: u8, max: u8) -> Result<Self> {
        if text == "*" {
            return Ok(Self {
                any: true,
                values: BTreeSet::new(),
            });
        }
        let mut values = BTreeSet::new();
        for component in text.split(',') {
            let (base, step) = match component.split_once('/') {
                Some((base, step)) => {
                    let step: u8 = step
                        .parse()
                        .map_err(|_| CaravanError::InvalidTrigger(text.to_string()))?;
                    if step == 0 {
                        return Err(CaravanError::InvalidTrigger(text.to_string()));
                    }
                    (base, step)
                }
                None => (component, 1),
            };
            let (start, end) = if base == "*" {
                (min, max)
            } else if let Some((a, b)) = base.split_once('-') {
                let a: u8 = a
                    .parse()
                    .map_err(|_| CaravanError::InvalidTrigger(text.to_string()))?;
                let b: u8 = b
                    .parse()
                    .map_err(|_| CaravanError::InvalidTrigger(text.to_string()))?;
                (a, b)
            } else {
                let a: u8 = base
                    .parse()
                    .map_err(|_| CaravanError::InvalidTrigger(text.to_string()))?;
                // a bare value with a step ("5/15") ranges to the max
                if step > 1 { (a, max) } else { (a, a) }
            };
            if start < min || end > max || start > end {
                return Err(CaravanError::InvalidTrigger(text.to_string()));
            }
            let mut v = start;
            while v <= end {
                values.insert(v);
                v = match v.checked_add(step) {
                    Some(next) => next,
                    None => break,
                };
            }
        }
        Ok(Self { any: false, values })
    }

    fn matches(&self, value: u8) -> bool {
        self.any || self.values.contains(&value)
    }
}

/// A 5-field cron expression (minute hour day-of-month month
/// day-of-week), minute resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpr {
    text: String,
    minute: CronField,
    hour: CronField,
    dom: CronField,
    month: CronField,
    dow: CronField,
}

impl CronExpr {
    pub fn parse(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CaravanError::InvalidTrigger(text.to_string()));
        }
        Ok(Self {
            text: fields.join(" "),
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            dom: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            dow: CronField::parse(fields[4], 0, 7)?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom = self.dom.matches(t.day() as u8);
        // cron treats both 0 and 7 as Sunday
        let weekday = t.weekday().num_days_from_sunday() as u8;
        let dow = self.dow.matches(weekday) || (weekday == 0 && self.dow.matches(7));
        // standard cron rule: with both fields restricted, either matches
        match (self.dom.any, self.dow.any) {
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }

    /// First matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        let limit = after + Duration::days(366 * 4);
        while t <= limit {
            if !self.month.matches(t.month() as u8) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.day_matches(&t) {
                t = (t + Duration::days(1)).with_hour(0)?.with_minute(0)?;
                continue;
            }
            if !self.hour.matches(t.hour() as u8) {
                t = (t + Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if !self.minute.matches(t.minute() as u8) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl TryFrom<String> for CronExpr {
    type Error = CaravanError;

    fn try_from(text: String) -> Result<Self> {
        CronExpr::parse(&text)
    }
}

impl From<CronExpr> for String {
    fn from(expr: CronExpr) -> Self {
        expr.text
    }
}

/// When a job fires: on a recurring cron pattern, or once at a fixed
/// instant. An explicit tagged union; the trigger kind is never inferred
/// from string shape past the parse boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Trigger {
    Cron { expr: CronExpr },
    At { when: DateTime<Utc> },
}

impl Trigger {
    /// Parse user input: a full ISO-8601 datetime is a one-time trigger,
    /// a 5-field pattern is cron. Anything else is rejected here, at the
    /// boundary.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Ok(when) = DateTime::parse_from_rfc3339(input) {
            return Ok(Trigger::At {
                when: when.with_timezone(&Utc),
            });
        }
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
            return Ok(Trigger::At {
                when: Utc.from_utc_datetime(&naive),
            });
        }
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M") {
            return Ok(Trigger::At {
                when: Utc.from_utc_datetime(&naive),
            });
        }
        CronExpr::parse(input).map(|expr| Trigger::Cron { expr })
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Cron { expr } => write!(f, "cron '{}'", expr.as_str()),
            Trigger::At { when } => write!(f, "once at {}", when.format("%Y-%m-%dT%H:%M:%SZ")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    ConfigBackup,
    HealthScan,
    Migration,
}

/// A persisted schedule row. Migration jobs carry a serialized copy of
/// the request; live inventory is refetched at fire time since it may
/// have drifted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub kind: JobKind,
    pub trigger: Trigger,
    pub enabled: bool,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub payload: Option<MigrationRequest>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn new(
        kind: JobKind,
        trigger: Trigger,
        hosts: Vec<String>,
        payload: Option<MigrationRequest>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            trigger,
            enabled: true,
            hosts,
            payload,
            created_at: Utc::now(),
            last_fired_at: None,
        }
    }

    /// The due time this job should fire for, if one has passed.
    pub fn due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        match &self.trigger {
            Trigger::At { when } => {
                (self.last_fired_at.is_none() && *when <= now).then_some(*when)
            }
            Trigger::Cron { expr } => {
                let basis = self.last_fired_at.unwrap_or(self.created_at);
                let mut due = expr.next_after(basis).filter(|due| *due <= now)?;
                // A backlog (e.g. the daemon was down for hours) collapses
                // into one fire for the latest missed slot, not a replay of
                // every slot in the gap.
                while let Some(next) = expr.next_after(due).filter(|next| *next <= now) {
                    due = next;
                }
                Some(due)
            }
        }
    }
}

/// Storage port for schedule rows.
pub trait JobStore: Send + Sync {
    fn add(&self, job: ScheduledJob) -> Result<()>;
    fn get(&self, id: &str) -> Result<ScheduledJob>;
    fn list(&self) -> Result<Vec<ScheduledJob>>;
    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()>;
    fn remove(&self, id: &str) -> Result<()>;
    /// Atomically claim one fire: advances the watermark to `due` and
    /// self-disables one-time jobs, in a single store operation. Returns
    /// false when another tick already claimed this due time (or the job
    /// was disabled meanwhile), which is what makes dispatch idempotent
    /// under ticker jitter.
    fn claim_fire(&self, id: &str, due: DateTime<Utc>) -> Result<bool>;
}

/// One JSON document per job under `<state_dir>/jobs/`.
pub struct JsonJobStore {
    dir: PathBuf,
    jobs: RwLock<HashMap<String, ScheduledJob>>,
}

impl JsonJobStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join("jobs");
        fs::create_dir_all(&dir)?;
        let mut jobs = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            match serde_json::from_str::<ScheduledJob>(&text) {
                Ok(job) => {
                    jobs.insert(job.id.clone(), job);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable job record")
                }
            }
        }
        Ok(Self {
            dir,
            jobs: RwLock::new(jobs),
        })
    }

    fn persist(&self, job: &ScheduledJob) -> Result<()> {
        let path = self.dir.join(format!("{}.json", job.id));
        fs::write(path, serde_json::to_string_pretty(job)?)?;
        Ok(())
    }
}

impl JobStore for JsonJobStore {
    fn add(&self, job: ScheduledJob) -> Result<()> {
        let mut jobs = self.jobs.write().expect("job store lock");
        self.persist(&job)?;
        info!(job = %job.id, kind = ?job.kind, trigger = %job.trigger, "job scheduled");
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<ScheduledJob> {
        let jobs = self.jobs.read().expect("job store lock");
        jobs.get(id)
            .cloned()
            .ok_or_else(|| CaravanError::JobNotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<ScheduledJob>> {
        let jobs = self.jobs.read().expect("job store lock");
        let mut all: Vec<ScheduledJob> = jobs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut jobs = self.jobs.write().expect("job store lock");
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| CaravanError::JobNotFound(id.to_string()))?;
        job.enabled = enabled;
        let job = job.clone();
        self.persist(&job)
    }

    fn remove(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.write().expect("job store lock");
        jobs.remove(id)
            .ok_or_else(|| CaravanError::JobNotFound(id.to_string()))?;
        let _ = fs::remove_file(self.dir.join(format!("{}.json", id)));
        Ok(())
    }

    fn claim_fire(&self, id: &str, due: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.write().expect("job store lock");
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| CaravanError::JobNotFound(id.to_string()))?;
        if !job.enabled || job.last_fired_at.is_some_and(|last| last >= due) {
            return Ok(false);
        }
        job.last_fired_at = Some(due);
        if matches!(job.trigger, Trigger::At { .. }) {
            // one-time jobs never re-fire
            job.enabled = false;
        }
        let job = job.clone();
        self.persist(&job)?;
        Ok(true)
    }
}

/// Receives claimed fires. The dispatch table over job kinds lives
/// behind this seam so tests can observe firing without remote hosts.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, job: &ScheduledJob) -> Result<()>;
}

/// Single background ticker over the job store. Fires are claimed
/// through the watermark and then dispatched on their own tokio task so
/// a slow fire can never stall the ticker or other jobs.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<dyn Dispatcher>,
    tick: std::time::Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<dyn Dispatcher>,
        tick_seconds: u64,
    ) -> Self {
        Self {
            store,
            dispatcher,
            tick: std::time::Duration::from_secs(tick_seconds.max(1)),
        }
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_seconds = self.tick.as_secs(), "scheduler ticker started");
        loop {
            interval.tick().await;
            if let Err(e) = self.tick_once(Utc::now()).await {
                warn!(error = %e, "scheduler tick failed");
            }
        }
    }

    /// One scan over the enabled jobs. Public so tests can drive ticks
    /// with a controlled clock.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<()> {
        for job in self.store.list()? {
            let Some(due) = job.due(now) else { continue };
            if !self.store.claim_fire(&job.id, due)? {
                continue;
            }
            // Re-read so the dispatched copy carries the updated
            // watermark; disabling a job mid-fire does not cancel this.
            let claimed = self.store.get(&job.id)?;
            info!(job = %claimed.id, kind = ?claimed.kind, due = %due, "dispatching job");
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                if let Err(e) = dispatcher.dispatch(&claimed).await {
                    error!(job = %claimed.id, error = %e, "job dispatch failed");
                }
            });
        }
        Ok(())
    }
}

/// Production dispatch table: migrations re-enter the orchestrator
/// exactly as an immediate request would; config backups stream the
/// host's config tree into the local backup directory; health scans run
/// a fixed command battery and file a report.
pub struct FleetDispatcher {
    config: Arc<CaravanConfig>,
    sessions: Arc<dyn SessionFactory>,
    orchestrator: Arc<Orchestrator>,
}

impl FleetDispatcher {
    pub fn new(
        config: Arc<CaravanConfig>,
        sessions: Arc<dyn SessionFactory>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            config,
            sessions,
            orchestrator,
        }
    }

    pub async fn backup_host(&self, host_name: &str) -> Result<PathBuf> {
        let host = self.config.host(host_name)?;
        let session = self.sessions.connect(host).await?;

        let backup_dir = self.config.state_dir.join("backups");
        tokio::fs::create_dir_all(&backup_dir).await?;
        let path = backup_dir.join(format!(
            "{}-{}.tar.gz",
            host.name,
            Utc::now().format("%Y%m%d-%H%M%S")
        ));

        let tree = match host.kind {
            HostKind::Hypervisor => "/etc/pve /etc/network/interfaces",
            HostKind::Backup => "/etc/proxmox-backup",
        };
        let result = async {
            let mut file = tokio::fs::File::create(&path).await?;
            let bytes = session
                .stream_command(&format!("tar czf - {} 2>/dev/null", tree), &mut file)
                .await?;
            file.flush().await?;
            info!(host = %host.name, path = %path.display(), bytes, "config backup written");
            Ok(path.clone())
        }
        .await;
        let _ = session.disconnect().await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&path).await;
        }
        result
    }

    pub async fn scan_host(&self, host_name: &str) -> Result<PathBuf> {
        let host = self.config.host(host_name)?;
        let session = self.sessions.connect(host).await?;

        let scan_dir = self.config.state_dir.join("scans");
        tokio::fs::create_dir_all(&scan_dir).await?;
        let path = scan_dir.join(format!(
            "{}-{}.txt",
            host.name,
            Utc::now().format("%Y%m%d-%H%M%S")
        ));

        let battery = [
            "uptime",
            "df -hP",
            "free -m",
            "systemctl --failed --no-legend",
        ];
        let mut report = String::new();
        let mut findings = 0usize;
        for command in battery {
            report.push_str(&format!("$ {}\n", command));
            match session.exec(command).await {
                Ok(output) => {
                    if command.starts_with("systemctl") {
                        findings += output.lines().filter(|l| !l.trim().is_empty()).count();
                    }
                    report.push_str(&output);
                }
                Err(e) => report.push_str(&format!("(failed: {})\n", e)),
            }
            report.push('\n');
        }
        let _ = session.disconnect().await;

        tokio::fs::write(&path, &report).await?;
        if findings > 0 {
            warn!(host = %host.name, failed_units = findings, "health scan found failed services");
        } else {
            info!(host = %host.name, path = %path.display(), "health scan clean");
        }
        Ok(path)
    }
}

#[async_trait]
impl Dispatcher for FleetDispatcher {
    async fn dispatch(&self, job: &ScheduledJob) -> Result<()> {
        match job.kind {
            JobKind::Migration => {
                let request = job.payload.clone().ok_or_else(|| {
                    CaravanError::Config(format!("migration job {} has no payload", job.id))
                })?;
                // Hand off exactly as an immediate request; progress is
                // observed through the task registry like any other task.
                let task_id = self.orchestrator.submit(request)?;
                info!(job = %job.id, task = %task_id, "deferred migration submitted");
                Ok(())
            }
            JobKind::ConfigBackup => {
                for host in &job.hosts {
                    self.backup_host(host).await?;
                }
                Ok(())
            }
            JobKind::HealthScan => {
                for host in &job.hosts {
                    self.scan_host(host).await?;
                }
                Ok(())
            }
        }
    }
}
