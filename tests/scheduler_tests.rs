// Scheduler firing semantics against the durable job store.
use async_trait::async_trait;
use caravan::orchestrator::{MigrationOptions, MigrationRequest, UnitSpec};
use caravan::scheduler::{
    CronExpr, Dispatcher, JobKind, JobStore, JsonJobStore, ScheduledJob, Scheduler, Trigger,
};
use caravan::{Result, UnitKind};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct CountingDispatcher {
    fired: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Dispatcher for CountingDispatcher {
    async fn dispatch(&self, job: &ScheduledJob) -> Result<()> {
        self.fired.lock().unwrap().push(job.id.clone());
        Ok(())
    }
}

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

fn scheduler(dir: &TempDir) -> (Scheduler, Arc<JsonJobStore>, Arc<Mutex<Vec<String>>>) {
    let store = Arc::new(JsonJobStore::open(dir.path()).unwrap());
    let fired = Arc::new(Mutex::new(Vec::new()));
    let dispatcher = Arc::new(CountingDispatcher {
        fired: Arc::clone(&fired),
    });
    let scheduler = Scheduler::new(store.clone() as Arc<dyn JobStore>, dispatcher, 30);
    (scheduler, store, fired)
}

fn hourly_job(created_at: DateTime<Utc>) -> ScheduledJob {
    let mut job = ScheduledJob::new(
        JobKind::ConfigBackup,
        Trigger::Cron {
            expr: CronExpr::parse("0 * * * *").unwrap(),
        },
        vec!["pve1".to_string()],
        None,
    );
    job.created_at = created_at;
    job
}

async fn settle() {
    // let spawned dispatch tasks run
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn jittered_ticks_never_double_fire_one_due_time() {
    let dir = TempDir::new().unwrap();
    let (scheduler, store, fired) = scheduler(&dir);
    let job = hourly_job(at(2026, 5, 1, 9, 30));
    let id = job.id.clone();
    store.add(job).unwrap();

    // two ticks land in the same due window
    scheduler.tick_once(at(2026, 5, 1, 10, 0)).await.unwrap();
    scheduler.tick_once(at(2026, 5, 1, 10, 0)).await.unwrap();
    scheduler.tick_once(at(2026, 5, 1, 10, 29)).await.unwrap();
    settle().await;
    assert_eq!(fired.lock().unwrap().len(), 1);

    // the next due time fires exactly once more
    scheduler.tick_once(at(2026, 5, 1, 11, 2)).await.unwrap();
    settle().await;
    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 2);
    assert!(fired.iter().all(|fired_id| fired_id == &id));
}

#[tokio::test]
async fn one_time_jobs_self_disable_after_firing() {
    let dir = TempDir::new().unwrap();
    let (scheduler, store, fired) = scheduler(&dir);
    let job = ScheduledJob::new(
        JobKind::HealthScan,
        Trigger::At {
            when: at(2026, 5, 1, 12, 0),
        },
        vec!["pve1".to_string()],
        None,
    );
    let id = job.id.clone();
    store.add(job).unwrap();

    scheduler.tick_once(at(2026, 5, 1, 11, 0)).await.unwrap();
    settle().await;
    assert!(fired.lock().unwrap().is_empty());

    scheduler.tick_once(at(2026, 5, 1, 12, 1)).await.unwrap();
    settle().await;
    assert_eq!(fired.lock().unwrap().len(), 1);
    assert!(!store.get(&id).unwrap().enabled);

    // never again, no matter how many ticks pass
    scheduler.tick_once(at(2026, 5, 1, 13, 0)).await.unwrap();
    scheduler.tick_once(at(2026, 6, 1, 12, 0)).await.unwrap();
    settle().await;
    assert_eq!(fired.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn disabled_jobs_do_not_fire_but_keep_their_row() {
    let dir = TempDir::new().unwrap();
    let (scheduler, store, fired) = scheduler(&dir);
    let job = hourly_job(at(2026, 5, 1, 9, 30));
    let id = job.id.clone();
    store.add(job).unwrap();
    store.set_enabled(&id, false).unwrap();

    scheduler.tick_once(at(2026, 5, 1, 10, 5)).await.unwrap();
    settle().await;
    assert!(fired.lock().unwrap().is_empty());

    // re-enabling picks the schedule back up
    store.set_enabled(&id, true).unwrap();
    scheduler.tick_once(at(2026, 5, 1, 11, 5)).await.unwrap();
    settle().await;
    assert_eq!(fired.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn watermark_survives_a_store_reopen() {
    let dir = TempDir::new().unwrap();
    let id;
    {
        let (scheduler, store, fired) = scheduler(&dir);
        let job = hourly_job(at(2026, 5, 1, 9, 30));
        id = job.id.clone();
        store.add(job).unwrap();
        scheduler.tick_once(at(2026, 5, 1, 10, 3)).await.unwrap();
        settle().await;
        assert_eq!(fired.lock().unwrap().len(), 1);
    }

    let reopened = JsonJobStore::open(dir.path()).unwrap();
    let job = reopened.get(&id).unwrap();
    assert_eq!(job.last_fired_at, Some(at(2026, 5, 1, 10, 0)));
    // the persisted watermark still guards the already-claimed due time
    assert_eq!(job.due(at(2026, 5, 1, 10, 45)), None);
}

#[tokio::test]
async fn migration_payloads_round_trip_through_the_store() {
    let dir = TempDir::new().unwrap();
    let request = MigrationRequest {
        source_host: "pve1".to_string(),
        target_host: "pve2".to_string(),
        units: vec![UnitSpec {
            id: 100,
            kind: UnitKind::Vm,
            mapping: Default::default(),
        }],
        options: MigrationOptions {
            online: true,
            ..Default::default()
        },
    };
    let job = ScheduledJob::new(
        JobKind::Migration,
        Trigger::parse("2026-09-01T03:00:00Z").unwrap(),
        vec!["pve1".to_string(), "pve2".to_string()],
        Some(request),
    );
    let id = job.id.clone();
    {
        let store = JsonJobStore::open(dir.path()).unwrap();
        store.add(job).unwrap();
    }

    // the request reconstructs exactly from the persisted payload
    let reopened = JsonJobStore::open(dir.path()).unwrap();
    let restored = reopened.get(&id).unwrap();
    let payload = restored.payload.expect("payload survives persistence");
    assert_eq!(payload.source_host, "pve1");
    assert_eq!(payload.units.len(), 1);
    assert_eq!(payload.units[0].id, 100);
    assert!(payload.options.online);
    assert!(matches!(restored.trigger, Trigger::At { .. }));
}
