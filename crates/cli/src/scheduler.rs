//! Timer-driven job loop
//!
//! One task owns the timeline: it ticks an interval per job and handles
//! control messages from [`SchedulerHandle`]. Job bodies run on the
//! blocking pool. A job never has two running instances; a firing that
//! arrives while the job is still running is dropped, not queued.
//!
//! Emergency and shutdown requests run to completion inside the loop and
//! end it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Scheduled work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    /// Autosave snapshot
    Snapshot,
    /// Scheduled backup when one is due
    Backup,
    /// Memory-tier expiry
    CacheSweep,
    /// Disk-tier orphan and size sweep
    CacheOrphans,
}

impl Job {
    pub const ALL: [Self; 4] = [Self::Snapshot, Self::Backup, Self::CacheSweep, Self::CacheOrphans];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Backup => "backup",
            Self::CacheSweep => "cache-sweep",
            Self::CacheOrphans => "cache-orphans",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Job {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|job| job.as_str() == s)
            .ok_or_else(|| anyhow!("unknown job '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    /// The emergency path has pre-empted the normal cadence
    EmergencyPending,
}

/// Answer to a [`SchedulerHandle::run_now`] request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firing {
    Fired,
    /// The job was already running
    Skipped,
}

/// Job periods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub snapshot: Duration,
    pub backup: Duration,
    pub cache_sweep: Duration,
    pub cache_orphans: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            snapshot: Duration::from_secs(5 * 60),
            backup: Duration::from_secs(60 * 60),
            cache_sweep: Duration::from_secs(60 * 60),
            cache_orphans: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl Schedule {
    pub fn period(&self, job: Job) -> Duration {
        match job {
            Job::Snapshot => self.snapshot,
            Job::Backup => self.backup,
            Job::CacheSweep => self.cache_sweep,
            Job::CacheOrphans => self.cache_orphans,
        }
    }
}

/// Work the scheduler drives; implemented by the service graph
pub trait JobRunner: Send + Sync + 'static {
    /// One run of a periodic job
    fn run(&self, job: Job) -> Result<()>;

    /// Bounded snapshot before abnormal exit
    fn emergency(&self) -> Result<()>;

    /// Last autosave before a normal exit
    fn final_save(&self) -> Result<()>;
}

enum Control {
    RunNow(Job, oneshot::Sender<Firing>),
    Shutdown(oneshot::Sender<Result<()>>),
    Emergency(oneshot::Sender<Result<()>>),
}

type States = Arc<Mutex<HashMap<Job, JobState>>>;

/// Sends control messages to a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    control: mpsc::Sender<Control>,
    states: States,
}

impl SchedulerHandle {
    /// Fire `job` now unless it is already running
    pub async fn run_now(&self, job: Job) -> Result<Firing> {
        let (reply, answer) = oneshot::channel();
        self.send(Control::RunNow(job, reply)).await?;
        answer.await.map_err(|_| anyhow!("scheduler stopped"))
    }

    /// Final autosave, then stop the loop
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, answer) = oneshot::channel();
        self.send(Control::Shutdown(reply)).await?;
        answer.await.map_err(|_| anyhow!("scheduler stopped"))?
    }

    /// Emergency snapshot, then stop the loop
    pub async fn emergency(&self) -> Result<()> {
        let (reply, answer) = oneshot::channel();
        self.send(Control::Emergency(reply)).await?;
        answer.await.map_err(|_| anyhow!("scheduler stopped"))?
    }

    pub fn state(&self, job: Job) -> JobState {
        self.states.lock().get(&job).copied().unwrap_or(JobState::Idle)
    }

    async fn send(&self, control: Control) -> Result<()> {
        self.control
            .send(control)
            .await
            .map_err(|_| anyhow!("scheduler stopped"))
    }
}

pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    schedule: Schedule,
    states: States,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>, schedule: Schedule) -> Self {
        let states = Job::ALL.into_iter().map(|job| (job, JobState::Idle)).collect();
        Self {
            runner,
            schedule,
            states: Arc::new(Mutex::new(states)),
        }
    }

    /// Start the loop on the current runtime
    pub fn spawn(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (control, inbox) = mpsc::channel(16);
        let handle = SchedulerHandle {
            control,
            states: Arc::clone(&self.states),
        };
        let task = tokio::spawn(self.run(inbox));
        (handle, task)
    }

    async fn run(self, mut inbox: mpsc::Receiver<Control>) {
        let mut snapshot = self.ticker(Job::Snapshot);
        let mut backup = self.ticker(Job::Backup);
        let mut cache_sweep = self.ticker(Job::CacheSweep);
        let mut cache_orphans = self.ticker(Job::CacheOrphans);

        info!("Scheduler started: {:?}", self.schedule);

        loop {
            tokio::select! {
                _ = snapshot.tick() => { self.fire(Job::Snapshot); }
                _ = backup.tick() => { self.fire(Job::Backup); }
                _ = cache_sweep.tick() => { self.fire(Job::CacheSweep); }
                _ = cache_orphans.tick() => { self.fire(Job::CacheOrphans); }
                control = inbox.recv() => match control {
                    Some(Control::RunNow(job, reply)) => {
                        let _ = reply.send(self.fire(job));
                    }
                    Some(Control::Shutdown(reply)) => {
                        info!("Scheduler stopping; saving final autosave");
                        let runner = Arc::clone(&self.runner);
                        let result = join_blocking(move || runner.final_save()).await;
                        let _ = reply.send(result);
                        break;
                    }
                    Some(Control::Emergency(reply)) => {
                        warn!("Emergency requested; pre-empting scheduled jobs");
                        self.set_all(JobState::EmergencyPending);
                        let runner = Arc::clone(&self.runner);
                        let result = join_blocking(move || runner.emergency()).await;
                        self.set_all(JobState::Idle);
                        let _ = reply.send(result);
                        break;
                    }
                    None => break,
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// First tick one period from now; late ticks are skipped, not bunched
    fn ticker(&self, job: Job) -> Interval {
        let period = self.schedule.period(job);
        let mut interval = interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    fn fire(&self, job: Job) -> Firing {
        {
            let mut states = self.states.lock();
            if states.get(&job).copied().unwrap_or(JobState::Idle) != JobState::Idle {
                debug!("Skipping {}: previous run still in progress", job);
                return Firing::Skipped;
            }
            states.insert(job, JobState::Running);
        }

        let runner = Arc::clone(&self.runner);
        let states = Arc::clone(&self.states);
        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            match runner.run(job) {
                Ok(()) => debug!("{} finished in {:?}", job, started.elapsed()),
                Err(e) => error!("{} failed: {:#}", job, e),
            }
            let mut states = states.lock();
            if states.get(&job) == Some(&JobState::Running) {
                states.insert(job, JobState::Idle);
            }
        });
        Firing::Fired
    }

    fn set_all(&self, state: JobState) {
        let mut states = self.states.lock();
        for job in Job::ALL {
            states.insert(job, state);
        }
    }
}

async fn join_blocking<F>(work: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| anyhow!("job panicked: {}", e))?
}
