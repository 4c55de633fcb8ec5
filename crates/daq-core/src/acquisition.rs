//! AcquisitionController - single-flight acquisition state machine
//!
//! One controller fronts one slow device operation (an exposure, a dark-frame
//! correction pass) and is the only writer of that operation's status channel.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  arm   ┌───────┐  job task   ┌───────────┐
//! │ Idle │───────▶│ Armed │────────────▶│ Acquiring │
//! └──────┘        └───────┘             └─────┬─────┘
//!    ▲                                        │
//!    │       waiters notified          ┌──────┴──────┐
//!    └─────────────────────────────────│ Done / Error│
//!                                      └─────────────┘
//! ```
//!
//! # Single flight
//!
//! The first caller of [`AcquisitionController::arm_and_wait`] starts a job in
//! its own task. Callers arriving while that job is in flight do not start a
//! second one; they wait on the same result channel and receive a clone of the
//! same [`CompletionResult`], success or failure. The guard is one in-flight
//! slot per controller, not a counter.
//!
//! The status channel is committed back to its done value *before* waiters are
//! released, so a falling-edge watcher registered ahead of the arm has always
//! fired by the time `arm_and_wait` returns. A waiter that stops waiting
//! (timeout, dropped future) never cancels the job.

use crate::channel::{ChannelStore, ChannelValue};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Detector state label published while a job runs.
pub const STATE_ACQUIRE: &str = "Acquire";
/// Detector state label published after a successful job.
pub const STATE_IDLE: &str = "Idle";
/// Detector state label published after a failed job.
pub const STATE_ERROR: &str = "Error";

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    /// No job in flight
    Idle,
    /// Job accepted, task not yet running
    Armed,
    /// Work in progress
    Acquiring,
    /// Work finished, waiters about to be released
    Done,
    /// Work failed, waiters about to be released
    Error,
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "idle"),
            AcquisitionState::Armed => write!(f, "armed"),
            AcquisitionState::Acquiring => write!(f, "acquiring"),
            AcquisitionState::Done => write!(f, "done"),
            AcquisitionState::Error => write!(f, "error"),
        }
    }
}

/// Request to drive a status channel to a value.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionRequest {
    /// Status channel (full or prefix-relative name)
    pub channel: String,
    /// Desired value
    pub value: ChannelValue,
}

impl AcquisitionRequest {
    /// Build a request.
    pub fn new(channel: impl Into<String>, value: impl Into<ChannelValue>) -> Self {
        Self {
            channel: channel.into(),
            value: value.into(),
        }
    }
}

/// Outcome of one job, identical for every waiter of that job.
///
/// `job_id == 0` means no job ran (an idle request on an idle controller).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    /// Job identifier, starting at 1 per controller
    pub job_id: u64,
    /// Full status channel name
    pub channel: String,
    /// Value written on completion
    pub value: ChannelValue,
    /// Time spent in the job
    pub elapsed: Duration,
}

/// Result handed to every waiter.
pub type CompletionResult = AppResult<Completion>;

/// The slow operation a controller runs once per job.
#[async_trait]
pub trait AcquisitionWork: Send + Sync {
    /// Perform the work. Errors become `AcquisitionFailure` for every waiter.
    async fn run(&self, job_id: u64, store: &ChannelStore) -> AppResult<()>;
}

/// Status channel wiring for a controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Channel owned by the controller
    pub status_channel: String,
    /// Value while a job runs
    pub active: ChannelValue,
    /// Value when idle
    pub done: ChannelValue,
    /// Optional detector-state enum channel (`Idle`/`Acquire`/`Error` labels)
    pub state_channel: Option<String>,
}

impl ControllerConfig {
    /// Wire a status channel with its active and done values.
    pub fn new(
        status_channel: impl Into<String>,
        active: impl Into<ChannelValue>,
        done: impl Into<ChannelValue>,
    ) -> Self {
        Self {
            status_channel: status_channel.into(),
            active: active.into(),
            done: done.into(),
            state_channel: None,
        }
    }

    /// Also publish detector state labels to `channel`.
    pub fn with_state_channel(mut self, channel: impl Into<String>) -> Self {
        self.state_channel = Some(channel.into());
        self
    }
}

struct InFlight {
    job_id: u64,
    rx: watch::Receiver<Option<CompletionResult>>,
}

struct Slot {
    state: AcquisitionState,
    in_flight: Option<InFlight>,
}

struct ControllerInner {
    name: String,
    store: ChannelStore,
    config: ControllerConfig,
    work: Arc<dyn AcquisitionWork>,
    slot: Mutex<Slot>,
    next_job: AtomicU64,
    jobs_started: AtomicU64,
    coalesced: AtomicU64,
}

enum Armed {
    Idle(Completion),
    Job {
        job_id: u64,
        rx: watch::Receiver<Option<CompletionResult>>,
    },
}

/// Single-flight controller for one status channel.
///
/// Cheap to clone; clones share the in-flight slot.
#[derive(Clone)]
pub struct AcquisitionController {
    inner: Arc<ControllerInner>,
}

impl std::fmt::Debug for AcquisitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionController")
            .field("name", &self.inner.name)
            .field("status_channel", &self.inner.config.status_channel)
            .field("state", &self.state())
            .finish()
    }
}

impl AcquisitionController {
    /// Create a controller. Channel names are resolved and values type-checked here.
    pub fn new(
        name: impl Into<String>,
        store: ChannelStore,
        config: ControllerConfig,
        work: Arc<dyn AcquisitionWork>,
    ) -> AppResult<Self> {
        let status_channel = store.full_name(&config.status_channel)?;
        let active = store.normalize(&status_channel, config.active)?;
        let done = store.normalize(&status_channel, config.done)?;
        if active == done {
            return Err(DaqError::Configuration(format!(
                "Status channel '{}' needs distinct active and done values",
                status_channel
            )));
        }
        let state_channel = config
            .state_channel
            .map(|ch| store.full_name(&ch))
            .transpose()?;

        Ok(Self {
            inner: Arc::new(ControllerInner {
                name: name.into(),
                store,
                config: ControllerConfig {
                    status_channel,
                    active,
                    done,
                    state_channel,
                },
                work,
                slot: Mutex::new(Slot {
                    state: AcquisitionState::Idle,
                    in_flight: None,
                }),
                next_job: AtomicU64::new(0),
                jobs_started: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        })
    }

    /// Controller name, used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Full name of the owned status channel
    pub fn status_channel(&self) -> &str {
        &self.inner.config.status_channel
    }

    /// Status value while a job runs
    pub fn active_value(&self) -> ChannelValue {
        self.inner.config.active.clone()
    }

    /// Status value when idle
    pub fn done_value(&self) -> ChannelValue {
        self.inner.config.done.clone()
    }

    /// Current state
    pub fn state(&self) -> AcquisitionState {
        self.inner.slot.lock().state
    }

    /// Whether a job is in flight
    pub fn is_busy(&self) -> bool {
        self.inner.slot.lock().in_flight.is_some()
    }

    /// Jobs started over the controller's lifetime
    pub fn jobs_started(&self) -> u64 {
        self.inner.jobs_started.load(Ordering::SeqCst)
    }

    /// Callers that joined an already running job
    pub fn coalesced_waiters(&self) -> u64 {
        self.inner.coalesced.load(Ordering::SeqCst)
    }

    /// Start (or join) a job and wait for its result.
    pub async fn arm_and_wait(&self, request: AcquisitionRequest) -> CompletionResult {
        self.arm_and_wait_timeout(request, None).await
    }

    /// As [`arm_and_wait`](Self::arm_and_wait), giving up after `timeout`.
    ///
    /// Timing out only affects this caller.
    pub async fn arm_and_wait_timeout(
        &self,
        request: AcquisitionRequest,
        timeout: Option<Duration>,
    ) -> CompletionResult {
        let (job_id, rx) = match self.arm(request)? {
            Armed::Idle(completion) => return Ok(completion),
            Armed::Job { job_id, rx } => (job_id, rx),
        };

        let wait = Self::wait_for(job_id, rx);
        match timeout {
            Some(after) => tokio::time::timeout(after, wait).await.map_err(|_| {
                warn!(
                    controller = %self.inner.name,
                    job_id,
                    timeout_ms = after.as_millis(),
                    "Waiter timed out; job keeps running"
                );
                DaqError::timeout(format!("{} job {}", self.status_channel(), job_id), after)
            })?,
            None => wait.await,
        }
    }

    fn arm(&self, request: AcquisitionRequest) -> AppResult<Armed> {
        let inner = &self.inner;
        let channel = inner.store.full_name(&request.channel)?;
        if channel != inner.config.status_channel {
            return Err(DaqError::Configuration(format!(
                "Controller '{}' drives '{}', not '{}'",
                inner.name, inner.config.status_channel, channel
            )));
        }
        let value = inner.store.normalize(&channel, request.value)?;

        let mut slot = inner.slot.lock();

        if let Some(flight) = &slot.in_flight {
            if value != inner.config.active {
                return Err(DaqError::Configuration(format!(
                    "Conflicting request {} on '{}' while job {} is in flight",
                    value, channel, flight.job_id
                )));
            }
            let waiters = inner.coalesced.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(
                controller = %inner.name,
                job_id = flight.job_id,
                coalesced = waiters,
                "Busy: coalescing onto in-flight job"
            );
            return Ok(Armed::Job {
                job_id: flight.job_id,
                rx: flight.rx.clone(),
            });
        }

        if value == inner.config.done {
            debug!(controller = %inner.name, "Idle request on idle controller");
            return Ok(Armed::Idle(Completion {
                job_id: 0,
                channel,
                value,
                elapsed: Duration::ZERO,
            }));
        }
        if value != inner.config.active {
            return Err(DaqError::Configuration(format!(
                "Controller '{}' cannot drive '{}' to {}",
                inner.name, channel, value
            )));
        }

        let job_id = inner.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = watch::channel(None);
        slot.state = AcquisitionState::Armed;
        slot.in_flight = Some(InFlight {
            job_id,
            rx: rx.clone(),
        });
        drop(slot);

        inner.jobs_started.fetch_add(1, Ordering::SeqCst);
        info!(controller = %inner.name, job_id, "Armed, starting acquisition job");

        tokio::spawn(self.clone().run_job(job_id, tx));
        Ok(Armed::Job { job_id, rx })
    }

    async fn wait_for(
        job_id: u64,
        mut rx: watch::Receiver<Option<CompletionResult>>,
    ) -> CompletionResult {
        let lost = || DaqError::AcquisitionFailure {
            job_id,
            message: "job ended without reporting a result".to_string(),
        };
        match rx.wait_for(Option::is_some).await {
            Ok(result) => result.clone().unwrap_or_else(|| Err(lost())),
            Err(_) => Err(lost()),
        }
    }

    async fn run_job(self, job_id: u64, tx: watch::Sender<Option<CompletionResult>>) {
        let guard = JobGuard {
            inner: self.inner.clone(),
            job_id,
            tx,
        };
        let inner = &self.inner;
        let status = &inner.config.status_channel;
        let started = Instant::now();

        self.set_state(AcquisitionState::Acquiring);
        let outcome = match inner.store.commit(status, inner.config.active.clone()) {
            Ok(()) => {
                self.publish_state(STATE_ACQUIRE);
                inner.work.run(job_id, &inner.store).await
            }
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        // The device reads idle again whatever happened.
        let settled = inner.store.commit(status, inner.config.done.clone());

        let result = match outcome.and(settled) {
            Ok(()) => {
                self.set_state(AcquisitionState::Done);
                self.publish_state(STATE_IDLE);
                info!(
                    controller = %inner.name,
                    job_id,
                    elapsed_ms = elapsed.as_millis(),
                    "Acquisition job complete"
                );
                Ok(Completion {
                    job_id,
                    channel: status.clone(),
                    value: inner.config.done.clone(),
                    elapsed,
                })
            }
            Err(e) => {
                self.set_state(AcquisitionState::Error);
                self.publish_state(STATE_ERROR);
                error!(controller = %inner.name, job_id, error = %e, "Acquisition job failed");
                Err(match e {
                    failure @ DaqError::AcquisitionFailure { .. } => failure,
                    other => DaqError::AcquisitionFailure {
                        job_id,
                        message: other.to_string(),
                    },
                })
            }
        };

        self.finish(job_id, &guard.tx, result);
    }

    fn finish(
        &self,
        job_id: u64,
        tx: &watch::Sender<Option<CompletionResult>>,
        result: CompletionResult,
    ) {
        {
            let mut slot = self.inner.slot.lock();
            if slot.in_flight.as_ref().is_some_and(|f| f.job_id == job_id) {
                slot.in_flight = None;
                slot.state = AcquisitionState::Idle;
            }
        }
        // Stored even when every waiter already gave up.
        tx.send_replace(Some(result));
    }

    fn set_state(&self, state: AcquisitionState) {
        let mut slot = self.inner.slot.lock();
        debug!(controller = %self.inner.name, from = %slot.state, to = %state, "State change");
        slot.state = state;
    }

    fn publish_state(&self, label: &str) {
        if let Some(channel) = &self.inner.config.state_channel {
            if let Err(e) = self.inner.store.commit(channel, label) {
                warn!(channel = %channel, error = %e, "Could not publish detector state");
            }
        }
    }
}

/// Settles a job whose task ended without calling `finish` (a panic in the work).
///
/// The status channel goes back to its done value and the detector state reads
/// `Error` before waiters receive the failure.
struct JobGuard {
    inner: Arc<ControllerInner>,
    job_id: u64,
    tx: watch::Sender<Option<CompletionResult>>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        {
            let mut slot = self.inner.slot.lock();
            if !slot
                .in_flight
                .as_ref()
                .is_some_and(|f| f.job_id == self.job_id)
            {
                return;
            }
            slot.in_flight = None;
            slot.state = AcquisitionState::Idle;
        }

        let inner = &self.inner;
        error!(controller = %inner.name, job_id = self.job_id, "Job task ended without a result");
        if let Err(e) = inner
            .store
            .commit(&inner.config.status_channel, inner.config.done.clone())
        {
            warn!(controller = %inner.name, error = %e, "Could not reset status channel");
        }
        if let Some(channel) = &inner.config.state_channel {
            if let Err(e) = inner.store.commit(channel, STATE_ERROR) {
                warn!(channel = %channel, error = %e, "Could not publish detector state");
            }
        }
        self.tx.send_replace(Some(Err(DaqError::AcquisitionFailure {
            job_id: self.job_id,
            message: "job ended without reporting a result".to_string(),
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelSpec;
    use crate::watcher::{falling_edge, CompletionWatcher};
    use std::sync::atomic::AtomicBool;
    use tracing_test::traced_test;

    /// Sleeps, optionally failing the first `fail_first` runs.
    struct SleepWork {
        delay: Duration,
        fail_first: u64,
        runs: AtomicU64,
    }

    impl SleepWork {
        fn new(delay_ms: u64, fail_first: u64) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(delay_ms),
                fail_first,
                runs: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl AcquisitionWork for SleepWork {
        async fn run(&self, _job_id: u64, _store: &ChannelStore) -> AppResult<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if run <= self.fail_first {
                return Err(DaqError::Lifecycle("sensor saturated".to_string()));
            }
            Ok(())
        }
    }

    fn store() -> ChannelStore {
        ChannelStore::from_table(
            "PE1:",
            vec![
                ChannelSpec::enumeration("cam1:Acquire", &["Done", "Acquire"], 0)
                    .status()
                    .with_readback(),
                ChannelSpec::enumeration(
                    "cam1:DetectorState_RBV",
                    &["Idle", "Acquire", "Readout", "Correct", "Saving", "Aborting", "Error"],
                    0,
                )
                .read_only(),
            ],
        )
        .unwrap()
    }

    fn controller(store: &ChannelStore, work: Arc<SleepWork>) -> AcquisitionController {
        AcquisitionController::new(
            "acquire",
            store.clone(),
            ControllerConfig::new("cam1:Acquire", 1, 0).with_state_channel("cam1:DetectorState_RBV"),
            work,
        )
        .unwrap()
    }

    fn acquire() -> AcquisitionRequest {
        AcquisitionRequest::new("cam1:Acquire", 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_job_round_trip() {
        let store = store();
        let controller = controller(&store, SleepWork::new(100, 0));
        assert_eq!(controller.state(), AcquisitionState::Idle);

        let completion = controller.arm_and_wait(acquire()).await.unwrap();

        assert_eq!(completion.job_id, 1);
        assert_eq!(completion.channel, "PE1:cam1:Acquire");
        assert_eq!(completion.value, ChannelValue::Int(0));
        assert!(completion.elapsed >= Duration::from_millis(100));
        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert_eq!(store.get("cam1:Acquire").unwrap(), ChannelValue::Int(0));
        assert_eq!(store.get("cam1:Acquire_RBV").unwrap(), ChannelValue::Int(0));
        assert_eq!(
            store.enum_label("cam1:DetectorState_RBV").unwrap().as_deref(),
            Some("Idle")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_job() {
        let store = store();
        let work = SleepWork::new(500, 0);
        let controller = controller(&store, work.clone());

        let waiters = (0..5).map(|_| controller.arm_and_wait(acquire()));
        let results = futures::future::join_all(waiters).await;

        assert_eq!(controller.jobs_started(), 1);
        assert_eq!(controller.coalesced_waiters(), 4);
        assert_eq!(work.runs.load(Ordering::SeqCst), 1);

        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert_eq!(result.as_ref().unwrap(), first);
        }
    }

    /// Work that panics on its first run.
    struct PanicsOnce {
        runs: AtomicU64,
    }

    #[async_trait]
    impl AcquisitionWork for PanicsOnce {
        async fn run(&self, _job_id: u64, _store: &ChannelStore) -> AppResult<()> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("exposure task crashed");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_work_leaves_device_settled() {
        let store = store();
        let controller = AcquisitionController::new(
            "acquire",
            store.clone(),
            ControllerConfig::new("cam1:Acquire", 1, 0).with_state_channel("cam1:DetectorState_RBV"),
            Arc::new(PanicsOnce {
                runs: AtomicU64::new(0),
            }),
        )
        .unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _watch = CompletionWatcher::watch(
            &store,
            controller.status_channel(),
            falling_edge(controller.active_value(), controller.done_value()),
            move |_| flag.store(true, Ordering::SeqCst),
        )
        .unwrap();

        let err = controller.arm_and_wait(acquire()).await.unwrap_err();
        assert!(matches!(err, DaqError::AcquisitionFailure { job_id: 1, .. }));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(store.get("cam1:Acquire").unwrap(), ChannelValue::Int(0));
        assert_eq!(
            store.enum_label("cam1:DetectorState_RBV").unwrap().as_deref(),
            Some("Error")
        );
        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert!(!controller.is_busy());

        let next = controller.arm_and_wait(acquire()).await.unwrap();
        assert_eq!(next.job_id, 2);
        assert_eq!(
            store.enum_label("cam1:DetectorState_RBV").unwrap().as_deref(),
            Some("Idle")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_every_waiter_and_controller_recovers() {
        let store = store();
        let controller = controller(&store, SleepWork::new(50, 1));

        let (a, b) = tokio::join!(
            controller.arm_and_wait(acquire()),
            controller.arm_and_wait(acquire())
        );
        let (a, b) = (a.unwrap_err(), b.unwrap_err());
        assert!(matches!(a, DaqError::AcquisitionFailure { job_id: 1, .. }));
        assert_eq!(a.to_string(), b.to_string());
        assert!(a.to_string().contains("sensor saturated"));

        assert_eq!(controller.state(), AcquisitionState::Idle);
        assert_eq!(store.get("cam1:Acquire").unwrap(), ChannelValue::Int(0));
        assert_eq!(
            store.enum_label("cam1:DetectorState_RBV").unwrap().as_deref(),
            Some("Error")
        );

        let next = controller.arm_and_wait(acquire()).await.unwrap();
        assert_eq!(next.job_id, 2);
        assert_eq!(controller.jobs_started(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_local_to_the_waiter() {
        let store = store();
        let controller = controller(&store, SleepWork::new(100, 0));

        let (impatient, patient) = tokio::join!(
            controller.arm_and_wait_timeout(acquire(), Some(Duration::from_millis(10))),
            controller.arm_and_wait(acquire())
        );

        assert!(matches!(impatient, Err(DaqError::Timeout { .. })));
        assert_eq!(patient.unwrap().job_id, 1);
        assert_eq!(controller.jobs_started(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_does_not_cancel_job() {
        let store = store();
        let controller = controller(&store, SleepWork::new(100, 0));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            controller.arm_and_wait(acquire()),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(controller.is_busy());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!controller.is_busy());
        assert_eq!(store.get("cam1:Acquire").unwrap(), ChannelValue::Int(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_request_rejected_while_busy() {
        let store = store();
        let controller = controller(&store, SleepWork::new(100, 0));

        let running = tokio::spawn({
            let controller = controller.clone();
            async move { controller.arm_and_wait(acquire()).await }
        });
        tokio::task::yield_now().await;
        assert!(controller.is_busy());

        let err = controller
            .arm_and_wait(AcquisitionRequest::new("cam1:Acquire", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));

        assert!(running.await.unwrap().is_ok());
        assert_eq!(controller.jobs_started(), 1);
    }

    #[tokio::test]
    async fn test_idle_request_and_wrong_channel() {
        let store = store();
        let controller = controller(&store, SleepWork::new(0, 0));

        let noop = controller
            .arm_and_wait(AcquisitionRequest::new("cam1:Acquire", "Done"))
            .await
            .unwrap();
        assert_eq!(noop.job_id, 0);
        assert_eq!(controller.jobs_started(), 0);

        let err = controller
            .arm_and_wait(AcquisitionRequest::new("cam1:DetectorState_RBV", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_has_fired_when_waiter_returns() {
        let store = store();
        let controller = controller(&store, SleepWork::new(20, 0));

        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = fired.clone();
        let _watcher = CompletionWatcher::watch(
            &store,
            controller.status_channel(),
            falling_edge(controller.active_value(), controller.done_value()),
            move |_| fired_cb.store(true, Ordering::SeqCst),
        )
        .unwrap();

        controller.arm_and_wait(acquire()).await.unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_coalescing_is_logged_not_returned() {
        let store = store();
        let controller = controller(&store, SleepWork::new(50, 0));

        let (a, b) = tokio::join!(
            controller.arm_and_wait(acquire()),
            controller.arm_and_wait(acquire())
        );
        assert!(a.is_ok() && b.is_ok());
        assert!(logs_contain("coalescing onto in-flight job"));
    }

    #[test]
    fn test_identical_active_and_done_rejected() {
        let store = store();
        let result = AcquisitionController::new(
            "broken",
            store,
            ControllerConfig::new("cam1:Acquire", 1, 1),
            SleepWork::new(0, 0),
        );
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }
}
