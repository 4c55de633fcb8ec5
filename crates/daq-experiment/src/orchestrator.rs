//! TriggerOrchestrator - sequential execution of a count plan
//!
//! The orchestrator executes a [`Plan`] against one [`AreaDetector`] and
//! broadcasts the run's documents. Repetitions run strictly one after the
//! other; the first failing step ends the run.
//!
//! # Run lifecycle
//!
//! ```text
//! ┌──────┐  run()  ┌─────────┐  plan exhausted / step error  ┌────────────┐
//! │ Idle │────────▶│ Running │──────────────────────────────▶│ Finalizing │
//! └──────┘         └─────────┘                               └─────┬──────┘
//!    ▲                                                             │
//!    └──────────────── unstage, flush assets, StopDoc ◀────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let orchestrator = TriggerOrchestrator::new(detector, OrchestratorConfig::new("/tmp", "a/b"));
//! let mut docs = orchestrator.subscribe();
//!
//! let summary = orchestrator.run(&mut CountProtocol::new(settings)?).await?;
//! while let Ok(doc) = docs.try_recv() {
//!     println!("{}", serde_json::to_string(&doc)?);
//! }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::plans::{Plan, PlanCommand};
use daq_core::acquisition::{AcquisitionRequest, Completion};
use daq_core::capabilities::{AreaDetector, StageRequest};
use daq_core::error::{AppResult, DaqError};
use daq_core::experiment::{
    DataKey, DatumDoc, DescriptorDoc, Document, EventDoc, ResourceDoc, StartDoc, StopDoc,
};
use daq_core::watcher::{await_transition, falling_edge};

/// Capacity of the document broadcast channel
const DOCUMENT_CHANNEL_CAPACITY: usize = 1024;

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No run in progress
    Idle,
    /// Executing plan commands
    Running,
    /// Unstaging and emitting the stop document
    Finalizing,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// Where artifacts go and how long a single arm may take.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Absolute resource root
    pub root: PathBuf,
    /// Path below `root` for this run's files
    pub relative_path: PathBuf,
    /// File plugin naming template
    pub naming_template: String,
    /// Per-arm deadline; `None` waits indefinitely
    pub arm_timeout: Option<Duration>,
    /// Copied into the start document
    pub metadata: HashMap<String, String>,
}

impl OrchestratorConfig {
    /// Series under `root / relative_path` with the default TIFF template
    pub fn new(root: impl Into<PathBuf>, relative_path: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            relative_path: relative_path.into(),
            naming_template: "%s%s_%6.6d.tiff".to_string(),
            arm_timeout: None,
            metadata: HashMap::new(),
        }
    }

    /// File plugin template
    pub fn with_naming_template(mut self, template: impl Into<String>) -> Self {
        self.naming_template = template.into();
        self
    }

    /// Give up on each arm after `timeout`
    pub fn with_arm_timeout(mut self, timeout: Duration) -> Self {
        self.arm_timeout = Some(timeout);
        self
    }

    /// Add a start-document metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Staged artifact directory with a trailing separator, as the file
    /// plugin expects it.
    pub fn file_dir(&self) -> String {
        let dir = self.root.join(&self.relative_path);
        let mut dir = dir.display().to_string();
        if !dir.ends_with('/') {
            dir.push('/');
        }
        dir
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Every repetition completed
    Success,
    /// A step of `repetition` failed; later repetitions never started
    Failed {
        /// 1-based repetition that failed (0 for setup)
        repetition: usize,
        /// The step error
        error: DaqError,
    },
}

impl RunOutcome {
    /// Whether every repetition completed
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

/// What a run produced, including records from repetitions that completed
/// before a failure.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Start document uid
    pub run_uid: String,
    /// Resource bound by staging
    pub resource: ResourceDoc,
    /// Datums in generation order
    pub datums: Vec<DatumDoc>,
    /// Events emitted on the primary stream
    pub num_events: u32,
    /// Repetitions that finished every step
    pub completed_repetitions: usize,
    /// How the run ended
    pub outcome: RunOutcome,
}

/// Run context for the current plan
struct RunContext {
    run_uid: String,
    descriptor_uid: String,
    image_key: String,
    repetition: usize,
    completed_repetitions: usize,
    datums: Vec<DatumDoc>,
    seq_num: u32,
}

/// Executes plans against one detector and broadcasts documents.
pub struct TriggerOrchestrator<D: AreaDetector> {
    detector: Arc<D>,
    config: OrchestratorConfig,
    state: Mutex<EngineState>,
    doc_sender: broadcast::Sender<Document>,
}

impl<D: AreaDetector> TriggerOrchestrator<D> {
    /// Create an orchestrator for `detector`
    pub fn new(detector: Arc<D>, config: OrchestratorConfig) -> Self {
        let (doc_sender, _) = broadcast::channel(DOCUMENT_CHANNEL_CAPACITY);
        Self {
            detector,
            config,
            state: Mutex::new(EngineState::Idle),
            doc_sender,
        }
    }

    /// Subscribe to the document stream
    pub fn subscribe(&self) -> broadcast::Receiver<Document> {
        self.doc_sender.subscribe()
    }

    /// Current engine state
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Detector the orchestrator drives
    pub fn detector(&self) -> &Arc<D> {
        &self.detector
    }

    /// Run settings
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Execute `plan` to completion or first failure.
    ///
    /// Step failures end the run with [`RunOutcome::Failed`]; the returned
    /// error is reserved for a run that could not start (already running,
    /// staging refused).
    pub async fn run(&self, plan: &mut dyn Plan) -> AppResult<RunSummary> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Idle {
                return Err(DaqError::Lifecycle(format!(
                    "Cannot start '{}' while orchestrator is {}",
                    plan.plan_type(),
                    *state
                )));
            }
            *state = EngineState::Running;
        }

        let result = self.execute_plan(plan).await;
        *self.state.lock() = EngineState::Idle;
        result
    }

    async fn execute_plan(&self, plan: &mut dyn Plan) -> AppResult<RunSummary> {
        plan.reset();

        // Create and emit StartDoc
        let start_doc = self.config.metadata.iter().fold(
            StartDoc::new(plan.plan_type(), plan.plan_name())
                .with_detector(self.detector.name())
                .with_args(plan.plan_args()),
            |doc, (key, value)| doc.with_metadata(key, value),
        );
        let run_uid = start_doc.uid.clone();
        self.emit_document(Document::Start(start_doc));

        info!(
            run_uid = %run_uid,
            plan = %plan.plan_type(),
            repetitions = plan.num_repetitions(),
            "Run started"
        );

        // Stage; a refused stage ends the run before any repetition
        let request = StageRequest::new(
            self.config.root.clone(),
            self.config.relative_path.clone(),
            self.config.naming_template.clone(),
        )
        .with_run_start(run_uid.clone());
        let resource = match self.detector.stage(&request).await {
            Ok(resource) => resource,
            Err(e) => {
                error!(run_uid = %run_uid, error = %e, "Stage failed");
                self.flush_asset_docs();
                self.emit_document(Document::Stop(StopDoc::fail(&run_uid, &e.to_string(), 0)));
                return Err(e);
            }
        };
        self.flush_asset_docs();

        let image_key = format!("{}_image", self.detector.name());
        let mut ctx = RunContext {
            run_uid: run_uid.clone(),
            descriptor_uid: String::new(),
            image_key,
            repetition: 0,
            completed_repetitions: 0,
            datums: Vec::new(),
            seq_num: 0,
        };

        let outcome = match self.execute_commands(plan, &mut ctx).await {
            Ok(()) => RunOutcome::Success,
            Err(e) => {
                error!(
                    run_uid = %run_uid,
                    repetition = ctx.repetition,
                    category = e.category(),
                    error = %e,
                    "Repetition failed, run aborted"
                );
                RunOutcome::Failed {
                    repetition: ctx.repetition,
                    error: e,
                }
            }
        };

        *self.state.lock() = EngineState::Finalizing;
        if let Err(e) = self.detector.unstage().await {
            warn!(run_uid = %run_uid, error = %e, "Unstage failed");
        }
        self.flush_asset_docs();

        let stop_doc = match &outcome {
            RunOutcome::Success => StopDoc::success(&run_uid, ctx.seq_num),
            RunOutcome::Failed { error, .. } => {
                StopDoc::fail(&run_uid, &error.to_string(), ctx.seq_num)
            }
        };
        self.emit_document(Document::Stop(stop_doc));

        info!(
            run_uid = %run_uid,
            success = outcome.is_success(),
            completed_repetitions = ctx.completed_repetitions,
            num_events = ctx.seq_num,
            "Run complete"
        );

        Ok(RunSummary {
            run_uid,
            resource,
            datums: ctx.datums,
            num_events: ctx.seq_num,
            completed_repetitions: ctx.completed_repetitions,
            outcome,
        })
    }

    async fn execute_commands(&self, plan: &mut dyn Plan, ctx: &mut RunContext) -> AppResult<()> {
        for cmd in plan.prepare(&self.config.file_dir()) {
            self.process_command(cmd, ctx).await?;
        }

        // Descriptor after setup so the snapshot carries the file path
        let descriptor = DescriptorDoc::new(&ctx.run_uid, "primary")
            .with_data_key(
                &ctx.image_key,
                DataKey::external_array(self.detector.name(), vec![]),
            )
            .with_configuration(self.detector.configuration());
        ctx.descriptor_uid = descriptor.uid.clone();
        self.emit_document(Document::Descriptor(descriptor));

        while let Some(cmd) = plan.next_command() {
            self.process_command(cmd, ctx).await?;
        }
        if ctx.repetition > ctx.completed_repetitions {
            ctx.completed_repetitions = ctx.repetition;
        }
        Ok(())
    }

    /// Process a single plan command
    async fn process_command(&self, cmd: PlanCommand, ctx: &mut RunContext) -> AppResult<()> {
        debug!(?cmd, "Processing command");

        match cmd {
            PlanCommand::BeginRepetition { index } => {
                // Reaching the next repetition means the previous one finished
                ctx.completed_repetitions = ctx.repetition;
                ctx.repetition = index;
                info!(run_uid = %ctx.run_uid, repetition = index, "Repetition started");
            }
            PlanCommand::Set { channel, value } => {
                self.detector.channels().set(&channel, value)?;
            }
            PlanCommand::Wait { seconds } => {
                let delay = Duration::try_from_secs_f64(seconds).map_err(|e| {
                    DaqError::Configuration(format!("Wait of {} s is out of range: {}", seconds, e))
                })?;
                tokio::time::sleep(delay).await;
            }
            PlanCommand::ArmAndWait { channel } => {
                self.arm_and_wait(&channel).await?;
            }
            PlanCommand::TriggerAndRead { channel, stream } => {
                let completion = self.arm_and_wait(&channel).await?;
                let datum = self
                    .detector
                    .generate_datum(&ctx.image_key, serde_json::Map::new())?;
                self.flush_asset_docs();

                let event = EventDoc::new(&ctx.run_uid, &ctx.descriptor_uid, ctx.seq_num)
                    .with_datum_ref(&ctx.image_key, &datum);
                debug!(
                    stream = %stream,
                    seq_num = ctx.seq_num,
                    datum = %datum.datum_id,
                    job_id = completion.job_id,
                    "Event recorded"
                );
                ctx.seq_num += 1;
                ctx.datums.push(datum);
                self.emit_document(Document::Event(event));
            }
            PlanCommand::WriteFile { channel } => {
                self.detector.channels().set(&channel, 1)?;
            }
        }
        Ok(())
    }

    /// Arm the controller owning `channel` and wait for its falling edge.
    async fn arm_and_wait(&self, channel: &str) -> AppResult<Completion> {
        let controller = self.detector.controller(channel)?;

        // Registered before arming so the edge cannot be missed
        let mut pending = await_transition(
            self.detector.channels(),
            channel,
            falling_edge(controller.active_value(), controller.done_value()),
        )?;

        let completion = controller
            .arm_and_wait_timeout(
                AcquisitionRequest::new(channel, controller.active_value()),
                self.config.arm_timeout,
            )
            .await?;

        match pending.try_take() {
            Some(transition) => {
                debug!(channel = %transition.channel, job_id = completion.job_id, "Falling edge observed");
            }
            None => {
                return Err(DaqError::Lifecycle(format!(
                    "Job {} on '{}' completed without a falling edge",
                    completion.job_id,
                    controller.status_channel()
                )));
            }
        }
        Ok(completion)
    }

    /// Emit pending Resource and Datum documents
    fn flush_asset_docs(&self) {
        for doc in self.detector.collect_asset_docs() {
            self.emit_document(doc);
        }
    }

    /// Emit a document to all subscribers
    fn emit_document(&self, doc: Document) {
        debug!(doc_type = doc.kind(), uid = %doc.uid(), "Emitting document");

        // Ignore send errors (no subscribers)
        let _ = self.doc_sender.send(doc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::{CountProtocol, CountSettings};
    use daq_driver_mock::{ErrorConfig, MockMode, PerkinElmerDetector};
    use tracing_test::traced_test;

    fn settings(repetitions: u32) -> CountSettings {
        CountSettings {
            exposure: 0.1,
            num_images: 1,
            num_dark_images: 1,
            num_repetitions: repetitions,
            delay: 1.0,
            settle_time: 0.5,
            file_name_base: "unit".to_string(),
        }
    }

    fn orchestrator(errors: ErrorConfig) -> TriggerOrchestrator<PerkinElmerDetector> {
        let detector = PerkinElmerDetector::builder()
            .prefix("PE1:")
            .mode(MockMode::Realistic)
            .error_config(errors)
            .build()
            .unwrap();
        TriggerOrchestrator::new(Arc::new(detector), OrchestratorConfig::new("/tmp", "a/b"))
    }

    fn drain(rx: &mut broadcast::Receiver<Document>) -> Vec<Document> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_file_dir_has_trailing_separator() {
        assert_eq!(OrchestratorConfig::new("/tmp", "a/b").file_dir(), "/tmp/a/b/");
        assert_eq!(OrchestratorConfig::new("/tmp/", "a/b/").file_dir(), "/tmp/a/b/");
    }

    #[tokio::test(start_paused = true)]
    async fn test_document_order() {
        let orch = orchestrator(ErrorConfig::none());
        let mut rx = orch.subscribe();

        let summary = orch
            .run(&mut CountProtocol::new(settings(2)).unwrap())
            .await
            .unwrap();
        assert!(summary.outcome.is_success());
        assert_eq!(summary.completed_repetitions, 2);
        assert_eq!(orch.state(), EngineState::Idle);

        let kinds: Vec<&str> = drain(&mut rx).iter().map(Document::kind).collect();
        assert_eq!(
            kinds,
            vec!["start", "resource", "descriptor", "datum", "event", "datum", "event", "stop"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_written_before_descriptor() {
        let orch = orchestrator(ErrorConfig::none());
        let mut rx = orch.subscribe();
        orch.run(&mut CountProtocol::new(settings(1)).unwrap())
            .await
            .unwrap();

        let descriptor = drain(&mut rx)
            .into_iter()
            .find_map(|d| match d {
                Document::Descriptor(d) => Some(d),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            descriptor.configuration["PE1:TIFF1:FilePath"],
            serde_json::json!("/tmp/a/b/")
        );
        assert_eq!(descriptor.data_keys["pe1_image"].external.as_deref(), Some("FILESTORE:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_refused_emits_failed_stop() {
        let detector = PerkinElmerDetector::builder().build().unwrap();
        let orch = TriggerOrchestrator::new(
            Arc::new(detector),
            OrchestratorConfig::new("relative/root", "a"),
        );
        let mut rx = orch.subscribe();

        let err = orch
            .run(&mut CountProtocol::new(settings(1)).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));

        let docs = drain(&mut rx);
        match docs.last() {
            Some(Document::Stop(stop)) => assert_eq!(stop.exit_status, "fail"),
            other => panic!("expected stop, got {:?}", other),
        }
        assert_eq!(orch.state(), EngineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_timeout_fails_repetition() {
        let detector = PerkinElmerDetector::builder()
            .mode(MockMode::Realistic)
            .build()
            .unwrap();
        let config = OrchestratorConfig::new("/tmp", "a").with_arm_timeout(Duration::from_millis(10));
        let orch = TriggerOrchestrator::new(Arc::new(detector), config);

        let summary = orch
            .run(&mut CountProtocol::new(settings(2)).unwrap())
            .await
            .unwrap();
        match summary.outcome {
            RunOutcome::Failed { repetition, error } => {
                assert_eq!(repetition, 1);
                assert!(matches!(error, DaqError::Timeout { .. }));
            }
            RunOutcome::Success => panic!("expected timeout"),
        }
        assert!(summary.datums.is_empty());
        assert!(!orch.detector().resource_tracker().is_staged());
    }

    /// Replays a fixed command list.
    struct Scripted {
        commands: Vec<PlanCommand>,
        next: usize,
    }

    impl Plan for Scripted {
        fn plan_type(&self) -> &str {
            "scripted"
        }

        fn plan_name(&self) -> &str {
            "Scripted"
        }

        fn plan_args(&self) -> HashMap<String, String> {
            HashMap::new()
        }

        fn num_repetitions(&self) -> usize {
            1
        }

        fn next_command(&mut self) -> Option<PlanCommand> {
            let cmd = self.commands.get(self.next).cloned();
            self.next += 1;
            cmd
        }

        fn reset(&mut self) {
            self.next = 0;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_wait_fails_repetition() {
        let orch = orchestrator(ErrorConfig::none());
        let mut plan = Scripted {
            commands: vec![
                PlanCommand::BeginRepetition { index: 1 },
                PlanCommand::Wait { seconds: 1e20 },
            ],
            next: 0,
        };

        let summary = orch.run(&mut plan).await.unwrap();
        match summary.outcome {
            RunOutcome::Failed { repetition, error } => {
                assert_eq!(repetition, 1);
                assert!(matches!(error, DaqError::Configuration(_)));
            }
            RunOutcome::Success => panic!("expected an out-of-range wait to fail"),
        }
        assert_eq!(orch.state(), EngineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_run_logs_repetitions() {
        let orch = orchestrator(ErrorConfig::fail_after("acquire", 1));
        orch.run(&mut CountProtocol::new(settings(2)).unwrap())
            .await
            .unwrap();

        assert!(logs_contain("Run started"));
        assert!(logs_contain("Repetition started"));
        assert!(logs_contain("Repetition failed, run aborted"));
        assert!(logs_contain("Run complete"));
    }
}
