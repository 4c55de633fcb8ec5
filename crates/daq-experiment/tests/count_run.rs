//! End-to-end count runs against the simulated detector

use std::sync::Arc;

use daq_core::capabilities::Configurable;
use daq_core::error::DaqError;
use daq_core::experiment::Document;
use daq_driver_mock::{channels, ErrorConfig, MockMode, PerkinElmerDetector};
use daq_experiment::{
    CountProtocol, CountSettings, OrchestratorConfig, RunOutcome, TriggerOrchestrator,
};
use tokio::sync::broadcast;

fn settings(repetitions: u32) -> CountSettings {
    CountSettings {
        exposure: 0.2,
        num_images: 2,
        num_dark_images: 1,
        num_repetitions: repetitions,
        delay: 3.0,
        settle_time: 0.5,
        file_name_base: "sample".to_string(),
    }
}

fn orchestrator(mode: MockMode, errors: ErrorConfig) -> TriggerOrchestrator<PerkinElmerDetector> {
    let detector = PerkinElmerDetector::builder()
        .prefix("PE1:")
        .mode(mode)
        .error_config(errors)
        .build()
        .unwrap();
    TriggerOrchestrator::new(
        Arc::new(detector),
        OrchestratorConfig::new("/tmp", "perkin_elmer/detector").with_metadata("proposal", "300001"),
    )
}

fn drain(rx: &mut broadcast::Receiver<Document>) -> Vec<Document> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_three_repetitions_succeed() {
    let orch = orchestrator(MockMode::Realistic, ErrorConfig::none());
    let mut rx = orch.subscribe();

    let started = tokio::time::Instant::now();
    let summary = orch
        .run(&mut CountProtocol::new(settings(3)).unwrap())
        .await
        .unwrap();
    assert!(summary.outcome.is_success());
    assert_eq!(summary.completed_repetitions, 3);
    assert_eq!(summary.num_events, 3);

    // Datums are 0, 1, 2 of the single staged resource
    let resource = &summary.resource;
    let seqs: Vec<u64> = summary
        .datums
        .iter()
        .map(|d| d.datum_kwargs["point_number"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    assert!(summary.datums.iter().all(|d| d.resource_uid == resource.uid));
    assert_eq!(summary.datums[2].datum_id, format!("{}/2", resource.uid));

    // Delay runs after every repetition
    assert!(started.elapsed() >= std::time::Duration::from_secs(9));

    let docs = drain(&mut rx);
    match &docs[0] {
        Document::Start(start) => {
            assert_eq!(start.plan_type, "pe_count");
            assert_eq!(start.metadata["proposal"], "300001");
            assert_eq!(start.detectors, vec!["pe1".to_string()]);
        }
        other => panic!("expected start, got {:?}", other),
    }
    match docs.last() {
        Some(Document::Stop(stop)) => {
            assert_eq!(stop.exit_status, "success");
            assert_eq!(stop.num_events, 3);
        }
        other => panic!("expected stop, got {:?}", other),
    }

    // Each event references the datum emitted just before it
    let mut last_datum = None;
    for doc in &docs {
        match doc {
            Document::Datum(d) => last_datum = Some(d.datum_id.clone()),
            Document::Event(e) => {
                assert_eq!(e.data["pe1_image"], serde_json::json!(last_datum.clone().unwrap()));
                assert!(!e.filled["pe1_image"]);
            }
            _ => {}
        }
    }

    // Dark frame, image, dark frame, image... each wrote one file
    let det = orch.detector();
    assert_eq!(det.get(channels::FILE_NUMBER).unwrap().as_i64(), Some(7));
    assert!(!det.resource_tracker().is_staged());
    assert_eq!(det.get(channels::ARRAY_COUNTER).unwrap().as_i64(), Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_failure_in_second_of_three_repetitions() {
    let orch = orchestrator(MockMode::Instant, ErrorConfig::fail_after("acquire", 1));
    let mut rx = orch.subscribe();

    let summary = orch
        .run(&mut CountProtocol::new(settings(3)).unwrap())
        .await
        .unwrap();

    match &summary.outcome {
        RunOutcome::Failed { repetition, error } => {
            assert_eq!(*repetition, 2);
            assert!(matches!(error, DaqError::AcquisitionFailure { job_id: 2, .. }));
        }
        RunOutcome::Success => panic!("expected failure"),
    }
    assert_eq!(summary.completed_repetitions, 1);
    assert_eq!(summary.datums.len(), 1);
    assert_eq!(summary.datums[0].datum_kwargs["point_number"], 0);

    let docs = drain(&mut rx);
    let datums = docs.iter().filter(|d| matches!(d, Document::Datum(_))).count();
    let events = docs.iter().filter(|d| matches!(d, Document::Event(_))).count();
    assert_eq!(datums, 1);
    assert_eq!(events, 1);
    match docs.last() {
        Some(Document::Stop(stop)) => {
            assert_eq!(stop.exit_status, "fail");
            assert!(stop.reason.contains("Acquisition job 2 failed"));
        }
        other => panic!("expected stop, got {:?}", other),
    }

    // Repetition 3 never started: only two main exposures were attempted
    assert_eq!(orch.detector().acquire_controller().jobs_started(), 2);
    assert!(!orch.detector().resource_tracker().is_staged());
}

#[tokio::test(start_paused = true)]
async fn test_rerun_restarts_datum_sequence() {
    let orch = orchestrator(MockMode::Instant, ErrorConfig::none());
    let mut plan = CountProtocol::new(settings(2)).unwrap();

    let first = orch.run(&mut plan).await.unwrap();
    let second = orch.run(&mut plan).await.unwrap();

    assert_ne!(first.run_uid, second.run_uid);
    assert_ne!(first.resource.uid, second.resource.uid);
    assert_eq!(second.datums[0].datum_kwargs["point_number"], 0);
    assert_eq!(second.completed_repetitions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_run_rejected() {
    let orch = Arc::new(orchestrator(MockMode::Realistic, ErrorConfig::none()));

    let background = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.run(&mut CountProtocol::new(settings(1)).unwrap())
                .await
        })
    };
    tokio::task::yield_now().await;

    let err = orch
        .run(&mut CountProtocol::new(settings(1)).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Lifecycle(_)));
    assert!(background.await.unwrap().unwrap().outcome.is_success());
}
