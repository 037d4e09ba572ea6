mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dossier_core::model::{
    InvestigationID, InvestigationStatus, Phase, TargetStatus, TaskStatus,
};
use dossier_core::{
    AssessmentSynthesizer, CapabilityDescriptor, CapabilityKind, CapabilityRegistry,
    CorroborationAnalyzer, EventJournal, FixtureResponse, FixtureWorker, InMemoryStore,
    InvestigationError, InvestigationRecord, InvestigationService, InvestigationSpec,
    InvestigationStore, JsonFileStore, JsonlJournal, OrchestratorConfig, TargetSpec,
    TransitionKind, Worker, scoring,
};
use mockall::mock;

use support::{draft, gauge, wait_for_status, wait_until};

fn target(label: &str, requirements: &[&str]) -> TargetSpec {
    TargetSpec {
        label: label.to_string(),
        kind: Default::default(),
        priority: None,
        requirements: requirements.iter().map(|r| (*r).into()).collect(),
    }
}

fn spec(targets: Vec<TargetSpec>, analysis: &[&str], synthesis: &[&str]) -> InvestigationSpec {
    InvestigationSpec {
        title: "Supplier network".into(),
        objective: "Establish who controls the supplier network".into(),
        classification: Default::default(),
        priority: Default::default(),
        targets,
        planning: vec![],
        analysis: analysis.iter().map(|c| (*c).into()).collect(),
        synthesis: synthesis.iter().map(|c| (*c).into()).collect(),
    }
}

fn full_registry(collector: Arc<dyn Worker>) -> Arc<CapabilityRegistry> {
    let registry = CapabilityRegistry::builder()
        .register(
            "collect-web",
            CapabilityDescriptor::new(CapabilityKind::Collection),
            collector,
        )
        .register(
            "analyze-corroboration",
            CapabilityDescriptor::new(CapabilityKind::Analysis),
            Arc::new(CorroborationAnalyzer::new("corroboration")),
        )
        .register(
            "synthesize-assessment",
            CapabilityDescriptor::new(CapabilityKind::Synthesis),
            Arc::new(AssessmentSynthesizer::new("assessment")),
        )
        .build()
        .expect("registry");
    Arc::new(registry)
}

fn service_with(
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn InvestigationStore>,
    config: OrchestratorConfig,
) -> InvestigationService {
    InvestigationService::builder()
        .with_config(config)
        .with_registry(registry)
        .with_store(store)
        .build()
        .expect("service")
}

fn quick_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry.backoff_base_ms = 5;
    config.retry.backoff_max_ms = 20;
    config.retry.jitter_min_ms = 0;
    config.runtime.tick_interval_ms = 20;
    config.runtime.save_retry_delay_ms = 1;
    config.runtime.shutdown_timeout_ms = 2_000;
    config
}

#[tokio::test]
async fn fatal_target_fails_alone_and_confidence_comes_from_the_rest() {
    let collector = FixtureWorker::new("web-fixture")
        .with_fixture(
            "collect-web",
            "t1",
            FixtureResponse::Evidence {
                items: vec![draft("registry.example/t1", 90, 80)],
            },
        )
        .with_fixture(
            "collect-web",
            "t2",
            FixtureResponse::Fail {
                message: "source refused".into(),
            },
        )
        .with_fixture(
            "collect-web",
            "t3",
            FixtureResponse::Evidence {
                items: vec![draft("news.example/t3", 60, 50)],
            },
        );
    let store = Arc::new(InMemoryStore::new());
    let service = service_with(
        full_registry(Arc::new(collector)),
        store.clone(),
        quick_config(),
    );

    let id = service
        .start_investigation(spec(
            vec![
                target("t1", &["collect-web"]),
                target("t2", &["collect-web"]),
                target("t3", &["collect-web"]),
            ],
            &["analyze-corroboration"],
            &["synthesize-assessment"],
        ))
        .await
        .unwrap();

    let snapshot = wait_for_status(&service, id, InvestigationStatus::Completed)
        .await
        .unwrap();

    assert_eq!(snapshot.target_by_label("t1").unwrap().status, TargetStatus::Completed);
    assert_eq!(snapshot.target_by_label("t2").unwrap().status, TargetStatus::Failed);
    assert_eq!(snapshot.target_by_label("t3").unwrap().status, TargetStatus::Completed);
    assert_eq!(snapshot.task_counts.failed, 1);
    assert_eq!(snapshot.assessments.len(), 1);
    assert!((snapshot.completeness - 2.0 / 3.0).abs() < 1e-9);

    let record = store.load(id).await.unwrap();
    let t2 = snapshot.target_by_label("t2").unwrap().id;
    assert_eq!(record.evidence.len(), 2);
    assert!(record.evidence.iter().all(|e| e.target != t2));

    let (w1, w3) = (0.9 * 0.8, 0.6 * 0.5);
    let expected = (w1 * w1 + w3 * w3) / (w1 + w3);
    assert!((record.confidence - expected).abs() < 1e-9);
    assert!((record.confidence - scoring::score(&record.evidence)).abs() < 1e-12);

    let failed = snapshot
        .tasks
        .iter()
        .find(|t| t.status == TaskStatus::Failed)
        .unwrap();
    assert_eq!(failed.target, Some(t2));
    assert_eq!(failed.error.as_deref(), Some("source refused"));

    service.shutdown().await;
}

#[tokio::test]
async fn phase_history_is_ordered_and_walks_every_phase() {
    let collector = FixtureWorker::new("web-fixture").with_fixture(
        "collect-web",
        "acme",
        FixtureResponse::Evidence {
            items: vec![draft("registry.example/acme", 70, 70)],
        },
    );
    let service = service_with(
        full_registry(Arc::new(collector)),
        Arc::new(InMemoryStore::new()),
        quick_config(),
    );
    let id = service
        .start_investigation(spec(
            vec![target("acme", &["collect-web"])],
            &["analyze-corroboration"],
            &["synthesize-assessment"],
        ))
        .await
        .unwrap();

    let snapshot = wait_for_status(&service, id, InvestigationStatus::Completed)
        .await
        .unwrap();

    let history = &snapshot.phase_history;
    assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(history.windows(2).all(|w| w[1].from == Some(w[0].to)));
    let phases: Vec<Phase> = history.iter().map(|t| t.to).collect();
    assert_eq!(phases, Phase::ALL.to_vec());
    assert_eq!(history[0].kind, TransitionKind::Opened);
    assert!(snapshot.degraded_phases.is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn in_flight_attempts_never_exceed_the_capability_bound() {
    let worker = gauge(Duration::from_millis(25));
    let registry = CapabilityRegistry::builder()
        .register(
            "collect-slow",
            CapabilityDescriptor::new(CapabilityKind::Collection).with_max_concurrency(3),
            worker.clone(),
        )
        .build()
        .unwrap();
    let service = service_with(Arc::new(registry), Arc::new(InMemoryStore::new()), quick_config());

    let targets = (0..10)
        .map(|n| target(&format!("host-{n}"), &["collect-slow"]))
        .collect();
    let id = service
        .start_investigation(spec(targets, &[], &[]))
        .await
        .unwrap();

    let snapshot = wait_for_status(&service, id, InvestigationStatus::Completed)
        .await
        .unwrap();

    assert_eq!(snapshot.task_counts.completed, 10);
    assert_eq!(worker.finished(), 10);
    assert!(worker.peak() <= 3, "peak was {}", worker.peak());
    assert!(worker.peak() >= 2, "tasks never overlapped");

    service.shutdown().await;
}

#[tokio::test]
async fn cancel_leaves_every_task_terminal() {
    let collector = ["a", "b", "c", "d"].iter().fold(
        FixtureWorker::new("slow-fixture").with_latency(Duration::from_secs(30)),
        |worker, label| {
            worker.with_fixture(
                "collect-web",
                *label,
                FixtureResponse::Evidence {
                    items: vec![draft(label, 50, 50)],
                },
            )
        },
    );
    let registry = CapabilityRegistry::builder()
        .register(
            "collect-web",
            CapabilityDescriptor::new(CapabilityKind::Collection).with_max_concurrency(2),
            Arc::new(collector),
        )
        .build()
        .unwrap();
    let service = service_with(Arc::new(registry), Arc::new(InMemoryStore::new()), quick_config());

    let targets = ["a", "b", "c", "d"]
        .iter()
        .map(|l| target(l, &["collect-web"]))
        .collect();
    let id = service
        .start_investigation(spec(targets, &[], &[]))
        .await
        .unwrap();
    wait_until(&service, id, |s| s.task_counts.in_progress == 2)
        .await
        .unwrap();

    let snapshot = tokio::time::timeout(support::WAIT_LIMIT, service.cancel(id, "operator abort"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(snapshot.status, InvestigationStatus::Failed);
    assert_eq!(snapshot.failure_reason.as_deref(), Some("operator abort"));
    assert_eq!(snapshot.task_counts.live(), 0);
    assert_eq!(snapshot.task_counts.cancelled, 4);
    assert!(snapshot.tasks.iter().all(|t| t.status.is_terminal()));

    // already failed: cancel again is accepted, pause is not
    assert!(service.cancel(id, "again").await.is_ok());
    assert!(matches!(
        service.pause(id).await,
        Err(InvestigationError::InvalidTransition(_))
    ));

    service.shutdown().await;
}

#[tokio::test]
async fn reopen_returns_to_an_earlier_phase_and_replans() {
    let fast = FixtureWorker::new("web-fixture").with_fixture(
        "collect-web",
        "quick",
        FixtureResponse::Evidence {
            items: vec![draft("quick", 80, 80)],
        },
    );
    let slow = FixtureWorker::new("archive-fixture")
        .with_latency(Duration::from_secs(30))
        .with_fixture(
            "collect-archive",
            "deep",
            FixtureResponse::Evidence {
                items: vec![draft("deep", 80, 80)],
            },
        );
    let registry = CapabilityRegistry::builder()
        .register(
            "collect-web",
            CapabilityDescriptor::new(CapabilityKind::Collection),
            Arc::new(fast),
        )
        .register(
            "collect-archive",
            CapabilityDescriptor::new(CapabilityKind::Collection),
            Arc::new(slow),
        )
        .build()
        .unwrap();
    let service = service_with(Arc::new(registry), Arc::new(InMemoryStore::new()), quick_config());

    let id = service
        .start_investigation(spec(
            vec![
                target("quick", &["collect-web"]),
                target("deep", &["collect-archive"]),
            ],
            &[],
            &[],
        ))
        .await
        .unwrap();
    wait_until(&service, id, |s| {
        s.target_by_label("quick")
            .is_some_and(|t| t.status == TargetStatus::Completed)
    })
    .await
    .unwrap();

    let err = service.reopen_phase(id, Phase::Analysis).await.unwrap_err();
    assert!(matches!(err, InvestigationError::InvalidTransition(_)));
    let err = service.reopen_phase(id, Phase::Collection).await.unwrap_err();
    assert!(matches!(err, InvestigationError::InvalidTransition(_)));

    service.reopen_phase(id, Phase::Planning).await.unwrap();

    let snapshot = wait_until(&service, id, |s| s.task_counts.cancelled == 1)
        .await
        .unwrap();
    assert_eq!(snapshot.phase, Phase::Collection);
    let kinds: Vec<TransitionKind> = snapshot.phase_history.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TransitionKind::Opened,
            TransitionKind::Satisfied,
            TransitionKind::Reopened,
            TransitionKind::Satisfied,
        ]
    );
    let sequences: Vec<u64> = snapshot.phase_history.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);

    // the completed target is not collected again
    let collection_tasks = snapshot
        .tasks
        .iter()
        .filter(|t| t.phase == Phase::Collection)
        .count();
    assert_eq!(collection_tasks, 3);
    assert_eq!(snapshot.task_counts.in_progress + snapshot.task_counts.pending, 1);
    assert_eq!(
        snapshot.target_by_label("quick").unwrap().status,
        TargetStatus::Completed
    );

    service.cancel(id, "done").await.unwrap();
    service.shutdown().await;
}

#[tokio::test]
async fn pause_holds_queued_tasks_until_resume() {
    let worker = gauge(Duration::from_millis(40));
    let registry = CapabilityRegistry::builder()
        .register(
            "collect-slow",
            CapabilityDescriptor::new(CapabilityKind::Collection).with_max_concurrency(1),
            worker.clone(),
        )
        .build()
        .unwrap();
    let service = service_with(Arc::new(registry), Arc::new(InMemoryStore::new()), quick_config());

    let targets = (0..4)
        .map(|n| target(&format!("node-{n}"), &["collect-slow"]))
        .collect();
    let id = service
        .start_investigation(spec(targets, &[], &[]))
        .await
        .unwrap();
    wait_until(&service, id, |s| s.task_counts.in_progress == 1)
        .await
        .unwrap();

    service.pause(id).await.unwrap();
    service.pause(id).await.unwrap();
    // the attempt already running is allowed to finish
    tokio::time::sleep(Duration::from_millis(150)).await;
    let held = worker.finished();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(worker.finished(), held);
    assert!(held < 4);

    let paused = service.get_status(id).await.unwrap();
    assert_eq!(paused.status, InvestigationStatus::Paused);

    service.resume(id).await.unwrap();
    let snapshot = wait_for_status(&service, id, InvestigationStatus::Completed)
        .await
        .unwrap();
    assert_eq!(snapshot.task_counts.completed, 4);
    assert!(matches!(
        service.resume(id).await,
        Err(InvestigationError::InvalidTransition(_))
    ));

    service.shutdown().await;
}

#[tokio::test]
async fn late_subscriber_sees_a_gap_then_resumes_in_order() {
    let collector = FixtureWorker::new("web-fixture").with_fixture(
        "collect-web",
        "acme",
        FixtureResponse::Evidence {
            items: vec![draft("acme", 70, 70)],
        },
    );
    let mut config = quick_config();
    config.broadcast.subscriber_buffer = 4;
    let service = service_with(
        full_registry(Arc::new(collector)),
        Arc::new(InMemoryStore::new()),
        config,
    );
    let id = service
        .start_investigation(spec(
            vec![target("acme", &["collect-web"])],
            &["analyze-corroboration"],
            &["synthesize-assessment"],
        ))
        .await
        .unwrap();
    wait_for_status(&service, id, InvestigationStatus::Completed)
        .await
        .unwrap();

    let head = service.broadcaster().last_sequence(id).await.unwrap();
    assert!(head > 5, "expected a longer event log, got {head}");

    let mut sub = service.subscribe_from(id, 1).await.unwrap();
    let Some(dossier_core::Delivery::Gap(gap)) = sub.recv().await.unwrap() else {
        panic!("expected a gap first");
    };
    assert_eq!(gap.after_sequence, 1);
    assert_eq!(gap.dropped, head - 1 - 4);

    let mut seen = Vec::new();
    while seen.len() < (head - 1) as usize {
        match sub.recv().await.unwrap() {
            Some(dossier_core::Delivery::Event(event)) => seen.push(event.sequence),
            other => panic!("unexpected delivery {other:?}"),
        }
    }
    assert_eq!(seen, (2..=head).collect::<Vec<_>>());

    service.archive(id).await.unwrap();
    match sub.recv().await.unwrap() {
        Some(dossier_core::Delivery::Event(event)) => {
            assert_eq!(event.sequence, head + 1);
            assert!(event.event_type.is_final());
        }
        other => panic!("expected the archive event, got {other:?}"),
    }
    assert!(sub.recv().await.unwrap().is_none());

    service.shutdown().await;
}

#[tokio::test]
async fn journaled_events_replay_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn InvestigationStore> = Arc::new(JsonFileStore::open(dir.path()).await.unwrap());
    let events = dir.path().join("events");
    let mut config = quick_config();
    config.broadcast.subscriber_buffer = 2;

    let journaled = |worker: FixtureWorker, journal: Arc<dyn EventJournal>| {
        InvestigationService::builder()
            .with_config(config.clone())
            .with_registry(full_registry(Arc::new(worker)))
            .with_store(Arc::clone(&store))
            .with_journal(journal)
            .build()
            .expect("service")
    };
    let collector = || {
        FixtureWorker::new("web-fixture").with_fixture(
            "collect-web",
            "acme",
            FixtureResponse::Evidence {
                items: vec![draft("acme", 80, 80)],
            },
        )
    };

    let first = journaled(collector(), Arc::new(JsonlJournal::open(&events).await.unwrap()));
    let id = first
        .start_investigation(spec(
            vec![target("acme", &["collect-web"])],
            &["analyze-corroboration"],
            &["synthesize-assessment"],
        ))
        .await
        .unwrap();
    wait_for_status(&first, id, InvestigationStatus::Completed)
        .await
        .unwrap();
    first.shutdown().await;
    assert!(events.join(format!("{id}.events.jsonl")).exists());

    let second = journaled(collector(), Arc::new(JsonlJournal::open(&events).await.unwrap()));
    let head = second.broadcaster().last_sequence(id).await.unwrap();
    assert!(head > 5, "expected a longer event log, got {head}");

    let mut sub = second.subscribe_from(id, 1).await.unwrap();
    let Some(dossier_core::Delivery::Gap(gap)) = sub.recv().await.unwrap() else {
        panic!("expected a gap first");
    };
    assert_eq!(gap.after_sequence, 1);
    assert_eq!(gap.dropped, head - 1 - 2);

    let mut seen = Vec::new();
    while seen.len() < (head - 1) as usize {
        match sub.recv().await.unwrap() {
            Some(dossier_core::Delivery::Event(event)) => {
                assert_eq!(event.investigation_id, id);
                seen.push(event.sequence);
            }
            other => panic!("unexpected delivery {other:?}"),
        }
    }
    assert_eq!(seen, (2..=head).collect::<Vec<_>>());

    second.shutdown().await;
}

#[tokio::test]
async fn concurrent_recovery_starts_a_single_actor() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn InvestigationStore> = Arc::new(JsonFileStore::open(dir.path()).await.unwrap());
    let stalled = || {
        FixtureWorker::new("stalled")
            .with_latency(Duration::from_secs(30))
            .with_fixture(
                "collect-web",
                "acme",
                FixtureResponse::Evidence {
                    items: vec![draft("acme", 90, 90)],
                },
            )
    };

    let first = service_with(full_registry(Arc::new(stalled())), Arc::clone(&store), quick_config());
    let id = first
        .start_investigation(spec(vec![target("acme", &["collect-web"])], &[], &[]))
        .await
        .unwrap();
    wait_until(&first, id, |s| s.task_counts.in_progress == 1)
        .await
        .unwrap();
    first.shutdown().await;

    let second = service_with(full_registry(Arc::new(stalled())), Arc::clone(&store), quick_config());
    let (left, right) = tokio::join!(second.recover(id), second.recover(id));
    let started = [&left, &right].iter().filter(|r| r.is_ok()).count();
    assert_eq!(started, 1, "left: {left:?}, right: {right:?}");
    assert!(
        [left, right]
            .into_iter()
            .any(|r| matches!(r, Err(InvestigationError::InvalidTransition(_))))
    );
    assert_eq!(second.running(), vec![id]);

    let missing = InvestigationID::new();
    assert!(second.recover(missing).await.is_err());
    assert_eq!(second.running(), vec![id]);

    let (left, right) = tokio::join!(second.get_status(id), second.get_status(id));
    assert_eq!(left.unwrap().id, right.unwrap().id);

    second.shutdown().await;
}

#[tokio::test]
async fn recovered_investigation_redispatches_unfinished_work() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn InvestigationStore> = Arc::new(JsonFileStore::open(dir.path()).await.unwrap());

    let stalled = FixtureWorker::new("stalled")
        .with_latency(Duration::from_secs(30))
        .with_fixture(
            "collect-web",
            "acme",
            FixtureResponse::Evidence {
                items: vec![draft("acme", 90, 90)],
            },
        );
    let first = service_with(full_registry(Arc::new(stalled)), Arc::clone(&store), quick_config());
    let id = first
        .start_investigation(spec(
            vec![target("acme", &["collect-web"])],
            &["analyze-corroboration"],
            &["synthesize-assessment"],
        ))
        .await
        .unwrap();
    wait_until(&first, id, |s| s.task_counts.in_progress == 1)
        .await
        .unwrap();
    first.shutdown().await;

    let saved = store.load(id).await.unwrap();
    assert_eq!(saved.phase, Phase::Collection);
    assert!(saved.has_live_tasks());

    let ready = FixtureWorker::new("ready").with_fixture(
        "collect-web",
        "acme",
        FixtureResponse::Evidence {
            items: vec![draft("acme", 90, 90)],
        },
    );
    let second = service_with(full_registry(Arc::new(ready)), Arc::clone(&store), quick_config());
    second.recover(id).await.unwrap();
    assert!(matches!(
        second.recover(id).await,
        Err(InvestigationError::InvalidTransition(_))
    ));

    let snapshot = wait_for_status(&second, id, InvestigationStatus::Completed)
        .await
        .unwrap();
    assert_eq!(snapshot.evidence_count, 1);

    let record: InvestigationRecord = store.load(id).await.unwrap();
    let collect = record
        .tasks
        .values()
        .find(|t| t.phase == Phase::Collection)
        .unwrap();
    assert_eq!(collect.status, TaskStatus::Completed);
    assert!(
        collect
            .annotations
            .iter()
            .any(|a| a.contains("re-dispatched after recovery"))
    );

    second.shutdown().await;
}

mock! {
    pub FlakyStore {}

    #[async_trait]
    impl InvestigationStore for FlakyStore {
        async fn load(&self, id: InvestigationID) -> dossier_core::Result<InvestigationRecord>;
        async fn save(&self, record: &InvestigationRecord) -> dossier_core::Result<()>;
        async fn list(&self) -> dossier_core::Result<Vec<InvestigationID>>;
    }
}

#[tokio::test]
async fn exhausted_saves_fail_the_investigation() {
    let saves = Arc::new(AtomicUsize::new(0));
    let mut store = MockFlakyStore::new();
    let counter = Arc::clone(&saves);
    store.expect_save().returning(move |_| {
        // the initial save at start succeeds, every later one fails
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(())
        } else {
            Err(InvestigationError::Persistence("disk full".into()))
        }
    });

    let mut config = quick_config();
    config.runtime.save_attempts = 2;
    let service = service_with(
        full_registry(Arc::new(FixtureWorker::new("unused"))),
        Arc::new(store),
        config,
    );
    let id = service
        .start_investigation(spec(vec![target("acme", &["collect-web"])], &[], &[]))
        .await
        .unwrap();

    let snapshot = wait_for_status(&service, id, InvestigationStatus::Failed)
        .await
        .unwrap();
    let reason = snapshot.failure_reason.unwrap_or_default();
    assert!(reason.contains("disk full"), "reason was {reason}");
    assert!(saves.load(Ordering::SeqCst) >= 3);

    service.shutdown().await;
}
