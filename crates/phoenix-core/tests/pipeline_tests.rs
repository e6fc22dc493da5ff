//! Spec-to-report workflows.

use std::sync::Arc;

use phoenix_core::config::EngineConfig;
use phoenix_core::engine::Platform;
use phoenix_core::parser::SpecDocument;
use phoenix_core::pipeline::WorkflowRequest;
use phoenix_exec::ScriptedBackend;
use phoenix_types::*;

const BOARD_YAML: &str = r#"
title: Gateway board
soc: BCM6858
vendor: Broadcom
architecture: aarch64
cpu:
  type: ARM Cortex-B53
  cores: 4
  frequency_mhz: 1500
memory:
  type: DDR4
  size_mb: 512
capabilities:
  - id: CAP_ETH
    name: Ethernet
    category: network
  - id: CAP_WIFI
    name: WiFi
    category: wifi
"#;

const REQUIREMENTS_YAML: &str = r#"
requirements:
  - id: SEC_1
    title: Secure boot
    description: Firmware must be signed
    category: security
    severity: critical
"#;

/// Eight boot tests, two capability tests and one requirement test.
const EXPECTED_TESTS: usize = 11;

fn platform(backend: ScriptedBackend) -> Platform {
    Platform::with_backend(EngineConfig::default(), Arc::new(backend)).unwrap()
}

fn documents() -> Vec<SpecDocument> {
    vec![
        SpecDocument::new("board.yaml", BOARD_YAML),
        SpecDocument::new("requirements.yaml", REQUIREMENTS_YAML),
    ]
}

fn request(documents: Vec<SpecDocument>, emulator_id: Option<&str>) -> WorkflowRequest {
    WorkflowRequest {
        board_name: "Gateway".into(),
        documents,
        firmware: vec![0x7F; 2048],
        emulator_id: emulator_id.map(str::to_string),
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_workflow() {
    let platform = platform(ScriptedBackend::new());
    let summary = platform
        .pipeline()
        .run_workflow(request(documents(), None))
        .await
        .unwrap();

    assert_eq!(summary.status, WorkflowStatus::Completed);
    assert_eq!(summary.tests_generated, EXPECTED_TESTS);
    assert_eq!(summary.verdict, Verdict::Pass);
    assert_eq!(summary.summary.total, EXPECTED_TESTS);
    assert!(summary.parse_failures.is_empty());
    assert!(summary.emulator_id.starts_with("EMU_"));

    let emulator = platform.registry().get_emulator(&summary.emulator_id).unwrap();
    assert_eq!(emulator.vendor, "Broadcom");
    assert_eq!(emulator.hardware.memory.size_mb, 512);
    assert_eq!(emulator.status, EmulatorStatus::Ready);

    let tests = platform.registry().list_tests(&summary.emulator_id);
    assert_eq!(tests.len(), EXPECTED_TESTS);
    assert!(tests.iter().any(|t| t.id == "CAP_ETH_FUNC_001"));
    assert!(tests.iter().any(|t| t.id == "REQ_SEC_1_TEST"));

    let report = platform.registry().get_report(&summary.report_id).unwrap();
    assert_eq!(report.workflow_id.as_deref(), Some(summary.workflow_id.as_str()));
    assert_eq!(report.session_id, summary.session_id);

    let workflow = platform.pipeline().get_workflow(&summary.workflow_id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(workflow.stages.iter().all(|s| s.outcome == StageOutcome::Completed));
    assert_eq!(workflow.report_id.as_deref(), Some(summary.report_id.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_parse_failure_degrades_but_continues() {
    let platform = platform(ScriptedBackend::new());
    let mut docs = documents();
    docs.push(SpecDocument::new("blob.yaml", vec![0u8, 1, 2, 3]));

    let summary = platform
        .pipeline()
        .run_workflow(request(docs, None))
        .await
        .unwrap();

    assert_eq!(summary.status, WorkflowStatus::Completed);
    assert_eq!(summary.parse_failures.len(), 1);
    assert!(summary.parse_failures[0].contains("blob.yaml"));
    assert_eq!(summary.tests_generated, EXPECTED_TESTS);

    let workflow = platform.pipeline().get_workflow(&summary.workflow_id).unwrap();
    assert!(matches!(
        workflow.stage(Stage::Parse),
        Some(StageOutcome::Degraded { notes }) if notes.len() == 1
    ));
    assert_eq!(workflow.stage(Stage::Execute), Some(&StageOutcome::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_existing_emulator_id_is_reused() {
    let platform = platform(ScriptedBackend::new());
    platform
        .registry()
        .upsert_emulator(Emulator::new("EMU-FIXED", "Existing board"))
        .unwrap();

    let summary = platform
        .pipeline()
        .run_workflow(request(documents(), Some("EMU-FIXED")))
        .await
        .unwrap();

    assert_eq!(summary.emulator_id, "EMU-FIXED");
    let emulators = platform.registry().list_emulators();
    assert_eq!(emulators.len(), 1);
    assert_eq!(emulators[0].board_name, "Existing board");
    // Tests derive from the existing entry, which has no capabilities.
    assert_eq!(summary.tests_generated, 8);
}

#[tokio::test(start_paused = true)]
async fn test_unstartable_execution_still_reports() {
    let platform = platform(ScriptedBackend::new());
    let mut emulator = Emulator::new("EMU-OFF", "Offline board");
    emulator.status = EmulatorStatus::Created;
    platform.registry().upsert_emulator(emulator).unwrap();

    let summary = platform
        .pipeline()
        .run_workflow(request(documents(), Some("EMU-OFF")))
        .await
        .unwrap();

    assert_eq!(summary.status, WorkflowStatus::Failed);
    assert_eq!(summary.verdict, Verdict::Fail);
    assert_eq!(summary.summary.total, summary.tests_generated);
    assert_eq!(summary.summary.errors, summary.tests_generated);
    assert!(summary.session_id.is_none());

    // Generated tests and the best-effort report stay queryable.
    assert_eq!(platform.registry().list_tests("EMU-OFF").len(), summary.tests_generated);
    let report = platform.registry().get_report(&summary.report_id).unwrap();
    assert!(report.firmware.is_some());

    let workflow = platform.pipeline().get_workflow(&summary.workflow_id).unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert!(matches!(workflow.stage(Stage::Execute), Some(StageOutcome::Failed { .. })));
    assert_eq!(workflow.stage(Stage::Aggregate), Some(&StageOutcome::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_backend_fails_workflow() {
    let platform = platform(ScriptedBackend::new().unreachable_after(3));
    let summary = platform
        .pipeline()
        .run_workflow(request(documents(), None))
        .await
        .unwrap();

    assert_eq!(summary.status, WorkflowStatus::Failed);
    assert_eq!(summary.summary.total, EXPECTED_TESTS);
    assert_eq!(summary.summary.passed, 3);
    assert_eq!(summary.verdict, Verdict::Fail);

    let session_id = summary.session_id.unwrap();
    assert_eq!(
        platform.sessions().get_status(&session_id).unwrap(),
        SessionState::Failed
    );
    let workflow = platform.pipeline().get_workflow(&summary.workflow_id).unwrap();
    assert!(matches!(
        workflow.stage(Stage::Execute),
        Some(StageOutcome::Failed { reason }) if reason.contains("unreachable")
    ));
}

#[tokio::test]
async fn test_workflow_input_validation() {
    let platform = platform(ScriptedBackend::new());

    let mut req = request(documents(), None);
    req.board_name = "  ".into();
    let err = platform.pipeline().run_workflow(req).await.unwrap_err();
    assert_eq!(err.kind(), "validation");

    let mut req = request(documents(), None);
    req.firmware.clear();
    let err = platform.pipeline().run_workflow(req).await.unwrap_err();
    assert_eq!(err.kind(), "validation");

    assert!(platform.pipeline().latest_workflow().is_none());
    assert!(platform.registry().list_emulators().is_empty());
}

#[tokio::test]
async fn test_create_emulator_and_generate_tests() {
    let platform = platform(ScriptedBackend::new());
    let registration = platform
        .pipeline()
        .create_emulator("Gateway", &documents(), None)
        .unwrap();
    assert!(registration.created);
    assert_eq!(registration.emulator.soc_id, "BCM6858");
    assert_eq!(
        registration.emulator.source_documents,
        vec!["board.yaml".to_string(), "requirements.yaml".to_string()]
    );
    let id = registration.emulator.id.clone();

    // No tests until generated.
    assert!(platform.registry().list_tests(&id).is_empty());
    let tests = platform.pipeline().generate_tests(&id).await.unwrap();
    assert_eq!(tests.len(), EXPECTED_TESTS);
    // Regenerating is idempotent.
    platform.pipeline().generate_tests(&id).await.unwrap();
    assert_eq!(platform.registry().list_tests(&id).len(), EXPECTED_TESTS);

    assert_eq!(platform.registry().list_emulators_by_vendor("broadcom").len(), 1);

    let err = platform.pipeline().generate_tests("EMU_MISSING").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
