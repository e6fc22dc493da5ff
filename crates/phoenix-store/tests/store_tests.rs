//! Durability and ordering tests for the LogBuffer and Registry.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use phoenix_store::{LogBuffer, Registry, StoreError};
use phoenix_types::*;

fn sample_report(id: &str, emulator_id: &str, session_id: &str) -> VerificationReport {
    VerificationReport {
        report_id: id.into(),
        session_id: Some(session_id.into()),
        workflow_id: None,
        emulator_id: emulator_id.into(),
        board_name: "board".into(),
        firmware: Some(FirmwareInfo::new("ab".into(), 10)),
        created_at: Utc::now(),
        outcome: ReportOutcome {
            verdict: Verdict::Pass,
            summary: Summary {
                passed: 1,
                failed: 0,
                total: 1,
                pass_rate: 100.0,
                errors: 0,
                degenerate: false,
            },
            recommendations: vec![],
            feature_coverage: FeatureCoverage::default(),
            boot_analysis: BootAnalysis::default(),
            duration_sec: 0.5,
        },
        test_results: vec![TestResult::new("T1", TestStatus::Passed, 0.5)],
    }
}

// ── LogBuffer ───────────────────────────────────────────────────────

#[test]
fn test_log_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buf = LogBuffer::open(dir.path()).unwrap();
        for i in 0..4 {
            buf.append("SES_1", format!("line {i}")).unwrap();
        }
        buf.append("SES_2", "other").unwrap();
    }

    let buf = LogBuffer::open(dir.path()).unwrap();
    let all = buf.read("SES_1", 0);
    assert_eq!(all.len(), 4);
    assert_eq!(all[3].message, "line 3");
    assert_eq!(buf.len("SES_2"), 1);

    // Sequence numbering resumes where it left off.
    assert_eq!(buf.append("SES_1", "after restart").unwrap().sequence, 4);
}

#[test]
fn test_torn_trailing_line_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buf = LogBuffer::open(dir.path()).unwrap();
        buf.append("SES_T", "ok").unwrap();
    }
    let path = dir.path().join("SES_T.jsonl");
    let mut raw = std::fs::read(&path).unwrap();
    raw.extend_from_slice(b"{\"session_id\":\"SES_T\",\"seq");
    std::fs::write(&path, raw).unwrap();

    {
        let buf = LogBuffer::open(dir.path()).unwrap();
        assert_eq!(buf.len("SES_T"), 1);
        assert_eq!(buf.append("SES_T", "next").unwrap().sequence, 1);
        assert_eq!(buf.append("SES_T", "last").unwrap().sequence, 2);
    }

    // Entries written after the first restart survive the second one.
    let buf = LogBuffer::open(dir.path()).unwrap();
    let all = buf.read("SES_T", 0);
    assert_eq!(all.len(), 3);
    assert_eq!(all[2].message, "last");
    assert_eq!(buf.append("SES_T", "again").unwrap().sequence, 3);
}

#[test]
fn test_tail_cut_inside_utf8_char_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buf = LogBuffer::open(dir.path()).unwrap();
        buf.append("SES_U", "first").unwrap();
        buf.append("SES_U", "second").unwrap();
    }
    let path = dir.path().join("SES_U.jsonl");
    let mut raw = std::fs::read(&path).unwrap();
    raw.extend_from_slice(b"{\"session_id\":\"SES_U\",\"sequence\":2,\"message\":\"caf\xc3");
    std::fs::write(&path, raw).unwrap();

    {
        let buf = LogBuffer::open(dir.path()).unwrap();
        assert_eq!(buf.len("SES_U"), 2);
        buf.append("SES_U", "café").unwrap();
    }

    let buf = LogBuffer::open(dir.path()).unwrap();
    let all = buf.read("SES_U", 0);
    assert_eq!(all.len(), 3);
    assert_eq!(all[2].sequence, 2);
    assert_eq!(all[2].message, "café");
}

#[test]
fn test_unterminated_final_line_is_not_kept() {
    let dir = tempfile::tempdir().unwrap();
    {
        let buf = LogBuffer::open(dir.path()).unwrap();
        buf.append("SES_N", "kept").unwrap();
        buf.append("SES_N", "cut before newline").unwrap();
    }
    let path = dir.path().join("SES_N.jsonl");
    let mut raw = std::fs::read(&path).unwrap();
    assert_eq!(raw.pop(), Some(b'\n'));
    std::fs::write(&path, raw).unwrap();

    {
        let buf = LogBuffer::open(dir.path()).unwrap();
        assert_eq!(buf.len("SES_N"), 1);
        assert_eq!(buf.append("SES_N", "replacement").unwrap().sequence, 1);
    }
    let buf = LogBuffer::open(dir.path()).unwrap();
    assert_eq!(buf.read("SES_N", 1)[0].message, "replacement");
}

#[test]
fn test_incremental_polling_sees_every_entry_once() {
    let buf = Arc::new(LogBuffer::in_memory());
    let writer = {
        let buf = Arc::clone(&buf);
        thread::spawn(move || {
            for i in 0..500 {
                buf.append("S", format!("m{i}")).unwrap();
            }
        })
    };

    let mut seen = Vec::new();
    let mut offset = 0;
    while seen.len() < 500 {
        let batch = buf.read("S", offset);
        // A duplicated poll at the same offset must return the same prefix.
        let again = buf.read("S", offset);
        assert!(again.len() >= batch.len());
        assert_eq!(&again[..batch.len()], &batch[..]);

        offset += batch.len() as u64;
        seen.extend(batch);
    }
    writer.join().unwrap();

    let seqs: Vec<u64> = seen.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (0..500).collect();
    assert_eq!(seqs, expected);
    assert_eq!(buf.read("S", 0), seen);
}

#[test]
fn test_concurrent_sessions_keep_independent_sequences() {
    let buf = Arc::new(LogBuffer::in_memory());
    let handles: Vec<_> = (0..4)
        .map(|n| {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                let id = format!("S{n}");
                for _ in 0..100 {
                    buf.append(&id, "x").unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    for n in 0..4 {
        let entries = buf.read(&format!("S{n}"), 0);
        assert_eq!(entries.len(), 100);
        assert!(entries.iter().enumerate().all(|(i, e)| e.sequence == i as u64));
    }
}

// ── Registry ────────────────────────────────────────────────────────

#[test]
fn test_registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let reg = Registry::open(dir.path()).unwrap();
        reg.upsert_emulator(Emulator::new("EMU-1", "board one")).unwrap();
        reg.upsert_emulator(Emulator::new("EMU-2", "board two")).unwrap();
        reg.upsert_tests(
            "EMU-1",
            vec![TestCase::new("BOOT_001", "Cold boot", TestCategory::Boot, Severity::Critical)],
        )
        .unwrap();
        reg.upsert_report(sample_report("RPT_1", "EMU-1", "SES_1")).unwrap();
    }

    let reg = Registry::open(dir.path()).unwrap();
    let ids: Vec<String> = reg.list_emulators().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec!["EMU-1", "EMU-2"]);
    assert_eq!(reg.list_tests("EMU-1").len(), 1);
    let report = reg.get_report("RPT_1").unwrap();
    assert_eq!(report.outcome.verdict, Verdict::Pass);
    assert_eq!(reg.report_for_session("SES_1").unwrap().report_id, "RPT_1");
}

#[test]
fn test_registry_rejects_unknown_version() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("registry.json"),
        r#"{"version":99,"emulators":[],"tests":[],"sessions":[],"reports":[]}"#,
    )
    .unwrap();
    match Registry::open(dir.path()) {
        Err(StoreError::VersionMismatch { found, expected }) => {
            assert_eq!(found, 99);
            assert_eq!(expected, 1);
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected a version mismatch"),
    }
}

#[test]
fn test_listings_are_stable_and_filterable() {
    let reg = Registry::in_memory();
    reg.upsert_report(sample_report("R1", "EMU-A", "S1")).unwrap();
    reg.upsert_report(sample_report("R2", "EMU-B", "S2")).unwrap();
    reg.upsert_report(sample_report("R3", "EMU-A", "S3")).unwrap();
    reg.upsert_report(sample_report("R1", "EMU-A", "S1")).unwrap();

    let first: Vec<String> = reg.list_reports().into_iter().map(|r| r.report_id).collect();
    let second: Vec<String> = reg.list_reports().into_iter().map(|r| r.report_id).collect();
    assert_eq!(first, vec!["R1", "R2", "R3"]);
    assert_eq!(first, second);

    let for_a: Vec<String> = reg
        .list_reports_for("EMU-A")
        .into_iter()
        .map(|r| r.report_id)
        .collect();
    assert_eq!(for_a, vec!["R1", "R3"]);
}

#[test]
fn test_sessions_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let session = VerificationSession {
        id: "SES_X".into(),
        emulator_id: "EMU-1".into(),
        firmware_sha256: "00".into(),
        firmware_size: 4,
        state: SessionState::Running,
        created_at: Utc::now(),
        completed_at: None,
        workflow_id: None,
        failure: None,
    };
    {
        let reg = Registry::open(dir.path()).unwrap();
        reg.upsert_session(session.clone()).unwrap();
    }
    let reg = Registry::open(dir.path()).unwrap();
    assert_eq!(reg.get_session("SES_X"), Some(session));
    assert_eq!(reg.list_sessions().len(), 1);
}

#[test]
fn test_outcome_commits_session_and_report_together() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = VerificationSession {
        id: "SES_O".into(),
        emulator_id: "EMU-1".into(),
        firmware_sha256: "00".into(),
        firmware_size: 4,
        state: SessionState::Running,
        created_at: Utc::now(),
        completed_at: None,
        workflow_id: None,
        failure: None,
    };
    {
        let reg = Registry::open(dir.path()).unwrap();
        reg.upsert_session(session.clone()).unwrap();
        session.state = SessionState::Completed;
        session.completed_at = Some(Utc::now());
        reg.record_outcome(session.clone(), Some(sample_report("RPT_O", "EMU-1", "SES_O")))
            .unwrap();
    }

    let reg = Registry::open(dir.path()).unwrap();
    assert_eq!(reg.get_session("SES_O").unwrap().state, SessionState::Completed);
    assert_eq!(reg.report_for_session("SES_O").unwrap().report_id, "RPT_O");
    assert_eq!(reg.list_sessions().len(), 1);
    assert_eq!(reg.list_reports().len(), 1);
}
