use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use phoenix_core::api::handle_request;
use phoenix_core::config::EngineConfig;
use phoenix_core::engine::Platform;
use phoenix_exec::ScriptedBackend;
use phoenix_types::{Emulator, Severity, TestCase, TestCategory};
use serde_json::{json, Value};

const BOARD_YAML: &str = "vendor: Acme\nsoc: AC100\ncapabilities:\n  - id: CAP_USB\n    name: USB host\n    category: usb\n";

fn make_state(backend: ScriptedBackend) -> Platform {
    Platform::with_backend(EngineConfig::default(), Arc::new(backend)).unwrap()
}

fn make_request(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    })
}

fn tool_call(name: &str, arguments: Value) -> Value {
    make_request("tools/call", json!({"name": name, "arguments": arguments}))
}

fn parse_tool_response(resp: &Value) -> Value {
    let content = &resp["result"]["content"][0];
    serde_json::from_str(content["text"].as_str().unwrap()).unwrap()
}

fn register(platform: &Platform) {
    platform
        .registry()
        .upsert_emulator(Emulator::new("EMU-1", "Test Board"))
        .unwrap();
    platform
        .registry()
        .upsert_tests(
            "EMU-1",
            vec![
                TestCase::new("T1", "first", TestCategory::Boot, Severity::Critical),
                TestCase::new("T2", "second", TestCategory::Network, Severity::High),
            ],
        )
        .unwrap();
}

#[tokio::test]
async fn test_initialize() {
    let platform = make_state(ScriptedBackend::new());
    let req = make_request(
        "initialize",
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "test", "version": "1.0" }
        }),
    );
    let resp = handle_request(&req, &platform).await;
    assert_eq!(resp["jsonrpc"], "2.0");
    assert_eq!(resp["id"], 1);
    assert_eq!(resp["result"]["serverInfo"]["name"], "phoenixd");
    assert!(resp["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn test_tools_list() {
    let platform = make_state(ScriptedBackend::new());
    let resp = handle_request(&make_request("tools/list", json!({})), &platform).await;
    let tools = resp["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    for expected in [
        "create_session",
        "run_session",
        "get_logs",
        "get_results",
        "list_emulators",
        "run_workflow",
        "generate_tests",
        "list_tests",
        "list_reports",
        "create_emulator",
        "parse_document",
        "get_workflow",
        "platform_status",
    ] {
        assert!(names.contains(&expected), "missing tool {expected}");
    }
    let create = tools.iter().find(|t| t["name"] == "create_session").unwrap();
    assert_eq!(create["inputSchema"]["required"], json!(["emulator_id", "firmware_base64"]));
}

#[tokio::test]
async fn test_unknown_method() {
    let platform = make_state(ScriptedBackend::new());
    let resp = handle_request(&make_request("reboot", json!({})), &platform).await;
    assert_eq!(resp["error"]["code"], -32601);
}

#[tokio::test(start_paused = true)]
async fn test_session_round_trip() {
    let platform = make_state(ScriptedBackend::new().fail("T2").with_delay(Duration::from_millis(100)));
    register(&platform);

    let firmware = BASE64.encode(vec![0xEE; 4096]);
    let resp = handle_request(
        &make_request("create_session", json!({"emulator_id": "EMU-1", "firmware_base64": firmware})),
        &platform,
    )
    .await;
    let session_id = resp["result"]["session_id"].as_str().unwrap().to_string();
    assert_eq!(resp["result"]["state"], "uploaded");
    assert_eq!(resp["result"]["firmware_info"]["size_bytes"], 4096);
    assert_eq!(resp["result"]["firmware_info"]["sha256"].as_str().unwrap().len(), 64);

    // Results are not available before the run finishes.
    let resp = handle_request(&make_request("get_results", json!({"session_id": session_id})), &platform).await;
    assert_eq!(resp["error"]["data"]["kind"], "state_conflict");

    let resp = handle_request(&make_request("run_session", json!({"session_id": session_id})), &platform).await;
    assert_eq!(resp["result"]["accepted"], true);

    let mut offset = 0;
    let mut messages = Vec::new();
    loop {
        let resp = handle_request(
            &make_request("get_logs", json!({"session_id": session_id, "offset": offset})),
            &platform,
        )
        .await;
        let page = &resp["result"];
        for entry in page["logs"].as_array().unwrap() {
            assert_eq!(entry["sequence"], offset);
            offset += 1;
            messages.push(entry["message"].as_str().unwrap().to_string());
        }
        if page["status"] == "completed" || page["status"] == "failed" {
            assert_eq!(page["status"], "completed");
            break;
        }
        tokio::time::sleep(Duration::from_millis(75)).await;
    }
    assert!(messages.iter().any(|m| m.contains("START T1")));
    assert!(messages.last().unwrap().starts_with("Execution finished"));

    let resp = handle_request(&make_request("get_results", json!({"session_id": session_id})), &platform).await;
    let report = &resp["result"]["report"];
    assert_eq!(report["verdict"], "FAIL");
    assert_eq!(report["summary"]["passed"], 1);
    assert_eq!(report["summary"]["total"], 2);
    assert_eq!(report["summary"]["pass_rate"], 50.0);

    let resp = handle_request(&make_request("run_session", json!({"session_id": session_id})), &platform).await;
    assert_eq!(resp["error"]["code"], -32002);
    assert_eq!(resp["error"]["data"]["kind"], "state_conflict");
}

#[tokio::test]
async fn test_errors_carry_kind() {
    let platform = make_state(ScriptedBackend::new());
    register(&platform);

    let resp = handle_request(&make_request("get_logs", json!({"session_id": "SES_NOPE"})), &platform).await;
    assert_eq!(resp["error"]["code"], -32001);
    assert_eq!(resp["error"]["data"]["kind"], "not_found");

    let resp = handle_request(&make_request("create_session", json!({"emulator_id": "EMU-1"})), &platform).await;
    assert_eq!(resp["error"]["code"], -32602);
    assert_eq!(resp["error"]["data"]["kind"], "validation");

    let resp = handle_request(
        &make_request("create_session", json!({"emulator_id": "EMU-1", "firmware_base64": "***"})),
        &platform,
    )
    .await;
    assert_eq!(resp["error"]["data"]["kind"], "validation");

    let resp = handle_request(
        &make_request("get_logs", json!({"session_id": "SES_NOPE", "offset": -1})),
        &platform,
    )
    .await;
    assert_eq!(resp["error"]["data"]["kind"], "validation");
}

#[tokio::test]
async fn test_tools_call_emulator_flow() {
    let platform = make_state(ScriptedBackend::new());

    let resp = handle_request(
        &tool_call(
            "create_emulator",
            json!({
                "board_name": "Acme router",
                "emulator_id": "EMU-ACME",
                "spec_files": [{"name": "board.yaml", "content_base64": BASE64.encode(BOARD_YAML)}],
            }),
        ),
        &platform,
    )
    .await;
    let body = parse_tool_response(&resp);
    assert_eq!(body["created"], true);
    assert_eq!(body["emulator"]["id"], "EMU-ACME");
    assert_eq!(body["emulator"]["vendor"], "Acme");

    let body = parse_tool_response(
        &handle_request(&tool_call("list_emulators", json!({"vendor": "ACME"})), &platform).await,
    );
    assert_eq!(body["emulators"].as_array().unwrap().len(), 1);

    let body = parse_tool_response(
        &handle_request(&tool_call("generate_tests", json!({"emulator_id": "EMU-ACME"})), &platform).await,
    );
    assert_eq!(body["total_tests"], 9);

    let body = parse_tool_response(
        &handle_request(&tool_call("list_tests", json!({"emulator_id": "EMU-ACME"})), &platform).await,
    );
    let ids: Vec<&str> = body["tests"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids[0], "BOOT_COLD_001");
    assert!(ids.contains(&"CAP_USB_FUNC_001"));

    let body = parse_tool_response(
        &handle_request(&tool_call("list_tests", json!({"emulator_id": "EMU-UNKNOWN"})), &platform).await,
    );
    assert_eq!(body["tests"], json!([]));
}

#[tokio::test]
async fn test_tools_call_errors() {
    let platform = make_state(ScriptedBackend::new());

    let resp = handle_request(&tool_call("teleport", json!({})), &platform).await;
    assert_eq!(resp["result"]["isError"], true);

    let resp = handle_request(&tool_call("get_workflow", json!({"workflow_id": "WF_NOPE"})), &platform).await;
    assert_eq!(resp["result"]["isError"], true);
    let body = parse_tool_response(&resp);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_parse_document() {
    let platform = make_state(ScriptedBackend::new());
    let resp = handle_request(
        &make_request(
            "parse_document",
            json!({"name": "board.yaml", "content_base64": BASE64.encode(BOARD_YAML)}),
        ),
        &platform,
    )
    .await;
    let doc = &resp["result"];
    assert_eq!(doc["format"], "yaml");
    assert_eq!(doc["capabilities"][0]["id"], "CAP_USB");
    assert_eq!(doc["hardware"]["vendor"], "Acme");

    let resp = handle_request(
        &make_request(
            "parse_document",
            json!({"name": "bad.yaml", "content_base64": BASE64.encode("requirements:\n  - {id: R1, severity: urgent}\n")}),
        ),
        &platform,
    )
    .await;
    assert_eq!(resp["error"]["data"]["kind"], "validation");
}

#[tokio::test(start_paused = true)]
async fn test_run_workflow_and_status() {
    let platform = make_state(ScriptedBackend::new());
    let resp = handle_request(
        &tool_call(
            "run_workflow",
            json!({
                "board_name": "Acme router",
                "firmware_base64": BASE64.encode(vec![1u8; 512]),
                "spec_files": [{"name": "board.yaml", "content_base64": BASE64.encode(BOARD_YAML)}],
            }),
        ),
        &platform,
    )
    .await;
    let summary = parse_tool_response(&resp);
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["tests_generated"], 9);
    assert_eq!(summary["verdict"], "PASS");
    let workflow_id = summary["workflow_id"].as_str().unwrap();

    let resp = handle_request(&make_request("get_workflow", json!({"workflow_id": workflow_id})), &platform).await;
    assert_eq!(resp["result"]["status"], "completed");
    assert_eq!(resp["result"]["stages"].as_array().unwrap().len(), 5);

    let resp = handle_request(&make_request("list_reports", json!({})), &platform).await;
    assert_eq!(resp["result"]["reports"].as_array().unwrap().len(), 1);
    let report_id = summary["report_id"].as_str().unwrap();
    let resp = handle_request(&make_request("get_report", json!({"report_id": report_id})), &platform).await;
    assert_eq!(resp["result"]["report"]["workflow_id"], workflow_id);

    let resp = handle_request(&make_request("platform_status", json!({})), &platform).await;
    let status = &resp["result"];
    assert_eq!(status["components"]["test_executor"], "completed");
    assert_eq!(status["components"]["report_generator"], "completed");
    assert_eq!(status["latest_workflow"]["id"], workflow_id);
    assert_eq!(status["sessions"]["completed"], 1);
    assert_eq!(status["emulators"], 1);
}
