//! JSON-RPC 2.0 request surface.
//!
//! Every operation is reachable two ways: as a plain method (`create_session`,
//! `get_logs`, ...) whose result is the operation's payload, or through
//! `tools/call` with the payload serialized into a text content block.
//! Binary inputs (firmware, documents) travel base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use phoenix_types::{VerifyError, VerifyResult};
use serde::Serialize;
use serde_json::{json, Value};

use crate::engine::Platform;
use crate::parser::SpecDocument;
use crate::pipeline::WorkflowRequest;

const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

/// `(name, description, required arguments)` for every operation.
const OPERATIONS: &[(&str, &str, &[&str])] = &[
    ("create_session", "Upload firmware against a registered emulator", &["emulator_id", "firmware_base64"]),
    ("run_session", "Start executing an uploaded session", &["session_id"]),
    ("get_status", "Current state of a session", &["session_id"]),
    ("get_logs", "Session log entries from an offset, plus the session state", &["session_id"]),
    ("get_results", "Verification report of a finished session", &["session_id"]),
    ("list_emulators", "Registered emulators, optionally filtered by vendor", &[]),
    ("create_emulator", "Parse specification documents and register an emulator", &["board_name"]),
    ("parse_document", "Parse one specification document", &["name", "content_base64"]),
    ("generate_tests", "Generate and store boot and feature tests for an emulator", &["emulator_id"]),
    ("list_tests", "Tests registered for an emulator", &["emulator_id"]),
    ("list_reports", "Stored reports, optionally filtered by emulator", &[]),
    ("get_report", "One stored report", &["report_id"]),
    ("run_workflow", "Run the full spec-to-report pipeline", &["board_name", "firmware_base64"]),
    ("get_workflow", "State of a workflow and its stages", &["workflow_id"]),
    ("platform_status", "Component statuses, latest workflow and session counts", &[]),
];

/// Handle a single JSON-RPC request and return a JSON-RPC response.
pub async fn handle_request(req: &Value, platform: &Platform) -> Value {
    let id = req.get("id").cloned().unwrap_or(Value::Null);
    let method = req.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let params = req.get("params").cloned().unwrap_or(json!({}));

    match method {
        "initialize" => json_rpc_result(id, handle_initialize()),
        "tools/list" => json_rpc_result(id, handle_tools_list()),
        "tools/call" => json_rpc_result(id, handle_tools_call(&params, platform).await),
        m if is_operation(m) => match dispatch(m, &params, platform).await {
            Ok(result) => json_rpc_result(id, result),
            Err(e) => json_rpc_verify_error(id, &e),
        },
        _ => json_rpc_error(id, METHOD_NOT_FOUND, "Method not found", None),
    }
}

fn is_operation(name: &str) -> bool {
    OPERATIONS.iter().any(|(op, _, _)| *op == name)
}

fn handle_initialize() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "serverInfo": {
            "name": "phoenixd",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "tools": {}
        }
    })
}

fn handle_tools_list() -> Value {
    let tools: Vec<Value> = OPERATIONS
        .iter()
        .map(|(name, description, required)| {
            json!({
                "name": name,
                "description": description,
                "inputSchema": {
                    "type": "object",
                    "required": required,
                }
            })
        })
        .collect();
    json!({ "tools": tools })
}

async fn handle_tools_call(params: &Value, platform: &Platform) -> Value {
    let tool_name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    if !is_operation(tool_name) {
        return tool_error(json!({"error": format!("Unknown tool: {tool_name}")}));
    }
    match dispatch(tool_name, &arguments, platform).await {
        Ok(result) => json!({
            "content": [{
                "type": "text",
                "text": result.to_string()
            }]
        }),
        Err(e) => tool_error(json!({"error": e.to_string(), "kind": e.kind()})),
    }
}

fn tool_error(body: Value) -> Value {
    json!({
        "isError": true,
        "content": [{
            "type": "text",
            "text": body.to_string()
        }]
    })
}

// ── Operations ───────────────────────────────────────────────────────

async fn dispatch(method: &str, args: &Value, platform: &Platform) -> VerifyResult<Value> {
    let sessions = platform.sessions();
    let registry = platform.registry();
    let pipeline = platform.pipeline();

    match method {
        "create_session" => {
            let emulator_id = str_arg(args, "emulator_id")?;
            let firmware = base64_arg(args, "firmware_base64")?;
            let session = sessions.create(emulator_id, firmware)?;
            Ok(json!({
                "session_id": session.id,
                "state": session.state,
                "firmware_info": session.firmware_info(),
            }))
        }
        "run_session" => {
            let session_id = str_arg(args, "session_id")?;
            sessions.run(session_id)?;
            Ok(json!({"accepted": true, "session_id": session_id}))
        }
        "get_status" => {
            let session_id = str_arg(args, "session_id")?;
            Ok(json!({"session_id": session_id, "status": sessions.get_status(session_id)?}))
        }
        "get_logs" => {
            let session_id = str_arg(args, "session_id")?;
            let offset = match args.get("offset") {
                None | Some(Value::Null) => 0,
                Some(v) => v
                    .as_u64()
                    .ok_or_else(|| VerifyError::validation("offset must be a non-negative integer"))?,
            };
            to_value(sessions.logs(session_id, offset)?)
        }
        "get_results" => {
            let report = sessions.results(str_arg(args, "session_id")?)?;
            Ok(json!({ "report": report }))
        }
        "list_emulators" => {
            let emulators = match opt_str_arg(args, "vendor") {
                Some(vendor) => registry.list_emulators_by_vendor(vendor),
                None => registry.list_emulators(),
            };
            Ok(json!({ "emulators": emulators }))
        }
        "create_emulator" => {
            let board_name = str_arg(args, "board_name")?;
            let documents = documents_arg(args)?;
            let emulator_id = opt_str_arg(args, "emulator_id").map(str::to_string);
            to_value(pipeline.create_emulator(board_name, &documents, emulator_id)?)
        }
        "parse_document" => {
            let document = SpecDocument::new(str_arg(args, "name")?, base64_arg(args, "content_base64")?);
            to_value(pipeline.parse_document(&document)?)
        }
        "generate_tests" => {
            let emulator_id = str_arg(args, "emulator_id")?;
            let tests = pipeline.generate_tests(emulator_id).await?;
            Ok(json!({"emulator_id": emulator_id, "total_tests": tests.len()}))
        }
        "list_tests" => {
            let emulator_id = str_arg(args, "emulator_id")?;
            Ok(json!({"emulator_id": emulator_id, "tests": registry.list_tests(emulator_id)}))
        }
        "list_reports" => {
            let reports = match opt_str_arg(args, "emulator_id") {
                Some(emulator_id) => registry.list_reports_for(emulator_id),
                None => registry.list_reports(),
            };
            Ok(json!({ "reports": reports }))
        }
        "get_report" => {
            let report_id = str_arg(args, "report_id")?;
            let report = registry
                .get_report(report_id)
                .ok_or_else(|| VerifyError::not_found(phoenix_types::EntityKind::Report, report_id))?;
            Ok(json!({ "report": report }))
        }
        "run_workflow" => {
            let request = WorkflowRequest {
                board_name: str_arg(args, "board_name")?.to_string(),
                documents: documents_arg(args)?,
                firmware: base64_arg(args, "firmware_base64")?,
                emulator_id: opt_str_arg(args, "emulator_id").map(str::to_string),
            };
            to_value(pipeline.run_workflow(request).await?)
        }
        "get_workflow" => to_value(pipeline.get_workflow(str_arg(args, "workflow_id")?)?),
        "platform_status" => to_value(platform.platform_status()),
        other => Err(VerifyError::validation(format!("unknown operation: {other}"))),
    }
}

// ── Argument helpers ─────────────────────────────────────────────────

fn str_arg<'a>(args: &'a Value, key: &str) -> VerifyResult<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| VerifyError::validation(format!("missing required field: {key}")))
}

fn opt_str_arg<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

fn base64_arg(args: &Value, key: &str) -> VerifyResult<Vec<u8>> {
    BASE64
        .decode(str_arg(args, key)?)
        .map_err(|e| VerifyError::validation(format!("{key} is not valid base64: {e}")))
}

/// `spec_files: [{name, content_base64}]`; absent means no documents.
fn documents_arg(args: &Value) -> VerifyResult<Vec<SpecDocument>> {
    let Some(files) = args.get("spec_files") else {
        return Ok(Vec::new());
    };
    let files = files
        .as_array()
        .ok_or_else(|| VerifyError::validation("spec_files must be an array"))?;
    files
        .iter()
        .map(|f| Ok(SpecDocument::new(str_arg(f, "name")?, base64_arg(f, "content_base64")?)))
        .collect()
}

fn to_value(v: impl Serialize) -> VerifyResult<Value> {
    serde_json::to_value(v).map_err(|e| VerifyError::Execution(format!("cannot encode response: {e}")))
}

// ── Envelopes ────────────────────────────────────────────────────────

fn json_rpc_result(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

fn json_rpc_verify_error(id: Value, e: &VerifyError) -> Value {
    let code = match e {
        VerifyError::Validation(_) => INVALID_PARAMS,
        VerifyError::NotFound { .. } => -32001,
        VerifyError::StateConflict(_) => -32002,
        VerifyError::Execution(_) => -32003,
        VerifyError::Timeout { .. } => -32004,
        VerifyError::Storage(_) => -32005,
    };
    json_rpc_error(id, code, &e.to_string(), Some(json!({"kind": e.kind()})))
}

fn json_rpc_error(id: Value, code: i32, message: &str, data: Option<Value>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message,
    });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error,
    })
}
