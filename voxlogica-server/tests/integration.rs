//! HTTP surface test: capabilities → symbols → job submission → polling →
//! resolve → store inspection, against a server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use voxlogica_core::config::EngineConfig;
use voxlogica_core::engine::ExecutionEngine;
use voxlogica_core::jobs::JobManager;
use voxlogica_core::resolver::ValueResolver;
use voxlogica_core::stdlib;
use voxlogica_core::store_memory::MemoryStore;
use voxlogica_server::http::{router, AppState};

async fn spawn_server() -> String {
    let data_root = std::env::temp_dir().join(format!("vox-http-{}", uuid::Uuid::now_v7()));
    std::fs::create_dir_all(&data_root).unwrap();
    let config = Arc::new(EngineConfig {
        data_root,
        ..EngineConfig::default()
    });
    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(stdlib::registry()),
        config,
    ));
    let jobs = Arc::new(JobManager::new(engine).unwrap());
    let resolver = Arc::new(ValueResolver::new(jobs.clone()));
    let app = router(AppState { jobs, resolver });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn sum_program_json() -> serde_json::Value {
    // a=1 b=2 c=a+b print "sum" c, in the parser's AST wire form.
    serde_json::json!({
        "commands": [
            { "Bind": { "name": "a", "params": [], "body": { "Int": { "value": 1, "span": { "line": 1, "column": 1 } } }, "span": { "line": 1, "column": 1 } } },
            { "Bind": { "name": "b", "params": [], "body": { "Int": { "value": 2, "span": { "line": 2, "column": 1 } } }, "span": { "line": 2, "column": 1 } } },
            { "Bind": { "name": "c", "params": [], "body": { "Call": { "callee": "+", "args": [
                { "Ident": { "name": "a", "span": { "line": 3, "column": 5 } } },
                { "Ident": { "name": "b", "span": { "line": 3, "column": 9 } } }
            ], "span": { "line": 3, "column": 5 } } }, "span": { "line": 3, "column": 1 } } },
            { "Print": { "label": "sum", "expr": { "Ident": { "name": "c", "span": { "line": 4, "column": 13 } } }, "span": { "line": 4, "column": 1 } } }
        ]
    })
}

#[tokio::test]
async fn full_http_round_trip() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    // 1. Capabilities advertise the runtime and the operator table.
    let caps: serde_json::Value = client
        .get(format!("{base}/api/v1/capabilities"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(caps["runtime_version"].as_str().unwrap().starts_with("vox2"));
    assert!(caps["operators"]
        .as_array()
        .unwrap()
        .iter()
        .any(|op| op == "+"));

    // 2. Symbols for the program.
    let symbols: serde_json::Value = client
        .post(format!("{base}/api/v1/program/symbols"))
        .json(&serde_json::json!({ "program": sum_program_json() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(symbols["nodes"], serde_json::json!(3));
    let c_hex = symbols["symbols"]["c"].as_str().unwrap().to_string();
    assert_eq!(c_hex.len(), 64);

    // 3. Submit a run job and poll to completion.
    let submitted: serde_json::Value = client
        .post(format!("{base}/api/v1/jobs"))
        .json(&serde_json::json!({ "program": sum_program_json() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let job_id = submitted["job_id"].as_str().unwrap().to_string();

    let mut job = serde_json::Value::Null;
    for _ in 0..200 {
        job = client
            .get(format!("{base}/api/v1/jobs/{job_id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let status = job["status"].as_str().unwrap();
        if status == "completed" || status == "failed" || status == "killed" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(job["status"], serde_json::json!("completed"));
    assert_eq!(
        job["result"]["goals"][0]["outcome"]["value"],
        serde_json::json!(3)
    );

    // 4. Resolve the variable from the now-warm store.
    let resolved: serde_json::Value = client
        .post(format!("{base}/api/v1/resolve"))
        .json(&serde_json::json!({
            "program": sum_program_json(),
            "variable": "c",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["materialization"], serde_json::json!("cached"));
    assert_eq!(
        resolved["descriptor"]["summary"]["value"],
        serde_json::json!(3)
    );
    assert_eq!(resolved["node_id"].as_str().unwrap(), c_hex);

    // 5. Store listing and per-node inspection.
    let listing: serde_json::Value = client
        .get(format!("{base}/api/v1/store?status=materialized"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing.as_array().unwrap().len(), 3);

    let inspected: serde_json::Value = client
        .get(format!("{base}/api/v1/store/{c_hex}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(inspected["status"], serde_json::json!("materialized"));
    assert_eq!(
        inspected["descriptor"]["vox_type"],
        serde_json::json!("integer")
    );
}

#[tokio::test]
async fn static_errors_surface_with_stable_codes() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    // Unknown callable in symbols: rejected before any execution.
    let response = client
        .post(format!("{base}/api/v1/program/symbols"))
        .json(&serde_json::json!({ "program": {
            "commands": [
                { "Print": { "label": "x", "expr": { "Call": { "callee": "nope", "args": [], "span": { "line": 1, "column": 1 } } }, "span": { "line": 1, "column": 1 } } }
            ]
        }}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], serde_json::json!("UnknownCallable"));

    // Unknown node id in the store: 404.
    let missing = client
        .get(format!("{base}/api/v1/store/{}", "ab".repeat(32)))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    // Unknown runtime version on inspection: synchronous policy reject.
    let wrong_rt = client
        .get(format!("{base}/api/v1/store?runtime_version=ancient-0"))
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_rt.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = wrong_rt.json().await.unwrap();
    assert_eq!(body["code"], serde_json::json!("UnknownRuntimeVersion"));
}
