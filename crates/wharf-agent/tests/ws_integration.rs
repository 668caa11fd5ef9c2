use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use wharf_agent::config::{Config, OrchestratorConfig};
use wharf_agent::server::{build_router, spawn_port_events, AgentState};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Shell stub standing in for the PTY helper: drop the --cols/--rows pair
/// and exec the wrapped command directly over pipes. Each call gets its
/// own directory so concurrent tests never share a script file.
fn write_stub_helper() -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let dir = tempfile::tempdir().unwrap().into_path();
    let path = dir.join("stub-pty");
    std::fs::write(&path, "#!/bin/sh\nshift 2\nexec \"$@\"\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn start_agent(config: Config) -> (SocketAddr, Arc<AgentState>) {
    let state = AgentState::new(config);
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn start_default_agent(workspace: &Path) -> (SocketAddr, Arc<AgentState>) {
    let helper = write_stub_helper();
    let config = Config {
        workspace: workspace.to_path_buf(),
        pty_helper: Some(helper),
        ..Config::default()
    };
    start_agent(config).await
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = tokio::time::timeout(
        Duration::from_secs(5),
        tokio_tungstenite::connect_async(format!("ws://{addr}/")),
    )
    .await
    .expect("ws connect timed out")
    .unwrap();
    ws
}

async fn send_request(ws: &mut Ws, id: &str, operation: Value) {
    let frame = json!({ "id": id, "operation": operation }).to_string();
    ws.send(Message::Text(frame)).await.unwrap();
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Wait for the response correlated to `id`, skipping push events.
async fn wait_response(ws: &mut Ws, id: &str) -> Value {
    loop {
        let v = next_json(ws).await;
        if v.get("success").is_some() && v["id"] == id {
            return v;
        }
    }
}

#[tokio::test]
async fn echo_process_emits_output_then_exit() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _state) = start_default_agent(workspace.path()).await;
    let mut ws = connect(addr).await;

    send_request(
        &mut ws,
        "sp1",
        json!({ "type": "spawn", "command": "echo", "args": ["hello"] }),
    )
    .await;

    let mut pid = None;
    let mut stdout = String::new();
    let mut exit_code: Option<String> = None;
    while exit_code.is_none() || pid.is_none() {
        let v = next_json(&mut ws).await;
        if v["id"] == "sp1" {
            assert_eq!(v["success"], true, "spawn failed: {v}");
            pid = v["data"]["pid"].as_u64();
            continue;
        }
        if v["event"] == "process" {
            match v["data"]["stream"].as_str() {
                Some("stdout") => stdout.push_str(v["data"]["data"].as_str().unwrap()),
                Some("exit") => exit_code = Some(v["data"]["data"].as_str().unwrap().to_string()),
                _ => {}
            }
        }
    }
    assert!(stdout.contains("hello"), "stdout was {stdout:?}");
    assert_eq!(exit_code.as_deref(), Some("0"));
    let pid = pid.expect("spawn response never arrived");

    // The record is gone once exit was announced.
    send_request(&mut ws, "k1", json!({ "type": "kill", "pid": pid })).await;
    let resp = wait_response(&mut ws, "k1").await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["error"]["code"], "PROCESS_OPERATION_FAILED");
}

#[tokio::test]
async fn interactive_process_round_trips_input_resize_and_kill() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _state) = start_default_agent(workspace.path()).await;
    let mut ws = connect(addr).await;

    send_request(&mut ws, "sp", json!({ "type": "spawn", "command": "cat" })).await;
    let resp = wait_response(&mut ws, "sp").await;
    assert_eq!(resp["success"], true, "spawn failed: {resp}");
    let pid = resp["data"]["pid"].as_u64().unwrap();

    send_request(
        &mut ws,
        "in",
        json!({ "type": "input", "pid": pid, "data": "ping\n" }),
    )
    .await;

    let mut echoed = String::new();
    loop {
        let v = next_json(&mut ws).await;
        if v["event"] == "process" && v["data"]["stream"] == "stdout" {
            echoed.push_str(v["data"]["data"].as_str().unwrap());
            if echoed.contains("ping") {
                break;
            }
        }
    }

    send_request(
        &mut ws,
        "rs",
        json!({ "type": "resize", "pid": pid, "cols": 120, "rows": 40 }),
    )
    .await;
    let resp = wait_response(&mut ws, "rs").await;
    assert_eq!(resp["success"], true, "resize failed: {resp}");

    send_request(&mut ws, "kl", json!({ "type": "kill", "pid": pid })).await;
    let resp = wait_response(&mut ws, "kl").await;
    assert_eq!(resp["success"], true, "kill failed: {resp}");
}

#[tokio::test]
async fn responses_correlate_by_id_not_by_order() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("a"), "x").unwrap();
    let (addr, _state) = start_default_agent(workspace.path()).await;
    let mut ws = connect(addr).await;

    send_request(&mut ws, "x1", json!({ "type": "stat", "path": "a" })).await;
    send_request(&mut ws, "x2", json!({ "type": "stat", "path": "b" })).await;

    let mut seen = std::collections::HashMap::new();
    while seen.len() < 2 {
        let v = next_json(&mut ws).await;
        if v.get("success").is_some() {
            seen.insert(v["id"].as_str().unwrap().to_string(), v);
        }
    }
    assert_eq!(seen["x1"]["success"], true);
    assert_eq!(seen["x2"]["success"], false);
    assert_eq!(seen["x2"]["error"]["code"], "FILESYSTEM_OPERATION_FAILED");
}

#[tokio::test]
async fn traversal_reads_resolve_inside_the_workspace() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _state) = start_default_agent(workspace.path()).await;
    let mut ws = connect(addr).await;

    send_request(
        &mut ws,
        "m",
        json!({ "type": "mkdir", "path": "etc", "recursive": true }),
    )
    .await;
    assert_eq!(wait_response(&mut ws, "m").await["success"], true);
    send_request(
        &mut ws,
        "w",
        json!({ "type": "writeFile", "path": "etc/passwd", "content": "workspace copy" }),
    )
    .await;
    assert_eq!(wait_response(&mut ws, "w").await["success"], true);

    send_request(
        &mut ws,
        "r",
        json!({ "type": "readFile", "path": "../../../etc/passwd" }),
    )
    .await;
    let resp = wait_response(&mut ws, "r").await;
    assert_eq!(resp["success"], true);
    assert_eq!(resp["data"]["content"], "workspace copy");
}

#[tokio::test]
async fn filesystem_errors_carry_their_code() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _state) = start_default_agent(workspace.path()).await;
    let mut ws = connect(addr).await;

    send_request(&mut ws, "d", json!({ "type": "readdir", "path": "missing" })).await;
    let resp = wait_response(&mut ws, "d").await;
    assert_eq!(resp["error"]["code"], "FILESYSTEM_OPERATION_FAILED");

    send_request(&mut ws, "w", json!({ "type": "writeFile", "path": "x" })).await;
    let resp = wait_response(&mut ws, "w").await;
    assert_eq!(resp["error"]["code"], "FILESYSTEM_OPERATION_FAILED");
}

#[tokio::test]
async fn unknown_operation_type_is_rejected() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _state) = start_default_agent(workspace.path()).await;
    let mut ws = connect(addr).await;

    send_request(&mut ws, "u", json!({ "type": "teleport" })).await;
    let resp = wait_response(&mut ws, "u").await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["error"]["code"], "INVALID_OPERATION");
}

#[tokio::test]
async fn input_on_unknown_pid_names_the_pid() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _state) = start_default_agent(workspace.path()).await;
    let mut ws = connect(addr).await;

    send_request(
        &mut ws,
        "i",
        json!({ "type": "input", "pid": 4242, "data": "x" }),
    )
    .await;
    let resp = wait_response(&mut ws, "i").await;
    assert_eq!(resp["error"]["code"], "PROCESS_OPERATION_FAILED");
    assert!(resp["error"]["message"].as_str().unwrap().contains("4242"));
}

#[tokio::test]
async fn burst_of_writes_emits_a_single_change_event() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(workspace.path().join("src")).unwrap();
    std::fs::write(workspace.path().join("src/a.ts"), "v0").unwrap();
    let (addr, _state) = start_default_agent(workspace.path()).await;
    let mut ws = connect(addr).await;

    send_request(
        &mut ws,
        "wt",
        json!({ "type": "watch", "patterns": ["src/**/*.ts"] }),
    )
    .await;
    let resp = wait_response(&mut ws, "wt").await;
    assert_eq!(resp["success"], true, "watch failed: {resp}");
    assert!(resp["data"]["watcherId"].as_str().unwrap().len() == 7);

    for i in 0..3 {
        std::fs::write(workspace.path().join("src/a.ts"), format!("v{i}")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let v = next_json(&mut ws).await;
    assert_eq!(v["event"], "file-change");
    assert_eq!(v["data"]["event"], "change");
    assert_eq!(v["data"]["filename"], "src/a.ts");

    // Quiescence: nothing else arrives for the same burst.
    let extra = tokio::time::timeout(Duration::from_millis(500), ws.next()).await;
    assert!(extra.is_err(), "unexpected extra frame: {extra:?}");
}

#[tokio::test]
async fn disconnect_closes_orphaned_watchers() {
    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("f.txt"), "x").unwrap();
    let (addr, state) = start_default_agent(workspace.path()).await;

    let mut ws = connect(addr).await;
    send_request(&mut ws, "wt", json!({ "type": "watch", "patterns": ["**/*"] })).await;
    assert_eq!(wait_response(&mut ws, "wt").await["success"], true);
    assert_eq!(state.watchers.watcher_count(), 1);

    drop(ws);
    for _ in 0..50 {
        if state.watchers.watcher_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.watchers.watcher_count(), 0);

    // Watchers never affect plain filesystem access.
    let mut other = connect(addr).await;
    send_request(&mut other, "d", json!({ "type": "readdir", "path": "" })).await;
    assert_eq!(wait_response(&mut other, "d").await["success"], true);
}

#[tokio::test]
async fn mount_bulk_writes_a_tree() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _state) = start_default_agent(workspace.path()).await;
    let mut ws = connect(addr).await;

    send_request(
        &mut ws,
        "mt",
        json!({
            "type": "mount",
            "path": "",
            "tree": { "a.txt": "alpha", "sub": { "b.txt": "beta" } },
        }),
    )
    .await;
    assert_eq!(wait_response(&mut ws, "mt").await["success"], true);

    send_request(&mut ws, "rd", json!({ "type": "readdir", "path": "" })).await;
    let resp = wait_response(&mut ws, "rd").await;
    let names: Vec<&str> = resp["data"]["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["a.txt", "sub"]);
}

#[tokio::test]
async fn port_events_fan_out_to_every_client() {
    let workspace = tempfile::tempdir().unwrap();
    let helper = write_stub_helper();
    let config = Config {
        workspace: workspace.path().to_path_buf(),
        pty_helper: Some(helper),
        scan_interval: Duration::from_millis(100),
        app_host: "edge.example".to_string(),
        machine_id: "m-self".to_string(),
        ..Config::default()
    };
    let (addr, state) = start_agent(config).await;
    let _events_task = spawn_port_events(state.clone());

    // Let the scanner establish its baseline before a new port appears.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let mut client_a = connect(addr).await;
    let mut client_b = connect(addr).await;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    for client in [&mut client_a, &mut client_b] {
        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let v = next_json(client).await;
                if v["type"] == "port" && v["data"]["port"] == port {
                    break v;
                }
            }
        })
        .await
        .expect("no port event within 2s");
        assert_eq!(event["data"]["type"], "open");
        assert_eq!(
            event["data"]["url"],
            format!("https://edge.example/proxy/m-self/preview/?port={port}")
        );
    }
    drop(listener);
}

#[tokio::test]
async fn auth_operation_verifies_against_the_auth_service() {
    // Stub auth service: 200 only for the good token.
    let auth_app = axum::Router::new().route(
        "/verify",
        axum::routing::get(|headers: axum::http::HeaderMap| async move {
            let ok = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                == Some("Bearer good-token");
            if ok {
                axum::http::StatusCode::OK
            } else {
                axum::http::StatusCode::UNAUTHORIZED
            }
        }),
    );
    let auth_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let auth_addr = auth_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(auth_listener, auth_app).await.unwrap();
    });

    let workspace = tempfile::tempdir().unwrap();
    let helper = write_stub_helper();
    let config = Config {
        workspace: workspace.path().to_path_buf(),
        pty_helper: Some(helper),
        auth_server_url: format!("http://{auth_addr}"),
        ..Config::default()
    };
    let (addr, _state) = start_agent(config).await;
    let mut ws = connect(addr).await;

    send_request(&mut ws, "a1", json!({ "type": "auth", "token": "good-token" })).await;
    assert_eq!(wait_response(&mut ws, "a1").await["success"], true);

    send_request(&mut ws, "a2", json!({ "type": "auth", "token": "bad-token" })).await;
    let resp = wait_response(&mut ws, "a2").await;
    assert_eq!(resp["success"], false);
    assert_eq!(resp["error"]["code"], "auth_error");
}

#[tokio::test]
async fn rest_surface_gates_machine_creation() {
    let workspace = tempfile::tempdir().unwrap();
    let (addr, _state) = start_default_agent(workspace.path()).await;
    let client = reqwest::Client::builder().no_proxy().build().unwrap();

    let resp = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client
        .post(format!("http://{addr}/api/machine"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
async fn proxying_an_unknown_machine_is_not_found() {
    // Stub orchestrator: every machine lookup 404s.
    let orch_app = axum::Router::new().route(
        "/v1/apps/testapp/machines/:id",
        axum::routing::get(|| async { axum::http::StatusCode::NOT_FOUND }),
    );
    let orch_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let orch_addr = orch_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(orch_listener, orch_app).await.unwrap();
    });

    let workspace = tempfile::tempdir().unwrap();
    let helper = write_stub_helper();
    let config = Config {
        workspace: workspace.path().to_path_buf(),
        pty_helper: Some(helper),
        orchestrator: OrchestratorConfig {
            api_host: format!("http://{orch_addr}"),
            api_token: Some("orchestrator-token".to_string()),
            app_name: Some("testapp".to_string()),
            image_ref: None,
        },
        ..Config::default()
    };
    let (addr, _state) = start_agent(config).await;

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let resp = client
        .get(format!("http://{addr}/proxy/m1/preview/?port=8000"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}
