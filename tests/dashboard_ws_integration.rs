//! Integration tests for the observer WebSocket + REST control surface.
//!
//! Each test spins up an Axum server on a random port backed by the fake
//! adapters, connects via tokio-tungstenite / reqwest, and exercises the real
//! wire contract.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use rapidreach::capabilities::Capabilities;
use rapidreach::capabilities::fake::{FakeInbox, FakeTelephony};
use rapidreach::capabilities::retry::RetryPolicy;
use rapidreach::capabilities::types::InboundEmail;
use rapidreach::config::{
    BusConfig, DiscoveryConfig, PipelineConfig, RouterConfig, SchedulingConfig,
};
use rapidreach::dashboard::{AppState, dashboard_routes};
use rapidreach::events::bus::EventBus;
use rapidreach::events::model::{EventKind, EventPayload};
use rapidreach::inbound::InboundRouter;
use rapidreach::leads::discovery::DiscoveryService;
use rapidreach::leads::model::{Lead, LeadStatus};
use rapidreach::leads::registry::LeadRegistry;
use rapidreach::meetings::MeetingBook;
use rapidreach::pipeline::{PipelineRunner, RunLedger, RunManager};
use rapidreach::store::MemoryStore;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Server {
    port: u16,
    registry: Arc<LeadRegistry>,
    bus: EventBus,
    inbox: Arc<FakeInbox>,
    telephony: Arc<FakeTelephony>,
}

/// Start an Axum server on a random port backed by fakes.
async fn start_server(bus_config: BusConfig) -> Server {
    let store = Arc::new(MemoryStore::new());
    let bus = EventBus::new(bus_config);
    let retry = RetryPolicy::immediate(2);

    let inbox = Arc::new(FakeInbox::default());
    let telephony = Arc::new(FakeTelephony::default());
    let mut caps = Capabilities::fake();
    caps.inbox = inbox.clone();
    caps.telephony = telephony.clone();

    let registry = LeadRegistry::new(store.clone(), bus.clone(), retry);
    let ledger = RunLedger::new(store.clone(), bus.clone(), retry);
    let meetings = MeetingBook::new(store, bus.clone(), retry);
    let pipeline = PipelineConfig {
        retry,
        call_poll_interval: Duration::from_secs(30),
        ..Default::default()
    };
    let runner = PipelineRunner::new(
        caps.clone(),
        registry.clone(),
        ledger.clone(),
        pipeline,
        &SchedulingConfig::default(),
        None,
    );
    let runs = RunManager::new(ledger, runner, registry.clone());
    let discovery = DiscoveryService::new(
        registry.clone(),
        caps.search.clone(),
        DiscoveryConfig::default(),
        retry,
        Duration::from_secs(5),
    );
    let inbound = InboundRouter::new(
        caps,
        registry.clone(),
        runs.clone(),
        meetings.clone(),
        bus.clone(),
        RouterConfig::default(),
        SchedulingConfig::default(),
        retry,
        Duration::from_secs(5),
    );

    let app = dashboard_routes(AppState {
        registry: registry.clone(),
        bus: bus.clone(),
        runs,
        discovery,
        inbound,
        meetings,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        port,
        registry,
        bus,
        inbox,
        telephony,
    }
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

fn joes_cafe() -> Lead {
    Lead::new("p1", "Joe's Cafe")
        .with_phone("512-555-1234")
        .with_email("joe@joescafe.com")
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_snapshot() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(BusConfig::default()).await;
        server.registry.upsert(vec![joes_cafe()]).await;

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{}/ws", server.port))
            .await
            .expect("WS connect failed");

        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["seq"], 1);
        let leads = json["leads"].as_array().unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0]["place_id"], "p1");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_streams_events_after_snapshot() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(BusConfig::default()).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws", server.port))
            .await
            .unwrap();
        let snapshot = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(snapshot["type"], "snapshot");
        let snapshot_seq = snapshot["seq"].as_u64().unwrap();

        server.registry.upsert(vec![joes_cafe()]).await;
        server
            .registry
            .upsert(vec![joes_cafe().with_rating(4.5)])
            .await;

        let first = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(first["type"], "event");
        assert_eq!(first["event"]["kind"], "lead_found");
        assert_eq!(first["event"]["seq"].as_u64().unwrap(), snapshot_seq + 1);

        let second = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(second["event"]["kind"], "lead_updated");
        assert_eq!(second["event"]["payload"]["data"]["rating"], 4.5);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_ping_gets_pong_and_sync_gets_snapshot() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(BusConfig::default()).await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws", server.port))
            .await
            .unwrap();
        let _snapshot = ws.next().await.unwrap().unwrap();

        ws.send(Message::Text(json!({"type": "ping"}).to_string().into()))
            .await
            .unwrap();
        let pong = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(pong["type"], "pong");

        server.registry.upsert(vec![joes_cafe()]).await;
        let event = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(event["event"]["kind"], "lead_found");

        ws.send(Message::Text(json!({"type": "sync"}).to_string().into()))
            .await
            .unwrap();
        let fresh = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(fresh["type"], "snapshot");
        assert_eq!(fresh["leads"].as_array().unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_resume_replays_after_sequence() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(BusConfig::default()).await;
        for i in 0..3 {
            server
                .registry
                .upsert(vec![Lead::new(format!("p{i}"), format!("Cafe {i}"))])
                .await;
        }

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws?after=1", server.port))
            .await
            .unwrap();

        let first = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(first["type"], "event");
        assert_eq!(first["event"]["seq"], 2);
        let second = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(second["event"]["seq"], 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_resume_past_backlog_gets_resync() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(BusConfig {
            backlog_capacity: 2,
            ..Default::default()
        })
        .await;
        for i in 0..5 {
            server
                .registry
                .upsert(vec![Lead::new(format!("p{i}"), format!("Cafe {i}"))])
                .await;
        }

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws?after=0", server.port))
            .await
            .unwrap();
        let first = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(first["type"], "resync");
        assert_eq!(first["missed"], 3);

        ws.send(Message::Text(json!({"type": "sync"}).to_string().into()))
            .await
            .unwrap();
        // Skip any backlog still queued ahead of the snapshot.
        loop {
            let msg = parse_ws_json(&ws.next().await.unwrap().unwrap());
            if msg["type"] == "snapshot" {
                assert_eq!(msg["leads"].as_array().unwrap().len(), 5);
                assert_eq!(msg["seq"], 5);
                break;
            }
        }
    })
    .await
    .expect("test timed out");
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn rest_health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(BusConfig::default()).await;
        let resp = reqwest::get(format!("http://127.0.0.1:{}/health", server.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "rapidreach");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_discovery_then_list_leads() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(BusConfig::default()).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://127.0.0.1:{}/api/discovery", server.port))
            .json(&json!({"area": "Austin, TX"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let report: Value = resp.json().await.unwrap();
        assert_eq!(report["found"], 3);
        assert_eq!(report["degraded"], true);

        let leads: Value = reqwest::get(format!("http://127.0.0.1:{}/api/leads", server.port))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(leads.as_array().unwrap().len(), 3);

        let resp = reqwest::get(format!("http://127.0.0.1:{}/api/leads/nope", server.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_second_run_start_conflicts_until_cancelled() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(BusConfig::default()).await;
        server.registry.upsert(vec![joes_cafe()]).await;
        // Keep the first run parked in CALLING.
        server.telephony.set_pending_polls(u32::MAX);
        let client = reqwest::Client::new();
        let runs_url = format!("http://127.0.0.1:{}/api/runs", server.port);

        let resp = client
            .post(&runs_url)
            .json(&json!({"lead_id": "p1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let started: Value = resp.json().await.unwrap();
        let run_id = started["run_id"].as_str().unwrap().to_string();

        let resp = client
            .post(&runs_url)
            .json(&json!({"lead_id": "p1"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "already_running");
        assert_eq!(body["run_id"], run_id.as_str());

        let resp = client
            .post(format!("{runs_url}/p1/cancel"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // The runner observes the cancellation at its next suspension point.
        let mut status = 0;
        for _ in 0..50 {
            let resp = client
                .post(&runs_url)
                .json(&json!({"lead_id": "p1", "skip_call": true}))
                .send()
                .await
                .unwrap();
            status = resp.status().as_u16();
            if status == 202 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, 202);

        let first: Value = reqwest::get(format!("{runs_url}/{run_id}"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first["stage"], "FAILED");
        assert_eq!(first["last_error"]["error_class"], "cancelled");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_run_for_unknown_lead_is_404() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(BusConfig::default()).await;
        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/api/runs", server.port))
            .json(&json!({"lead_id": "ghost"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/api/runs/ghost/cancel", server.port))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn webhook_push_is_deduplicated() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(BusConfig::default()).await;
        server.registry.upsert(vec![joes_cafe()]).await;
        server.inbox.deliver(InboundEmail {
            id: "m1".into(),
            from: "Joe <joe@joescafe.com>".into(),
            subject: "Re: Website proposal".into(),
            body: "Sounds interesting, tell me more".into(),
            received_at: chrono::Utc::now(),
        });
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/webhooks/inbox", server.port);

        let first: Value = client
            .post(&url)
            .json(&json!({"message_id": "m1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first["status"], "status_changed");

        let second: Value = client
            .post(&url)
            .json(&json!({"message_id": "m1"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(second["status"], "duplicate");
        assert_eq!(server.inbox.read_count("m1"), 1);

        // An empty notification triggers a scan of the (now empty) inbox.
        let resp = client.post(&url).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let report: Value = resp.json().await.unwrap();
        assert_eq!(report["listed"], 0);

        let hot = server
            .bus
            .recent(50)
            .into_iter()
            .any(|e| {
                e.kind == EventKind::LeadUpdated
                    && matches!(&e.payload, EventPayload::Lead(l) if l.status == LeadStatus::HotLead)
            });
        assert!(hot);
    })
    .await
    .expect("test timed out");
}
