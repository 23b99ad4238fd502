use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use super::*;
use shared::domain::JobStatus;

const LOG_FRAME: &str =
    r#"{"type":"log","data":{"timestamp":"10:00:00","level":"info","message":"started"}}"#;
const STATUS_RUNNING_FRAME: &str = r#"{"type":"status","data":{"status":"running"}}"#;

#[derive(Clone)]
enum Script {
    Fail,
    Frames(Vec<&'static str>),
    FramesThenHold(Vec<&'static str>),
}

struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    opens: AtomicUsize,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            opens: AtomicUsize::new(0),
        })
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn open(&self, _url: &str) -> Result<Box<dyn FrameSource>, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = lock(&self.scripts).pop_front().unwrap_or(Script::Fail);
        match script {
            Script::Fail => Err(StreamError::Connect("connection refused".to_string())),
            Script::Frames(frames) => Ok(Box::new(ScriptedSource {
                frames: frames.into_iter().map(str::to_string).collect(),
                hold: false,
            })),
            Script::FramesThenHold(frames) => Ok(Box::new(ScriptedSource {
                frames: frames.into_iter().map(str::to_string).collect(),
                hold: true,
            })),
        }
    }
}

struct ScriptedSource {
    frames: VecDeque<String>,
    hold: bool,
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self) -> Result<Option<String>, StreamError> {
        if let Some(frame) = self.frames.pop_front() {
            return Ok(Some(frame));
        }
        if self.hold {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }
}

fn fast_options() -> StreamOptions {
    StreamOptions {
        reconnect_delay: Duration::from_millis(20),
        max_reconnect_attempts: 5,
    }
}

fn collect_logs(client: &Arc<StreamClient>) -> Arc<Mutex<Vec<String>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    client.on_log(move |entry| lock(&sink).push(entry.message));
    collected
}

fn collect_statuses(client: &Arc<StreamClient>) -> Arc<Mutex<Vec<JobStatus>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    client.on_status(move |payload| lock(&sink).push(payload.status));
    collected
}

async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(deadline, async {
        loop {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn stops_after_reconnect_budget_is_exhausted() {
    let transport = ScriptedTransport::new(Vec::new());
    let client = StreamClient::with_options(
        "http://127.0.0.1:9",
        Arc::clone(&transport) as Arc<dyn StreamTransport>,
        fast_options(),
    )
    .expect("client");

    client.connect();

    // initial attempt plus the full retry budget
    wait_until(Duration::from_secs(2), || transport.opens() == 6).await;
    assert_eq!(client.reconnect_attempts(), 5);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.opens(), 6, "no retry after the budget is spent");
}

#[tokio::test]
async fn disconnect_during_reconnect_delay_cancels_the_retry() {
    let transport = ScriptedTransport::new(Vec::new());
    let options = StreamOptions {
        reconnect_delay: Duration::from_millis(200),
        max_reconnect_attempts: 5,
    };
    let client = StreamClient::with_options(
        "http://127.0.0.1:9",
        Arc::clone(&transport) as Arc<dyn StreamTransport>,
        options,
    )
    .expect("client");

    client.connect();
    wait_until(Duration::from_secs(1), || transport.opens() == 1).await;

    client.disconnect();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.opens(), 1);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_killing_the_stream() {
    let transport = ScriptedTransport::new(vec![Script::FramesThenHold(vec![
        "not json at all",
        r#"{"data":{"status":"running"}}"#,
        r#"{"type":"metrics","data":{"cpu":1}}"#,
        LOG_FRAME,
        STATUS_RUNNING_FRAME,
    ])]);
    let client = StreamClient::with_options(
        "http://127.0.0.1:9",
        Arc::clone(&transport) as Arc<dyn StreamTransport>,
        fast_options(),
    )
    .expect("client");
    let logs = collect_logs(&client);
    let statuses = collect_statuses(&client);

    client.connect();

    wait_until(Duration::from_secs(2), || !lock(&statuses).is_empty()).await;
    assert_eq!(lock(&logs).clone(), vec!["started".to_string()]);
    assert_eq!(lock(&statuses).clone(), vec![JobStatus::Running]);
    assert!(client.is_connected());
    assert_eq!(transport.opens(), 1);
}

#[tokio::test]
async fn frames_are_demultiplexed_in_delivery_order() {
    let transport = ScriptedTransport::new(vec![Script::FramesThenHold(vec![
        r#"{"type":"log","data":{"timestamp":"10:00:00","level":"info","message":"first"}}"#,
        r#"{"type":"log","data":{"timestamp":"10:00:01","level":"warning","message":"second"}}"#,
        r#"{"type":"status","data":{"status":"running"}}"#,
        r#"{"type":"log","data":{"timestamp":"10:00:02","level":"error","message":"third"}}"#,
        r#"{"type":"status","data":{"status":"error"}}"#,
    ])]);
    let client = StreamClient::with_options(
        "http://127.0.0.1:9",
        Arc::clone(&transport) as Arc<dyn StreamTransport>,
        fast_options(),
    )
    .expect("client");
    let logs = collect_logs(&client);
    let statuses = collect_statuses(&client);

    client.connect();

    wait_until(Duration::from_secs(2), || lock(&statuses).len() == 2).await;
    assert_eq!(
        lock(&logs).clone(),
        vec![
            "first".to_string(),
            "second".to_string(),
            "third".to_string()
        ]
    );
    assert_eq!(
        lock(&statuses).clone(),
        vec![JobStatus::Running, JobStatus::Error]
    );
}

#[tokio::test]
async fn last_registered_callback_wins() {
    let transport = ScriptedTransport::new(vec![Script::FramesThenHold(vec![LOG_FRAME])]);
    let client = StreamClient::with_options(
        "http://127.0.0.1:9",
        Arc::clone(&transport) as Arc<dyn StreamTransport>,
        fast_options(),
    )
    .expect("client");

    let first: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&first);
    client.on_log(move |entry| lock(&sink).push(entry.message));

    let second = collect_logs(&client);

    client.connect();

    wait_until(Duration::from_secs(2), || !lock(&second).is_empty()).await;
    assert!(lock(&first).is_empty());
    assert_eq!(lock(&second).clone(), vec!["started".to_string()]);
}

#[tokio::test]
async fn successful_reconnect_resets_the_attempt_counter() {
    let transport = ScriptedTransport::new(vec![
        Script::Fail,
        Script::Fail,
        Script::FramesThenHold(Vec::new()),
    ]);
    let client = StreamClient::with_options(
        "http://127.0.0.1:9",
        Arc::clone(&transport) as Arc<dyn StreamTransport>,
        fast_options(),
    )
    .expect("client");

    client.connect();

    wait_until(Duration::from_secs(2), || client.is_connected()).await;
    assert_eq!(transport.opens(), 3);
    assert_eq!(client.reconnect_attempts(), 0);
}

#[tokio::test]
async fn server_close_triggers_a_reconnect() {
    let transport = ScriptedTransport::new(vec![
        Script::Frames(vec![LOG_FRAME]),
        Script::FramesThenHold(vec![STATUS_RUNNING_FRAME]),
    ]);
    let client = StreamClient::with_options(
        "http://127.0.0.1:9",
        Arc::clone(&transport) as Arc<dyn StreamTransport>,
        fast_options(),
    )
    .expect("client");
    let logs = collect_logs(&client);
    let statuses = collect_statuses(&client);

    client.connect();

    wait_until(Duration::from_secs(2), || !lock(&statuses).is_empty()).await;
    assert_eq!(transport.opens(), 2);
    assert_eq!(lock(&logs).clone(), vec!["started".to_string()]);
    assert_eq!(lock(&statuses).clone(), vec![JobStatus::Running]);
    assert!(client.is_connected());
}

#[tokio::test]
async fn disconnect_closes_an_established_connection() {
    let transport = ScriptedTransport::new(vec![Script::FramesThenHold(Vec::new())]);
    let client = StreamClient::with_options(
        "http://127.0.0.1:9",
        Arc::clone(&transport) as Arc<dyn StreamTransport>,
        fast_options(),
    )
    .expect("client");

    client.connect();
    wait_until(Duration::from_secs(2), || client.is_connected()).await;

    client.disconnect();

    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.opens(), 1, "deliberate close must not reconnect");
}

#[test]
fn rejects_urls_without_http_scheme() {
    let err = stream_url("ftp://example.com").expect_err("must fail");
    assert!(matches!(err, StreamError::UnsupportedScheme(_)));
}

#[test]
fn derives_stream_url_from_server_url() {
    assert_eq!(
        stream_url("http://127.0.0.1:8080").expect("url"),
        "ws://127.0.0.1:8080/api/ws/logs"
    );
    assert_eq!(
        stream_url("https://crawler.example/").expect("url"),
        "wss://crawler.example/api/ws/logs"
    );
}

async fn serve_frames(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket: WebSocket| async move {
        for frame in [LOG_FRAME, STATUS_RUNNING_FRAME] {
            if socket.send(WsMessage::Text(frame.to_string())).await.is_err() {
                return;
            }
        }
        // hold the socket open while the test asserts
        tokio::time::sleep(Duration::from_secs(2)).await;
    })
}

#[tokio::test]
async fn ws_transport_consumes_a_live_event_feed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route(STREAM_PATH, get(serve_frames));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let client = StreamClient::new(&format!("http://{addr}")).expect("client");
    let logs = collect_logs(&client);
    let statuses = collect_statuses(&client);

    client.connect();

    wait_until(Duration::from_secs(3), || !lock(&statuses).is_empty()).await;
    assert_eq!(lock(&logs).clone(), vec!["started".to_string()]);
    assert_eq!(lock(&statuses).clone(), vec![JobStatus::Running]);
    assert!(client.is_connected());
}
