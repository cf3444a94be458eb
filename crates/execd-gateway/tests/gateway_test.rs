use std::sync::Arc;
use std::time::Duration;

use execd_core::test_utils::ScriptInterpreter;
use execd_core::{Coordinator, CoordinatorConfig, RunId};
use execd_gateway::gateway::DEFAULT_CLIENT_BUFFER;
use execd_gateway::{ChannelGateway, ClientConnection, ErrorCode, InboundMessage, OutboundMessage};
use rstest::rstest;
use tokio::time::timeout;

struct Fixture {
    gateway: ChannelGateway,
    coordinator: Coordinator,
    interpreter: Arc<ScriptInterpreter>,
}

impl Fixture {
    fn new(interpreter: ScriptInterpreter) -> Self {
        Self::with_client_buffer(interpreter, DEFAULT_CLIENT_BUFFER)
    }

    fn with_client_buffer(interpreter: ScriptInterpreter, client_buffer: usize) -> Self {
        let interpreter = Arc::new(interpreter);
        let (coordinator, events) =
            Coordinator::spawn(interpreter.clone(), &CoordinatorConfig::default());
        let gateway = ChannelGateway::with_client_buffer(&coordinator, events, client_buffer);
        Self {
            gateway,
            coordinator,
            interpreter,
        }
    }

    async fn run(&self, client: &ClientConnection, id: &str, code: &str) {
        self.gateway
            .handle_message(
                client.client_id(),
                InboundMessage::Run {
                    id: RunId::new(id),
                    code: code.to_string(),
                },
            )
            .await
            .unwrap();
    }

    async fn stop(&self, client: &ClientConnection, id: &str) {
        self.gateway
            .handle_message(client.client_id(), InboundMessage::Stop { id: RunId::new(id) })
            .await
            .unwrap();
    }

    async fn finish(self) {
        self.gateway.shutdown();
        self.coordinator.shutdown().await;
    }
}

async fn next_message(client: &mut ClientConnection) -> OutboundMessage {
    timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for gateway message")
        .expect("gateway stopped")
}

/// Messages for run `id` up to and including its terminal message.
async fn run_messages(client: &mut ClientConnection, id: &str) -> Vec<OutboundMessage> {
    let mut messages = Vec::new();
    loop {
        let message = next_message(client).await;
        if message.run_id().map(RunId::as_str) != Some(id) {
            continue;
        }
        let terminal = message.is_terminal();
        messages.push(message);
        if terminal {
            return messages;
        }
    }
}

/// Everything delivered to `client` within `window`.
async fn drain_for(client: &mut ClientConnection, window: Duration) -> Vec<OutboundMessage> {
    let mut messages = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(message)) = tokio::time::timeout_at(deadline, client.recv()).await {
        messages.push(message);
    }
    messages
}

fn stdout_lines(messages: &[OutboundMessage]) -> Vec<&str> {
    messages
        .iter()
        .filter_map(|m| match m {
            OutboundMessage::Stdout { message, .. } => Some(message.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn run_streams_stdout_then_output() {
    let fixture = Fixture::new(ScriptInterpreter::new());
    let mut client = fixture.gateway.connect().unwrap();

    fixture
        .run(&client, "1", "print x\nprint y\nreturn 42")
        .await;
    let messages = run_messages(&mut client, "1").await;

    assert_eq!(
        messages.first(),
        Some(&OutboundMessage::Queued {
            id: RunId::new("1"),
            position: 0
        })
    );
    assert!(messages.contains(&OutboundMessage::Start { id: RunId::new("1") }));
    assert_eq!(stdout_lines(&messages), vec!["x", "y"]);
    assert_eq!(
        messages.last(),
        Some(&OutboundMessage::Output {
            id: RunId::new("1"),
            message: Some("42".to_string())
        })
    );

    fixture.finish().await;
}

#[tokio::test]
async fn concurrent_initialize_yields_one_ready_per_client() {
    let fixture = Fixture::new(
        ScriptInterpreter::new().with_bootstrap_delay(Duration::from_millis(100)),
    );
    let mut a = fixture.gateway.connect().unwrap();
    let mut b = fixture.gateway.connect().unwrap();

    let (ra, rb) = tokio::join!(
        fixture
            .gateway
            .handle_message(a.client_id(), InboundMessage::Initialize),
        fixture
            .gateway
            .handle_message(b.client_id(), InboundMessage::Initialize),
    );
    ra.unwrap();
    rb.unwrap();

    for client in [&mut a, &mut b] {
        let messages = drain_for(client, Duration::from_millis(400)).await;
        let readies = messages
            .iter()
            .filter(|m| **m == OutboundMessage::Ready)
            .count();
        assert_eq!(readies, 1, "unexpected messages: {messages:?}");
    }
    assert_eq!(fixture.interpreter.bootstrap_calls(), 1);

    fixture.finish().await;
}

#[tokio::test]
async fn initialize_after_ready_is_answered_directly() {
    let fixture = Fixture::new(ScriptInterpreter::new());
    fixture.coordinator.supervisor().ensure_ready().await.unwrap();

    let mut client = fixture.gateway.connect().unwrap();
    fixture
        .gateway
        .handle_message(client.client_id(), InboundMessage::Initialize)
        .await
        .unwrap();

    assert_eq!(next_message(&mut client).await, OutboundMessage::Ready);

    fixture.finish().await;
}

#[tokio::test]
async fn initialize_racing_the_ready_broadcast_yields_one_ready() {
    let fixture = Fixture::new(ScriptInterpreter::new());
    // The router has not yet observed the transition when the client arrives.
    fixture.coordinator.supervisor().ensure_ready().await.unwrap();
    let mut client = fixture.gateway.connect().unwrap();

    for _ in 0..2 {
        fixture
            .gateway
            .handle_message(client.client_id(), InboundMessage::Initialize)
            .await
            .unwrap();
    }

    let messages = drain_for(&mut client, Duration::from_millis(200)).await;
    let readies = messages
        .iter()
        .filter(|m| **m == OutboundMessage::Ready)
        .count();
    assert_eq!(readies, 1, "unexpected messages: {messages:?}");

    fixture.finish().await;
}

#[tokio::test]
async fn initialization_failure_is_reported_only_to_requester() {
    let fixture = Fixture::new(ScriptInterpreter::new().with_bootstrap_failures(100));
    let mut a = fixture.gateway.connect().unwrap();
    let mut b = fixture.gateway.connect().unwrap();

    fixture
        .gateway
        .handle_message(a.client_id(), InboundMessage::Initialize)
        .await
        .unwrap();

    match next_message(&mut a).await {
        OutboundMessage::Error { id, code, .. } => {
            assert_eq!(id, None);
            assert_eq!(code, Some(ErrorCode::Initialization));
        }
        other => panic!("unexpected message: {other:?}"),
    }
    assert!(drain_for(&mut b, Duration::from_millis(100)).await.is_empty());

    fixture.finish().await;
}

#[rstest]
#[case::not_json("print('x')")]
#[case::missing_code(r#"{"event":"run","id":"1"}"#)]
#[case::unknown_event(r#"{"event":"reboot"}"#)]
#[tokio::test]
async fn malformed_frames_get_an_error_reply(#[case] frame: &str) {
    let fixture = Fixture::new(ScriptInterpreter::new());
    let mut client = fixture.gateway.connect().unwrap();

    fixture
        .gateway
        .handle_frame(client.client_id(), frame)
        .await
        .unwrap();

    let error = drain_for(&mut client, Duration::from_millis(200))
        .await
        .into_iter()
        .find(|m| matches!(m, OutboundMessage::Error { .. }));
    match error {
        Some(OutboundMessage::Error { id, code, .. }) => {
            assert_eq!(id, None);
            assert_eq!(code, Some(ErrorCode::InvalidMessage));
        }
        other => panic!("expected an error reply, got {other:?}"),
    }

    fixture.finish().await;
}

#[tokio::test]
async fn output_is_routed_only_to_the_owner() {
    let fixture = Fixture::new(ScriptInterpreter::new());
    let mut a = fixture.gateway.connect().unwrap();
    let mut b = fixture.gateway.connect().unwrap();

    fixture.run(&a, "a1", "print from-a\nreturn a").await;
    fixture.run(&b, "b1", "print from-b\nreturn b").await;

    let for_a = run_messages(&mut a, "a1").await;
    let for_b = run_messages(&mut b, "b1").await;
    assert_eq!(stdout_lines(&for_a), vec!["from-a"]);
    assert_eq!(stdout_lines(&for_b), vec!["from-b"]);

    let leftovers = drain_for(&mut a, Duration::from_millis(100)).await;
    assert!(
        leftovers
            .iter()
            .all(|m| m.run_id().is_none_or(|id| id.as_str() != "b1"))
    );

    fixture.finish().await;
}

#[tokio::test]
async fn duplicate_id_is_rejected_without_disturbing_original() {
    let fixture = Fixture::new(ScriptInterpreter::new());
    let mut a = fixture.gateway.connect().unwrap();
    let mut b = fixture.gateway.connect().unwrap();

    fixture.run(&a, "1", "wait gate\nreturn original").await;
    fixture.run(&b, "1", "return impostor").await;

    match run_messages(&mut b, "1").await.last() {
        Some(OutboundMessage::Error { code, .. }) => {
            assert_eq!(*code, Some(ErrorCode::DuplicateRun));
        }
        other => panic!("unexpected message: {other:?}"),
    }

    fixture.interpreter.release("gate");
    assert_eq!(
        run_messages(&mut a, "1").await.last(),
        Some(&OutboundMessage::Output {
            id: RunId::new("1"),
            message: Some("original".to_string())
        })
    );

    fixture.finish().await;
}

#[tokio::test]
async fn stop_from_non_owner_is_ignored() {
    let fixture = Fixture::new(ScriptInterpreter::new());
    let mut a = fixture.gateway.connect().unwrap();
    let b = fixture.gateway.connect().unwrap();

    fixture.run(&a, "1", "wait gate\nreturn kept").await;
    fixture.stop(&b, "1").await;
    fixture.interpreter.release("gate");

    assert_eq!(
        run_messages(&mut a, "1").await.last(),
        Some(&OutboundMessage::Output {
            id: RunId::new("1"),
            message: Some("kept".to_string())
        })
    );

    fixture.finish().await;
}

#[tokio::test]
async fn stop_cancels_owned_run() {
    let fixture = Fixture::new(ScriptInterpreter::new());
    let mut client = fixture.gateway.connect().unwrap();

    fixture.run(&client, "1", "print started\nwait never").await;
    loop {
        if let OutboundMessage::Stdout { .. } = next_message(&mut client).await {
            break;
        }
    }
    fixture.stop(&client, "1").await;

    assert_eq!(
        run_messages(&mut client, "1").await.last(),
        Some(&OutboundMessage::Cancelled { id: RunId::new("1") })
    );

    fixture.finish().await;
}

#[tokio::test]
async fn disconnect_releases_runtime_for_others() {
    let fixture = Fixture::new(ScriptInterpreter::new());
    let leaving = fixture.gateway.connect().unwrap();
    let mut staying = fixture.gateway.connect().unwrap();

    fixture.run(&leaving, "stuck", "wait never").await;
    fixture.run(&staying, "next", "return ran").await;
    drop(leaving);

    assert_eq!(
        run_messages(&mut staying, "next").await.last(),
        Some(&OutboundMessage::Output {
            id: RunId::new("next"),
            message: Some("ran".to_string())
        })
    );

    let mut remaining = fixture.gateway.client_count().await.unwrap();
    for _ in 0..50 {
        if remaining == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        remaining = fixture.gateway.client_count().await.unwrap();
    }
    assert_eq!(remaining, 1);

    fixture.finish().await;
}

#[tokio::test]
async fn client_that_falls_behind_is_dropped_and_its_run_released() {
    let fixture = Fixture::with_client_buffer(ScriptInterpreter::new(), 4);
    let mut slow = fixture.gateway.connect().unwrap();
    let mut steady = fixture.gateway.connect().unwrap();

    let chatty: String = (1..=20).map(|n| format!("print line {n}\n")).collect();
    fixture.run(&slow, "chatty", &format!("{chatty}wait never")).await;
    fixture.run(&steady, "next", "return ran").await;

    assert_eq!(
        run_messages(&mut steady, "next").await.last(),
        Some(&OutboundMessage::Output {
            id: RunId::new("next"),
            message: Some("ran".to_string())
        })
    );

    let backlog = drain_for(&mut slow, Duration::from_millis(200)).await;
    assert!(backlog.len() <= 4, "unexpected backlog: {backlog:?}");
    assert!(!backlog.iter().any(OutboundMessage::is_terminal));
    assert_eq!(slow.recv().await, None);
    assert_eq!(fixture.gateway.client_count().await.unwrap(), 1);

    fixture.finish().await;
}

#[tokio::test]
async fn health_reflects_queue() {
    let fixture = Fixture::new(ScriptInterpreter::new());
    let mut client = fixture.gateway.connect().unwrap();

    fixture.run(&client, "1", "wait gate").await;
    loop {
        if let OutboundMessage::Start { .. } = next_message(&mut client).await {
            break;
        }
    }
    fixture.run(&client, "2", "return two").await;

    let report = fixture.gateway.health().await.unwrap();
    assert_eq!(report.executing, Some(RunId::new("1")));
    assert_eq!(report.queued, 1);

    fixture.interpreter.release("gate");
    run_messages(&mut client, "2").await;

    fixture.finish().await;
}
