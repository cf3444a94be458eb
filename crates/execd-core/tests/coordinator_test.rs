use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use execd_core::config::CoordinatorConfig;
use execd_core::runtime::{CancelOutcome, Readiness, RunEvent, RunEventKind, RunEventStream};
use execd_core::test_utils::ScriptInterpreter;
use execd_core::{ClientId, Coordinator, CoordinatorError, RunId, StreamKind};
use proptest::prelude::*;
use rstest::rstest;
use tokio::time::timeout;

fn start(interpreter: ScriptInterpreter) -> (Coordinator, RunEventStream, Arc<ScriptInterpreter>) {
    let interpreter = Arc::new(interpreter);
    let (coordinator, events) =
        Coordinator::spawn(interpreter.clone(), &CoordinatorConfig::default());
    (coordinator, events, interpreter)
}

async fn next_event(events: &mut RunEventStream) -> RunEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for run event")
        .expect("event stream closed")
}

async fn wait_started(events: &mut RunEventStream, id: &str) -> Vec<RunEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = event.run_id.as_str() == id && event.kind == RunEventKind::Started;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Collects events until every id in `ids` has reached a terminal event.
async fn collect_until_terminal(events: &mut RunEventStream, ids: &[&str]) -> Vec<RunEvent> {
    let mut pending: Vec<&str> = ids.to_vec();
    let mut seen = Vec::new();
    while !pending.is_empty() {
        let event = next_event(events).await;
        if event.kind.is_terminal() {
            pending.retain(|id| *id != event.run_id.as_str());
        }
        seen.push(event);
    }
    seen
}

fn for_run<'a>(events: &'a [RunEvent], id: &str) -> Vec<&'a RunEventKind> {
    events
        .iter()
        .filter(|e| e.run_id.as_str() == id)
        .map(|e| &e.kind)
        .collect()
}

fn terminals(events: &[RunEvent]) -> Vec<&RunEvent> {
    events.iter().filter(|e| e.kind.is_terminal()).collect()
}

#[tokio::test]
async fn prints_are_streamed_in_order_before_output() {
    let (coordinator, mut events, _) = start(ScriptInterpreter::new());
    let client = ClientId::new();

    coordinator
        .ledger()
        .submit(
            RunId::new("1"),
            "print x\nprint y\nreturn None".to_string(),
            client,
        )
        .await
        .unwrap();

    let seen = collect_until_terminal(&mut events, &["1"]).await;
    assert!(seen.iter().all(|e| e.owner == client));

    let kinds = for_run(&seen, "1");
    assert_eq!(kinds[0], &RunEventKind::Queued { position: 0 });
    assert_eq!(kinds[1], &RunEventKind::Started);
    let logs: Vec<(StreamKind, &str)> = kinds
        .iter()
        .filter_map(|kind| match kind {
            RunEventKind::Log(line) => Some((line.kind, line.text.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(
        logs,
        vec![(StreamKind::Stdout, "x"), (StreamKind::Stdout, "y")]
    );
    assert_eq!(
        kinds.last(),
        Some(&&RunEventKind::Completed {
            output: Some("None".to_string())
        })
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn second_client_waits_for_first_run() {
    let (coordinator, mut events, interpreter) = start(ScriptInterpreter::new());
    let ledger = coordinator.ledger();
    let a = ClientId::new();
    let b = ClientId::new();

    ledger
        .submit(RunId::new("1"), "wait long\nreturn 1".to_string(), a)
        .await
        .unwrap();
    let mut seen = wait_started(&mut events, "1").await;

    let position = ledger
        .submit(RunId::new("2"), "return 2".to_string(), b)
        .await
        .unwrap();
    assert_eq!(position, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = ledger.snapshot().await.unwrap();
    assert_eq!(snapshot.executing, Some(RunId::new("1")));
    assert_eq!(snapshot.queued, vec![RunId::new("2")]);

    interpreter.release("long");
    seen.extend(collect_until_terminal(&mut events, &["1", "2"]).await);

    let order: Vec<(&str, bool)> = seen
        .iter()
        .filter(|e| e.kind.is_terminal() || e.kind == RunEventKind::Started)
        .map(|e| (e.run_id.as_str(), e.kind.is_terminal()))
        .collect();
    assert_eq!(
        order,
        vec![("1", false), ("1", true), ("2", false), ("2", true)]
    );
    assert!(
        seen.iter()
            .filter(|e| e.run_id.as_str() == "2")
            .all(|e| e.owner == b)
    );
    assert_eq!(interpreter.max_concurrency(), 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn stopping_a_queued_run_produces_no_output() {
    let (coordinator, mut events, interpreter) = start(ScriptInterpreter::new());
    let ledger = coordinator.ledger();
    let client = ClientId::new();

    ledger
        .submit(RunId::new("1"), "wait gate".to_string(), client)
        .await
        .unwrap();
    ledger
        .submit(RunId::new("2"), "print should-not-appear".to_string(), client)
        .await
        .unwrap();
    assert_eq!(
        ledger.cancel(RunId::new("2"), Some(client)).await.unwrap(),
        CancelOutcome::Dequeued
    );

    interpreter.release("gate");
    let seen = collect_until_terminal(&mut events, &["1", "2"]).await;

    let kinds = for_run(&seen, "2");
    assert!(matches!(kinds[0], RunEventKind::Queued { .. }));
    assert_eq!(kinds[1..], [&RunEventKind::Cancelled]);
    assert_eq!(interpreter.executed(), vec!["wait gate"]);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn stopping_an_executing_run_yields_exactly_one_terminal_event() {
    let (coordinator, mut events, _) = start(ScriptInterpreter::new());
    let ledger = coordinator.ledger();
    let client = ClientId::new();

    ledger
        .submit(
            RunId::new("1"),
            "print before\nsleep 10000\nprint after".to_string(),
            client,
        )
        .await
        .unwrap();
    let mut seen = wait_started(&mut events, "1").await;

    assert_eq!(
        ledger.cancel(RunId::new("1"), Some(client)).await.unwrap(),
        CancelOutcome::Signalled
    );
    seen.extend(collect_until_terminal(&mut events, &["1"]).await);

    let terminal = terminals(&seen);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].kind, RunEventKind::Cancelled);
    assert!(for_run(&seen, "1").iter().all(|kind| match kind {
        RunEventKind::Log(line) => line.text != "after",
        _ => true,
    }));

    // The runtime is free again.
    ledger
        .submit(RunId::new("2"), "return next".to_string(), client)
        .await
        .unwrap();
    let seen = collect_until_terminal(&mut events, &["2"]).await;
    assert_eq!(
        terminals(&seen)[0].kind,
        RunEventKind::Completed {
            output: Some("next".to_string())
        }
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn stop_racing_natural_completion_reports_one_outcome() {
    let (coordinator, mut events, _) = start(ScriptInterpreter::new());
    let ledger = coordinator.ledger();
    let client = ClientId::new();

    ledger
        .submit(RunId::new("1"), "yield\nreturn done".to_string(), client)
        .await
        .unwrap();
    let _ = ledger.cancel(RunId::new("1"), Some(client)).await.unwrap();

    let seen = collect_until_terminal(&mut events, &["1"]).await;
    let terminal = terminals(&seen);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(
        terminal[0].kind,
        RunEventKind::Cancelled | RunEventKind::Completed { .. }
    ));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn duplicate_id_does_not_disturb_first_run() {
    let (coordinator, mut events, interpreter) = start(ScriptInterpreter::new());
    let ledger = coordinator.ledger();
    let a = ClientId::new();
    let b = ClientId::new();

    ledger
        .submit(RunId::new("1"), "wait gate\nreturn first".to_string(), a)
        .await
        .unwrap();
    let err = ledger
        .submit(RunId::new("1"), "return second".to_string(), b)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::DuplicateRun { .. }));

    interpreter.release("gate");
    let seen = collect_until_terminal(&mut events, &["1"]).await;
    let terminal = terminals(&seen);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].owner, a);
    assert_eq!(
        terminal[0].kind,
        RunEventKind::Completed {
            output: Some("first".to_string())
        }
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn concurrent_initialize_bootstraps_once() {
    let (coordinator, _events, interpreter) =
        start(ScriptInterpreter::new().with_bootstrap_delay(Duration::from_millis(50)));
    let supervisor = coordinator.supervisor();

    let first = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.ensure_ready().await }
    });
    let second = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.ensure_ready().await }
    });

    assert_eq!(first.await.unwrap().unwrap(), Readiness::Bootstrapped);
    assert_eq!(second.await.unwrap().unwrap(), Readiness::Bootstrapped);
    assert_eq!(interpreter.bootstrap_calls(), 1);

    coordinator.shutdown().await;
}

#[rstest]
#[case::value("print x\nreturn 3", RunEventKind::Completed { output: Some("3".to_string()) })]
#[case::no_value("print x", RunEventKind::Completed { output: None })]
#[case::raised(
    "print x\nraise ZeroDivisionError: division by zero",
    RunEventKind::Failed { message: "ZeroDivisionError: division by zero".to_string() }
)]
#[case::syntax("frobnicate", RunEventKind::Failed { message: "SyntaxError: unknown statement 'frobnicate'".to_string() })]
#[tokio::test]
async fn terminal_outcome_matches_program(#[case] code: &str, #[case] expected: RunEventKind) {
    let (coordinator, mut events, _) = start(ScriptInterpreter::new());
    let client = ClientId::new();

    coordinator
        .ledger()
        .submit(RunId::new("1"), code.to_string(), client)
        .await
        .unwrap();
    let seen = collect_until_terminal(&mut events, &["1"]).await;
    assert_eq!(terminals(&seen)[0].kind, expected);

    // A failing program leaves the runtime usable.
    coordinator
        .ledger()
        .submit(RunId::new("2"), "return again".to_string(), client)
        .await
        .unwrap();
    let seen = collect_until_terminal(&mut events, &["2"]).await;
    assert_eq!(
        terminals(&seen)[0].kind,
        RunEventKind::Completed {
            output: Some("again".to_string())
        }
    );

    coordinator.shutdown().await;
}

fn arb_submissions() -> impl Strategy<Value = Vec<(usize, u8)>> {
    prop::collection::vec((0usize..4, 0u8..3), 1..10)
}

fn script_for(index: usize, shape: u8) -> String {
    let body = match shape {
        0 => "yield\nprint a\nyield\nprint b".to_string(),
        1 => "sleep 1\nprint slept".to_string(),
        _ => "raise RuntimeError: boom".to_string(),
    };
    format!("# run {index}\n{body}")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_runs_execute_one_at_a_time_in_submission_order(submissions in arb_submissions()) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let (executed, starts, log_owners_ok, terminal_counts, max_concurrency) = runtime.block_on(async {
            let (coordinator, mut events, interpreter) = start(ScriptInterpreter::new());
            let ledger = coordinator.ledger();
            let clients: Vec<ClientId> = (0..4).map(|_| ClientId::new()).collect();

            let mut owners = std::collections::HashMap::new();
            let mut ids = Vec::new();
            for (index, (client, shape)) in submissions.iter().enumerate() {
                let id = index.to_string();
                ledger
                    .submit(RunId::new(id.clone()), script_for(index, *shape), clients[*client])
                    .await
                    .unwrap();
                owners.insert(id.clone(), clients[*client]);
                ids.push(id);
            }

            let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            let seen = collect_until_terminal(&mut events, &id_refs).await;

            let starts: Vec<String> = seen
                .iter()
                .filter(|e| e.kind == RunEventKind::Started)
                .map(|e| e.run_id.as_str().to_string())
                .collect();
            let log_owners_ok = seen
                .iter()
                .all(|e| owners.get(e.run_id.as_str()) == Some(&e.owner));
            let mut terminal_counts = std::collections::HashMap::new();
            for event in terminals(&seen) {
                *terminal_counts.entry(event.run_id.as_str().to_string()).or_insert(0usize) += 1;
            }

            let executed = interpreter.executed();
            let max_concurrency = interpreter.max_concurrency();
            coordinator.shutdown().await;
            (executed, starts, log_owners_ok, terminal_counts, max_concurrency)
        });

        let expected: Vec<String> = submissions
            .iter()
            .enumerate()
            .map(|(index, (_, shape))| script_for(index, *shape))
            .collect();
        let expected_ids: Vec<String> = (0..submissions.len()).map(|i| i.to_string()).collect();

        prop_assert_eq!(max_concurrency, 1);
        prop_assert_eq!(executed, expected);
        prop_assert_eq!(starts, expected_ids.clone());
        prop_assert!(log_owners_ok);
        prop_assert_eq!(
            terminal_counts.keys().cloned().collect::<HashSet<_>>(),
            expected_ids.into_iter().collect::<HashSet<_>>()
        );
        prop_assert!(terminal_counts.values().all(|count| *count == 1));
    }
}
