//! Client dispatcher tests: retries, re-registration, keep-alive, and event
//! delivery, driven end to end against an in-process server.

mod common;

use common::*;
use conclave::client::{ClientTransport, RaftClient};
use conclave::config::{ClientConfig, SessionConfig};
use conclave::core::error::RaftError;
use conclave::log::Operation;
use conclave::time::ManualClock;
use std::sync::Arc;
use std::time::Duration;

async fn open_client(
    transport: Arc<dyn ClientTransport>,
    config: ClientConfig,
    session: SessionConfig,
) -> (
    RaftClient,
    tokio::sync::mpsc::UnboundedReceiver<conclave::SessionEvent>,
) {
    RaftClient::open(transport, vec![member_a()], config, session)
        .await
        .expect("client open")
}

#[tokio::test]
async fn single_node_write_then_read() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let server = start_server(&probe, &dir, clock).await;
    let transport = conclave::runtime::LoopbackTransport::single(server.clone());

    let (client, _events) = open_client(transport, client_config(), session_config()).await;

    let written = client
        .submit_command(Operation::command("write", ""))
        .await
        .unwrap();
    let write_index = parse_index(&written);
    assert!(write_index > 0);

    let read = client
        .submit_query(Operation::query("read", ""))
        .await
        .unwrap();
    assert!(parse_index(&read) >= write_index);

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn application_errors_surface_unchanged() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let server = start_server(&probe, &dir, clock).await;
    let transport = conclave::runtime::LoopbackTransport::single(server.clone());

    let (client, _events) = open_client(transport, client_config(), session_config()).await;

    let err = client
        .submit_command(Operation::command("fail", ""))
        .await
        .unwrap_err();
    assert_eq!(err, RaftError::Application("injected failure".to_string()));

    // The session is unaffected.
    let written = client
        .submit_command(Operation::command("write", ""))
        .await
        .unwrap();
    assert!(parse_index(&written) > 0);

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn transport_failure_is_retried_until_the_member_returns() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let server = start_server(&probe, &dir, clock).await;
    let flaky = flaky_single(server.clone());

    let (client, _events) =
        open_client(flaky.clone(), client_config(), session_config()).await;

    // The member goes dark mid-submit; the client must keep retrying.
    flaky.set_down(&member_a().id, true);
    let submitting = {
        let client = client.clone();
        tokio::spawn(async move { client.submit_command(Operation::command("write", "")).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!submitting.is_finished());

    flaky.set_down(&member_a().id, false);
    let written = submitting.await.unwrap().unwrap();
    assert!(parse_index(&written) > 0);

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn leader_loss_mid_submit_completes_after_reelection() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let server = start_server(&probe, &dir, clock).await;
    let transport = conclave::runtime::LoopbackTransport::single(server.clone());

    let (client, _events) = open_client(transport, client_config(), session_config()).await;

    let first = client
        .submit_command(Operation::command("write", ""))
        .await
        .unwrap();
    let first_index = parse_index(&first);

    // Leadership drops; submissions spin on NoLeader until it returns.
    server.set_leading(false);
    let submitting = {
        let client = client.clone();
        tokio::spawn(async move { client.submit_command(Operation::command("write", "")).await })
    };
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!submitting.is_finished());

    server.set_leading(true);
    let second = submitting.await.unwrap().unwrap();
    assert!(parse_index(&second) >= first_index);

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn expired_session_reregisters_transparently() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let server = start_server(&probe, &dir, clock.clone()).await;
    let transport = conclave::runtime::LoopbackTransport::single(server.clone());

    // The victim never keep-alives on its own (huge interval, short session
    // timeout); a second client's keep-alives drive expiry.
    let mut quiet_config = client_config();
    quiet_config.keep_alive_interval_ms = 3_600_000;
    let victim_session = session_config().with_timeout_ms(1_000);
    let (victim, _victim_events) =
        open_client(transport.clone(), quiet_config, victim_session).await;
    let first_session = victim.session_id();
    let first = victim
        .submit_command(Operation::command("write", ""))
        .await
        .unwrap();

    let (heartbeater, _hb_events) =
        open_client(transport, client_config(), session_config()).await;

    // Entry timestamps jump past the victim's timeout; the heartbeater's
    // next keep-alive commits the expiry.
    clock.advance(5_000);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(probe.expirations(), 1);

    // The victim's next command hits UnknownSession, re-registers, and
    // succeeds on the new session.
    let second = victim
        .submit_command(Operation::command("write", ""))
        .await
        .unwrap();
    assert!(parse_index(&second) > parse_index(&first));
    let second_session = victim.session_id();
    assert_ne!(second_session, first_session);
    assert!(second_session > first_session);

    // The expire hook ran exactly once.
    assert_eq!(probe.expirations(), 1);

    victim.close().await;
    heartbeater.close().await;
    server.shutdown();
}

#[tokio::test]
async fn events_arrive_in_order_exactly_once_before_their_results() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let server = start_server(&probe, &dir, clock).await;
    let transport = conclave::runtime::LoopbackTransport::single(server.clone());

    let (client, mut events) = open_client(transport, client_config(), session_config()).await;

    let result = client
        .submit_command(Operation::command("event", "e1"))
        .await
        .unwrap();
    let index = parse_index(&result);

    // The result is gated on the event: by the time it resolves, the event
    // is already in the stream.
    let event = events.try_recv().expect("event delivered before result");
    assert_eq!(event.index, index);
    assert_eq!(event.payload, bytes::Bytes::from("e1"));
    assert!(events.try_recv().is_err(), "event must arrive exactly once");

    let result = client
        .submit_command(Operation::command("event", "e2"))
        .await
        .unwrap();
    let event = events.try_recv().expect("second event");
    assert_eq!(event.index, parse_index(&result));
    assert_eq!(event.payload, bytes::Bytes::from("e2"));

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn registration_backoff_doubles_up_to_the_cap() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let server = start_server(&probe, &dir, clock).await;
    let flaky = flaky_single(server.clone());

    flaky.set_down(&member_a().id, true);
    let opening = {
        let flaky = flaky.clone();
        tokio::spawn(async move {
            RaftClient::open(
                flaky,
                vec![member_a()],
                client_config(),
                session_config(),
            )
            .await
        })
    };

    // Let several backoff rounds elapse: 25, 50, 100, 200, 200...
    tokio::time::sleep(Duration::from_millis(900)).await;
    flaky.set_down(&member_a().id, false);
    let (client, _events) = opening.await.unwrap().expect("open after recovery");

    let times = flaky.attempt_times();
    assert!(times.len() >= 4, "expected several attempts, got {}", times.len());
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    // Early gaps grow...
    assert!(gaps[1] > gaps[0]);
    assert!(gaps[2] > gaps[1]);
    // ...and settle at the cap.
    let max_gap = gaps.iter().max().unwrap();
    assert!(
        *max_gap >= Duration::from_millis(150) && *max_gap <= Duration::from_millis(450),
        "backoff should be capped near 200ms, saw {max_gap:?}"
    );

    client.close().await;
    server.shutdown();
}

#[tokio::test]
async fn closed_client_rejects_submissions() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let server = start_server(&probe, &dir, clock).await;
    let transport = conclave::runtime::LoopbackTransport::single(server.clone());

    let (client, _events) = open_client(transport, client_config(), session_config()).await;
    let session_id = client.session_id();

    client.close().await;
    assert!(!client.is_open());
    assert_eq!(
        client
            .submit_command(Operation::command("write", ""))
            .await
            .unwrap_err(),
        RaftError::NotOpen
    );

    // The server saw the close: the session is no longer open.
    let summary = server
        .manager()
        .session_info(session_id)
        .await
        .unwrap()
        .expect("session still tracked until compaction");
    assert!(!summary.open);
    assert_eq!(probe.closes(), 1);

    server.shutdown();
}

#[tokio::test]
async fn metadata_reports_service_sessions() {
    let probe = ServiceProbe::new();
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let server = start_server(&probe, &dir, clock).await;
    let transport = conclave::runtime::LoopbackTransport::single(server.clone());

    let (c1, _e1) = open_client(transport.clone(), client_config(), session_config()).await;
    let (c2, _e2) = open_client(transport, client_config(), session_config()).await;

    let sessions = c1.metadata().await.unwrap();
    let ids: Vec<u64> = sessions.iter().map(|s| s.session_id).collect();
    assert!(ids.contains(&c1.session_id()));
    assert!(ids.contains(&c2.session_id()));
    assert!(sessions.iter().all(|s| s.service_name == "test"));

    c1.close().await;
    c2.close().await;
    server.shutdown();
}
