mod common;

use std::time::Duration;

use common::{addr, link, next_event};
use ota_core::{Config, ConnectionState, Report, SessionError, TestConfig, TestState};
use ota_tokio::{SessionEvent, Station, StationHandle};
use tokio::{task::JoinSet, time::sleep};

fn start(ping_interval: Duration) -> (StationHandle, common::Radio, JoinSet<anyhow::Result<()>>) {
    let (transport, radio) = link();
    let station = Station::new(Config::new(addr(10)).with_ping_interval(ping_interval));
    let handle = station.handle();
    let tasks = station.run(transport).unwrap();
    (handle, radio, tasks)
}

async fn join(radio: &mut common::Radio) {
    radio.send("5,3,REQ,-60,7").await;
    assert_eq!(radio.expect().await, "5,6,CON:10");
    radio.send("5,3,ACK,-60,7").await;
    radio.send("5,4,PING,-58,8").await;
    assert_eq!(radio.expect().await, "5,5,PINGR");
}

#[tokio::test(start_paused = true)]
async fn handshake() {
    let (handle, mut radio, _tasks) = start(Duration::from_secs(10));
    let mut events = handle.subscribe();
    join(&mut radio).await;

    next_event(&mut events, |e| {
        *e == SessionEvent::ConnectionStateChanged {
            address: addr(5),
            state: ConnectionState::Connected,
        }
    })
    .await;

    let sessions = handle.list_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].address, Some(addr(5)));
    assert_eq!(sessions[0].connection, ConnectionState::Connected);
    assert_eq!(sessions[0].test, Some(TestState::Idle));
    assert_eq!(sessions[0].rssi, Some(-58));
    assert_eq!(sessions[0].snr, Some(8));
}

#[tokio::test(start_paused = true)]
async fn keepalive_loss_removes_session() {
    let (handle, mut radio, _tasks) = start(Duration::from_secs(1));
    let mut events = handle.subscribe();
    join(&mut radio).await;

    for _ in 0..2 {
        sleep(Duration::from_secs(1)).await;
        radio.send("5,4,PING,,").await;
        assert_eq!(radio.expect().await, "5,5,PINGR");
    }
    assert!(handle.session(addr(5)).await.is_some());

    sleep(Duration::from_millis(4500)).await;
    assert!(handle.session(addr(5)).await.is_none());
    assert!(handle.list_sessions().await.is_empty());
    next_event(&mut events, |e| {
        matches!(
            e,
            SessionEvent::Report {
                report: Report::TimedOut,
                ..
            }
        )
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_happy_path() {
    let (handle, mut radio, _tasks) = start(Duration::from_secs(10));
    let mut events = handle.subscribe();
    join(&mut radio).await;

    handle
        .request_test(addr(5), TestConfig::new(0, 1, 1000))
        .await
        .unwrap();
    assert_eq!(radio.expect().await, "5,13,TEST:0.1.1000");
    assert_eq!(
        handle.request_test(addr(5), TestConfig::new(1, 1, 1000)).await,
        Err(SessionError::TestInProgress(addr(5)))
    );

    for line in ["5,10,PREPR:1000,,", "5,5,BEGIN,,", "5,5,UPD:x,,", "5,4,DONE,,"] {
        radio.send(line).await;
    }
    next_event(&mut events, |e| {
        *e == SessionEvent::Report {
            address: addr(5),
            report: Report::Progress("x".to_string()),
        }
    })
    .await;
    next_event(&mut events, |e| {
        *e == SessionEvent::Report {
            address: addr(5),
            report: Report::Completed,
        }
    })
    .await;

    let session = handle.session(addr(5)).await.unwrap();
    assert_eq!(session.test, Some(TestState::Idle));
}

#[tokio::test(start_paused = true)]
async fn cancel_and_disconnect() {
    let (handle, mut radio, _tasks) = start(Duration::from_secs(10));
    join(&mut radio).await;

    handle
        .request_test(addr(5), TestConfig::new(0, 1, 1000))
        .await
        .unwrap();
    assert_eq!(radio.expect().await, "5,13,TEST:0.1.1000");
    handle.cancel_test(addr(5)).await.unwrap();
    assert_eq!(radio.expect().await, "5,4,CANC");
    assert_eq!(
        handle.session(addr(5)).await.unwrap().test,
        Some(TestState::Idle)
    );

    handle.disconnect(addr(5)).await.unwrap();
    assert!(handle.session(addr(5)).await.is_none());
    assert_eq!(
        handle.cancel_test(addr(5)).await,
        Err(SessionError::UnknownSession(addr(5)))
    );
}

#[tokio::test(start_paused = true)]
async fn unknown_and_malformed_traffic_is_ignored() {
    let (handle, mut radio, _tasks) = start(Duration::from_secs(10));
    radio.send("garbage").await;
    radio.send("5,9,PING,,").await;
    radio.send("6,4,PING,,").await;
    radio.send("5,3,FOO,,").await;
    join(&mut radio).await;

    assert_eq!(handle.list_sessions().await.len(), 1);
    assert_eq!(
        handle.request_test(addr(6), TestConfig::new(0, 1, 1)).await,
        Err(SessionError::UnknownSession(addr(6)))
    );
}

#[tokio::test(start_paused = true)]
async fn sessions_are_independent() {
    let (handle, mut radio, _tasks) = start(Duration::from_secs(10));
    join(&mut radio).await;
    radio.send("7,3,REQ,,").await;
    assert_eq!(radio.expect().await, "7,6,CON:10");

    handle
        .request_test(addr(5), TestConfig::new(0, 1, 1000))
        .await
        .unwrap();
    assert_eq!(radio.expect().await, "5,13,TEST:0.1.1000");
    assert_eq!(
        handle.request_test(addr(7), TestConfig::new(0, 1, 1000)).await,
        Err(SessionError::NotConnected(addr(7)))
    );

    let sessions = handle.list_sessions().await;
    let states: Vec<_> = sessions.iter().map(|s| (s.address, s.connection)).collect();
    assert_eq!(
        states,
        [
            (Some(addr(5)), ConnectionState::Connected),
            (Some(addr(7)), ConnectionState::Connecting),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn transport_loss_stops_station() {
    let (handle, radio, mut tasks) = start(Duration::from_secs(10));
    let mut events = handle.subscribe();
    drop(radio);

    next_event(&mut events, |e| matches!(e, SessionEvent::TransportFailed(_))).await;
    let mut failed = false;
    while let Some(res) = tasks.join_next().await {
        failed |= res.unwrap().is_err();
    }
    assert!(failed);
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_all_workers() {
    let (handle, mut radio, mut tasks) = start(Duration::from_secs(10));
    join(&mut radio).await;

    handle.shutdown();
    while let Some(res) = tasks.join_next().await {
        res.unwrap().unwrap();
    }
    assert!(handle.list_sessions().await.is_empty());
}
