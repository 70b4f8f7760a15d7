//! AsyncConnector end-to-end tests: refused targets, dark addresses,
//! stop semantics, and the exactly-one-callback contract.

use std::net::{SocketAddr, TcpListener};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use braid::{AsyncConnector, ConnectError, ConnectOptions, Error, TcpSocket};

type Outcome = Result<TcpSocket, ConnectError>;

fn connect_and_report(
    connector: &AsyncConnector,
    addr: SocketAddr,
    timeout: Duration,
) -> mpsc::Receiver<Outcome> {
    let (tx, rx) = mpsc::channel();
    let ok_tx = tx.clone();
    connector
        .connect(ConnectOptions::new(
            addr,
            timeout,
            move |socket| {
                let _ = ok_tx.send(Ok(socket));
            },
            move |err| {
                let _ = tx.send(Err(err));
            },
        ))
        .unwrap();
    rx
}

/// A loopback port with nothing listening behind it.
fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
    // The listener drops here; connects to the port are refused.
}

#[test]
fn successful_connect_delivers_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let connector = AsyncConnector::new();
    connector.start().unwrap();
    let rx = connect_and_report(&connector, addr, Duration::from_secs(2));

    let (_peer, _) = listener.accept().unwrap();
    let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let socket = outcome.expect("connect should succeed");
    assert_eq!(socket.peer_addr(), Some(addr));

    // Exactly one callback per attempt.
    assert!(rx.try_recv().is_err());
    connector.stop();
}

#[test]
fn refused_connect_reports_io_error() {
    let addr = closed_port();
    let connector = AsyncConnector::new();
    connector.start().unwrap();
    let rx = connect_and_report(&connector, addr, Duration::from_secs(2));

    let t0 = Instant::now();
    let outcome = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(t0.elapsed() < Duration::from_millis(500));
    match outcome {
        Err(ConnectError::Io(_)) => {}
        other => panic!("expected io failure, got {other:?}"),
    }
    assert!(rx.try_recv().is_err());
    connector.stop();
}

#[test]
fn dark_address_fails_without_success() {
    // TEST-NET-2 space: no host answers. On hosts with a route this times
    // out after ~200ms; sandboxes without a route fail immediately instead.
    let addr: SocketAddr = "198.51.100.1:9".parse().unwrap();
    let connector = AsyncConnector::new();
    connector.start().unwrap();
    let rx = connect_and_report(&connector, addr, Duration::from_millis(200));

    let outcome = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert!(outcome.is_err(), "dark address must not connect");
    assert!(rx.try_recv().is_err());
    connector.stop();
}

#[test]
fn zero_timeout_resolves_on_first_iteration() {
    let addr: SocketAddr = "198.51.100.1:9".parse().unwrap();
    let connector = AsyncConnector::new();
    connector.start().unwrap();
    let rx = connect_and_report(&connector, addr, Duration::ZERO);

    let outcome = rx.recv_timeout(Duration::from_millis(500)).unwrap();
    assert!(outcome.is_err());
    connector.stop();
}

#[test]
fn connect_on_stopped_connector_fails_synchronously() {
    let addr = closed_port();
    let connector = AsyncConnector::new();

    let unreachable = ConnectOptions::new(
        addr,
        Duration::from_secs(1),
        |_socket| panic!("must not run"),
        |_err| panic!("must not run"),
    );
    assert!(matches!(
        connector.connect(unreachable),
        Err(Error::NotRunning)
    ));

    connector.start().unwrap();
    connector.stop();
    connector.stop(); // idempotent

    let unreachable = ConnectOptions::new(
        addr,
        Duration::from_secs(1),
        |_socket| panic!("must not run"),
        |_err| panic!("must not run"),
    );
    assert!(matches!(
        connector.connect(unreachable),
        Err(Error::NotRunning)
    ));
}

#[test]
fn stop_fails_pending_attempts_before_returning() {
    let addr: SocketAddr = "198.51.100.1:9".parse().unwrap();
    let connector = AsyncConnector::new();
    connector.start().unwrap();
    let rx = connect_and_report(&connector, addr, Duration::from_secs(30));

    connector.stop();

    // By the time stop returns, the attempt has been resolved: Shutdown on
    // routed hosts, an immediate io error where no route exists.
    let outcome = rx.try_recv().expect("callback must have fired");
    assert!(outcome.is_err());
    assert!(rx.try_recv().is_err());
}

#[test]
fn double_start_is_a_usage_error() {
    let connector = AsyncConnector::new();
    connector.start().unwrap();
    assert!(matches!(connector.start(), Err(Error::AlreadyStarted)));
    connector.stop();
}
