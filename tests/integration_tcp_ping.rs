//! TCP establishment lifecycle through the public API.
//!
//! Covers the reliable-connection scenario (initiate, ready, close,
//! closed), winner-takes-all racing observability (exactly one `ready`, no
//! `establishment_error`), idempotent close, and property inheritance from
//! a listener to its accepted connections.

use std::net::{IpAddr, Ipv4Addr};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use taps::{
    ConnectionCallbacks, ConnectionState, ListenerCallbacks, LocalEndpoint, Preconnection,
    Preference, SelectionProperty, TransportProperties,
};

fn reliable_properties() -> TransportProperties {
    let mut properties = TransportProperties::build();
    properties.set_selection_preference(SelectionProperty::Reliability, Preference::Require);
    properties
}

/// Spawn a TCP listener thread that serves accepted connections until the
/// peer closes, then stops. Reports accepted-connection property snapshots.
fn spawn_server(
    port: u16,
    inheritance_tx: mpsc::Sender<(Preference, bool, ConnectionState)>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        taps::initialize(None, None).unwrap();

        let local = LocalEndpoint::build()
            .with_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_port(port);
        let preconnection =
            Preconnection::new(&[], &reliable_properties()).with_local(&local);

        let listener = preconnection
            .listen(ListenerCallbacks {
                connection_received: Some(Box::new(move |listener, conn| {
                    let properties = conn.transport_properties();
                    inheritance_tx
                        .send((
                            properties
                                .selection()
                                .preference(SelectionProperty::Reliability),
                            properties
                                .selection()
                                .is_set_by_user(SelectionProperty::Reliability),
                            properties.connection_state(),
                        ))
                        .unwrap();

                    // Stop the listener once the peer is done with us.
                    let listener = Rc::clone(listener);
                    conn.set_callbacks(ConnectionCallbacks {
                        closed: Some(Box::new(move |_conn| listener.stop())),
                        ..Default::default()
                    });
                })),
                ..Default::default()
            })
            .unwrap();

        taps::start_event_loop().unwrap();
        drop(listener);
        taps::close_library().unwrap();
    })
}

#[test]
fn tcp_ping_lifecycle() {
    const PORT: u16 = 5006;
    let (inheritance_tx, _inheritance_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel::<&'static str>();

    let server = spawn_server(PORT, inheritance_tx);
    thread::sleep(Duration::from_millis(300));

    let client = thread::spawn(move || {
        taps::initialize(None, None).unwrap();

        let remote = taps::RemoteEndpoint::build()
            .with_hostname("127.0.0.1")
            .with_port(PORT);
        let preconnection =
            Preconnection::new(std::slice::from_ref(&remote), &reliable_properties());

        let ready_tx = event_tx.clone();
        let closed_tx = event_tx.clone();
        let error_tx = event_tx.clone();
        let connection = preconnection
            .initiate(ConnectionCallbacks {
                ready: Some(Box::new(move |conn| {
                    ready_tx.send("ready").unwrap();
                    // Close twice: the second must be a no-op and the
                    // `closed` event must fire exactly once.
                    conn.close();
                    conn.close();
                })),
                establishment_error: Some(Box::new(move |_conn, _error| {
                    error_tx.send("establishment_error").unwrap();
                })),
                closed: Some(Box::new(move |_conn| {
                    closed_tx.send("closed").unwrap();
                })),
                ..Default::default()
            })
            .unwrap();

        taps::start_event_loop().unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        taps::close_library().unwrap();
    });

    // Exactly one ready and one closed; racing must never surface an
    // establishment error once a candidate has won.
    let mut events = Vec::new();
    while let Ok(event) = event_rx.recv_timeout(Duration::from_secs(10)) {
        events.push(event);
        if event == "closed" {
            break;
        }
    }
    assert_eq!(events, vec!["ready", "closed"]);
    assert!(event_rx.recv_timeout(Duration::from_millis(200)).is_err());

    client.join().unwrap();
    server.join().unwrap();
}

/// A peer reset on a ready connection fires exactly one
/// `connection_error` and lands in CLOSED; `closed` is not fired and no
/// `sent` completion follows the reset.
#[test]
fn peer_reset_fires_connection_error() {
    const PORT: u16 = 5008;
    let (event_tx, event_rx) = mpsc::channel::<&'static str>();

    // A raw acceptor that drops the socket with unread data still queued,
    // which turns the close into an RST.
    let server = thread::spawn(|| {
        let acceptor = std::net::TcpListener::bind(("127.0.0.1", PORT)).unwrap();
        let (stream, _peer) = acceptor.accept().unwrap();
        thread::sleep(Duration::from_millis(300));
        drop(stream);
    });

    thread::sleep(Duration::from_millis(300));

    let client = thread::spawn(move || {
        taps::initialize(None, None).unwrap();

        let remote = taps::RemoteEndpoint::build()
            .with_hostname("127.0.0.1")
            .with_port(PORT);
        let preconnection =
            Preconnection::new(std::slice::from_ref(&remote), &reliable_properties());

        let ready_tx = event_tx.clone();
        let error_tx = event_tx.clone();
        let closed_tx = event_tx.clone();
        let connection = preconnection
            .initiate(ConnectionCallbacks {
                ready: Some(Box::new(move |conn| {
                    ready_tx.send("ready").unwrap();
                    // Queue unread data so the peer's close degrades to a
                    // reset.
                    conn.send_message(taps::Message::new(&b"x"[..])).unwrap();
                })),
                connection_error: Some(Box::new(move |_conn, _error| {
                    error_tx.send("connection_error").unwrap();
                })),
                closed: Some(Box::new(move |_conn| closed_tx.send("closed").unwrap())),
                ..Default::default()
            })
            .unwrap();

        taps::start_event_loop().unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        taps::close_library().unwrap();
    });

    let mut events = Vec::new();
    while let Ok(event) = event_rx.recv_timeout(Duration::from_secs(10)) {
        events.push(event);
        if event == "connection_error" || event == "closed" {
            break;
        }
    }
    assert_eq!(events.first().copied(), Some("ready"));
    assert_eq!(events.iter().filter(|e| **e == "connection_error").count(), 1);
    assert!(!events.contains(&"closed"));

    client.join().unwrap();
    server.join().unwrap();
}

#[test]
fn listener_properties_are_inherited_and_independent() {
    const PORT: u16 = 5007;
    let (inheritance_tx, inheritance_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel::<&'static str>();

    let server = spawn_server(PORT, inheritance_tx);
    thread::sleep(Duration::from_millis(300));

    let client = thread::spawn(move || {
        taps::initialize(None, None).unwrap();

        let remote = taps::RemoteEndpoint::build()
            .with_hostname("127.0.0.1")
            .with_port(PORT);

        // The client's own property bag differs from the server's
        // template; inheritance must come from the listener, not the wire.
        let mut properties = reliable_properties();
        properties.set_selection_preference(SelectionProperty::PreserveOrder, Preference::Prefer);
        let preconnection = Preconnection::new(std::slice::from_ref(&remote), &properties);

        let closed_tx = event_tx.clone();
        let connection = preconnection
            .initiate(ConnectionCallbacks {
                ready: Some(Box::new(move |conn| {
                    event_tx.send("ready").unwrap();
                    conn.close();
                })),
                closed: Some(Box::new(move |_conn| closed_tx.send("closed").unwrap())),
                ..Default::default()
            })
            .unwrap();

        taps::start_event_loop().unwrap();
        drop(connection);
        taps::close_library().unwrap();
    });

    let (reliability, set_by_user, state) = inheritance_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("no connection was accepted");

    // Equal to the listener's template at accept time, and born ready.
    assert_eq!(reliability, Preference::Require);
    assert!(set_by_user);
    assert_eq!(state, ConnectionState::Ready);

    // Exactly one accepted connection.
    assert!(inheritance_rx.recv_timeout(Duration::from_millis(200)).is_err());

    let mut events = Vec::new();
    while let Ok(event) = event_rx.recv_timeout(Duration::from_secs(10)) {
        events.push(event);
        if event == "closed" {
            break;
        }
    }
    assert_eq!(events, vec!["ready", "closed"]);

    client.join().unwrap();
    server.join().unwrap();
}
