//! Establishment-path edge cases: synchronous candidate filtering,
//! deadline expiry, and resolution failures surfacing as establishment
//! errors.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use taps::{
    ConnectionCallbacks, ConnectionState, Preconnection, Preference, RemoteEndpoint,
    SelectionProperty, TapsError, TransportProperties,
};

/// Reliability excludes UDP, boundaries exclude TCP, the multistreaming
/// prohibition excludes QUIC: `initiate` must fail synchronously, before
/// any connection object or callback exists.
#[test]
fn contradictory_selection_fails_synchronously() {
    taps::initialize(None, None).unwrap();

    let mut properties = TransportProperties::build();
    properties.set_selection_preference(SelectionProperty::Reliability, Preference::Require);
    properties.set_selection_preference(SelectionProperty::Multistreaming, Preference::Prohibit);
    properties.set_selection_preference(
        SelectionProperty::PreserveMsgBoundaries,
        Preference::Require,
    );

    let remote = RemoteEndpoint::build()
        .with_hostname("127.0.0.1")
        .with_port(5005);
    let preconnection = Preconnection::new(std::slice::from_ref(&remote), &properties);

    let result = preconnection.initiate(ConnectionCallbacks::default());
    assert!(matches!(result, Err(TapsError::NoCandidate)));

    taps::close_library().unwrap();
}

/// A race that cannot finish before the deadline aborts every candidate
/// and reports a timeout through `establishment_error`.
#[test]
fn establishment_timeout_fires_establishment_error() {
    let (event_tx, event_rx) = mpsc::channel::<String>();

    // A silent UDP sink: it swallows the handshake packets without ever
    // answering, so the candidate can only die by deadline.
    let _sink = std::net::UdpSocket::bind("127.0.0.1:1241").unwrap();

    let client = thread::spawn(move || {
        taps::initialize(None, None).unwrap();

        // QUIC only, towards a port nobody answers on: the handshake
        // retries until the deadline cuts it off.
        let mut properties = TransportProperties::build();
        properties.set_selection_preference(SelectionProperty::Reliability, Preference::Require);
        properties
            .set_selection_preference(SelectionProperty::Multistreaming, Preference::Require);

        let remote = RemoteEndpoint::build()
            .with_hostname("127.0.0.1")
            .with_port(1241);
        let preconnection = Preconnection::new(std::slice::from_ref(&remote), &properties);

        let error_tx = event_tx.clone();
        let connection = preconnection
            .initiate_with_timeout(
                ConnectionCallbacks {
                    ready: Some(Box::new(move |_conn| {
                        event_tx.send("ready".to_owned()).unwrap();
                    })),
                    establishment_error: Some(Box::new(move |_conn, error| {
                        error_tx.send(format!("establishment_error: {error}")).unwrap();
                    })),
                    ..Default::default()
                },
                Duration::from_millis(500),
            )
            .unwrap();

        taps::start_event_loop().unwrap();
        assert_eq!(connection.state(), ConnectionState::Errored);
        taps::close_library().unwrap();
    });

    let event = event_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("no establishment outcome");
    assert_eq!(event, "establishment_error: establishment timed out");

    client.join().unwrap();
}

/// Unresolvable names propagate as an establishment error during
/// initiate, never as a synchronous failure.
#[test]
fn resolution_failure_surfaces_on_the_callback() {
    let (event_tx, event_rx) = mpsc::channel::<String>();

    let client = thread::spawn(move || {
        taps::initialize(None, None).unwrap();

        let remote = RemoteEndpoint::build()
            .with_hostname("no-such-host.invalid")
            .with_port(443);
        let preconnection =
            Preconnection::new(std::slice::from_ref(&remote), &TransportProperties::build());

        let connection = preconnection
            .initiate(ConnectionCallbacks {
                establishment_error: Some(Box::new(move |_conn, error| {
                    event_tx.send(error.to_string()).unwrap();
                })),
                ..Default::default()
            })
            .unwrap();

        // The call itself succeeded; the failure is asynchronous.
        assert_eq!(connection.state(), ConnectionState::Establishing);

        taps::start_event_loop().unwrap();
        assert_eq!(connection.state(), ConnectionState::Errored);
        taps::close_library().unwrap();
    });

    let message = event_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("no establishment outcome");
    assert!(
        message.contains("name resolution failed"),
        "unexpected error: {message}"
    );

    client.join().unwrap();
}
