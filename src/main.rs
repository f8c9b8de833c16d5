//! # Transport Services Demo
//!
//! Small client/server demo over the library's public surface: selection
//! preferences choose the protocol stack, `initiate` races the candidates,
//! `listen` echoes every received message back with a "Pong: " prefix.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use taps::{
    ConnectionCallbacks, ListenerCallbacks, LocalEndpoint, LogLevel, Message, Preconnection,
    ReceiveCallbacks, RemoteEndpoint, SecurityParameters, SecurityProperty,
};

mod cli;
use cli::{Args, Command, InitiateArgs, ListenArgs};

fn main() -> Result<()> {
    let args = Args::parse();

    taps::initialize(args.cert.as_deref(), args.key.as_deref())
        .context("failed to initialize the transport services runtime")?;

    let log_level = match args.verbose {
        0 => LogLevel::Info,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };
    taps::set_log_level(log_level)?;
    if let Some(log_file) = &args.log_file {
        taps::add_log_file(log_file, log_level)?;
    }

    // The handles must outlive the event loop; dropping them early would
    // let the reactor drain while peers are still being served.
    match args.command {
        Command::Initiate(initiate) => {
            let _connection = run_initiate(initiate)?;
            taps::start_event_loop()?;
        }
        Command::Listen(listen) => {
            let _listener = run_listen(listen)?;
            taps::start_event_loop()?;
        }
    }
    taps::close_library()?;
    Ok(())
}

fn security_from(alpn: &[String]) -> Result<SecurityParameters> {
    let mut security = SecurityParameters::build();
    if !alpn.is_empty() {
        security.set_string_array(SecurityProperty::Alpn, alpn)?;
    }
    Ok(security)
}

fn run_initiate(args: InitiateArgs) -> Result<std::rc::Rc<taps::Connection>> {
    let mut remote = RemoteEndpoint::build().with_hostname(&args.host);
    if let Some(port) = args.port {
        remote = remote.with_port(port);
    }
    if let Some(service) = &args.service {
        remote = remote.with_service(service);
    }

    let properties = args.preferences.to_transport_properties();
    let security = security_from(&args.preferences.alpn)?;
    let preconnection =
        Preconnection::new(std::slice::from_ref(&remote), &properties).with_security(&security);

    let payload = args.message.clone();
    let callbacks = ConnectionCallbacks {
        ready: Some(Box::new(move |conn| {
            info!(
                "connection {} ready over {}",
                conn.uuid(),
                conn.socket_manager()
                    .map(|m| m.protocol())
                    .unwrap_or("unknown")
            );
            if let Err(e) = conn.send_message(Message::new(payload.as_bytes().to_vec())) {
                error!("send failed: {}", e);
                conn.close();
                return;
            }
            let receive = ReceiveCallbacks {
                received: Box::new(|conn, message, _ctx| {
                    info!(
                        "received {} byte(s): {}",
                        message.len(),
                        String::from_utf8_lossy(message.as_bytes())
                    );
                    conn.close();
                }),
                receive_error: None,
            };
            if let Err(e) = conn.receive_message(receive) {
                error!("receive registration failed: {}", e);
                conn.close();
            }
        })),
        establishment_error: Some(Box::new(|_conn, error| {
            error!("establishment failed: {}", error);
        })),
        closed: Some(Box::new(|conn| {
            info!("connection {} closed", conn.uuid());
        })),
        ..Default::default()
    };

    let connection = match args.timeout_ms {
        Some(millis) => preconnection
            .initiate_with_timeout(callbacks, std::time::Duration::from_millis(millis))?,
        None => preconnection.initiate(callbacks)?,
    };
    info!("initiating connection {}", connection.uuid());
    Ok(connection)
}

fn run_listen(args: ListenArgs) -> Result<std::rc::Rc<taps::Listener>> {
    let mut local = LocalEndpoint::build().with_port(args.port);
    if let Some(interface) = &args.interface {
        local = local.with_interface(interface);
    }

    let properties = args.preferences.to_transport_properties();
    let security = security_from(&args.preferences.alpn)?;
    let preconnection = Preconnection::new(&[], &properties)
        .with_security(&security)
        .with_local(&local);

    let callbacks = ListenerCallbacks {
        connection_received: Some(Box::new(|_listener, conn| {
            info!("accepted connection {} from {:?}", conn.uuid(), conn.remote_endpoint());
            serve_echo(&conn);
        })),
        establishment_error: Some(Box::new(|_listener, error| {
            error!("listener failed: {}", error);
        })),
        stopped: Some(Box::new(|_listener| info!("listener stopped"))),
    };

    let listener = preconnection.listen(callbacks)?;
    info!("listening on port {}", args.port);
    Ok(listener)
}

/// Echo every message back, prefixed, and re-arm the receive so the
/// connection keeps serving until the peer closes.
fn serve_echo(conn: &std::rc::Rc<taps::Connection>) {
    let receive = ReceiveCallbacks {
        received: Box::new(|conn, message, _ctx| {
            info!(
                "received {} byte(s): {}",
                message.len(),
                String::from_utf8_lossy(message.as_bytes())
            );
            let mut reply = b"Pong: ".to_vec();
            reply.extend_from_slice(message.as_bytes());
            if let Err(e) = conn.send_message(Message::new(reply)) {
                error!("echo failed: {}", e);
                conn.close();
                return;
            }
            serve_echo(conn);
        }),
        receive_error: None,
    };
    if let Err(e) = conn.receive_message(receive) {
        error!("receive registration failed: {}", e);
    }
}
