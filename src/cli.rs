//! # Command-Line Interface Module
//!
//! Argument parsing for the demo binary, built on clap's derive API. The
//! demo exercises the library end-to-end: `initiate` opens a client
//! connection chosen by selection preferences and exchanges one message;
//! `listen` runs an echo server accepting whatever stacks the same
//! preferences select.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, Subcommand, ValueEnum,
};
use std::path::PathBuf;

use taps::{Preference, SelectionProperty, TransportProperties};

/// Defines the styles for the help message to replicate clap v3's
/// appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Certificate file (PEM). Servers present it; clients trust it.
    #[arg(long, global = true)]
    pub cert: Option<PathBuf>,

    /// Private key file (PEM) for the certificate.
    #[arg(long, global = true)]
    pub key: Option<PathBuf>,

    /// Increase verbosity (-v: debug, -vv: trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also append logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Connect to a remote endpoint and exchange one message.
    Initiate(InitiateArgs),
    /// Run an echo server on a local endpoint.
    Listen(ListenArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct InitiateArgs {
    /// Remote hostname or IP address.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Remote port.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Remote service name, looked up when no port is given.
    #[arg(long)]
    pub service: Option<String>,

    /// Message payload to send once the connection is ready.
    #[arg(short, long, default_value = "ping")]
    pub message: String,

    /// Establishment deadline in milliseconds (unset: no timeout).
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[command(flatten)]
    pub preferences: PreferenceArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct ListenArgs {
    /// Local interface to bind (e.g. "lo"); wildcard when unset.
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Local port to bind.
    #[arg(short, long)]
    pub port: u16,

    #[command(flatten)]
    pub preferences: PreferenceArgs,
}

/// Selection preferences shared by both subcommands.
#[derive(Parser, Debug, Clone)]
pub struct PreferenceArgs {
    /// Preference for reliable delivery.
    #[arg(long, value_enum, default_value_t = PreferenceArg::NoPreference)]
    pub reliability: PreferenceArg,

    /// Preference for preserved message boundaries.
    #[arg(long, value_enum, default_value_t = PreferenceArg::NoPreference)]
    pub boundaries: PreferenceArg,

    /// Preference for multistreaming transports.
    #[arg(long, value_enum, default_value_t = PreferenceArg::NoPreference)]
    pub multistreaming: PreferenceArg,

    /// ALPN protocols offered during a TLS handshake.
    #[arg(long)]
    pub alpn: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferenceArg {
    Prohibit,
    Avoid,
    NoPreference,
    Prefer,
    Require,
}

impl From<PreferenceArg> for Preference {
    fn from(value: PreferenceArg) -> Self {
        match value {
            PreferenceArg::Prohibit => Preference::Prohibit,
            PreferenceArg::Avoid => Preference::Avoid,
            PreferenceArg::NoPreference => Preference::NoPreference,
            PreferenceArg::Prefer => Preference::Prefer,
            PreferenceArg::Require => Preference::Require,
        }
    }
}

impl PreferenceArgs {
    /// Translate the flags into a transport-property bag.
    pub fn to_transport_properties(&self) -> TransportProperties {
        let mut properties = TransportProperties::build();
        for (property, value) in [
            (SelectionProperty::Reliability, self.reliability),
            (SelectionProperty::PreserveMsgBoundaries, self.boundaries),
            (SelectionProperty::Multistreaming, self.multistreaming),
        ] {
            if value != PreferenceArg::NoPreference {
                properties.set_selection_preference(property, value.into());
            }
        }
        properties
    }
}
