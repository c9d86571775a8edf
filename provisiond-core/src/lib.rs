//! Core library for the WiFi provisioning daemon.
//! This crate defines the network backend trait and its implementations,
//! the provisioning state machine, the captive portal and tunnel plumbing,
//! and the web/WebSocket surface that ties them together.

pub mod backends;
pub mod captive_portal;
pub mod config;
pub mod display;
pub mod embed;
pub mod identity;
pub mod mdns;
pub mod orchestrator;
pub mod state;
pub mod traits;
pub mod tunnel;
pub mod web_server;

// Shared Error and Result types for the entire crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    BadInput(String),

    #[error("no usable network interface with a MAC address")]
    NoMac,

    #[error("no WiFi device available")]
    NoDevice,

    #[error("a scan is already in progress")]
    ScanBusy,

    #[error("authentication failed (wrong password?)")]
    AuthFailed,

    #[error("association with the access point was rejected")]
    AssocFailed,

    #[error("no IP address was assigned in time")]
    DhcpFailed,

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("failed to start access point: {0}")]
    ApStartFailed(String),

    #[error("captive portal setup failed: {0}")]
    CaptiveFailed(String),

    #[error("another connection attempt is in progress")]
    Busy,

    #[error("tunnel failure: {0}")]
    Tunnel(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable short code carried in REST/WS error payloads and log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Io(_) | Error::CommandFailed(_) => "COMMAND_FAIL",
            Error::Config(_) => "BAD_CONFIG",
            Error::BadInput(_) => "BAD_INPUT",
            Error::NoMac => "NO_MAC",
            Error::NoDevice => "NO_DEVICE",
            Error::ScanBusy => "SCAN_BUSY",
            Error::AuthFailed => "AUTH_FAIL",
            Error::AssocFailed => "ASSOC_FAIL",
            Error::DhcpFailed => "DHCP_FAIL",
            Error::ConnectTimeout => "CONNECT_TIMEOUT",
            Error::ApStartFailed(_) => "AP_START_FAIL",
            Error::CaptiveFailed(_) => "CAPTIVE_FAIL",
            Error::Busy => "BUSY",
            Error::Tunnel(_) => "TUNNEL_FAIL",
            Error::Json(_) => "INTERNAL",
        }
    }

    /// Whether the failure is fatal for process startup (exit code 1).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NoMac | Error::NoDevice | Error::Config(_))
    }
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;
