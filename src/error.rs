//! Per-subsystem error types.

use std::io;

use derive_more::{Display, From};

/// Errors that can occur while building or validating the process
/// configuration.
#[derive(Debug, Display, From)]
pub enum ConfigError {
    /// Underlying `config` crate failed to merge or deserialize sources.
    #[display(fmt = "Failed to load configuration: {}", _0)]
    Load(config::ConfigError),

    /// A required key was absent after all sources were merged.
    #[display(fmt = "Missing required configuration key: {}", _0)]
    #[from(ignore)]
    MissingKey(String),

    /// A `--key=value` CLI argument could not be parsed.
    #[display(fmt = "Malformed CLI argument: {}", _0)]
    #[from(ignore)]
    BadArgument(String),
}

impl failure::Fail for ConfigError {}
impl std::error::Error for ConfigError {}

/// Errors surfaced while loading or querying the [`TraceStore`].
///
/// [`TraceStore`]: crate::trace::store::TraceStore
#[derive(Debug, Display, From)]
pub enum TraceStoreError {
    /// Failed to read the trace artifact from disk.
    #[display(fmt = "I/O error loading replay: {}", _0)]
    Io(io::Error),

    /// Artifact JSON was malformed.
    #[display(fmt = "Failed to parse trace artifact: {}", _0)]
    Parse(serde_json::Error),

    /// Stored payload was not valid hex, or had an odd number of digits.
    #[display(fmt = "Invalid hex payload in replay {}: {}", replay, reason)]
    #[from(ignore)]
    BadHexPayload {
        /// Replay the offending payload was found in.
        replay: String,
        /// Human-readable reason hex decoding failed.
        reason: String,
    },

    /// Requested replay name has no matching artifact on disk.
    #[display(fmt = "Unknown replay name: {}", _0)]
    #[from(ignore)]
    UnknownReplay(String),
}

impl failure::Fail for TraceStoreError {}
impl std::error::Error for TraceStoreError {}

/// Errors surfaced by the side-channel server and its framing codec.
#[derive(Debug, Display, From)]
pub enum SideChannelError {
    /// Underlying transport failed on I/O.
    #[display(fmt = "Side channel I/O failed: {}", _0)]
    Io(io::Error),

    /// Peer closed the connection before a step of the protocol completed.
    #[display(fmt = "Side channel peer disconnected")]
    Disconnected,

    /// A received frame did not decode as valid UTF-8 or valid JSON where
    /// one was expected.
    #[display(fmt = "Malformed side channel message: {}", _0)]
    #[from(ignore)]
    Malformed(String),

    /// The frame length prefix did not parse as a 10-digit decimal number.
    #[display(fmt = "Bad length prefix: {}", _0)]
    #[from(ignore)]
    BadLengthPrefix(String),

    /// Admission was denied; carries the wire code from spec.md's code
    /// table (1 = unknown replay, 2 = no permission, 3 = overloaded).
    #[display(fmt = "Admission denied, code {}", _0)]
    #[from(ignore)]
    Denied(u8),
}

impl failure::Fail for SideChannelError {}
impl std::error::Error for SideChannelError {}

/// Errors surfaced by the TCP/UDP flow servers.
#[derive(Debug, Display, From)]
pub enum FlowServerError {
    /// Underlying transport failed on I/O.
    #[display(fmt = "Flow server I/O failed: {}", _0)]
    Io(io::Error),

    /// The connecting peer was not recognized and did not carry an `X-rr`
    /// identification header.
    #[display(fmt = "Unknown packet from unknown client {}", _0)]
    #[from(ignore)]
    UnknownClient(String),

    /// Flow task was cancelled by the side-channel close callback or the
    /// greenlet cleaner.
    #[display(fmt = "Flow cancelled")]
    Cancelled,
}

impl failure::Fail for FlowServerError {}
impl std::error::Error for FlowServerError {}

/// Errors surfaced by the client-side replay driver.
#[derive(Debug, Display, From)]
pub enum ClientDriverError {
    /// Underlying transport failed on I/O.
    #[display(fmt = "Client I/O failed: {}", _0)]
    Io(io::Error),

    /// Side channel reported admission denial.
    #[display(fmt = "Admission denied, code {}", _0)]
    #[from(ignore)]
    AdmissionDenied(u8),

    /// No activity observed for longer than the configured idle timeout.
    #[display(fmt = "Idle timeout")]
    IdleTimeout,

    /// Server reported a `SuspiciousClientIP!` sentinel, indicating the
    /// data-plane source IP diverged from the side-channel's view.
    #[display(fmt = "IP flip detected, server now sees {}", _0)]
    #[from(ignore)]
    IpFlip(String),
}

impl failure::Fail for ClientDriverError {}
impl std::error::Error for ClientDriverError {}
