//! Error types for the host stack.

use ci_protocol::{CaPmtError, ProtocolError, ResourceId, SessionStatus};
use thiserror::Error;

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The slot device failed.
    #[error("I/O error on slot {slot}: {source}")]
    Io {
        slot: u8,
        #[source]
        source: std::io::Error,
    },

    /// A frame from the module could not be decoded.
    #[error("Framing error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unknown slot {0}")]
    UnknownSlot(u8),

    #[error("Unknown transport connection {tcid} on slot {slot}")]
    UnknownConnection { slot: u8, tcid: u8 },

    #[error("Transport connection {tcid} on slot {slot} is not open")]
    NotOpen { slot: u8, tcid: u8 },

    #[error("No free transport connection id on slot {0}")]
    NoFreeConnection(u8),

    /// The module stopped answering.
    #[error("Module on slot {slot} did not answer connection {tcid} after {failures} attempts")]
    Timeout { slot: u8, tcid: u8, failures: u32 },
}

/// Session layer errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Unknown session {0}")]
    UnknownSession(u16),

    /// No registration satisfies the requested resource.
    #[error("Resource {0} not available: {1:?}")]
    NoResource(ResourceId, SessionStatus),

    #[error("No free session number")]
    NoFreeSession,

    #[error("Unexpected SPDU: {0}")]
    Unexpected(&'static str),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Application resource errors.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// APDU could not be decoded.
    #[error("Malformed APDU: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No resource state for session {0}")]
    UnknownSession(u16),

    /// The operation does not fit the resource's current state.
    #[error("Session {session} is in the wrong state: expected {expected}")]
    WrongState { session: u16, expected: &'static str },

    /// CA_PMT could not be built.
    #[error("CA_PMT build failed: {0}")]
    CaPmt(#[from] CaPmtError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}
