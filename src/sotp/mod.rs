#[cfg(test)]
mod e2e_test;

pub mod buffer;
pub mod cipher;
pub mod client;
pub mod core;
pub mod packet;
pub mod router;
pub mod server;

use std::fmt;

/// Mandatory header: session_id (1) + seq_number (2) + ack (2) +
/// data_len (2) + flags (1).
pub const HEADER_SIZE: usize = 8;
/// Sub-header carried only when the SYNC flag is set.
pub const SUB_HEADER_SIZE: usize = 1;
/// Overlay tag carried in the Request-Auth content.
pub const TAG_SIZE: usize = 2;

/// Highest sequence number representable in the 16-bit field.
pub const MAX_SEQ_NUMBER: u16 = u16::MAX;
/// Number of distinct session ids (8-bit field).
pub const SESSION_ID_SPACE: usize = 1 << 8;
/// Pending-init entries retained between Request-Auth and the first
/// confirmed client packet; oldest evicted beyond this to resist floods.
pub const PENDING_INIT_MAX: usize = SESSION_ID_SPACE / 2;

/// Session lifecycle status, shared by both state machines.
///
/// `Stopping` has no internal trigger: it is entered only when an external
/// `Stop` signal is delivered to the client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    NotInitializing,
    Initializing,
    Working,
    Terminating,
    Reinitializing,
    Stopping,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Status::NotInitializing => "NotInitializing",
            Status::Initializing => "Initializing",
            Status::Working => "Working",
            Status::Terminating => "Terminating",
            Status::Reinitializing => "Reinitializing",
            Status::Stopping => "Stopping",
        };
        write!(f, "{s}")
    }
}
