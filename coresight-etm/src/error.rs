//! Error taxonomy of the allocation and protocol layer.

use std::time::Duration;

use crate::etm::SessionState;
use crate::resource::ResourceClass;

/// Errors reported by pool allocation, feature programming and the session
/// protocol.
///
/// There is no partial-allocation rollback: when a programmer fails halfway,
/// resources granted by its earlier steps stay held for the instance's
/// lifetime (until the next [`reset`](crate::Etm::reset)).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EtmError {
    /// A resource pool cannot satisfy a single or pair allocation request.
    #[error("no free {class} left on ETM instance {instance}")]
    ResourceExhausted {
        /// The exhausted resource class.
        class: ResourceClass,
        /// Index of the ETM instance whose pool ran dry.
        instance: u8,
    },

    /// A requested event-packet position lies outside the four positions
    /// the trace unit implements.
    #[error("event packet position {0} is outside 0..=3")]
    InvalidPacketPosition(u8),

    /// The trace unit did not reach the expected programming state within
    /// the handshake deadline. The hardware is likely faulty or clock-gated.
    #[error("trace unit handshake timed out after {waited:?} (waiting for idle={wanted_idle})")]
    HandshakeTimeout {
        /// Whether the poll was waiting for the idle bit to set or clear.
        wanted_idle: bool,
        /// How long the poll ran before giving up.
        waited: Duration,
    },

    /// An operation was invoked in a session state it is not defined for.
    #[error("{operation} is not valid while the session is {state:?}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The session state the instance was in.
        state: SessionState,
    },

    /// An instance index outside the four tracked ETM slots.
    #[error("ETM instance index {0} is outside 0..=3")]
    InvalidInstanceIndex(u8),

    /// The registry already holds an instance at this index.
    #[error("ETM registry slot {0} is already occupied")]
    SlotOccupied(u8),
}
