//! Resource allocation and session control for the Arm CoreSight Embedded
//! Trace Macrocell (ETMv4).
//!
//! An ETM is a per-core hardware trace unit exposed as a block of
//! memory-mapped registers. This crate drives one or more ETM instances
//! through their unlock/reset/enable/disable protocol and multiplexes the
//! small, fixed sets of trigger and filter resources (address comparators,
//! resource selectors, external input selectors, counters) across
//! independently requested trace features.
//!
//! The crate does not map device memory, fork traced targets, sample PMU
//! counters or drain trace buffers; those are collaborators. A typical
//! session looks like:
//!
//! ```no_run
//! use coresight_etm::{Etm, MmioWindow};
//!
//! # fn main() -> Result<(), coresight_etm::EtmError> {
//! # let mapped: *mut u32 = std::ptr::null_mut();
//! // `mapped` points at one ETM's 4 KiB register window.
//! let window = unsafe { MmioWindow::new(mapped) };
//! let mut etm = Etm::new(window, 0)?;
//!
//! etm.unlock();
//! etm.reset()?;
//! etm.filter_context_id(4242)?;
//! etm.trace_address_range(0x40_1144, 0x40_1274, true)?;
//! etm.enable()?;
//! // ... traced target runs ...
//! etm.disable()?;
//! # Ok(())
//! # }
//! ```
//!
//! All operations on one instance must stay on a single logical thread of
//! control. Up to four instances can be driven concurrently from
//! independent threads; they share no state.

pub mod error;
pub mod etm;
pub mod memory;
pub mod registers;
pub mod registry;
pub mod resource;

pub use error::EtmError;
pub use etm::{Etm, EtmStatus, SessionState, DEFAULT_HANDSHAKE_TIMEOUT, MAX_INSTANCES};
pub use memory::{EtmMemory, MmioWindow, ETM_WINDOW_SIZE};
pub use registry::EtmRegistry;
pub use resource::{ResourceClass, ResourcePool, ResourcePools};
