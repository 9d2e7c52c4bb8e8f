#![forbid(unsafe_code)]
//! Duplicate request cache for an NFS server.
//!
//! Non-idempotent requests (writes, creates, renames, removes) must not run
//! twice when a client retransmits. The cache remembers recent requests by
//! transaction id, checksum and (for datagrams) peer, and answers a
//! retransmit either by replaying the stored response or, while the original
//! is still executing, by telling the transport to stay silent.
//!
//! Datagram traffic shares one cache. Each stream connection gets its own,
//! which outlives the connection in a recycling registry so a reconnecting
//! client keeps its history.
//!
//! Entry point: [`DrcSubsystem`].

use std::fmt;

pub mod config;
pub mod dispatch;
mod drc;
mod entry;
pub mod lock_order;
pub mod partition;
mod registry;
pub mod retire;
pub mod stats;
mod subsystem;

pub use config::{CacheParams, DrcConfig};
pub use dispatch::{Cacheability, Dispatch, NfsDispatchTable, compound_cacheable};
pub use entry::{EntryKey, EntryState};
pub use stats::{DrcStats, RegistryStats, SubsystemStats};
pub use subsystem::{
    Connection, DrcHandle, DrcSubsystem, EntryHandle, Origin, ReplyHandle, RequestDescriptor,
    RequestSlot, StartOutcome, UncachedRequest,
};

/// Report a broken invariant and stop.
///
/// Continuing on a cache whose bookkeeping is wrong risks replaying one
/// client's response to another request, so there is no recovery path.
#[cold]
#[track_caller]
pub(crate) fn fail_stop(violation: fmt::Arguments<'_>) -> ! {
    tracing::error!(%violation, "drc invariant violated");
    panic!("drc invariant violated: {violation}");
}
