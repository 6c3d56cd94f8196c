//! Live subscription engine for Tandem.
//!
//! - [`SubscriptionRegistry`]: one push channel per key, refresh and refresh-all
//! - [`ReconnectSupervisor`]: shared exponential backoff over registry status events
//! - [`LiveCollection`] and [`LiveView`]: merge-and-order of row change streams
//! - [`UnreadTracker`]: optimistic unread counters with reconciliation
//! - [`PresenceTracker`]: sync-authoritative online set

#![forbid(unsafe_code)]

pub mod collection;
pub mod config;
pub mod prelude;
pub mod presence;
pub mod registry;
pub mod supervisor;
pub mod unread;
pub mod view;

#[cfg(test)]
mod test_support;

pub use collection::LiveCollection;
pub use config::LiveConfig;
pub use presence::{PresenceOptions, PresenceTracker};
pub use registry::{SubscriptionRegistry, SubscriptionStatus, SubscriptionTicket};
pub use supervisor::{LinkState, ReconnectSupervisor, SupervisorEvent};
pub use unread::{MarkState, UnreadSource, UnreadTracker};
pub use view::{InsertHook, LiveRecord, LiveView, ResyncHook, ViewHooks, ViewSpec, decode_row};

// vim: ts=4
