//! Chat domain layer for Tandem.
//!
//! Builds the user-facing pieces of the messaging client on top of `tandem-live`:
//! live conversation feeds with unread badges, an optimistic outbox with attachment
//! upload, and the notification feed. [`ChatState`] wires them up for one user.

#![forbid(unsafe_code)]

pub mod feed;
pub mod message;
pub mod notification;
pub mod outbox;
pub mod prelude;
pub mod session;

pub use feed::ConversationFeed;
pub use message::Message;
pub use notification::{Notification, NotificationFeed};
pub use outbox::{Attachment, Draft, Outbox, Outgoing, SendState};
pub use session::{ChatSession, ChatState};

// vim: ts=4
