//! Change-notification intake: event records, the bounded channel that
//! carries them, and a notify-backed source for live trees.

pub mod events;
#[cfg(feature = "watch")]
pub mod notify_source;
