//! Identifiers shared by every service taking part in user replication.

pub mod types;

pub use types::{Handle, ParticipantId};
