//! facelog-core: recognition-event primitives.
//!
//! Holds the data model shared by the daemon and the CLI: identities loaded
//! from the roster, per-tick match outcomes, accepted recognition events,
//! and the per-identity cooldown tracker that rate-limits them.

pub mod cooldown;
pub mod roster;
pub mod source;
pub mod types;

pub use cooldown::CooldownTracker;
pub use roster::{Roster, RosterError};
pub use source::{MatchSource, SourceError};
pub use types::{
    Identity, MatchCandidate, MatchOutcome, NotificationTarget, RecognitionEvent, Snapshot,
};
