//! `eventdesk-core` — shared primitives for the event operations core.
//!
//! Pure types only: identifiers, the domain error model and a clock seam.
//! No IO lives here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{EventId, OperatorId, RsvpId};
