//! Synchronization primitives shared by the subscriber and the coordinator.
//!
//! - [`ReadinessGate`]: opens once, on the subscriber's first successful join
//! - [`DeliveryCounter`]: pending sent-but-unobserved messages
//!
//! These are the only mutable state shared between the two execution paths.

mod counter;
mod gate;

pub use counter::{DeliveryCounter, SendReservation};
pub use gate::ReadinessGate;
