//! Domain entities and the trait boundaries to external collaborators.

pub mod anchor;
pub mod payment;
pub mod ports;
