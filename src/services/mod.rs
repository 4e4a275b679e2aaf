pub mod delivery;

pub use delivery::{DeliveryEngine, SendRequest};
