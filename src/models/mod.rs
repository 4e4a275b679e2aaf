pub mod block;
pub mod message;

pub use block::BlockState;
pub use message::{DeliveryStatus, Message, NewMessage, REVOKED_PLACEHOLDER};
