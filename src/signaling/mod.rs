pub mod memory;
pub mod message;
pub mod signaler;
pub mod transport;

pub use memory::{MemoryBroker, MemoryTransport};
pub use message::{MessageBody, SignalingMessage};
pub use signaler::Signaler;
pub use transport::{Delivery, SignalingTransport};
