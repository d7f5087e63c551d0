mod frame;
mod registry;
mod types;

pub use frame::{EventName, SseFrame};
pub use registry::ConnectionRegistry;
pub use types::{Connection, OutboundFrame, WriteOptions};
