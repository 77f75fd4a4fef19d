pub mod fence;
pub mod protocol;

pub use fence::{FenceCoordinator, FencePhase, ReadyFence, Release};
pub use protocol::{Frame, Message, ProtocolError};
