pub mod protocol;
pub mod status;

pub use protocol::{
    now_ms, Command, CommandAck, CommandKind, CommandRejected, FrameError, Pong, ProtocolVersion,
    ServerEnvelope, ServerMessage, DEFAULT_MAX_FRAME_BYTES,
};
pub use status::{
    InitialStatus, LifecycleState, ResourceId, ResourceSnapshot, StageDetails, StatusUpdate,
    Target, ALL_TARGET,
};
