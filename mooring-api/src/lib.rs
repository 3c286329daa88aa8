//! mooring-api: Shared types for the mooring service execution system
//!
//! This crate defines the protocol between a host and a remote execution
//! server, and the descriptor types both sides agree on. Communication uses
//! MessagePack serialization with length-prefixed frames.

pub mod descriptor;
pub mod node;
pub mod payload;
pub mod task;
pub mod wire;

pub use descriptor::{DescriptorError, PluginDescriptor, ServiceDescriptor, MODULE_FILE_PROPERTY};
pub use node::NodeId;
pub use payload::{Payload, PayloadError};
pub use task::{TaskError, TaskId, TaskOutcome, TaskResult};
pub use wire::{
    read_frame, write_frame, FrameError, GatewayRequest, GatewayResponse, Request, Response,
};
