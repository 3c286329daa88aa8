//! Wire protocol and framing
//!
//! Every message is one frame: a 4-byte big-endian length followed by a
//! MessagePack body. The same framing carries the executor protocol, the
//! filesystem gateway protocol and the process-worker protocol.
//!
//! All payloads beyond simple scalars are opaque serialized blobs; the
//! protocol does not interpret plugin-specific data.

use std::io::{Read, Write};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::ServiceDescriptor;
use crate::node::NodeId;
use crate::payload::Payload;
use crate::task::{TaskId, TaskResult};

/// Upper bound on a single frame, protects against corrupt length prefixes
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame encoding failed: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    #[error("frame decoding failed: {0}")]
    Decode(#[source] rmp_serde::decode::Error),

    #[error("frame length {len} exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversized { len: u32 },
}

impl FrameError {
    /// True when the failure was a bounded read running out of time rather
    /// than the peer going away.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

/// Write one length-prefixed MessagePack frame
pub fn write_frame<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<(), FrameError> {
    let body = rmp_serde::to_vec(message).map_err(FrameError::Encode)?;
    let len = u32::try_from(body.len()).map_err(|_| FrameError::Oversized { len: u32::MAX })?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized { len });
    }
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed MessagePack frame
pub fn read_frame<T: DeserializeOwned>(reader: &mut impl Read) -> Result<T, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized { len });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    rmp_serde::from_slice(&body).map_err(FrameError::Decode)
}

/// Client-to-server messages of the remote execution protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Register the client's filesystem gateway so server-side code can pull
    /// paths that live on the client node. Registering an already-known node
    /// id is a fatal configuration error.
    RegisterFilesystemAccess { node: NodeId, gateway: String },

    /// Transfer the plugin directory as an encoded tree
    CopyPlugin { archive: Vec<u8> },

    /// Instantiate the service on the server. The descriptor's plugin
    /// directory is a client-side path; the server rebases it onto the
    /// previously copied plugin tree.
    InitService { descriptor: ServiceDescriptor },

    /// Synchronous invocation, answered in the same round trip
    CallFunc { method: String, args: Payload },

    /// Fire-and-forget asynchronous invocation; the result lands in the
    /// server's batched buffer under `id`
    SubmitFunc {
        id: TaskId,
        method: String,
        args: Payload,
    },

    /// Blocking poll: answered once `id` is buffered, with every result
    /// buffered at that moment
    GetResults { id: TaskId },
}

/// Server-to-client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Setup step accepted
    Ack,

    /// Outcome of a `CallFunc`
    CallResult(crate::task::TaskOutcome),

    /// Drained result batch answering a `GetResults`
    Results(Vec<TaskResult>),

    /// Protocol error; the session is over
    Fatal { message: String },
}

/// Request served by a node's filesystem gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GatewayRequest {
    /// Encode the file or directory at `path` on the gateway's node
    FetchPath { path: std::path::PathBuf },
}

/// Gateway reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GatewayResponse {
    /// Encoded tree containing the requested object
    Tree(Vec<u8>),

    /// The path could not be served
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut buf = Vec::new();
        let request = Request::SubmitFunc {
            id: 9,
            method: "echo".into(),
            args: Payload::encode(&"hi").unwrap(),
        };
        write_frame(&mut buf, &request).unwrap();

        let decoded: Request = read_frame(&mut buf.as_slice()).unwrap();
        match decoded {
            Request::SubmitFunc { id, method, .. } => {
                assert_eq!(id, 9);
                assert_eq!(method, "echo");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.extend_from_slice(&[0; 16]);

        let result: Result<Request, _> = read_frame(&mut buf.as_slice());
        assert!(matches!(result, Err(FrameError::Oversized { .. })));
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Response::Ack).unwrap();
        buf.truncate(buf.len() - 1);

        let result: Result<Response, _> = read_frame(&mut buf.as_slice());
        assert!(matches!(result, Err(FrameError::Io(_))));
    }
}
