//! Wire protocol shared by the server and the client.
//!
//! Connections carry newline-delimited JSON frames. A client opens with a
//! `hello` carrying the shared key, then issues `request` frames correlated
//! by id and `ping` frames for keepalive.

mod codec;
mod messages;

pub use codec::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_BYTES};
pub use messages::{
    decode_client_frame, decode_server_frame, ClientFrame, Command, FailureKind, Reply,
    ServerFrame, PROTOCOL_VERSION,
};

/// Port the server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 51234;
