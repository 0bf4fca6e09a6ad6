// Layer 1 - Venue connectivity
// Transport, frame decoding, connection lifecycle

pub mod backoff;
pub mod connection;
pub mod frame;
pub mod websocket;

pub use backoff::Backoff;
pub use connection::{
    ConnectionConfig, ConnectionStateHandle, ConnectionStats, Credentials, FrameTransport,
    StreamConnection, StreamError, Subscription,
};
pub use frame::{decode_frame, FrameKind, RawFrame};
pub use websocket::WsTransport;
