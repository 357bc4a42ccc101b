#![forbid(unsafe_code)]

pub mod session;
pub mod tcp;
pub mod websocket;

pub use session::{SessionHandle, SessionHandler, SessionSink, TransportKind, WeakSessionHandle};
pub use tcp::TcpServer;
pub use websocket::WebSocketServer;
