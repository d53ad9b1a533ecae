//! Page-side interfaces: the controller protocol, the typed RPC client,
//! and the WebSocket bridge transport.

pub mod bridge;
pub mod controller;
pub mod protocol;
pub mod rpc;

pub use controller::{PageController, PageError};
pub use protocol::*;
pub use rpc::{MessageTransport, RpcPageController};
