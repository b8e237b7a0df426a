//! RPC surface: JSON-RPC 2.0 over HTTP

pub mod protocol;
pub mod server;

pub use protocol::{RpcError, RpcRequest, RpcResponse};
pub use server::{bind, router, serve};
