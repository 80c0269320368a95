//! IPC over a Unix socket for daemon control

pub mod client;
pub mod protocol;
pub mod server;

pub use client::send_command;
pub use protocol::{Command, Response, SOCKET_PATH};
pub use server::IpcServer;
