// IPC module - Newline-delimited JSON over the daemon's Unix socket

pub mod client;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use protocol::{Command, Request, Response, ResponseData, StartReport};
pub use server::IpcServer;
