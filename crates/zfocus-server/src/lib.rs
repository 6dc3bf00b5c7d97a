//! # zfocus Server
//!
//! 调焦器的 TCP 命令面：行协议（同端口兼容简易 HTTP）、
//! 周期轮询循环与一次性命令客户端。

pub mod client;
pub mod command;
pub mod server;

pub use command::{parse_request, Request, DEFAULT_PORT};
pub use server::{poll_loop, FocusServer};
