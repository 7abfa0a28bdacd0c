//! `el-edge-node`: the `edgelink-node` binary's building blocks: CLI,
//! logging setup, host capability detection and the host command handlers.

pub mod backend;
pub mod cli;
pub mod handlers;
pub mod logging;
