//! Side-effecting edges: generation backend, files, and result sinks.

pub mod backend;
pub mod config;
pub mod pipeline;
pub mod sink;
