//! Side-effecting adapters: processes, filesystem, network.

pub mod cache;
pub mod completion;
pub mod config;
pub mod generator;
pub mod process;
pub mod prompt;
pub mod sandbox;
