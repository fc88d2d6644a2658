//! Side-effecting helpers: processes, configuration and workspaces.

pub mod build_cache;
pub mod capture;
pub mod config;
pub mod process;
pub mod sandbox;
