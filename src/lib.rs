pub mod activity;
pub mod allowlist;
pub mod api;
pub mod broker;
pub mod config;
pub mod process;
pub mod reaper;
pub mod session;
pub mod shutdown;
pub mod workspace;
