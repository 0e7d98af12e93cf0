pub mod admin;
pub mod assignments;
pub mod builds;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod git;
pub mod idle;
pub mod manager;
pub mod progress;
pub mod proxy;
pub mod reconciler;
pub mod request_meta;
pub mod router;
pub mod security;
pub mod state;
pub mod template;
pub mod tokens;
pub mod ws_bridge;
