// Workbench credential lifecycle - library root

pub mod auth;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod http_client;
