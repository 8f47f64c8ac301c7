pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod probe;
pub mod recorder;
pub mod reporter;
pub mod session;
pub mod store;
pub mod testutil;
