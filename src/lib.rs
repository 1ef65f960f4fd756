pub mod agent;
pub mod cache;
pub mod config;
pub mod database;
pub mod devices;
pub mod elevation;
pub mod error;
pub mod geo;
pub mod handshake;
pub mod history;
pub mod logging;
pub mod models;
pub mod parser;
pub mod relaunch;
pub mod rpc;
pub mod server;
pub mod sniff;
