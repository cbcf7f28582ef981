// Tilegate - request instrumentation and cache policy in front of a tile server

pub mod classify;
pub mod config;
pub mod constants;
pub mod correlator;
pub mod endpoints;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod scanner;
pub mod server;
