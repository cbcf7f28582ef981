//! Server and upstream configuration types.
//!
//! This module defines the listener settings and the address of the wrapped
//! tile server that the proxy forwards delegated requests to.
//!
//! Default values are sourced from `crate::constants`.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_PORT, DEFAULT_THREADS, DEFAULT_UPSTREAM_TIMEOUT_SECS};

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

// Default worker thread count
fn default_threads() -> usize {
    DEFAULT_THREADS
}

fn default_upstream_timeout() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker threads (default: 4)
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            threads: default_threads(),
        }
    }
}

impl ServerConfig {
    /// Listen address in `host:port` form
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// The wrapped tile server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// `host:port` of the tile server
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    /// SNI / Host override; defaults to the host part of `address`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl UpstreamConfig {
    /// Split `address` into host and port; a missing or bad port defaults by scheme
    pub fn host_port(&self) -> (String, u16) {
        let default_port = if self.tls { 443 } else { 80 };
        match self.address.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(default_port)),
            None => (self.address.clone(), default_port),
        }
    }

    /// Host used for SNI, falling back to the host part of `address`
    pub fn sni_host(&self) -> String {
        if let Some(sni) = &self.sni {
            return sni.clone();
        }
        self.address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
            .to_string()
    }
}
