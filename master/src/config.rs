use serde_json::{json, Value};
use std::{env, time::Duration};
use tracing::warn;

/// Configuración del master, leída de variables de entorno.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: String,
    /// Dirección que se inyecta a los backends para que reporten.
    pub report_address: String,
    pub backend_port: u16,
    pub backend_bin: String,
    pub launch_concurrency: usize,
    pub default_platform: Value,
    pub up_timeout: Option<Duration>,
}

impl MasterConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: listen_addr(),
            report_address: report_address(),
            backend_port: backend_port(),
            backend_bin: backend_bin(),
            launch_concurrency: launch_concurrency(),
            default_platform: default_platform(),
            up_timeout: up_timeout(),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            report_address: "http://localhost:8080".to_string(),
            backend_port: 18000,
            backend_bin: "backend".to_string(),
            launch_concurrency: 2,
            default_platform: json!({"local.process": {}}),
            up_timeout: None,
        }
    }
}

fn listen_addr() -> String {
    env::var("METAL_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
}

/// - En Docker: METAL_REPORT_ADDRESS=http://master:8080
/// - Local: default http://localhost:8080
fn report_address() -> String {
    env::var("METAL_REPORT_ADDRESS").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

fn backend_port() -> u16 {
    env::var("METAL_BACKEND_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(18000)
}

fn backend_bin() -> String {
    env::var("METAL_BACKEND_BIN").unwrap_or_else(|_| "backend".to_string())
}

fn launch_concurrency() -> usize {
    env::var("METAL_LAUNCH_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(2)
}

fn default_platform() -> Value {
    match env::var("METAL_DEFAULT_PLATFORM") {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("METAL_DEFAULT_PLATFORM inválido ({}), uso local.process", e);
            json!({"local.process": {}})
        }),
        Err(_) => json!({"local.process": {}}),
    }
}

fn up_timeout() -> Option<Duration> {
    env::var("METAL_UP_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .map(Duration::from_secs)
}
