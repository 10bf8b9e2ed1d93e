use async_trait::async_trait;
use common::{MetalError, MetalResult};
use reqwest::Client;
use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::MasterConfig;
use crate::project::Tracer;

pub const SPARK_STANDALONE: &str = "spark.standalone";
pub const LOCAL_PROCESS: &str = "local.process";

/// Lo necesario para lanzar un backend en una plataforma.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub deploy_id: String,
    pub epoch: u64,
    /// Args ya ensamblados (usuario saneado + control).
    pub args: Vec<String>,
    /// Configuración bajo la clave de la plataforma elegida.
    pub conf: Value,
}

/// Forma de enviar y matar un proceso backend en una plataforma concreta.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self, req: &LaunchRequest) -> MetalResult<Tracer>;

    async fn kill(&self, conf: &Value, tracer: &Tracer) -> MetalResult<()>;
}

/// Selector de launchers por nombre de plataforma.
#[derive(Clone, Default)]
pub struct Launchers {
    by_name: HashMap<String, Arc<dyn BackendLauncher>>,
}

impl Launchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(cfg: &MasterConfig) -> Self {
        Self::new()
            .register(SPARK_STANDALONE, Arc::new(SparkStandaloneLauncher::new(Client::new())))
            .register(LOCAL_PROCESS, Arc::new(LocalProcessLauncher::new(&cfg.backend_bin)))
    }

    pub fn register(mut self, name: &str, launcher: Arc<dyn BackendLauncher>) -> Self {
        self.by_name.insert(name.to_string(), launcher);
        self
    }

    /// El descriptor de plataforma es un objeto `{"<nombre>": {conf}}`; se usa
    /// la primera clave que tenga launcher registrado.
    pub fn select(&self, platform: &Value) -> MetalResult<(String, Value, Arc<dyn BackendLauncher>)> {
        let obj = platform.as_object().ok_or_else(|| {
            MetalError::Service(format!("platform must be a JSON object, got {}", platform))
        })?;

        for (name, conf) in obj {
            if let Some(l) = self.by_name.get(name) {
                return Ok((name.clone(), conf.clone(), l.clone()));
            }
        }

        Err(MetalError::Service(format!(
            "no legal platform configuration found (keys: {:?}, known: {:?})",
            obj.keys().collect::<Vec<_>>(),
            self.by_name.keys().collect::<Vec<_>>()
        )))
    }
}

/* ===== spark.standalone: envío REST al cluster manager ===== */

/// Envía el backend como driver a un cluster standalone por su API REST.
///
/// ```json
/// {"spark.standalone": {
///    "rest.api": {"host": "spark-master", "port": 6066,
///                 "requestURI": {"create": "/v1/submissions/create",
///                                "kill": "/v1/submissions/kill/{driverId}"}},
///    "conf": { "action": "CreateSubmissionRequest", "appResource": "...", ... }}}
/// ```
pub struct SparkStandaloneLauncher {
    client: Client,
}

impl SparkStandaloneLauncher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn rest_base(conf: &Value) -> MetalResult<String> {
    let rest = conf
        .get("rest.api")
        .ok_or_else(|| MetalError::Service("spark.standalone: missing rest.api".to_string()))?;
    let host = rest
        .get("host")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MetalError::Service("spark.standalone: missing rest.api.host".to_string()))?;
    let port = rest
        .get("port")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| MetalError::Service("spark.standalone: missing rest.api.port".to_string()))?;
    Ok(format!("http://{}:{}", host, port))
}

fn request_uri<'a>(conf: &'a Value, key: &str, default: &'a str) -> &'a str {
    conf.get("rest.api")
        .and_then(|r| r.get("requestURI"))
        .and_then(|u| u.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or(default)
}

#[async_trait]
impl BackendLauncher for SparkStandaloneLauncher {
    async fn launch(&self, req: &LaunchRequest) -> MetalResult<Tracer> {
        let base = rest_base(&req.conf)?;
        let uri = request_uri(&req.conf, "create", "/v1/submissions/create");

        let mut body = match req.conf.get("conf") {
            Some(Value::Object(m)) => m.clone(),
            _ => Map::new(),
        };
        body.insert(
            "appArgs".to_string(),
            Value::Array(req.args.iter().cloned().map(Value::String).collect()),
        );

        let url = format!("{}{}", base, uri);
        info!("enviando backend {}-{} a {}", req.deploy_id, req.epoch, url);
        let resp: Value = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| MetalError::Service(format!("submit to {}: {}", url, e)))?
            .json()
            .await
            .map_err(|e| MetalError::Service(format!("submit to {}: {}", url, e)))?;

        let success = resp.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        match resp.get("submissionId").and_then(|v| v.as_str()) {
            Some(driver_id) if success => Ok(Tracer::Driver {
                driver_id: driver_id.to_string(),
            }),
            _ => Err(MetalError::Service(resp.to_string())),
        }
    }

    async fn kill(&self, conf: &Value, tracer: &Tracer) -> MetalResult<()> {
        let Tracer::Driver { driver_id } = tracer else {
            return Err(MetalError::Service(format!(
                "spark.standalone can't kill {:?}",
                tracer
            )));
        };
        let base = rest_base(conf)?;
        let uri = request_uri(conf, "kill", "/v1/submissions/kill/{driverId}");
        let url = if uri.contains("{driverId}") {
            format!("{}{}", base, uri.replace("{driverId}", driver_id))
        } else {
            format!("{}{}/{}", base, uri.trim_end_matches('/'), driver_id)
        };

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| MetalError::Service(format!("kill {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(MetalError::Service(format!("kill {}: {}", url, resp.status())));
        }
        info!("driver {} terminado", driver_id);
        Ok(())
    }
}

/* ===== local.process: el backend como proceso hijo ===== */

/// Lanza el binario del backend en la misma máquina.
///
/// Conf opcional: `{"bin": "/ruta/al/backend", "env": {"RUST_LOG": "backend=info"}}`.
pub struct LocalProcessLauncher {
    default_bin: String,
    children: Mutex<HashMap<u32, Child>>,
}

impl LocalProcessLauncher {
    pub fn new(default_bin: &str) -> Self {
        Self {
            default_bin: default_bin.to_string(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn take_child(&self, pid: u32) -> MetalResult<Option<Child>> {
        let mut children = self
            .children
            .lock()
            .map_err(|_| MetalError::Service("children lock poisoned".to_string()))?;
        Ok(children.remove(&pid))
    }
}

#[async_trait]
impl BackendLauncher for LocalProcessLauncher {
    async fn launch(&self, req: &LaunchRequest) -> MetalResult<Tracer> {
        let bin = req
            .conf
            .get("bin")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.default_bin);

        let mut cmd = Command::new(bin);
        cmd.args(&req.args);
        if let Some(env) = req.conf.get("env").and_then(|v| v.as_object()) {
            for (k, v) in env {
                if let Some(v) = v.as_str() {
                    cmd.env(k, v);
                }
            }
        }

        let child = cmd
            .spawn()
            .map_err(|e| MetalError::Service(format!("spawn {}: {}", bin, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| MetalError::Service(format!("{} exited right away", bin)))?;

        self.children
            .lock()
            .map_err(|_| MetalError::Service("children lock poisoned".to_string()))?
            .insert(pid, child);

        info!("backend {}-{} lanzado con pid {}", req.deploy_id, req.epoch, pid);
        Ok(Tracer::Pid { pid })
    }

    async fn kill(&self, _conf: &Value, tracer: &Tracer) -> MetalResult<()> {
        let Tracer::Pid { pid } = tracer else {
            return Err(MetalError::Service(format!(
                "local.process can't kill {:?}",
                tracer
            )));
        };

        match self.take_child(*pid)? {
            Some(mut child) => {
                child
                    .kill()
                    .await
                    .map_err(|e| MetalError::Service(format!("kill pid {}: {}", pid, e)))?;
                info!("proceso {} terminado", pid);
            }
            None => warn!("pid {} no es un hijo conocido, nada que matar", pid),
        }
        Ok(())
    }
}
