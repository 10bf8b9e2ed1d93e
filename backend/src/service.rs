use chrono::{DateTime, Utc};
use common::{
    draft, Analysis, BackendState, Draft, ExecAccepted, ExecReport, ExecState, ForgeMaster,
    ForgeMode, LocalPlatform, MetalError, MetalResult, MetalSchema, Spec,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::reporter::Reporter;

/// Lo que el backend recuerda entre pedidos.
#[derive(Debug, Default)]
struct Session {
    draft: Option<Draft>,
    analysed_time: Option<DateTime<Utc>>,
    schemas: Vec<MetalSchema>,
    last_exec: Option<ExecReport>,
    running_exec: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub deploy_id: String,
    pub epoch: u64,
    pub state: BackendState,
    pub analysed_time: Option<DateTime<Utc>>,
    pub running_exec: Option<String>,
    pub last_exec: Option<ExecReport>,
}

/// Analiza y ejecuta specs sobre la plataforma local.
///
/// Análisis y ejecución se excluyen entre sí: mientras uno corre el otro
/// devuelve `Conflict`.
pub struct BackendService {
    deploy_id: String,
    epoch: u64,
    base_dir: Option<PathBuf>,
    busy: Arc<tokio::sync::Mutex<()>>,
    session: Mutex<Session>,
    state: Mutex<BackendState>,
    reporter: Option<Reporter>,
}

impl BackendService {
    pub fn new(
        deploy_id: &str,
        epoch: u64,
        base_dir: Option<PathBuf>,
        reporter: Option<Reporter>,
    ) -> Self {
        Self {
            deploy_id: deploy_id.to_string(),
            epoch,
            base_dir,
            busy: Arc::new(tokio::sync::Mutex::new(())),
            session: Mutex::new(Session::default()),
            state: Mutex::new(BackendState::UnDeployed),
            reporter,
        }
    }

    fn session(&self) -> MetalResult<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| MetalError::Service("session lock poisoned".to_string()))
    }

    fn platform(base_dir: Option<PathBuf>) -> LocalPlatform {
        match base_dir {
            Some(dir) => LocalPlatform::with_base_dir(dir),
            None => LocalPlatform::new(),
        }
    }

    pub fn set_state(&self, s: BackendState) {
        if let Ok(mut state) = self.state.lock() {
            *state = s;
        }
    }

    pub fn state(&self) -> BackendState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(BackendState::Failed)
    }

    /// Construye el draft, lo forja sin sinks y guarda el esquema de cada metal.
    pub async fn analyse(&self, spec: Spec) -> MetalResult<Analysis> {
        let _busy = self
            .busy
            .try_lock()
            .map_err(|_| MetalError::Conflict("already running".to_string()))?;

        let d = draft(Some(&spec))?;
        let base_dir = self.base_dir.clone();

        let (d, schemas) = tokio::task::spawn_blocking(move || {
            let platform = Self::platform(base_dir);
            let master = ForgeMaster::new(&platform);
            let forged = master.forge(&d, ForgeMode::Analyse)?;
            let schemas = master.schemas(&d, &forged);
            Ok::<_, MetalError>((d, schemas))
        })
        .await
        .map_err(|e| MetalError::Service(format!("analyse task: {}", e)))??;

        let schemas: Vec<MetalSchema> = schemas
            .into_iter()
            .map(|(id, schema)| MetalSchema { id, schema })
            .collect();
        let now = Utc::now();

        let mut session = self.session()?;
        session.draft = Some(d);
        session.analysed_time = Some(now);
        session.schemas = schemas.clone();
        info!("spec analizado: {} esquemas", schemas.len());

        Ok(Analysis {
            analysed_time: now,
            schemas,
        })
    }

    /// Lanza la ejecución del último draft analizado y vuelve enseguida.
    /// El resultado se guarda y se reporta al master al terminar.
    pub fn start_exec(self: &Arc<Self>) -> MetalResult<(ExecAccepted, JoinHandle<()>)> {
        let busy = self
            .busy
            .clone()
            .try_lock_owned()
            .map_err(|_| MetalError::Conflict("already running".to_string()))?;

        let exec_id = uuid::Uuid::new_v4().to_string();
        let submit_time = Utc::now();
        let d = {
            let mut session = self.session()?;
            let d = session.draft.clone().ok_or_else(|| {
                MetalError::Conflict("no spec has been analysed yet".to_string())
            })?;
            session.running_exec = Some(exec_id.clone());
            d
        };

        let svc = self.clone();
        let id = exec_id.clone();
        let handle = tokio::spawn(async move {
            let _busy = busy;
            let report = svc.run_exec(d, id, submit_time).await;

            if let Ok(mut session) = svc.session() {
                session.running_exec = None;
                session.last_exec = Some(report.clone());
            }
            if let Some(reporter) = &svc.reporter {
                reporter.exec(&report).await;
            }
        });

        info!("exec {} aceptado", exec_id);
        Ok((
            ExecAccepted {
                exec_id,
                submit_time,
            },
            handle,
        ))
    }

    pub fn exec(self: &Arc<Self>) -> MetalResult<ExecAccepted> {
        self.start_exec().map(|(accepted, _)| accepted)
    }

    async fn run_exec(&self, d: Draft, exec_id: String, submit_time: DateTime<Utc>) -> ExecReport {
        let base_dir = self.base_dir.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let platform = Self::platform(base_dir);
            ForgeMaster::new(&platform)
                .forge(&d, ForgeMode::Exec)
                .map(|forged| forged.sunk)
        })
        .await
        .map_err(|e| MetalError::Service(format!("exec task: {}", e)))
        .and_then(|r| r);

        let mut report = ExecReport {
            deploy_id: self.deploy_id.clone(),
            epoch: self.epoch,
            exec_id,
            status: ExecState::Finish,
            submit_time,
            finish_time: Utc::now(),
            sunk: Vec::new(),
            failed_metal: None,
            msg: None,
        };

        match outcome {
            Ok(sunk) => {
                info!("exec {} terminado, sinks: {:?}", report.exec_id, sunk);
                report.sunk = sunk;
            }
            Err(e) => {
                error!("exec {} falló: {}", report.exec_id, e);
                report.status = ExecState::Failure;
                if let MetalError::Forge { node_id, .. } | MetalError::Translate { node_id, .. } = &e {
                    report.failed_metal = Some(node_id.clone());
                }
                report.msg = Some(e.to_string());
            }
        }
        report
    }

    pub fn schema(&self, mid: &str) -> MetalResult<Value> {
        let session = self.session()?;
        session
            .schemas
            .iter()
            .find(|s| s.id == mid)
            .map(|s| s.schema.clone())
            .ok_or_else(|| MetalError::NotFound(format!("schema of metal {}", mid)))
    }

    pub fn status(&self) -> MetalResult<StatusInfo> {
        let session = self.session()?;
        Ok(StatusInfo {
            deploy_id: self.deploy_id.clone(),
            epoch: self.epoch,
            state: self.state(),
            analysed_time: session.analysed_time,
            running_exec: session.running_exec.clone(),
            last_exec: session.last_exec.clone(),
        })
    }

    /// Modo comando: analiza, ejecuta una vez y devuelve el reporte.
    pub async fn run_once(self: &Arc<Self>, spec: Spec) -> MetalResult<ExecReport> {
        self.analyse(spec).await?;
        let (_, handle) = self.start_exec()?;
        handle
            .await
            .map_err(|e| MetalError::Service(format!("exec task: {}", e)))?;
        self.status()?
            .last_exec
            .ok_or_else(|| MetalError::Service("exec finished without report".to_string()))
    }
}
