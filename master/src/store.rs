use async_trait::async_trait;
use chrono::Utc;
use common::{BackendEvent, ExecReport, MetalError, MetalResult, Spec};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use crate::project::{self, BackendStatus, Deploy, Project, Tracer, Transition};

/// Cantidad de reportes de ejecución que se guardan por proyecto.
pub const MAX_EXEC_REPORTS: usize = 64;

/// Persistencia de proyectos.
///
/// Todas las operaciones que tocan el backend status son condicionales
/// (comparan deployId/epoch o la ausencia de status dentro de la misma
/// operación); nunca se sobrescribe el status a ciegas.
#[async_trait]
pub trait ProjectStore: Send + Sync + 'static {
    async fn create(&self, project: Project) -> MetalResult<Project>;

    async fn get(&self, name: &str) -> MetalResult<Project>;

    async fn list(&self) -> MetalResult<Vec<Project>>;

    async fn find_by_deploy_id(&self, deploy_id: &str) -> MetalResult<Project>;

    async fn update_spec(&self, name: &str, spec: Spec) -> MetalResult<Project>;

    async fn update_platform(&self, name: &str, platform: Value) -> MetalResult<Project>;

    async fn update_backend_args(&self, name: &str, args: Vec<String>) -> MetalResult<Project>;

    async fn remove(&self, name: &str) -> MetalResult<Project>;

    /// Ocupa el slot si está libre y devuelve el deploy a lanzar.
    /// `Conflict` si ya hay un backend status.
    async fn acquire_deploy(&self, name: &str) -> MetalResult<Deploy>;

    /// epoch+1 y status vacío. Devuelve el deploy anterior y su status.
    async fn release_deploy(&self, name: &str) -> MetalResult<(Deploy, Option<BackendStatus>)>;

    async fn set_tracer(&self, deploy_id: &str, epoch: u64, tracer: Tracer) -> MetalResult<bool>;

    async fn apply_report(
        &self,
        deploy_id: &str,
        epoch: u64,
        event: &BackendEvent,
    ) -> MetalResult<Transition>;

    /// Guarda un reporte de ejecución si su epoch es el vigente.
    async fn record_exec(&self, report: ExecReport) -> MetalResult<bool>;
}

/// Implementación en memoria: un mapa nombre -> proyecto detrás de un Mutex.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: Mutex<HashMap<String, Project>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MetalResult<MutexGuard<'_, HashMap<String, Project>>> {
        self.projects
            .lock()
            .map_err(|_| MetalError::Service("project store lock poisoned".to_string()))
    }

    fn with_project<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Project) -> MetalResult<R>,
    ) -> MetalResult<R> {
        let mut projects = self.lock()?;
        let project = projects
            .get_mut(name)
            .ok_or_else(|| MetalError::NotFound(format!("project {}", name)))?;
        f(project)
    }

    fn with_deploy_id<R>(
        &self,
        deploy_id: &str,
        f: impl FnOnce(&mut Project) -> R,
    ) -> MetalResult<Option<R>> {
        let mut projects = self.lock()?;
        Ok(projects
            .values_mut()
            .find(|p| p.deploy.deploy_id == deploy_id)
            .map(f))
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn create(&self, project: Project) -> MetalResult<Project> {
        let mut projects = self.lock()?;
        if projects.contains_key(&project.name) {
            return Err(MetalError::Conflict(format!(
                "project {} already exists",
                project.name
            )));
        }
        projects.insert(project.name.clone(), project.clone());
        Ok(project)
    }

    async fn get(&self, name: &str) -> MetalResult<Project> {
        self.with_project(name, |p| Ok(p.clone()))
    }

    async fn list(&self) -> MetalResult<Vec<Project>> {
        let projects = self.lock()?;
        let mut out: Vec<Project> = projects.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn find_by_deploy_id(&self, deploy_id: &str) -> MetalResult<Project> {
        self.with_deploy_id(deploy_id, |p| p.clone())?
            .ok_or_else(|| MetalError::NotFound(format!("deployId {}", deploy_id)))
    }

    async fn update_spec(&self, name: &str, spec: Spec) -> MetalResult<Project> {
        self.with_project(name, |p| {
            p.spec = spec;
            Ok(p.clone())
        })
    }

    async fn update_platform(&self, name: &str, platform: Value) -> MetalResult<Project> {
        self.with_project(name, |p| {
            p.deploy.platform = platform;
            Ok(p.clone())
        })
    }

    async fn update_backend_args(&self, name: &str, args: Vec<String>) -> MetalResult<Project> {
        self.with_project(name, |p| {
            p.deploy.backend_args = args;
            Ok(p.clone())
        })
    }

    async fn remove(&self, name: &str) -> MetalResult<Project> {
        self.lock()?
            .remove(name)
            .ok_or_else(|| MetalError::NotFound(format!("project {}", name)))
    }

    async fn acquire_deploy(&self, name: &str) -> MetalResult<Deploy> {
        self.with_project(name, |p| {
            project::begin_deploy(&mut p.deploy, Utc::now())?;
            Ok(p.deploy.clone())
        })
    }

    async fn release_deploy(&self, name: &str) -> MetalResult<(Deploy, Option<BackendStatus>)> {
        self.with_project(name, |p| {
            let before = p.deploy.clone();
            let status = project::undeploy(&mut p.deploy);
            Ok((before, status))
        })
    }

    async fn set_tracer(&self, deploy_id: &str, epoch: u64, tracer: Tracer) -> MetalResult<bool> {
        Ok(self
            .with_deploy_id(deploy_id, |p| project::set_tracer(&mut p.deploy, epoch, tracer))?
            .unwrap_or(false))
    }

    async fn apply_report(
        &self,
        deploy_id: &str,
        epoch: u64,
        event: &BackendEvent,
    ) -> MetalResult<Transition> {
        Ok(self
            .with_deploy_id(deploy_id, |p| {
                project::apply_report(&mut p.deploy, epoch, event, Utc::now())
            })?
            .unwrap_or(Transition::Stale))
    }

    async fn record_exec(&self, report: ExecReport) -> MetalResult<bool> {
        let deploy_id = report.deploy_id.clone();
        Ok(self
            .with_deploy_id(&deploy_id, |p| {
                if p.deploy.epoch != report.epoch {
                    return false;
                }
                p.execs.push(report);
                if p.execs.len() > MAX_EXEC_REPORTS {
                    let extra = p.execs.len() - MAX_EXEC_REPORTS;
                    p.execs.drain(..extra);
                }
                true
            })?
            .unwrap_or(false))
    }
}
