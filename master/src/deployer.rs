use chrono::Utc;
use common::{
    control_address, BackendEvent, BackendReport, BackendState, ExecReport, MetalError,
    MetalResult,
};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::args;
use crate::launcher::LaunchRequest;
use crate::project::{Deploy, Transition};
use crate::state::AppState;

/// Ocupa el slot del proyecto y lanza su backend atado a (deployId, epoch).
///
/// La plataforma se elige una sola vez, antes de ocupar el slot. Después de
/// ocuparlo cualquier error deja el status en FAILED con el motivo; el
/// usuario tiene que hacer undeploy antes de volver a intentar.
pub async fn deploy(state: &AppState, name: &str) -> MetalResult<Deploy> {
    let project = state.store.get(name).await?;
    let (platform, conf, launcher) = state.launchers.select(&project.deploy.platform)?;

    let deploy = state.store.acquire_deploy(name).await?;

    let req = LaunchRequest {
        deploy_id: deploy.deploy_id.clone(),
        epoch: deploy.epoch,
        args: args::assemble(
            &deploy.backend_args,
            &deploy.deploy_id,
            deploy.epoch,
            &state.config.report_address,
            state.config.backend_port,
        ),
        conf: conf.clone(),
    };
    let key = control_address(&req.deploy_id, req.epoch);
    debug!("args del backend {}: {:?}", key, req.args);

    let launched = match state.launch_permits.acquire().await {
        Ok(_permit) => launcher.launch(&req).await,
        Err(e) => Err(MetalError::Service(format!("launch permits: {}", e))),
    };

    let stored = match launched {
        Ok(tracer) => {
            let stored = state
                .store
                .set_tracer(&deploy.deploy_id, deploy.epoch, tracer.clone())
                .await;
            if !matches!(stored, Ok(true)) {
                // nadie más conoce este proceso: se mata acá
                if let Err(e) = launcher.kill(&conf, &tracer).await {
                    warn!("no se pudo matar el backend huérfano {}: {}", key, e);
                }
            }
            stored
        }
        Err(e) => Err(e),
    };

    match stored {
        Ok(true) => {
            info!(
                "proyecto {} desplegado en {} (deployId={}, epoch={})",
                name, platform, deploy.deploy_id, deploy.epoch
            );
            Ok(state.store.get(name).await?.deploy)
        }
        Ok(false) => {
            warn!("deploy {} de {} reemplazado durante el lanzamiento", key, name);
            Err(MetalError::Conflict(format!("deployment superseded: {}", key)))
        }
        Err(e) => {
            warn!("fallo lanzando backend de {}: {}", name, e);
            let failure = BackendEvent::Failure {
                failure_time: Utc::now(),
                msg: e.to_string(),
            };
            state
                .store
                .apply_report(&deploy.deploy_id, deploy.epoch, &failure)
                .await?;
            Err(e)
        }
    }
}

/// epoch+1, libera el slot y pide a la plataforma que mate el proceso.
pub async fn undeploy(state: &AppState, name: &str) -> MetalResult<Deploy> {
    let (before, status) = state.store.release_deploy(name).await?;
    close_channel(state, &before.deploy_id, before.epoch);

    if let Some(tracer) = status.and_then(|s| s.tracer) {
        match state.launchers.select(&before.platform) {
            Ok((_, conf, launcher)) => {
                // el slot ya está libre; un kill fallido sólo se registra
                if let Err(e) = launcher.kill(&conf, &tracer).await {
                    warn!("no se pudo matar el backend de {}: {}", name, e);
                }
            }
            Err(e) => warn!("no se pudo matar el backend de {}: {}", name, e),
        }
    }

    let project = state.store.get(name).await?;
    info!(
        "proyecto {} sin backend (deployId={}, epoch={})",
        name, project.deploy.deploy_id, project.deploy.epoch
    );
    Ok(project.deploy)
}

/// Aplica un reporte de ciclo de vida y mantiene el registro de canales.
/// Los reportes viejos se descartan sin error.
pub async fn on_backend_report(state: &AppState, report: &BackendReport) -> MetalResult<Transition> {
    let t = state
        .store
        .apply_report(&report.deploy_id, report.epoch, &report.event)
        .await?;

    match &t {
        Transition::Applied(BackendState::Up) => {
            if let BackendEvent::Up { address, .. } = &report.event {
                open_channel(state, &report.deploy_id, report.epoch, address);
            }
            info!("backend {}-{} UP", report.deploy_id, report.epoch);
        }
        Transition::Applied(s) => {
            close_channel(state, &report.deploy_id, report.epoch);
            info!("backend {}-{} {:?}", report.deploy_id, report.epoch, s);
        }
        Transition::Stale => {
            debug!(
                "reporte viejo descartado: {}-{} {:?}",
                report.deploy_id, report.epoch, report.event
            );
        }
        Transition::Rejected { from, to } => {
            warn!(
                "transición rechazada para {}-{}: {:?} -> {:?}",
                report.deploy_id, report.epoch, from, to
            );
        }
    }
    Ok(t)
}

pub async fn on_exec_report(state: &AppState, report: ExecReport) -> MetalResult<bool> {
    let key = control_address(&report.deploy_id, report.epoch);
    let exec_id = report.exec_id.clone();
    let kept = state.store.record_exec(report).await?;
    if kept {
        info!("exec {} de {} registrado", exec_id, key);
    } else {
        debug!("exec report viejo descartado: {} ({})", exec_id, key);
    }
    Ok(kept)
}

fn open_channel(state: &AppState, deploy_id: &str, epoch: u64, address: &str) {
    if let Ok(mut channels) = state.channels.lock() {
        channels.insert(control_address(deploy_id, epoch), address.to_string());
    }
}

fn close_channel(state: &AppState, deploy_id: &str, epoch: u64) {
    if let Ok(mut channels) = state.channels.lock() {
        channels.remove(&control_address(deploy_id, epoch));
    }
}

/// URL del canal de control del backend vigente de un proyecto.
pub async fn channel_of(state: &AppState, name: &str) -> MetalResult<String> {
    let project = state.store.get(name).await?;
    let key = control_address(&project.deploy.deploy_id, project.deploy.epoch);
    let channels = state
        .channels
        .lock()
        .map_err(|_| MetalError::Service("channels lock poisoned".to_string()))?;
    channels
        .get(&key)
        .cloned()
        .ok_or_else(|| MetalError::Conflict(format!("no backend is UP for project {} ({})", name, key)))
}

/// Reenvía un pedido al backend del proyecto y devuelve su código y cuerpo tal cual.
pub async fn forward(
    state: &AppState,
    name: &str,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> MetalResult<(u16, Value)> {
    let base = channel_of(state, name).await?;
    let url = format!("{}{}", base.trim_end_matches('/'), path);

    let mut req = state.http.request(method, &url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req
        .send()
        .await
        .map_err(|e| MetalError::Service(format!("{}: {}", url, e)))?;
    let status = resp.status().as_u16();
    let value: Value = resp
        .json()
        .await
        .map_err(|e| MetalError::Service(format!("{}: {}", url, e)))?;
    Ok((status, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::launcher::{BackendLauncher, Launchers};
    use crate::project::{Project, Tracer};
    use crate::project::BackendStatus;
    use crate::store::{MemoryProjectStore, ProjectStore};
    use async_trait::async_trait;
    use common::Spec;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    /// Launcher que anota lo que se le pide.
    #[derive(Default)]
    struct FakeLauncher {
        launched: Mutex<Vec<LaunchRequest>>,
        killed: Mutex<Vec<Tracer>>,
        fail: bool,
    }

    #[async_trait]
    impl BackendLauncher for FakeLauncher {
        async fn launch(&self, req: &LaunchRequest) -> MetalResult<Tracer> {
            if self.fail {
                return Err(MetalError::Service("sin cluster".to_string()));
            }
            self.launched.lock().unwrap().push(req.clone());
            Ok(Tracer::Driver {
                driver_id: format!("driver-{}", req.epoch),
            })
        }

        async fn kill(&self, _conf: &Value, tracer: &Tracer) -> MetalResult<()> {
            self.killed.lock().unwrap().push(tracer.clone());
            Ok(())
        }
    }

    async fn estado_con(fake: Arc<FakeLauncher>) -> AppState {
        estado_sobre(Arc::new(MemoryProjectStore::new()), fake).await
    }

    async fn estado_sobre(
        store: Arc<dyn ProjectStore>,
        launcher: Arc<dyn BackendLauncher>,
    ) -> AppState {
        let state = AppState::with_parts(
            MasterConfig::default(),
            store,
            Launchers::new().register("fake", launcher),
        );
        state
            .store
            .create(Project {
                id: "id-p".to_string(),
                name: "p".to_string(),
                user: "u".to_string(),
                spec: Spec::empty(),
                deploy: Deploy::new(
                    "d1".to_string(),
                    json!({"fake": {"x": 1}}),
                    vec!["--deploy-id".to_string(), "falso".to_string()],
                ),
                create_time: Utc::now(),
                execs: vec![],
            })
            .await
            .unwrap();
        state
    }

    fn up(epoch: u64) -> BackendReport {
        BackendReport {
            deploy_id: "d1".to_string(),
            epoch,
            event: BackendEvent::Up {
                up_time: Utc::now(),
                address: "http://backend:18000".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn deploy_lanza_con_args_saneados_y_guarda_tracer() {
        let fake = Arc::new(FakeLauncher::default());
        let state = estado_con(fake.clone()).await;

        let d = deploy(&state, "p").await.unwrap();
        assert_eq!(d.state(), BackendState::UnDeployed);
        assert_eq!(
            d.backend_status.unwrap().tracer,
            Some(Tracer::Driver {
                driver_id: "driver-0".to_string()
            })
        );

        let launched = fake.launched.lock().unwrap();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].conf, json!({"x": 1}));
        assert!(!launched[0].args.contains(&"falso".to_string()));
        assert!(launched[0].args.contains(&"d1".to_string()));
    }

    #[tokio::test]
    async fn segundo_deploy_es_conflicto_y_undeploy_lo_habilita() {
        let fake = Arc::new(FakeLauncher::default());
        let state = estado_con(fake.clone()).await;

        deploy(&state, "p").await.unwrap();
        let err = deploy(&state, "p").await.unwrap_err();
        assert_eq!(err.status_code(), 409);

        let d = undeploy(&state, "p").await.unwrap();
        assert_eq!(d.epoch, 1);
        assert!(d.backend_status.is_none());
        assert_eq!(fake.killed.lock().unwrap().len(), 1);

        let d = deploy(&state, "p").await.unwrap();
        assert_eq!(d.epoch, 1);
    }

    #[tokio::test]
    async fn fallo_de_lanzamiento_deja_failed() {
        let fake = Arc::new(FakeLauncher {
            fail: true,
            ..Default::default()
        });
        let state = estado_con(fake).await;

        assert!(deploy(&state, "p").await.is_err());
        let p = state.store.get("p").await.unwrap();
        assert_eq!(p.deploy.state(), BackendState::Failed);
        assert_eq!(
            p.deploy.backend_status.unwrap().failure_message.as_deref(),
            Some("service error: sin cluster")
        );
    }

    #[tokio::test]
    async fn plataforma_desconocida_no_ocupa_el_slot() {
        let state = estado_con(Arc::new(FakeLauncher::default())).await;
        state
            .store
            .update_platform("p", json!({"yarn": {}}))
            .await
            .unwrap();

        assert!(deploy(&state, "p").await.is_err());
        assert_eq!(state.store.get("p").await.unwrap().deploy.state(), BackendState::Created);
    }

    #[tokio::test]
    async fn up_abre_el_canal_y_los_reportes_viejos_no_hacen_nada() {
        let state = estado_con(Arc::new(FakeLauncher::default())).await;
        deploy(&state, "p").await.unwrap();

        let t = on_backend_report(&state, &up(0)).await.unwrap();
        assert_eq!(t, Transition::Applied(BackendState::Up));
        assert_eq!(channel_of(&state, "p").await.unwrap(), "http://backend:18000");

        undeploy(&state, "p").await.unwrap();
        deploy(&state, "p").await.unwrap();

        // el backend viejo reporta DOWN tarde
        let down = BackendReport {
            deploy_id: "d1".to_string(),
            epoch: 0,
            event: BackendEvent::Down { down_time: Utc::now() },
        };
        assert_eq!(on_backend_report(&state, &down).await.unwrap(), Transition::Stale);
        assert_eq!(
            state.store.get("p").await.unwrap().deploy.state(),
            BackendState::UnDeployed
        );
        assert!(channel_of(&state, "p").await.is_err());
    }

    /// Launcher que se queda adentro de `launch` hasta que lo suelten.
    #[derive(Default)]
    struct SlowLauncher {
        started: Notify,
        release: Notify,
        killed: Mutex<Vec<Tracer>>,
    }

    #[async_trait]
    impl BackendLauncher for SlowLauncher {
        async fn launch(&self, _req: &LaunchRequest) -> MetalResult<Tracer> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(Tracer::Pid { pid: 4242 })
        }

        async fn kill(&self, _conf: &Value, tracer: &Tracer) -> MetalResult<()> {
            self.killed.lock().unwrap().push(tracer.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn undeploy_durante_el_lanzamiento_mata_el_proceso_nuevo() {
        let slow = Arc::new(SlowLauncher::default());
        let state = estado_sobre(Arc::new(MemoryProjectStore::new()), slow.clone()).await;

        let en_curso = {
            let state = state.clone();
            tokio::spawn(async move { deploy(&state, "p").await })
        };
        slow.started.notified().await;

        let d = undeploy(&state, "p").await.unwrap();
        assert_eq!(d.epoch, 1);
        slow.release.notify_one();

        let err = en_curso.await.unwrap().unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert_eq!(*slow.killed.lock().unwrap(), vec![Tracer::Pid { pid: 4242 }]);

        // el slot del epoch nuevo sigue libre
        let p = state.store.get("p").await.unwrap();
        assert!(p.deploy.backend_status.is_none());
    }

    #[tokio::test]
    async fn sin_permisos_de_lanzamiento_el_status_queda_failed() {
        let fake = Arc::new(FakeLauncher::default());
        let state = estado_con(fake.clone()).await;
        state.launch_permits.close();

        let err = deploy(&state, "p").await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(fake.launched.lock().unwrap().is_empty());
        assert_eq!(state.store.get("p").await.unwrap().deploy.state(), BackendState::Failed);
    }

    /// Store que cambia la plataforma justo antes de ocupar el slot.
    struct PlataformaCambiante {
        inner: MemoryProjectStore,
    }

    #[async_trait]
    impl ProjectStore for PlataformaCambiante {
        async fn create(&self, project: Project) -> MetalResult<Project> {
            self.inner.create(project).await
        }
        async fn get(&self, name: &str) -> MetalResult<Project> {
            self.inner.get(name).await
        }
        async fn list(&self) -> MetalResult<Vec<Project>> {
            self.inner.list().await
        }
        async fn find_by_deploy_id(&self, deploy_id: &str) -> MetalResult<Project> {
            self.inner.find_by_deploy_id(deploy_id).await
        }
        async fn update_spec(&self, name: &str, spec: Spec) -> MetalResult<Project> {
            self.inner.update_spec(name, spec).await
        }
        async fn update_platform(&self, name: &str, platform: Value) -> MetalResult<Project> {
            self.inner.update_platform(name, platform).await
        }
        async fn update_backend_args(&self, name: &str, args: Vec<String>) -> MetalResult<Project> {
            self.inner.update_backend_args(name, args).await
        }
        async fn remove(&self, name: &str) -> MetalResult<Project> {
            self.inner.remove(name).await
        }
        async fn acquire_deploy(&self, name: &str) -> MetalResult<Deploy> {
            self.inner.update_platform(name, json!({"yarn": {}})).await?;
            self.inner.acquire_deploy(name).await
        }
        async fn release_deploy(&self, name: &str) -> MetalResult<(Deploy, Option<BackendStatus>)> {
            self.inner.release_deploy(name).await
        }
        async fn set_tracer(&self, deploy_id: &str, epoch: u64, tracer: Tracer) -> MetalResult<bool> {
            self.inner.set_tracer(deploy_id, epoch, tracer).await
        }
        async fn apply_report(
            &self,
            deploy_id: &str,
            epoch: u64,
            event: &BackendEvent,
        ) -> MetalResult<Transition> {
            self.inner.apply_report(deploy_id, epoch, event).await
        }
        async fn record_exec(&self, report: ExecReport) -> MetalResult<bool> {
            self.inner.record_exec(report).await
        }
    }

    #[tokio::test]
    async fn cambio_de_plataforma_tras_elegirla_no_deja_el_slot_colgado() {
        let fake = Arc::new(FakeLauncher::default());
        let store = Arc::new(PlataformaCambiante {
            inner: MemoryProjectStore::new(),
        });
        let state = estado_sobre(store, fake.clone()).await;

        // se lanza con la plataforma elegida antes de ocupar el slot
        let d = deploy(&state, "p").await.unwrap();
        assert_eq!(d.state(), BackendState::UnDeployed);
        assert!(d.backend_status.unwrap().tracer.is_some());
        assert_eq!(fake.launched.lock().unwrap()[0].conf, json!({"x": 1}));
    }
}
