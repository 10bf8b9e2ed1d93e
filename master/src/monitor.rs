use chrono::Utc;
use common::{BackendEvent, BackendReport, BackendState};
use std::time::Duration;
use tracing::{info, warn};

use crate::deployer;
use crate::state::AppState;

const CHECK_EVERY: Duration = Duration::from_secs(5);

/// Pasa a FAILED los backends que no reportaron UP dentro de `timeout`.
/// Usa el mismo camino que un reporte real, así que respeta el epoch.
pub async fn monitor_up_timeouts(state: AppState, timeout: Duration) {
    loop {
        tokio::time::sleep(CHECK_EVERY).await;
        let n = expire_launches(&state, timeout).await;
        if n > 0 {
            info!("{} backend(s) marcados FAILED por no reportar UP", n);
        }
    }
}

/// Una pasada del monitor. Devuelve cuántos backends se marcaron FAILED.
pub async fn expire_launches(state: &AppState, timeout: Duration) -> usize {
    let projects = match state.store.list().await {
        Ok(p) => p,
        Err(e) => {
            warn!("monitor: no se pudieron listar proyectos: {}", e);
            return 0;
        }
    };

    let now = Utc::now();
    let mut expired = 0;

    for p in projects {
        let Some(status) = &p.deploy.backend_status else {
            continue;
        };
        if status.state != BackendState::UnDeployed {
            continue;
        }
        let waited = (now - status.create_time).to_std().unwrap_or_default();
        if waited <= timeout {
            continue;
        }

        let report = BackendReport {
            deploy_id: p.deploy.deploy_id.clone(),
            epoch: p.deploy.epoch,
            event: BackendEvent::Failure {
                failure_time: now,
                msg: format!("backend did not report UP within {}s", timeout.as_secs()),
            },
        };
        match deployer::on_backend_report(state, &report).await {
            Ok(crate::project::Transition::Applied(_)) => expired += 1,
            Ok(_) => {}
            Err(e) => warn!("monitor: proyecto {}: {}", p.name, e),
        }
    }
    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::project::{Deploy, Project};
    use common::Spec;
    use serde_json::json;

    #[tokio::test]
    async fn launch_sin_up_vence_y_queda_failed() {
        let state = AppState::new(MasterConfig::default());
        state
            .store
            .create(Project {
                id: "id-p".to_string(),
                name: "p".to_string(),
                user: "u".to_string(),
                spec: Spec::empty(),
                deploy: Deploy::new("d1".to_string(), json!({"local.process": {}}), vec![]),
                create_time: Utc::now(),
                execs: vec![],
            })
            .await
            .unwrap();
        state.store.acquire_deploy("p").await.unwrap();

        // todavía dentro del plazo
        assert_eq!(expire_launches(&state, Duration::from_secs(3600)).await, 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(expire_launches(&state, Duration::from_millis(1)).await, 1);

        let p = state.store.get("p").await.unwrap();
        assert_eq!(p.deploy.state(), BackendState::Failed);
        // FAILED es absorbente: una segunda pasada no cuenta nada
        assert_eq!(expire_launches(&state, Duration::from_millis(1)).await, 0);
    }
}
