use chrono::{DateTime, Utc};
use common::{BackendEvent, BackendState, ExecReport, MetalError, MetalResult, Spec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/* ===== Modelo persistido ===== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub user: String,
    pub spec: Spec,
    pub deploy: Deploy,
    pub create_time: DateTime<Utc>,
    /// Reportes de ejecución recibidos, del más viejo al más nuevo.
    #[serde(default)]
    pub execs: Vec<ExecReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deploy {
    /// Fijo desde la creación del proyecto.
    pub deploy_id: String,
    pub epoch: u64,
    /// Un objeto con una sola clave: el nombre de la plataforma.
    pub platform: Value,
    #[serde(default)]
    pub backend_args: Vec<String>,
    /// `None` = no hay backend ocupando el slot; es la condición para desplegar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_status: Option<BackendStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub state: BackendState,
    pub create_time: DateTime<Utc>,
    pub up_time: Option<DateTime<Utc>>,
    pub down_time: Option<DateTime<Utc>>,
    /// Momento de la última transición aplicada.
    pub report_time: DateTime<Utc>,
    pub failure_message: Option<String>,
    pub tracer: Option<Tracer>,
    /// URL REST del backend, conocida desde el reporte UP.
    pub address: Option<String>,
}

/// Identificadores propios de cada plataforma para consultar o matar el proceso.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tracer {
    #[serde(rename_all = "camelCase")]
    Driver { driver_id: String },
    Pid { pid: u32 },
}

impl Deploy {
    pub fn new(deploy_id: String, platform: Value, backend_args: Vec<String>) -> Self {
        Self {
            deploy_id,
            epoch: 0,
            platform,
            backend_args,
            backend_status: None,
        }
    }

    /// Estado observable: sin status el slot está libre (CREATED).
    pub fn state(&self) -> BackendState {
        self.backend_status
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(BackendState::Created)
    }

    pub fn address(&self) -> Option<&str> {
        self.backend_status.as_ref().and_then(|s| s.address.as_deref())
    }
}

/* ===== Transiciones ===== */

/// Resultado de aplicar un reporte sobre el deploy guardado.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied(BackendState),
    /// El reporte pertenece a otra generación (epoch distinto) o no hay backend.
    Stale,
    /// Epoch correcto pero la transición no es legal desde el estado actual.
    Rejected { from: BackendState, to: BackendState },
}

/// Ocupa el slot de despliegue. Sólo es legal si no hay backend status.
pub fn begin_deploy(deploy: &mut Deploy, now: DateTime<Utc>) -> MetalResult<()> {
    if let Some(status) = &deploy.backend_status {
        return Err(MetalError::Conflict(format!(
            "backend already deployed (deployId={}, epoch={}, state={:?}); undeploy it first",
            deploy.deploy_id, deploy.epoch, status.state
        )));
    }
    deploy.backend_status = Some(BackendStatus {
        state: BackendState::UnDeployed,
        create_time: now,
        up_time: None,
        down_time: None,
        report_time: now,
        failure_message: None,
        tracer: None,
        address: None,
    });
    Ok(())
}

/// Avanza el epoch y libera el slot. Devuelve el status que tenía, para
/// poder matar el proceso con su tracer.
pub fn undeploy(deploy: &mut Deploy) -> Option<BackendStatus> {
    deploy.epoch += 1;
    deploy.backend_status.take()
}

fn target_state(event: &BackendEvent) -> BackendState {
    match event {
        BackendEvent::Up { .. } => BackendState::Up,
        BackendEvent::Down { .. } => BackendState::Down,
        BackendEvent::Failure { .. } => BackendState::Failed,
    }
}

/// Aplica un reporte de ciclo de vida. Un epoch distinto del guardado no
/// toca nada.
pub fn apply_report(
    deploy: &mut Deploy,
    epoch: u64,
    event: &BackendEvent,
    now: DateTime<Utc>,
) -> Transition {
    if epoch != deploy.epoch {
        return Transition::Stale;
    }
    let Some(status) = deploy.backend_status.as_mut() else {
        return Transition::Stale;
    };

    let from = status.state;
    let to = target_state(event);
    let legal = matches!(
        (from, to),
        (BackendState::UnDeployed, BackendState::Up)
            | (BackendState::UnDeployed, BackendState::Down)
            | (BackendState::Up, BackendState::Down)
            | (BackendState::UnDeployed, BackendState::Failed)
            | (BackendState::Up, BackendState::Failed)
    );
    if !legal {
        return Transition::Rejected { from, to };
    }

    match event {
        BackendEvent::Up { up_time, address } => {
            status.up_time = Some(*up_time);
            status.address = Some(address.clone());
        }
        BackendEvent::Down { down_time } => {
            status.down_time = Some(*down_time);
        }
        BackendEvent::Failure { msg, .. } => {
            status.failure_message = Some(msg.clone());
        }
    }
    status.state = to;
    status.report_time = now;
    Transition::Applied(to)
}

/// Guarda el tracer sólo si el deploy sigue siendo el mismo.
pub fn set_tracer(deploy: &mut Deploy, epoch: u64, tracer: Tracer) -> bool {
    if deploy.epoch != epoch {
        return false;
    }
    match deploy.backend_status.as_mut() {
        Some(status) => {
            status.tracer = Some(tracer);
            true
        }
        None => false,
    }
}
