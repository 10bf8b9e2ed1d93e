use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::draft::Draft;
use crate::error::MetalError;

/* ===== Flags que el master inyecta al lanzar un backend ===== */

pub const ARG_INTERACTIVE_MODE: &str = "--interactive-mode";
pub const ARG_CMD_MODE: &str = "--cmd-mode";
pub const ARG_DEPLOY_ID: &str = "--deploy-id";
pub const ARG_DEPLOY_EPOCH: &str = "--deploy-epoch";
pub const ARG_REPORT_SERVICE_ADDRESS: &str = "--report-service-address";
pub const ARG_REST_API_PORT: &str = "--rest-api-port";

/// Flags de control sin valor.
pub const CONTROL_SWITCHES: [&str; 2] = [ARG_INTERACTIVE_MODE, ARG_CMD_MODE];

/// Flags de control seguidos de un valor.
pub const CONTROL_OPTIONS: [&str; 4] = [
    ARG_DEPLOY_ID,
    ARG_DEPLOY_EPOCH,
    ARG_REPORT_SERVICE_ADDRESS,
    ARG_REST_API_PORT,
];

/// Clave del canal de control de un backend.
pub fn control_address(deploy_id: &str, epoch: u64) -> String {
    format!("{}-{}", deploy_id, epoch)
}

/* ===== Reportes backend -> master ===== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendState {
    Created,
    UnDeployed,
    Up,
    Down,
    Failed,
}

/// Evento de ciclo de vida que un backend empuja por el canal de reportes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendEvent {
    #[serde(rename_all = "camelCase")]
    Up {
        up_time: DateTime<Utc>,
        /// URL base del endpoint REST del backend.
        address: String,
    },
    #[serde(rename_all = "camelCase")]
    Down { down_time: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    Failure {
        failure_time: DateTime<Utc>,
        msg: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendReport {
    pub deploy_id: String,
    pub epoch: u64,
    #[serde(flatten)]
    pub event: BackendEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecState {
    Finish,
    Failure,
}

/// Resultado de una ejecución, enviado fuera de banda al terminar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecReport {
    pub deploy_id: String,
    pub epoch: u64,
    pub exec_id: String,
    pub status: ExecState,
    pub submit_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    /// Sinks que llegaron a ejecutarse.
    #[serde(default)]
    pub sunk: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_metal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

/* ===== Respuestas del canal de control ===== */

/// Sobre común de las respuestas REST: `{"status":"OK","data":..}` o
/// `{"status":"FAIL","msg":..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiResponse<T> {
    Ok { data: T },
    Fail { msg: String },
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        ApiResponse::Ok { data }
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        ApiResponse::Fail { msg: msg.into() }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            ApiResponse::Ok { data } => Ok(data),
            ApiResponse::Fail { msg } => Err(msg),
        }
    }
}

impl<T> From<&MetalError> for ApiResponse<T> {
    fn from(e: &MetalError) -> Self {
        ApiResponse::fail(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecAccepted {
    pub exec_id: String,
    pub submit_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetalSchema {
    pub id: String,
    pub schema: Value,
}

/// Resultado de analizar un spec: esquema de cada metal no-sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub analysed_time: DateTime<Utc>,
    pub schemas: Vec<MetalSchema>,
}

/// Resumen de un draft válido.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftSummary {
    pub metals: usize,
    pub edges: usize,
    pub wait_for: usize,
    pub order: Vec<String>,
}

impl From<&Draft> for DraftSummary {
    fn from(d: &Draft) -> Self {
        DraftSummary {
            metals: d.metals().len(),
            edges: d.edges().len(),
            wait_for: d.wait_for().len(),
            order: d.order().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reporte_up_usa_forma_plana_con_status() {
        let t: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        let r = BackendReport {
            deploy_id: "d1".to_string(),
            epoch: 3,
            event: BackendEvent::Up {
                up_time: t,
                address: "http://h:18000".to_string(),
            },
        };

        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "UP");
        assert_eq!(v["deployId"], "d1");
        assert_eq!(v["epoch"], 3);
        assert_eq!(v["address"], "http://h:18000");

        let back: BackendReport = serde_json::from_value(v).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn reporte_failure_desde_json() {
        let r: BackendReport = serde_json::from_value(json!({
            "status": "FAILURE",
            "deployId": "d1",
            "epoch": 0,
            "failureTime": "2024-05-01T10:00:00Z",
            "msg": "no se pudo iniciar"
        }))
        .unwrap();
        assert!(matches!(r.event, BackendEvent::Failure { ref msg, .. } if msg == "no se pudo iniciar"));
    }

    #[test]
    fn sobre_ok_y_fail() {
        let ok = serde_json::to_value(ApiResponse::ok(json!({"a": 1}))).unwrap();
        assert_eq!(ok, json!({"status": "OK", "data": {"a": 1}}));

        let fail: ApiResponse<Value> =
            serde_json::from_value(json!({"status": "FAIL", "msg": "boom"})).unwrap();
        assert_eq!(fail.into_result(), Err("boom".to_string()));
    }

    #[test]
    fn direccion_de_control() {
        assert_eq!(control_address("abc", 7), "abc-7");
    }
}
