use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use common::{Analysis, ApiResponse, ExecAccepted, MetalError, Spec};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use sysinfo::{CpuExt, System, SystemExt};

use crate::service::{BackendService, StatusInfo};

#[derive(Clone)]
pub struct AppState {
    pub svc: Arc<BackendService>,
    /// System para leer CPU y memoria en el heart
    pub sys: Arc<Mutex<System>>,
}

impl AppState {
    pub fn new(svc: Arc<BackendService>) -> Self {
        Self {
            svc,
            sys: Arc::new(Mutex::new(System::new_all())),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/spec", post(analyse))
        .route("/api/v1/exec", post(exec))
        .route("/api/v1/schemas/:mid", get(schema))
        .route("/api/v1/heart", get(heart))
        .route("/api/v1/status", get(status))
        .with_state(state)
}

/* ---------------- errores -> HTTP ---------------- */

pub struct ApiError(MetalError);

impl From<MetalError> for ApiError {
    fn from(e: MetalError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (code, Json(ApiResponse::<Value>::from(&self.0))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/* ---------------- handlers HTTP ---------------- */

async fn analyse(State(state): State<AppState>, body: String) -> ApiResult<Analysis> {
    if body.trim().is_empty() {
        return Err(MetalError::SpecParse("spec is null".to_string()).into());
    }
    let spec = Spec::from_json(&body)?;
    Ok(Json(ApiResponse::ok(state.svc.analyse(spec).await?)))
}

async fn exec(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ApiResponse<ExecAccepted>>), ApiError> {
    let accepted = state.svc.exec()?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::ok(accepted))))
}

async fn schema(State(state): State<AppState>, Path(mid): Path<String>) -> ApiResult<Value> {
    Ok(Json(ApiResponse::ok(state.svc.schema(&mid)?)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heart {
    pub time: DateTime<Utc>,
    pub cpu_percent: f32,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
}

async fn heart(State(state): State<AppState>) -> ApiResult<Heart> {
    let mut sys = state
        .sys
        .lock()
        .map_err(|_| MetalError::Service("sysinfo lock poisoned".to_string()))?;
    sys.refresh_cpu();
    sys.refresh_memory();

    Ok(Json(ApiResponse::ok(Heart {
        time: Utc::now(),
        cpu_percent: sys.global_cpu_info().cpu_usage(),
        mem_used_bytes: sys.used_memory(),
        mem_total_bytes: sys.total_memory(),
    })))
}

async fn status(State(state): State<AppState>) -> ApiResult<StatusInfo> {
    Ok(Json(ApiResponse::ok(state.svc.status()?)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn app() -> Router {
        build_router(AppState::new(Arc::new(BackendService::new("d1", 2, None, None))))
    }

    #[tokio::test]
    async fn analisis_y_esquema_por_rest() {
        let app = app();
        let spec = json!({
            "metals": [
                {"type": "Source", "id": "s", "props": {"rows": [{"a": "x"}]}},
                {"type": "Sink", "id": "k"}
            ],
            "edges": [["s", "k"]]
        });

        let (status, body) = call(&app, "POST", "/api/v1/spec", Some(spec)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert_eq!(body["data"]["schemas"][0]["id"], "s");

        let (status, body) = call(&app, "GET", "/api/v1/schemas/s", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["fields"], json!([{"name": "a", "type": "string"}]));

        let (status, body) = call(&app, "GET", "/api/v1/schemas/nada", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "FAIL");
    }

    #[tokio::test]
    async fn errores_de_spec_son_400() {
        let app = app();

        let (status, _) = call(&app, "POST", "/api/v1/spec", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let tabla_rara = json!({
            "metals": [
                {"type": "Source", "id": "s"},
                {"type": "SqlMapper", "id": "m", "props": {"tableAlias": "t", "sql": "SELECT * FROM u"}},
                {"type": "Sink", "id": "k"}
            ],
            "edges": [["s", "m"], ["m", "k"]]
        });
        let (status, body) = call(&app, "POST", "/api/v1/spec", Some(tabla_rara)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["msg"].as_str().unwrap().contains("m"));
    }

    #[tokio::test]
    async fn exec_devuelve_202_y_status_lo_muestra() {
        let app = app();
        let spec = json!({
            "metals": [{"type": "Source", "id": "s"}, {"type": "Sink", "id": "k"}],
            "edges": [["s", "k"]]
        });
        call(&app, "POST", "/api/v1/spec", Some(spec)).await;

        let (status, body) = call(&app, "POST", "/api/v1/exec", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["data"]["submitTime"].is_string());

        let (_, body) = call(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(body["data"]["deployId"], "d1");
        assert_eq!(body["data"]["epoch"], 2);
    }

    #[tokio::test]
    async fn heart_trae_memoria() {
        let (status, body) = call(&app(), "GET", "/api/v1/heart", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["memTotalBytes"].as_u64().unwrap() > 0);
    }
}
