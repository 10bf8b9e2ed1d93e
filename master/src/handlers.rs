use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use common::{
    draft, ApiResponse, BackendReport, DraftSummary, ExecReport, MetalError, Spec,
};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::deployer;
use crate::project::{Deploy, Project, Transition};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/specs/validation", post(validate_spec))
        .route("/api/v1/projects", post(create_project).get(list_projects))
        .route("/api/v1/projects/:name", get(get_project).delete(remove_project))
        .route("/api/v1/projects/:name/spec", put(update_spec))
        .route("/api/v1/projects/:name/platform", put(update_platform))
        .route("/api/v1/projects/:name/backend-args", put(update_backend_args))
        .route("/api/v1/projects/:name/deploy", post(deploy_project))
        .route("/api/v1/projects/:name/undeploy", post(undeploy_project))
        .route("/api/v1/projects/:name/analysis", post(analyse))
        .route("/api/v1/projects/:name/exec", post(exec))
        .route("/api/v1/projects/:name/schemas/:mid", get(schema))
        .route("/api/v1/projects/:name/execs", get(list_execs))
        .route("/api/v1/backends/:deploy_id/status", get(backend_status))
        .route("/api/v1/reports/backend", post(report_backend))
        .route("/api/v1/reports/exec", post(report_exec))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores -> HTTP ---------------- */

/// Envuelve un `MetalError` para responder con su código y el sobre FAIL.
#[derive(Debug)]
pub struct ApiError(pub MetalError);

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

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

/// Respuesta del backend reenviada tal cual, con su código.
type Forwarded = Result<(StatusCode, Json<Value>), ApiError>;

fn relay((status, body): (u16, Value)) -> Forwarded {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((code, Json(body)))
}

/// Parsea y valida un spec; un cuerpo vacío no es un spec.
fn parse_and_draft(raw: &str) -> Result<(Spec, DraftSummary), MetalError> {
    if raw.trim().is_empty() {
        return Err(MetalError::SpecParse("spec is null".to_string()));
    }
    let spec = Spec::from_json(raw)?;
    let d = draft(Some(&spec))?;
    Ok((spec, DraftSummary::from(&d)))
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Construye el draft y devuelve un resumen, sin guardar nada
async fn validate_spec(body: String) -> ApiResult<DraftSummary> {
    let (_, summary) = parse_and_draft(&body)?;
    ok(summary)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest {
    name: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    spec: Option<Spec>,
    #[serde(default)]
    platform: Option<Value>,
    #[serde(default)]
    backend_args: Vec<String>,
}

async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<Project> {
    let spec = req.spec.unwrap_or_else(Spec::empty);
    if !spec.is_empty() {
        draft(Some(&spec))?;
    }

    let project = Project {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        user: req.user.unwrap_or_else(|| "anonymous".to_string()),
        spec,
        deploy: Deploy::new(
            uuid::Uuid::new_v4().to_string(),
            req.platform
                .unwrap_or_else(|| state.config.default_platform.clone()),
            req.backend_args,
        ),
        create_time: Utc::now(),
        execs: Vec::new(),
    };

    let project = state.store.create(project).await?;
    info!("proyecto {} creado (deployId={})", project.name, project.deploy.deploy_id);
    ok(project)
}

async fn list_projects(State(state): State<AppState>) -> ApiResult<Vec<Project>> {
    ok(state.store.list().await?)
}

async fn get_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Project> {
    ok(state.store.get(&name).await?)
}

// Borra el proyecto; si tiene un backend lo da de baja antes
async fn remove_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Project> {
    let project = state.store.get(&name).await?;
    if project.deploy.backend_status.is_some() {
        deployer::undeploy(&state, &name).await?;
    }
    let removed = state.store.remove(&name).await?;
    info!("proyecto {} borrado", name);
    ok(removed)
}

// Valida el spec contra el draft antes de guardarlo
async fn update_spec(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: String,
) -> ApiResult<DraftSummary> {
    let (spec, summary) = parse_and_draft(&body)?;
    state.store.update_spec(&name, spec).await?;
    ok(summary)
}

async fn update_platform(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(platform): Json<Value>,
) -> ApiResult<Deploy> {
    if !platform.is_object() {
        return Err(MetalError::SpecParse(format!(
            "platform must be a JSON object, got {}",
            platform
        ))
        .into());
    }
    ok(state.store.update_platform(&name, platform).await?.deploy)
}

async fn update_backend_args(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(args): Json<Vec<String>>,
) -> ApiResult<Deploy> {
    ok(state.store.update_backend_args(&name, args).await?.deploy)
}

async fn deploy_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Deploy> {
    ok(deployer::deploy(&state, &name).await?)
}

async fn undeploy_project(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Deploy> {
    ok(deployer::undeploy(&state, &name).await?)
}

// Analiza el spec del cuerpo, o el guardado si el cuerpo viene vacío
async fn analyse(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: String,
) -> Forwarded {
    let spec = if body.trim().is_empty() {
        state.store.get(&name).await?.spec
    } else {
        parse_and_draft(&body)?.0
    };
    draft(Some(&spec))?;

    let spec_json = serde_json::to_value(&spec).map_err(MetalError::from)?;
    relay(deployer::forward(&state, &name, Method::POST, "/api/v1/spec", Some(spec_json)).await?)
}

async fn exec(State(state): State<AppState>, Path(name): Path<String>) -> Forwarded {
    relay(deployer::forward(&state, &name, Method::POST, "/api/v1/exec", None).await?)
}

async fn schema(
    State(state): State<AppState>,
    Path((name, mid)): Path<(String, String)>,
) -> Forwarded {
    let path = format!("/api/v1/schemas/{}", mid);
    relay(deployer::forward(&state, &name, Method::GET, &path, None).await?)
}

async fn list_execs(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Vec<ExecReport>> {
    ok(state.store.get(&name).await?.execs)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BackendStatusView {
    deploy_id: String,
    epoch: u64,
    state: common::BackendState,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend_status: Option<crate::project::BackendStatus>,
}

async fn backend_status(
    State(state): State<AppState>,
    Path(deploy_id): Path<String>,
) -> ApiResult<BackendStatusView> {
    let p = state.store.find_by_deploy_id(&deploy_id).await?;
    ok(BackendStatusView {
        deploy_id: p.deploy.deploy_id.clone(),
        epoch: p.deploy.epoch,
        state: p.deploy.state(),
        backend_status: p.deploy.backend_status,
    })
}

// Los reportes viejos se aceptan y se descartan: no son un error para el backend
async fn report_backend(
    State(state): State<AppState>,
    Json(report): Json<BackendReport>,
) -> ApiResult<Value> {
    let t = deployer::on_backend_report(&state, &report).await?;
    let applied = matches!(t, Transition::Applied(_));
    ok(json!({ "applied": applied }))
}

async fn report_exec(
    State(state): State<AppState>,
    Json(report): Json<ExecReport>,
) -> ApiResult<Value> {
    let applied = deployer::on_exec_report(&state, report).await?;
    ok(json!({ "applied": applied }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::launcher::{BackendLauncher, LaunchRequest, Launchers};
    use crate::project::Tracer;
    use crate::store::MemoryProjectStore;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use common::{BackendEvent, MetalResult};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    struct NoopLauncher;

    #[async_trait]
    impl BackendLauncher for NoopLauncher {
        async fn launch(&self, req: &LaunchRequest) -> MetalResult<Tracer> {
            Ok(Tracer::Driver {
                driver_id: format!("driver-{}", req.epoch),
            })
        }

        async fn kill(&self, _conf: &Value, _tracer: &Tracer) -> MetalResult<()> {
            Ok(())
        }
    }

    fn test_state() -> AppState {
        let config = MasterConfig {
            default_platform: json!({"noop": {}}),
            ..MasterConfig::default()
        };
        AppState::with_parts(
            config,
            Arc::new(MemoryProjectStore::new()),
            Launchers::new().register("noop", Arc::new(NoopLauncher)),
        )
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, v)
    }

    fn spec_valido() -> Value {
        json!({
            "metals": [
                {"type": "Source", "id": "s1", "props": {"rows": [{"a": 1}]}},
                {"type": "Sink", "id": "k1"}
            ],
            "edges": [["s1", "k1"]],
            "waitFor": []
        })
    }

    #[tokio::test]
    async fn validacion_de_spec_ok_y_errores_400() {
        let app = build_router(test_state());

        let (status, body) = call(&app, "POST", "/api/v1/specs/validation", Some(spec_valido())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "OK");
        assert_eq!(body["data"]["metals"], 2);
        assert_eq!(body["data"]["edges"], 1);
        assert_eq!(body["data"]["waitFor"], 0);

        let mut malo = spec_valido();
        malo["waitFor"] = json!([["s1", "s1"]]);
        let (status, body) = call(&app, "POST", "/api/v1/specs/validation", Some(malo)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "FAIL");
        assert!(body["msg"].as_str().unwrap().contains("s1"));

        let (status, _) = call(&app, "POST", "/api/v1/specs/validation", Some(Value::Null)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ciclo_de_vida_deploy_report_undeploy() {
        let app = build_router(test_state());

        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/projects",
            Some(json!({"name": "p", "spec": spec_valido()})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let deploy_id = body["data"]["deploy"]["deployId"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "POST", "/api/v1/projects/p/deploy", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["backendStatus"]["state"], "UN_DEPLOYED");

        let (status, _) = call(&app, "POST", "/api/v1/projects/p/deploy", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let up = BackendReport {
            deploy_id: deploy_id.clone(),
            epoch: 0,
            event: BackendEvent::Up {
                up_time: Utc::now(),
                address: "http://127.0.0.1:1".to_string(),
            },
        };
        let (_, body) = call(
            &app,
            "POST",
            "/api/v1/reports/backend",
            Some(serde_json::to_value(&up).unwrap()),
        )
        .await;
        assert_eq!(body["data"]["applied"], true);

        let status_uri = format!("/api/v1/backends/{}/status", deploy_id);
        let (_, body) = call(&app, "GET", &status_uri, None).await;
        assert_eq!(body["data"]["state"], "UP");

        let (_, body) = call(&app, "POST", "/api/v1/projects/p/undeploy", None).await;
        assert_eq!(body["data"]["epoch"], 1);

        // reporte del backend anterior: se acepta pero no cambia nada
        let (status, body) = call(
            &app,
            "POST",
            "/api/v1/reports/backend",
            Some(serde_json::to_value(&up).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["applied"], false);
        let (_, body) = call(&app, "GET", &status_uri, None).await;
        assert_eq!(body["data"]["state"], "CREATED");
    }

    #[tokio::test]
    async fn proyecto_inexistente_es_404_y_spec_invalido_no_se_guarda() {
        let app = build_router(test_state());

        let (status, _) = call(&app, "GET", "/api/v1/projects/nada", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        call(&app, "POST", "/api/v1/projects", Some(json!({"name": "p"}))).await;
        let dup = json!({
            "metals": [{"type": "Source", "id": "a"}, {"type": "Sink", "id": "a"}]
        });
        let (status, _) = call(&app, "PUT", "/api/v1/projects/p/spec", Some(dup)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, "GET", "/api/v1/projects/p", None).await;
        assert_eq!(body["data"]["spec"]["metals"], json!([]));
    }

    #[tokio::test]
    async fn analysis_sin_backend_up_es_conflicto() {
        let app = build_router(test_state());
        call(&app, "POST", "/api/v1/projects", Some(json!({"name": "p"}))).await;

        let (status, body) = call(&app, "POST", "/api/v1/projects/p/analysis", Some(spec_valido())).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "FAIL");
    }

    #[tokio::test]
    async fn exec_se_reenvia_al_canal_de_control() {
        // backend falso que acepta la ejecución
        let backend = Router::new().route(
            "/api/v1/exec",
            post(|| async {
                (
                    StatusCode::ACCEPTED,
                    Json(json!({"status": "OK", "data": {"execId": "e1"}})),
                )
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, backend).await.unwrap();
        });

        let state = test_state();
        let app = build_router(state.clone());
        let (_, body) = call(&app, "POST", "/api/v1/projects", Some(json!({"name": "p"}))).await;
        let deploy_id = body["data"]["deploy"]["deployId"].as_str().unwrap().to_string();
        call(&app, "POST", "/api/v1/projects/p/deploy", None).await;

        let up = BackendReport {
            deploy_id,
            epoch: 0,
            event: BackendEvent::Up {
                up_time: Utc::now(),
                address: format!("http://{}", addr),
            },
        };
        deployer::on_backend_report(&state, &up).await.unwrap();

        let (status, body) = call(&app, "POST", "/api/v1/projects/p/exec", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["execId"], "e1");
    }
}
