use chrono::Utc;
use common::{BackendEvent, BackendReport, ExecReport};
use reqwest::Client;
use serde::Serialize;
use tracing::{info, warn};

/// Cliente del canal de reportes del master.
///
/// Es best-effort: un reporte que no llega se registra y se sigue.
#[derive(Clone)]
pub struct Reporter {
    client: Client,
    base_url: String,
    deploy_id: String,
    epoch: u64,
}

impl Reporter {
    pub fn new(client: Client, base_url: &str, deploy_id: &str, epoch: u64) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            deploy_id: deploy_id.to_string(),
            epoch,
        }
    }

    pub fn deploy_id(&self) -> &str {
        &self.deploy_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> bool {
        let url = format!("{}{}", self.base_url, path);
        match self.client.post(&url).json(body).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!("reporte a {} rechazado: {}", url, resp.status());
                false
            }
            Err(e) => {
                warn!("no se pudo reportar a {}: {}", url, e);
                false
            }
        }
    }

    async fn lifecycle(&self, event: BackendEvent) -> bool {
        let report = BackendReport {
            deploy_id: self.deploy_id.clone(),
            epoch: self.epoch,
            event,
        };
        self.post("/api/v1/reports/backend", &report).await
    }

    /// Llamar sólo con el endpoint REST ya escuchando en `address`.
    pub async fn up(&self, address: &str) -> bool {
        info!("reportando UP ({}) para {}-{}", address, self.deploy_id, self.epoch);
        self.lifecycle(BackendEvent::Up {
            up_time: Utc::now(),
            address: address.to_string(),
        })
        .await
    }

    /// Llamar antes de cerrar el endpoint REST.
    pub async fn down(&self) -> bool {
        info!("reportando DOWN para {}-{}", self.deploy_id, self.epoch);
        self.lifecycle(BackendEvent::Down {
            down_time: Utc::now(),
        })
        .await
    }

    pub async fn failure(&self, msg: &str) -> bool {
        warn!("reportando FAILURE para {}-{}: {}", self.deploy_id, self.epoch, msg);
        self.lifecycle(BackendEvent::Failure {
            failure_time: Utc::now(),
            msg: msg.to_string(),
        })
        .await
    }

    pub async fn exec(&self, report: &ExecReport) -> bool {
        self.post("/api/v1/reports/exec", report).await
    }
}
