mod handlers;
mod reporter;
mod service;

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::{BackendState, ExecState, Spec};
use reqwest::Client;
use std::{fs, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::reporter::Reporter;
use crate::service::BackendService;

/// Proceso backend: lo lanza el master con sus flags de control.
#[derive(Debug, Parser)]
#[command(name = "backend")]
#[command(about = "Backend que analiza y ejecuta specs de metal")]
struct Args {
    /// Sirve el canal de control por REST hasta recibir Ctrl-C
    #[arg(long, conflicts_with = "cmd_mode")]
    interactive_mode: bool,

    /// Ejecuta --spec-file una vez y termina
    #[arg(long)]
    cmd_mode: bool,

    #[arg(long, value_name = "ID")]
    deploy_id: Option<String>,

    #[arg(long, value_name = "N", default_value_t = 0)]
    deploy_epoch: u64,

    #[arg(long, value_name = "URL")]
    report_service_address: Option<String>,

    #[arg(long, value_name = "PORT", default_value_t = 18000)]
    rest_api_port: u16,

    /// Carpeta contra la que se resuelven las rutas relativas
    #[arg(long, value_name = "DIR")]
    tmp_dir: Option<PathBuf>,

    /// Host con el que el master llega a este backend (default: hostname)
    #[arg(long, value_name = "HOST")]
    advertise_host: Option<String>,

    /// Spec para --cmd-mode
    #[arg(long, value_name = "PATH")]
    spec_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("backend=debug,reqwest=info")),
        )
        .init();

    let args = Args::parse();

    if args.cmd_mode {
        run_cmd(args).await
    } else {
        run_interactive(args).await
    }
}

/// Prepara la carpeta de trabajo; es lo único que la plataforma local necesita.
fn init_platform(tmp_dir: &Option<PathBuf>) -> Result<()> {
    if let Some(dir) = tmp_dir {
        fs::create_dir_all(dir).with_context(|| format!("no se pudo crear {}", dir.display()))?;
    }
    Ok(())
}

async fn run_interactive(args: Args) -> Result<()> {
    let (Some(deploy_id), Some(report_address)) =
        (args.deploy_id.clone(), args.report_service_address.clone())
    else {
        bail!("--interactive-mode necesita --deploy-id y --report-service-address");
    };
    let reporter = Reporter::new(Client::new(), &report_address, &deploy_id, args.deploy_epoch);

    // cualquier fallo antes de estar UP se reporta como FAILURE
    let listener = match start(&args).await {
        Ok(l) => l,
        Err(e) => {
            reporter.failure(&format!("{:#}", e)).await;
            return Err(e);
        }
    };

    let svc = Arc::new(BackendService::new(
        &deploy_id,
        args.deploy_epoch,
        args.tmp_dir.clone(),
        Some(reporter.clone()),
    ));
    let app = handlers::build_router(handlers::AppState::new(svc.clone()));

    let host = args.advertise_host.clone().unwrap_or_else(|| {
        hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    });
    let address = format!("http://{}:{}", host, listener.local_addr()?.port());

    // el endpoint ya escucha: recién ahora se anuncia UP
    reporter.up(&address).await;
    svc.set_state(BackendState::Up);
    info!(
        "backend {}-{} sirviendo en {}",
        reporter.deploy_id(),
        reporter.epoch(),
        address
    );

    let shutdown_svc = svc.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("no se pudo escuchar Ctrl-C: {}", e);
            }
            // DOWN antes de cerrar el endpoint
            reporter.down().await;
            shutdown_svc.set_state(BackendState::Down);
        })
        .await?;

    info!("backend detenido");
    Ok(())
}

async fn start(args: &Args) -> Result<TcpListener> {
    init_platform(&args.tmp_dir)?;
    let listener = TcpListener::bind(("0.0.0.0", args.rest_api_port))
        .await
        .with_context(|| format!("no se pudo escuchar en el puerto {}", args.rest_api_port))?;
    Ok(listener)
}

async fn run_cmd(args: Args) -> Result<()> {
    let Some(path) = args.spec_file.as_ref() else {
        bail!("--cmd-mode necesita --spec-file");
    };
    init_platform(&args.tmp_dir)?;

    let raw = fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer {}", path.display()))?;
    let spec = Spec::from_json(&raw)?;

    let deploy_id = args.deploy_id.clone().unwrap_or_else(|| "cmd".to_string());
    let reporter = args
        .report_service_address
        .as_ref()
        .map(|addr| Reporter::new(Client::new(), addr, &deploy_id, args.deploy_epoch));

    let svc = Arc::new(BackendService::new(
        &deploy_id,
        args.deploy_epoch,
        args.tmp_dir.clone(),
        reporter,
    ));
    let report = svc.run_once(spec).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status == ExecState::Failure {
        bail!(
            "exec {} falló en {}",
            report.exec_id,
            report.failed_metal.as_deref().unwrap_or("?")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsea_los_flags_que_inyecta_el_master() {
        let args = Args::try_parse_from([
            "backend",
            "--tmp-dir",
            "/tmp/x",
            "--interactive-mode",
            "--deploy-id",
            "d1",
            "--deploy-epoch",
            "3",
            "--report-service-address",
            "http://m:8080",
            "--rest-api-port",
            "18001",
        ])
        .unwrap();

        assert!(args.interactive_mode);
        assert_eq!(args.deploy_id.as_deref(), Some("d1"));
        assert_eq!(args.deploy_epoch, 3);
        assert_eq!(args.rest_api_port, 18001);
        assert_eq!(args.tmp_dir, Some(PathBuf::from("/tmp/x")));
    }

    #[test]
    fn modos_interactivo_y_comando_se_excluyen() {
        assert!(Args::try_parse_from(["backend", "--interactive-mode", "--cmd-mode"]).is_err());
    }
}
