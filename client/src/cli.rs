use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use common::{ApiResponse, DraftSummary, ExecReport, ExecState};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::{env, fs};

/// Igual que en el backend:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Debug, Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crea un proyecto
    Create {
        #[arg(value_name = "NOMBRE")]
        name: String,
        /// Archivo JSON con el spec inicial
        #[arg(long, value_name = "SPEC_JSON")]
        spec: Option<String>,
        /// Descriptor de plataforma, ej: '{"local.process":{}}'
        #[arg(long, value_name = "JSON")]
        platform: Option<String>,
        /// Args extra del backend (se puede repetir)
        #[arg(long = "backend-arg", value_name = "ARG", allow_hyphen_values = true)]
        backend_args: Vec<String>,
    },
    /// Lista los proyectos
    List,
    /// Muestra un proyecto
    Show {
        #[arg(value_name = "NOMBRE")]
        name: String,
    },
    /// Valida un spec sin guardarlo
    Validate {
        #[arg(value_name = "SPEC_JSON")]
        file: String,
    },
    /// Reemplaza el spec de un proyecto
    Spec {
        #[arg(value_name = "NOMBRE")]
        name: String,
        #[arg(value_name = "SPEC_JSON")]
        file: String,
    },
    /// Reemplaza el descriptor de plataforma
    Platform {
        #[arg(value_name = "NOMBRE")]
        name: String,
        #[arg(value_name = "JSON")]
        platform: String,
    },
    /// Reemplaza los args del backend
    BackendArgs {
        #[arg(value_name = "NOMBRE")]
        name: String,
        #[arg(value_name = "ARGS", allow_hyphen_values = true, trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// Borra un proyecto (da de baja su backend si tiene)
    Remove {
        #[arg(value_name = "NOMBRE")]
        name: String,
    },
    /// Lanza el backend del proyecto
    Deploy {
        #[arg(value_name = "NOMBRE")]
        name: String,
    },
    /// Da de baja el backend del proyecto
    Undeploy {
        #[arg(value_name = "NOMBRE")]
        name: String,
    },
    /// Estado del backend del proyecto
    Status {
        #[arg(value_name = "NOMBRE")]
        name: String,
    },
    /// Analiza un spec en el backend (sin archivo usa el spec guardado)
    Analyse {
        #[arg(value_name = "NOMBRE")]
        name: String,
        #[arg(long, value_name = "SPEC_JSON")]
        spec: Option<String>,
    },
    /// Ejecuta el último spec analizado
    Exec {
        #[arg(value_name = "NOMBRE")]
        name: String,
    },
    /// Esquema de salida de un metal
    Schema {
        #[arg(value_name = "NOMBRE")]
        name: String,
        #[arg(value_name = "METAL_ID")]
        mid: String,
    },
    /// Reportes de ejecución recibidos
    Execs {
        #[arg(value_name = "NOMBRE")]
        name: String,
    },
}

fn read_json_file(path: &str) -> Result<Value> {
    let raw = fs::read_to_string(path).with_context(|| format!("no se pudo leer {}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("{} no es JSON válido", path))
}

fn parse_json_arg(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("'{}' no es JSON válido", raw))
}

/// Envía el pedido y devuelve `data`; un sobre FAIL se vuelve error con su `msg`.
async fn send(req: RequestBuilder) -> Result<Value> {
    let resp = req.send().await?;
    let status = resp.status();
    let body: ApiResponse<Value> = resp
        .json()
        .await
        .with_context(|| format!("respuesta inválida del master ({})", status))?;

    body.into_result()
        .map_err(|msg| anyhow!("error {}: {}", status, msg))
}

fn print(v: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();
    let project_url = |name: &str, rest: &str| format!("{}/api/v1/projects/{}{}", base_url, name, rest);

    match cli.command {
        Commands::Create {
            name,
            spec,
            platform,
            backend_args,
        } => {
            let mut body = json!({ "name": name, "backendArgs": backend_args });
            if let Some(path) = spec {
                body["spec"] = read_json_file(&path)?;
            }
            if let Some(raw) = platform {
                body["platform"] = parse_json_arg(&raw)?;
            }
            let url = format!("{}/api/v1/projects", base_url);
            let project = send(client.post(&url).json(&body)).await?;

            println!("Proyecto creado:");
            println!("  nombre: {}", project["name"].as_str().unwrap_or("?"));
            println!("  deployId: {}", project["deploy"]["deployId"].as_str().unwrap_or("?"));
        }

        Commands::List => {
            let url = format!("{}/api/v1/projects", base_url);
            let projects = send(client.get(&url)).await?;
            match projects.as_array() {
                Some(list) if !list.is_empty() => {
                    for p in list {
                        let state = p["deploy"]["backendStatus"]["state"]
                            .as_str()
                            .unwrap_or("CREATED");
                        println!(
                            "{}  (deployId={}, epoch={}, estado={})",
                            p["name"].as_str().unwrap_or("?"),
                            p["deploy"]["deployId"].as_str().unwrap_or("?"),
                            p["deploy"]["epoch"],
                            state
                        );
                    }
                }
                _ => println!("No hay proyectos."),
            }
        }

        Commands::Show { name } => {
            print(&send(client.get(project_url(&name, ""))).await?)?;
        }

        Commands::Validate { file } => {
            let url = format!("{}/api/v1/specs/validation", base_url);
            let summary: DraftSummary =
                serde_json::from_value(send(client.post(&url).json(&read_json_file(&file)?)).await?)?;
            println!("Spec válido:");
            println!(
                "  metals={}, edges={}, waitFor={}",
                summary.metals, summary.edges, summary.wait_for
            );
            println!("  orden: {}", summary.order.join(" -> "));
        }

        Commands::Spec { name, file } => {
            let spec = read_json_file(&file)?;
            let summary = send(client.put(project_url(&name, "/spec")).json(&spec)).await?;
            println!("Spec guardado ({} metals).", summary["metals"]);
        }

        Commands::Platform { name, platform } => {
            let platform = parse_json_arg(&platform)?;
            print(&send(client.put(project_url(&name, "/platform")).json(&platform)).await?)?;
        }

        Commands::BackendArgs { name, args } => {
            print(&send(client.put(project_url(&name, "/backend-args")).json(&args)).await?)?;
        }

        Commands::Remove { name } => {
            send(client.delete(project_url(&name, ""))).await?;
            println!("Proyecto {} borrado.", name);
        }

        Commands::Deploy { name } => {
            let deploy = send(client.post(project_url(&name, "/deploy"))).await?;
            println!("Backend lanzado:");
            println!("  deployId: {}", deploy["deployId"].as_str().unwrap_or("?"));
            println!("  epoch: {}", deploy["epoch"]);
            println!("  estado: {}", deploy["backendStatus"]["state"].as_str().unwrap_or("?"));
        }

        Commands::Undeploy { name } => {
            let deploy = send(client.post(project_url(&name, "/undeploy"))).await?;
            println!("Backend dado de baja, epoch ahora {}", deploy["epoch"]);
        }

        Commands::Status { name } => {
            let project = send(client.get(project_url(&name, ""))).await?;
            let deploy_id = project["deploy"]["deployId"].as_str().unwrap_or_default();
            let url = format!("{}/api/v1/backends/{}/status", base_url, deploy_id);
            let status = send(client.get(&url)).await?;

            println!("Backend de {}:", name);
            println!("  deployId: {}", deploy_id);
            println!("  epoch: {}", status["epoch"]);
            println!("  estado: {}", status["state"].as_str().unwrap_or("?"));
            let bs = &status["backendStatus"];
            for (label, key) in [
                ("creado", "createTime"),
                ("up", "upTime"),
                ("down", "downTime"),
                ("último reporte", "reportTime"),
                ("falla", "failureMessage"),
            ] {
                if let Some(v) = bs[key].as_str() {
                    println!("  {}: {}", label, v);
                }
            }
        }

        Commands::Analyse { name, spec } => {
            let req = client.post(project_url(&name, "/analysis"));
            let req = match spec {
                Some(path) => req.json(&read_json_file(&path)?),
                None => req,
            };
            let analysis = send(req).await?;
            if let Some(schemas) = analysis["schemas"].as_array() {
                for s in schemas {
                    println!("{}: {}", s["id"].as_str().unwrap_or("?"), s["schema"]);
                }
            }
        }

        Commands::Exec { name } => {
            let accepted = send(client.post(project_url(&name, "/exec"))).await?;
            println!(
                "Exec {} aceptado ({}). El resultado llega por `execs`.",
                accepted["execId"].as_str().unwrap_or("?"),
                accepted["submitTime"].as_str().unwrap_or("?")
            );
        }

        Commands::Schema { name, mid } => {
            let path = format!("/schemas/{}", mid);
            print(&send(client.get(project_url(&name, &path))).await?)?;
        }

        Commands::Execs { name } => {
            let execs: Vec<ExecReport> =
                serde_json::from_value(send(client.get(project_url(&name, "/execs"))).await?)?;
            if execs.is_empty() {
                println!("Sin ejecuciones reportadas.");
            }
            for e in execs {
                let took = (e.finish_time - e.submit_time).num_milliseconds();
                match e.status {
                    ExecState::Finish => {
                        println!("{}  FINISH  {} ms  sinks={:?}", e.exec_id, took, e.sunk)
                    }
                    ExecState::Failure => println!(
                        "{}  FAILURE  {} ms  metal={}  {}",
                        e.exec_id,
                        took,
                        e.failed_metal.as_deref().unwrap_or("?"),
                        e.msg.as_deref().unwrap_or("")
                    ),
                }
            }
        }
    }

    Ok(())
}
