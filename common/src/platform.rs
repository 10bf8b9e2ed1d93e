use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde_json::Value;
use tracing::info;

use crate::engine::{
    expand_path, infer_schema, op_join_by_key, op_union, read_csv_to_records,
    read_jsonl_to_records, write_jsonl, Records,
};
use crate::error::{MetalError, MetalResult};
use crate::forge::Platform;
use crate::metal::{Metal, MetalProps};
use crate::sql;

/// Plataforma local: los datasets son colecciones de registros JSON en memoria.
///
/// Guarda lo que recibió cada sink para poder consultarlo después
/// (útil en el backend para reportar y en los tests).
#[derive(Debug, Default)]
pub struct LocalPlatform {
    /// Las rutas relativas de sources y sinks se resuelven contra esta carpeta.
    base_dir: Option<PathBuf>,
    sunk: Mutex<Vec<(String, Records)>>,
}

impl LocalPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    fn resolve(&self, path: &str) -> String {
        match &self.base_dir {
            Some(base) if Path::new(path).is_relative() => {
                base.join(path).to_string_lossy().to_string()
            }
            _ => path.to_string(),
        }
    }

    /// (id del sink, registros recibidos) en orden de ejecución.
    pub fn sunk(&self) -> Vec<(String, Records)> {
        self.sunk.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record_sink(&self, id: &str, data: &Records) -> MetalResult<()> {
        let mut sunk = self
            .sunk
            .lock()
            .map_err(|_| MetalError::Service("lock sunk".to_string()))?;
        sunk.push((id.to_string(), data.clone()));
        Ok(())
    }
}

fn read_all(pattern: &str, read: fn(&str) -> std::io::Result<Records>) -> std::io::Result<Records> {
    let mut out = Records::new();
    for path in expand_path(pattern)? {
        out.extend(read(&path)?);
    }
    Ok(out)
}

impl Platform for LocalPlatform {
    type Dataset = Records;

    fn translate(&self, metal: &Metal, inputs: usize) -> MetalResult<()> {
        match &metal.props {
            MetalProps::SqlMapper(p) => {
                if p.table_alias.trim().is_empty() {
                    return Err(MetalError::translate(metal.id.as_str(), "tableAlias is empty"));
                }
                sql::validate(&p.sql, &p.table_alias)
                    .map(|_| ())
                    .map_err(|msg| MetalError::translate(metal.id.as_str(), msg))
            }
            MetalProps::JoinFusion(p) => {
                if p.key.trim().is_empty() {
                    return Err(MetalError::translate(metal.id.as_str(), "join key is empty"));
                }
                if inputs < 2 {
                    return Err(MetalError::translate(
                        metal.id.as_str(),
                        format!("join needs at least 2 inputs, got {}", inputs),
                    ));
                }
                Ok(())
            }
            MetalProps::CsvSource(p) | MetalProps::JsonlSource(p) | MetalProps::JsonlSink(p) => {
                if p.path.trim().is_empty() {
                    return Err(MetalError::translate(metal.id.as_str(), "path is empty"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn source(&self, metal: &Metal) -> MetalResult<Records> {
        match &metal.props {
            MetalProps::MemorySource(p) => Ok(p.rows.clone()),
            MetalProps::CsvSource(p) => read_all(&self.resolve(&p.path), read_csv_to_records)
                .map_err(|e| MetalError::forge(metal.id.as_str(), e)),
            MetalProps::JsonlSource(p) => read_all(&self.resolve(&p.path), read_jsonl_to_records)
                .map_err(|e| MetalError::forge(metal.id.as_str(), e)),
            other => Err(MetalError::forge(
                metal.id.as_str(),
                format!("{:?} is not a source", other.kind()),
            )),
        }
    }

    fn map(&self, metal: &Metal, data: Records) -> MetalResult<Records> {
        match &metal.props {
            MetalProps::IdentityMapper => Ok(data),
            MetalProps::SqlMapper(p) => {
                let stmt = sql::validate(&p.sql, &p.table_alias)
                    .map_err(|msg| MetalError::translate(metal.id.as_str(), msg))?;
                Ok(stmt.execute(data))
            }
            other => Err(MetalError::forge(
                metal.id.as_str(),
                format!("{:?} is not a mapper", other.kind()),
            )),
        }
    }

    fn fusion(&self, metal: &Metal, datas: Vec<Records>) -> MetalResult<Records> {
        match &metal.props {
            MetalProps::UnionFusion => Ok(op_union(datas)),
            MetalProps::JoinFusion(p) => {
                let mut it = datas.into_iter();
                let first = it.next().unwrap_or_default();
                Ok(it.fold(first, |acc, right| op_join_by_key(acc, right, &p.key)))
            }
            other => Err(MetalError::forge(
                metal.id.as_str(),
                format!("{:?} is not a fusion", other.kind()),
            )),
        }
    }

    fn sink(&self, metal: &Metal, data: Records) -> MetalResult<()> {
        match &metal.props {
            MetalProps::ConsoleSink(p) => {
                info!("sink {} ({} filas)", metal.id, data.len());
                for row in data.iter().take(p.num_rows) {
                    info!("  {}", row);
                }
            }
            MetalProps::JsonlSink(p) => {
                let path = self.resolve(&p.path);
                write_jsonl(&data, &path).map_err(|e| MetalError::forge(metal.id.as_str(), e))?;
                info!("sink {}: {} filas escritas en {}", metal.id, data.len(), path);
            }
            other => {
                return Err(MetalError::forge(
                    metal.id.as_str(),
                    format!("{:?} is not a sink", other.kind()),
                ))
            }
        }
        self.record_sink(&metal.id, &data)
    }

    fn schema(&self, data: &Records) -> Value {
        infer_schema(data)
    }
}
