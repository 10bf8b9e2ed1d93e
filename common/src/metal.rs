use serde::{Deserialize, Serialize};
use serde_json::Value;

/* --------- Modelo de nodos (metals) --------- */

/// Las cuatro clases de nodo que entiende el grafo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetalKind {
    Source,
    Mapper,
    Fusion,
    Sink,
}

/// Un paso del pipeline tal como lo escribió el usuario.
///
/// En el JSON viaja como `{"type": "...", "id": "...", "name": "...", "props": {...}}`.
/// El campo `type` elige la implementación concreta mediante `METAL_TYPES`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MetalJson", into = "MetalJson")]
pub struct Metal {
    /// Discriminador tal cual vino en el spec (se devuelve igual al serializar).
    pub ty: String,
    pub id: String,
    pub name: String,
    pub props: MetalProps,
}

impl Metal {
    pub fn kind(&self) -> MetalKind {
        self.props.kind()
    }

    pub fn is_sink(&self) -> bool {
        self.kind() == MetalKind::Sink
    }

    /// Construye un metal a partir del discriminador y sus props en JSON.
    pub fn from_parts(ty: &str, id: &str, name: &str, props: Value) -> Result<Self, String> {
        let parser = lookup_type(ty).ok_or_else(|| format!("unknown metal type \"{}\"", ty))?;
        let props = parser(props).map_err(|e| format!("bad props for metal {}: {}", id, e))?;
        Ok(Self {
            ty: ty.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            props,
        })
    }
}

/// Configuración específica de cada implementación concreta.
#[derive(Debug, Clone, PartialEq)]
pub enum MetalProps {
    MemorySource(MemorySourceProps),
    CsvSource(PathProps),
    JsonlSource(PathProps),
    IdentityMapper,
    SqlMapper(SqlMapperProps),
    UnionFusion,
    JoinFusion(JoinFusionProps),
    ConsoleSink(ConsoleSinkProps),
    JsonlSink(PathProps),
}

impl MetalProps {
    pub fn kind(&self) -> MetalKind {
        match self {
            MetalProps::MemorySource(_) | MetalProps::CsvSource(_) | MetalProps::JsonlSource(_) => {
                MetalKind::Source
            }
            MetalProps::IdentityMapper | MetalProps::SqlMapper(_) => MetalKind::Mapper,
            MetalProps::UnionFusion | MetalProps::JoinFusion(_) => MetalKind::Fusion,
            MetalProps::ConsoleSink(_) | MetalProps::JsonlSink(_) => MetalKind::Sink,
        }
    }

    fn to_json(&self) -> Value {
        let v = match self {
            MetalProps::MemorySource(p) => serde_json::to_value(p),
            MetalProps::CsvSource(p) | MetalProps::JsonlSource(p) | MetalProps::JsonlSink(p) => {
                serde_json::to_value(p)
            }
            MetalProps::SqlMapper(p) => serde_json::to_value(p),
            MetalProps::JoinFusion(p) => serde_json::to_value(p),
            MetalProps::ConsoleSink(p) => serde_json::to_value(p),
            MetalProps::IdentityMapper | MetalProps::UnionFusion => return Value::Object(serde_json::Map::new()),
        };
        v.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemorySourceProps {
    #[serde(default)]
    pub rows: Vec<Value>,
}

/// Ruta o patrón glob, ej: "data/*.csv".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathProps {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlMapperProps {
    /// Nombre con el que la entrada es visible dentro de la consulta.
    pub table_alias: String,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinFusionProps {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleSinkProps {
    #[serde(default = "default_num_rows")]
    pub num_rows: usize,
}

fn default_num_rows() -> usize {
    20
}

/* --------- Tabla de despacho por `type` --------- */

type PropsParser = fn(Value) -> Result<MetalProps, serde_json::Error>;

/// Tabla explícita `type` -> parser de props. Los nombres genéricos
/// ("Source", "Mapper", ...) apuntan a la implementación por defecto de su clase.
pub const METAL_TYPES: &[(&str, PropsParser)] = &[
    ("Source", parse_memory_source),
    ("MemorySource", parse_memory_source),
    ("CsvSource", parse_csv_source),
    ("JsonlSource", parse_jsonl_source),
    ("Mapper", parse_identity_mapper),
    ("IdentityMapper", parse_identity_mapper),
    ("SqlMapper", parse_sql_mapper),
    ("Fusion", parse_union_fusion),
    ("UnionFusion", parse_union_fusion),
    ("JoinFusion", parse_join_fusion),
    ("Sink", parse_console_sink),
    ("ConsoleSink", parse_console_sink),
    ("JsonlSink", parse_jsonl_sink),
];

pub fn lookup_type(ty: &str) -> Option<PropsParser> {
    METAL_TYPES
        .iter()
        .find(|(name, _)| *name == ty)
        .map(|(_, parser)| *parser)
}

fn parse_memory_source(v: Value) -> Result<MetalProps, serde_json::Error> {
    Ok(MetalProps::MemorySource(from_props(v)?))
}

fn parse_csv_source(v: Value) -> Result<MetalProps, serde_json::Error> {
    Ok(MetalProps::CsvSource(from_props(v)?))
}

fn parse_jsonl_source(v: Value) -> Result<MetalProps, serde_json::Error> {
    Ok(MetalProps::JsonlSource(from_props(v)?))
}

fn parse_identity_mapper(_: Value) -> Result<MetalProps, serde_json::Error> {
    Ok(MetalProps::IdentityMapper)
}

fn parse_sql_mapper(v: Value) -> Result<MetalProps, serde_json::Error> {
    Ok(MetalProps::SqlMapper(from_props(v)?))
}

fn parse_union_fusion(_: Value) -> Result<MetalProps, serde_json::Error> {
    Ok(MetalProps::UnionFusion)
}

fn parse_join_fusion(v: Value) -> Result<MetalProps, serde_json::Error> {
    Ok(MetalProps::JoinFusion(from_props(v)?))
}

fn parse_console_sink(v: Value) -> Result<MetalProps, serde_json::Error> {
    Ok(MetalProps::ConsoleSink(from_props(v)?))
}

fn parse_jsonl_sink(v: Value) -> Result<MetalProps, serde_json::Error> {
    Ok(MetalProps::JsonlSink(from_props(v)?))
}

// props ausente o null se trata como objeto vacío para que apliquen los defaults
fn from_props<T: serde::de::DeserializeOwned>(v: Value) -> Result<T, serde_json::Error> {
    match v {
        Value::Null => serde_json::from_value(Value::Object(serde_json::Map::new())),
        other => serde_json::from_value(other),
    }
}

/* --------- Forma en el cable --------- */

/// Forma cruda de un metal, antes de pasar por la tabla de despacho.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetalJson {
    #[serde(rename = "type")]
    pub ty: String,
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub props: Value,
}

impl TryFrom<MetalJson> for Metal {
    type Error = String;

    fn try_from(raw: MetalJson) -> Result<Self, Self::Error> {
        let name = raw.name.unwrap_or_else(|| raw.id.clone());
        Metal::from_parts(&raw.ty, &raw.id, &name, raw.props)
    }
}

impl From<Metal> for MetalJson {
    fn from(m: Metal) -> Self {
        MetalJson {
            props: m.props.to_json(),
            ty: m.ty,
            id: m.id,
            name: Some(m.name),
        }
    }
}
