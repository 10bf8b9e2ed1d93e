use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MetalError, MetalResult};
use crate::metal::Metal;

pub const SPEC_VERSION: &str = "1.0";

/// Descripción declarativa del pipeline tal como la escribe el usuario.
///
/// ```json
/// { "version": "1.0",
///   "metals": [ {"type": "Source", "id": "s1"}, {"type": "Sink", "id": "k1"} ],
///   "edges": [ ["s1", "k1"] ],
///   "waitFor": [] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub metals: Vec<Metal>,
    /// (productor, consumidor)
    #[serde(default)]
    pub edges: Vec<(String, String)>,
    /// (afectado, sink que hace de compuerta)
    #[serde(default, rename = "waitFor")]
    pub wait_for: Vec<(String, String)>,
}

fn default_version() -> String {
    SPEC_VERSION.to_string()
}

impl Spec {
    pub fn empty() -> Self {
        Self {
            version: default_version(),
            metals: Vec::new(),
            edges: Vec::new(),
            wait_for: Vec::new(),
        }
    }

    pub fn from_json(raw: &str) -> MetalResult<Self> {
        let v: Value = serde_json::from_str(raw)?;
        Self::from_value(v)
    }

    /// Un `null` no es un spec: se rechaza antes de intentar nada.
    pub fn from_value(v: Value) -> MetalResult<Self> {
        if v.is_null() {
            return Err(MetalError::SpecParse("spec is null".to_string()));
        }
        Ok(serde_json::from_value(v)?)
    }

    pub fn is_empty(&self) -> bool {
        self.metals.is_empty()
    }
}

impl Default for Spec {
    fn default() -> Self {
        Self::empty()
    }
}
