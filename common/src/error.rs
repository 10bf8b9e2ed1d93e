use thiserror::Error;

/// Errores del núcleo. Cada variante corresponde a un tipo de fallo que el
/// gateway traduce a un código HTTP distinto (ver `status_code`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetalError {
    /// JSON mal formado o con una forma que no es un Spec.
    #[error("spec parse error: {0}")]
    SpecParse(String),

    /// Ids duplicados, aristas colgantes, wait-for ilegal, ciclos...
    #[error("draft error: {0}")]
    Draft(String),

    /// Falló la transformación de un nodo durante el forge.
    #[error("forge error on metal {node_id}: {cause}")]
    Forge { node_id: String, cause: String },

    /// La configuración de un nodo no es válida para la plataforma.
    #[error("translate error on metal {node_id}: {msg}")]
    Translate { node_id: String, msg: String },

    /// "already deployed", "already running", etc.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Fallo de infraestructura (store, lanzamiento de proceso, red).
    #[error("service error: {0}")]
    Service(String),
}

impl MetalError {
    pub fn forge(node_id: impl Into<String>, cause: impl ToString) -> Self {
        MetalError::Forge {
            node_id: node_id.into(),
            cause: cause.to_string(),
        }
    }

    pub fn translate(node_id: impl Into<String>, msg: impl Into<String>) -> Self {
        MetalError::Translate {
            node_id: node_id.into(),
            msg: msg.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            MetalError::SpecParse(_) | MetalError::Draft(_) | MetalError::Translate { .. } => 400,
            MetalError::NotFound(_) => 404,
            MetalError::Conflict(_) => 409,
            MetalError::Forge { .. } | MetalError::Service(_) => 500,
        }
    }

    /// Los errores de validación no se reintentan; los de servicio sí (por el llamador).
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetalError::Service(_))
    }
}

impl From<serde_json::Error> for MetalError {
    fn from(e: serde_json::Error) -> Self {
        MetalError::SpecParse(e.to_string())
    }
}

pub type MetalResult<T> = Result<T, MetalError>;
