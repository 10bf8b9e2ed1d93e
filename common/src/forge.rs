use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::draft::Draft;
use crate::error::{MetalError, MetalResult};
use crate::metal::{Metal, MetalKind};

/// Plataforma de ejecución sobre la que se forja un draft.
///
/// Cada método recibe el metal completo para poder leer sus props; los
/// errores que devuelva se envuelven en `MetalError::Forge` con el id del metal.
pub trait Platform {
    type Dataset: Clone;

    /// Validación previa a cualquier ejecución. `inputs` es la cantidad de
    /// productores distintos que tiene el metal en el draft.
    fn translate(&self, metal: &Metal, inputs: usize) -> MetalResult<()>;

    fn source(&self, metal: &Metal) -> MetalResult<Self::Dataset>;

    fn map(&self, metal: &Metal, data: Self::Dataset) -> MetalResult<Self::Dataset>;

    fn fusion(&self, metal: &Metal, datas: Vec<Self::Dataset>) -> MetalResult<Self::Dataset>;

    fn sink(&self, metal: &Metal, data: Self::Dataset) -> MetalResult<()>;

    fn schema(&self, data: &Self::Dataset) -> Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgeMode {
    /// Forja todo menos los sinks: sirve para conocer esquemas sin efectos.
    Analyse,
    /// Forja el grafo completo, sinks incluidos.
    Exec,
}

impl Metal {
    /// Contrato común de los cuatro tipos de nodo: recibe las salidas ya
    /// preparadas de sus productores y devuelve su propia salida (los sinks no
    /// producen nada).
    pub fn forge<P: Platform>(
        &self,
        platform: &P,
        mut inputs: Vec<P::Dataset>,
    ) -> MetalResult<Option<P::Dataset>> {
        match self.kind() {
            MetalKind::Source => platform.source(self).map(Some),
            MetalKind::Mapper => {
                let data = single_input(self, &mut inputs)?;
                platform.map(self, data).map(Some)
            }
            MetalKind::Fusion => platform.fusion(self, inputs).map(Some),
            MetalKind::Sink => {
                let data = single_input(self, &mut inputs)?;
                platform.sink(self, data).map(|_| None)
            }
        }
    }
}

fn single_input<D>(metal: &Metal, inputs: &mut Vec<D>) -> MetalResult<D> {
    if inputs.len() != 1 {
        return Err(MetalError::forge(
            metal.id.as_str(),
            format!("expected exactly one input, got {}", inputs.len()),
        ));
    }
    inputs
        .pop()
        .ok_or_else(|| MetalError::forge(metal.id.as_str(), "missing input"))
}

/// Resultado de un forjado completo.
#[derive(Debug, Clone)]
pub struct Forged<D> {
    /// Salidas preparadas de los metals que no son sinks, por id.
    pub staged: HashMap<String, D>,
    /// Sinks ejecutados, en orden.
    pub sunk: Vec<String>,
}

impl<D> Forged<D> {
    pub fn output(&self, id: &str) -> Option<&D> {
        self.staged.get(id)
    }
}

/// Recorre un draft en orden topológico e invoca cada metal contra la plataforma.
pub struct ForgeMaster<'a, P: Platform> {
    platform: &'a P,
}

impl<'a, P: Platform> ForgeMaster<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        Self { platform }
    }

    /// Chequeos estructurales previos: aridad de cada tipo, sinks usados como
    /// productores y validación propia de la plataforma. No ejecuta nada.
    pub fn translate(&self, draft: &Draft) -> MetalResult<()> {
        for id in draft.order() {
            let Some(metal) = draft.metal(id) else {
                continue;
            };
            let producers = draft.producers(id);

            if let Some(sink) = producers
                .iter()
                .find(|p| draft.metal(p).map(|m| m.is_sink()).unwrap_or(false))
            {
                return Err(MetalError::translate(
                    id.as_str(),
                    format!("Sink {} produces no data and can't feed another metal", sink),
                ));
            }

            let n = producers.len();
            let arity_ok = match metal.kind() {
                MetalKind::Source => n == 0,
                MetalKind::Mapper | MetalKind::Sink => n == 1,
                MetalKind::Fusion => n >= 1,
            };
            if !arity_ok {
                return Err(MetalError::translate(
                    id.as_str(),
                    format!("{:?} can't take {} input(s)", metal.kind(), n),
                ));
            }

            self.platform.translate(metal, n)?;
        }
        Ok(())
    }

    /// Forja el draft. Un fallo aborta sólo la rama que depende del metal que
    /// falló; el resto del grafo sigue. Si hubo fallos se devuelve el primero.
    pub fn forge(&self, draft: &Draft, mode: ForgeMode) -> MetalResult<Forged<P::Dataset>> {
        self.translate(draft)?;

        let mut staged: HashMap<String, P::Dataset> = HashMap::new();
        let mut sunk: Vec<String> = Vec::new();
        // metal bloqueado -> id del metal donde se originó el fallo
        let mut blocked: HashMap<String, String> = HashMap::new();
        let mut first_error: Option<MetalError> = None;

        for id in draft.order() {
            let Some(metal) = draft.metal(id) else {
                continue;
            };
            let producers = draft.producers(id);

            let origin = producers
                .iter()
                .chain(draft.waits_of(id).iter())
                .find_map(|dep| blocked.get(*dep).cloned());
            if let Some(origin) = origin {
                debug!("metal {} no se forja: depende de {} que falló", id, origin);
                blocked.insert(id.clone(), origin);
                continue;
            }

            if mode == ForgeMode::Analyse && metal.is_sink() {
                continue;
            }

            let inputs: Vec<P::Dataset> = producers
                .iter()
                .filter_map(|p| staged.get(*p).cloned())
                .collect();

            match metal.forge(self.platform, inputs) {
                Ok(Some(data)) => {
                    staged.insert(id.clone(), data);
                }
                Ok(None) => sunk.push(id.clone()),
                Err(e) => {
                    let e = match e {
                        e @ MetalError::Forge { .. } => e,
                        other => MetalError::forge(id.as_str(), other),
                    };
                    warn!("fallo forjando metal {}: {}", id, e);
                    blocked.insert(id.clone(), id.clone());
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(Forged { staged, sunk }),
        }
    }

    /// Esquema de cada salida preparada, en orden de forjado.
    pub fn schemas(&self, draft: &Draft, forged: &Forged<P::Dataset>) -> Vec<(String, Value)> {
        draft
            .order()
            .iter()
            .filter_map(|id| {
                forged
                    .output(id)
                    .map(|d| (id.clone(), self.platform.schema(d)))
            })
            .collect()
    }
}
