use std::collections::{BTreeSet, HashMap};

use crate::error::{MetalError, MetalResult};
use crate::metal::Metal;
use crate::spec::Spec;

/* --------- Grafo validado (draft) --------- */

/// Grafo de ejecución validado e inmutable.
///
/// Garantías tras `build`:
/// - ids únicos
/// - toda arista y todo wait-for apuntan a metals declarados
/// - la compuerta de cada wait-for es un Sink
/// - aristas + wait-for forman un DAG (`order` es un orden topológico)
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    metals: Vec<Metal>,
    index: HashMap<String, usize>,
    edges: Vec<(String, String)>,
    wait_for: Vec<(String, String)>,
    order: Vec<String>,
}

impl Draft {
    pub fn builder() -> DraftBuilder {
        DraftBuilder::default()
    }

    pub fn metals(&self) -> &[Metal] {
        &self.metals
    }

    pub fn metal(&self, id: &str) -> Option<&Metal> {
        self.index.get(id).map(|&i| &self.metals[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    pub fn wait_for(&self) -> &[(String, String)] {
        &self.wait_for
    }

    /// Orden de forjado: topológico, desempate por orden de declaración.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Productores de datos de `id`, en orden de declaración de aristas.
    /// Aristas repetidas aparecen una sola vez.
    pub fn producers(&self, id: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for (from, to) in &self.edges {
            if to == id && !out.contains(&from.as_str()) {
                out.push(from.as_str());
            }
        }
        out
    }

    /// Metals "afectados" que deben terminar antes de que corra la compuerta `id`.
    pub fn waits_of(&self, id: &str) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for (affected, gate) in &self.wait_for {
            if gate == id && !out.contains(&affected.as_str()) {
                out.push(affected.as_str());
            }
        }
        out
    }
}

/// Acumula metals, aristas y wait-for sin validar nada; `build` valida todo
/// de una vez y devuelve un `Draft` completo o ningún draft.
#[derive(Debug, Default, Clone)]
pub struct DraftBuilder {
    metals: Vec<Metal>,
    edges: Vec<(String, String)>,
    waits: Vec<(String, String)>,
}

impl DraftBuilder {
    pub fn add(mut self, metal: Metal) -> Self {
        self.metals.push(metal);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    pub fn wait_for(mut self, affected: impl Into<String>, gate: impl Into<String>) -> Self {
        self.waits.push((affected.into(), gate.into()));
        self
    }

    pub fn build(self) -> MetalResult<Draft> {
        let DraftBuilder {
            metals,
            edges,
            waits,
        } = self;

        // 1) índice id -> posición; si queda más chico que la lista hay duplicados
        let mut index: HashMap<String, usize> = HashMap::with_capacity(metals.len());
        let mut duplicated: Vec<&str> = Vec::new();
        for (i, m) in metals.iter().enumerate() {
            if index.insert(m.id.clone(), i).is_some() && !duplicated.contains(&m.id.as_str()) {
                duplicated.push(m.id.as_str());
            }
        }
        if index.len() != metals.len() {
            let ids: Vec<&str> = metals.iter().map(|m| m.id.as_str()).collect();
            return Err(MetalError::Draft(format!(
                "duplicate metal id in spec {{metals: {}, ids: [{}]}}: {}",
                metals.len(),
                ids.join(", "),
                duplicated.join(", ")
            )));
        }

        // 2) aristas de datos
        for (from, to) in &edges {
            for end in [from, to] {
                if !index.contains_key(end) {
                    return Err(MetalError::Draft(format!(
                        "edge [{} -> {}] references undeclared metal {}",
                        from, to, end
                    )));
                }
            }
        }

        // 3) wait-for: la compuerta tiene que ser un Sink
        for (affected, gate) in &waits {
            if !index.contains_key(affected) {
                return Err(MetalError::Draft(format!(
                    "waitFor [{} -> {}] references undeclared metal {}",
                    affected, gate, affected
                )));
            }
            match index.get(gate).map(|&i| &metals[i]) {
                None => {
                    return Err(MetalError::Draft(format!(
                        "waitFor [{} -> {}] references undeclared metal {}",
                        affected, gate, gate
                    )))
                }
                Some(m) if !m.is_sink() => {
                    return Err(MetalError::Draft(format!(
                        "Metal{{{}}} must be a Sink to be waited for",
                        gate
                    )))
                }
                Some(_) => {}
            }
        }

        // 4) orden topológico sobre aristas + wait-for (afectado antes que compuerta)
        let order = topo_order(&metals, &index, &edges, &waits)?;

        Ok(Draft {
            metals,
            index,
            edges,
            wait_for: waits,
            order,
        })
    }
}

/// Kahn con desempate por posición de declaración, así el orden es determinista.
fn topo_order(
    metals: &[Metal],
    index: &HashMap<String, usize>,
    edges: &[(String, String)],
    waits: &[(String, String)],
) -> MetalResult<Vec<String>> {
    let n = metals.len();
    let mut in_degree = vec![0usize; n];
    let mut outs: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (from, to) in edges.iter().chain(waits.iter()) {
        let (f, t) = (index[from], index[to]);
        outs[f].push(t);
        in_degree[t] += 1;
    }

    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(i) = ready.pop_first() {
        order.push(metals[i].id.clone());
        for &t in &outs[i] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                ready.insert(t);
            }
        }
    }

    if order.len() < n {
        let stuck: Vec<&str> = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| metals[i].id.as_str())
            .collect();
        return Err(MetalError::Draft(format!(
            "cycle detected among metals: {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}

/// Construye el draft de un spec. `None` equivale a un spec nulo.
pub fn draft(spec: Option<&Spec>) -> MetalResult<Draft> {
    let spec = spec.ok_or_else(|| MetalError::Draft("spec is null".to_string()))?;

    let mut builder = Draft::builder();
    for m in &spec.metals {
        builder = builder.add(m.clone());
    }
    for (from, to) in &spec.edges {
        builder = builder.add_edge(from.as_str(), to.as_str());
    }
    for (affected, gate) in &spec.wait_for {
        builder = builder.wait_for(affected.as_str(), gate.as_str());
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn spec(v: Value) -> Spec {
        Spec::from_value(v).unwrap()
    }

    fn draft_err(v: Value) -> String {
        match draft(Some(&spec(v))) {
            Err(MetalError::Draft(msg)) => msg,
            other => panic!("se esperaba DraftError, llegó {:?}", other),
        }
    }

    #[test]
    fn source_a_sink_construye_draft() {
        let s = spec(json!({
            "metals": [{"type": "Source", "id": "s1"}, {"type": "Sink", "id": "k1"}],
            "edges": [["s1", "k1"]],
            "waitFor": []
        }));
        let d = draft(Some(&s)).unwrap();

        assert_eq!(d.metals().len(), 2);
        assert_eq!(d.edges().len(), 1);
        assert_eq!(d.wait_for().len(), 0);
        assert_eq!(d.order(), &["s1".to_string(), "k1".to_string()]);
    }

    #[test]
    fn wait_for_hacia_no_sink_falla_nombrando_el_id() {
        let msg = draft_err(json!({
            "metals": [{"type": "Source", "id": "s1"}, {"type": "Sink", "id": "k1"}],
            "edges": [["s1", "k1"]],
            "waitFor": [["s1", "s1"]]
        }));
        assert!(msg.contains("s1"), "{}", msg);
        assert!(msg.contains("Sink"), "{}", msg);
    }

    #[test]
    fn ids_duplicados_fallan() {
        let msg = draft_err(json!({
            "metals": [
                {"type": "Source", "id": "a"},
                {"type": "Sink", "id": "a"},
                {"type": "Sink", "id": "b"}
            ]
        }));
        assert_eq!(
            msg,
            "duplicate metal id in spec {metals: 3, ids: [a, a, b]}: a"
        );
    }

    #[test]
    fn aristas_colgantes_fallan() {
        let msg = draft_err(json!({
            "metals": [{"type": "Source", "id": "s1"}],
            "edges": [["s1", "fantasma"]]
        }));
        assert!(msg.contains("fantasma"));

        let msg = draft_err(json!({
            "metals": [{"type": "Sink", "id": "k1"}],
            "waitFor": [["nadie", "k1"]]
        }));
        assert!(msg.contains("nadie"));
    }

    #[test]
    fn spec_nulo_falla() {
        assert!(matches!(draft(None), Err(MetalError::Draft(_))));
    }

    #[test]
    fn ciclo_por_aristas_falla() {
        let msg = draft_err(json!({
            "metals": [
                {"type": "Mapper", "id": "m1"},
                {"type": "Mapper", "id": "m2"}
            ],
            "edges": [["m1", "m2"], ["m2", "m1"]]
        }));
        assert!(msg.contains("cycle"));
        assert!(msg.contains("m1") && msg.contains("m2"));
    }

    #[test]
    fn ciclo_combinando_aristas_y_wait_for_falla() {
        // k2 espera a k1 y k1 espera a k2
        let msg = draft_err(json!({
            "metals": [
                {"type": "Source", "id": "s1"},
                {"type": "Sink", "id": "k1"},
                {"type": "Sink", "id": "k2"}
            ],
            "edges": [["s1", "k1"], ["s1", "k2"]],
            "waitFor": [["k1", "k2"], ["k2", "k1"]]
        }));
        assert!(msg.contains("cycle"));
    }

    #[test]
    fn wait_for_entre_sinks_es_legal_y_ordena() {
        let d = draft(Some(&spec(json!({
            "metals": [
                {"type": "Source", "id": "s1"},
                {"type": "Sink", "id": "k2"},
                {"type": "Sink", "id": "k1"}
            ],
            "edges": [["s1", "k1"], ["s1", "k2"]],
            "waitFor": [["k1", "k2"]]
        }))))
        .unwrap();

        // k2 se declaró antes pero espera a k1
        assert_eq!(d.order(), &["s1", "k1", "k2"]);
        assert_eq!(d.waits_of("k2"), vec!["k1"]);
    }

    #[test]
    fn aristas_repetidas_son_legales() {
        let d = draft(Some(&spec(json!({
            "metals": [{"type": "Source", "id": "s1"}, {"type": "Sink", "id": "k1"}],
            "edges": [["s1", "k1"], ["s1", "k1"]]
        }))))
        .unwrap();

        assert_eq!(d.edges().len(), 2);
        assert_eq!(d.producers("k1"), vec!["s1"]);
    }

    #[test]
    fn build_es_idempotente() {
        let s = spec(json!({
            "metals": [
                {"type": "Source", "id": "a"},
                {"type": "Source", "id": "b"},
                {"type": "Fusion", "id": "f"},
                {"type": "Sink", "id": "k"}
            ],
            "edges": [["a", "f"], ["b", "f"], ["f", "k"]]
        }));
        let d1 = draft(Some(&s)).unwrap();
        let d2 = draft(Some(&s)).unwrap();
        assert_eq!(d1, d2);
        assert_eq!(d1.producers("f"), vec!["a", "b"]);
    }

    #[test]
    fn todos_los_extremos_estan_en_el_indice() {
        let d = draft(Some(&spec(json!({
            "metals": [
                {"type": "Source", "id": "a"},
                {"type": "Mapper", "id": "m"},
                {"type": "Sink", "id": "k1"},
                {"type": "Sink", "id": "k2"}
            ],
            "edges": [["a", "m"], ["m", "k1"], ["a", "k2"]],
            "waitFor": [["m", "k2"]]
        }))))
        .unwrap();

        for (x, y) in d.edges().iter().chain(d.wait_for().iter()) {
            assert!(d.contains(x) && d.contains(y));
        }
        assert_eq!(d.order().len(), 4);
    }

    #[test]
    fn builder_directo_sin_spec() {
        let src = Metal::from_parts("Source", "s", "s", Value::Null).unwrap();
        let sink = Metal::from_parts("Sink", "k", "k", Value::Null).unwrap();
        let d = Draft::builder()
            .add(src)
            .add(sink)
            .add_edge("s", "k")
            .build()
            .unwrap();
        assert_eq!(d.metal("k").map(|m| m.is_sink()), Some(true));
    }
}
