use serde_json::{json, Map, Value};
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::Path,
};

/// Tipo genérico de registro (fila de datos).
/// Usamos JSON para poder representar texto, CSV, JSONL, etc.
pub type Record = Value;

/// Colección en memoria de registros.
pub type Records = Vec<Record>;

/* =========================
   Operadores genéricos
   ========================= */

/// map: aplica una función a cada registro y devuelve una nueva colección.
pub fn op_map<F>(input: Records, f: F) -> Records
where
    F: Fn(&Record) -> Record,
{
    input.into_iter().map(|rec| f(&rec)).collect()
}

/// filter: deja pasar sólo los registros que cumplan el predicado.
pub fn op_filter<F>(input: Records, f: F) -> Records
where
    F: Fn(&Record) -> bool,
{
    let mut out = Vec::new();
    for rec in input.into_iter() {
        if f(&rec) {
            out.push(rec);
        }
    }
    out
}

/// union: concatena colecciones en el orden recibido.
pub fn op_union(inputs: Vec<Records>) -> Records {
    inputs.into_iter().flatten().collect()
}

/* =========================
   JOIN en memoria
   ========================= */

/// Fusiona dos registros JSON en uno solo.
/// - el campo `key_field` se mantiene una sola vez
/// - si un campo existe en ambos lados, se respeta el del lado izquierdo
///   y el del derecho se guarda con prefijo `right_`.
fn merge_records(left: &Record, right: &Record, key_field: &str) -> Record {
    let mut obj = Map::new();

    if let Some(lobj) = left.as_object() {
        for (k, v) in lobj {
            obj.insert(k.clone(), v.clone());
        }
    }

    if let Some(robj) = right.as_object() {
        for (k, v) in robj {
            if k == key_field {
                continue;
            }
            if obj.contains_key(k) {
                obj.insert(format!("right_{}", k), v.clone());
            } else {
                obj.insert(k.clone(), v.clone());
            }
        }
    }

    Value::Object(obj)
}

// clave de join como texto; números y strings "1" emparejan igual
fn join_key(rec: &Record, key_field: &str) -> Option<String> {
    match rec.get(key_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Inner join en memoria entre dos colecciones por el campo `key_field`.
/// Si hay N registros a la izquierda y M a la derecha con la misma clave,
/// se generan N*M registros combinados.
pub fn op_join_by_key(left: Records, right: Records, key_field: &str) -> Records {
    let mut index: HashMap<String, Vec<Record>> = HashMap::new();

    for rec in right.into_iter() {
        if let Some(k) = join_key(&rec, key_field) {
            index.entry(k).or_default().push(rec);
        }
    }

    let mut out = Vec::new();

    for lrec in left.into_iter() {
        let Some(key) = join_key(&lrec, key_field) else {
            continue;
        };

        if let Some(r_matches) = index.get(&key) {
            for rrec in r_matches {
                out.push(merge_records(&lrec, rrec, key_field));
            }
        }
    }

    out
}

/* =========================
   Lectura / escritura de archivos
   ========================= */

/// Expande un patrón glob a rutas de archivo ordenadas.
/// Una ruta sin comodines que no existe se devuelve tal cual, para que el
/// error de apertura mencione el archivo.
pub fn expand_path(pattern: &str) -> io::Result<Vec<String>> {
    let entries = glob::glob(pattern)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let mut out: Vec<String> = entries
        .flatten()
        .filter(|p| p.is_file())
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    out.sort();

    if out.is_empty() && !pattern.contains(['*', '?', '[']) {
        out.push(pattern.to_string());
    }
    Ok(out)
}

/// CSV con encabezados -> un objeto por fila, todos los valores como texto.
pub fn read_csv_to_records(path: &str) -> io::Result<Records> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_to_io)?;

    // Limpia BOM por si viene de Excel/Windows
    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_to_io)?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut out = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_to_io)?;
        let mut obj = Map::new();
        for (idx, h) in headers.iter().enumerate() {
            obj.insert(h.clone(), json!(row.get(idx).unwrap_or("")));
        }
        out.push(Value::Object(obj));
    }

    Ok(out)
}

fn csv_to_io(e: csv::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

pub fn read_jsonl_to_records(path: &str) -> io::Result<Records> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut out = Vec::new();

    for line_res in reader.lines() {
        let line = line_res?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: Value = serde_json::from_str(&line)?;
        out.push(rec);
    }

    Ok(out)
}

/// Escribe los registros como JSONL, creando la carpeta de salida si hace falta.
pub fn write_jsonl(records: &[Record], output_path: &str) -> io::Result<()> {
    if let Some(parent) = Path::new(output_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let out = File::create(output_path)?;
    let mut writer = BufWriter::new(out);

    for rec in records {
        serde_json::to_writer(&mut writer, rec)?;
        writer.write_all(b"\n")?;
    }

    writer.flush()?;
    Ok(())
}

/* =========================
   Esquema
   ========================= */

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Infiere el esquema de una colección: campos en orden de primera aparición.
/// Si un campo aparece con tipos distintos el tipo queda como "mixed";
/// un null no pisa un tipo ya conocido.
pub fn infer_schema(records: &[Record]) -> Value {
    let mut fields: Vec<(String, &'static str)> = Vec::new();

    for rec in records {
        let Some(obj) = rec.as_object() else {
            continue;
        };
        for (k, v) in obj {
            let ty = json_type_name(v);
            match fields.iter_mut().find(|(name, _)| name == k) {
                None => fields.push((k.clone(), ty)),
                Some((_, known)) => {
                    if *known == "null" {
                        *known = ty;
                    } else if ty != "null" && *known != ty {
                        *known = "mixed";
                    }
                }
            }
        }
    }

    json!({
        "fields": fields
            .into_iter()
            .map(|(name, ty)| json!({"name": name, "type": ty}))
            .collect::<Vec<_>>(),
        "rows": records.len(),
    })
}
