use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::enrich::{EnrichmentRules, UNKNOWN};

/// Una línea JSON parseada. Sólo se aceptan objetos.
pub type RawRecord = Map<String, Value>;

pub const ALL_RECORDS_FILE: &str = "all_records.ndjson";
pub const SUMMARY_FILE: &str = "summary.json";
const TOP_N: usize = 20;

/* --------- Reglas --------- */

/// Partición por el valor de un campo enriquecido.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRule {
    /// Nombre de la dimensión; define el directorio `by_<dimension>/`.
    pub dimension: String,
    pub field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRules {
    #[serde(default = "default_identity_key")]
    pub identity_key: String,

    /// Candidatos para la clave secundaria; gana el primero presente.
    #[serde(default = "default_secondary_key")]
    pub secondary_key: Vec<String>,

    /// Campos obligatorios además de la clave de identidad.
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,

    #[serde(default)]
    pub enrichment: EnrichmentRules,

    #[serde(default = "default_buckets")]
    pub buckets: Vec<BucketRule>,
}

fn default_identity_key() -> String {
    "email".to_string()
}

fn default_secondary_key() -> Vec<String> {
    vec!["source_domain".to_string(), "domain".to_string()]
}

fn default_required_fields() -> Vec<String> {
    vec!["domain".to_string()]
}

fn default_buckets() -> Vec<BucketRule> {
    vec![
        BucketRule {
            dimension: "country".to_string(),
            field: "country".to_string(),
        },
        BucketRule {
            dimension: "size".to_string(),
            field: "size_bucket".to_string(),
        },
    ]
}

impl Default for AggregateRules {
    fn default() -> Self {
        Self {
            identity_key: default_identity_key(),
            secondary_key: default_secondary_key(),
            required_fields: default_required_fields(),
            enrichment: EnrichmentRules::default(),
            buckets: default_buckets(),
        }
    }
}

impl AggregateRules {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("no se pudieron leer las reglas {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("reglas inválidas en {}", path.display()))
    }

    fn secondary_of(&self, record: &RawRecord) -> Option<String> {
        self.secondary_key
            .iter()
            .find_map(|field| key_value(record, field))
    }
}

/// Valor de un campo usable como clave: strings no vacíos tal cual, otros
/// escalares en su forma JSON. `null` y ausente cuentan como faltantes.
fn key_value(record: &RawRecord, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/* --------- Índice de deduplicación --------- */

/// Mapa clave -> registro que conserva el orden de primera aparición.
/// El primero que llega gana; los siguientes se descartan.
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: Vec<(String, RawRecord)>,
    positions: HashMap<String, usize>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devuelve true si el registro era nuevo.
    pub fn insert(&mut self, key: String, record: RawRecord) -> bool {
        if self.positions.contains_key(&key) {
            return false;
        }
        self.positions.insert(key.clone(), self.entries.len());
        self.entries.push((key, record));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, RawRecord)> {
        self.entries.iter()
    }
}

/* --------- Resultado --------- */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    pub path: String,
    /// Registros válidos (incluye duplicados).
    pub records: u64,
    pub malformed: u64,
    pub violations: u64,
    /// Si el archivo no se pudo abrir o leer completo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct AggregateResult {
    /// Registros enriquecidos en orden de primera aparición.
    pub records: Vec<RawRecord>,
    /// dimensión -> valor -> índices en `records`.
    pub buckets: BTreeMap<String, BTreeMap<String, Vec<usize>>>,
    pub counter: HashMap<String, u64>,

    pub total_raw: u64,
    pub malformed_lines: u64,
    pub policy_violations: u64,
    pub files: Vec<FileStats>,
}

impl AggregateResult {
    pub fn total_unique(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn bucket_records(&self, dimension: &str, value: &str) -> Vec<&RawRecord> {
        self.buckets
            .get(dimension)
            .and_then(|values| values.get(value))
            .map(|idxs| idxs.iter().map(|&i| &self.records[i]).collect())
            .unwrap_or_default()
    }
}

/* =========================
   Lectura + dedup + enriquecimiento
   ========================= */

/// Lee los archivos en el orden dado, deduplica, enriquece y particiona.
/// Nunca falla: archivos ilegibles, líneas malformadas y violaciones de
/// política quedan contadas en el resultado.
pub fn aggregate(files: &[PathBuf], rules: &AggregateRules) -> AggregateResult {
    let mut index = DedupIndex::new();
    let mut secondary_of: HashMap<String, Option<String>> = HashMap::new();
    let mut result = AggregateResult::default();

    for path in files {
        let stats = scan_file(path, rules, &mut index, &mut secondary_of, &mut result.counter);
        result.total_raw += stats.records;
        result.malformed_lines += stats.malformed;
        result.policy_violations += stats.violations;
        info!(
            "📄 {}: {} registros ({} malformados, {} sin campos obligatorios)",
            stats.path, stats.records, stats.malformed, stats.violations
        );
        result.files.push(stats);
    }

    result.records = index
        .iter()
        .map(|(key, record)| {
            let secondary = secondary_of.get(key).and_then(|s| s.as_deref());
            rules.enrichment.enrich(record, secondary, &result.counter)
        })
        .collect();

    result.buckets = build_buckets(&result.records, &rules.buckets);

    info!(
        "📊 raw: {} -> únicos: {}",
        result.total_raw,
        result.total_unique()
    );
    result
}

fn scan_file(
    path: &Path,
    rules: &AggregateRules,
    index: &mut DedupIndex,
    secondary_of: &mut HashMap<String, Option<String>>,
    counter: &mut HashMap<String, u64>,
) -> FileStats {
    let mut stats = FileStats {
        path: path.display().to_string(),
        ..FileStats::default()
    };

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!("no se pudo abrir {}: {}", path.display(), e);
            stats.error = Some(e.to_string());
            return stats;
        }
    };

    // una línea a la vez; nunca se carga el archivo entero
    for (lineno, line) in BufReader::new(file).split(b'\n').enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("lectura interrumpida en {}:{}: {}", path.display(), lineno + 1, e);
                stats.error = Some(e.to_string());
                break;
            }
        };

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        let record = match serde_json::from_slice::<Value>(trimmed) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                debug!("línea malformada en {}:{}", path.display(), lineno + 1);
                stats.malformed += 1;
                continue;
            }
        };

        let Some(identity) = key_value(&record, &rules.identity_key) else {
            stats.violations += 1;
            continue;
        };
        if rules
            .required_fields
            .iter()
            .any(|field| key_value(&record, field).is_none())
        {
            stats.violations += 1;
            continue;
        }

        stats.records += 1;

        // el contador incluye duplicados; los registros sin clave secundaria
        // no suman en ninguna clave
        let secondary = rules.secondary_of(&record);
        if let Some(key) = &secondary {
            *counter.entry(key.clone()).or_insert(0) += 1;
        }

        if index.insert(identity.clone(), record) {
            secondary_of.insert(identity, secondary);
        }
    }

    stats
}

fn build_buckets(
    records: &[RawRecord],
    rules: &[BucketRule],
) -> BTreeMap<String, BTreeMap<String, Vec<usize>>> {
    let mut buckets = BTreeMap::new();

    for rule in rules {
        let mut values: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, record) in records.iter().enumerate() {
            let value = key_value(record, &rule.field).unwrap_or_else(|| UNKNOWN.to_string());
            values.entry(value).or_default().push(i);
        }
        buckets.insert(rule.dimension.clone(), values);
    }

    buckets
}

/* =========================
   Salida
   ========================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopEntry {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub timestamp: DateTime<Utc>,
    pub total_raw: u64,
    pub total_unique: u64,
    pub malformed_lines: u64,
    pub policy_violations: u64,
    pub files: Vec<FileStats>,
    /// dimensión -> valor -> cantidad de registros.
    pub buckets: BTreeMap<String, BTreeMap<String, u64>>,
    /// Los 20 valores más frecuentes por dimensión.
    pub top: BTreeMap<String, Vec<TopEntry>>,
    /// dimensión -> valor -> archivo dentro de `by_<dimensión>/`.
    #[serde(default)]
    pub bucket_files: BTreeMap<String, BTreeMap<String, String>>,
}

impl AggregateSummary {
    pub fn from_result(result: &AggregateResult) -> Self {
        let buckets: BTreeMap<String, BTreeMap<String, u64>> = result
            .buckets
            .iter()
            .map(|(dim, values)| {
                let counts = values
                    .iter()
                    .map(|(v, idxs)| (v.clone(), idxs.len() as u64))
                    .collect();
                (dim.clone(), counts)
            })
            .collect();

        let top = buckets
            .iter()
            .map(|(dim, counts)| {
                let mut entries: Vec<TopEntry> = counts
                    .iter()
                    .map(|(value, count)| TopEntry {
                        value: value.clone(),
                        count: *count,
                    })
                    .collect();
                // determinista: count desc, valor asc
                entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
                entries.truncate(TOP_N);
                (dim.clone(), entries)
            })
            .collect();

        let bucket_files = result
            .buckets
            .iter()
            .map(|(dim, values)| (dim.clone(), bucket_file_names(values.keys())))
            .collect();

        Self {
            timestamp: Utc::now(),
            total_raw: result.total_raw,
            total_unique: result.total_unique(),
            malformed_lines: result.malformed_lines,
            policy_violations: result.policy_violations,
            files: result.files.clone(),
            buckets,
            top,
            bucket_files,
        }
    }
}

/// Nombre de archivo seguro para un valor de bucket.
fn bucket_file_name(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        format!("{UNKNOWN}.ndjson")
    } else {
        format!("{cleaned}.ndjson")
    }
}

/// Asigna un archivo distinto a cada valor de una dimensión. Los valores que
/// ya son nombres seguros se quedan con el suyo; el resto, si choca, recibe
/// un sufijo `_2`, `_3`...
fn bucket_file_names<'a>(values: impl IntoIterator<Item = &'a String>) -> BTreeMap<String, String> {
    let mut names = BTreeMap::new();
    let mut taken = HashSet::new();
    let mut pending = Vec::new();

    for value in values {
        let name = bucket_file_name(value);
        if name == format!("{value}.ndjson") {
            taken.insert(name.clone());
            names.insert(value.clone(), name);
        } else {
            pending.push((value, name));
        }
    }

    for (value, name) in pending {
        let mut candidate = name.clone();
        let stem = name.trim_end_matches(".ndjson");
        let mut n = 2;
        while taken.contains(&candidate) {
            candidate = format!("{stem}_{n}.ndjson");
            n += 1;
        }
        taken.insert(candidate.clone());
        names.insert(value.clone(), candidate);
    }

    names
}

fn write_ndjson<'a>(path: &Path, records: impl IntoIterator<Item = &'a RawRecord>) -> Result<usize> {
    let out = File::create(path).with_context(|| format!("no se pudo crear {}", path.display()))?;
    let mut writer = BufWriter::new(out);
    let mut n = 0;
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
        n += 1;
    }
    writer.flush()?;
    Ok(n)
}

/// Escribe el stream completo, un stream por valor de cada dimensión y el
/// resumen. Mismas entradas en el mismo orden => mismos bytes (salvo el
/// timestamp del resumen).
pub fn write_output(result: &AggregateResult, out_dir: &Path) -> Result<AggregateSummary> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("no se pudo crear {}", out_dir.display()))?;

    let n = write_ndjson(&out_dir.join(ALL_RECORDS_FILE), &result.records)?;
    info!("📄 {}: {} registros", ALL_RECORDS_FILE, n);

    let summary = AggregateSummary::from_result(result);

    for (dimension, values) in &result.buckets {
        let dir = out_dir.join(format!("by_{dimension}"));
        // no dejar buckets viejos de corridas anteriores
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("no se pudo limpiar {}", dir.display()))?;
        }
        fs::create_dir_all(&dir)?;

        let files = &summary.bucket_files[dimension];
        for (value, idxs) in values {
            let path = dir.join(&files[value]);
            write_ndjson(&path, idxs.iter().map(|&i| &result.records[i]))?;
        }
        info!("📁 by_{}/: {} valores", dimension, values.len());
    }

    let summary_path = out_dir.join(SUMMARY_FILE);
    fs::write(&summary_path, serde_json::to_string_pretty(&summary)? + "\n")
        .with_context(|| format!("no se pudo escribir {}", summary_path.display()))?;

    Ok(summary)
}

/// Resuelve un patrón glob a una lista ordenada de archivos.
pub fn collect_output_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .with_context(|| format!("patrón inválido: {pattern}"))?
        .filter_map(|entry| match entry {
            Ok(path) if path.is_file() => Some(path),
            Ok(_) => None,
            Err(e) => {
                warn!("no se pudo leer {}: {}", e.path().display(), e);
                None
            }
        })
        .collect();
    files.sort();
    Ok(files)
}
