use std::{
    fs::{self, File},
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

/// Columnas por defecto para exportar registros enriquecidos.
pub const DEFAULT_COLUMNS: &[&str] = &[
    "email",
    "domain",
    "source_url",
    "source_domain",
    "country",
    "pages_seen",
    "size_bucket",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CsvStats {
    pub rows: u64,
    /// Líneas que no eran objetos JSON (o no eran UTF-8).
    pub errors: u64,
}

fn cell(record: &serde_json::Map<String, Value>, column: &str) -> String {
    match record.get(column) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Convierte un NDJSON a CSV con las columnas dadas, línea por línea.
/// El quoting lo resuelve `csv::Writer`.
pub fn export_csv(input: &Path, output: &Path, columns: &[String]) -> Result<CsvStats> {
    let reader = BufReader::new(
        File::open(input).with_context(|| format!("no se pudo abrir {}", input.display()))?,
    );

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("no se pudo crear {}", output.display()))?;
    writer.write_record(columns)?;

    let mut stats = CsvStats::default();
    // por bytes: una línea que no es UTF-8 cuenta como error, no corta la exportación
    for line in reader.split(b'\n') {
        let line = line.with_context(|| format!("error leyendo {}", input.display()))?;
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_slice::<Value>(trimmed) {
            Ok(Value::Object(record)) => {
                writer.write_record(columns.iter().map(|c| cell(&record, c)))?;
                stats.rows += 1;
            }
            _ => stats.errors += 1,
        }
    }

    writer.flush()?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, io::Write, path::PathBuf};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("export_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn export_csv_escapa_y_cuenta_errores() {
        let dir = temp_dir("basico");
        let input = dir.join("in.ndjson");
        let mut f = File::create(&input).unwrap();
        writeln!(f, "{}", r#"{"email":"a@x.fr","note":"hola, \"mundo\"","score":7}"#).unwrap();
        writeln!(f, "roto").unwrap();
        writeln!(f).unwrap();
        writeln!(f, "{}", r#"{"email":"b@y.de","note":null}"#).unwrap();
        drop(f);

        let output = dir.join("csv").join("out.csv");
        let columns: Vec<String> = ["email", "note", "score"].iter().map(|s| s.to_string()).collect();
        let stats = export_csv(&input, &output, &columns).unwrap();

        assert_eq!(stats, CsvStats { rows: 2, errors: 1 });

        let content = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "email,note,score");
        assert_eq!(lines[1], r#"a@x.fr,"hola, ""mundo""",7"#);
        assert_eq!(lines[2], "b@y.de,,");
    }

    #[test]
    fn export_csv_cuenta_lineas_que_no_son_utf8() {
        let dir = temp_dir("no_utf8");
        let input = dir.join("in.ndjson");
        let mut bytes = b"{\"email\":\"a@x.fr\"}\n".to_vec();
        bytes.extend_from_slice(b"{\"email\":\"\xff\xfe\"}\n");
        bytes.extend_from_slice(b"{\"email\":\"b@y.de\"}\n");
        fs::write(&input, bytes).unwrap();

        let output = dir.join("out.csv");
        let stats = export_csv(&input, &output, &["email".to_string()]).unwrap();

        assert_eq!(stats, CsvStats { rows: 2, errors: 1 });
        let content = fs::read_to_string(&output).unwrap();
        assert_eq!(content.lines().collect::<Vec<_>>(), vec!["email", "a@x.fr", "b@y.de"]);
    }

    #[test]
    fn export_csv_falla_si_no_existe_la_entrada() {
        let dir = temp_dir("faltante");
        let err = export_csv(&dir.join("nada.ndjson"), &dir.join("out.csv"), &[]).unwrap_err();
        assert!(err.to_string().contains("no se pudo abrir"));
    }
}
