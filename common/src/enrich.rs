//! Enriquecimiento de registros: tablas estáticas por sufijo y tramos de
//! tamaño derivados del contador secundario.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::aggregate::RawRecord;

pub const UNKNOWN: &str = "UNKNOWN";

// TLD -> país
const TLD_COUNTRY: &[(&str, &str)] = &[
    ("fr", "FR"), ("de", "DE"), ("it", "IT"), ("es", "ES"), ("nl", "NL"), ("be", "BE"),
    ("ch", "CH"), ("at", "AT"), ("pl", "PL"), ("pt", "PT"), ("se", "SE"), ("no", "NO"),
    ("dk", "DK"), ("fi", "FI"), ("cz", "CZ"), ("sk", "SK"), ("ro", "RO"), ("hu", "HU"),
    ("bg", "BG"), ("hr", "HR"), ("si", "SI"), ("lt", "LT"), ("lv", "LV"), ("ee", "EE"),
    ("ie", "IE"), ("lu", "LU"), ("mt", "MT"), ("cy", "CY"), ("gr", "GR"), ("uk", "GB"),
    ("jp", "JP"), ("kr", "KR"), ("cn", "CN"), ("tw", "TW"), ("hk", "HK"), ("in", "IN"),
    ("ru", "RU"), ("ua", "UA"), ("br", "BR"), ("mx", "MX"), ("ar", "AR"), ("cl", "CL"),
    ("co", "CO"), ("ca", "CA"), ("au", "AU"), ("nz", "NZ"), ("za", "ZA"), ("ng", "NG"),
    ("ke", "KE"), ("eg", "EG"), ("il", "IL"), ("ae", "AE"), ("sa", "SA"), ("tr", "TR"),
    ("th", "TH"), ("vn", "VN"), ("ph", "PH"), ("id", "ID"), ("my", "MY"), ("sg", "SG"),
    // compuestos
    ("co.uk", "GB"), ("org.uk", "GB"), ("net.uk", "GB"), ("co.nz", "NZ"), ("com.au", "AU"),
    ("co.za", "ZA"), ("com.br", "BR"), ("co.jp", "JP"), ("co.kr", "KR"), ("co.in", "IN"),
];

/// Tabla sufijo -> categoría. Gana el sufijo más largo, así `co.uk`
/// se resuelve antes que `uk`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuffixTable {
    entries: BTreeMap<String, String>,
}

impl Default for SuffixTable {
    fn default() -> Self {
        Self::from_pairs(TLD_COUNTRY.iter().copied())
    }
}

impl SuffixTable {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(s, c)| (s.to_ascii_lowercase(), c.to_string()))
                .collect(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() {
            return None;
        }

        // "a.b.co.uk" -> "a.b.co.uk", "b.co.uk", "co.uk", "uk"
        let mut candidate = name.as_str();
        loop {
            if let Some(category) = self.entries.get(candidate) {
                return Some(category.as_str());
            }
            match candidate.split_once('.') {
                Some((_, rest)) => candidate = rest,
                None => return None,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeTier {
    /// Límite superior exclusivo.
    pub below: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRules {
    /// Campo del que se toma el sufijo (ej: "domain").
    #[serde(default = "default_suffix_field")]
    pub suffix_field: String,
    /// Campo derivado con la categoría (ej: "country").
    #[serde(default = "default_category_field")]
    pub category_field: String,
    #[serde(default)]
    pub suffix_table: SuffixTable,

    /// Campo derivado con el valor del contador secundario.
    #[serde(default = "default_count_field")]
    pub count_field: String,
    /// Campo derivado con el tramo de tamaño.
    #[serde(default = "default_tier_field")]
    pub tier_field: String,
    #[serde(default = "default_tiers")]
    pub tiers: Vec<SizeTier>,
    /// Tramo para conteos por encima de todos los límites.
    #[serde(default = "default_top_tier")]
    pub top_tier: String,
}

fn default_suffix_field() -> String {
    "domain".to_string()
}
fn default_category_field() -> String {
    "country".to_string()
}
fn default_count_field() -> String {
    "pages_seen".to_string()
}
fn default_tier_field() -> String {
    "size_bucket".to_string()
}
fn default_tiers() -> Vec<SizeTier> {
    vec![
        SizeTier { below: 10, name: "small".to_string() },
        SizeTier { below: 100, name: "medium".to_string() },
    ]
}
fn default_top_tier() -> String {
    "large".to_string()
}

impl Default for EnrichmentRules {
    fn default() -> Self {
        Self {
            suffix_field: default_suffix_field(),
            category_field: default_category_field(),
            suffix_table: SuffixTable::default(),
            count_field: default_count_field(),
            tier_field: default_tier_field(),
            tiers: default_tiers(),
            top_tier: default_top_tier(),
        }
    }
}

impl EnrichmentRules {
    pub fn tier_for(&self, count: u64) -> &str {
        self.tiers
            .iter()
            .find(|t| count < t.below)
            .map(|t| t.name.as_str())
            .unwrap_or(self.top_tier.as_str())
    }

    /// Función pura: mismo registro + mismos índices => mismo resultado.
    /// Nunca falla; lo que no se encuentra queda como `UNKNOWN`.
    pub fn enrich(
        &self,
        record: &RawRecord,
        secondary_key: Option<&str>,
        counter: &HashMap<String, u64>,
    ) -> RawRecord {
        let mut out = record.clone();

        let category = record
            .get(&self.suffix_field)
            .and_then(Value::as_str)
            .and_then(|name| self.suffix_table.lookup(name))
            .unwrap_or(UNKNOWN);
        out.insert(self.category_field.clone(), json!(category));

        // un registro sin clave secundaria se cuenta a sí mismo
        let count = secondary_key
            .and_then(|k| counter.get(k).copied())
            .unwrap_or(1);
        out.insert(self.count_field.clone(), json!(count));
        out.insert(self.tier_field.clone(), json!(self.tier_for(count)));

        out
    }
}
