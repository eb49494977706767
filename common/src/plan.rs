use std::{collections::HashSet, fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::node::NodeId;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_MARKER_PATH: &str = "/root/.fleet_setup_done";

/// Placeholder que se reemplaza por el id del nodo en rutas locales.
pub const NODE_ID_PLACEHOLDER: &str = "{node_id}";

/// Timeout por defecto de cada paso remoto.
/// Se puede sobreescribir con la env var FLEET_TIMEOUT_SECS.
pub fn default_timeout_secs() -> u64 {
    std::env::var("FLEET_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_TIMEOUT_SECS)
}

/// Plan completo tal como se escribe en el archivo JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDef {
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Ruta remota del marcador de setup completo.
    #[serde(default)]
    pub marker_path: Option<String>,

    pub phases: Vec<PhaseDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDef {
    pub name: String,

    /// Si es true, la fase se salta en nodos cuyo marcador ya existe.
    #[serde(default)]
    pub guarded: bool,

    #[serde(default)]
    pub continue_on_partial_failure: bool,

    /// Tasa de fallos tolerada antes de aplicar la regla de skip (0.0 = ninguno).
    #[serde(default)]
    pub failure_threshold: f64,

    pub steps: Vec<StepDef>,
}

/// Un paso dentro de una fase. Los pasos de una fase corren en orden sobre
/// cada nodo y se detienen en el primer fallo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepDef {
    Exec {
        command: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Push {
        artifacts: Vec<ArtifactDef>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Fetch {
        remote_path: String,
        local_dir: String,
        /// Si el archivo remoto no existe no se considera fallo.
        #[serde(default)]
        optional: bool,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    Pause {
        millis: u64,
    },
}

impl StepDef {
    pub fn label(&self) -> &'static str {
        match self {
            StepDef::Exec { .. } => "exec",
            StepDef::Push { .. } => "push",
            StepDef::Fetch { .. } => "fetch",
            StepDef::Pause { .. } => "pause",
        }
    }

    fn timeout_secs(&self) -> Option<u64> {
        match self {
            StepDef::Exec { timeout_secs, .. }
            | StepDef::Push { timeout_secs, .. }
            | StepDef::Fetch { timeout_secs, .. } => Some(*timeout_secs),
            StepDef::Pause { .. } => None,
        }
    }
}

/// Blob con destino remoto fijo. No se versiona: el llamador se encarga de
/// que esté fresco.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDef {
    pub name: String,
    pub source: ArtifactSource,
    pub remote_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactSource {
    /// Archivo local; admite `{node_id}` para chunks por nodo.
    File { path: String },
    /// La asignación del nodo, un elemento por línea.
    Assignment,
}

impl PlanDef {
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.batch_size == Some(0) {
            return Err(PlanError::ZeroBatchSize);
        }
        if self.phases.is_empty() {
            return Err(PlanError::NoPhases);
        }

        let mut names = HashSet::new();
        for phase in &self.phases {
            if !names.insert(phase.name.as_str()) {
                return Err(PlanError::DuplicatePhase(phase.name.clone()));
            }
            if phase.steps.is_empty() {
                return Err(PlanError::EmptyPhase(phase.name.clone()));
            }
            if !(0.0..=1.0).contains(&phase.failure_threshold) {
                return Err(PlanError::InvalidThreshold {
                    phase: phase.name.clone(),
                    value: phase.failure_threshold,
                });
            }
            if phase.steps.iter().any(|s| s.timeout_secs() == Some(0)) {
                return Err(PlanError::ZeroTimeout(phase.name.clone()));
            }
        }
        Ok(())
    }

    pub fn batch_size_or_default(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn marker_path_or_default(&self) -> &str {
        self.marker_path.as_deref().unwrap_or(DEFAULT_MARKER_PATH)
    }
}

pub fn load_plan(path: &Path) -> Result<PlanDef> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer el plan {}", path.display()))?;
    let plan: PlanDef =
        serde_json::from_str(&raw).with_context(|| format!("plan inválido en {}", path.display()))?;
    plan.validate()?;
    Ok(plan)
}

/// Reemplaza `{node_id}` por el id del nodo. No hay más plantillas que esta.
pub fn expand_node_placeholder(template: &str, node_id: NodeId) -> String {
    template.replace(NODE_ID_PLACEHOLDER, &node_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"{
        "batch_size": 8,
        "phases": [
            {
                "name": "stop",
                "guarded": true,
                "steps": [{"kind": "exec", "command": "pkill -f extract || true", "timeout_secs": 20}]
            },
            {
                "name": "deploy",
                "guarded": true,
                "steps": [
                    {"kind": "push", "artifacts": [
                        {"name": "chunk", "source": {"type": "file", "path": "chunks/chunk_{node_id}.txt"}, "remote_path": "/root/my_wet_files.txt"},
                        {"name": "work", "source": {"type": "assignment"}, "remote_path": "/root/work.txt"}
                    ]},
                    {"kind": "pause", "millis": 100}
                ]
            },
            {
                "name": "collect",
                "continue_on_partial_failure": true,
                "steps": [{"kind": "fetch", "remote_path": "/root/cc_results_w0.ndjson", "local_dir": "raw", "optional": true}]
            }
        ]
    }"#;

    #[test]
    fn parsea_plan_completo() {
        let plan: PlanDef = serde_json::from_str(PLAN).unwrap();
        plan.validate().unwrap();

        assert_eq!(plan.batch_size_or_default(), 8);
        assert_eq!(plan.marker_path_or_default(), DEFAULT_MARKER_PATH);
        assert_eq!(plan.phases.len(), 3);
        assert!(plan.phases[0].guarded);
        assert_eq!(plan.phases[0].failure_threshold, 0.0);
        assert!(!plan.phases[0].continue_on_partial_failure);

        match &plan.phases[1].steps[0] {
            StepDef::Push { artifacts, timeout_secs } => {
                assert_eq!(artifacts.len(), 2);
                assert!(matches!(artifacts[1].source, ArtifactSource::Assignment));
                assert!(*timeout_secs > 0);
            }
            other => panic!("paso inesperado: {other:?}"),
        }
        assert_eq!(plan.phases[2].steps[0].label(), "fetch");
    }

    #[test]
    fn validate_rechaza_planes_invalidos() {
        let mut plan: PlanDef = serde_json::from_str(PLAN).unwrap();
        plan.phases[1].name = "stop".into();
        assert_eq!(plan.validate(), Err(PlanError::DuplicatePhase("stop".into())));

        let mut plan: PlanDef = serde_json::from_str(PLAN).unwrap();
        plan.phases[0].failure_threshold = 1.5;
        assert!(matches!(plan.validate(), Err(PlanError::InvalidThreshold { .. })));

        let mut plan: PlanDef = serde_json::from_str(PLAN).unwrap();
        plan.batch_size = Some(0);
        assert_eq!(plan.validate(), Err(PlanError::ZeroBatchSize));

        let mut plan: PlanDef = serde_json::from_str(PLAN).unwrap();
        plan.phases.clear();
        assert_eq!(plan.validate(), Err(PlanError::NoPhases));

        let mut plan: PlanDef = serde_json::from_str(PLAN).unwrap();
        plan.phases[0].steps = vec![StepDef::Exec {
            command: "true".into(),
            timeout_secs: 0,
        }];
        assert_eq!(plan.validate(), Err(PlanError::ZeroTimeout("stop".into())));
    }

    #[test]
    fn plan_de_demos_es_valido() {
        let plan: PlanDef = serde_json::from_str(include_str!("../../demos/plan.json")).unwrap();
        plan.validate().unwrap();

        let guarded: Vec<&str> = plan
            .phases
            .iter()
            .filter(|p| p.guarded)
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(guarded, vec!["stop", "deploy", "launch", "verify"]);
        assert!(plan.phases[4].continue_on_partial_failure);

        // collect trae un archivo por worker de extract_v4.py
        let fetched: Vec<&str> = plan.phases[4]
            .steps
            .iter()
            .filter_map(|step| match step {
                StepDef::Fetch { remote_path, .. } => Some(remote_path.as_str()),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (0..4).map(|w| format!("/root/cc_results_w{w}.ndjson")).collect();
        assert_eq!(fetched, expected);
    }

    #[test]
    fn expand_node_placeholder_reemplaza_id() {
        assert_eq!(
            expand_node_placeholder("chunks/chunk_{node_id}.txt", 12),
            "chunks/chunk_12.txt"
        );
        assert_eq!(expand_node_placeholder("/root/extract.py", 12), "/root/extract.py");
    }
}
