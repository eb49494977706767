use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Motivo de fallo distinguible por máquina.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// Se venció el deadline de la llamada.
    Timeout,
    /// El nodo rechazó la credencial.
    AuthFailed,
    /// Conexión, resolución o lanzamiento del cliente SSH.
    TransportError,
    /// El comando corrió pero terminó con código != 0.
    NonzeroExit,
    /// Falló algo local antes de tocar el nodo (artefacto faltante, tarea caída...).
    LocalError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::AuthFailed => "auth-failed",
            FailureReason::TransportError => "transport-error",
            FailureReason::NonzeroExit => "nonzero-exit",
            FailureReason::LocalError => "local-error",
        }
    }

    /// Errores de transporte y de tiempo se pueden reintentar con otra corrida.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::Timeout | FailureReason::AuthFailed | FailureReason::TransportError
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resultado de una operación sobre un nodo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        output: String,
        elapsed_ms: u64,
    },
    Failure {
        reason: FailureReason,
        detail: String,
        elapsed_ms: u64,
    },
}

impl Outcome {
    pub fn success(output: impl Into<String>, elapsed_ms: u64) -> Self {
        Outcome::Success {
            output: output.into(),
            elapsed_ms,
        }
    }

    pub fn failure(reason: FailureReason, detail: impl Into<String>, elapsed_ms: u64) -> Self {
        Outcome::Failure {
            reason,
            detail: detail.into(),
            elapsed_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Failure { reason, .. } => Some(*reason),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        match self {
            Outcome::Success { elapsed_ms, .. } | Outcome::Failure { elapsed_ms, .. } => *elapsed_ms,
        }
    }

    /// Salida en caso de éxito, detalle del error en caso de fallo.
    pub fn detail(&self) -> &str {
        match self {
            Outcome::Success { output, .. } => output,
            Outcome::Failure { detail, .. } => detail,
        }
    }
}

/* --------- Estado de cada nodo dentro del pipeline --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    /// Transiciones válidas de la máquina de estados por fase.
    /// `Skipped` es terminal y sólo se alcanza desde `Failed`.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Skipped, _) => false,
            (Pending, Running) => true,
            (Running, Succeeded) | (Running, Failed) => true,
            // siguiente fase
            (Succeeded, Running) | (Failed, Running) => true,
            (Failed, Skipped) => true,
            _ => false,
        }
    }
}

/// Lo que le pasó a un nodo en una fase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NodeResult {
    /// La operación de la fase se ejecutó.
    Ran { outcome: Outcome },
    /// El marcador de setup ya existía; no se ejecutó nada.
    AlreadyDone { elapsed_ms: u64 },
    /// El nodo falló una fase requerida anterior.
    Skipped { after_phase: String },
}

impl NodeResult {
    pub fn state(&self) -> NodeState {
        match self {
            NodeResult::Ran { outcome } if outcome.is_success() => NodeState::Succeeded,
            NodeResult::Ran { .. } => NodeState::Failed,
            NodeResult::AlreadyDone { .. } => NodeState::Succeeded,
            NodeResult::Skipped { .. } => NodeState::Skipped,
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            NodeResult::Ran { outcome } => Some(outcome),
            _ => None,
        }
    }
}

/// Largo máximo del detalle en una línea de progreso.
const PROGRESS_DETAIL_MAX_CHARS: usize = 200;

/// Se queda con el final del texto, que es lo que suele importar.
fn shorten(text: &str, max: usize) -> String {
    let text = text.trim();
    let count = text.chars().count();
    if count <= max {
        text.to_string()
    } else {
        format!("…{}", text.chars().skip(count - max).collect::<String>())
    }
}

/// Reporte por nodo que se emite al cerrar cada batch. El detalle va
/// recortado; la salida completa queda en el `Outcome`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub node_id: NodeId,
    pub phase: String,
    pub ok: bool,
    pub detail: String,
    pub elapsed_ms: u64,
}

impl ProgressReport {
    pub fn from_outcome(node_id: NodeId, phase: &str, outcome: &Outcome) -> Self {
        let detail = match outcome {
            Outcome::Success { output, .. } => shorten(output, PROGRESS_DETAIL_MAX_CHARS),
            Outcome::Failure { reason, detail, .. } => {
                format!("{reason}: {}", shorten(detail, PROGRESS_DETAIL_MAX_CHARS))
            }
        };
        Self {
            node_id,
            phase: phase.to_string(),
            ok: outcome.is_success(),
            detail,
            elapsed_ms: outcome.elapsed_ms(),
        }
    }

    pub fn from_result(node_id: NodeId, phase: &str, result: &NodeResult) -> Self {
        match result {
            NodeResult::Ran { outcome } => Self::from_outcome(node_id, phase, outcome),
            NodeResult::AlreadyDone { elapsed_ms } => Self {
                node_id,
                phase: phase.to_string(),
                ok: true,
                detail: "setup ya completo (marcador presente)".to_string(),
                elapsed_ms: *elapsed_ms,
            },
            NodeResult::Skipped { after_phase } => Self {
                node_id,
                phase: phase.to_string(),
                ok: false,
                detail: format!("omitido: falló la fase {after_phase}"),
                elapsed_ms: 0,
            },
        }
    }
}

/// Resultado de una fase completa. Una vez construido no se modifica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase_name: String,
    pub per_node: BTreeMap<NodeId, NodeResult>,
    pub succeeded_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    /// Subconjunto de `succeeded_count` resuelto por el marcador.
    pub already_done_count: u32,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PhaseResult {
    pub fn new(
        phase_name: impl Into<String>,
        per_node: BTreeMap<NodeId, NodeResult>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let mut succeeded_count = 0;
        let mut failed_count = 0;
        let mut skipped_count = 0;
        let mut already_done_count = 0;

        for result in per_node.values() {
            match result.state() {
                NodeState::Succeeded => succeeded_count += 1,
                NodeState::Failed => failed_count += 1,
                NodeState::Skipped => skipped_count += 1,
                NodeState::Pending | NodeState::Running => {}
            }
            if matches!(result, NodeResult::AlreadyDone { .. }) {
                already_done_count += 1;
            }
        }

        Self {
            phase_name: phase_name.into(),
            per_node,
            succeeded_count,
            failed_count,
            skipped_count,
            already_done_count,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Fallidos sobre nodos que efectivamente corrieron la fase. Los resueltos
    /// por el marcador no cuentan.
    pub fn failure_rate(&self) -> f64 {
        let ran = (self.succeeded_count - self.already_done_count) + self.failed_count;
        if ran == 0 {
            0.0
        } else {
            self.failed_count as f64 / ran as f64
        }
    }

    pub fn failed_nodes(&self) -> Vec<NodeId> {
        self.per_node
            .iter()
            .filter(|(_, r)| r.state() == NodeState::Failed)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn state_of(&self, node_id: NodeId) -> Option<NodeState> {
        self.per_node.get(&node_id).map(NodeResult::state)
    }
}
