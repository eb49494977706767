use thiserror::Error;

use crate::node::NodeId;

/// Errores de configuración que abortan antes de cualquier llamada remota.
///
/// Todo lo que pasa *durante* la ejecución en un nodo se guarda como dato
/// (`Outcome`), nunca como error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("el inventario está vacío")]
    EmptyInventory,

    #[error("id de nodo duplicado en el inventario: {0}")]
    DuplicateNodeId(NodeId),

    #[error("el nodo {0} no tiene dirección")]
    MissingAddress(NodeId),

    #[error("batch_size debe ser >= 1")]
    ZeroBatchSize,

    #[error("el plan no tiene fases")]
    NoPhases,

    #[error("fase duplicada en el plan: {0}")]
    DuplicatePhase(String),

    #[error("la fase {0} no tiene pasos")]
    EmptyPhase(String),

    #[error("failure_threshold de la fase {phase} fuera de [0, 1]: {value}")]
    InvalidThreshold { phase: String, value: f64 },

    #[error("timeout_secs debe ser positivo (fase {0})")]
    ZeroTimeout(String),
}
