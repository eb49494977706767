use std::{future::Future, sync::Arc};

use fleet_common::{FailureReason, Node, NodeId, NodeResult, Outcome, PlanError, ProgressReport};
use tracing::{debug, warn};

use crate::{ops::Operation, progress::ProgressSink};

/// Valor que produce una tarea por nodo al terminar.
pub trait Settled: Send + 'static {
    /// Lo que se registra si la tarea entró en pánico.
    fn panicked(detail: String) -> Self;

    fn report(&self, node_id: NodeId, phase: &str) -> ProgressReport;
}

impl Settled for Outcome {
    fn panicked(detail: String) -> Self {
        Outcome::failure(FailureReason::LocalError, detail, 0)
    }

    fn report(&self, node_id: NodeId, phase: &str) -> ProgressReport {
        ProgressReport::from_outcome(node_id, phase, self)
    }
}

impl Settled for NodeResult {
    fn panicked(detail: String) -> Self {
        NodeResult::Ran {
            outcome: Outcome::panicked(detail),
        }
    }

    fn report(&self, node_id: NodeId, phase: &str) -> ProgressReport {
        ProgressReport::from_result(node_id, phase, self)
    }
}

/// Corta la lista en batches contiguos de `batch_size` (el último puede
/// ser más chico). Conserva el orden y no repite ni omite nodos.
pub fn partition(nodes: &[Node], batch_size: usize) -> Result<Vec<&[Node]>, PlanError> {
    if batch_size == 0 {
        return Err(PlanError::ZeroBatchSize);
    }
    Ok(nodes.chunks(batch_size).collect())
}

/// Corre `task` sobre cada nodo, un batch a la vez. Dentro del batch cada
/// nodo es una tarea de tokio; el siguiente batch arranca cuando todas
/// terminaron. Un fallo (o un pánico) nunca corta el batch ni los que
/// siguen. Los resultados salen en el orden de entrada.
pub async fn run_batched<T, F, Fut>(
    nodes: &[Node],
    batch_size: usize,
    phase: &str,
    sink: &dyn ProgressSink,
    task: F,
) -> Result<Vec<(Node, T)>, PlanError>
where
    T: Settled,
    F: Fn(Node) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    let batches = partition(nodes, batch_size)?;
    let total = batches.len();
    let mut results = Vec::with_capacity(nodes.len());

    for (idx, batch) in batches.into_iter().enumerate() {
        debug!("[{}] batch {}/{} ({} nodos)", phase, idx + 1, total, batch.len());

        let handles: Vec<_> = batch
            .iter()
            .map(|node| (node.clone(), tokio::spawn(task(node.clone()))))
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (node, handle) in handles {
            let value = match handle.await {
                Ok(v) => v,
                Err(e) => {
                    warn!("[{}] la tarea de {} terminó sin resultado: {}", phase, node.label(), e);
                    T::panicked(format!("la tarea terminó sin resultado: {e}"))
                }
            };
            reports.push(value.report(node.id, phase));
            results.push((node, value));
        }

        sink.batch_settled(phase, idx + 1, total, &reports);
    }

    Ok(results)
}

/// Corre una operación sobre todos los nodos en batches.
pub async fn run(
    nodes: &[Node],
    operation: Arc<dyn Operation>,
    batch_size: usize,
    phase: &str,
    sink: &dyn ProgressSink,
) -> Result<Vec<(Node, Outcome)>, PlanError> {
    run_batched(nodes, batch_size, phase, sink, |node| {
        let op = operation.clone();
        async move { op.run(&node).await }
    })
    .await
}
