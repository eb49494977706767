use std::sync::{Mutex, PoisonError};

use fleet_common::ProgressReport;
use tracing::{info, warn};

/// Recibe los reportes por nodo al cerrar cada batch.
pub trait ProgressSink: Send + Sync {
    /// `batch` es 1-based.
    fn batch_settled(&self, phase: &str, batch: usize, total: usize, reports: &[ProgressReport]);

    /// Nodos que no corren la fase por haber fallado una fase requerida.
    fn nodes_skipped(&self, _phase: &str, _reports: &[ProgressReport]) {}
}

/// Sink por defecto: todo a `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn batch_settled(&self, phase: &str, batch: usize, total: usize, reports: &[ProgressReport]) {
        let ok = reports.iter().filter(|r| r.ok).count();
        info!(
            "[{}] batch {}/{}: {} ok, {} con fallo",
            phase,
            batch,
            total,
            ok,
            reports.len() - ok
        );
        for r in reports {
            if r.ok {
                info!("  ✅ node-{:02} ({} ms) {}", r.node_id, r.elapsed_ms, r.detail);
            } else {
                warn!("  ❌ node-{:02} ({} ms) {}", r.node_id, r.elapsed_ms, r.detail);
            }
        }
    }

    fn nodes_skipped(&self, phase: &str, reports: &[ProgressReport]) {
        for r in reports {
            warn!("[{}] ⏭ node-{:02} {}", phase, r.node_id, r.detail);
        }
    }
}

/// Guarda todo en memoria; pensado para tests y para resúmenes al final.
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<ProgressReport>>,
    skipped: Mutex<Vec<ProgressReport>>,
    batches: Mutex<Vec<(String, usize, usize)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ProgressReport> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn skipped(&self) -> Vec<ProgressReport> {
        self.skipped.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// `(fase, batch, total)` en el orden en que cerraron.
    pub fn batches(&self) -> Vec<(String, usize, usize)> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ProgressSink for CollectingSink {
    fn batch_settled(&self, phase: &str, batch: usize, total: usize, reports: &[ProgressReport]) {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((phase.to_string(), batch, total));
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(reports);
    }

    fn nodes_skipped(&self, _phase: &str, reports: &[ProgressReport]) {
        self.skipped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(reports);
    }
}
