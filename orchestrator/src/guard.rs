use std::{path::Path, sync::Arc, time::Duration};

use fleet_common::{FailureReason, Node, Outcome};
use tracing::{debug, warn};

use crate::transport::{shell_quote, Transport};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Marcador remoto de "setup completo". Su existencia es la única señal;
/// nunca se mira la salida de los comandos.
pub struct IdempotencyGuard {
    transport: Arc<dyn Transport>,
    marker_path: String,
    probe_timeout: Duration,
}

impl IdempotencyGuard {
    pub fn new(transport: Arc<dyn Transport>, marker_path: impl Into<String>) -> Self {
        Self {
            transport,
            marker_path: marker_path.into(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn marker_path(&self) -> &str {
        &self.marker_path
    }

    /// true sólo si el marcador existe. Cualquier otra cosa (incluso un
    /// error de transporte) cuenta como "hay que hacer el setup".
    pub async fn should_skip_setup(&self, node: &Node) -> bool {
        let command = format!("test -e {}", shell_quote(&self.marker_path));
        match self.transport.execute(node, &command, self.probe_timeout).await {
            Outcome::Success { .. } => {
                debug!("{} ya tiene {}", node.label(), self.marker_path);
                true
            }
            Outcome::Failure {
                reason: FailureReason::NonzeroExit,
                ..
            } => false,
            Outcome::Failure { reason, detail, .. } => {
                warn!(
                    "{}: no se pudo consultar el marcador ({}: {}); se rehace el setup",
                    node.label(),
                    reason,
                    detail
                );
                false
            }
        }
    }

    pub async fn mark_complete(&self, node: &Node) -> Outcome {
        let marker = shell_quote(&self.marker_path);
        let command = match Path::new(&self.marker_path).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => format!(
                "mkdir -p -- {} && touch -- {}",
                shell_quote(&dir.to_string_lossy()),
                marker
            ),
            _ => format!("touch -- {marker}"),
        };
        self.transport.execute(node, &command, self.probe_timeout).await
    }

    pub async fn clear(&self, node: &Node) -> Outcome {
        let command = format!("rm -f -- {}", shell_quote(&self.marker_path));
        self.transport.execute(node, &command, self.probe_timeout).await
    }
}
