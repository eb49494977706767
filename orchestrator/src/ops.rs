use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use fleet_common::{
    plan::expand_node_placeholder, ArtifactDef, ArtifactSource, FailureReason, Node, NodeId,
    Outcome, StepDef,
};
use tracing::debug;

use crate::transport::Transport;

/// Acción sobre un nodo. Tiene que poder correrse varias veces sin romper
/// nada: el pipeline no reintenta, pero el operador sí.
#[async_trait]
pub trait Operation: Send + Sync {
    async fn run(&self, node: &Node) -> Outcome;
}

/// Nombre local de un archivo traído de un nodo: `node_0007_results.ndjson`.
/// El id con ceros a la izquierda hace que el orden lexicográfico coincida
/// con el orden por id.
pub fn fetched_file_name(node_id: NodeId, remote_path: &str) -> String {
    let base = Path::new(remote_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    format!("node_{node_id:04}_{base}")
}

/// Secuencia de pasos de una fase. Corre en orden y se corta en el primer
/// fallo.
pub struct StepSequence {
    transport: Arc<dyn Transport>,
    steps: Vec<StepDef>,
}

impl StepSequence {
    pub fn new(transport: Arc<dyn Transport>, steps: Vec<StepDef>) -> Self {
        Self { transport, steps }
    }

    async fn run_step(&self, node: &Node, step: &StepDef) -> Outcome {
        match step {
            StepDef::Exec {
                command,
                timeout_secs,
            } => {
                self.transport
                    .execute(node, command, Duration::from_secs(*timeout_secs))
                    .await
            }
            StepDef::Push {
                artifacts,
                timeout_secs,
            } => self.push(node, artifacts, Duration::from_secs(*timeout_secs)).await,
            StepDef::Fetch {
                remote_path,
                local_dir,
                optional,
                timeout_secs,
            } => {
                let dir = PathBuf::from(expand_node_placeholder(local_dir, node.id));
                let local = dir.join(fetched_file_name(node.id, remote_path));
                let outcome = self
                    .transport
                    .fetch(node, remote_path, &local, Duration::from_secs(*timeout_secs))
                    .await;
                match outcome {
                    Outcome::Failure {
                        reason: FailureReason::NonzeroExit,
                        elapsed_ms,
                        ..
                    } if *optional => Outcome::success("sin salida remota", elapsed_ms),
                    other => other,
                }
            }
            StepDef::Pause { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
                Outcome::success("", *millis)
            }
        }
    }

    async fn push(&self, node: &Node, artifacts: &[ArtifactDef], timeout: Duration) -> Outcome {
        let started = Instant::now();
        let mut done = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            let blob = match artifact_blob(artifact, node).await {
                Ok(b) => b,
                Err(detail) => {
                    return Outcome::failure(
                        FailureReason::LocalError,
                        detail,
                        started.elapsed().as_millis() as u64,
                    )
                }
            };

            let outcome = self
                .transport
                .transfer(node, &blob, &artifact.remote_path, timeout)
                .await;
            if !outcome.is_success() {
                let detail = format!("{}: {}", artifact.name, outcome.detail());
                return Outcome::failure(
                    outcome.reason().unwrap_or(FailureReason::TransportError),
                    detail,
                    started.elapsed().as_millis() as u64,
                );
            }
            done.push(artifact.name.as_str());
        }

        Outcome::success(
            format!("subidos: {}", done.join(", ")),
            started.elapsed().as_millis() as u64,
        )
    }
}

/// Contenido del artefacto para este nodo.
async fn artifact_blob(artifact: &ArtifactDef, node: &Node) -> Result<Vec<u8>, String> {
    match &artifact.source {
        ArtifactSource::File { path } => {
            let path = expand_node_placeholder(path, node.id);
            tokio::fs::read(&path)
                .await
                .map_err(|e| format!("artefacto {} ({}): {}", artifact.name, path, e))
        }
        ArtifactSource::Assignment => match &node.assignment {
            Some(items) => {
                let mut body = items.join("\n");
                if !body.is_empty() {
                    body.push('\n');
                }
                Ok(body.into_bytes())
            }
            None => Err(format!(
                "artefacto {}: {} no tiene asignación",
                artifact.name,
                node.label()
            )),
        },
    }
}

#[async_trait]
impl Operation for StepSequence {
    async fn run(&self, node: &Node) -> Outcome {
        let mut elapsed_ms = 0;
        let mut outputs = Vec::new();

        for (i, step) in self.steps.iter().enumerate() {
            debug!("{} paso {} ({})", node.label(), i + 1, step.label());
            match self.run_step(node, step).await {
                Outcome::Success {
                    output,
                    elapsed_ms: ms,
                } => {
                    elapsed_ms += ms;
                    if !output.is_empty() {
                        outputs.push(output);
                    }
                }
                Outcome::Failure {
                    reason,
                    detail,
                    elapsed_ms: ms,
                } => {
                    return Outcome::failure(
                        reason,
                        format!("paso {} ({}): {}", i + 1, step.label(), detail),
                        elapsed_ms + ms,
                    )
                }
            }
        }

        Outcome::success(outputs.join(" | "), elapsed_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeTransport;
    use fleet_common::Credential;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("ops_tests").join(sub);
        let _ = std::fs::remove_dir_all(&base);
        std::fs::create_dir_all(&base).unwrap();
        base
    }

    fn node(id: NodeId) -> Node {
        Node::new(id, format!("10.0.0.{id}"), Credential::Password("pw".into()))
    }

    fn exec(command: &str) -> StepDef {
        StepDef::Exec {
            command: command.into(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn fetched_file_name_rellena_con_ceros() {
        assert_eq!(
            fetched_file_name(7, "/root/cc_results.ndjson"),
            "node_0007_cc_results.ndjson"
        );
        assert_eq!(fetched_file_name(123, "/"), "node_0123_output");
    }

    #[tokio::test]
    async fn corta_en_el_primer_fallo() {
        let transport = Arc::new(FakeTransport::with_rule(|_, cmd| {
            if cmd == "falla" {
                Outcome::failure(FailureReason::NonzeroExit, "exit 1", 3)
            } else {
                Outcome::success(cmd, 2)
            }
        }));
        let seq = StepSequence::new(
            transport.clone(),
            vec![exec("uno"), exec("falla"), exec("tres")],
        );

        let outcome = seq.run(&node(1)).await;

        assert_eq!(outcome.reason(), Some(FailureReason::NonzeroExit));
        assert_eq!(outcome.detail(), "paso 2 (exec): exit 1");
        assert_eq!(outcome.elapsed_ms(), 5);
        assert_eq!(transport.commands_for(1), vec!["uno", "falla"]);
    }

    #[tokio::test]
    async fn push_resuelve_placeholder_y_asignacion() {
        let dir = temp_dir("push");
        std::fs::write(dir.join("chunk_3.txt"), "a\nb\n").unwrap();

        let transport = Arc::new(FakeTransport::new());
        let steps = vec![StepDef::Push {
            artifacts: vec![
                ArtifactDef {
                    name: "chunk".into(),
                    source: ArtifactSource::File {
                        path: format!("{}/chunk_{{node_id}}.txt", dir.display()),
                    },
                    remote_path: "/root/my_wet_files.txt".into(),
                },
                ArtifactDef {
                    name: "work".into(),
                    source: ArtifactSource::Assignment,
                    remote_path: "/root/work.txt".into(),
                },
            ],
            timeout_secs: 5,
        }];
        let seq = StepSequence::new(transport.clone(), steps);
        let n = node(3).with_assignment(vec!["x".into(), "y".into()]);

        let outcome = seq.run(&n).await;

        assert!(outcome.is_success(), "{outcome:?}");
        let pushed = transport.pushed_for(3);
        assert_eq!(pushed[0], ("/root/my_wet_files.txt".to_string(), b"a\nb\n".to_vec()));
        assert_eq!(pushed[1], ("/root/work.txt".to_string(), b"x\ny\n".to_vec()));
    }

    #[tokio::test]
    async fn push_sin_archivo_local_es_local_error() {
        let transport = Arc::new(FakeTransport::new());
        let steps = vec![StepDef::Push {
            artifacts: vec![ArtifactDef {
                name: "chunk".into(),
                source: ArtifactSource::File {
                    path: "/no/existe/chunk_{node_id}.txt".into(),
                },
                remote_path: "/root/chunk.txt".into(),
            }],
            timeout_secs: 5,
        }];
        let seq = StepSequence::new(transport.clone(), steps);

        let outcome = seq.run(&node(9)).await;

        assert_eq!(outcome.reason(), Some(FailureReason::LocalError));
        assert!(outcome.detail().contains("chunk_9.txt"));
        assert!(transport.pushed_for(9).is_empty());
    }

    #[tokio::test]
    async fn push_de_asignacion_faltante_es_local_error() {
        let transport = Arc::new(FakeTransport::new());
        let steps = vec![StepDef::Push {
            artifacts: vec![ArtifactDef {
                name: "work".into(),
                source: ArtifactSource::Assignment,
                remote_path: "/root/work.txt".into(),
            }],
            timeout_secs: 5,
        }];

        let outcome = StepSequence::new(transport, steps).run(&node(2)).await;
        assert_eq!(outcome.reason(), Some(FailureReason::LocalError));
    }

    #[tokio::test]
    async fn fetch_opcional_tolera_archivo_remoto_faltante() {
        let dir = temp_dir("fetch");
        let transport = Arc::new(FakeTransport::new().missing_remote("/root/none.ndjson"));
        let fetch = |path: &str, optional: bool| StepDef::Fetch {
            remote_path: path.into(),
            local_dir: dir.display().to_string(),
            optional,
            timeout_secs: 5,
        };

        let seq = StepSequence::new(
            transport.clone(),
            vec![fetch("/root/cc_results.ndjson", false), fetch("/root/none.ndjson", true)],
        );
        let outcome = seq.run(&node(5)).await;
        assert!(outcome.is_success(), "{outcome:?}");
        assert!(dir.join("node_0005_cc_results.ndjson").exists());

        let strict = StepSequence::new(transport, vec![fetch("/root/none.ndjson", false)]);
        let outcome = strict.run(&node(5)).await;
        assert_eq!(outcome.reason(), Some(FailureReason::NonzeroExit));
    }

    #[tokio::test]
    async fn pause_suma_al_tiempo() {
        let transport = Arc::new(FakeTransport::new());
        let seq = StepSequence::new(transport, vec![StepDef::Pause { millis: 20 }, exec("ok")]);
        let outcome = seq.run(&node(1)).await;
        assert!(outcome.is_success());
        assert!(outcome.elapsed_ms() >= 20);
    }
}
