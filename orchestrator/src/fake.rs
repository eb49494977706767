//! Transporte en memoria para tests. Simula el marcador de setup y un
//! sistema de archivos remoto mínimo.

use std::{
    collections::HashSet,
    path::Path,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use fleet_common::{FailureReason, Node, NodeId, Outcome};

use crate::transport::Transport;

type Rule = Box<dyn Fn(&Node, &str) -> Outcome + Send + Sync>;

pub struct FakeTransport {
    rule: Rule,
    markers: Mutex<HashSet<NodeId>>,
    missing: HashSet<String>,
    probe_failure: Option<FailureReason>,
    calls: Mutex<Vec<(NodeId, String)>>,
    pushed: Mutex<Vec<(NodeId, String, Vec<u8>)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::with_rule(|_, _| Outcome::success("", 1))
    }

    pub fn with_rule(rule: impl Fn(&Node, &str) -> Outcome + Send + Sync + 'static) -> Self {
        Self {
            rule: Box::new(rule),
            markers: Mutex::new(HashSet::new()),
            missing: HashSet::new(),
            probe_failure: None,
            calls: Mutex::new(Vec::new()),
            pushed: Mutex::new(Vec::new()),
        }
    }

    pub fn missing_remote(mut self, path: &str) -> Self {
        self.missing.insert(path.to_string());
        self
    }

    pub fn failing_probe(mut self, reason: FailureReason) -> Self {
        self.probe_failure = Some(reason);
        self
    }

    pub fn set_marker(&self, id: NodeId) {
        self.markers.lock().unwrap().insert(id);
    }

    pub fn has_marker(&self, id: NodeId) -> bool {
        self.markers.lock().unwrap().contains(&id)
    }

    pub fn commands_for(&self, id: NodeId) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| *n == id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn pushed_for(&self, id: NodeId) -> Vec<(String, Vec<u8>)> {
        self.pushed
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _, _)| *n == id)
            .map(|(_, p, b)| (p.clone(), b.clone()))
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, node: &Node, command: &str, _timeout: Duration) -> Outcome {
        self.calls.lock().unwrap().push((node.id, command.to_string()));

        if command.starts_with("test -e ") {
            if let Some(reason) = self.probe_failure {
                return Outcome::failure(reason, "sonda caída", 1);
            }
            return if self.has_marker(node.id) {
                Outcome::success("", 1)
            } else {
                Outcome::failure(FailureReason::NonzeroExit, "exit 1", 1)
            };
        }
        if command.contains("touch -- ") {
            self.set_marker(node.id);
            return Outcome::success("", 1);
        }
        if command.starts_with("rm -f ") {
            self.markers.lock().unwrap().remove(&node.id);
            return Outcome::success("", 1);
        }

        (self.rule)(node, command)
    }

    async fn transfer(
        &self,
        node: &Node,
        blob: &[u8],
        remote_path: &str,
        _timeout: Duration,
    ) -> Outcome {
        self.pushed
            .lock()
            .unwrap()
            .push((node.id, remote_path.to_string(), blob.to_vec()));
        Outcome::success(format!("{} bytes", blob.len()), 1)
    }

    async fn fetch(
        &self,
        node: &Node,
        remote_path: &str,
        local_path: &Path,
        _timeout: Duration,
    ) -> Outcome {
        if self.missing.contains(remote_path) {
            return Outcome::failure(FailureReason::NonzeroExit, "exit 1: No such file", 1);
        }
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(local_path, format!("{{\"node\":{}}}\n", node.id)).unwrap();
        Outcome::success("ok", 1)
    }
}
