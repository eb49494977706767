use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use chrono::{DateTime, Utc};
use fleet_common::{
    validate_inventory, Node, NodeId, NodeResult, NodeState, PhaseResult, PlanDef, PlanError,
    ProgressReport,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    guard::IdempotencyGuard,
    ops::{Operation, StepSequence},
    progress::{ProgressSink, TracingSink},
    runner,
    transport::Transport,
};

/// Una fase del pipeline.
#[derive(Clone)]
pub struct PhaseSpec {
    pub name: String,
    pub operation: Arc<dyn Operation>,
    /// Si es false y la tasa de fallos supera `failure_threshold`, los nodos
    /// que fallaron se saltean en todas las fases siguientes.
    pub continue_on_partial_failure: bool,
    pub failure_threshold: f64,
    /// Fase de setup: se omite en nodos con el marcador presente.
    pub guarded: bool,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, operation: Arc<dyn Operation>) -> Self {
        Self {
            name: name.into(),
            operation,
            continue_on_partial_failure: false,
            failure_threshold: 0.0,
            guarded: false,
        }
    }

    pub fn with_guard(mut self) -> Self {
        self.guarded = true;
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.continue_on_partial_failure = true;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold;
        self
    }
}

/// Arma las fases de un plan JSON sobre un transporte.
pub fn phases_from_plan(plan: &PlanDef, transport: Arc<dyn Transport>) -> Vec<PhaseSpec> {
    plan.phases
        .iter()
        .map(|def| PhaseSpec {
            name: def.name.clone(),
            operation: Arc::new(StepSequence::new(transport.clone(), def.steps.clone())),
            continue_on_partial_failure: def.continue_on_partial_failure,
            failure_threshold: def.failure_threshold,
            guarded: def.guarded,
        })
        .collect()
}

pub struct PipelineOptions {
    pub batch_size: usize,
    pub guard: Option<Arc<IdempotencyGuard>>,
    pub sink: Arc<dyn ProgressSink>,
}

impl PipelineOptions {
    /// Sin guardia y con el progreso a `tracing`.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            guard: None,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_guard(mut self, guard: Arc<IdempotencyGuard>) -> Self {
        self.guard = Some(guard);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseResult>,
    /// Estado final de cada nodo: `SKIPPED` si se salteó en alguna fase,
    /// `FAILED` si falló alguna, `SUCCEEDED` si no.
    pub final_states: BTreeMap<NodeId, NodeState>,
}

impl PipelineReport {
    pub fn phase(&self, name: &str) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase_name == name)
    }

    pub fn nodes_in(&self, state: NodeState) -> Vec<NodeId> {
        self.final_states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.final_states.values().all(|s| *s == NodeState::Succeeded)
    }

    /// Nodos con algún fallo de red, auth o timeout: vale la pena otra corrida.
    pub fn retryable_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .phases
            .iter()
            .flat_map(|phase| phase.per_node.iter())
            .filter(|(_, result)| {
                result
                    .outcome()
                    .and_then(|o| o.reason())
                    .is_some_and(|reason| reason.is_retryable())
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Avanza la máquina de estados del nodo. Una transición inválida se
/// loguea y no cambia el estado.
fn advance(states: &mut HashMap<NodeId, NodeState>, phase: &str, id: NodeId, next: NodeState) -> bool {
    let current = states.get(&id).copied().unwrap_or(NodeState::Pending);
    if current.can_transition_to(next) {
        debug!("[{}] node-{:02}: {:?} -> {:?}", phase, id, current, next);
        states.insert(id, next);
        true
    } else {
        warn!("[{}] node-{:02}: transición inválida {:?} -> {:?}", phase, id, current, next);
        false
    }
}

fn validate_phases(phases: &[PhaseSpec]) -> Result<(), PlanError> {
    if phases.is_empty() {
        return Err(PlanError::NoPhases);
    }
    let mut names = HashSet::new();
    for phase in phases {
        if !names.insert(phase.name.as_str()) {
            return Err(PlanError::DuplicatePhase(phase.name.clone()));
        }
        if !(0.0..=1.0).contains(&phase.failure_threshold) {
            return Err(PlanError::InvalidThreshold {
                phase: phase.name.clone(),
                value: phase.failure_threshold,
            });
        }
    }
    Ok(())
}

/* --------- Tarea por nodo dentro de una fase --------- */

struct PhaseTask {
    operation: Arc<dyn Operation>,
    /// Sólo en fases con guardia.
    guard: Option<Arc<IdempotencyGuard>>,
    /// Respuesta de la sonda por nodo, válida para toda la corrida.
    probes: Arc<Mutex<HashMap<NodeId, bool>>>,
    /// Última fase con guardia: acá se escribe el marcador.
    write_marker: bool,
    /// Nodos que corrieron y terminaron bien todas las fases con guardia
    /// anteriores.
    eligible: Arc<HashSet<NodeId>>,
}

impl PhaseTask {
    async fn already_done(&self, guard: &IdempotencyGuard, node: &Node) -> bool {
        let cached = self
            .probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node.id)
            .copied();
        if let Some(done) = cached {
            return done;
        }

        // cada nodo sólo se sondea desde su propia tarea; no hay carrera
        let done = guard.should_skip_setup(node).await;
        self.probes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.id, done);
        done
    }

    async fn run(&self, node: Node) -> NodeResult {
        let started = Instant::now();

        if let Some(guard) = &self.guard {
            if self.already_done(guard, &node).await {
                return NodeResult::AlreadyDone {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
            }
        }

        let outcome = self.operation.run(&node).await;

        if self.write_marker && outcome.is_success() && self.eligible.contains(&node.id) {
            if let Some(guard) = &self.guard {
                let marked = guard.mark_complete(&node).await;
                if marked.is_success() {
                    info!("{}: setup completo, marcador escrito", node.label());
                } else {
                    warn!(
                        "{}: no se pudo escribir el marcador ({}); el setup se repetirá",
                        node.label(),
                        marked.detail()
                    );
                }
            }
        }

        NodeResult::Ran { outcome }
    }
}

/* --------- Pipeline --------- */

/// Corre las fases en orden sobre el inventario. Los errores de
/// configuración abortan antes de cualquier llamada remota; lo que pasa en
/// cada nodo queda en el reporte.
pub async fn run_pipeline(
    nodes: &[Node],
    phases: &[PhaseSpec],
    options: &PipelineOptions,
) -> Result<PipelineReport, PlanError> {
    validate_inventory(nodes)?;
    if options.batch_size == 0 {
        return Err(PlanError::ZeroBatchSize);
    }
    validate_phases(phases)?;

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(
        "🚀 corrida {}: {} nodos, {} fases, batch de {}",
        run_id,
        nodes.len(),
        phases.len(),
        options.batch_size
    );

    let last_guarded = phases.iter().rposition(|p| p.guarded);
    let probes = Arc::new(Mutex::new(HashMap::new()));

    let mut states: HashMap<NodeId, NodeState> = HashMap::new();
    // nodo -> fase tras la cual quedó afuera
    let mut skipped: BTreeMap<NodeId, String> = BTreeMap::new();
    let mut guarded_clean: HashSet<NodeId> = nodes.iter().map(|n| n.id).collect();
    let mut results = Vec::with_capacity(phases.len());

    for (idx, phase) in phases.iter().enumerate() {
        let phase_started = Utc::now();
        info!("▶ fase {}/{}: {}", idx + 1, phases.len(), phase.name);

        let mut per_node = BTreeMap::new();
        let mut skip_reports = Vec::new();
        for (id, after_phase) in &skipped {
            let result = NodeResult::Skipped {
                after_phase: after_phase.clone(),
            };
            skip_reports.push(ProgressReport::from_result(*id, &phase.name, &result));
            per_node.insert(*id, result);
        }
        if !skip_reports.is_empty() {
            options.sink.nodes_skipped(&phase.name, &skip_reports);
        }

        let active: Vec<Node> = nodes
            .iter()
            .filter(|n| !skipped.contains_key(&n.id))
            .cloned()
            .collect();

        if !active.is_empty() {
            for node in &active {
                advance(&mut states, &phase.name, node.id, NodeState::Running);
            }

            let task = Arc::new(PhaseTask {
                operation: phase.operation.clone(),
                guard: if phase.guarded {
                    options.guard.clone()
                } else {
                    None
                },
                probes: probes.clone(),
                write_marker: phase.guarded && Some(idx) == last_guarded,
                eligible: Arc::new(guarded_clean.clone()),
            });

            let ran = runner::run_batched(
                &active,
                options.batch_size,
                &phase.name,
                options.sink.as_ref(),
                |node| {
                    let task = task.clone();
                    async move { task.run(node).await }
                },
            )
            .await?;

            for (node, result) in ran {
                advance(&mut states, &phase.name, node.id, result.state());
                let ran_ok = matches!(&result, NodeResult::Ran { outcome } if outcome.is_success());
                if phase.guarded && !ran_ok {
                    guarded_clean.remove(&node.id);
                }
                per_node.insert(node.id, result);
            }
        }

        let result = PhaseResult::new(&phase.name, per_node, phase_started);
        info!(
            "■ fase {}: {} ok ({} ya hechos), {} con fallo, {} omitidos",
            result.phase_name,
            result.succeeded_count,
            result.already_done_count,
            result.failed_count,
            result.skipped_count
        );

        if !phase.continue_on_partial_failure && result.failure_rate() > phase.failure_threshold {
            for id in result.failed_nodes() {
                warn!(
                    "node-{:02} falló {}; se omite en las fases siguientes",
                    id, phase.name
                );
                advance(&mut states, &phase.name, id, NodeState::Skipped);
                skipped.insert(id, phase.name.clone());
            }
        }

        results.push(result);
    }

    let final_states = nodes
        .iter()
        .map(|node| (node.id, final_state(node.id, &results)))
        .collect();

    let report = PipelineReport {
        run_id,
        started_at,
        finished_at: Utc::now(),
        phases: results,
        final_states,
    };
    info!(
        "🏁 corrida {} terminada: {} ok, {} con fallo, {} omitidos",
        report.run_id,
        report.nodes_in(NodeState::Succeeded).len(),
        report.nodes_in(NodeState::Failed).len(),
        report.nodes_in(NodeState::Skipped).len()
    );
    Ok(report)
}

fn final_state(id: NodeId, phases: &[PhaseResult]) -> NodeState {
    let states: Vec<NodeState> = phases.iter().filter_map(|p| p.state_of(id)).collect();
    if states.contains(&NodeState::Skipped) {
        NodeState::Skipped
    } else if states.contains(&NodeState::Failed) {
        NodeState::Failed
    } else {
        NodeState::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fake::FakeTransport, progress::CollectingSink};
    use async_trait::async_trait;
    use fleet_common::{Credential, FailureReason, Outcome};

    fn nodes(n: u32) -> Vec<Node> {
        (1..=n)
            .map(|id| Node::new(id, format!("10.0.0.{id}"), Credential::Password("pw".into())))
            .collect()
    }

    /// Falla en los nodos indicados y cuenta las invocaciones por nodo.
    #[derive(Default)]
    struct Scripted {
        fail_on: Vec<NodeId>,
        calls: Mutex<Vec<NodeId>>,
    }

    impl Scripted {
        fn failing(ids: &[NodeId]) -> Arc<Self> {
            Arc::new(Self {
                fail_on: ids.to_vec(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn ok() -> Arc<Self> {
            Self::failing(&[])
        }

        fn calls(&self) -> Vec<NodeId> {
            let mut calls = self.calls.lock().unwrap().clone();
            calls.sort();
            calls
        }
    }

    #[async_trait]
    impl Operation for Scripted {
        async fn run(&self, node: &Node) -> Outcome {
            self.calls.lock().unwrap().push(node.id);
            if self.fail_on.contains(&node.id) {
                Outcome::failure(FailureReason::NonzeroExit, "exit 1", 1)
            } else {
                Outcome::success("ok", 1)
            }
        }
    }

    fn options(batch_size: usize) -> (PipelineOptions, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        (PipelineOptions::new(batch_size).with_sink(sink.clone()), sink)
    }

    #[tokio::test]
    async fn escenario_de_punta_a_punta() {
        let stop = Scripted::failing(&[2]);
        let launch = Scripted::ok();
        let phases = vec![
            PhaseSpec::new("stop", stop.clone()),
            PhaseSpec::new("launch", launch.clone()),
        ];
        let (opts, sink) = options(2);

        let report = run_pipeline(&nodes(3), &phases, &opts).await.unwrap();

        let a = report.phase("stop").unwrap();
        assert_eq!((a.succeeded_count, a.failed_count, a.skipped_count), (2, 1, 0));
        let b = report.phase("launch").unwrap();
        assert_eq!((b.succeeded_count, b.failed_count, b.skipped_count), (2, 0, 1));
        assert_eq!(
            b.per_node[&2],
            NodeResult::Skipped {
                after_phase: "stop".into()
            }
        );

        assert_eq!(launch.calls(), vec![1, 3]);
        assert_eq!(report.final_states[&2], NodeState::Skipped);
        assert_eq!(report.nodes_in(NodeState::Succeeded), vec![1, 3]);
        assert!(!report.all_succeeded());

        let skipped: Vec<NodeId> = sink.skipped().iter().map(|r| r.node_id).collect();
        assert_eq!(skipped, vec![2]);
        // stop: 2 batches, launch: 1 batch (dos nodos activos)
        assert_eq!(sink.batches().len(), 3);
    }

    #[tokio::test]
    async fn fase_tolerante_no_saltea_nodos() {
        let phases = vec![
            PhaseSpec::new("collect", Scripted::failing(&[1])).tolerant(),
            PhaseSpec::new("report", Scripted::ok()),
        ];
        let (opts, _) = options(5);

        let report = run_pipeline(&nodes(3), &phases, &opts).await.unwrap();

        assert_eq!(report.phase("report").unwrap().skipped_count, 0);
        assert_eq!(report.final_states[&1], NodeState::Failed);
    }

    #[tokio::test]
    async fn umbral_de_fallos_decide_el_skip() {
        // 1 de 4 = 0.25, no supera 0.5
        let phases = vec![
            PhaseSpec::new("deploy", Scripted::failing(&[4])).with_threshold(0.5),
            PhaseSpec::new("launch", Scripted::ok()),
        ];
        let (opts, _) = options(2);
        let report = run_pipeline(&nodes(4), &phases, &opts).await.unwrap();
        assert_eq!(report.phase("launch").unwrap().skipped_count, 0);

        // 3 de 4 = 0.75, supera 0.5
        let phases = vec![
            PhaseSpec::new("deploy", Scripted::failing(&[1, 2, 3])).with_threshold(0.5),
            PhaseSpec::new("launch", Scripted::ok()),
        ];
        let report = run_pipeline(&nodes(4), &phases, &opts).await.unwrap();
        assert_eq!(report.phase("launch").unwrap().skipped_count, 3);
    }

    #[tokio::test]
    async fn errores_de_configuracion_no_tocan_nodos() {
        let op = Scripted::ok();
        let phase = || PhaseSpec::new("stop", op.clone());
        let (opts, _) = options(2);

        assert_eq!(
            run_pipeline(&[], &[phase()], &opts).await.unwrap_err(),
            PlanError::EmptyInventory
        );

        let mut dup = nodes(2);
        dup[1].id = 1;
        assert_eq!(
            run_pipeline(&dup, &[phase()], &opts).await.unwrap_err(),
            PlanError::DuplicateNodeId(1)
        );

        assert_eq!(
            run_pipeline(&nodes(2), &[], &opts).await.unwrap_err(),
            PlanError::NoPhases
        );
        assert_eq!(
            run_pipeline(&nodes(2), &[phase(), phase()], &opts).await.unwrap_err(),
            PlanError::DuplicatePhase("stop".into())
        );
        assert!(matches!(
            run_pipeline(&nodes(2), &[phase().with_threshold(2.0)], &opts).await,
            Err(PlanError::InvalidThreshold { .. })
        ));

        let (zero, _) = options(0);
        assert_eq!(
            run_pipeline(&nodes(2), &[phase()], &zero).await.unwrap_err(),
            PlanError::ZeroBatchSize
        );

        assert!(op.calls().is_empty());
    }

    #[tokio::test]
    async fn segunda_corrida_es_idempotente() {
        let transport = Arc::new(FakeTransport::new());
        let guard = Arc::new(IdempotencyGuard::new(transport.clone(), "/root/.fleet_setup_done"));

        let deploy = Scripted::ok();
        let launch = Scripted::ok();
        let collect = Scripted::ok();
        let phases = vec![
            PhaseSpec::new("deploy", deploy.clone()).with_guard(),
            PhaseSpec::new("launch", launch.clone()).with_guard(),
            PhaseSpec::new("collect", collect.clone()).tolerant(),
        ];
        let sink = Arc::new(CollectingSink::new());
        let opts = PipelineOptions::new(2).with_sink(sink).with_guard(guard);

        let first = run_pipeline(&nodes(3), &phases, &opts).await.unwrap();
        assert!(first.all_succeeded());
        assert_eq!(first.phase("deploy").unwrap().already_done_count, 0);
        assert!((1..=3).all(|id| transport.has_marker(id)));

        let second = run_pipeline(&nodes(3), &phases, &opts).await.unwrap();
        for name in ["deploy", "launch"] {
            let phase = second.phase(name).unwrap();
            assert_eq!(phase.already_done_count, 3, "{name}");
            assert!(phase
                .per_node
                .values()
                .all(|r| matches!(r, NodeResult::AlreadyDone { .. })));
        }
        // las operaciones con guardia no se volvieron a invocar
        assert_eq!(deploy.calls(), vec![1, 2, 3]);
        assert_eq!(launch.calls(), vec![1, 2, 3]);
        assert_eq!(collect.calls(), vec![1, 1, 2, 2, 3, 3]);

        // la sonda corre una sola vez por nodo y corrida
        let probes = transport
            .commands_for(1)
            .iter()
            .filter(|c| c.starts_with("test -e"))
            .count();
        assert_eq!(probes, 2);
    }

    #[tokio::test]
    async fn marcador_solo_si_todas_las_fases_con_guardia_corrieron_bien() {
        let transport = Arc::new(FakeTransport::new());
        let guard = Arc::new(IdempotencyGuard::new(transport.clone(), "/root/.fleet_setup_done"));
        let phases = vec![
            PhaseSpec::new("deploy", Scripted::ok()).with_guard().tolerant(),
            PhaseSpec::new("launch", Scripted::failing(&[2])).with_guard().tolerant(),
        ];
        let opts = PipelineOptions::new(5).with_guard(guard);

        run_pipeline(&nodes(3), &phases, &opts).await.unwrap();

        assert!(transport.has_marker(1));
        assert!(!transport.has_marker(2));
        assert!(transport.has_marker(3));

        // deploy falló en 3 pero launch corrió bien: tampoco hay marcador
        let transport = Arc::new(FakeTransport::new());
        let guard = Arc::new(IdempotencyGuard::new(transport.clone(), "/root/.fleet_setup_done"));
        let phases = vec![
            PhaseSpec::new("deploy", Scripted::failing(&[3])).with_guard().tolerant(),
            PhaseSpec::new("launch", Scripted::ok()).with_guard(),
        ];
        let opts = PipelineOptions::new(5).with_guard(guard);

        run_pipeline(&nodes(3), &phases, &opts).await.unwrap();
        assert!(transport.has_marker(1));
        assert!(!transport.has_marker(3));
    }

    #[tokio::test]
    async fn sonda_caida_rehace_el_setup() {
        let transport = Arc::new(FakeTransport::new().failing_probe(FailureReason::Timeout));
        transport.set_marker(1);
        let guard = Arc::new(IdempotencyGuard::new(transport, "/root/.fleet_setup_done"));
        let deploy = Scripted::ok();
        let phases = vec![PhaseSpec::new("deploy", deploy.clone()).with_guard()];
        let opts = PipelineOptions::new(5).with_guard(guard);

        let report = run_pipeline(&nodes(1), &phases, &opts).await.unwrap();

        assert_eq!(report.phase("deploy").unwrap().already_done_count, 0);
        assert_eq!(deploy.calls(), vec![1]);
    }

    #[tokio::test]
    async fn nodos_ya_hechos_no_diluyen_la_tasa_de_fallos() {
        let transport = Arc::new(FakeTransport::new());
        for id in 1..=3 {
            transport.set_marker(id);
        }
        let guard = Arc::new(IdempotencyGuard::new(transport, "/root/.fleet_setup_done"));
        let collect = Scripted::ok();
        let phases = vec![
            PhaseSpec::new("deploy", Scripted::failing(&[4, 5]))
                .with_guard()
                .with_threshold(0.5),
            PhaseSpec::new("collect", collect.clone()).tolerant(),
        ];
        let opts = PipelineOptions::new(5).with_guard(guard);

        let report = run_pipeline(&nodes(5), &phases, &opts).await.unwrap();

        let deploy = report.phase("deploy").unwrap();
        assert_eq!((deploy.already_done_count, deploy.failed_count), (3, 2));
        assert_eq!(deploy.failure_rate(), 1.0);
        // 2 de 2 que corrieron fallaron: supera 0.5 y se omiten
        assert_eq!(report.phase("collect").unwrap().skipped_count, 2);
        assert_eq!(collect.calls(), vec![1, 2, 3]);
    }

    /// Falla con un motivo distinto según el nodo.
    struct ByReason;

    #[async_trait]
    impl Operation for ByReason {
        async fn run(&self, node: &Node) -> Outcome {
            match node.id {
                1 => Outcome::failure(FailureReason::Timeout, "sin respuesta", 5),
                2 => Outcome::failure(FailureReason::NonzeroExit, "exit 1", 5),
                _ => Outcome::success("ok", 1),
            }
        }
    }

    #[tokio::test]
    async fn reporte_lista_nodos_reintentables() {
        let phases = vec![PhaseSpec::new("collect", Arc::new(ByReason)).tolerant()];
        let (opts, _) = options(3);

        let report = run_pipeline(&nodes(3), &phases, &opts).await.unwrap();

        assert_eq!(report.nodes_in(NodeState::Failed), vec![1, 2]);
        assert_eq!(report.retryable_nodes(), vec![1]);
    }

    #[test]
    fn maquina_de_estados_rechaza_transiciones_invalidas() {
        let mut states = HashMap::new();
        assert!(advance(&mut states, "stop", 1, NodeState::Running));
        assert!(advance(&mut states, "stop", 1, NodeState::Failed));
        assert!(advance(&mut states, "stop", 1, NodeState::Skipped));
        assert!(!advance(&mut states, "launch", 1, NodeState::Running));
        assert_eq!(states[&1], NodeState::Skipped);

        // de PENDING no se llega a SUCCEEDED sin pasar por RUNNING
        assert!(!advance(&mut states, "stop", 2, NodeState::Succeeded));
        assert!(!states.contains_key(&2));
    }

    #[tokio::test]
    async fn fases_desde_un_plan_json() {
        let plan: PlanDef = serde_json::from_str(
            r#"{"phases": [
                {"name": "stop", "guarded": true, "steps": [{"kind": "exec", "command": "pkill -f extract || true"}]},
                {"name": "launch", "guarded": true, "steps": [{"kind": "exec", "command": "nohup python3 extract.py &"}]}
            ]}"#,
        )
        .unwrap();
        let transport = Arc::new(FakeTransport::new());
        let phases = phases_from_plan(&plan, transport.clone());
        assert!(phases.iter().all(|p| p.guarded));

        let guard = Arc::new(IdempotencyGuard::new(transport.clone(), plan.marker_path_or_default()));
        let opts = PipelineOptions::new(plan.batch_size_or_default()).with_guard(guard);
        let report = run_pipeline(&nodes(2), &phases, &opts).await.unwrap();

        assert!(report.all_succeeded());
        let cmds = transport.commands_for(1);
        assert!(cmds.contains(&"pkill -f extract || true".to_string()));
        assert!(cmds.iter().any(|c| c.contains("touch --")));
    }
}
