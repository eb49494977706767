use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use fleet_common::{
    aggregate, collect_output_files, distribute, export::DEFAULT_COLUMNS, export_csv,
    load_inventory, load_plan, plan::default_timeout_secs, plan::DEFAULT_BATCH_SIZE,
    plan::DEFAULT_MARKER_PATH, save_inventory, write_output, AggregateRules, Node, NodeState,
    Outcome, ProgressReport, StepDef,
};
use fleet_orchestrator::{
    phases_from_plan, run, run_pipeline, IdempotencyGuard, Operation, PipelineOptions,
    PipelineReport, ProgressSink, SshTransport, StepSequence, Transport,
};
use tracing::info;

/// Tamaño de batch por defecto. Se puede sobreescribir con FLEET_BATCH_SIZE.
fn batch_size_from_env() -> Option<usize> {
    env::var("FLEET_BATCH_SIZE").ok().and_then(|s| s.parse::<usize>().ok())
}

/// Ruta del marcador. Se puede sobreescribir con FLEET_MARKER_PATH.
fn marker_path_from_env() -> Option<String> {
    env::var("FLEET_MARKER_PATH").ok().filter(|s| !s.trim().is_empty())
}

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Orquestador de comandos sobre una flota de nodos + agregador de resultados")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Corre un plan de fases sobre el inventario
    Run {
        #[arg(long, value_name = "INVENTORY_JSON")]
        inventory: PathBuf,

        #[arg(long, value_name = "PLAN_JSON")]
        plan: PathBuf,

        /// Nodos en paralelo por batch (pisa al plan y a FLEET_BATCH_SIZE)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Ruta remota del marcador de setup
        #[arg(long)]
        marker: Option<String>,

        /// Corre también las fases con guardia aunque el marcador exista
        #[arg(long)]
        no_guard: bool,

        /// Escribe el reporte completo en JSON
        #[arg(long, value_name = "REPORT_JSON")]
        report: Option<PathBuf>,
    },

    /// Corre un comando suelto en todos los nodos
    Exec {
        #[arg(long, value_name = "INVENTORY_JSON")]
        inventory: PathBuf,

        #[arg(value_name = "COMANDO")]
        command: String,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Borra el marcador de setup para forzar un setup completo
    Reset {
        #[arg(long, value_name = "INVENTORY_JSON")]
        inventory: PathBuf,

        #[arg(long)]
        marker: Option<String>,

        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Reparte una lista de trabajo (una por línea) entre los nodos
    Distribute {
        #[arg(long, value_name = "INVENTORY_JSON")]
        inventory: PathBuf,

        #[arg(long, value_name = "ITEMS_TXT")]
        items: PathBuf,

        /// Inventario de salida (por defecto, se reescribe el de entrada)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Une, deduplica, enriquece y particiona los NDJSON recolectados
    Aggregate {
        /// Patrón glob de entrada, ej: "raw/*.ndjson"
        #[arg(long)]
        input: String,

        #[arg(long, value_name = "DIR")]
        out_dir: PathBuf,

        #[arg(long, value_name = "RULES_JSON")]
        rules: Option<PathBuf>,
    },

    /// Convierte un NDJSON a CSV
    ExportCsv {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// Columnas separadas por coma
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
    },
}

/* --------- Salida por consola --------- */

struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn batch_settled(&self, phase: &str, batch: usize, total: usize, reports: &[ProgressReport]) {
        println!("  [{phase}] batch {batch}/{total}");
        for r in reports {
            let mark = if r.ok { "✅" } else { "❌" };
            println!(
                "    {} node-{:02} ({:>6} ms) {}",
                mark, r.node_id, r.elapsed_ms, r.detail
            );
        }
    }

    fn nodes_skipped(&self, phase: &str, reports: &[ProgressReport]) {
        for r in reports {
            println!("  [{phase}] ⏭ node-{:02} {}", r.node_id, r.detail);
        }
    }
}

fn print_report(report: &PipelineReport) {
    println!();
    println!("Corrida {}", report.run_id);
    for phase in &report.phases {
        println!(
            "  {:<12} ok={} (ya hechos={}) fallos={} omitidos={}",
            phase.phase_name,
            phase.succeeded_count,
            phase.already_done_count,
            phase.failed_count,
            phase.skipped_count
        );
    }

    let failed = report.nodes_in(NodeState::Failed);
    let skipped = report.nodes_in(NodeState::Skipped);
    println!(
        "  total: {} ok, {} con fallo {:?}, {} omitidos {:?}",
        report.nodes_in(NodeState::Succeeded).len(),
        failed.len(),
        failed,
        skipped.len(),
        skipped
    );

    let retryable = report.retryable_nodes();
    if !retryable.is_empty() {
        println!("  reintentables (red, auth o timeout): {retryable:?}");
    }
}

/// Imprime el resultado por nodo y devuelve cuántos fallaron.
fn print_outcomes(results: &[(Node, Outcome)]) -> usize {
    let mut failed = 0;
    for (node, outcome) in results {
        match outcome {
            Outcome::Success { output, .. } => println!("{} ✅ {}", node.label(), output),
            Outcome::Failure { reason, detail, .. } => {
                failed += 1;
                println!("{} ❌ {}: {}", node.label(), reason, detail);
            }
        }
    }
    println!();
    println!("{} ok, {} con fallo", results.len() - failed, failed);
    failed
}

/// Operación de `reset`: borra el marcador.
struct ClearMarker(Arc<IdempotencyGuard>);

#[async_trait]
impl Operation for ClearMarker {
    async fn run(&self, node: &Node) -> Outcome {
        self.0.clear(node).await
    }
}

/* --------- Subcomandos --------- */

/// Devuelve true si todos los nodos terminaron bien.
pub async fn run_cli(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Run {
            inventory,
            plan,
            batch_size,
            marker,
            no_guard,
            report,
        } => {
            let nodes = load_inventory(&inventory)?;
            let plan = load_plan(&plan)?;
            let batch_size = batch_size
                .or(plan.batch_size)
                .or_else(batch_size_from_env)
                .unwrap_or(DEFAULT_BATCH_SIZE);
            let marker = marker
                .or_else(|| plan.marker_path.clone())
                .or_else(marker_path_from_env)
                .unwrap_or_else(|| DEFAULT_MARKER_PATH.to_string());

            let transport: Arc<dyn Transport> = Arc::new(SshTransport::default());
            let phases = phases_from_plan(&plan, transport.clone());

            let mut options = PipelineOptions::new(batch_size).with_sink(Arc::new(ConsoleSink));
            if !no_guard {
                options = options.with_guard(Arc::new(IdempotencyGuard::new(transport, marker)));
            }

            println!(
                "Plan con {} fases sobre {} nodos (batch de {})",
                phases.len(),
                nodes.len(),
                batch_size
            );
            let result = run_pipeline(&nodes, &phases, &options).await?;
            print_report(&result);

            if let Some(path) = report {
                fs::write(&path, serde_json::to_string_pretty(&result)? + "\n")
                    .with_context(|| format!("no se pudo escribir {}", path.display()))?;
                info!("reporte escrito en {}", path.display());
            }
            Ok(result.all_succeeded())
        }

        Commands::Exec {
            inventory,
            command,
            batch_size,
            timeout_secs,
        } => {
            let nodes = load_inventory(&inventory)?;
            let batch_size = batch_size
                .or_else(batch_size_from_env)
                .unwrap_or(DEFAULT_BATCH_SIZE);
            let timeout_secs = timeout_secs.unwrap_or_else(default_timeout_secs);
            if timeout_secs == 0 {
                bail!("--timeout-secs debe ser positivo");
            }

            let step = StepDef::Exec {
                command,
                timeout_secs,
            };
            let op = Arc::new(StepSequence::new(Arc::new(SshTransport::default()), vec![step]));
            let results = run(&nodes, op, batch_size, "exec", &ConsoleSink).await?;
            Ok(print_outcomes(&results) == 0)
        }

        Commands::Reset {
            inventory,
            marker,
            batch_size,
        } => {
            let nodes = load_inventory(&inventory)?;
            let batch_size = batch_size
                .or_else(batch_size_from_env)
                .unwrap_or(DEFAULT_BATCH_SIZE);
            let marker = marker
                .or_else(marker_path_from_env)
                .unwrap_or_else(|| DEFAULT_MARKER_PATH.to_string());

            let guard = IdempotencyGuard::new(Arc::new(SshTransport::default()), marker)
                .with_probe_timeout(Duration::from_secs(default_timeout_secs()));
            let op = Arc::new(ClearMarker(Arc::new(guard)));
            let results = run(&nodes, op, batch_size, "reset", &ConsoleSink).await?;
            Ok(print_outcomes(&results) == 0)
        }

        Commands::Distribute {
            inventory,
            items,
            output,
        } => {
            let mut nodes = load_inventory(&inventory)?;
            let raw = fs::read_to_string(&items)
                .with_context(|| format!("no se pudo leer {}", items.display()))?;
            let list: Vec<String> = raw
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            let total = list.len();

            distribute(&mut nodes, list)?;
            let output = output.unwrap_or(inventory);
            save_inventory(&output, &nodes)?;

            for node in &nodes {
                let n = node.assignment.as_ref().map(Vec::len).unwrap_or(0);
                println!("{}: {} items", node.label(), n);
            }
            println!("{} items repartidos en {} nodos -> {}", total, nodes.len(), output.display());
            Ok(true)
        }

        Commands::Aggregate {
            input,
            out_dir,
            rules,
        } => {
            let rules = match rules {
                Some(path) => AggregateRules::load(&path)?,
                None => AggregateRules::default(),
            };
            let files = collect_output_files(&input)?;
            if files.is_empty() {
                bail!("ningún archivo coincide con {input}");
            }
            println!("{} archivos de entrada", files.len());

            let result = aggregate(&files, &rules);
            let summary = write_output(&result, &out_dir)?;

            println!(
                "raw: {} -> únicos: {} (malformadas: {}, sin campos obligatorios: {})",
                summary.total_raw,
                summary.total_unique,
                summary.malformed_lines,
                summary.policy_violations
            );
            for (dimension, values) in &summary.buckets {
                let parts: Vec<String> = values.iter().map(|(v, n)| format!("{v}={n}")).collect();
                println!("  by_{}: {}", dimension, parts.join(", "));
            }
            println!("salida en {}", out_dir.display());
            Ok(true)
        }

        Commands::ExportCsv {
            input,
            output,
            columns,
        } => {
            let columns = if columns.is_empty() {
                DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect()
            } else {
                columns
            };
            let stats = export_csv(&input, &output, &columns)?;
            println!(
                "{}: {} filas, {} líneas con error -> {}",
                input.display(),
                stats.rows,
                stats.errors,
                output.display()
            );
            Ok(true)
        }
    }
}
