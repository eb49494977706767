pub mod guard;
pub mod ops;
pub mod pipeline;
pub mod progress;
pub mod runner;
pub mod transport;

#[cfg(test)]
mod fake;

pub use guard::IdempotencyGuard;
pub use ops::{fetched_file_name, Operation, StepSequence};
pub use pipeline::{phases_from_plan, run_pipeline, PhaseSpec, PipelineOptions, PipelineReport};
pub use progress::{CollectingSink, ProgressSink, TracingSink};
pub use runner::{partition, run, run_batched, Settled};
pub use transport::{shell_quote, SshTransport, Transport};
