pub mod aggregate;
pub mod enrich;
pub mod error;
pub mod export;
pub mod node;
pub mod outcome;
pub mod plan;

pub use aggregate::{
    aggregate, collect_output_files, write_output, AggregateResult, AggregateRules,
    AggregateSummary, BucketRule, DedupIndex, FileStats, RawRecord,
};
pub use enrich::{EnrichmentRules, SizeTier, SuffixTable, UNKNOWN};
pub use error::PlanError;
pub use export::{export_csv, CsvStats};
pub use node::{distribute, load_inventory, save_inventory, validate_inventory, Credential, Node, NodeId};
pub use outcome::{FailureReason, NodeResult, NodeState, Outcome, PhaseResult, ProgressReport};
pub use plan::{load_plan, ArtifactDef, ArtifactSource, PhaseDef, PlanDef, StepDef};
