// ============================================================================
// Mutation layer
// ============================================================================
//
// Optimistic create / update / delete / relation bindings. Each one:
// - captures a MutationRecord (deep snapshots) before touching anything
// - applies its change synchronously, so observers see it at once
// - awaits the network call through the query cache
// - confirms and invalidates, or undoes the change before returning the error
//
// ============================================================================

pub(crate) mod context;
pub mod create;
pub mod delete;
pub mod invalidation;
pub mod machine;
pub mod record;
pub mod relation;
pub mod update;

pub use context::{MutationFn, mutation_fn};
pub use create::{AttachTarget, CreateMutation, CreateOptions};
pub use delete::DeleteMutation;
pub use invalidation::InvalidationStrategy;
pub use machine::{MutationMachine, MutationPhase};
pub use record::MutationRecord;
pub use relation::{RelationChange, RelationMutation, RelationOp};
pub use update::UpdateMutation;
