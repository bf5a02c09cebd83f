pub mod entity;
pub mod model;
pub mod snapshot;

pub use entity::{Entity, EntitySave, SaveOutcome};
pub use model::{EntityId, EntityModel, EntitySchema, FieldKind, FieldSpec, FragmentSpec};
pub use snapshot::EntitySnapshot;
