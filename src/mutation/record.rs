use super::invalidation::InvalidationStrategy;
use super::machine::MutationPhase;
use crate::core::EntityKey;
use crate::entity::{Entity, EntityModel, EntitySnapshot};
use chrono::{DateTime, Utc};
use std::fmt;

/// Transient record of one `mutate()` call: the touched entities with their
/// pre-mutation snapshots, the phase reached and the invalidation to run.
pub struct MutationRecord<M: EntityModel> {
    targets: Vec<(Entity<M>, EntitySnapshot)>,
    phase: MutationPhase,
    invalidation: InvalidationStrategy,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl<M: EntityModel> Clone for MutationRecord<M> {
    fn clone(&self) -> Self {
        Self {
            targets: self.targets.clone(),
            phase: self.phase,
            invalidation: self.invalidation,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

impl<M: EntityModel> fmt::Debug for MutationRecord<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationRecord")
            .field("targets", &self.keys())
            .field("phase", &self.phase)
            .field("invalidation", &self.invalidation)
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl<M: EntityModel> MutationRecord<M> {
    /// Snapshots every target before anything is applied.
    pub fn capture(targets: &[Entity<M>], invalidation: InvalidationStrategy) -> Self {
        Self {
            targets: targets
                .iter()
                .map(|entity| (entity.clone(), entity.snapshot()))
                .collect(),
            phase: MutationPhase::Pending,
            invalidation,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.targets.iter().map(|(entity, _)| entity.key()).collect()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity<M>> {
        self.targets.iter().map(|(entity, _)| entity)
    }

    pub fn snapshot_of(&self, entity: &Entity<M>) -> Option<&EntitySnapshot> {
        self.targets
            .iter()
            .find(|(target, _)| target.ptr_eq(entity))
            .map(|(_, snapshot)| snapshot)
    }

    /// Logical hydration clock of the first target at capture time.
    pub fn clock(&self) -> u64 {
        self.targets
            .first()
            .map(|(_, snapshot)| snapshot.clock)
            .unwrap_or(0)
    }

    pub fn phase(&self) -> MutationPhase {
        self.phase
    }

    pub fn invalidation(&self) -> InvalidationStrategy {
        self.invalidation
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Restricts every snapshot to the fields this mutation writes.
    pub(crate) fn retain_fields<S: AsRef<str>>(&mut self, fields: &[S]) {
        for (_, snapshot) in &mut self.targets {
            snapshot.retain_fields(fields);
        }
    }

    /// Fields a rollback replays.
    pub fn touched_fields(&self) -> Vec<String> {
        self.targets
            .first()
            .map(|(_, snapshot)| snapshot.fields().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Replays every snapshot onto its entity.
    pub(crate) fn restore(&self) {
        for (entity, snapshot) in &self.targets {
            entity.restore(snapshot);
        }
    }

    pub(crate) fn finish(&mut self, phase: MutationPhase) {
        self.phase = phase;
        self.finished_at = Some(Utc::now());
    }
}
