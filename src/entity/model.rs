use crate::manager::identity_map::{FragmentSeed, TypedFragmentSeed};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use uuid::Uuid;

/// Capability set required from an entity identifier.
pub trait EntityId:
    Clone
    + Eq
    + Hash
    + Ord
    + fmt::Debug
    + fmt::Display
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Temporary id for an entity created before the server assigned one.
    fn provisional(seq: u64, prefix: &str) -> Self;
}

impl EntityId for String {
    fn provisional(_seq: u64, prefix: &str) -> Self {
        format!("{}{}", prefix, Uuid::new_v4())
    }
}

impl EntityId for i64 {
    fn provisional(seq: u64, _prefix: &str) -> Self {
        // Negative ids never collide with server-issued ones.
        -i64::try_from(seq).unwrap_or(i64::MAX)
    }
}

impl EntityId for u64 {
    fn provisional(seq: u64, _prefix: &str) -> Self {
        u64::MAX - seq
    }
}

impl EntityId for Uuid {
    fn provisional(_seq: u64, _prefix: &str) -> Self {
        Uuid::new_v4()
    }
}

/// A serde data shape that can be managed as an entity.
///
/// `Entity<M>` is the generic entity: its id type is `M::Id` and its data
/// shape is `M` itself. Fields are declared through [`EntitySchema`].
pub trait EntityModel: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Id: EntityId;

    const ENTITY_TYPE: &'static str;

    fn schema() -> EntitySchema;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Plain value field.
    Value,
    /// Ordered set of related entity ids.
    Relation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// Nested sub-result seeded from the parent payload key `name`.
#[derive(Clone)]
pub struct FragmentSpec {
    pub name: String,
    pub child_type: &'static str,
    pub(crate) seed: Arc<dyn FragmentSeed>,
}

impl fmt::Debug for FragmentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentSpec")
            .field("name", &self.name)
            .field("child_type", &self.child_type)
            .finish()
    }
}

/// Declarative field registration for one entity type.
///
/// ```ignore
/// EntitySchema::new("todo")
///     .field("title")
///     .field("completed")
///     .relation("tag_ids")
///     .fragment::<Comment>("comments")
/// ```
#[derive(Debug, Clone)]
pub struct EntitySchema {
    entity_type: &'static str,
    id_field: String,
    fields: Vec<FieldSpec>,
    fragments: Vec<FragmentSpec>,
}

impl EntitySchema {
    pub fn new(entity_type: &'static str) -> Self {
        Self {
            entity_type,
            id_field: "id".to_string(),
            fields: Vec::new(),
            fragments: Vec::new(),
        }
    }

    /// Set the payload field holding the id
    pub fn id_field(mut self, name: &str) -> Self {
        self.id_field = name.to_string();
        self
    }

    /// Register a value field
    pub fn field(self, name: &str) -> Self {
        self.push_field(name, FieldKind::Value)
    }

    /// Register several value fields
    pub fn fields<'a>(self, names: impl IntoIterator<Item = &'a str>) -> Self {
        names
            .into_iter()
            .fold(self, |schema, name| schema.push_field(name, FieldKind::Value))
    }

    /// Register a relation field (ordered id set)
    pub fn relation(self, name: &str) -> Self {
        self.push_field(name, FieldKind::Relation)
    }

    /// Register a fragment of child entities seeded from the payload key `name`
    pub fn fragment<C: EntityModel>(mut self, name: &str) -> Self {
        self.fragments.retain(|fragment| fragment.name != name);
        self.fragments.push(FragmentSpec {
            name: name.to_string(),
            child_type: C::ENTITY_TYPE,
            seed: Arc::new(TypedFragmentSeed::<C>::new()),
        });
        self
    }

    fn push_field(mut self, name: &str, kind: FieldKind) -> Self {
        if name == self.id_field {
            return self;
        }
        self.fields.retain(|field| field.name != name);
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
        });
        self
    }

    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    pub fn id_field_name(&self) -> &str {
        &self.id_field
    }

    pub fn field_specs(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.name == name)
    }

    pub fn is_relation(&self, name: &str) -> bool {
        self.fields
            .iter()
            .any(|field| field.name == name && field.kind == FieldKind::Relation)
    }

    pub fn fragments(&self) -> &[FragmentSpec] {
        &self.fragments
    }

    pub fn fragment_spec(&self, name: &str) -> Option<&FragmentSpec> {
        self.fragments.iter().find(|fragment| fragment.name == name)
    }
}
