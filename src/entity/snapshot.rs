use crate::core::JsonValue;
use std::collections::BTreeMap;

/// Deep copy of an entity's field state at one instant.
///
/// `clock` is the entity's hydration clock when the copy was taken; a later
/// hydration means the server has spoken since the capture.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub values: BTreeMap<String, JsonValue>,
    pub clean: BTreeMap<String, JsonValue>,
    pub removed: bool,
    pub clock: u64,
}

impl EntitySnapshot {
    pub fn value(&self, field: &str) -> Option<&JsonValue> {
        self.values.get(field)
    }

    /// Fields whose captured value differed from the captured clean value.
    pub fn dirty_fields(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(name, value)| self.clean.get(*name) != Some(*value))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Narrows the copy to `fields`; restoring it leaves every other field
    /// untouched.
    pub fn retain_fields<S: AsRef<str>>(&mut self, fields: &[S]) {
        let keep = |name: &String| fields.iter().any(|field| field.as_ref() == name);
        self.values.retain(|name, _| keep(name));
        self.clean.retain(|name, _| keep(name));
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}
