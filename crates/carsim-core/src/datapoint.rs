//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Broker connection supervision and data-point publishing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

/// Identifier assigned by the broker to a registered data-point.
pub type DataPointId = i32;

/// Name to identifier mapping produced by one successful registration.
///
/// Instances are immutable; a re-registration produces a new value which the
/// supervisor swaps in whole.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPointRegistration {
    ids: IndexMap<String, DataPointId>,
    registered_at: DateTime<Utc>,
}

impl DataPointRegistration {
    /// Build a registration from an ordered name to identifier mapping.
    pub fn new(ids: IndexMap<String, DataPointId>) -> Self {
        Self {
            ids,
            registered_at: Utc::now(),
        }
    }

    /// Identifier for `name`, if it was registered.
    pub fn id(&self, name: &str) -> Option<DataPointId> {
        self.ids.get(name).copied()
    }

    /// Iterate `(name, id)` pairs in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, DataPointId)> {
        self.ids.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Number of registered data-points.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the registration is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Wall-clock time the registration was captured.
    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_preserve_configuration_order() {
        let mut ids = IndexMap::new();
        ids.insert("Vehicle.Speed".to_owned(), 7);
        ids.insert("Vehicle.Acceleration".to_owned(), 3);
        let registration = DataPointRegistration::new(ids);

        assert_eq!(registration.id("Vehicle.Speed"), Some(7));
        assert_eq!(registration.id("Vehicle.Mass"), None);
        let names: Vec<_> = registration.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["Vehicle.Speed", "Vehicle.Acceleration"]);
        assert_eq!(registration.len(), 2);
    }
}
