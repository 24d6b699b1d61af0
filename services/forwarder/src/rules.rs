//! Forwarding rule model.
//!
//! A rules snapshot is a map of rule name to [`Definition`]. Definitions
//! are value types: each reconciliation pass parses a fresh map and
//! compares it field-by-field against the previously applied one, so a
//! rule is either unchanged (listener left alone) or replaced wholesale.

use serde::{Deserialize, Serialize};

/// How a rule selects its backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Forward every connection to the static sink address.
    #[default]
    PointToPoint,
    /// Round-robin over the endpoint list given in the rules file.
    EndpointList,
    /// Round-robin over endpoints resolved from the service registry.
    ServiceLookup,
}

/// Resolved backend addresses ("host:port" entries).
///
/// Equality is defined over the set: both sides are compared sorted, so
/// a registry response that merely reorders endpoints is not a change
/// and does not invalidate round-robin state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointSet(Vec<String>);

impl EndpointSet {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self(endpoints)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Endpoint at `index`, in the order given by the source (file or
    /// registry response), not sorted order.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for EndpointSet {
    fn from(endpoints: Vec<String>) -> Self {
        Self(endpoints)
    }
}

impl PartialEq for EndpointSet {
    fn eq(&self, other: &Self) -> bool {
        if self.0.len() != other.0.len() {
            return false;
        }
        let mut lhs = self.0.clone();
        let mut rhs = other.0.clone();
        lhs.sort_unstable();
        rhs.sort_unstable();
        lhs == rhs
    }
}

impl Eq for EndpointSet {}

/// One declarative forwarding rule.
///
/// The `name` is the rule's map key in the rules file and is filled in
/// after parsing; it is unique among currently applied rules. Equality
/// is full-field value comparison and is what the reconciler uses to
/// decide whether a common rule materially changed between snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Definition {
    /// Map key of the rules document.
    #[serde(skip)]
    pub name: String,
    /// Source ingress point, "host:port" to listen on.
    pub source: String,
    /// Static sink service point, "host:port"; the default backend.
    #[serde(default)]
    pub sink: String,
    /// Backend endpoints; dynamically replaced when discovery is enabled.
    #[serde(default)]
    pub endpoints: EndpointSet,
    /// Resolve endpoints from the service registry instead of `sink`.
    #[serde(default)]
    pub enable_discovery: bool,
    /// Registry service name.
    #[serde(default)]
    pub service: String,
    /// Registry namespace.
    #[serde(default)]
    pub namespace: String,
    /// Backend selection mode.
    #[serde(default)]
    pub mode: Mode,
    /// Verbose logging for this rule.
    #[serde(default)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[&str]) -> EndpointSet {
        EndpointSet::new(entries.iter().map(|e| e.to_string()).collect())
    }

    fn definition() -> Definition {
        Definition {
            name: "web".to_string(),
            source: "0.0.0.0:8000".to_string(),
            sink: "10.0.0.5:80".to_string(),
            endpoints: set(&["10.0.0.5:80", "10.0.0.6:80"]),
            enable_discovery: true,
            service: "web".to_string(),
            namespace: "default".to_string(),
            mode: Mode::ServiceLookup,
            debug: false,
        }
    }

    #[test]
    fn test_endpoint_set_permutation_equality() {
        let a = set(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
        let b = set(&["10.0.0.3:80", "10.0.0.1:80", "10.0.0.2:80"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_endpoint_set_member_difference() {
        let a = set(&["10.0.0.1:80", "10.0.0.2:80"]);
        let b = set(&["10.0.0.1:80", "10.0.0.9:80"]);
        let c = set(&["10.0.0.1:80"]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_endpoint_set_empty_sets_equal() {
        assert_eq!(EndpointSet::default(), EndpointSet::new(Vec::new()));
    }

    #[test]
    fn test_definition_equal_on_identical_fields() {
        assert_eq!(definition(), definition());
    }

    #[test]
    fn test_definition_per_field_sensitivity() {
        let base = definition();

        let mut d = base.clone();
        d.name = "api".to_string();
        assert_ne!(base, d);

        let mut d = base.clone();
        d.source = "0.0.0.0:8001".to_string();
        assert_ne!(base, d);

        let mut d = base.clone();
        d.sink = "10.0.0.9:80".to_string();
        assert_ne!(base, d);

        let mut d = base.clone();
        d.endpoints = set(&["10.0.0.5:80"]);
        assert_ne!(base, d);

        let mut d = base.clone();
        d.enable_discovery = false;
        assert_ne!(base, d);

        let mut d = base.clone();
        d.service = "api".to_string();
        assert_ne!(base, d);

        let mut d = base.clone();
        d.namespace = "staging".to_string();
        assert_ne!(base, d);

        let mut d = base.clone();
        d.mode = Mode::PointToPoint;
        assert_ne!(base, d);

        let mut d = base.clone();
        d.debug = true;
        assert_ne!(base, d);
    }

    #[test]
    fn test_definition_endpoint_reorder_is_not_a_change() {
        let mut reordered = definition();
        reordered.endpoints = set(&["10.0.0.6:80", "10.0.0.5:80"]);
        assert_eq!(definition(), reordered);
    }
}
