//! Registry of probes found by the most recent scan.

use crate::ble::adapter::DiscoveredDevice;

/// A probe kept from a scan, with its user-facing name.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegisteredProbe {
    /// Probe name with the family prefix stripped.
    pub name: String,
    /// The device as the adapter reported it.
    pub device: DiscoveredDevice,
}

/// Probes from the last completed scan, in scan order.
///
/// The registry is replaced as a whole by every scan, never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRegistry {
    probes: Vec<RegisteredProbe>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all entries.
    pub(crate) fn replace(&mut self, probes: Vec<RegisteredProbe>) {
        self.probes = probes;
    }

    /// Remove all entries.
    pub(crate) fn clear(&mut self) {
        self.probes.clear();
    }

    /// Look up a probe by its user-facing name. First match in scan order wins.
    pub fn find_by_name(&self, name: &str) -> Option<&RegisteredProbe> {
        self.probes.iter().find(|p| p.name == name)
    }

    /// Look up a probe by device identifier.
    pub fn get(&self, identifier: &str) -> Option<&RegisteredProbe> {
        self.probes
            .iter()
            .find(|p| p.device.identifier == identifier)
    }

    /// Names of all probes, in scan order.
    pub fn names(&self) -> Vec<String> {
        self.probes.iter().map(|p| p.name.clone()).collect()
    }

    /// Iterate over the probes.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredProbe> {
        self.probes.iter()
    }

    /// Number of probes.
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    /// Check whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(identifier: &str, name: &str) -> RegisteredProbe {
        RegisteredProbe {
            name: name.to_string(),
            device: DiscoveredDevice::new(identifier, format!("CUS-{}", name)),
        }
    }

    #[test]
    fn test_lookup() {
        let mut registry = DeviceRegistry::new();
        registry.replace(vec![probe("AA", "P100"), probe("BB", "L7")]);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find_by_name("L7").map(|p| p.device.identifier.as_str()), Some("BB"));
        assert_eq!(registry.get("AA").map(|p| p.name.as_str()), Some("P100"));
        assert!(registry.find_by_name("C3").is_none());
        assert_eq!(registry.names(), vec!["P100", "L7"]);
    }

    #[test]
    fn test_duplicate_names_first_wins() {
        let mut registry = DeviceRegistry::new();
        registry.replace(vec![probe("AA", "P100"), probe("BB", "P100")]);

        assert_eq!(
            registry.find_by_name("P100").map(|p| p.device.identifier.as_str()),
            Some("AA")
        );
    }

    #[test]
    fn test_replace_and_clear() {
        let mut registry = DeviceRegistry::new();
        registry.replace(vec![probe("AA", "P100")]);
        registry.replace(vec![probe("BB", "L7")]);
        assert!(registry.get("AA").is_none());

        registry.clear();
        assert!(registry.is_empty());
    }
}
