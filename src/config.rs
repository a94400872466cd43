//! Runtime configuration for probe discovery and connection.

use std::time::Duration;

/// Configuration shared by the scanner, the controller and the device manager.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbeConfig {
    /// How long a discovery scan runs before results are published.
    pub scan_timeout: Duration,
    /// Advertised names must start with this to be kept.
    pub name_prefix: String,
    /// Stripped from the advertised name to produce the probe name.
    pub name_separator: String,
    /// Capacity of the outward event channel.
    pub event_capacity: usize,
}

impl ProbeConfig {
    /// Default discovery scan duration.
    pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(3);
    /// Default advertised-name prefix of the probe family.
    pub const DEFAULT_NAME_PREFIX: &'static str = "CUS";
    /// Default prefix removed from advertised names.
    pub const DEFAULT_NAME_SEPARATOR: &'static str = "CUS-";

    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan duration.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the device family prefix and the part of it stripped from names.
    pub fn with_name_prefix(
        mut self,
        prefix: impl Into<String>,
        separator: impl Into<String>,
    ) -> Self {
        self.name_prefix = prefix.into();
        self.name_separator = separator.into();
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Turn an advertised name into a probe name, or `None` if it does not
    /// belong to the probe family.
    pub fn probe_name(&self, advertised: &str) -> Option<String> {
        if !advertised.starts_with(&self.name_prefix) {
            return None;
        }

        Some(
            advertised
                .strip_prefix(&self.name_separator)
                .unwrap_or(advertised)
                .to_string(),
        )
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Self::DEFAULT_SCAN_TIMEOUT,
            name_prefix: Self::DEFAULT_NAME_PREFIX.to_string(),
            name_separator: Self::DEFAULT_NAME_SEPARATOR.to_string(),
            event_capacity: 64,
        }
    }
}
