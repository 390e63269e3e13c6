//! Discovered peripherals.
//!
//! The registry is owned by the lifecycle actor; observers only ever see
//! cloned snapshots of it.

use chrono::{DateTime, Utc};

use crate::ble::transport::ScanRecord;

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralHandle {
    /// Platform address or identifier. Unique within the registry.
    pub id: String,
    /// Advertised local name, if the peripheral has sent one.
    pub display_name: Option<String>,
    /// Signal strength of the latest advertisement in dBm.
    pub rssi: Option<i16>,
    /// When the peripheral was last seen.
    pub last_seen_at: DateTime<Utc>,
}

impl PeripheralHandle {
    /// Create a handle seen now.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            rssi: None,
            last_seen_at: Utc::now(),
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name to show to a user, falling back to the id.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    fn from_record(record: ScanRecord, seen_at: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            display_name: record.name,
            rssi: record.rssi,
            last_seen_at: seen_at,
        }
    }
}

impl std::fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Outcome of recording a scan result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First time this id was seen.
    New,
    /// Known id whose display name changed.
    Renamed,
    /// Known id, only freshness data changed.
    Refreshed,
}

impl Observation {
    /// Whether the visible list changed.
    pub fn changes_list(&self) -> bool {
        !matches!(self, Self::Refreshed)
    }
}

/// Discovered peripherals in first-seen order, unique by id.
#[derive(Debug, Clone, Default)]
pub struct PeripheralRegistry {
    entries: Vec<PeripheralHandle>,
}

impl PeripheralRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a scan result.
    pub fn observe(&mut self, record: ScanRecord) -> Observation {
        self.observe_at(record, Utc::now())
    }

    /// Record a scan result seen at `seen_at`.
    pub fn observe_at(&mut self, record: ScanRecord, seen_at: DateTime<Utc>) -> Observation {
        match self.entries.iter_mut().find(|p| p.id == record.id) {
            Some(existing) => {
                existing.last_seen_at = seen_at;
                if record.rssi.is_some() {
                    existing.rssi = record.rssi;
                }
                // Some platforms only include the name in scan responses.
                match record.name {
                    Some(name) if existing.display_name.as_deref() != Some(name.as_str()) => {
                        existing.display_name = Some(name);
                        Observation::Renamed
                    }
                    _ => Observation::Refreshed,
                }
            }
            None => {
                self.entries
                    .push(PeripheralHandle::from_record(record, seen_at));
                Observation::New
            }
        }
    }

    /// Get a peripheral by id.
    pub fn get(&self, id: &str) -> Option<&PeripheralHandle> {
        self.entries.iter().find(|p| p.id == id)
    }

    /// Remove a peripheral. Returns whether it was present.
    pub fn forget(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|p| p.id != id);
        self.entries.len() != before
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of known peripherals.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the list for observers.
    pub fn snapshot(&self) -> Vec<PeripheralHandle> {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_duplicates_are_suppressed() {
        let mut registry = PeripheralRegistry::new();

        assert_eq!(registry.observe(ScanRecord::new("P1")), Observation::New);
        assert_eq!(registry.observe(ScanRecord::new("P2")), Observation::New);
        assert_eq!(registry.observe(ScanRecord::new("P1")), Observation::Refreshed);
        assert_eq!(registry.observe(ScanRecord::new("P2")), Observation::Refreshed);

        let ids: Vec<_> = registry.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["P1".to_string(), "P2".to_string()]);
    }

    #[test]
    fn test_refresh_updates_last_seen_and_rssi() {
        let mut registry = PeripheralRegistry::new();
        let first = Utc::now();
        let later = first + Duration::seconds(3);

        registry.observe_at(ScanRecord::new("P1").with_rssi(-80), first);
        registry.observe_at(ScanRecord::new("P1"), later);

        let p = registry.get("P1").unwrap();
        assert_eq!(p.last_seen_at, later);
        assert_eq!(p.rssi, Some(-80));
    }

    #[test]
    fn test_late_name_is_a_rename() {
        let mut registry = PeripheralRegistry::new();
        registry.observe(ScanRecord::new("P1"));

        let obs = registry.observe(ScanRecord::new("P1").with_name("Thermo"));
        assert_eq!(obs, Observation::Renamed);
        assert!(obs.changes_list());
        assert_eq!(registry.get("P1").unwrap().label(), "Thermo");

        let obs = registry.observe(ScanRecord::new("P1").with_name("Thermo"));
        assert_eq!(obs, Observation::Refreshed);
    }

    #[test]
    fn test_forget_and_clear() {
        let mut registry = PeripheralRegistry::new();
        registry.observe(ScanRecord::new("P1"));
        registry.observe(ScanRecord::new("P2"));

        assert!(registry.forget("P1"));
        assert!(!registry.forget("P1"));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(PeripheralHandle::new("AA").to_string(), "AA");
        assert_eq!(
            PeripheralHandle::new("AA").with_name("Tag").to_string(),
            "Tag (AA)"
        );
    }
}
