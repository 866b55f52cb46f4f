//! Static table of named places devices are assigned to.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use tracing::{error, info};

use crate::errors::{Error, Result};

/// A named place with coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub city: String,
    #[serde(deserialize_with = "coordinate")]
    pub lat: f64,
    #[serde(deserialize_with = "coordinate")]
    pub lng: f64,
    pub country: String,
}

impl Location {
    /// Built-in entry used when no table can be loaded.
    pub fn prime_meridian() -> Self {
        Self {
            city: "Prime Meridian".to_string(),
            lat: 0.0,
            lng: 0.0,
            country: "Ghana".to_string(),
        }
    }
}

/// Coordinates show up both as JSON numbers and as numeric strings.
fn coordinate<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Ordered, read-only sequence of locations. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationTable {
    entries: Vec<Location>,
}

impl LocationTable {
    pub fn new(entries: Vec<Location>) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::Config("location table is empty".to_string()));
        }
        Ok(Self { entries })
    }

    pub fn fallback() -> Self {
        Self {
            entries: vec![Location::prime_meridian()],
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let entries: Vec<Location> = serde_json::from_str(raw)?;
        Self::new(entries)
    }

    pub fn try_load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Loads the table from `path`, falling back to the built-in entry on any
    /// failure. Errors are logged, never returned.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(table) => {
                info!("Loaded {} locations from {}", table.len(), path.display());
                table
            }
            Err(e) => {
                error!(
                    "Failed to load locations from {}: {}. Using built-in default",
                    path.display(),
                    e
                );
                Self::fallback()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Location> {
        self.entries.get(index)
    }

    /// Picks the entry for an arbitrary integer key.
    pub fn pick(&self, key: u64) -> &Location {
        &self.entries[(key % self.entries.len() as u64) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"[
        {"city": "Lisbon", "lat": "38.7223", "lng": "-9.1393", "country": "Portugal"},
        {"city": "Oslo", "lat": 59.9139, "lng": 10.7522, "country": "Norway"}
    ]"#;

    #[test]
    fn test_parses_string_and_number_coordinates() {
        let table = LocationTable::from_json(SAMPLE).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).unwrap().lat, 38.7223);
        assert_eq!(table.get(1).unwrap().lng, 10.7522);
    }

    #[test]
    fn test_rejects_bad_coordinates() {
        let raw = r#"[{"city": "X", "lat": "north", "lng": 0, "country": "Y"}]"#;
        assert!(LocationTable::from_json(raw).is_err());
    }

    #[test]
    fn test_rejects_empty_table() {
        assert!(LocationTable::from_json("[]").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let table = LocationTable::load(file.path());
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).unwrap().city, "Lisbon");
    }

    #[test]
    fn test_missing_file_falls_back() {
        let table = LocationTable::load(Path::new("/nonexistent/locations.json"));
        assert_eq!(table, LocationTable::fallback());
        assert_eq!(table.pick(12345).city, "Prime Meridian");
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();

        let table = LocationTable::load(file.path());
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0).unwrap().country, "Ghana");
    }
}
