//! Deterministic derivation of the simulated device fleet.
//!
//! Identity, location and temperature distribution are pure functions of
//! `(id, seed, location table)`. Only the initial reading and the first
//! deadline are drawn from the random source.

use clap::ValueEnum;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::{Error, Result};
use crate::locations::{Location, LocationTable};

pub const MAX_FLEET_SIZE: usize = 25;
pub const SERIAL_NUMBER_LEN: usize = 12;

const MEAN_CEILING: f64 = 37.0;
const MEAN_SPREAD: u64 = 17;
const STD_DEV: f64 = 1.0;
const REGION_COUNT: u64 = 100;

/// Last `SERIAL_NUMBER_LEN` hex digits of the SHA-256 of `input`.
fn digest_suffix(input: &str) -> String {
    let digest = hex::encode(Sha256::digest(input.as_bytes()));
    digest[digest.len() - SERIAL_NUMBER_LEN..].to_string()
}

/// Integer value of a 12-digit hex string (48 bits).
fn hex_value(hex: &str) -> u64 {
    u64::from_str_radix(hex, 16).unwrap_or_default()
}

/// Stable serial number for device `id` of the fleet seeded with `seed`.
pub fn serial_number(id: usize, seed: &str) -> String {
    digest_suffix(&format!("{}_{}", id, seed))
}

/// Serial number read as a base-16 integer.
pub fn serial_value(serial_number: &str) -> u64 {
    hex_value(serial_number)
}

pub fn clamp_fleet_size(requested: usize) -> usize {
    if requested > MAX_FLEET_SIZE {
        warn!(
            "Requested {} devices, capping fleet at {}",
            requested, MAX_FLEET_SIZE
        );
    }
    requested.min(MAX_FLEET_SIZE)
}

pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    pub fn label(&self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "C",
            TemperatureUnit::Fahrenheit => "F",
        }
    }
}

/// Where a device reports from.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceLocation {
    Place(Location),
    Region(String),
}

impl DeviceLocation {
    pub fn name(&self) -> &str {
        match self {
            DeviceLocation::Place(place) => &place.city,
            DeviceLocation::Region(label) => label,
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match self {
            DeviceLocation::Place(place) => Some((place.lat, place.lng)),
            DeviceLocation::Region(_) => None,
        }
    }
}

pub fn region_label(serial_number: &str) -> String {
    format!("Region_{:02}", serial_value(serial_number) % REGION_COUNT)
}

/// Gaussian the device's readings are drawn around.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureProfile {
    pub mean: f64,
    pub std_dev: f64,
}

impl TemperatureProfile {
    /// Devices sharing a location share a profile.
    pub fn for_location(name: &str, unit: TemperatureUnit) -> Self {
        let mean = MEAN_CEILING - (hex_value(&digest_suffix(name)) % MEAN_SPREAD) as f64;
        match unit {
            TemperatureUnit::Celsius => Self {
                mean,
                std_dev: STD_DEV,
            },
            TemperatureUnit::Fahrenheit => Self {
                mean: mean * 9.0 / 5.0 + 32.0,
                std_dev: STD_DEV * 9.0 / 5.0,
            },
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64> {
        let normal = Normal::new(self.mean, self.std_dev)?;
        Ok(round4(normal.sample(rng)))
    }
}

/// Bounds of the jittered delay between two sends of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendInterval {
    min_ms: u64,
    max_ms: u64,
}

impl SendInterval {
    pub fn new(min_ms: u64, max_ms: u64) -> Result<Self> {
        if min_ms > max_ms {
            return Err(Error::Config(format!(
                "min interval {}ms is greater than max interval {}ms",
                min_ms, max_ms
            )));
        }
        Ok(Self { min_ms, max_ms })
    }

    pub fn min_ms(&self) -> u64 {
        self.min_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    /// Next deadline, uniformly jittered in `[now + min, now + max]`.
    pub fn next_deadline<R: Rng + ?Sized>(&self, now: f64, rng: &mut R) -> f64 {
        now + rng.gen_range(self.min_ms..=self.max_ms) as f64 / 1000.0
    }
}

/// One simulated sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: usize,
    pub serial_number: String,
    pub location: DeviceLocation,
    pub profile: TemperatureProfile,
    pub temperature: f64,
    /// Seconds since the epoch at which the device is next due.
    pub next_send_at: f64,
    pub sent: u64,
    pub consecutive_failures: u32,
}

impl Device {
    pub fn is_due(&self, now: f64) -> bool {
        now >= self.next_send_at
    }
}

/// Inputs the fleet is derived from.
#[derive(Debug, Clone)]
pub struct FleetSpec<'a> {
    pub size: usize,
    pub seed: &'a str,
    /// `None` assigns synthetic region labels instead of named places.
    pub locations: Option<&'a LocationTable>,
    pub unit: TemperatureUnit,
}

/// Identity part of a device: everything that does not depend on randomness.
pub fn device_identity(
    id: usize,
    seed: &str,
    locations: Option<&LocationTable>,
    unit: TemperatureUnit,
) -> (String, DeviceLocation, TemperatureProfile) {
    let serial = serial_number(id, seed);
    let location = match locations {
        Some(table) => DeviceLocation::Place(table.pick(serial_value(&serial)).clone()),
        None => DeviceLocation::Region(region_label(&serial)),
    };
    let profile = TemperatureProfile::for_location(location.name(), unit);
    (serial, location, profile)
}

pub fn build_fleet<R: Rng + ?Sized>(
    spec: &FleetSpec<'_>,
    interval: &SendInterval,
    now: f64,
    rng: &mut R,
) -> Result<Vec<Device>> {
    let size = clamp_fleet_size(spec.size);
    let mut fleet = Vec::with_capacity(size);

    for id in 0..size {
        let (serial_number, location, profile) =
            device_identity(id, spec.seed, spec.locations, spec.unit);
        let temperature = profile.sample(rng)?;
        fleet.push(Device {
            id,
            serial_number,
            location,
            profile,
            temperature,
            next_send_at: interval.next_deadline(now, rng),
            sent: 0,
            consecutive_failures: 0,
        });
    }

    Ok(fleet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn table() -> LocationTable {
        LocationTable::new(vec![
            Location {
                city: "Lisbon".to_string(),
                lat: 38.7223,
                lng: -9.1393,
                country: "Portugal".to_string(),
            },
            Location {
                city: "Oslo".to_string(),
                lat: 59.9139,
                lng: 10.7522,
                country: "Norway".to_string(),
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_serial_number_is_sha256_suffix() {
        assert_eq!(serial_number(0, "mqtt"), "16efd64ee392");
        assert_eq!(serial_number(1, "mqtt"), "07164cb53dc2");
        assert_eq!(serial_number(0, "test-seed"), "e5e1988fc965");
        assert_eq!(serial_number(0, "mqtt").len(), SERIAL_NUMBER_LEN);
    }

    #[test]
    fn test_region_label_zero_padded() {
        assert_eq!(region_label("16efd64ee392"), "Region_06");
        assert_eq!(region_label("07164cb53dc2"), "Region_86");
    }

    #[test]
    fn test_profile_depends_on_location_only() {
        let p = TemperatureProfile::for_location("Lisbon", TemperatureUnit::Celsius);
        assert_eq!(p.mean, 32.0);
        assert_eq!(p.std_dev, 1.0);
        assert_eq!(
            TemperatureProfile::for_location("Prime Meridian", TemperatureUnit::Celsius).mean,
            34.0
        );

        let f = TemperatureProfile::for_location("Lisbon", TemperatureUnit::Fahrenheit);
        assert!((f.mean - 89.6).abs() < 1e-9);
        assert!((f.std_dev - 1.8).abs() < 1e-9);
    }

    #[test]
    fn test_fleet_is_capped() {
        let mut rng = StdRng::seed_from_u64(7);
        let interval = SendInterval::new(100, 200).unwrap();
        let spec = FleetSpec {
            size: 40,
            seed: "cap",
            locations: None,
            unit: TemperatureUnit::Celsius,
        };
        let fleet = build_fleet(&spec, &interval, 0.0, &mut rng).unwrap();
        assert_eq!(fleet.len(), MAX_FLEET_SIZE);
        assert_eq!(fleet.last().unwrap().id, MAX_FLEET_SIZE - 1);
    }

    #[test]
    fn test_place_assignment_uses_serial_value() {
        let table = table();
        let (serial, location, _) =
            device_identity(0, "test-seed", Some(&table), TemperatureUnit::Celsius);
        // e5e1988fc965 is odd
        assert_eq!(serial, "e5e1988fc965");
        assert_eq!(location.name(), "Oslo");
        assert_eq!(location.coordinates(), Some((59.9139, 10.7522)));
    }

    #[test]
    fn test_same_arguments_same_identity() {
        let table = table();
        let interval = SendInterval::new(100, 200).unwrap();
        let spec = FleetSpec {
            size: 5,
            seed: "kafka",
            locations: Some(&table),
            unit: TemperatureUnit::Celsius,
        };
        let a = build_fleet(&spec, &interval, 0.0, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = build_fleet(&spec, &interval, 0.0, &mut StdRng::seed_from_u64(2)).unwrap();

        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.serial_number, y.serial_number);
            assert_eq!(x.location, y.location);
            assert_eq!(x.profile, y.profile);
        }
    }

    #[test]
    fn test_initial_temperature_is_rounded() {
        let mut rng = StdRng::seed_from_u64(3);
        let interval = SendInterval::new(0, 0).unwrap();
        let spec = FleetSpec {
            size: 3,
            seed: "round",
            locations: None,
            unit: TemperatureUnit::Celsius,
        };
        for device in build_fleet(&spec, &interval, 10.0, &mut rng).unwrap() {
            assert_eq!(device.temperature, round4(device.temperature));
            assert_eq!(device.next_send_at, 10.0);
        }
    }

    #[test]
    fn test_next_deadline_within_bounds() {
        let mut rng = StdRng::seed_from_u64(11);
        let interval = SendInterval::new(100, 200).unwrap();
        for _ in 0..1000 {
            let deadline = interval.next_deadline(50.0, &mut rng);
            assert!(deadline >= 50.1 - 1e-9 && deadline <= 50.2 + 1e-9);
        }
    }

    #[test]
    fn test_inverted_interval_rejected() {
        assert!(SendInterval::new(500, 100).is_err());
    }
}
