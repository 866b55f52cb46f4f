//! Payload encoding with per-transport key names.

use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};
use crate::fleet::Device;

/// Logical payload fields, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Timestamp,
    Temperature,
    SerialNumber,
    Manufacturer,
    DeviceFamily,
    Location,
    Latitude,
    Longitude,
    Unit,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::Timestamp,
        Field::Temperature,
        Field::SerialNumber,
        Field::Manufacturer,
        Field::DeviceFamily,
        Field::Location,
        Field::Latitude,
        Field::Longitude,
        Field::Unit,
    ];

    pub fn default_key(&self) -> &'static str {
        match self {
            Field::Timestamp => "timestamp",
            Field::Temperature => "temperature",
            Field::SerialNumber => "serial_number",
            Field::Manufacturer => "manufacturer",
            Field::DeviceFamily => "device_family",
            Field::Location => "location",
            Field::Latitude => "lat",
            Field::Longitude => "lng",
            Field::Unit => "unit",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "timestamp" => Ok(Field::Timestamp),
            "temperature" => Ok(Field::Temperature),
            "serial_number" => Ok(Field::SerialNumber),
            "manufacturer" => Ok(Field::Manufacturer),
            "device_family" => Ok(Field::DeviceFamily),
            "location" => Ok(Field::Location),
            "lat" | "latitude" => Ok(Field::Latitude),
            "lng" | "longitude" => Ok(Field::Longitude),
            "unit" => Ok(Field::Unit),
            other => Err(Error::Config(format!("unknown payload field '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TimestampMode {
    #[default]
    EpochMillis,
    Iso8601,
}

impl TimestampMode {
    pub fn render(&self, at: DateTime<Utc>) -> Value {
        match self {
            TimestampMode::EpochMillis => Value::from(at.timestamp_millis()),
            TimestampMode::Iso8601 => Value::from(at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        }
    }
}

/// Output key for every logical field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNames {
    keys: [String; 9],
}

impl Default for KeyNames {
    fn default() -> Self {
        Self {
            keys: Field::ALL.map(|f| f.default_key().to_string()),
        }
    }
}

impl KeyNames {
    pub fn with(mut self, field: Field, key: impl Into<String>) -> Self {
        self.set(field, key);
        self
    }

    pub fn set(&mut self, field: Field, key: impl Into<String>) {
        self.keys[field.index()] = key.into();
    }

    pub fn key(&self, field: Field) -> &str {
        &self.keys[field.index()]
    }

    /// Keys must be non-empty and pairwise distinct.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for field in Field::ALL {
            let key = self.key(field);
            if key.is_empty() {
                return Err(Error::Config(format!("empty key for field {:?}", field)));
            }
            if !seen.insert(key) {
                return Err(Error::Config(format!(
                    "key '{}' is used by more than one field",
                    key
                )));
            }
        }
        Ok(())
    }
}

/// Parses a `FIELD=NAME` override.
pub fn parse_key_override(raw: &str) -> Result<(Field, String)> {
    let (field, key) = raw
        .split_once('=')
        .ok_or_else(|| Error::Config(format!("expected FIELD=NAME, got '{}'", raw)))?;
    Ok((field.parse()?, key.trim().to_string()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayloadEntry {
    pub field: Field,
    pub key: String,
    pub value: Value,
}

/// Ordered key/value record handed to a sink.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    entries: Vec<PayloadEntry>,
}

impl Payload {
    pub fn builder(timestamp_key: &str, timestamp: Value) -> PayloadBuilder {
        PayloadBuilder {
            payload: Payload {
                entries: vec![PayloadEntry {
                    field: Field::Timestamp,
                    key: timestamp_key.to_string(),
                    value: timestamp,
                }],
            },
        }
    }

    pub fn entries(&self) -> &[PayloadEntry] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    pub fn get(&self, field: Field) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.field == field)
            .map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.key, &entry.value)?;
        }
        map.end()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.entries),
        }
    }
}

/// Appends `(field, value, key)` triples, dropping absent values.
pub struct PayloadBuilder {
    payload: Payload,
}

impl PayloadBuilder {
    pub fn field(mut self, field: Field, value: Option<Value>, key: &str) -> Self {
        if let Some(value) = value.filter(|v| !v.is_null()) {
            self.payload.entries.push(PayloadEntry {
                field,
                key: key.to_string(),
                value,
            });
        }
        self
    }

    pub fn build(self) -> Payload {
        self.payload
    }
}

/// Builds device payloads for one transport.
#[derive(Debug, Clone)]
pub struct PayloadEncoder {
    pub keys: KeyNames,
    pub timestamp_mode: TimestampMode,
    /// Device attributes the transport reports. Anything else stays absent.
    pub fields: Vec<Field>,
    pub manufacturer: Option<String>,
    pub device_family: Option<String>,
    pub unit: Option<String>,
}

impl PayloadEncoder {
    pub fn new(keys: KeyNames, timestamp_mode: TimestampMode, fields: Vec<Field>) -> Result<Self> {
        keys.validate()?;
        Ok(Self {
            keys,
            timestamp_mode,
            fields,
            manufacturer: None,
            device_family: None,
            unit: None,
        })
    }

    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn device_family(mut self, device_family: impl Into<String>) -> Self {
        self.device_family = Some(device_family.into());
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    fn value_of(&self, field: Field, device: &Device) -> Option<Value> {
        if !self.fields.contains(&field) {
            return None;
        }
        match field {
            Field::Timestamp => None,
            Field::Temperature => Some(Value::from(device.temperature)),
            Field::SerialNumber => Some(Value::from(device.serial_number.as_str())),
            Field::Manufacturer => self.manufacturer.as_deref().map(Value::from),
            Field::DeviceFamily => self.device_family.as_deref().map(Value::from),
            Field::Location => Some(Value::from(device.location.name())),
            Field::Latitude => device.location.coordinates().map(|(lat, _)| Value::from(lat)),
            Field::Longitude => device.location.coordinates().map(|(_, lng)| Value::from(lng)),
            Field::Unit => self.unit.as_deref().map(Value::from),
        }
    }

    pub fn encode(&self, device: &Device, at: DateTime<Utc>) -> Payload {
        let builder = Payload::builder(
            self.keys.key(Field::Timestamp),
            self.timestamp_mode.render(at),
        );
        Field::ALL[1..]
            .iter()
            .fold(builder, |b, &field| {
                b.field(field, self.value_of(field, device), self.keys.key(field))
            })
            .build()
    }
}
