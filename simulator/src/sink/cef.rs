//! ArcSight Common Event Format records.

use std::fmt::Write;

const CEF_VERSION: u8 = 0;
const MAX_SEVERITY: u8 = 10;

fn escape_header(value: &str) -> String {
    value.replace('\\', "\\\\").replace('|', "\\|")
}

fn escape_extension(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('=', "\\=")
        .replace('\r', "\\r")
        .replace('\n', "\\n")
}

/// One CEF event: a fixed header plus ordered `key=value` extensions.
#[derive(Debug, Clone, PartialEq)]
pub struct CefEvent {
    vendor: String,
    product: String,
    version: String,
    signature_id: String,
    name: String,
    severity: u8,
    extensions: Vec<(String, String)>,
}

impl CefEvent {
    pub fn new(vendor: &str, product: &str, version: &str) -> Self {
        Self {
            vendor: vendor.to_string(),
            product: product.to_string(),
            version: version.to_string(),
            signature_id: "0".to_string(),
            name: String::new(),
            severity: 0,
            extensions: Vec::new(),
        }
    }

    pub fn signature_id(mut self, signature_id: impl ToString) -> Self {
        self.signature_id = signature_id.to_string();
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Clamped to the 0..=10 CEF range.
    pub fn severity(mut self, severity: u8) -> Self {
        self.severity = severity.min(MAX_SEVERITY);
        self
    }

    pub fn extension(mut self, key: &str, value: impl ToString) -> Self {
        self.extensions.push((key.to_string(), value.to_string()));
        self
    }

    pub fn build(&self) -> String {
        let mut out = format!(
            "CEF:{}|{}|{}|{}|{}|{}|{}|",
            CEF_VERSION,
            escape_header(&self.vendor),
            escape_header(&self.product),
            escape_header(&self.version),
            escape_header(&self.signature_id),
            escape_header(&self.name),
            self.severity
        );
        for (i, (key, value)) in self.extensions.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{}={}", key, escape_extension(value));
        }
        out
    }
}
