//! Probe lookup by interface alias, USB identity, serial, or name.

use serde::Serialize;

use crate::config::{normalize_usb_id, Config, ProbeConfig};

/// Search criteria. Every populated field must match.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeQuery {
    pub interface: Option<String>,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub serial: Option<String>,
    /// Case-insensitive substring of the probe name
    pub name: Option<String>,
}

impl ProbeQuery {
    fn is_empty(&self) -> bool {
        self.interface.is_none()
            && self.vendor_id.is_none()
            && self.product_id.is_none()
            && self.serial.is_none()
            && self.name.is_none()
    }

    fn matches(&self, probe: &ProbeConfig) -> bool {
        if let Some(interface) = &self.interface {
            let wanted = normalize_interface_name(interface);
            if wanted != normalize_interface_name(probe.interface.as_str()) {
                return false;
            }
        }
        if let Some(vid) = &self.vendor_id {
            if normalize_usb_id(vid) != normalize_usb_id(&probe.vendor_id) {
                return false;
            }
        }
        if let Some(pid) = &self.product_id {
            if normalize_usb_id(pid) != normalize_usb_id(&probe.product_id) {
                return false;
            }
        }
        if let Some(serial) = &self.serial {
            if *serial != probe.serial {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !probe.name.to_lowercase().contains(&name.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult<'a> {
    pub query: ProbeQuery,
    pub matches: Vec<&'a ProbeConfig>,
    pub count: usize,
}

// Common names operators use for each interface family.
const ALIASES: &[(&str, &[&str])] = &[
    ("jlink", &["jlink", "segger", "swd"]),
    ("cmsisdap", &["cmsisdap", "cmsis", "dap"]),
    ("wchlink", &["wchlink", "wch", "wchlinke"]),
];

/// Fold an interface name to its canonical alias key.
pub fn normalize_interface_name(name: &str) -> String {
    let folded: String = name
        .to_lowercase()
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect();
    ALIASES
        .iter()
        .find(|(_, names)| names.contains(&folded.as_str()))
        .map(|(key, _)| key.to_string())
        .unwrap_or(folded)
}

/// Search configured probes. An empty query returns every probe.
pub fn search<'a>(config: &'a Config, query: ProbeQuery) -> SearchResult<'a> {
    let matches: Vec<&ProbeConfig> = if query.is_empty() {
        config.probes.iter().collect()
    } else {
        config.probes.iter().filter(|p| query.matches(p)).collect()
    };
    SearchResult {
        count: matches.len(),
        query,
        matches,
    }
}
