//! Connection status of configured probes.
//!
//! Each probe is expected at `<device_dir>/probe_<id>`, a stable symlink
//! installed by the station's udev rules. The device behind it is looked up
//! in the udev database for its serial number, which is compared with the
//! configured one. The lock state comes from [`ProbeLock::is_free`].

use serde::Serialize;
use std::{
    fs, io,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

use crate::{
    config::Config,
    error::Result,
    lock::ProbeLock,
    tracing::prelude::*,
};

/// What udev knows about an attached probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub vendor_id: String,
    pub product_id: String,
}

/// Source of device information for a probe.
pub trait DeviceLookup {
    /// `None` when the probe is not attached.
    fn lookup(&self, probe_id: u32) -> Option<DeviceInfo>;
}

/// Looks probes up through their device links and the udev database.
#[derive(Debug, Clone)]
pub struct UdevLookup {
    dir: PathBuf,
}

impl UdevLookup {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, probe_id: u32) -> PathBuf {
        self.dir.join(format!("probe_{}", probe_id))
    }
}

impl DeviceLookup for UdevLookup {
    fn lookup(&self, probe_id: u32) -> Option<DeviceInfo> {
        let path = self.path(probe_id);
        match query_udev(&path) {
            Ok(info) => info,
            Err(e) => {
                warn!(probe = probe_id, path = %path.display(), error = %e, "udev query failed");
                None
            }
        }
    }
}

fn query_udev(path: &Path) -> io::Result<Option<DeviceInfo>> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let file_type = metadata.file_type();
    let dev_type = if file_type.is_char_device() {
        udev::DeviceType::Character
    } else if file_type.is_block_device() {
        udev::DeviceType::Block
    } else {
        return Ok(None);
    };

    let device = udev::Device::from_devnum(dev_type, metadata.rdev())?;
    let property = |key: &str| {
        device
            .property_value(key)
            .map(|value| value.to_string_lossy().into_owned())
    };

    Ok(Some(DeviceInfo {
        serial: property("ID_SERIAL_SHORT")
            .or_else(|| property("ID_SERIAL"))
            .unwrap_or_default(),
        vendor_id: property("ID_VENDOR_ID").unwrap_or_default(),
        product_id: property("ID_MODEL_ID").unwrap_or_default(),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeStatus {
    pub id: u32,
    pub name: String,
    pub status: Connection,
    /// Serial reported by the attached device, empty when disconnected
    pub serial: String,
    pub expected_serial: String,
    /// Attached and, if a serial is configured, reporting that serial
    #[serde(rename = "match")]
    pub serial_match: bool,
    /// Whether a session currently holds the probe's lock
    pub locked: bool,
}

/// Status of every configured probe, in configuration order.
///
/// The lock state is a snapshot taken by briefly acquiring each free lock.
pub fn report(
    config: &Config,
    devices: &dyn DeviceLookup,
    locks: &ProbeLock,
) -> Result<Vec<ProbeStatus>> {
    config
        .probes
        .iter()
        .map(|probe| {
            let locked = !locks.is_free(probe.id)?;
            let status = match devices.lookup(probe.id) {
                Some(device) => ProbeStatus {
                    id: probe.id,
                    name: probe.name.clone(),
                    status: Connection::Connected,
                    serial_match: probe.serial.is_empty() || device.serial == probe.serial,
                    serial: device.serial,
                    expected_serial: probe.serial.clone(),
                    locked,
                },
                None => ProbeStatus {
                    id: probe.id,
                    name: probe.name.clone(),
                    status: Connection::Disconnected,
                    serial: String::new(),
                    expected_serial: probe.serial.clone(),
                    serial_match: false,
                    locked,
                },
            };
            if status.status == Connection::Connected && !status.serial_match {
                warn!(
                    probe = probe.id,
                    expected = %status.expected_serial,
                    found = %status.serial,
                    "Probe serial mismatch"
                );
            }
            Ok(status)
        })
        .collect()
}
