//! Hardware operating mode checks for dual-mode adapters.
//!
//! WCH-Link adapters enumerate with a different USB product ID depending on
//! the firmware mode selected on the device:
//!
//! | PID    | mode   | valid transports |
//! |--------|--------|------------------|
//! | `8010` | RISC-V | `sdi` only       |
//! | `8012` | ARM    | `swd`, `jtag`    |
//!
//! A request that cannot work with the mode the probe is physically in is
//! rejected before anything is started, with enough detail (target,
//! interface, probe, PID) for an operator to fix it without probing the
//! hardware by hand.

use std::fmt;

use crate::{
    config::{normalize_transport, normalize_usb_id, InterfaceKind, Mode, ProbeConfig},
    error::{Error, Result},
};

/// The only transport a RISC-V mode WCH-Link can speak.
pub const SDI: &str = "sdi";

const PID_RISCV: &str = "8010";
const PID_ARM: &str = "8012";

/// Firmware-selected operating mode of a dual-mode adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareMode {
    /// Constrained mode: transport fixed to [`SDI`]
    RiscV,
    /// Standard mode: multi-wire transports, never [`SDI`]
    Arm,
}

impl HardwareMode {
    /// Derive the mode from a probe's USB identity.
    ///
    /// Returns `None` for non-WCH probes and unrecognised product IDs.
    pub fn of(probe: &ProbeConfig) -> Option<Self> {
        if probe.interface != InterfaceKind::WchLink {
            return None;
        }
        match normalize_usb_id(&probe.product_id).as_str() {
            PID_RISCV => Some(HardwareMode::RiscV),
            PID_ARM => Some(HardwareMode::Arm),
            _ => None,
        }
    }
}

impl fmt::Display for HardwareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareMode::RiscV => f.write_str("RISC-V"),
            HardwareMode::Arm => f.write_str("ARM"),
        }
    }
}

/// Reject transports that conflict with the probe's hardware mode.
///
/// `requested` is what the caller asked for; `resolved` is what policy
/// resolution produced. A bad `requested` value is a caller error
/// ([`Error::HardwareModeConflict`]); a bad `resolved` value means the
/// target's policy does not fit the probe ([`Error::TransportPolicyMismatch`]).
pub fn validate(
    target: &str,
    interface: &InterfaceKind,
    probe: &ProbeConfig,
    requested: Option<&str>,
    resolved: Option<&str>,
    mode: Mode,
) -> Result<()> {
    if mode == Mode::Print || *interface != InterfaceKind::WchLink {
        return Ok(());
    }

    let Some(hw_mode) = HardwareMode::of(probe) else {
        return Ok(());
    };

    let requested = requested.and_then(normalize_transport);
    let resolved = resolved.and_then(normalize_transport);
    let pid = normalize_usb_id(&probe.product_id);

    match hw_mode {
        HardwareMode::RiscV => {
            if let Some(requested) = requested.filter(|t| t != SDI) {
                return Err(Error::HardwareModeConflict(format!(
                    "Transport '{}' is invalid for target={}, interface={}: WCH-Link probe {} \
                     is in {} mode (USB PID {}), so transport is fixed to '{}'. Use \
                     '--transport {}' or omit '--transport'. To use SWD/JTAG, switch the \
                     probe to ARM mode (USB PID {}).",
                    requested, target, interface, probe.id, hw_mode, pid, SDI, SDI, PID_ARM
                )));
            }
            if let Some(resolved) = resolved.filter(|t| t != SDI) {
                return Err(Error::TransportPolicyMismatch(format!(
                    "Transport policy mismatch for target={}, interface={}: WCH-Link probe {} \
                     is in {} mode (USB PID {}) and requires '{}', but resolved transport is \
                     '{}'. Set targets.{}.transports.{} to default/allowed '{}'.",
                    target, interface, probe.id, hw_mode, pid, SDI, resolved, target, interface,
                    SDI
                )));
            }
        }
        HardwareMode::Arm => {
            if requested.as_deref() == Some(SDI) {
                return Err(Error::HardwareModeConflict(format!(
                    "Transport '{}' is invalid for target={}, interface={}: WCH-Link probe {} \
                     is in {} mode (USB PID {}), so choose 'swd' or 'jtag'.",
                    SDI, target, interface, probe.id, hw_mode, pid
                )));
            }
        }
    }

    Ok(())
}
