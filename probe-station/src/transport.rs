//! Transport policy resolution.
//!
//! Decides which wire-level transport (SWD, JTAG, SDI, ...) a session uses,
//! from the caller's request and the target's per-interface policy. Pure: no
//! state and no I/O, so it runs before any lock is taken.

use crate::{
    config::{normalize_transport, Config, InterfaceKind, Mode},
    error::{Error, Result},
};

/// Resolve the transport for a (target, interface) pair.
///
/// Returns `Ok(None)` in print mode, or when nothing was requested and the
/// policy has no default. A requested transport must be a member of the
/// policy's allowed set; it is never silently replaced by the default.
pub fn resolve(
    config: &Config,
    target: &str,
    interface: &InterfaceKind,
    requested: Option<&str>,
    mode: Mode,
) -> Result<Option<String>> {
    if mode == Mode::Print {
        return Ok(None);
    }

    let policy = config.transport_policy(target, interface);

    let Some(requested) = requested.and_then(normalize_transport) else {
        return Ok(policy.effective_default().map(str::to_string));
    };

    if policy.is_empty() {
        return Err(Error::TransportNotAllowed(format!(
            "Transport '{}' was requested for target={}, interface={}, but no transport \
             policy is configured. Allowed: []",
            requested, target, interface
        )));
    }

    if !policy.allowed.contains(&requested) {
        if *interface == InterfaceKind::WchLink && policy.allowed == ["sdi"] {
            return Err(Error::TransportNotAllowed(format!(
                "Transport '{}' is invalid for target={}, interface={}: this WCH RISC-V \
                 target is fixed to 'sdi'. Allowed: [sdi]. Use '--transport sdi' or omit \
                 '--transport'. For SWD/JTAG, switch the probe to ARM mode (USB PID 8012) \
                 and use an ARM target policy.",
                requested, target, interface
            )));
        }
        return Err(Error::TransportNotAllowed(format!(
            "Transport '{}' is not allowed for target={}, interface={}. Allowed: [{}]",
            requested,
            target,
            interface,
            policy.allowed.join(", ")
        )));
    }

    Ok(Some(requested))
}
