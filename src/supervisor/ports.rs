//! Worker port selection.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use crate::provider::GatewayError;

/// Ports tried after the starting one before giving up.
pub const PORT_SCAN_WINDOW: u16 = 20;

/// Answers whether a loopback port can be bound right now.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding and immediately releasing a listener.
pub struct TcpPortProbe;

impl PortProbe for TcpPortProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}

/// Pick the first usable port at or above `start`.
///
/// Ports in `rejected` are skipped without probing. Ports found occupied are
/// added to `rejected`, so later calls in the same startup sequence never
/// probe them again.
pub fn select_port(
    probe: &dyn PortProbe,
    start: u16,
    rejected: &mut BTreeSet<u16>,
    window: u16,
) -> Result<u16, GatewayError> {
    let last = start.saturating_add(window);
    for port in start..=last {
        if rejected.contains(&port) {
            continue;
        }
        if probe.is_free(port) {
            if port != start {
                tracing::info!(requested = start, selected = port, "requested port busy, using next free port");
            }
            return Ok(port);
        }
        tracing::debug!(port, "port occupied");
        rejected.insert(port);
    }
    Err(GatewayError::PortInUse { first: start, last })
}
