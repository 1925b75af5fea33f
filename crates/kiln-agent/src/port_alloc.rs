use std::{collections::HashSet, io::ErrorKind, net::TcpListener, ops::RangeInclusive};

use rand::seq::SliceRandom;

use crate::error::SupervisorError;

/// Ports tried when the requested one is unavailable.
pub const FALLBACK_RANGE: RangeInclusive<u16> = 25565..=25600;
const MAX_RETRIES: usize = 10;

/// True when nothing on this host is bound to `port`.
pub fn port_is_free(port: u16) -> bool {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => {
            drop(l);
            true
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => false,
        Err(e) => {
            tracing::debug!(port, %e, "port check failed");
            false
        }
    }
}

/// Picks a port for a new instance.
///
/// `taken` holds the ports of every other managed instance. The preferred port
/// wins when it is neither taken nor bound; otherwise up to ten random ports
/// from [`FALLBACK_RANGE`] are tried. `preferred == 0` skips straight to the range.
pub fn allocate_tcp_port(preferred: u16, taken: &HashSet<u16>) -> Result<u16, SupervisorError> {
    allocate_with(preferred, taken, port_is_free)
}

fn allocate_with(
    preferred: u16,
    taken: &HashSet<u16>,
    is_free: impl Fn(u16) -> bool,
) -> Result<u16, SupervisorError> {
    if preferred != 0 && !taken.contains(&preferred) && is_free(preferred) {
        return Ok(preferred);
    }

    let mut candidates: Vec<u16> = FALLBACK_RANGE
        .filter(|p| *p != preferred && !taken.contains(p))
        .collect();
    candidates.shuffle(&mut rand::thread_rng());

    for port in candidates.into_iter().take(MAX_RETRIES) {
        if is_free(port) {
            if preferred != 0 {
                tracing::info!(requested = preferred, assigned = port, "port in use, assigned another");
            }
            return Ok(port);
        }
    }

    Err(SupervisorError::PortUnavailable {
        requested: preferred,
    })
}
