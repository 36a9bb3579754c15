//! Port binding helpers and local port probing.

use std::collections::HashSet;

use super::types::{PortBinding, Protocol};
use crate::error::{Error, Result};

pub const LOOPBACK: &str = "127.0.0.1";

/// DNS name desktop (VM-backed) engines expose for the host.
pub const DESKTOP_HOST_ALIAS: &str = "host.docker.internal";

/// How many consecutive ports are tried when probing.
pub const PROBE_WINDOW: u16 = 10;

/// Build a binding of `host_ip:host_port` to `container_port`.
///
/// Accepts `5432`, `5432/tcp` or `53/udp`. The protocol comes from the
/// container side suffix, then the host side, then defaults to TCP.
pub fn map_ports(host_ip: &str, host_port: &str, container_port: &str) -> Result<PortBinding> {
    let (host_port, host_proto) = split_port(host_port)?;
    let (container_port, container_proto) = split_port(container_port)?;

    Ok(PortBinding {
        host_ip: host_ip.to_string(),
        host_port,
        container_port,
        protocol: container_proto.or(host_proto).unwrap_or_default(),
    })
}

fn split_port(raw: &str) -> Result<(u16, Option<Protocol>)> {
    let raw = raw.trim();
    let (number, protocol) = match raw.split_once('/') {
        Some((number, "udp")) => (number, Some(Protocol::Udp)),
        Some((number, "tcp")) => (number, Some(Protocol::Tcp)),
        Some((number, _)) => (number, None),
        None => (raw, None),
    };
    let port = number
        .trim()
        .parse::<u16>()
        .map_err(|_| Error::InvalidPort(raw.to_string()))?;
    if port == 0 {
        return Err(Error::InvalidPort(raw.to_string()));
    }
    Ok((port, protocol))
}

/// Reject two bindings claiming the same host port and protocol.
pub fn check_port_bindings(bindings: &[PortBinding]) -> Result<()> {
    let mut seen = HashSet::new();
    for binding in bindings {
        if !seen.insert((binding.host_port, binding.protocol)) {
            return Err(Error::PortConflict {
                port: binding.host_port,
                detail: format!(
                    "host port {}/{} is bound more than once",
                    binding.host_port,
                    binding.protocol.as_str()
                ),
            });
        }
    }
    Ok(())
}

/// Whether nothing is listening on `port` on the local IPv4 interfaces.
pub fn is_port_free(port: u16) -> bool {
    port_check::is_local_ipv4_port_free(port)
}

/// First port in `start..start + PROBE_WINDOW` that is free and not already
/// claimed by an earlier entry of the same reconciliation.
pub fn probe_port<F>(start: u16, claimed: &HashSet<u16>, is_free: F) -> Option<u16>
where
    F: Fn(u16) -> bool,
{
    (0..PROBE_WINDOW)
        .filter_map(|offset| start.checked_add(offset))
        .find(|port| !claimed.contains(port) && is_free(*port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_ports_strips_suffix() {
        let binding = map_ports(LOOPBACK, "5433/tcp", "5432").unwrap();
        assert_eq!(binding.host_ip, "127.0.0.1");
        assert_eq!(binding.host_port, 5433);
        assert_eq!(binding.container_port, 5432);
        assert_eq!(binding.protocol, Protocol::Tcp);

        let binding = map_ports(LOOPBACK, "5353", "53/udp").unwrap();
        assert_eq!(binding.protocol, Protocol::Udp);
    }

    #[test]
    fn test_map_ports_is_pure() {
        assert_eq!(
            map_ports(DESKTOP_HOST_ALIAS, "6379", "6379").unwrap(),
            map_ports(DESKTOP_HOST_ALIAS, "6379", "6379").unwrap()
        );
    }

    #[test]
    fn test_map_ports_rejects_garbage() {
        assert!(matches!(
            map_ports(LOOPBACK, "abc", "5432"),
            Err(Error::InvalidPort(_))
        ));
        assert!(map_ports(LOOPBACK, "70000", "5432").is_err());
        assert!(map_ports(LOOPBACK, "0", "5432").is_err());
    }

    #[test]
    fn test_overlapping_bindings() {
        let a = map_ports(LOOPBACK, "5432", "5432").unwrap();
        let b = map_ports(LOOPBACK, "5432", "5433").unwrap();
        let udp = map_ports(LOOPBACK, "5432", "5432/udp").unwrap();
        assert!(check_port_bindings(&[a.clone(), udp]).is_ok());
        assert!(matches!(
            check_port_bindings(&[a, b]),
            Err(Error::PortConflict { port: 5432, .. })
        ));
    }

    #[test]
    fn test_probe_skips_busy_and_claimed() {
        let busy: HashSet<u16> = [5432, 5433].into_iter().collect();
        let claimed: HashSet<u16> = [5434].into_iter().collect();
        let port = probe_port(5432, &claimed, |p| !busy.contains(&p));
        assert_eq!(port, Some(5435));
    }

    #[test]
    fn test_probe_gives_up_after_window() {
        assert_eq!(probe_port(5432, &HashSet::new(), |_| false), None);
        let port = probe_port(5432, &HashSet::new(), |p| p == 5432 + PROBE_WINDOW);
        assert_eq!(port, None);
    }

    #[test]
    fn test_probe_real_listener() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();
        assert!(!is_port_free(taken));
    }
}
