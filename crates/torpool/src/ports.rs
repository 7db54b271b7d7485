//! Local port reservation
//!
//! Ports are obtained by binding to port 0 and reading back what the OS
//! picked. All listeners stay open until every port has been read, so a
//! single call never returns the same port twice. They are then released
//! for the daemons to bind. Another process can still take a port in that
//! window; the affected launch then fails.

use std::net::{IpAddr, SocketAddr, TcpListener};

use tracing::debug;

use crate::error::{PoolError, Result};

/// Reserve `count` distinct free TCP ports on `host`
pub fn allocate_ports(host: IpAddr, count: usize) -> Result<Vec<u16>> {
    let listeners = (0..count)
        .map(|_| TcpListener::bind(SocketAddr::new(host, 0)))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(PoolError::PortAllocation)?;

    let ports = listeners
        .iter()
        .map(|l| l.local_addr().map(|addr| addr.port()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(PoolError::PortAllocation)?;

    drop(listeners);
    debug!(?ports, "Allocated ports");
    Ok(ports)
}

/// Ports split into the two roles, index-aligned per instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAssignment {
    pub proxy: Vec<u16>,
    pub control: Vec<u16>,
}

impl PortAssignment {
    /// Allocate proxy and control ports for `instances` daemons
    pub fn allocate(host: IpAddr, instances: usize) -> Result<Self> {
        Ok(Self::split(allocate_ports(host, instances * 2)?))
    }

    /// First half becomes proxy ports, second half control ports
    ///
    /// An odd trailing port is dropped.
    pub fn split(mut ports: Vec<u16>) -> Self {
        let half = ports.len() / 2;
        ports.truncate(half * 2);
        let control = ports.split_off(half);
        Self {
            proxy: ports,
            control,
        }
    }

    pub fn len(&self) -> usize {
        self.proxy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxy.is_empty()
    }

    /// `(proxy, control)` for instance `index`
    pub fn get(&self, index: usize) -> Option<(u16, u16)> {
        Some((*self.proxy.get(index)?, *self.control.get(index)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_allocated_ports_are_distinct() {
        let ports = allocate_ports(LOCALHOST, 16).unwrap();
        assert_eq!(ports.len(), 16);

        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), 16);
        assert!(ports.iter().all(|&p| p != 0));
    }

    #[test]
    fn test_allocated_ports_are_released() {
        let ports = allocate_ports(LOCALHOST, 4).unwrap();
        for port in ports {
            // Can race with other processes, but on a test host this should hold.
            assert!(TcpListener::bind(SocketAddr::new(LOCALHOST, port)).is_ok());
        }
    }

    #[test]
    fn test_assignment_roles_never_collide() {
        let assignment = PortAssignment::allocate(LOCALHOST, 5).unwrap();
        assert_eq!(assignment.len(), 5);

        let proxy: HashSet<_> = assignment.proxy.iter().collect();
        let control: HashSet<_> = assignment.control.iter().collect();
        assert_eq!(proxy.len(), 5);
        assert_eq!(control.len(), 5);
        assert!(proxy.is_disjoint(&control));
    }

    #[test]
    fn test_split_first_half_is_proxy() {
        let assignment = PortAssignment::split(vec![9050, 9052, 9054, 9051, 9053, 9055]);
        assert_eq!(assignment.proxy, vec![9050, 9052, 9054]);
        assert_eq!(assignment.control, vec![9051, 9053, 9055]);
        assert_eq!(assignment.get(1), Some((9052, 9053)));
        assert_eq!(assignment.get(3), None);
    }

    #[test]
    fn test_split_drops_odd_port() {
        let assignment = PortAssignment::split(vec![1, 2, 3]);
        assert_eq!(assignment.proxy, vec![1]);
        assert_eq!(assignment.control, vec![2]);
    }
}
