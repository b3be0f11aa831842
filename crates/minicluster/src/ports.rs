//! Free-port reservation shared by every cluster in the process.
//!
//! Services bind their ports some time after we pick them, so probing alone
//! cannot keep two clusters apart. Every reservation is recorded in a
//! process-wide registry, and picking plus recording happens under one lock.
//! A port leaves the registry when its [`PortReservation`] is dropped.

use crate::{Error, Result};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Mutex;

static RESERVED: Mutex<BTreeSet<u16>> = Mutex::new(BTreeSet::new());

/// Probes beyond the requested count before giving up.
pub const DEFAULT_EXTRA_ATTEMPTS: usize = 64;

/// Picks ports that are free now and not held by another live reservation.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
    extra_attempts: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortAllocator {
    /// Allocator probing on `host`.
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            extra_attempts: DEFAULT_EXTRA_ATTEMPTS,
        }
    }

    /// Sets how many failed probes are tolerated on top of the requested count.
    pub fn with_extra_attempts(mut self, attempts: usize) -> Self {
        self.extra_attempts = attempts;
        self
    }

    /// Reserves `n` free ports.
    pub fn reserve(&self, n: usize) -> Result<PortReservation> {
        self.reserve_with(&[], n)
    }

    /// Reserves the caller's `fixed` ports plus `n` more free ones.
    ///
    /// Fixed ports must be distinct, not reserved by anyone else and bindable
    /// right now.
    pub fn reserve_with(&self, fixed: &[u16], n: usize) -> Result<PortReservation> {
        let mut registry = RESERVED.lock().unwrap_or_else(|e| e.into_inner());

        let mut taken = BTreeSet::new();
        for &port in fixed {
            if port == 0 {
                return Err(Error::Configuration("port 0 cannot be reserved".into()));
            }
            if !taken.insert(port) {
                return Err(Error::Configuration(format!(
                    "port {port} requested more than once"
                )));
            }
            if registry.contains(&port) {
                return Err(Error::Configuration(format!(
                    "port {port} is already reserved by another cluster"
                )));
            }
            if !self.is_bindable(port) {
                return Err(Error::Configuration(format!("port {port} is already in use")));
            }
        }

        let limit = n + self.extra_attempts;
        let mut allocated = Vec::with_capacity(n);
        let mut attempts = 0;
        while allocated.len() < n && attempts < limit {
            attempts += 1;
            let Some(port) = self.probe_ephemeral() else {
                continue;
            };
            if registry.contains(&port) || !taken.insert(port) {
                continue;
            }
            allocated.push(port);
        }

        if allocated.len() < n {
            return Err(Error::PortAllocation {
                requested: n,
                found: allocated.len(),
                attempts,
            });
        }

        registry.extend(taken.iter().copied());
        tracing::debug!(?fixed, ?allocated, "reserved ports");

        Ok(PortReservation {
            fixed: fixed.to_vec(),
            allocated,
        })
    }

    /// Returns whether `port` is currently held by a live reservation.
    pub fn is_reserved(port: u16) -> bool {
        RESERVED
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&port)
    }

    fn is_bindable(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(self.host, port)).is_ok()
    }

    fn probe_ephemeral(&self) -> Option<u16> {
        let listener = TcpListener::bind(SocketAddr::new(self.host, 0)).ok()?;
        let port = listener.local_addr().ok()?.port();
        drop(listener);
        Some(port)
    }
}

/// Ports held for one cluster. Released back to the registry on drop.
#[derive(Debug)]
pub struct PortReservation {
    fixed: Vec<u16>,
    allocated: Vec<u16>,
}

impl PortReservation {
    /// Ports supplied by the caller, in request order.
    pub fn fixed(&self) -> &[u16] {
        &self.fixed
    }

    /// Ports picked by probing, in allocation order.
    pub fn allocated(&self) -> &[u16] {
        &self.allocated
    }

    /// Every held port.
    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.fixed.iter().chain(self.allocated.iter()).copied()
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        let mut registry = RESERVED.lock().unwrap_or_else(|e| e.into_inner());
        for port in self.fixed.iter().chain(self.allocated.iter()) {
            registry.remove(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_reserve_distinct_ports() {
        let reservation = PortAllocator::default().reserve(5).unwrap();
        let ports: HashSet<u16> = reservation.ports().collect();

        assert_eq!(ports.len(), 5);
        for port in &ports {
            assert!(PortAllocator::is_reserved(*port));
        }
    }

    #[test]
    fn test_release_on_drop() {
        let reservation = PortAllocator::default().reserve(2).unwrap();
        let ports: Vec<u16> = reservation.ports().collect();
        drop(reservation);

        for port in ports {
            assert!(!PortAllocator::is_reserved(port));
        }
    }

    #[test]
    fn test_concurrent_reservations_are_disjoint() {
        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| PortAllocator::default().reserve(6).unwrap()))
            .collect();
        let reservations: Vec<PortReservation> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mut seen = HashSet::new();
        for reservation in &reservations {
            for port in reservation.ports() {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(seen.len(), 48);
    }

    #[test]
    fn test_fixed_port_already_reserved() {
        let first = PortAllocator::default().reserve(1).unwrap();
        let port = first.allocated()[0];

        let err = PortAllocator::default().reserve_with(&[port], 0).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_fixed_port_duplicated() {
        let err = PortAllocator::default()
            .reserve_with(&[40_123, 40_123], 0)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_fixed_port_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = PortAllocator::default().reserve_with(&[port], 0).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_probe_bound_exhausted() {
        // Binding to a non-local address fails every probe.
        let allocator =
            PortAllocator::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1))).with_extra_attempts(3);

        let err = allocator.reserve(2).unwrap_err();
        assert!(matches!(
            err,
            Error::PortAllocation {
                requested: 2,
                found: 0,
                attempts: 5
            }
        ));
    }
}
