//! In-process port reservation.
//!
//! The used-port set is the only mutable state shared by concurrent session
//! starts. Picking a free port, probing it and recording it happen under one
//! synchronous lock with no await in between.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use rand::Rng;
use thiserror::Error;

/// Default range for session backends.
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 41000..=41999;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}

/// Failure binding a listener. `AddrInUse` is the only variant the
/// coordinator retries.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("address {0} is already in use")]
    AddrInUse(SocketAddr),

    #[error("failed to bind {addr}: {source}")]
    Other {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    pub fn from_io(addr: SocketAddr, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::AddrInUse {
            BindError::AddrInUse(addr)
        } else {
            BindError::Other { addr, source: err }
        }
    }

    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, BindError::AddrInUse(_))
    }
}

/// Bind a tokio listener, classifying "address in use".
pub async fn bind_tcp(addr: SocketAddr) -> Result<tokio::net::TcpListener, BindError> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BindError::from_io(addr, e))
}

/// Hands out ports from a fixed range, never one it already holds.
#[derive(Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    bind_host: IpAddr,
    used: Arc<Mutex<HashSet<u16>>>,
}

impl fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortAllocator")
            .field("range", &self.range)
            .field("bind_host", &self.bind_host)
            .field("reserved", &self.reserved_count())
            .finish()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, bind_host: IpAddr) -> Self {
        Self {
            range,
            bind_host,
            used: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn bind_host(&self) -> IpAddr {
        self.bind_host
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        // A panic while holding the lock cannot leave the set half-updated.
        self.used.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn probe(&self, port: u16) -> bool {
        std::net::TcpListener::bind((self.bind_host, port)).is_ok()
    }

    /// Reserve a free, currently bindable port.
    ///
    /// Scans the range starting at a random offset so concurrent processes
    /// sharing a range rarely collide.
    pub fn reserve(&self) -> Result<PortReservation, PortError> {
        let start = *self.range.start();
        let end = *self.range.end();
        if start > end {
            return Err(PortError::Exhausted { start, end });
        }

        let span = u32::from(end - start) + 1;
        let offset = rand::rng().random_range(0..span);

        let mut used = self.lock();
        for i in 0..span {
            let port = (u32::from(start) + (offset + i) % span) as u16;
            if used.contains(&port) || !self.probe(port) {
                continue;
            }
            used.insert(port);
            debug!("Reserved port {}", port);
            return Ok(PortReservation::new(port, self.used.clone()));
        }

        Err(PortError::Exhausted { start, end })
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().len()
    }
}

/// A held port. Dropping it returns the port to the pool.
pub struct PortReservation {
    port: u16,
    used: Arc<Mutex<HashSet<u16>>>,
    released: bool,
}

impl PortReservation {
    fn new(port: u16, used: Arc<Mutex<HashSet<u16>>>) -> Self {
        Self {
            port,
            used,
            released: false,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut used = self.used.lock().unwrap_or_else(|p| p.into_inner());
        if used.remove(&self.port) {
            debug!("Released port {}", self.port);
        }
    }
}

impl fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortReservation")
            .field("port", &self.port)
            .finish()
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.release_inner();
    }
}
