use super::SandboxError;
use crate::config::PortRange;
use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

/// Hands out host ports from a fixed range so concurrent sessions never bind
/// the same port.
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    leased: Mutex<BTreeSet<u16>>,
    check_host: bool,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Arc<Self> {
        Arc::new(Self {
            range,
            leased: Mutex::new(BTreeSet::new()),
            check_host: true,
        })
    }

    /// Allocator that trusts its own bookkeeping only and never binds.
    pub fn without_host_check(range: PortRange) -> Arc<Self> {
        Arc::new(Self {
            range,
            leased: Mutex::new(BTreeSet::new()),
            check_host: false,
        })
    }

    pub fn acquire(self: &Arc<Self>) -> Result<PortLease, SandboxError> {
        let mut leased = self
            .leased
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for port in self.range.start..self.range.end {
            if leased.contains(&port) {
                continue;
            }
            if self.check_host && TcpListener::bind(("127.0.0.1", port)).is_err() {
                continue;
            }
            leased.insert(port);
            return Ok(PortLease {
                port,
                allocator: Arc::clone(self),
                retained: false,
            });
        }
        Err(SandboxError::PortsExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Returns a retained port to the pool once its environment is gone.
    pub fn release(&self, port: u16) {
        self.leased
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&port);
    }

    pub fn leased_count(&self) -> usize {
        self.leased
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
    retained: bool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Keeps the port reserved after the lease is dropped.
    pub fn retain(mut self) -> u16 {
        self.retained = true;
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if !self.retained {
            self.allocator.release(self.port);
        }
    }
}
