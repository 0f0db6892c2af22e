//! First-fit IPv4 allocator over a configured subnet (spec §4.4). An
//! in-memory, address-ordered set of free addresses, excluding the gateway
//! and the subnet's broadcast address.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("IPv4 address pool exhausted")]
pub struct IpExhaustedError;

/// Address pool for one subnet. Allocation is first-fit by address order;
/// release returns an address to the free set so it can be reused
/// immediately by a later allocation.
#[derive(Debug)]
pub struct IpAllocator {
    free: BTreeSet<Ipv4Addr>,
}

impl IpAllocator {
    /// Build the pool from `subnet`, excluding `gateway` and the subnet's
    /// broadcast address from the allocatable set.
    pub fn new(subnet: cidr::Ipv4Cidr, gateway: Ipv4Addr) -> Self {
        let broadcast = subnet.last_address();
        let free = subnet
            .iter()
            .addresses()
            .filter(|addr| *addr != gateway && *addr != broadcast)
            .collect();
        Self { free }
    }

    /// Allocate the lowest free address.
    pub fn allocate(&mut self) -> Result<Ipv4Addr, IpExhaustedError> {
        let addr = *self.free.iter().next().ok_or(IpExhaustedError)?;
        self.free.remove(&addr);
        Ok(addr)
    }

    /// Return `addr` to the free pool. Releasing an address not drawn from
    /// this pool (or already free) is a no-op.
    pub fn release(&mut self, addr: Ipv4Addr) {
        self.free.insert(addr);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}
