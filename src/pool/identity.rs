//! Egress identities: a local address paired with its own rate budget.

use std::fmt;
use std::net::IpAddr;

use super::counter::{CounterMirror, RateCounter};

/// A local address used to originate upstream calls.
#[derive(Debug)]
pub struct EgressIdentity {
    address: IpAddr,
    rate_limit: u64,
    counter: RateCounter,
}

impl EgressIdentity {
    /// Create an identity with a local-only counter.
    pub fn new(address: IpAddr, rate_limit: u64) -> Self {
        Self {
            address,
            rate_limit,
            counter: RateCounter::new(counter_key(address)),
        }
    }

    /// Create an identity whose counter is mirrored to the shared store.
    pub async fn mirrored(address: IpAddr, rate_limit: u64, mirror: CounterMirror) -> Self {
        Self {
            address,
            rate_limit,
            counter: RateCounter::restore(counter_key(address), mirror).await,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn rate_limit(&self) -> u64 {
        self.rate_limit
    }

    pub fn counter(&self) -> &RateCounter {
        &self.counter
    }

    /// Whether dispatching one more request would exceed the rate ceiling.
    pub fn is_exhausted(&self) -> bool {
        self.counter.get() >= self.rate_limit
    }
}

impl fmt::Display for EgressIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.address, self.counter.get(), self.rate_limit)
    }
}

fn counter_key(address: IpAddr) -> String {
    format!("address:{address}")
}
