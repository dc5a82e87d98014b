//! Egress address pool: address ranges, per-address rate counters and the
//! round-robin pool that lends them out.

mod address;
mod counter;
mod identity;
#[allow(clippy::module_inception)]
mod pool;

pub use address::{address_to_int, expand_address_pool, int_to_address, AddressRange, AddressSpec};
pub use counter::{CounterMirror, RateCounter, DURABLE_COUNTER_TTL};
pub use identity::EgressIdentity;
pub use pool::{EvictionPolicy, IdentityPool, Lease, PoolOptions, PoolStats, Pooled};
