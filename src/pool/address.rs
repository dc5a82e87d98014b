//! IPv4 address ranges and the address-pool mapping.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::error::{ProxyError, Result};

/// Pack an IPv4 address into its big-endian integer value.
pub fn address_to_int(address: Ipv4Addr) -> u32 {
    u32::from_be_bytes(address.octets())
}

/// Unpack an integer value into an IPv4 address, most significant octet first.
pub fn int_to_address(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value.to_be_bytes())
}

/// An inclusive range of IPv4 addresses written as `a.b.c.d-a.b.c.e`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

impl AddressRange {
    /// Create a range, rejecting one whose start lies after its end.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if address_to_int(start) > address_to_int(end) {
            return Err(ProxyError::InvalidRange(format!(
                "{start}-{end}: start address lies after end address"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    /// Number of addresses covered.
    pub fn len(&self) -> u64 {
        u64::from(address_to_int(self.end)) - u64::from(address_to_int(self.start)) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate the covered addresses in increasing numeric order.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (address_to_int(self.start)..=address_to_int(self.end)).map(int_to_address)
    }
}

impl FromStr for AddressRange {
    type Err = ProxyError;

    fn from_str(range: &str) -> Result<Self> {
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| ProxyError::InvalidRange(format!("{range}: no separator")))?;

        let parse = |literal: &str| {
            literal.trim().parse::<Ipv4Addr>().map_err(|e| {
                ProxyError::InvalidRange(format!("{range}: {literal:?} is not an IPv4 address ({e})"))
            })
        };

        Self::new(parse(start)?, parse(end)?)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl<'a> IntoIterator for &'a AddressRange {
    type Item = Ipv4Addr;
    type IntoIter = Box<dyn Iterator<Item = Ipv4Addr> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// One expanded egress address and its rate ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpec {
    pub address: IpAddr,
    pub rate_limit: u64,
}

/// Expand an address-pool mapping (`address-or-range -> rate ceiling`) into
/// one entry per address.
///
/// Entries containing `-` are IPv4 ranges; anything else must be a single IP
/// literal. A zero ceiling is rejected.
pub fn expand_address_pool(mapping: &BTreeMap<String, u64>) -> Result<Vec<AddressSpec>> {
    let mut specs = Vec::new();

    for (entry, &rate_limit) in mapping {
        if rate_limit == 0 {
            return Err(ProxyError::InvalidRange(format!(
                "{entry}: rate limit must be positive"
            )));
        }

        if entry.contains('-') {
            let range: AddressRange = entry.parse()?;
            specs.extend(range.iter().map(|address| AddressSpec {
                address: IpAddr::V4(address),
                rate_limit,
            }));
        } else {
            let address = entry.trim().parse::<IpAddr>().map_err(|e| {
                ProxyError::InvalidRange(format!("{entry}: not an IP address ({e})"))
            })?;
            specs.push(AddressSpec {
                address,
                rate_limit,
            });
        }
    }

    Ok(specs)
}
