//! IPv4 address arithmetic: addresses, half-open ranges and CIDR blocks.

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::Add;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of addresses. Wide enough to count an entire /8 without overflow.
pub type Count = u64;

/// A single IPv4 address, stored in host byte order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Addr(pub u32);

impl Addr {
    /// Distance from `other` up to `self`; zero if `other` is above us.
    #[must_use]
    pub fn since(self, other: Addr) -> Count {
        Count::from(self.0.saturating_sub(other.0))
    }
}

impl Add<u32> for Addr {
    type Output = Addr;

    fn add(self, offset: u32) -> Addr {
        Addr(self.0 + offset)
    }
}

impl From<Ipv4Addr> for Addr {
    fn from(ip: Ipv4Addr) -> Self {
        Addr(u32::from(ip))
    }
}

impl From<Addr> for Ipv4Addr {
    fn from(addr: Addr) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Ipv4Addr::from(self.0))
    }
}

impl FromStr for Addr {
    type Err = ParseAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ip: Ipv4Addr = s.parse().map_err(|_| ParseAddrError::new(s))?;
        Ok(Addr::from(ip))
    }
}

/// Failure to parse an address or CIDR from its textual form.
#[derive(Debug, Clone)]
pub struct ParseAddrError {
    input: String,
}

impl ParseAddrError {
    fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

impl fmt::Display for ParseAddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address or CIDR: {:?}", self.input)
    }
}

impl std::error::Error for ParseAddrError {}

/// A half-open address range `[start, end)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Range {
    pub start: Addr,
    pub end: Addr,
}

impl Range {
    #[must_use]
    pub fn new(start: Addr, end: Addr) -> Self {
        Self { start, end }
    }

    /// Range covering `size` addresses from `start`.
    #[must_use]
    pub fn with_size(start: Addr, size: u32) -> Self {
        Self {
            start,
            end: start + size,
        }
    }

    #[must_use]
    pub fn len(&self) -> Count {
        self.end.since(self.start)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    #[must_use]
    pub fn contains(&self, addr: Addr) -> bool {
        self.start <= addr && addr < self.end
    }

    /// True if any address lies in both ranges.
    #[must_use]
    pub fn overlaps(&self, other: &Range) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The common subrange, if any.
    #[must_use]
    pub fn intersection(&self, other: &Range) -> Option<Range> {
        let r = Range {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        };
        (!r.is_empty()).then_some(r)
    }

    /// True if `other` lies entirely within this range.
    #[must_use]
    pub fn encloses(&self, other: &Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// An address plus prefix length, e.g. `10.0.0.0/24`.
///
/// The address is not required to be the base of the prefix: a single
/// allocated host is represented as `a.b.c.d/32`-style CIDRs by the owned
/// map, while allocation requests usually carry the subnet base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cidr {
    pub addr: Addr,
    pub prefix_len: u8,
}

impl Cidr {
    #[must_use]
    pub fn new(addr: Addr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    /// A /32 covering exactly one address.
    #[must_use]
    pub fn host(addr: Addr) -> Self {
        Self {
            addr,
            prefix_len: 32,
        }
    }

    #[must_use]
    pub fn size(&self) -> Count {
        1 << (32 - self.prefix_len)
    }

    /// The full range of the prefix containing `addr`.
    ///
    /// Blocks ending at the top of the IPv4 space are clamped one short, as
    /// `Range.end` is exclusive and stored in 32 bits.
    #[must_use]
    pub fn range(&self) -> Range {
        let hostbits = 32 - u32::from(self.prefix_len);
        let mask = if hostbits == 32 {
            0
        } else {
            u32::MAX << hostbits
        };
        let base = self.addr.0 & mask;
        let end = (u64::from(base) + (1u64 << hostbits)).min(u64::from(u32::MAX));
        Range {
            start: Addr(base),
            end: Addr(end as u32),
        }
    }

    /// The allocatable addresses of the prefix: the network and broadcast
    /// addresses are excluded, except for /31 and /32 (RFC 3021).
    #[must_use]
    pub fn host_range(&self) -> Range {
        let Range { start, end } = self.range();
        if self.prefix_len >= 31 {
            Range { start, end }
        } else {
            Range {
                start: start + 1,
                end: Addr(end.0 - 1),
            }
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for Cidr {
    type Err = ParseAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| ParseAddrError::new(s))?;
        let addr: Addr = addr.parse()?;
        let prefix_len: u8 = prefix.parse().map_err(|_| ParseAddrError::new(s))?;
        if prefix_len > 32 {
            return Err(ParseAddrError::new(s));
        }
        Ok(Cidr { addr, prefix_len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Addr {
        s.parse().unwrap()
    }

    #[test]
    fn addr_display_roundtrip() {
        let a = addr("10.0.1.255");
        assert_eq!(a.to_string(), "10.0.1.255");
        assert_eq!(a, Addr(0x0a00_01ff));
    }

    #[test]
    fn range_contains_is_half_open() {
        let r = Range::new(addr("10.0.0.0"), addr("10.0.0.4"));
        assert_eq!(r.len(), 4);
        assert!(r.contains(addr("10.0.0.0")));
        assert!(r.contains(addr("10.0.0.3")));
        assert!(!r.contains(addr("10.0.0.4")));
    }

    #[test]
    fn range_overlap_and_intersection() {
        let a = Range::new(Addr(0), Addr(10));
        let b = Range::new(Addr(5), Addr(15));
        let c = Range::new(Addr(10), Addr(20));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.intersection(&b), Some(Range::new(Addr(5), Addr(10))));
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn cidr_range_masks_the_host_part() {
        let c: Cidr = "10.0.0.129/25".parse().unwrap();
        assert_eq!(c.range(), Range::new(addr("10.0.0.128"), addr("10.0.1.0")));
        assert_eq!(c.size(), 128);
    }

    #[test]
    fn cidr_host_range_excludes_network_and_broadcast() {
        let c: Cidr = "10.0.0.0/24".parse().unwrap();
        assert_eq!(
            c.host_range(),
            Range::new(addr("10.0.0.1"), addr("10.0.0.255"))
        );

        let tiny: Cidr = "10.0.0.0/31".parse().unwrap();
        assert_eq!(tiny.host_range(), tiny.range());
    }

    #[test]
    fn cidr_parse_rejects_garbage() {
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("banana/24".parse::<Cidr>().is_err());
    }
}
