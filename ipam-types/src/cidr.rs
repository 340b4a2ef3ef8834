// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPv4 CIDR algebra.
//!
//! A [`Cidr`] is a contiguous IPv4 range held as `(start, prefix)` with the
//! host bits of `start` always zero.  All of the arithmetic the allocation
//! engine needs lives here: containment, overlap, bisection, child-prefix
//! iteration, and IP-to-offset mapping.  Parsing goes through
//! [`ipnetwork::Ipv4Network`] and masks host bits, so `"10.1.2.3/24"`
//! normalizes to `10.1.2.0/24`.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;

/// A contiguous IPv4 range expressed as `base/prefix`.
#[derive(
    Clone, Copy, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    start: u32,
    prefix: u8,
}

fn netmask(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) }
}

impl Cidr {
    /// Makes a CIDR from an address and prefix length, masking host bits.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Cidr, Error> {
        if prefix > 32 {
            return Err(Error::invalid(format!(
                "prefix length /{} out of range for IPv4",
                prefix
            )));
        }
        Ok(Cidr { start: u32::from(addr) & netmask(prefix), prefix })
    }

    fn from_start(start: u32, prefix: u8) -> Cidr {
        debug_assert!(prefix <= 32);
        debug_assert_eq!(start & netmask(prefix), start);
        Cidr { start, prefix }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The first address of the range.
    pub fn first(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.start)
    }

    /// The last address of the range.
    pub fn last(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.last_u32())
    }

    pub fn first_u32(&self) -> u32 {
        self.start
    }

    pub fn last_u32(&self) -> u32 {
        self.start | !netmask(self.prefix)
    }

    /// Number of addresses in the range.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    /// Whether `other` lies entirely within this range.  A CIDR contains
    /// itself.
    pub fn contains(&self, other: &Cidr) -> bool {
        self.start <= other.start && other.last_u32() <= self.last_u32()
    }

    pub fn contains_addr(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        self.start <= ip && ip <= self.last_u32()
    }

    /// Whether the two ranges share any address.
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.start <= other.last_u32() && other.start <= self.last_u32()
    }

    /// Bisects into two equal halves of prefix `p + 1`.
    pub fn split(&self) -> Result<(Cidr, Cidr), Error> {
        if self.prefix >= 32 {
            return Err(Error::invalid(format!(
                "cannot split a /32 CIDR ({})",
                self
            )));
        }
        let prefix = self.prefix + 1;
        let left = Cidr::from_start(self.start, prefix);
        let right = Cidr::from_start(
            self.start + (1u32 << (32 - u32::from(prefix))),
            prefix,
        );
        Ok((left, right))
    }

    /// Iterates the child CIDRs of the given longer (or equal) prefix
    /// length, in address order.
    pub fn children(
        &self,
        prefix: u8,
    ) -> Result<impl Iterator<Item = Cidr>, Error> {
        if prefix > 32 || prefix < self.prefix {
            return Err(Error::invalid(format!(
                "child prefix /{} invalid for {}",
                prefix, self
            )));
        }
        let step = 1u64 << (32 - u32::from(prefix));
        let end = u64::from(self.last_u32()) + 1;
        let mut next = u64::from(self.start);
        Ok(std::iter::from_fn(move || {
            if next >= end {
                return None;
            }
            let cidr = Cidr::from_start(next as u32, prefix);
            next += step;
            Some(cidr)
        }))
    }

    /// Zero-based offset of `ip` within the range, or `None` if outside it.
    pub fn offset_of(&self, ip: Ipv4Addr) -> Option<u32> {
        if self.contains_addr(ip) {
            Some(u32::from(ip) - self.start)
        } else {
            None
        }
    }

    /// The address at the given zero-based offset, or `None` if the offset
    /// is past the end of the range.
    pub fn addr_at(&self, offset: u32) -> Option<Ipv4Addr> {
        if u64::from(offset) < self.size() {
            Some(Ipv4Addr::from(self.start + offset))
        } else {
            None
        }
    }
}

/// Decomposes the inclusive span `[first, last]` into the minimal ordered
/// sequence of CIDRs covering exactly that span.
///
/// Used by the topology resolver when the remainder absorbed by the last
/// sibling is not itself expressible as a single CIDR.
pub fn span_to_cidrs(first: u32, last: u32) -> Vec<Cidr> {
    let mut out = Vec::new();
    let mut cur = u64::from(first);
    let end = u64::from(last);
    while cur <= end {
        // Largest power-of-two chunk that is both aligned at `cur` and fits
        // in the remaining span.
        let align =
            if cur == 0 { 1u64 << 32 } else { 1u64 << cur.trailing_zeros() };
        let remaining = end - cur + 1;
        let chunk = align.min(1u64 << (63 - remaining.leading_zeros()));
        let prefix = 32 - chunk.trailing_zeros() as u8;
        out.push(Cidr::from_start(cur as u32, prefix));
        cur += chunk;
    }
    out
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Cidr, Error> {
        let net = s.parse::<Ipv4Network>().map_err(|e| {
            Error::invalid(format!("unable to parse CIDR \"{}\": {}", s, e))
        })?;
        Cidr::new(net.network(), net.prefix())
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.first(), self.prefix)
    }
}

impl fmt::Debug for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl TryFrom<String> for Cidr {
    type Error = Error;

    fn try_from(s: String) -> Result<Cidr, Error> {
        s.parse()
    }
}

impl From<Cidr> for String {
    fn from(cidr: Cidr) -> String {
        cidr.to_string()
    }
}

impl schemars::JsonSchema for Cidr {
    fn schema_name() -> String {
        "Cidr".to_string()
    }

    fn json_schema(
        generator: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        <String as schemars::JsonSchema>::json_schema(generator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cidr(s: &str) -> Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_bounds() {
        let c = cidr("10.0.0.0/8");
        assert_eq!(c.first(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(c.last(), Ipv4Addr::new(10, 255, 255, 255));
        assert_eq!(c.size(), 1 << 24);

        // Host bits are masked, matching the behavior callers rely on when
        // they pass an arbitrary address with a prefix.
        assert_eq!(cidr("10.100.100.100/24"), cidr("10.100.100.0/24"));

        assert_eq!(cidr("0.0.0.0/0").size(), 1u64 << 32);
        assert_eq!(cidr("10.0.0.1/32").size(), 1);

        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0/8".parse::<Cidr>().is_err());
        assert!("not-a-cidr".parse::<Cidr>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for s in ["10.0.0.0/8", "192.168.4.64/26", "0.0.0.0/0", "1.2.3.4/32"]
        {
            assert_eq!(cidr(s).to_string(), s);
        }
    }

    #[test]
    fn containment_and_overlap() {
        let net = cidr("10.0.0.0/16");
        assert!(net.contains(&net));
        assert!(net.contains(&cidr("10.0.128.0/18")));
        assert!(!net.contains(&cidr("10.1.0.0/24")));
        assert!(!cidr("10.0.128.0/18").contains(&net));

        assert!(net.overlaps(&cidr("10.0.255.0/24")));
        assert!(net.overlaps(&cidr("0.0.0.0/0")));
        assert!(!net.overlaps(&cidr("10.1.0.0/16")));
        assert!(!cidr("10.0.0.0/31").overlaps(&cidr("10.0.0.2/31")));
    }

    #[test]
    fn split_halves() {
        let (lo, hi) = cidr("10.0.0.0/16").split().unwrap();
        assert_eq!(lo, cidr("10.0.0.0/17"));
        assert_eq!(hi, cidr("10.0.128.0/17"));
        assert!(cidr("10.0.0.0/32").split().is_err());
    }

    #[test]
    fn children_iteration() {
        let kids: Vec<_> =
            cidr("10.0.0.0/29").children(30).unwrap().collect();
        assert_eq!(
            kids,
            vec![cidr("10.0.0.0/30"), cidr("10.0.0.4/30")]
        );

        // Equal prefix yields the CIDR itself.
        let same: Vec<_> = cidr("10.0.0.0/30").children(30).unwrap().collect();
        assert_eq!(same, vec![cidr("10.0.0.0/30")]);

        assert!(cidr("10.0.0.0/30").children(29).is_err());
        assert!(cidr("10.0.0.0/30").children(33).is_err());

        // The top of the address space must not overflow.
        let top: Vec<_> =
            cidr("255.255.255.252/30").children(32).unwrap().collect();
        assert_eq!(top.len(), 4);
        assert_eq!(top[3], cidr("255.255.255.255/32"));
    }

    #[test]
    fn offsets() {
        let c = cidr("10.0.0.0/30");
        assert_eq!(c.offset_of(Ipv4Addr::new(10, 0, 0, 2)), Some(2));
        assert_eq!(c.offset_of(Ipv4Addr::new(10, 0, 0, 4)), None);
        assert_eq!(c.addr_at(3), Some(Ipv4Addr::new(10, 0, 0, 3)));
        assert_eq!(c.addr_at(4), None);
    }

    #[test]
    fn span_decomposition() {
        let c = cidr("10.0.0.0/16");
        // Second half of a /16 is a single /17.
        assert_eq!(
            span_to_cidrs(c.first_u32() + 0x8000, c.last_u32()),
            vec![cidr("10.0.128.0/17")]
        );
        // Final three quarters of a /30: one /32 then one /31.
        assert_eq!(
            span_to_cidrs(
                u32::from(Ipv4Addr::new(10, 0, 0, 1)),
                u32::from(Ipv4Addr::new(10, 0, 0, 3))
            ),
            vec![cidr("10.0.0.1/32"), cidr("10.0.0.2/31")]
        );
        // A whole CIDR decomposes to itself.
        assert_eq!(span_to_cidrs(c.first_u32(), c.last_u32()), vec![c]);
    }

    #[test]
    fn serde_as_string() {
        let c = cidr("10.0.128.0/18");
        assert_eq!(
            serde_json::to_string(&c).unwrap(),
            "\"10.0.128.0/18\""
        );
        let back: Cidr =
            serde_json::from_str("\"10.0.128.0/18\"").unwrap();
        assert_eq!(back, c);
        assert!(serde_json::from_str::<Cidr>("\"10.0.0.0/40\"").is_err());
    }

    proptest! {
        #[test]
        fn split_partitions(addr in any::<u32>(), prefix in 0u8..32) {
            let c = Cidr::new(Ipv4Addr::from(addr), prefix).unwrap();
            let (lo, hi) = c.split().unwrap();
            prop_assert_eq!(lo.first_u32(), c.first_u32());
            prop_assert_eq!(hi.last_u32(), c.last_u32());
            prop_assert_eq!(lo.last_u32() + 1, hi.first_u32());
            prop_assert!(c.contains(&lo) && c.contains(&hi));
            prop_assert!(!lo.overlaps(&hi));
        }

        #[test]
        fn offset_round_trip(addr in any::<u32>(), prefix in 0u8..=32, offset in any::<u32>()) {
            let c = Cidr::new(Ipv4Addr::from(addr), prefix).unwrap();
            let offset = (u64::from(offset) % c.size()) as u32;
            let ip = c.addr_at(offset).unwrap();
            prop_assert_eq!(c.offset_of(ip), Some(offset));
        }

        #[test]
        fn span_covers_exactly(a in any::<u32>(), b in any::<u32>()) {
            let (first, last) = if a <= b { (a, b) } else { (b, a) };
            let cidrs = span_to_cidrs(first, last);
            // Contiguous, in order, and covering exactly [first, last].
            prop_assert_eq!(cidrs.first().unwrap().first_u32(), first);
            prop_assert_eq!(cidrs.last().unwrap().last_u32(), last);
            for pair in cidrs.windows(2) {
                prop_assert_eq!(pair[0].last_u32() + 1, pair[1].first_u32());
            }
        }
    }
}
