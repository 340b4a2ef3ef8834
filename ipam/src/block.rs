// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Allocation blocks and the per-leaf block pool policy.
//!
//! A block is one `blockMask`-sized sub-CIDR of a leaf group, owned by a
//! single host and pinned to one `(tenant, segment)` pair for as long as it
//! holds any allocation.  A block whose bitmap is all-zero is *reusable*: the
//! next allocation may re-tag it to a different owner and scope.  Empty
//! blocks are never removed from the pool, so block indices stay stable.

use std::net::Ipv4Addr;

use ipam_types::Cidr;
use ipam_types::Error;
use serde::Deserialize;
use serde::Serialize;

use crate::bitmap::Bitmap;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Block {
    pub cidr: Cidr,
    /// Name of the owning host.
    pub host: String,
    pub tenant: String,
    pub segment: String,
    pub bitmap: Bitmap,
    /// Bumped on every bitmap change.
    pub revision: u64,
}

impl Block {
    pub fn new(cidr: Cidr, host: &str, tenant: &str, segment: &str) -> Block {
        let nbits =
            u32::try_from(cidr.size()).expect("block prefix is at least 1");
        Block {
            cidr,
            host: host.to_string(),
            tenant: tenant.to_string(),
            segment: segment.to_string(),
            bitmap: Bitmap::new(nbits),
            revision: 0,
        }
    }

    /// Whether this block is currently pinned to the given scope.
    fn matches(&self, host: &str, tenant: &str, segment: &str) -> bool {
        self.host == host && self.tenant == tenant && self.segment == segment
    }

    /// A block with no allocations may be re-tagged to a new scope.
    pub fn is_reusable(&self) -> bool {
        self.bitmap.is_empty()
    }

    pub fn allocated_count(&self) -> u32 {
        self.bitmap.count()
    }

    /// Lowest free offset whose address is not excluded by a blackout.
    fn first_free(&self, blackouts: &[Cidr]) -> Option<u32> {
        (0..self.bitmap.nbits()).find(|offset| {
            if self.bitmap.get(*offset) {
                return false;
            }
            let ip = match self.cidr.addr_at(*offset) {
                Some(ip) => ip,
                None => return false,
            };
            !blackouts.iter().any(|b| b.contains_addr(ip))
        })
    }

    fn take(&mut self, offset: u32) -> Ipv4Addr {
        let prev = self.bitmap.set(offset);
        assert!(!prev, "offset {} in {} already allocated", offset, self.cidr);
        self.revision += 1;
        self.cidr.addr_at(offset).expect("offset validated by bitmap width")
    }

    /// Releases an allocated offset.
    pub fn release(&mut self, offset: u32) -> Result<(), Error> {
        if offset >= self.bitmap.nbits() || !self.bitmap.clear(offset) {
            return Err(Error::internal(format!(
                "offset {} in block {} was not allocated",
                offset, self.cidr
            )));
        }
        self.revision += 1;
        Ok(())
    }
}

/// Allocates one address from a leaf's block pool.
///
/// Policy, in order: a block already pinned to `(host, tenant, segment)`
/// with a free address; a reusable block, re-tagged to the requested scope;
/// a freshly carved block at the next unused `block_mask`-sized sub-CIDR of
/// the leaf territory, in ascending address order.  Addresses inside any
/// blackout are never handed out, and a candidate block with no usable
/// address (fully blacked out) is passed over without being materialized.
///
/// Returns the block index, the offset within the block, and the address.
pub fn allocate_in_pool(
    blocks: &mut Vec<Block>,
    territory: &[Cidr],
    block_mask: u8,
    host: &str,
    tenant: &str,
    segment: &str,
    blackouts: &[Cidr],
) -> Result<(usize, u32, Ipv4Addr), Error> {
    // Reuse a block already pinned to this scope.
    for (index, block) in blocks.iter_mut().enumerate() {
        if block.matches(host, tenant, segment) {
            if let Some(offset) = block.first_free(blackouts) {
                let ip = block.take(offset);
                return Ok((index, offset, ip));
            }
        }
    }

    // Re-tag a reusable block.
    for (index, block) in blocks.iter_mut().enumerate() {
        if block.is_reusable() {
            if let Some(offset) = block.first_free(blackouts) {
                block.host = host.to_string();
                block.tenant = tenant.to_string();
                block.segment = segment.to_string();
                let ip = block.take(offset);
                return Ok((index, offset, ip));
            }
        }
    }

    // Carve the next unused block from the leaf territory.
    for piece in territory {
        if piece.prefix() > block_mask {
            continue;
        }
        let children = piece
            .children(block_mask)
            .map_err(|e| Error::internal(e.to_string()))?;
        for candidate in children {
            if blocks.iter().any(|b| b.cidr == candidate) {
                continue;
            }
            let mut block = Block::new(candidate, host, tenant, segment);
            if let Some(offset) = block.first_free(blackouts) {
                let ip = block.take(offset);
                blocks.push(block);
                return Ok((blocks.len() - 1, offset, ip));
            }
        }
    }

    Err(Error::Exhausted)
}
