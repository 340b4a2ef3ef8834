// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topology resolution: turning a declarative group map into a tree of
//! groups with pre-computed CIDR territory.
//!
//! Subdivision works top-down.  A node with `k` children widens the prefix
//! by `ceil(log2 k)` bits and hands the i-th child the i-th sub-CIDR in
//! declaration order.  When `k` is not a power of two the last child absorbs
//! the remaining span, expressed as the minimal covering CIDR when one
//! exists and otherwise as a minimal ordered list, so a group's territory is
//! a `Vec<Cidr>` that is almost always of length one.  Sibling territories
//! are disjoint and together cover the parent exactly.

use std::collections::BTreeMap;

use ipam_types::api::GroupOrHost;
use ipam_types::api::Host;
use ipam_types::api::NetworkDefinition;
use ipam_types::cidr::span_to_cidrs;
use ipam_types::Cidr;
use ipam_types::Error;
use serde::Deserialize;
use serde::Serialize;

use crate::block::Block;

/// A named address space with its resolved group tree.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    pub cidr: Cidr,
    pub block_mask: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenants: Vec<String>,
    /// Declaration index within the topology update; breaks selection ties.
    pub position: usize,
    pub group: Group,
}

impl Network {
    pub fn allows_tenant(&self, tenant: &str) -> bool {
        self.tenants.is_empty() || self.tenants.iter().any(|t| t == tenant)
    }

    pub fn is_wildcard(&self) -> bool {
        self.tenants.is_empty()
    }
}

/// One node of a resolved topology tree.
///
/// Internal nodes carry children; leaves carry member hosts and the block
/// pool.  `cidrs` is the node's territory.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub cidrs: Vec<Cidr>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub assignment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Group>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
}

impl Group {
    pub fn is_leaf(&self) -> bool {
        self.groups.is_empty()
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    /// Child-index path to the leaf holding `host`, if any.
    pub fn find_host_leaf(&self, host: &str) -> Option<Vec<usize>> {
        if self.is_leaf() {
            return self
                .hosts
                .iter()
                .any(|h| h == host)
                .then(Vec::new);
        }
        for (index, child) in self.groups.iter().enumerate() {
            if let Some(mut path) = child.find_host_leaf(host) {
                path.insert(0, index);
                return Some(path);
            }
        }
        None
    }

    /// Child-index path to the first leaf, in tree order, whose assignment
    /// selector is satisfied by `tags`.
    pub fn find_assignment_leaf(
        &self,
        tags: &BTreeMap<String, String>,
    ) -> Option<Vec<usize>> {
        if self.is_leaf() {
            let matches = self
                .assignment
                .iter()
                .all(|(key, value)| tags.get(key) == Some(value));
            return matches.then(Vec::new);
        }
        for (index, child) in self.groups.iter().enumerate() {
            if let Some(mut path) = child.find_assignment_leaf(tags) {
                path.insert(0, index);
                return Some(path);
            }
        }
        None
    }

    pub fn group_at(&self, path: &[usize]) -> Option<&Group> {
        match path.split_first() {
            None => Some(self),
            Some((index, rest)) => {
                self.groups.get(*index)?.group_at(rest)
            }
        }
    }

    pub fn group_at_mut(&mut self, path: &[usize]) -> Option<&mut Group> {
        match path.split_first() {
            None => Some(self),
            Some((index, rest)) => {
                self.groups.get_mut(*index)?.group_at_mut(rest)
            }
        }
    }

    /// Drops `host` from every member list in the tree.
    pub fn remove_host_everywhere(&mut self, host: &str) {
        self.hosts.retain(|h| h != host);
        for child in &mut self.groups {
            child.remove_host_everywhere(host);
        }
    }

    /// Visits every block in the tree, leaves in declaration order.
    pub fn visit_blocks<'a>(
        &'a self,
        visit: &mut impl FnMut(&'a Group, &'a Block),
    ) {
        for block in &self.blocks {
            visit(self, block);
        }
        for child in &self.groups {
            child.visit_blocks(visit);
        }
    }
}

/// Resolves one network's group tree from its definition and the map of the
/// topology that references it.  Hosts declared inline (stubs and member
/// lists) are returned for admission into the host registry; they are
/// already placed in the returned tree.
pub fn build_network(
    position: usize,
    def: &NetworkDefinition,
    map: &[GroupOrHost],
) -> Result<(Network, Vec<Host>), Error> {
    if def.block_mask < 1 || def.block_mask > 32 {
        return Err(Error::invalid(format!(
            "network \"{}\": block mask /{} out of range",
            def.name, def.block_mask
        )));
    }
    let mut inline_hosts = Vec::new();
    let territory = vec![def.cidr];
    let root = if map.is_empty() {
        leaf_group(None, BTreeMap::new(), Vec::new(), territory, def)?
    } else {
        let parts = divide(&territory, map.len(), &def.name)?;
        let mut children = Vec::with_capacity(map.len());
        for (entry, part) in map.iter().zip(parts) {
            children.push(build_entry(entry, part, def, &mut inline_hosts)?);
        }
        Group {
            name: None,
            cidrs: vec![def.cidr],
            assignment: BTreeMap::new(),
            groups: children,
            hosts: Vec::new(),
            blocks: Vec::new(),
        }
    };
    let network = Network {
        name: def.name.clone(),
        cidr: def.cidr,
        block_mask: def.block_mask,
        tenants: def.tenants.clone(),
        position,
        group: root,
    };
    Ok((network, inline_hosts))
}

fn build_entry(
    entry: &GroupOrHost,
    territory: Vec<Cidr>,
    def: &NetworkDefinition,
    inline_hosts: &mut Vec<Host>,
) -> Result<Group, Error> {
    if let Some(ip) = entry.ip {
        // A host stub: an anonymous leaf holding exactly that host.
        let name = entry.name.clone().ok_or_else(|| {
            Error::invalid(format!("host stub at {} has no name", ip))
        })?;
        if !entry.groups.is_empty() || !entry.hosts.is_empty() {
            return Err(Error::invalid(format!(
                "host stub \"{}\" cannot carry groups or hosts",
                name
            )));
        }
        inline_hosts.push(Host { name: name.clone(), ip, tags: BTreeMap::new() });
        return leaf_group(
            None,
            entry.assignment.clone(),
            vec![name],
            territory,
            def,
        );
    }

    if !entry.groups.is_empty() {
        if !entry.hosts.is_empty() {
            return Err(Error::invalid(format!(
                "group \"{}\" cannot carry both groups and hosts",
                entry.name.as_deref().unwrap_or("<unnamed>")
            )));
        }
        let parts = divide(&territory, entry.groups.len(), &def.name)?;
        let mut children = Vec::with_capacity(entry.groups.len());
        for (child, part) in entry.groups.iter().zip(parts) {
            children.push(build_entry(child, part, def, inline_hosts)?);
        }
        return Ok(Group {
            name: entry.name.clone(),
            cidrs: territory,
            assignment: entry.assignment.clone(),
            groups: children,
            hosts: Vec::new(),
            blocks: Vec::new(),
        });
    }

    let members = entry.hosts.iter().map(|h| h.name.clone()).collect();
    inline_hosts.extend(entry.hosts.iter().cloned());
    leaf_group(
        entry.name.clone(),
        entry.assignment.clone(),
        members,
        territory,
        def,
    )
}

fn leaf_group(
    name: Option<String>,
    assignment: BTreeMap<String, String>,
    hosts: Vec<String>,
    cidrs: Vec<Cidr>,
    def: &NetworkDefinition,
) -> Result<Group, Error> {
    let group = Group {
        name,
        cidrs,
        assignment,
        groups: Vec::new(),
        hosts,
        blocks: Vec::new(),
    };
    // A leaf must be able to hold at least one block.
    if !group.cidrs.iter().any(|c| c.prefix() <= def.block_mask) {
        return Err(Error::invalid(format!(
            "network \"{}\": block mask coarser than leaf \"{}\" ({})",
            def.name,
            group.label(),
            group
                .cidrs
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        )));
    }
    Ok(group)
}

/// Splits `territory` into `k` disjoint child territories in address order.
///
/// Children `0..k-1` receive one `ceil(log2 k)`-bits-longer sub-CIDR each;
/// the last child absorbs the rest of the span.  A multi-CIDR territory
/// (already the result of an absorption) is divided on its first piece, with
/// the trailing pieces also absorbed by the last child.
fn divide(
    territory: &[Cidr],
    k: usize,
    network: &str,
) -> Result<Vec<Vec<Cidr>>, Error> {
    let (head, rest) =
        territory.split_first().expect("resolved groups have territory");
    let bits = k.next_power_of_two().trailing_zeros() as u8;
    if u32::from(head.prefix()) + u32::from(bits) > 32 {
        return Err(Error::invalid(format!(
            "network \"{}\": {} cannot be divided among {} groups",
            network, head, k
        )));
    }
    let unit_prefix = head.prefix() + bits;
    let unit_size = (1u64 << (32 - u32::from(unit_prefix))) as u32;
    let mut parts = Vec::with_capacity(k);
    for i in 0..k - 1 {
        let start = head.first_u32() + (i as u32) * unit_size;
        parts.push(vec![Cidr::new(start.into(), unit_prefix)
            .expect("unit prefix is within range")]);
    }
    let tail_start = head.first_u32() + ((k - 1) as u32) * unit_size;
    let mut tail = span_to_cidrs(tail_start, head.last_u32());
    tail.extend_from_slice(rest);
    parts.push(tail);
    Ok(parts)
}
