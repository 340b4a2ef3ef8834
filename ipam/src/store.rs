// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The IPAM aggregate: state, the public allocation API, and the
//! persistence bridge.
//!
//! All state lives in one [`State`] value behind a `RwLock`.  Mutations are
//! staged on a clone, the caller-supplied saver is invoked with the staged
//! state, and only a successful save publishes it.  A saver failure
//! therefore rolls back by simply dropping the stage, and readers never
//! observe a partially-applied operation.  The write guard is held across
//! the saver call, which serializes every state-changing operation; the
//! saver is the only place an operation may block for I/O.
//!
//! Endpoint records carry `(network, group path, block index, offset)`, the
//! reverse of the block bitmaps.  [`State::check_invariants`] verifies the
//! two stay a bijection; it runs on every snapshot load and throughout the
//! test suite.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::RwLock;

use ipam_types::api::BlockInfo;
use ipam_types::api::BlocksResponse;
use ipam_types::api::Host;
use ipam_types::api::TopologyUpdateRequest;
use ipam_types::Cidr;
use ipam_types::Error;
use ipam_types::ResourceType;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::warn;

use crate::block;
use crate::topology;
use crate::topology::Group;
use crate::topology::Network;

/// Persistence hook.  Called with the staged state as the final step of
/// every state-changing operation; an error aborts the operation and rolls
/// the change back.
pub type Saver = Box<dyn Fn(&State) -> anyhow::Result<()> + Send + Sync>;

/// A live allocation: the reverse index from an owner token to the bit that
/// backs it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub network: String,
    pub group_path: Vec<usize>,
    pub block_index: usize,
    pub offset: u32,
    pub host: String,
    pub tenant: String,
    pub segment: String,
}

/// The complete persistent state of the IPAM core.  This is exactly what
/// the saver receives and what [`Ipam::load`] consumes.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    #[serde(default)]
    networks: BTreeMap<String, Network>,
    #[serde(default)]
    hosts: Vec<Host>,
    #[serde(default)]
    endpoints: BTreeMap<String, Endpoint>,
    #[serde(default)]
    blackouts: BTreeMap<String, Vec<Cidr>>,
    /// The last applied topology request, kept for change detection.
    #[serde(default)]
    topology: Option<TopologyUpdateRequest>,
    /// Bumped on every persisted mutation.
    #[serde(default)]
    revision: u64,
    /// Bumped on every effective topology update.
    #[serde(default)]
    topology_revision: u64,
}

impl State {
    fn ordered_networks(&self) -> Vec<&Network> {
        let mut nets: Vec<&Network> = self.networks.values().collect();
        nets.sort_by_key(|n| n.position);
        nets
    }

    /// Networks eligible for `tenant`: specific allow-list matches first,
    /// wildcard networks after, declaration order within each class.
    fn candidate_networks(&self, tenant: &str) -> Vec<String> {
        let mut nets: Vec<&Network> = self
            .networks
            .values()
            .filter(|n| n.allows_tenant(tenant))
            .collect();
        nets.sort_by_key(|n| (n.is_wildcard(), n.position));
        nets.into_iter().map(|n| n.name.clone()).collect()
    }

    fn has_endpoints_in(&self, network: &str) -> bool {
        self.endpoints.values().any(|e| e.network == network)
    }

    fn allocate(
        &mut self,
        token: &str,
        host: &str,
        tenant: &str,
        segment: &str,
    ) -> Result<Ipv4Addr, Error> {
        let mut saw_host = false;
        for name in self.candidate_networks(tenant) {
            let blackouts =
                self.blackouts.get(&name).cloned().unwrap_or_default();
            let net = self.networks.get_mut(&name).expect("candidate exists");
            let Some(path) = net.group.find_host_leaf(host) else {
                continue;
            };
            saw_host = true;
            let block_mask = net.block_mask;
            let leaf =
                net.group.group_at_mut(&path).expect("path from find");
            match block::allocate_in_pool(
                &mut leaf.blocks,
                &leaf.cidrs,
                block_mask,
                host,
                tenant,
                segment,
                &blackouts,
            ) {
                Ok((block_index, offset, ip)) => {
                    self.endpoints.insert(
                        token.to_string(),
                        Endpoint {
                            ip,
                            network: name,
                            group_path: path,
                            block_index,
                            offset,
                            host: host.to_string(),
                            tenant: tenant.to_string(),
                            segment: segment.to_string(),
                        },
                    );
                    return Ok(ip);
                }
                // This network is full for us; fall through to the next
                // eligible one.
                Err(Error::Exhausted) => continue,
                Err(e) => return Err(e),
            }
        }
        if saw_host {
            Err(Error::Exhausted)
        } else {
            Err(Error::not_found(ResourceType::Host, host))
        }
    }

    fn deallocate(&mut self, token: &str) -> Result<Endpoint, Error> {
        let ep = self
            .endpoints
            .remove(token)
            .ok_or_else(|| Error::not_found(ResourceType::Endpoint, token))?;
        let net = self.networks.get_mut(&ep.network).ok_or_else(|| {
            Error::internal(format!(
                "endpoint \"{}\" references missing network \"{}\"",
                token, ep.network
            ))
        })?;
        let block = net
            .group
            .group_at_mut(&ep.group_path)
            .and_then(|leaf| leaf.blocks.get_mut(ep.block_index))
            .ok_or_else(|| {
                Error::internal(format!(
                    "endpoint \"{}\" references missing block",
                    token
                ))
            })?;
        block.release(ep.offset)?;
        Ok(ep)
    }

    /// Registers a blackout.  Returns false when the CIDR was already
    /// covered and nothing changed.
    fn black_out(&mut self, cidr: Cidr) -> Result<bool, Error> {
        let net_name = self
            .ordered_networks()
            .iter()
            .find(|n| n.cidr.contains(&cidr))
            .map(|n| n.name.clone())
            .ok_or_else(|| {
                Error::not_found(ResourceType::Network, cidr.to_string())
            })?;
        let net = &self.networks[&net_name];
        if net.cidr == cidr {
            return Err(Error::conflict(format!(
                "blackout {} would cover all of network \"{}\"",
                cidr, net_name
            )));
        }
        if self
            .blackouts
            .get(&net_name)
            .is_some_and(|list| list.iter().any(|b| b.contains(&cidr)))
        {
            return Ok(false);
        }
        let mut allocated = None;
        net.group.visit_blocks(&mut |_, b| {
            if allocated.is_some() || !b.cidr.overlaps(&cidr) {
                return;
            }
            for offset in b.bitmap.iter_set() {
                match b.cidr.addr_at(offset) {
                    Some(ip) if cidr.contains_addr(ip) => {
                        allocated = Some(ip);
                        return;
                    }
                    _ => {}
                }
            }
        });
        if let Some(ip) = allocated {
            return Err(Error::conflict(format!(
                "blackout {} overlaps allocated address {}",
                cidr, ip
            )));
        }
        let list = self.blackouts.entry(net_name).or_default();
        // Wider wins: the new range swallows any narrower entries.
        list.retain(|b| !cidr.contains(b));
        list.push(cidr);
        list.sort();
        Ok(true)
    }

    fn un_black_out(&mut self, cidr: Cidr) -> Result<(), Error> {
        let name = self
            .blackouts
            .iter()
            .find(|(_, list)| list.contains(&cidr))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| {
                Error::not_found(ResourceType::Blackout, cidr.to_string())
            })?;
        let list = self.blackouts.get_mut(&name).expect("found above");
        list.retain(|b| *b != cidr);
        if list.is_empty() {
            self.blackouts.remove(&name);
        }
        Ok(())
    }

    fn add_host(&mut self, host: &Host) -> Result<(), Error> {
        if host.name.is_empty() {
            return Err(Error::invalid("host name cannot be empty"));
        }
        if self.hosts.iter().any(|h| h.name == host.name) {
            return Err(Error::conflict(format!(
                "host \"{}\" already exists",
                host.name
            )));
        }
        if let Some(clash) = self.hosts.iter().find(|h| h.ip == host.ip) {
            return Err(Error::conflict(format!(
                "host IP {} already belongs to \"{}\"",
                host.ip, clash.name
            )));
        }
        let mut placed = false;
        for net in self.networks.values_mut() {
            if let Some(path) = net.group.find_assignment_leaf(&host.tags) {
                net.group
                    .group_at_mut(&path)
                    .expect("path from find")
                    .hosts
                    .push(host.name.clone());
                placed = true;
            }
        }
        if !placed {
            return Err(Error::invalid(format!(
                "no group accepts host \"{}\"",
                host.name
            )));
        }
        self.hosts.push(host.clone());
        Ok(())
    }

    fn remove_host(&mut self, name: &str) -> Result<(), Error> {
        let index = self
            .hosts
            .iter()
            .position(|h| h.name == name)
            .ok_or_else(|| Error::not_found(ResourceType::Host, name))?;
        let mut live = false;
        for net in self.networks.values() {
            net.group.visit_blocks(&mut |_, b| {
                if b.host == name && !b.bitmap.is_empty() {
                    live = true;
                }
            });
        }
        if live {
            return Err(Error::conflict(format!(
                "host \"{}\" still owns allocated addresses",
                name
            )));
        }
        self.hosts.remove(index);
        for net in self.networks.values_mut() {
            net.group.remove_host_everywhere(name);
        }
        Ok(())
    }

    fn apply_topology(
        &mut self,
        req: &TopologyUpdateRequest,
    ) -> Result<(), Error> {
        let mut defs = BTreeMap::new();
        for def in &req.networks {
            if defs.insert(def.name.as_str(), def).is_some() {
                return Err(Error::invalid(format!(
                    "duplicate network \"{}\"",
                    def.name
                )));
            }
        }
        let mut topo_for = BTreeMap::new();
        for topo in &req.topologies {
            for name in &topo.networks {
                if !defs.contains_key(name.as_str()) {
                    return Err(Error::invalid(format!(
                        "topology references unknown network \"{}\"",
                        name
                    )));
                }
                if topo_for.insert(name.as_str(), topo).is_some() {
                    return Err(Error::invalid(format!(
                        "network \"{}\" referenced by more than one topology",
                        name
                    )));
                }
            }
        }

        // Fail closed: a network cannot disappear or change shape under
        // live endpoints.
        for name in self.networks.keys() {
            if !defs.contains_key(name.as_str())
                && self.has_endpoints_in(name)
            {
                return Err(Error::conflict(format!(
                    "network \"{}\" removed while endpoints remain",
                    name
                )));
            }
        }

        let mut networks = BTreeMap::new();
        let mut inline_hosts = Vec::new();
        for (position, def) in req.networks.iter().enumerate() {
            let unchanged = self.networks.contains_key(&def.name)
                && self.topology.as_ref().is_some_and(|prev| {
                    network_shape(prev, &def.name)
                        == network_shape(req, &def.name)
                });
            if unchanged {
                let mut net = self
                    .networks
                    .remove(&def.name)
                    .expect("checked contains_key");
                net.position = position;
                networks.insert(def.name.clone(), net);
                continue;
            }
            if self.has_endpoints_in(&def.name) {
                return Err(Error::conflict(format!(
                    "network \"{}\" changed shape while endpoints remain",
                    def.name
                )));
            }
            let map = topo_for
                .get(def.name.as_str())
                .map(|t| t.map.as_slice())
                .unwrap_or(&[]);
            let (net, hosts) = topology::build_network(position, def, map)?;
            inline_hosts.extend(hosts);
            networks.insert(def.name.clone(), net);
        }

        // Blackouts survive only where their network did, and only while
        // still inside it.
        let old_blackouts = std::mem::take(&mut self.blackouts);
        for (name, list) in old_blackouts {
            if let Some(net) = networks.get(&name) {
                let kept: Vec<Cidr> = list
                    .into_iter()
                    .filter(|c| net.cidr.contains(c) && *c != net.cidr)
                    .collect();
                if !kept.is_empty() {
                    self.blackouts.insert(name, kept);
                }
            }
        }

        // Admit hosts declared inline in the topology.
        for host in inline_hosts {
            if let Some(existing) =
                self.hosts.iter().find(|h| h.name == host.name)
            {
                if existing.ip != host.ip {
                    return Err(Error::conflict(format!(
                        "host \"{}\" redeclared with IP {} (was {})",
                        host.name, host.ip, existing.ip
                    )));
                }
                continue;
            }
            if let Some(clash) = self.hosts.iter().find(|h| h.ip == host.ip)
            {
                return Err(Error::conflict(format!(
                    "host \"{}\" reuses the IP of \"{}\" ({})",
                    host.name, clash.name, host.ip
                )));
            }
            self.hosts.push(host);
        }

        // Place registry hosts into the rebuilt trees.  Hosts declared
        // inline are already in their declared leaves; everyone else goes
        // to the first leaf in tree order whose assignment matches.
        for host in &self.hosts {
            for net in networks.values_mut() {
                if net.group.find_host_leaf(&host.name).is_some() {
                    continue;
                }
                if let Some(path) =
                    net.group.find_assignment_leaf(&host.tags)
                {
                    net.group
                        .group_at_mut(&path)
                        .expect("path from find")
                        .hosts
                        .push(host.name.clone());
                }
            }
        }

        self.networks = networks;
        self.topology = Some(req.clone());
        self.topology_revision += 1;
        Ok(())
    }

    fn block_listing(&self, only: Option<&str>) -> Vec<BlockInfo> {
        let mut blocks = Vec::new();
        for net in self.ordered_networks() {
            if only.is_some_and(|name| name != net.name) {
                continue;
            }
            net.group.visit_blocks(&mut |_, b| {
                blocks.push(BlockInfo {
                    cidr: b.cidr,
                    host: b.host.clone(),
                    tenant: b.tenant.clone(),
                    segment: b.segment.clone(),
                    allocated_ip_count: b.allocated_count(),
                });
            });
        }
        blocks
    }

    /// Verifies every reachable-state invariant: the endpoint/bitmap
    /// bijection, IP uniqueness, tree partitioning, block placement, and
    /// blackout containment.  Cheap enough for tests to call after every
    /// operation; load calls it once.
    pub fn check_invariants(&self) -> Result<(), Error> {
        let mut names = BTreeSet::new();
        let mut ips = BTreeSet::new();
        for host in &self.hosts {
            if !names.insert(host.name.as_str()) {
                return Err(Error::internal(format!(
                    "duplicate host name \"{}\"",
                    host.name
                )));
            }
            if !ips.insert(host.ip) {
                return Err(Error::internal(format!(
                    "duplicate host IP {}",
                    host.ip
                )));
            }
        }

        let mut live_bits = BTreeSet::new();
        let mut seen_ips = BTreeSet::new();
        let empty = Vec::new();
        for (name, net) in &self.networks {
            if &net.name != name {
                return Err(Error::internal(format!(
                    "network \"{}\" keyed as \"{}\"",
                    net.name, name
                )));
            }
            if net.group.cidrs != vec![net.cidr] {
                return Err(Error::internal(format!(
                    "network \"{}\" root territory diverges from {}",
                    name, net.cidr
                )));
            }
            let blackouts = self.blackouts.get(name).unwrap_or(&empty);
            for b in blackouts {
                if !net.cidr.contains(b) {
                    return Err(Error::internal(format!(
                        "blackout {} outside network \"{}\"",
                        b, name
                    )));
                }
            }
            check_group(
                name,
                &net.group,
                net.block_mask,
                blackouts,
                &names,
                &mut Vec::new(),
                &mut live_bits,
                &mut seen_ips,
            )?;
        }
        for name in self.blackouts.keys() {
            if !self.networks.contains_key(name) {
                return Err(Error::internal(format!(
                    "blackouts recorded for unknown network \"{}\"",
                    name
                )));
            }
        }

        if live_bits.len() != self.endpoints.len() {
            return Err(Error::internal(format!(
                "{} allocated bits but {} endpoint records",
                live_bits.len(),
                self.endpoints.len()
            )));
        }
        for (token, ep) in &self.endpoints {
            let key = (
                ep.network.clone(),
                ep.group_path.clone(),
                ep.block_index,
                ep.offset,
            );
            if !live_bits.contains(&key) {
                return Err(Error::internal(format!(
                    "endpoint \"{}\" points at an unallocated bit",
                    token
                )));
            }
            let block = self
                .networks
                .get(&ep.network)
                .and_then(|n| n.group.group_at(&ep.group_path))
                .and_then(|g| g.blocks.get(ep.block_index))
                .expect("bit key resolved above");
            if block.cidr.addr_at(ep.offset) != Some(ep.ip) {
                return Err(Error::internal(format!(
                    "endpoint \"{}\" IP {} disagrees with its block",
                    token, ep.ip
                )));
            }
            if block.host != ep.host
                || block.tenant != ep.tenant
                || block.segment != ep.segment
            {
                return Err(Error::internal(format!(
                    "endpoint \"{}\" scope disagrees with block {}",
                    token, block.cidr
                )));
            }
        }
        Ok(())
    }
}

/// The pair that determines whether a network's resolved shape would
/// change: its definition and the topology map that feeds it.
fn network_shape<'a>(
    req: &'a TopologyUpdateRequest,
    name: &str,
) -> (
    Option<&'a ipam_types::api::NetworkDefinition>,
    Option<&'a ipam_types::api::TopologyDefinition>,
) {
    (
        req.networks.iter().find(|d| d.name == name),
        req.topologies
            .iter()
            .find(|t| t.networks.iter().any(|n| n == name)),
    )
}

#[allow(clippy::too_many_arguments)]
fn check_group(
    network: &str,
    group: &Group,
    block_mask: u8,
    blackouts: &[Cidr],
    host_names: &BTreeSet<&str>,
    path: &mut Vec<usize>,
    live_bits: &mut BTreeSet<(String, Vec<usize>, usize, u32)>,
    seen_ips: &mut BTreeSet<Ipv4Addr>,
) -> Result<(), Error> {
    if group.is_leaf() {
        for host in &group.hosts {
            if !host_names.contains(host.as_str()) {
                return Err(Error::internal(format!(
                    "group member \"{}\" missing from host registry",
                    host
                )));
            }
        }
        for (block_index, block) in group.blocks.iter().enumerate() {
            if block.cidr.prefix() != block_mask {
                return Err(Error::internal(format!(
                    "block {} is not a /{} block",
                    block.cidr, block_mask
                )));
            }
            if !group.cidrs.iter().any(|c| c.contains(&block.cidr)) {
                return Err(Error::internal(format!(
                    "block {} outside its leaf territory",
                    block.cidr
                )));
            }
            if group.blocks[..block_index]
                .iter()
                .any(|other| other.cidr.overlaps(&block.cidr))
            {
                return Err(Error::internal(format!(
                    "block {} overlaps an earlier block",
                    block.cidr
                )));
            }
            if u64::from(block.bitmap.nbits()) != block.cidr.size() {
                return Err(Error::internal(format!(
                    "block {} bitmap width mismatch",
                    block.cidr
                )));
            }
            for offset in block.bitmap.iter_set() {
                let ip = block
                    .cidr
                    .addr_at(offset)
                    .expect("offset bounded by bitmap width");
                if !seen_ips.insert(ip) {
                    return Err(Error::internal(format!(
                        "address {} allocated twice",
                        ip
                    )));
                }
                if blackouts.iter().any(|b| b.contains_addr(ip)) {
                    return Err(Error::internal(format!(
                        "allocated address {} inside a blackout",
                        ip
                    )));
                }
                live_bits.insert((
                    network.to_string(),
                    path.clone(),
                    block_index,
                    offset,
                ));
            }
        }
        return Ok(());
    }

    if !group.blocks.is_empty() || !group.hosts.is_empty() {
        return Err(Error::internal(
            "internal group carries blocks or hosts".to_string(),
        ));
    }
    let mut covered = 0u64;
    for (index, child) in group.groups.iter().enumerate() {
        for c in &child.cidrs {
            if !group.cidrs.iter().any(|p| p.contains(c)) {
                return Err(Error::internal(format!(
                    "child territory {} escapes its parent",
                    c
                )));
            }
            covered += c.size();
            for sibling in &group.groups[index + 1..] {
                if sibling.cidrs.iter().any(|s| s.overlaps(c)) {
                    return Err(Error::internal(format!(
                        "sibling territories overlap at {}",
                        c
                    )));
                }
            }
        }
        path.push(index);
        check_group(
            network, child, block_mask, blackouts, host_names, path,
            live_bits, seen_ips,
        )?;
        path.pop();
    }
    let parent: u64 = group.cidrs.iter().map(Cidr::size).sum();
    if covered != parent {
        return Err(Error::internal(format!(
            "children cover {} of {} parent addresses",
            covered, parent
        )));
    }
    Ok(())
}

/// The IPAM core.  One instance is the single writer for its address space;
/// clones of the state only ever leave through the saver.
pub struct Ipam {
    log: slog::Logger,
    saver: Saver,
    state: RwLock<State>,
}

impl std::fmt::Debug for Ipam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ipam").field("state", &self.state).finish()
    }
}

impl Ipam {
    pub fn new(log: slog::Logger, saver: Saver) -> Ipam {
        Ipam { log, saver, state: RwLock::new(State::default()) }
    }

    /// Reconstructs an aggregate from a snapshot previously handed to a
    /// saver.  A snapshot that fails the invariant check is refused.
    pub fn load(
        log: slog::Logger,
        saver: Saver,
        data: &str,
    ) -> Result<Ipam, Error> {
        let state: State = serde_json::from_str(data).map_err(|e| {
            Error::invalid(format!("parsing IPAM snapshot: {}", e))
        })?;
        state.check_invariants()?;
        info!(log, "loaded IPAM snapshot";
            "networks" => state.networks.len(),
            "hosts" => state.hosts.len(),
            "endpoints" => state.endpoints.len(),
            "revision" => state.revision);
        Ok(Ipam { log, saver, state: RwLock::new(state) })
    }

    /// Publishes a staged state, persisting it first.  On saver failure the
    /// stage is dropped and the previous state remains current.
    fn commit(
        &self,
        current: &mut State,
        mut staged: State,
    ) -> Result<(), Error> {
        staged.revision += 1;
        if let Err(e) = (self.saver)(&staged) {
            warn!(self.log, "saver failed; rolling back";
                "error" => format!("{:#}", e));
            return Err(Error::internal(format!(
                "saving IPAM state: {:#}",
                e
            )));
        }
        *current = staged;
        Ok(())
    }

    /// Allocates an address for `host` scoped to `(tenant, segment)`.
    ///
    /// `token` names the allocation: repeating a call with the same token
    /// and parameters returns the original address without reallocating,
    /// and the token is what [`Ipam::deallocate_ip`] takes.
    pub fn allocate_ip(
        &self,
        token: &str,
        host: &str,
        tenant: &str,
        segment: &str,
    ) -> Result<Ipv4Addr, Error> {
        if token.is_empty() {
            return Err(Error::invalid("owner token cannot be empty"));
        }
        let mut state = self.state.write().unwrap();
        if let Some(ep) = state.endpoints.get(token) {
            if ep.host == host && ep.tenant == tenant && ep.segment == segment
            {
                debug!(self.log, "allocation replay";
                    "token" => %token, "ip" => %ep.ip);
                return Ok(ep.ip);
            }
            return Err(Error::conflict(format!(
                "token \"{}\" already names {} with different parameters",
                token, ep.ip
            )));
        }
        let mut staged = state.clone();
        let ip = staged.allocate(token, host, tenant, segment)?;
        self.commit(&mut state, staged)?;
        info!(self.log, "allocated IP"; "token" => %token, "host" => %host,
            "tenant" => %tenant, "segment" => %segment, "ip" => %ip);
        Ok(ip)
    }

    /// Releases the allocation named by `token`.  Unknown tokens are an
    /// error, never silent.
    pub fn deallocate_ip(&self, token: &str) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        let mut staged = state.clone();
        let ep = staged.deallocate(token)?;
        self.commit(&mut state, staged)?;
        info!(self.log, "deallocated IP"; "token" => %token, "ip" => %ep.ip);
        Ok(())
    }

    /// Excludes a CIDR from allocation on the network containing it.
    /// Re-blacking an already-covered range is a no-op; a wider range
    /// replaces narrower ones it contains.
    pub fn black_out(&self, cidr: &str) -> Result<(), Error> {
        let cidr: Cidr = cidr.parse()?;
        let mut state = self.state.write().unwrap();
        let mut staged = state.clone();
        if !staged.black_out(cidr)? {
            debug!(self.log, "blackout already covered"; "cidr" => %cidr);
            return Ok(());
        }
        self.commit(&mut state, staged)?;
        info!(self.log, "blacked out range"; "cidr" => %cidr);
        Ok(())
    }

    /// Removes a blackout.  The CIDR must match a recorded blackout
    /// exactly.
    pub fn un_black_out(&self, cidr: &str) -> Result<(), Error> {
        let cidr: Cidr = cidr.parse()?;
        let mut state = self.state.write().unwrap();
        let mut staged = state.clone();
        staged.un_black_out(cidr)?;
        self.commit(&mut state, staged)?;
        info!(self.log, "removed blackout"; "cidr" => %cidr);
        Ok(())
    }

    /// Applies a declarative topology.  Re-applying the last request is a
    /// no-op; otherwise unchanged networks are preserved and changed ones
    /// are rebuilt, failing closed if that would strand live endpoints.
    pub fn update_topology(
        &self,
        req: TopologyUpdateRequest,
    ) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        if state.topology.as_ref() == Some(&req) {
            debug!(self.log, "topology unchanged; nothing to apply");
            return Ok(());
        }
        let mut staged = state.clone();
        staged.apply_topology(&req)?;
        self.commit(&mut state, staged)?;
        info!(self.log, "applied topology update";
            "networks" => req.networks.len(),
            "topologies" => req.topologies.len(),
            "topology_revision" => state.topology_revision);
        Ok(())
    }

    /// Admits a host, placing it into the first matching leaf of every
    /// network that will take it.
    pub fn add_host(&self, host: Host) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        let mut staged = state.clone();
        staged.add_host(&host)?;
        self.commit(&mut state, staged)?;
        info!(self.log, "added host"; "host" => %host.name, "ip" => %host.ip);
        Ok(())
    }

    /// Removes a host.  Refused while the host owns any allocated address.
    pub fn remove_host(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        let mut staged = state.clone();
        staged.remove_host(name)?;
        self.commit(&mut state, staged)?;
        info!(self.log, "removed host"; "host" => %name);
        Ok(())
    }

    /// Lists every block in every network, in declaration order.
    pub fn list_all_blocks(&self) -> BlocksResponse {
        let state = self.state.read().unwrap();
        BlocksResponse {
            revision: state.revision,
            blocks: state.block_listing(None),
        }
    }

    /// Lists the blocks of one network.
    pub fn list_network_blocks(
        &self,
        network: &str,
    ) -> Result<BlocksResponse, Error> {
        let state = self.state.read().unwrap();
        if !state.networks.contains_key(network) {
            return Err(Error::not_found(ResourceType::Network, network));
        }
        Ok(BlocksResponse {
            revision: state.revision,
            blocks: state.block_listing(Some(network)),
        })
    }

    /// All known hosts, in admission order.
    pub fn list_hosts(&self) -> Vec<Host> {
        self.state.read().unwrap().hosts.clone()
    }

    /// The address currently allocated under `token`, if any.
    pub fn endpoint_ip(&self, token: &str) -> Option<Ipv4Addr> {
        self.state.read().unwrap().endpoints.get(token).map(|ep| ep.ip)
    }

    /// Runs the full invariant check against current state.
    pub fn check_invariants(&self) -> Result<(), Error> {
        self.state.read().unwrap().check_invariants()
    }
}
