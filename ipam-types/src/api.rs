// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request and response types for the IPAM API.
//!
//! Multi-word JSON keys are camelCase (`blockMask`, `allocatedIPCount`) to
//! match what existing clients send.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::cidr::Cidr;

/// A host known to the IPAM core.
///
/// Host names are unique across the fleet; tags drive placement into
/// topology groups via assignment matching.
#[derive(
    Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct Host {
    pub name: String,
    pub ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// A network inside a topology update: a named address space with a fixed
/// allocation block size and an optional tenant allow-list.
#[derive(
    Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDefinition {
    pub name: String,
    pub cidr: Cidr,
    /// Prefix length of one allocation block; block size is
    /// `2^(32 - blockMask)` addresses.
    pub block_mask: u8,
    /// Tenants allowed to allocate from this network.  Empty means any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tenants: Vec<String>,
}

/// One node of a topology map: either a named group (optionally carrying an
/// assignment tag selector, nested groups, or member hosts) or a host stub
/// (`name` plus `ip`), which behaves as an anonymous single-host leaf.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub struct GroupOrHost {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Present when this entry is a host stub rather than a group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    /// Accepted for compatibility with older clients; prefixes are always
    /// computed by the resolver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cidr: Option<Cidr>,
    /// Tag selector: a host is eligible for this group when every
    /// `(key, value)` here appears in the host's tags.  Empty matches all.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub assignment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupOrHost>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<Host>,
}

/// Binds an ordered group map to the networks it subdivides.
#[derive(
    Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct TopologyDefinition {
    pub networks: Vec<String>,
    pub map: Vec<GroupOrHost>,
}

/// The full declarative topology: every network and every group map, in
/// declaration order.  Declaration order is meaningful: it breaks ties in
/// network selection and fixes which sibling absorbs leftover address
/// space.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct TopologyUpdateRequest {
    #[serde(default)]
    pub networks: Vec<NetworkDefinition>,
    #[serde(default)]
    pub topologies: Vec<TopologyDefinition>,
}

/// One allocation block in a listing.
#[derive(
    Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub cidr: Cidr,
    /// Name of the host the block belongs to.
    pub host: String,
    pub tenant: String,
    pub segment: String,
    #[serde(rename = "allocatedIPCount")]
    pub allocated_ip_count: u32,
}

/// Snapshot of blocks returned by the listing operations.
#[derive(
    Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct BlocksResponse {
    /// State revision the listing was taken at.
    pub revision: u64,
    pub blocks: Vec<BlockInfo>,
}
