// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IP address management core for the cluster networking control plane.
//!
//! The [`Ipam`] aggregate assigns IPv4 addresses to workload endpoints
//! across a fleet of hosts.  A declarative topology maps hosts into
//! hierarchical groups, reserves CIDR prefixes for those groups, and
//! pre-computes per-host allocation ranges; allocation then walks network →
//! host's leaf group → block → offset.  Every mutation is persisted through
//! a caller-supplied [`Saver`] before it becomes visible.
//!
//! This crate has no transport: HTTP surfaces, service discovery, and
//! configuration live in the services embedding it.  They construct an
//! [`Ipam`] with a logger and a saver, feed it
//! [`ipam_types::api::TopologyUpdateRequest`]s, and call the allocation API.

pub mod bitmap;
pub mod block;
pub mod store;
pub mod topology;

pub use store::Ipam;
pub use store::Saver;
pub use store::State;
