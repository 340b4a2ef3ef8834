// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the IPAM core and the services that call it.
//!
//! Everything here is part of the wire contract: the topology update
//! request, host records, block listings, the CIDR scalar, and the
//! structured error with its stable `kind` strings.  The allocation engine
//! itself lives in the `ipam` crate.

pub mod api;
pub mod cidr;
pub mod error;

pub use cidr::Cidr;
pub use error::Error;
pub use error::ResourceType;
