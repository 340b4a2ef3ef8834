// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error handling facilities for the IPAM core.
//!
//! Components embedding the core convert these errors into their transport's
//! error shape as one of the last steps of processing a request; everything
//! below that layer stays transport-agnostic.  Where possible we reuse
//! existing variants rather than inventing new ones to distinguish cases no
//! programmatic consumer needs to distinguish.

use std::fmt;

use http::StatusCode;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// The type of resource a failed lookup was for.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Network,
    Host,
    Endpoint,
    Blackout,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Network => "network",
            ResourceType::Host => "host",
            ResourceType::Endpoint => "endpoint",
            ResourceType::Blackout => "blackout",
        };
        write!(f, "{}", s)
    }
}

/// An error produced by the IPAM core.
///
/// The serialized form is tagged by `kind`, and `kind` strings are stable:
/// clients branch on them.  The `Display` form of [`Error::Exhausted`] is the
/// literal `"no available IP"`, which clients use for retry decisions; do not
/// reword it.
#[derive(
    Clone,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    thiserror::Error,
)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Error {
    /// The request was malformed: a bad CIDR, an empty owner token, an
    /// impossible topology.
    #[error("invalid request: {message}")]
    Invalid { message: String },

    /// An object this operation needs does not exist.
    #[error("{type_name} not found: \"{name}\"")]
    NotFound { type_name: ResourceType, name: String },

    /// The request is well-formed but contradicts current state: a duplicate
    /// host, a token reused with different parameters, a blackout overlapping
    /// live allocations.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// No address can satisfy the request anywhere in its scope.
    #[error("no available IP")]
    Exhausted,

    /// A saver failure or a broken internal invariant.  The process should be
    /// considered unhealthy if one of these surfaces outside of load.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn invalid<S: Into<String>>(message: S) -> Error {
        Error::Invalid { message: message.into() }
    }

    pub fn not_found<S: Into<String>>(
        type_name: ResourceType,
        name: S,
    ) -> Error {
        Error::NotFound { type_name, name: name.into() }
    }

    pub fn conflict<S: Into<String>>(message: S) -> Error {
        Error::Conflict { message: message.into() }
    }

    /// Generates an [`Error::Internal`] with the given message.
    ///
    /// This is for operational conditions that should not happen but that we
    /// cannot reasonably handle at runtime (a saver refusing to persist, a
    /// snapshot whose bitmaps disagree with its endpoint records).
    pub fn internal<S: Into<String>>(message: S) -> Error {
        Error::Internal { message: message.into() }
    }

    /// The stable `kind` string for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Invalid { .. } => "invalid",
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::Exhausted => "exhausted",
            Error::Internal { .. } => "internal",
        }
    }

    /// How this error is exposed over HTTP by embedding services.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Invalid { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Exhausted => StatusCode::INSUFFICIENT_STORAGE,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
