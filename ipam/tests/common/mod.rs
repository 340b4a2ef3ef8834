// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared helpers for the API-level tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;

use ipam::Ipam;
use ipam::Saver;

/// A saver that captures the last snapshot it was handed, counts saves, and
/// can be told to fail, which lets tests observe rollback behavior.
#[derive(Clone, Default)]
pub struct TestSaver {
    last: Arc<Mutex<Option<String>>>,
    failing: Arc<Mutex<bool>>,
    saves: Arc<Mutex<u64>>,
}

impl TestSaver {
    pub fn new() -> TestSaver {
        TestSaver::default()
    }

    pub fn saver(&self) -> Saver {
        let last = self.last.clone();
        let failing = self.failing.clone();
        let saves = self.saves.clone();
        Box::new(move |state| {
            if *failing.lock().unwrap() {
                anyhow::bail!("simulated saver outage");
            }
            *last.lock().unwrap() =
                Some(serde_json::to_string_pretty(state)?);
            *saves.lock().unwrap() += 1;
            Ok(())
        })
    }

    /// The last snapshot saved, as JSON text.
    pub fn last_json(&self) -> String {
        self.last.lock().unwrap().clone().expect("nothing saved yet")
    }

    pub fn save_count(&self) -> u64 {
        *self.saves.lock().unwrap()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

/// Builds an aggregate from a topology request in wire form and applies it.
pub fn ipam_with(topology: serde_json::Value) -> (Ipam, TestSaver) {
    let saver = TestSaver::new();
    let ipam = Ipam::new(test_logger(), saver.saver());
    let req = serde_json::from_value(topology).expect("test topology parses");
    ipam.update_topology(req).expect("test topology applies");
    ipam.check_invariants().expect("invariants after topology");
    (ipam, saver)
}

/// A single network holding `host1` in one leaf covering the whole network.
pub fn single_host_topology(
    cidr: &str,
    block_mask: u8,
) -> serde_json::Value {
    serde_json::json!({
        "networks": [
            {"name": "net1", "cidr": cidr, "blockMask": block_mask}
        ],
        "topologies": [
            {"networks": ["net1"],
             "map": [
                {"name": "rack1",
                 "hosts": [{"name": "host1", "ip": "192.168.99.10"}]}
             ]}
        ]
    })
}
