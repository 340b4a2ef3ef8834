// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host admission, tag-driven placement, and removal.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipam_types::api::Host;
use serde_json::json;

mod common;
use common::ipam_with;
use common::single_host_topology;

fn host(name: &str, ip: &str, tags: &[(&str, &str)]) -> Host {
    Host {
        name: name.to_string(),
        ip: ip.parse().unwrap(),
        tags: tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

fn tiered_topology() -> serde_json::Value {
    json!({
        "networks": [
            {"name": "net1", "cidr": "10.0.0.0/16", "blockMask": 30}
        ],
        "topologies": [
            {"networks": ["net1"],
             "map": [
                {"name": "backend", "assignment": {"tier": "backend"}},
                {"name": "frontend", "assignment": {"tier": "frontend"}}
             ]}
        ]
    })
}

#[test]
fn hosts_land_in_the_first_matching_leaf() {
    let (ipam, saver) = ipam_with(tiered_topology());

    for i in 0..8 {
        ipam.add_host(host(
            &format!("backend-host-{}", i),
            &format!("10.10.100.1{}", i),
            &[("tier", "backend")],
        ))
        .unwrap();
    }
    for i in 0..4 {
        ipam.add_host(host(
            &format!("frontend-host-{}", i),
            &format!("10.10.200.1{}", i),
            &[("tier", "frontend")],
        ))
        .unwrap();
    }
    ipam.check_invariants().unwrap();
    assert_eq!(ipam.list_hosts().len(), 12);

    // Every backend host is in the first leaf, every frontend host in the
    // second; first match in tree order wins, so nothing is spread.
    let snapshot: serde_json::Value =
        serde_json::from_str(&saver.last_json()).unwrap();
    let groups = &snapshot["networks"]["net1"]["group"]["groups"];
    assert_eq!(groups[0]["hosts"].as_array().unwrap().len(), 8);
    assert_eq!(groups[1]["hosts"].as_array().unwrap().len(), 4);

    // Allocations follow placement into the leaf's territory.
    let got = ipam
        .allocate_ip("t1", "backend-host-0", "ten1", "")
        .unwrap();
    assert_eq!(got, Ipv4Addr::new(10, 0, 0, 0));
    let got = ipam
        .allocate_ip("t2", "frontend-host-0", "ten1", "")
        .unwrap();
    assert_eq!(got, Ipv4Addr::new(10, 0, 128, 0));
    ipam.check_invariants().unwrap();
}

#[test]
fn host_without_a_matching_leaf_is_rejected() {
    let (ipam, _saver) = ipam_with(tiered_topology());
    let err = ipam
        .add_host(host("untiered", "10.10.0.1", &[("rack", "r1")]))
        .unwrap_err();
    assert_eq!(err.kind(), "invalid");
    assert!(ipam.list_hosts().is_empty());
}

#[test]
fn duplicate_hosts_are_conflicts() {
    let (ipam, _saver) = ipam_with(single_host_topology("10.0.0.0/29", 30));

    let err =
        ipam.add_host(host("host1", "192.168.99.99", &[])).unwrap_err();
    assert_eq!(err.kind(), "conflict");

    // Same IP under a different name is also refused.
    let err =
        ipam.add_host(host("host2", "192.168.99.10", &[])).unwrap_err();
    assert_eq!(err.kind(), "conflict");

    assert_eq!(ipam.list_hosts().len(), 1);
}

#[test]
fn removal_is_blocked_by_live_allocations() {
    let (ipam, _saver) = ipam_with(single_host_topology("10.0.0.0/29", 30));

    ipam.allocate_ip("t", "host1", "ten1", "seg1").unwrap();
    let err = ipam.remove_host("host1").unwrap_err();
    assert_eq!(err.kind(), "conflict");

    // Draining the host unblocks removal; its empty block stays behind for
    // reuse but the host itself is gone.
    ipam.deallocate_ip("t").unwrap();
    ipam.remove_host("host1").unwrap();
    ipam.check_invariants().unwrap();
    assert!(ipam.list_hosts().is_empty());

    let err =
        ipam.allocate_ip("t2", "host1", "ten1", "seg1").unwrap_err();
    assert_eq!(err.kind(), "not_found");

    // Unknown host removal is an error.
    assert_eq!(ipam.remove_host("host1").unwrap_err().kind(), "not_found");
}

#[test]
fn list_hosts_preserves_admission_order() {
    let (ipam, _saver) = ipam_with(tiered_topology());
    for (name, ip, tier) in [
        ("c", "10.1.0.3", "backend"),
        ("a", "10.1.0.1", "frontend"),
        ("b", "10.1.0.2", "backend"),
    ] {
        ipam.add_host(host(name, ip, &[("tier", tier)])).unwrap();
    }
    let names: Vec<String> =
        ipam.list_hosts().into_iter().map(|h| h.name).collect();
    assert_eq!(names, vec!["c", "a", "b"]);
}
