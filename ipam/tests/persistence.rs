// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The saver/loader contract: snapshot round-trips, rollback on saver
//! failure, and refusal of corrupt snapshots.

use std::net::Ipv4Addr;

use ipam::Ipam;

mod common;
use common::ipam_with;
use common::single_host_topology;
use common::test_logger;
use common::TestSaver;

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

#[test]
fn snapshot_round_trips_through_the_loader() {
    let (ipam, saver) = ipam_with(single_host_topology("10.0.0.0/29", 30));
    ipam.allocate_ip("a", "host1", "ten1", "seg1").unwrap();
    ipam.allocate_ip("b", "host1", "ten1", "seg1").unwrap();
    ipam.black_out("10.0.0.4/31").unwrap();

    let reloaded_saver = TestSaver::new();
    let reloaded = Ipam::load(
        test_logger(),
        reloaded_saver.saver(),
        &saver.last_json(),
    )
    .unwrap();
    reloaded.check_invariants().unwrap();

    // Allocation state survived: tokens resolve, and the next allocation
    // continues where the original left off, honoring the blackout.
    assert_eq!(reloaded.endpoint_ip("a"), Some(ip("10.0.0.0")));
    assert_eq!(reloaded.endpoint_ip("b"), Some(ip("10.0.0.1")));
    assert_eq!(
        reloaded.allocate_ip("c", "host1", "ten1", "seg1").unwrap(),
        ip("10.0.0.2")
    );
    assert_eq!(
        reloaded.allocate_ip("d", "host1", "ten1", "seg1").unwrap(),
        ip("10.0.0.3")
    );
    // The blacked-out pair is skipped; the next block would start at .4,
    // so exhaustion of the first block rolls into .6.
    assert_eq!(
        reloaded.allocate_ip("e", "host1", "ten1", "seg1").unwrap(),
        ip("10.0.0.6")
    );
    reloaded.check_invariants().unwrap();

    // The reloaded instance saves through its own saver.
    assert!(reloaded_saver.save_count() > 0);
}

#[test]
fn saver_failure_rolls_the_operation_back() {
    let (ipam, saver) = ipam_with(single_host_topology("10.0.0.0/29", 30));
    let saves = saver.save_count();

    saver.set_failing(true);
    let err = ipam.allocate_ip("t", "host1", "ten1", "seg1").unwrap_err();
    assert_eq!(err.kind(), "internal");
    assert!(err.to_string().contains("simulated saver outage"));
    assert_eq!(saver.save_count(), saves);

    // Nothing leaked: no endpoint, no block, invariants intact.
    assert_eq!(ipam.endpoint_ip("t"), None);
    assert!(ipam.list_all_blocks().blocks.is_empty());
    ipam.check_invariants().unwrap();

    // Once the saver recovers the same request succeeds from scratch.
    saver.set_failing(false);
    assert_eq!(
        ipam.allocate_ip("t", "host1", "ten1", "seg1").unwrap(),
        ip("10.0.0.0")
    );
    assert_eq!(saver.save_count(), saves + 1);
}

#[test]
fn each_successful_mutation_saves_exactly_once() {
    let (ipam, saver) = ipam_with(single_host_topology("10.0.0.0/29", 30));
    let base = saver.save_count();

    ipam.allocate_ip("a", "host1", "ten1", "seg1").unwrap();
    assert_eq!(saver.save_count(), base + 1);

    ipam.black_out("10.0.0.4/31").unwrap();
    assert_eq!(saver.save_count(), base + 2);

    ipam.un_black_out("10.0.0.4/31").unwrap();
    assert_eq!(saver.save_count(), base + 3);

    ipam.deallocate_ip("a").unwrap();
    assert_eq!(saver.save_count(), base + 4);

    // Failed operations do not save.
    ipam.deallocate_ip("a").unwrap_err();
    ipam.allocate_ip("", "host1", "t", "s").unwrap_err();
    assert_eq!(saver.save_count(), base + 4);
}

#[test]
fn corrupt_snapshots_are_refused() {
    let (ipam, saver) = ipam_with(single_host_topology("10.0.0.0/29", 30));
    ipam.allocate_ip("a", "host1", "ten1", "seg1").unwrap();

    // Clear the backing bit while keeping the endpoint record: the loader
    // must notice the bijection is broken.
    let mut snapshot: serde_json::Value =
        serde_json::from_str(&saver.last_json()).unwrap();
    let bitmap = &mut snapshot["networks"]["net1"]["group"]["groups"][0]
        ["blocks"][0]["bitmap"];
    bitmap["set"] = serde_json::json!([]);
    let err = Ipam::load(
        test_logger(),
        TestSaver::new().saver(),
        &snapshot.to_string(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), "internal");

    // Unparseable input is invalid, not internal.
    let err =
        Ipam::load(test_logger(), TestSaver::new().saver(), "{]").unwrap_err();
    assert_eq!(err.kind(), "invalid");
}
