mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use hostmesh_core::types::{hsid, AGREEMENT_SITE_ID};
use hostmesh_messaging::{FailureSiteUpdate, Mailbox, Message, PoisonCause, Subject};

use common::{eventually, shutdown_all, start_mesh, start_mesh_with};

const DETECT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_report_failure_is_idempotent() {
    let nodes = start_mesh(3).await;
    let leader = &nodes[0];

    leader.messenger.report_foreign_host_failed(2);
    leader.messenger.report_foreign_host_failed(2);

    assert_eq!(
        leader.faults.reported_sites(),
        vec![hsid(2, AGREEMENT_SITE_ID)]
    );
    assert_eq!(leader.messenger.count_foreign_hosts(), 1);
    assert_eq!(leader.messenger.hostname_for_host_id(2), "node-2");
    assert_eq!(
        leader.messenger.failed_hosts().get(&2).map(String::as_str),
        Some("node-2")
    );
    // Two of three hosts remain, a majority
    assert_eq!(leader.fatal.count(), 0);

    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cut_link_is_detected_on_both_ends() {
    let nodes = start_mesh(3).await;

    nodes[0].messenger.cut_link(1).unwrap();

    assert!(
        eventually(DETECT, || nodes[0].messenger.failed_hosts().contains_key(&1)).await
    );
    assert!(
        eventually(DETECT, || nodes[1].messenger.failed_hosts().contains_key(&0)).await
    );
    assert!(nodes[0]
        .faults
        .reported_sites()
        .contains(&hsid(1, AGREEMENT_SITE_ID)));
    assert!(nodes[1]
        .faults
        .reported_sites()
        .contains(&hsid(0, AGREEMENT_SITE_ID)));

    // Host 2 still sees everyone
    assert_eq!(nodes[2].messenger.count_foreign_hosts(), 2);
    assert!(nodes.iter().all(|n| n.fatal.count() == 0));

    assert!(nodes[0].messenger.cut_link(1).is_err());
    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_losing_half_shuts_down() {
    let nodes = start_mesh(2).await;

    // Each side keeps one of two hosts. Only the side with host 0 continues.
    nodes[0].messenger.cut_link(1).unwrap();

    assert!(eventually(DETECT, || nodes[1].fatal.count() == 1).await);
    assert!(nodes[1].fatal.reasons()[0].contains("Partition detected"));
    assert_eq!(nodes[0].fatal.count(), 0);

    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_even_split_keeps_the_half_with_host_zero() {
    let nodes = start_mesh(4).await;

    // Hosts 0 and 1 lose both links to hosts 2 and 3
    for near in 0..2 {
        for far in 2..4 {
            nodes[near].messenger.cut_link(far).unwrap();
        }
    }

    for node in &nodes[2..] {
        assert!(eventually(DETECT, || node.fatal.count() >= 1).await);
        assert!(node.fatal.reasons()[0].contains("Partition detected"));
    }
    for node in &nodes[..2] {
        assert!(eventually(DETECT, || node.messenger.failed_hosts().len() == 2).await);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(nodes[..2].iter().all(|n| n.fatal.count() == 0));

    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_minority_shuts_down() {
    let nodes = start_mesh(3).await;

    nodes[2].messenger.cut_link(0).unwrap();
    nodes[2].messenger.cut_link(1).unwrap();

    assert!(eventually(DETECT, || nodes[2].fatal.count() >= 1).await);
    assert!(nodes[2].fatal.reasons()[0].contains("Partition detected"));
    for node in &nodes[..2] {
        assert!(eventually(DETECT, || node.messenger.failed_hosts().contains_key(&2)).await);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(nodes[..2].iter().all(|n| n.fatal.count() == 0));

    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partition_detection_disabled_keeps_running() {
    let nodes = start_mesh_with(2, |_, config| config.failure.partition_detection = false).await;

    nodes[0].messenger.cut_link(1).unwrap();
    assert!(
        eventually(DETECT, || nodes[1].messenger.failed_hosts().contains_key(&0)).await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(nodes[1].fatal.count(), 0);

    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_announced_stop_is_not_a_partition() {
    let nodes = start_mesh(2).await;

    nodes[0].messenger.send_stop_node_notice(0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    nodes[0].messenger.shutdown();

    assert!(
        eventually(DETECT, || nodes[1].messenger.failed_hosts().contains_key(&0)).await
    );
    assert_eq!(
        nodes[1].faults.reported_sites(),
        vec![hsid(0, AGREEMENT_SITE_ID)]
    );
    assert_eq!(nodes[1].fatal.count(), 0);
    // The announcement is consumed once the host is gone
    assert!(eventually(DETECT, || nodes[1].messenger.stopping_hosts().is_empty()).await);

    nodes[1].messenger.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_fails_host_elsewhere() {
    let nodes = start_mesh(3).await;

    nodes[2].messenger.shutdown();
    for node in &nodes[..2] {
        assert!(eventually(DETECT, || node.messenger.count_foreign_hosts() == 1).await);
        assert_eq!(node.messenger.hostname_for_host_id(2), "node-2");
    }
    // The stopped host does not report anything itself
    assert!(nodes[2].faults.reported_sites().is_empty());

    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_host_is_declared_dead() {
    let nodes = start_mesh(2).await;

    // With a 1 ms timeout the gap between any two heartbeats from host 1 is
    // long enough to declare it dead
    nodes[0].messenger.set_dead_host_timeout(1);
    assert_eq!(nodes[0].messenger.dead_host_timeout_ms(), 1);
    nodes[0].messenger.set_partition_detection(false);

    assert!(
        eventually(DETECT, || nodes[0].messenger.failed_hosts().contains_key(&1)).await
    );

    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_poison_pill_crashes_target() {
    let nodes = start_mesh(3).await;

    nodes[0]
        .messenger
        .send_poison_pill_to(&[2], "bad state", PoisonCause::CrashMe);

    assert!(eventually(DETECT, || nodes[2].fatal.count() == 1).await);
    assert!(nodes[2].fatal.reasons()[0].contains("bad state"));
    assert_eq!(nodes[1].fatal.count(), 0);

    nodes[0].messenger.send_poison_pill("everyone out");
    assert!(eventually(DETECT, || nodes[1].fatal.count() == 1).await);
    assert!(eventually(DETECT, || nodes[2].fatal.count() == 2).await);
    assert_eq!(nodes[0].fatal.count(), 0);

    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stacktrace_pill_is_not_fatal() {
    let nodes = start_mesh(2).await;

    nodes[0]
        .messenger
        .send_poison_pill_to(&[1], "dump", PoisonCause::PrintStacktrace);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(nodes[1].fatal.count(), 0);
    assert_eq!(nodes[1].messenger.count_foreign_hosts(), 1);

    shutdown_all(&nodes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_updates_derive_faults() {
    let nodes = start_mesh(3).await;

    // Host 0's agreement site reports host 2 failed with host 1 surviving
    let agreement = nodes[1]
        .messenger
        .create_mailbox(Some(hsid(1, AGREEMENT_SITE_ID)))
        .unwrap();
    let reporter = nodes[0]
        .messenger
        .create_mailbox(Some(hsid(0, AGREEMENT_SITE_ID)))
        .unwrap();

    let survivors: BTreeSet<_> = [hsid(0, AGREEMENT_SITE_ID), hsid(1, AGREEMENT_SITE_ID)]
        .into_iter()
        .collect();
    let update = FailureSiteUpdate::new(
        survivors.clone(),
        [(hsid(2, AGREEMENT_SITE_ID), 100)].into_iter().collect(),
    );
    reporter.send(agreement.hsid(), Message::new(update.clone()));

    let delivered = tokio::time::timeout(
        DETECT,
        agreement.recv_async(&[Subject::FailureSiteUpdate]),
    )
    .await
    .expect("update not delivered")
    .unwrap();
    assert_eq!(delivered.subject(), Subject::FailureSiteUpdate);

    let faults = nodes[1].faults.faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].failed_site, hsid(2, AGREEMENT_SITE_ID));
    assert_eq!(faults[0].reporting_site, hsid(0, AGREEMENT_SITE_ID));
    assert!(!faults[0].witnessed);
    assert_eq!(faults[0].survivors, survivors);

    // Host 1 relays the same report to host 2; the forward is unwrapped to
    // the original reporter and host 2 is not a survivor, so it derives nothing
    let relay_target = nodes[2]
        .messenger
        .create_mailbox(Some(hsid(2, AGREEMENT_SITE_ID)))
        .unwrap();
    nodes[1]
        .messenger
        .relay_failure_update(reporter.hsid(), update, &[relay_target.hsid()]);
    let forwarded = tokio::time::timeout(
        DETECT,
        relay_target.recv_async(&[Subject::SiteFailureForward]),
    )
    .await
    .expect("forward not delivered")
    .unwrap();
    assert_eq!(forwarded.source(), hsid(1, AGREEMENT_SITE_ID));
    assert!(nodes[2].faults.faults().is_empty());

    // A repeated update from the same reporter is not derived again
    let repeat = FailureSiteUpdate::new(
        survivors,
        [(hsid(2, AGREEMENT_SITE_ID), 100)].into_iter().collect(),
    );
    reporter.send(agreement.hsid(), Message::new(repeat));
    tokio::time::timeout(DETECT, agreement.recv_async(&[Subject::FailureSiteUpdate]))
        .await
        .expect("update not delivered")
        .unwrap();
    assert_eq!(nodes[1].faults.faults().len(), 1);

    shutdown_all(&nodes);
}
