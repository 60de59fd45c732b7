//! OTA handshake and chunked-transfer tests against simulated nodes.

use std::sync::Arc;
use std::time::Duration;

use formic_controller::Controller;
use formic_core::{DeviceAddress, FirmwareImage};
use formic_sim::{DropChunkAcks, SimGateway, SimNode};

mod common;
use common::{fast_node, fast_settings, wait_for_known, TestBed};

fn firmware(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_announce_partitions_acked_and_missed() {
    let mut refusing = fast_node(2);
    refusing.refuse_ota_start = true;
    let bed = TestBed::with_configs(vec![fast_node(1), refusing], fast_settings()).await;

    let image = firmware(300);
    let report = bed.controller.start_ota(&image, None).await.unwrap();
    assert_eq!(report.acked, vec![DeviceAddress(1)]);
    assert_eq!(report.missed, vec![DeviceAddress(2)]);
    assert_eq!(report.chunk_count, 3);
    assert_eq!(
        report.sha256,
        FirmwareImage::new(image).unwrap().sha256_hex(),
    );
    bed.teardown().await;
}

#[tokio::test]
async fn test_flash_two_nodes_end_to_end() {
    let bed = TestBed::with_nodes(2).await;

    let image = firmware(300);
    let report = bed.controller.start_ota(&image, None).await.unwrap();
    assert_eq!(report.acked, vec![DeviceAddress(1), DeviceAddress(2)]);
    assert!(report.missed.is_empty());

    let outcomes = bed
        .controller
        .transfer(&image, &report.acked, None, None)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    for (device, outcome) in &outcomes {
        assert!(outcome.success, "device {device} did not finish");
        assert!(outcome.hashes_match, "device {device} digest mismatch");
    }
    bed.teardown().await;
}

#[tokio::test]
async fn test_transfer_retries_through_dropped_acks() {
    let mut flaky = fast_node(1);
    flaky.drop_chunk_acks = Some(DropChunkAcks { index: 1, count: 2 });
    let bed = TestBed::with_configs(vec![flaky], fast_settings()).await;

    let image = firmware(300);
    let report = bed
        .controller
        .start_ota(&image, Some(vec![DeviceAddress(1)]))
        .await
        .unwrap();
    assert_eq!(report.acked, vec![DeviceAddress(1)]);

    let outcomes = bed
        .controller
        .transfer(&image, &report.acked, None, None)
        .await
        .unwrap();
    let outcome = outcomes[&DeviceAddress(1)];
    assert!(outcome.success);
    assert!(outcome.hashes_match);
    bed.teardown().await;
}

#[tokio::test]
async fn test_transfer_aborts_after_retry_budget() {
    let mut dead = fast_node(1);
    dead.drop_chunk_acks = Some(DropChunkAcks { index: 0, count: 1_000 });
    let bed = TestBed::with_configs(vec![dead], fast_settings()).await;

    let image = firmware(300);
    let report = bed
        .controller
        .start_ota(&image, Some(vec![DeviceAddress(1)]))
        .await
        .unwrap();
    assert_eq!(report.acked, vec![DeviceAddress(1)]);

    let outcomes = bed
        .controller
        .transfer(&image, &report.acked, Some(Duration::from_millis(50)), Some(1))
        .await
        .unwrap();
    let outcome = outcomes[&DeviceAddress(1)];
    assert!(!outcome.success);
    assert!(!outcome.hashes_match);
    bed.teardown().await;
}

#[tokio::test]
async fn test_one_device_failing_does_not_stop_others() {
    let mut dead = fast_node(1);
    dead.drop_chunk_acks = Some(DropChunkAcks { index: 0, count: 1_000 });
    let bed = TestBed::with_configs(vec![dead, fast_node(2)], fast_settings()).await;

    let image = firmware(300);
    let report = bed.controller.start_ota(&image, None).await.unwrap();
    assert_eq!(report.acked, vec![DeviceAddress(1), DeviceAddress(2)]);

    let outcomes = bed
        .controller
        .transfer(&image, &report.acked, Some(Duration::from_millis(100)), Some(2))
        .await
        .unwrap();
    assert!(!outcomes[&DeviceAddress(1)].success);
    assert!(outcomes[&DeviceAddress(2)].success);
    assert!(outcomes[&DeviceAddress(2)].hashes_match);
    bed.teardown().await;
}

#[tokio::test]
async fn test_corrupted_chunk_fails_digest_check() {
    let mut corrupting = fast_node(1);
    corrupting.corrupt_chunk = Some(1);
    let bed = TestBed::with_configs(vec![corrupting], fast_settings()).await;

    let image = firmware(300);
    let report = bed
        .controller
        .start_ota(&image, Some(vec![DeviceAddress(1)]))
        .await
        .unwrap();
    assert_eq!(report.acked, vec![DeviceAddress(1)]);

    // Every chunk is acknowledged, but the reassembled image does not
    // match the announced digest.
    let outcomes = bed
        .controller
        .transfer(&image, &report.acked, None, None)
        .await
        .unwrap();
    let outcome = outcomes[&DeviceAddress(1)];
    assert!(outcome.success);
    assert!(!outcome.hashes_match);
    bed.teardown().await;
}

#[tokio::test]
async fn test_announce_skips_running_devices() {
    let bed = TestBed::with_nodes(2).await;
    bed.controller.start(None, None).await.unwrap();

    // Nobody is in the bootloader, so a broadcast announcement has no
    // audience and returns an empty report without waiting.
    let report = bed.controller.start_ota(&firmware(300), None).await.unwrap();
    assert!(report.acked.is_empty());
    assert!(report.missed.is_empty());
    bed.teardown().await;
}

#[tokio::test]
async fn test_terminate_mid_transfer_reports_aborted() {
    let gateway = SimGateway::new();
    let mut stuck = fast_node(1);
    stuck.drop_chunk_acks = Some(DropChunkAcks { index: 0, count: 1_000 });
    let node = SimNode::spawn(&gateway, stuck);
    let controller = Arc::new(Controller::new(gateway, fast_settings()).unwrap());
    wait_for_known(&controller, 1).await;

    let image = firmware(300);
    let report = controller
        .start_ota(&image, Some(vec![DeviceAddress(1)]))
        .await
        .unwrap();
    assert_eq!(report.acked, vec![DeviceAddress(1)]);

    let task = tokio::spawn({
        let controller = Arc::clone(&controller);
        let image = image.clone();
        async move { controller.transfer(&image, &[DeviceAddress(1)], None, None).await }
    });

    // The transfer is stuck resending chunk zero; tear the controller
    // down underneath it.
    tokio::time::sleep(Duration::from_millis(250)).await;
    controller.terminate().await;

    let outcomes = task.await.unwrap().unwrap();
    assert!(!outcomes[&DeviceAddress(1)].success);
    node.shutdown();
}
