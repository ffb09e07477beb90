//! USB Bridge Integration Tests
//!
//! Tests for the async channel bridge between Tokio runtime and USB thread.
//!
//! Run with: `cargo test -p common --test usb_bridge_tests`

use common::{DeviceSummary, UsbCommand, UsbEvent, create_usb_bridge};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn summary(device: u8) -> DeviceSummary {
    DeviceSummary {
        node_path: PathBuf::from(format!("/dev/bus/usb/001/{:03}", device)),
        control_path: None,
        vendor_id: 0x1c71,
        product_id: 0xc005,
        class: 0,
        num_configurations: 1,
    }
}

#[tokio::test]
async fn test_list_devices_round_trip() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        if let Ok(UsbCommand::ListDevices { response }) = worker.recv_command() {
            let _ = response.send(vec![summary(2), summary(3)]);
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::ListDevices { response: tx })
        .await
        .expect("Failed to send command");

    let devices = tokio::time::timeout(TEST_TIMEOUT, rx)
        .await
        .expect("timed out")
        .expect("Failed to receive response");
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[1].node_path, PathBuf::from("/dev/bus/usb/001/003"));

    handle.join().expect("Worker thread panicked");
}

#[tokio::test]
async fn test_rescan_reports_errors_as_text() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        if let Ok(UsbCommand::Rescan { response }) = worker.recv_command() {
            let _ = response.send(Err("usbfs not mounted".to_string()));
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::Rescan { response: tx })
        .await
        .unwrap();

    let result = tokio::time::timeout(TEST_TIMEOUT, rx).await.unwrap().unwrap();
    assert_eq!(result, Err("usbfs not mounted".to_string()));

    handle.join().unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_worker_loop() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        let mut iterations = 0;
        loop {
            match worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => break,
                Some(_) => {}
                None => thread::sleep(Duration::from_millis(5)),
            }
            iterations += 1;
        }
        iterations
    });

    bridge.send_command(UsbCommand::Shutdown).await.unwrap();
    let iterations = handle.join().unwrap();
    assert!(iterations >= 1);
}

#[test]
fn test_try_recv_without_commands() {
    let (_bridge, worker) = create_usb_bridge();
    assert!(worker.try_recv_command().is_none());
}

#[test]
fn test_send_event_fails_after_bridge_dropped() {
    let (bridge, worker) = create_usb_bridge();
    drop(bridge);

    let result = worker.send_event(UsbEvent::DeviceLost {
        node_path: PathBuf::from("/dev/bus/usb/001/002"),
        reason: "unplugged".to_string(),
    });
    assert!(result.is_err());
}
