//! Integration tests for the asynchronous input monitor
//!
//! The monitor keeps one request in flight per input endpoint. These tests
//! drive completions by hand through the in-memory usbfs and pump
//! `handle_events` to observe buffering, callbacks, backoff and faults.

use nix::errno::Errno;
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;
use tempfile::TempDir;
use transport::locator::{Verifier, path_exists};
use transport::testing::MockUsbfs;
use transport::usbfs::{URB_TYPE_BULK, URB_TYPE_INTERRUPT};
use transport::{
    DeviceDescriptor, EndpointDescriptor, EndpointTransfer, InputNotice, TransportSettings,
    UsbDevice, UsbError, UsbTransport, UsbfsLocator,
};

/// Long enough for any parked request to come due
const RESUBMIT_WAIT: Duration = Duration::from_millis(60);

struct Fixture {
    _dir: TempDir,
    mock: MockUsbfs,
    device: UsbDevice,
}

fn never(_: &Path) -> bool {
    false
}

fn fixture_with(settings: TransportSettings) -> Fixture {
    let dir = TempDir::new().unwrap();
    let bus = dir.path().join("usb/003");
    fs::create_dir_all(&bus).unwrap();
    fs::write(
        bus.join("007"),
        [
            0x12, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x71, 0x1c, 0x05, 0xc0, 0x00, 0x01,
            0x01, 0x02, 0x03, 0x01,
        ],
    )
    .unwrap();

    let settings = TransportSettings {
        sysfs_root: dir.path().join("sys"),
        private_mount_dir: None,
        ..settings
    };
    let locator = UsbfsLocator::new(&settings)
        .with_candidates(vec![(dir.path().join("usb"), path_exists as Verifier)])
        .with_mount_table(Vec::new(), never);

    let mock = MockUsbfs::new();
    let mut transport = UsbTransport::with_backend(settings, locator, Rc::new(mock.clone()));
    let mut chooser = |_: &DeviceDescriptor| true;
    let device = transport.find_device(&mut chooser).unwrap();

    Fixture {
        _dir: dir,
        mock,
        device,
    }
}

/// Monitored device with interrupt input endpoint 1 (interval 4 ms)
fn fixture() -> Fixture {
    let mut f = fixture_with(TransportSettings::default());
    f.device
        .define_endpoint(EndpointDescriptor::input(1, EndpointTransfer::Interrupt, 8, 4));
    f
}

/// Arm the monitor of input endpoint `number` with a zero-timeout read
fn arm(f: &mut Fixture, number: u8) {
    let mut buffer = [0u8; 8];
    assert!(matches!(
        f.device.read_endpoint(number, &mut buffer, Duration::ZERO),
        Err(UsbError::NoData)
    ));
}

mod buffering {
    use super::*;

    #[test]
    fn test_first_read_arms_monitor() {
        let mut f = fixture();
        assert!(!f.device.is_monitoring(1));

        arm(&mut f, 1);
        assert!(f.device.is_monitoring(1));
        assert_eq!(f.mock.pending_urbs(), 1);
        assert_eq!(f.mock.next_pending_endpoint(), Some(0x81));
        assert_eq!(f.mock.state().submissions, vec![(URB_TYPE_INTERRUPT, 0x81)]);
    }

    #[test]
    fn test_completed_input_is_buffered() {
        let mut f = fixture();
        arm(&mut f, 1);
        assert!(f.mock.complete_next(&[0x1b, 0x4b, 0x01]));

        let mut buffer = [0u8; 8];
        let count = f
            .device
            .read_endpoint(1, &mut buffer, Duration::from_millis(50))
            .unwrap();
        assert_eq!(&buffer[..count], &[0x1b, 0x4b, 0x01]);
    }

    #[test]
    fn test_short_reads_drain_buffer_in_order() {
        let mut f = fixture();
        arm(&mut f, 1);
        assert!(f.mock.complete_next(&[1, 2, 3]));
        f.device.handle_events(Duration::ZERO).unwrap();

        let mut buffer = [0u8; 2];
        assert_eq!(f.device.read_endpoint(1, &mut buffer, Duration::ZERO).unwrap(), 2);
        assert_eq!(buffer, [1, 2]);
        assert_eq!(f.device.read_endpoint(1, &mut buffer, Duration::ZERO).unwrap(), 1);
        assert_eq!(buffer[0], 3);
    }

    #[test]
    fn test_buffered_read_with_unbounded_timeout() {
        let mut f = fixture();
        arm(&mut f, 1);
        assert!(f.mock.complete_next(&[0x1b, 0x4b]));
        f.device.handle_events(Duration::ZERO).unwrap();

        let mut buffer = [0u8; 8];
        assert_eq!(f.device.read_endpoint(1, &mut buffer, Duration::MAX).unwrap(), 2);
        assert_eq!(&buffer[..2], &[0x1b, 0x4b]);
    }

    #[test]
    fn test_filter_rejection_ends_monitoring() {
        let mut f = fixture();
        f.device
            .add_input_filter(|_: u8, buffer: &mut [u8], length: usize| -> Option<usize> {
                (buffer[0] != 0).then_some(length)
            });
        arm(&mut f, 1);

        assert!(f.mock.complete_next(&[0, 1]));
        f.device.handle_events(Duration::ZERO).unwrap();

        assert!(!f.device.is_monitoring(1));
        assert_eq!(f.mock.pending_urbs(), 0);
        let mut buffer = [0u8; 8];
        assert!(matches!(
            f.device.read_endpoint(1, &mut buffer, Duration::ZERO),
            Err(UsbError::DeviceError { errno: Errno::EIO, .. })
        ));
        assert!(matches!(
            f.device.read_endpoint(1, &mut buffer, Duration::ZERO),
            Err(UsbError::NoData)
        ));
    }

    #[test]
    fn test_failed_prepare_leaves_endpoint_synchronous() {
        let mut f = fixture();
        f.device
            .define_endpoint(EndpointDescriptor::input(2, EndpointTransfer::Bulk, 0, 0));
        f.mock.state().bulk_input.push_back(Ok(vec![0x42]));

        let mut buffer = [0u8; 8];
        assert_eq!(f.device.read_endpoint(2, &mut buffer, Duration::ZERO).unwrap(), 1);
        assert!(!f.device.is_monitoring(2));
        assert!(f.mock.state().submissions.is_empty());
    }

    #[test]
    fn test_monitor_disabled_by_settings() {
        let mut f = fixture_with(TransportSettings {
            input_monitor: false,
            ..TransportSettings::default()
        });
        f.device
            .define_endpoint(EndpointDescriptor::input(1, EndpointTransfer::Bulk, 64, 0));

        assert!(matches!(
            f.device.monitor_input_endpoint(1, |_: &InputNotice<'_>| true),
            Err(UsbError::NotSupported(_))
        ));
        assert!(f.mock.state().submissions.is_empty());
    }
}

mod backoff {
    use super::*;

    #[test]
    fn test_empty_completions_double_interval_until_cap() {
        let mut f = fixture();
        arm(&mut f, 1);
        assert_eq!(f.device.input_backoff(1), Some(Duration::from_millis(4)));

        for step in 1..=5u32 {
            assert!(f.mock.complete_next(&[]));
            f.device.handle_events(Duration::ZERO).unwrap();

            let expected = Duration::from_millis((4u64 << step).min(40));
            assert_eq!(f.device.input_backoff(1), Some(expected));
            assert_eq!(f.mock.pending_urbs(), 0);

            f.device.handle_events(RESUBMIT_WAIT).unwrap();
            assert_eq!(f.mock.pending_urbs(), 1);
        }

        assert!(f.mock.complete_next(&[0x7f]));
        f.device.handle_events(Duration::ZERO).unwrap();
        assert_eq!(f.device.input_backoff(1), Some(Duration::from_millis(4)));
    }

    #[test]
    fn test_zero_interval_uses_configured_delay() {
        let mut f = fixture_with(TransportSettings {
            resubmit_delay_ms: 5,
            ..TransportSettings::default()
        });
        f.device
            .define_endpoint(EndpointDescriptor::input(2, EndpointTransfer::Bulk, 64, 0));
        arm(&mut f, 2);
        assert_eq!(f.device.input_backoff(2), Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_zero_delay_backoff_starts_at_one_ms() {
        let mut f = fixture_with(TransportSettings {
            resubmit_delay_ms: 0,
            ..TransportSettings::default()
        });
        f.device
            .define_endpoint(EndpointDescriptor::input(2, EndpointTransfer::Bulk, 64, 0));
        arm(&mut f, 2);
        assert_eq!(f.device.input_backoff(2), Some(Duration::ZERO));

        for expected in [1u64, 2, 4] {
            assert!(f.mock.complete_next(&[]));
            f.device.handle_events(Duration::ZERO).unwrap();
            assert_eq!(f.device.input_backoff(2), Some(Duration::from_millis(expected)));
            assert_eq!(f.mock.pending_urbs(), 0);

            f.device.handle_events(RESUBMIT_WAIT).unwrap();
            assert_eq!(f.mock.pending_urbs(), 1);
        }
    }

    #[test]
    fn test_resubmission_keeps_interrupt_quirk() {
        let mut f = fixture();
        f.mock.state().reject_interrupt_urbs = true;
        arm(&mut f, 1);
        assert_eq!(
            f.mock.state().submissions,
            vec![(URB_TYPE_INTERRUPT, 0x81), (URB_TYPE_BULK, 0x81)]
        );

        assert!(f.mock.complete_next(&[1]));
        f.device.handle_events(Duration::ZERO).unwrap();
        f.device.handle_events(RESUBMIT_WAIT).unwrap();

        assert_eq!(f.mock.state().submissions.len(), 3);
        assert_eq!(f.mock.state().submissions[2], (URB_TYPE_BULK, 0x81));
        assert!(f.device.is_monitoring(1));
    }
}

mod callbacks {
    use super::*;

    #[test]
    fn test_callback_receives_blocks_instead_of_buffer() {
        let mut f = fixture();
        let blocks = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&blocks);
        f.device
            .monitor_input_endpoint(1, move |notice: &InputNotice<'_>| {
                seen.borrow_mut().push((notice.endpoint, notice.data.to_vec()));
                true
            })
            .unwrap();
        assert!(f.device.is_monitoring(1));

        assert!(f.mock.complete_next(&[0x10, 0x20]));
        f.device.handle_events(Duration::ZERO).unwrap();
        f.device.handle_events(RESUBMIT_WAIT).unwrap();
        assert!(f.mock.complete_next(&[0x30]));
        f.device.handle_events(Duration::ZERO).unwrap();

        assert_eq!(
            *blocks.borrow(),
            vec![(0x81, vec![0x10, 0x20]), (0x81, vec![0x30])]
        );
        let mut buffer = [0u8; 8];
        assert!(matches!(
            f.device.read_endpoint(1, &mut buffer, Duration::ZERO),
            Err(UsbError::NoData)
        ));
    }

    #[test]
    fn test_callback_returning_false_unregisters() {
        let mut f = fixture();
        let calls = Rc::new(RefCell::new(0usize));
        let counter = Rc::clone(&calls);
        f.device
            .monitor_input_endpoint(1, move |_: &InputNotice<'_>| {
                *counter.borrow_mut() += 1;
                false
            })
            .unwrap();

        assert!(f.mock.complete_next(&[1]));
        f.device.handle_events(Duration::ZERO).unwrap();
        f.device.handle_events(RESUBMIT_WAIT).unwrap();
        assert!(f.mock.complete_next(&[2, 3]));
        f.device.handle_events(Duration::ZERO).unwrap();

        assert_eq!(*calls.borrow(), 1);
        assert!(f.device.is_monitoring(1));
        let mut buffer = [0u8; 8];
        assert_eq!(f.device.read_endpoint(1, &mut buffer, Duration::ZERO).unwrap(), 2);
        assert_eq!(&buffer[..2], &[2, 3]);
    }
}

mod faults {
    use super::*;

    #[test]
    fn test_transfer_error_stops_only_that_endpoint() {
        let mut f = fixture_with(TransportSettings::default());
        f.device
            .define_endpoint(EndpointDescriptor::input(1, EndpointTransfer::Bulk, 64, 0));
        f.device
            .define_endpoint(EndpointDescriptor::input(3, EndpointTransfer::Bulk, 64, 0));
        arm(&mut f, 1);
        arm(&mut f, 3);

        assert_eq!(f.mock.next_pending_endpoint(), Some(0x81));
        assert!(f.mock.complete_next_with_status(Errno::EPIPE));
        f.device.handle_events(Duration::ZERO).unwrap();

        assert!(!f.device.is_monitoring(1));
        assert!(f.device.is_monitoring(3));

        let mut buffer = [0u8; 8];
        assert!(matches!(
            f.device.read_endpoint(1, &mut buffer, Duration::ZERO),
            Err(UsbError::DeviceError { errno: Errno::EPIPE, .. })
        ));
        // reported once, then plain bulk reads
        assert!(matches!(
            f.device.read_endpoint(1, &mut buffer, Duration::ZERO),
            Err(UsbError::NoData)
        ));

        assert!(f.mock.complete_next(&[0x55]));
        assert_eq!(
            f.device
                .read_endpoint(3, &mut buffer, Duration::from_millis(50))
                .unwrap(),
            1
        );
        assert_eq!(buffer[0], 0x55);
    }

    #[test]
    fn test_unexpected_request_is_a_fault() {
        let mut f = fixture();
        arm(&mut f, 1);

        let request = f.device.allocate_request(0x81, None, 8, 7).unwrap();
        let id = f.device.submit_request(request).unwrap();
        assert_eq!(f.mock.pending_urbs(), 2);

        assert!(f.mock.complete_last(&[0x01]));
        f.device.handle_events(Duration::ZERO).unwrap();

        assert!(!f.device.is_monitoring(1));
        // the monitor's own request was cancelled on the way out
        assert_eq!(f.mock.state().discards, 1);
        assert_eq!(f.mock.pending_urbs(), 0);

        let mut buffer = [0u8; 8];
        assert!(matches!(
            f.device.read_endpoint(1, &mut buffer, Duration::ZERO),
            Err(UsbError::DeviceError { errno: Errno::EIO, .. })
        ));

        // the driver's own completed request is still there to reap
        let response = f.device.reap_response(0x81, false).unwrap().unwrap();
        assert_eq!(response.id(), id);
        assert_eq!(response.data(), &[0x01]);
    }

    #[test]
    fn test_failed_resubmission_stops_monitor() {
        let mut f = fixture();
        arm(&mut f, 1);
        assert!(f.mock.complete_next(&[0x09]));
        f.device.handle_events(Duration::ZERO).unwrap();

        f.mock.state().fail_next_submit = Some(Errno::EPIPE);
        f.device.handle_events(RESUBMIT_WAIT).unwrap();
        assert!(!f.device.is_monitoring(1));

        // buffered input is still served before the fault
        let mut buffer = [0u8; 8];
        assert_eq!(f.device.read_endpoint(1, &mut buffer, Duration::ZERO).unwrap(), 1);
        assert!(matches!(
            f.device.read_endpoint(1, &mut buffer, Duration::ZERO),
            Err(UsbError::DeviceError { errno: Errno::EPIPE, .. })
        ));
    }

    #[test]
    fn test_completion_slots_exhausted() {
        let mut f = fixture_with(TransportSettings {
            completion_slots: 1,
            ..TransportSettings::default()
        });
        f.device
            .define_endpoint(EndpointDescriptor::input(1, EndpointTransfer::Bulk, 64, 0));
        f.device
            .define_endpoint(EndpointDescriptor::input(2, EndpointTransfer::Bulk, 64, 0));

        arm(&mut f, 1);
        arm(&mut f, 2);
        assert!(f.device.is_monitoring(1));
        assert!(!f.device.is_monitoring(2));
        assert!(matches!(
            f.device.monitor_input_endpoint(2, |_: &InputNotice<'_>| true),
            Err(UsbError::NotSupported(_))
        ));
    }

    #[test]
    fn test_drop_cancels_monitor_and_closes_node() {
        let mut f = fixture();
        arm(&mut f, 1);
        assert_eq!(f.mock.pending_urbs(), 1);

        drop(f.device);
        assert_eq!(f.mock.state().discards, 1);
        assert_eq!(f.mock.state().closed, 1);
        assert_eq!(f.mock.pending_urbs(), 0);
    }
}
