//! Channel Integration Tests
//!
//! Tests for the plumbing between the USB threads and the Tokio runtime.
//!
//! # Test Scenarios
//! - Start/exit handshake across threads
//! - Completion rendezvous fed from another thread
//! - Driver events crossing into async code
//! - Event channel backpressure
//!
//! Run with: `cargo test -p common --test channel_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::{DriverEvent, ReadySignal, WaitError, completion_slot, create_event_bridge};
use protocol::{DeviceAddress, DeviceSpeed, ReportDescriptorKind};
use std::thread;
use std::time::Duration;

// ============================================================================
// ReadySignal Tests
// ============================================================================

#[test]
fn test_ready_signal_handshake_between_threads() {
    let daemon_ready = ReadySignal::new();
    let driver_done = ReadySignal::new();

    let ready = daemon_ready.clone();
    let done = driver_done.clone();
    let driver = thread::spawn(move || {
        ready.take();
        done.give();
    });

    daemon_ready.give();
    assert!(driver_done.take_timeout(DEFAULT_TEST_TIMEOUT));
    driver.join().expect("Driver thread panicked");
}

#[test]
fn test_ready_signal_take_times_out_without_token() {
    let signal = ReadySignal::new();
    assert!(!signal.take_timeout(Duration::from_millis(20)));
}

#[test]
fn test_ready_signal_tokens_survive_until_taken() {
    let signal = ReadySignal::default();
    signal.give();
    thread::sleep(Duration::from_millis(5));
    assert!(signal.take_timeout(Duration::from_millis(10)));
}

// ============================================================================
// Completion Slot Tests
// ============================================================================

#[test]
fn test_completion_from_other_thread() {
    let (tx, rx) = completion_slot::<Vec<u8>>();

    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        tx.complete(vec![0x01, 0x02]).expect("Slot should be empty");
    });

    assert_eq!(rx.wait(DEFAULT_TEST_TIMEOUT), Ok(vec![0x01, 0x02]));
    handle.join().expect("Completer thread panicked");
}

#[test]
fn test_completion_slot_hands_back_second_value() {
    let (tx, rx) = completion_slot::<u8>();
    let other = tx.clone();

    assert_eq!(tx.complete(1), Ok(()));
    assert_eq!(other.complete(2), Err(2));

    assert_eq!(rx.try_take(), Some(1));
    assert_eq!(other.complete(3), Ok(()));
    assert_eq!(rx.try_take(), Some(3));
}

#[test]
fn test_completion_wait_times_out() {
    let (_tx, rx) = completion_slot::<u8>();
    assert_eq!(rx.wait(Duration::from_millis(10)), Err(WaitError::Timeout));
    assert_eq!(rx.try_take(), None);
}

#[test]
fn test_completion_sender_after_receiver_dropped() {
    let (tx, rx) = completion_slot::<u8>();
    drop(rx);
    assert_eq!(tx.complete(7), Err(7));
}

// ============================================================================
// Event Bridge Tests
// ============================================================================

#[tokio::test]
async fn test_event_order_preserved() {
    let (publisher, subscriber) = create_event_bridge(16);

    let handle = thread::spawn(move || {
        publisher.publish(DriverEvent::DeviceOpened {
            address: DeviceAddress(1),
            vendor_id: 0x046d,
            product_id: 0xc216,
            speed: DeviceSpeed::Full,
            manufacturer: None,
            product: Some("Gamepad".to_string()),
            serial_number: None,
        });
        publisher.publish(DriverEvent::ReportDescriptor {
            interface: 0,
            descriptor: vec![0x05, 0x01, 0x09, 0x05],
            kind: ReportDescriptorKind::Gamepad,
        });
        publisher.publish(DriverEvent::DeviceClosed {
            address: DeviceAddress(1),
        });
    });

    let first = with_timeout(DEFAULT_TEST_TIMEOUT, subscriber.recv())
        .await
        .expect("Timed out")
        .expect("Channel closed");
    assert!(matches!(first, DriverEvent::DeviceOpened { .. }));

    let second = with_timeout(DEFAULT_TEST_TIMEOUT, subscriber.recv())
        .await
        .expect("Timed out")
        .expect("Channel closed");
    assert!(matches!(
        second,
        DriverEvent::ReportDescriptor {
            kind: ReportDescriptorKind::Gamepad,
            ..
        }
    ));

    let third = with_timeout(DEFAULT_TEST_TIMEOUT, subscriber.recv())
        .await
        .expect("Timed out")
        .expect("Channel closed");
    assert_eq!(
        third,
        DriverEvent::DeviceClosed {
            address: DeviceAddress(1)
        }
    );

    handle.join().expect("Publisher thread panicked");
}

#[tokio::test]
async fn test_full_channel_drops_new_events() {
    let (publisher, subscriber) = create_event_bridge(2);

    for seq in 0..4u8 {
        publisher.publish(DriverEvent::InputReport {
            endpoint: 0x81,
            data: vec![seq],
        });
    }

    let mut received = Vec::new();
    while let Some(event) = subscriber.try_recv() {
        received.push(event);
    }
    assert_eq!(
        received,
        vec![
            DriverEvent::InputReport {
                endpoint: 0x81,
                data: vec![0]
            },
            DriverEvent::InputReport {
                endpoint: 0x81,
                data: vec![1]
            },
        ]
    );
}

#[tokio::test]
async fn test_recv_errors_after_publisher_dropped() {
    let (publisher, subscriber) = create_event_bridge(4);
    drop(publisher);

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, subscriber.recv())
        .await
        .expect("Timed out");
    assert!(matches!(result, Err(common::Error::Channel(_))));
}

#[test]
fn test_publish_without_subscriber_is_silent() {
    let (publisher, subscriber) = create_event_bridge(1);
    drop(subscriber);
    publisher.publish(DriverEvent::DeviceClosed {
        address: DeviceAddress(3),
    });
}
