//! Cross-thread tests for sync points and barrier batching.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::MockBackend;
use tessera_core::{BarrierType, CommandBufferRef, GpuError};
use tessera_gpu::SyncManager;

#[test]
fn test_waiter_wakes_on_signal_from_other_thread() {
    let sync = Arc::new(SyncManager::new(MockBackend::new()));
    let fence = sync.create_fence(Some(CommandBufferRef(3)));

    let waiter = {
        let sync = sync.clone();
        thread::spawn(move || sync.wait_for_sync_point(fence, Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(20));
    sync.signal_sync_point(fence).unwrap();

    assert!(waiter.join().unwrap().unwrap());
    let stats = sync.get_sync_stats();
    assert_eq!(stats.wait_timeouts, 0);
    assert_eq!(stats.signaled_sync_points, 1);
}

#[test]
fn test_destroy_while_waiting_reports_unknown_point() {
    let sync = Arc::new(SyncManager::new(MockBackend::new()));
    let event = sync.create_event(None);

    let waiter = {
        let sync = sync.clone();
        thread::spawn(move || sync.wait_for_sync_point(event, Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(sync.destroy_sync_point(event));

    match waiter.join().unwrap() {
        Err(GpuError::UnknownSyncPoint(id)) => assert_eq!(id, event),
        other => panic!("expected UnknownSyncPoint, got {other:?}"),
    }
}

#[test]
fn test_reset_makes_wait_time_out_again() {
    let sync = SyncManager::new(MockBackend::new());
    let semaphore = sync.create_semaphore();
    sync.signal_sync_point(semaphore).unwrap();
    assert!(sync.wait_for_sync_point(semaphore, Duration::ZERO).unwrap());

    sync.reset_sync_point(semaphore).unwrap();
    assert!(!sync.wait_for_sync_point(semaphore, Duration::from_millis(10)).unwrap());
    assert_eq!(sync.get_sync_stats().wait_timeouts, 1);
}

#[test]
fn test_barriers_flush_as_one_batch_in_issue_order() {
    let mock = MockBackend::new();
    let sync = SyncManager::new(mock.clone());
    sync.issue_barrier(BarrierType::All, Some(CommandBufferRef(1)));
    sync.issue_barrier(BarrierType::Read, None);
    sync.issue_barrier(BarrierType::ReadWrite, Some(CommandBufferRef(2)));

    assert_eq!(sync.flush_barriers().unwrap(), 3);
    assert_eq!(sync.flush_barriers().unwrap(), 0);
    assert_eq!(
        mock.barrier_batches.lock().as_slice(),
        &[vec![BarrierType::All, BarrierType::Read, BarrierType::ReadWrite]]
    );
    let stats = sync.get_sync_stats();
    assert_eq!(stats.barriers_issued, 3);
    assert_eq!(stats.barriers_flushed, 3);
    assert_eq!(stats.pending_barriers, 0);
}

#[test]
fn test_immediate_barrier_failure_is_not_counted() {
    let mock = MockBackend::new();
    let sync = SyncManager::new(mock.clone());
    MockBackend::set(&mock.fail_barriers, true);
    assert!(sync.insert_memory_barrier(BarrierType::Write, None).is_err());
    assert_eq!(sync.get_sync_stats().memory_barriers, 0);

    MockBackend::set(&mock.fail_barriers, false);
    sync.insert_memory_barrier(BarrierType::Write, None).unwrap();
    assert_eq!(sync.get_sync_stats().memory_barriers, 1);
    assert!(sync.pending_barriers().is_empty());
}

#[test]
fn test_unbounded_timeout_on_signaled_point_returns_at_once() {
    let sync = SyncManager::new(MockBackend::new());
    let fence = sync.create_fence(None);
    sync.signal_sync_point(fence).unwrap();
    assert!(sync.wait_for_sync_point(fence, Duration::MAX).unwrap());
}

#[test]
fn test_unbounded_timeout_waits_for_signal() {
    let sync = Arc::new(SyncManager::new(MockBackend::new()));
    let fence = sync.create_fence(None);

    let waiter = {
        let sync = sync.clone();
        thread::spawn(move || sync.wait_for_sync_point(fence, Duration::MAX))
    };
    thread::sleep(Duration::from_millis(20));
    sync.signal_sync_point(fence).unwrap();
    assert!(waiter.join().unwrap().unwrap());
    assert_eq!(sync.get_sync_stats().wait_timeouts, 0);
}
