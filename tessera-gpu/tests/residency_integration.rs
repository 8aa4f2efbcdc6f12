//! Integration tests for residency, eviction and restoration.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::MockBackend;
use tessera_core::{BlockId, GpuError, ResidencyConfig, ResidencyState};
use tessera_gpu::ResidencyManager;

fn manager(budget: u64, backend: Arc<MockBackend>) -> ResidencyManager {
    let config = ResidencyConfig {
        max_memory_bytes: budget,
        ..ResidencyConfig::default()
    };
    ResidencyManager::new(config, backend)
}

#[test]
fn test_old_low_priority_block_evicted_first() {
    let mock = MockBackend::new();
    let mgr = manager(100, mock.clone());
    mgr.register_memory_block("A", 45, "general", 0).unwrap();
    thread::sleep(Duration::from_millis(20));
    mgr.register_memory_block("B", 50, "general", 10).unwrap();
    assert_eq!(mgr.resident_bytes(), 95);

    let freed = mgr.evict_memory(Some(10));
    assert_eq!(freed, 45);
    assert_eq!(mgr.block_state("A"), Some(ResidencyState::Evicted));
    assert_eq!(mgr.block_state("B"), Some(ResidencyState::Resident));
    assert_eq!(mock.evicted.lock().as_slice(), &[BlockId::from("A")]);
}

#[test]
fn test_default_eviction_never_crosses_floor_or_touches_evicted() {
    let mock = MockBackend::new();
    let mgr = manager(1000, mock.clone());
    for i in 0..10 {
        mgr.register_memory_block(format!("b{i}"), 95, "general", 0).unwrap();
    }
    assert_eq!(mgr.resident_bytes(), 950);
    assert_eq!(mgr.evict_memory(Some(1)), 95);
    let first = mock.evicted.lock()[0].clone();

    let freed = mgr.evict_memory(None);
    assert!(freed > 0);
    assert!(mgr.resident_bytes() >= 700);
    assert!(mgr.resident_bytes() <= 800);

    let evicted = mock.evicted.lock();
    assert_eq!(evicted.iter().filter(|id| **id == first).count(), 1);

    // At or below the floor the default policy does nothing.
    drop(evicted);
    mgr.evict_memory(Some(mgr.resident_bytes() - 650));
    assert_eq!(mgr.evict_memory(None), 0);
}

#[test]
fn test_evict_hook_failure_keeps_block_resident() {
    let mock = MockBackend::new();
    let mgr = manager(100, mock.clone());
    mgr.register_memory_block("a", 60, "general", 0).unwrap();
    MockBackend::set(&mock.fail_evict, true);
    assert_eq!(mgr.evict_memory(Some(10)), 0);
    assert_eq!(mgr.block_state("a"), Some(ResidencyState::Resident));
    assert_eq!(mgr.get_memory_stats().evictions, 0);
}

#[test]
fn test_restore_failure_rolls_back_victims() {
    let mock = MockBackend::new();
    let mgr = manager(100, mock.clone());
    mgr.register_memory_block("big", 80, "general", 0).unwrap();
    mgr.evict_memory(Some(80));
    mgr.register_memory_block("v1", 40, "general", 0).unwrap();
    mgr.register_memory_block("v2", 40, "general", 0).unwrap();

    MockBackend::set(&mock.fail_restore, true);
    let err = mgr.restore_memory("big").unwrap_err();
    assert!(matches!(err, GpuError::Backend(_)));

    assert_eq!(mgr.block_state("big"), Some(ResidencyState::Evicted));
    assert_eq!(mgr.block_state("v1"), Some(ResidencyState::Resident));
    assert_eq!(mgr.block_state("v2"), Some(ResidencyState::Resident));
    assert_eq!(mgr.resident_bytes(), 80);
}

#[test]
fn test_restore_success_stays_within_budget() {
    let mock = MockBackend::new();
    let mgr = manager(100, mock.clone());
    mgr.register_memory_block("big", 80, "general", 0).unwrap();
    mgr.evict_memory(Some(80));
    mgr.register_memory_block("v1", 40, "general", 0).unwrap();
    mgr.register_memory_block("v2", 40, "general", 5).unwrap();

    mgr.restore_memory("big").unwrap();
    assert_eq!(mgr.block_state("big"), Some(ResidencyState::Resident));
    assert_eq!(mgr.block_state("v1"), Some(ResidencyState::Evicted));
    assert_eq!(mgr.block_state("v2"), Some(ResidencyState::Evicted));
    assert!(mgr.resident_bytes() <= 100);
    assert_eq!(mock.restored.lock().as_slice(), &[BlockId::from("big")]);

    let stats = mgr.get_memory_stats();
    assert_eq!(stats.restorations, 1);
    assert_eq!(stats.peak_memory_usage, 80);
}

#[test]
fn test_mark_accessed_protects_block() {
    let mock = MockBackend::new();
    let mgr = manager(100, mock);
    mgr.register_memory_block("cold", 10, "general", 0).unwrap();
    mgr.register_memory_block("hot", 10, "general", 0).unwrap();
    assert!(mgr.mark_accessed("hot"));
    assert_eq!(mgr.block("hot").unwrap().access_count, 1);

    mgr.evict_memory(Some(10));
    assert_eq!(mgr.block_state("cold"), Some(ResidencyState::Evicted));
    assert_eq!(mgr.block_state("hot"), Some(ResidencyState::Resident));
}

#[test]
fn test_explicit_target_frees_in_score_order_past_floor() {
    let mock = MockBackend::new();
    let mgr = manager(1000, mock.clone());
    for (id, priority) in [("p3", 3), ("p0", 0), ("p2", 2), ("p1", 1)] {
        mgr.register_memory_block(id, 200, "general", priority).unwrap();
    }

    let freed = mgr.evict_memory(Some(300));
    assert!(freed >= 300);
    assert_eq!(freed, 400);
    assert_eq!(mock.evicted.lock().as_slice(), &[BlockId::from("p0"), BlockId::from("p1")]);

    // An explicit target may go below the default floor.
    assert_eq!(mgr.resident_bytes(), 400);
    assert!(mgr.resident_bytes() < mgr.config().floor_bytes());
}
