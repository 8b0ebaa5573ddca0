//! End-to-end duty-cycle and liveness tests.
//!
//! Exercises the ICD mode state machine through the stack API and
//! verifies that the two persisted values (the Check-In counter and
//! the ICD class) survive a simulated power cycle.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use d2d::icd::SIT_SLOW_POLL_CEILING;
use d2d::platform::{MemoryStore, StateStore};
use d2d::reporting::AttributePath;
use d2d::{
    Config, CoreStack, IcdClass, MessageFlags, MessageHeader, OperationalMode, PeerId,
    ProtocolId, ReportSink,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

struct NullSink;

impl ReportSink for NullSink {
    fn attribute_dirty(&mut self, _path: &AttributePath) -> Result<(), String> {
        Ok(())
    }
}

/// Store handle that survives stack teardown, simulating flash.
#[derive(Clone, Default)]
struct SharedStore(Rc<RefCell<MemoryStore>>);

impl StateStore for SharedStore {
    fn load(&self, key: &str) -> d2d::Result<Option<Vec<u8>>> {
        self.0.borrow().load(key)
    }

    fn store(&mut self, key: &str, value: &[u8]) -> d2d::Result<()> {
        self.0.borrow_mut().store(key, value)
    }

    fn remove(&mut self, key: &str) -> d2d::Result<()> {
        self.0.borrow_mut().remove(key)
    }
}

fn make_stack(config: &Config, store: SharedStore, seed: u64) -> CoreStack {
    CoreStack::with_rng(
        config,
        Box::new(NullSink),
        Box::new(store),
        Instant::now(),
        &mut ChaCha8Rng::seed_from_u64(seed),
    )
    .unwrap()
}

/// Idle → Active on an inbound message, back to Idle after the
/// active-duration timer, with the poll interval tracking the mode.
#[test]
fn test_duty_cycle_follows_traffic() {
    let config = Config::default();
    let mut stack = make_stack(&config, SharedStore::default(), 1);

    assert_eq!(stack.operational_mode(), OperationalMode::Idle);
    let slow = stack.poll_interval();
    assert_eq!(slow, SIT_SLOW_POLL_CEILING);

    // Inbound datagram wakes the device
    let mut header = MessageHeader::new(0, ProtocolId::INTERACTION_MODEL, 0x01, 1, 1);
    header.flags.set(MessageFlags::INITIATOR);
    stack
        .on_datagram(PeerId::new(0x42, 0), &header.to_bytes())
        .unwrap();
    assert_eq!(stack.operational_mode(), OperationalMode::Active);
    assert!(stack.poll_interval() < slow);

    // Quiet for longer than the active-mode duration: back to Idle
    stack.advance(Duration::from_secs(5));
    assert_eq!(stack.operational_mode(), OperationalMode::Idle);
    assert_eq!(stack.poll_interval(), slow);
}

/// A stay-active request holds the device in Active mode as long as it
/// keeps being renewed.
#[test]
fn test_stay_active_renewal() {
    let config = Config::default();
    let mut stack = make_stack(&config, SharedStore::default(), 1);

    for _ in 0..5 {
        stack.request_stay_active();
        stack.advance(Duration::from_millis(800));
        assert_eq!(stack.operational_mode(), OperationalMode::Active);
    }

    stack.advance(Duration::from_secs(2));
    assert_eq!(stack.operational_mode(), OperationalMode::Idle);
}

/// LIT devices poll as slowly as configured; SIT devices are capped.
#[test]
fn test_class_selects_slow_poll_threshold() {
    let mut config = Config::default();
    config.icd.slow_poll_interval_ms = 300_000;

    config.icd.class = IcdClass::Sit;
    let sit = make_stack(&config, SharedStore::default(), 1);
    assert_eq!(sit.poll_interval(), SIT_SLOW_POLL_CEILING);

    config.icd.class = IcdClass::Lit;
    let lit = make_stack(&config, SharedStore::default(), 2);
    assert_eq!(lit.poll_interval(), Duration::from_secs(300));
}

/// The ICD class persists across a power cycle.
#[test]
fn test_icd_class_survives_reboot() -> anyhow::Result<()> {
    let store = SharedStore::default();
    let config = Config::default();
    {
        let mut stack = make_stack(&config, store.clone(), 1);
        assert_eq!(stack.icd_class(), IcdClass::Sit);
        stack.set_icd_class(IcdClass::Lit)?;
    }

    let rebooted = make_stack(&config, store, 2);
    assert_eq!(rebooted.icd_class(), IcdClass::Lit);
    Ok(())
}

/// The Check-In counter persists, only moves forward, and key-rotation
/// invalidation leaves every previously issued value behind.
#[test]
fn test_check_in_counter_survives_reboot() -> anyhow::Result<()> {
    let store = SharedStore::default();
    let config = Config::default();

    let committed = {
        let mut stack = make_stack(&config, store.clone(), 1);
        let first = stack.next_check_in_counter();
        assert_eq!(stack.commit_check_in()?, first);
        assert_eq!(stack.commit_check_in()?, first.wrapping_add(1));
        first.wrapping_add(1)
    };

    // Reboot: the seed RNG differs but the persisted value wins
    let mut stack = make_stack(&config, store.clone(), 99);
    assert_eq!(stack.next_check_in_counter(), committed.wrapping_add(1));

    // Key rotation: the persisted value jumps half the range, leaving
    // every previously issued counter behind a strictly-increasing
    // receiver's high-water mark
    stack.invalidate_check_in_half()?;
    assert_eq!(
        stack.next_check_in_counter(),
        committed.wrapping_add(u32::MAX / 2).wrapping_add(1)
    );

    // And the jump itself persists
    drop(stack);
    let rebooted = make_stack(&config, store, 7);
    assert_eq!(
        rebooted.next_check_in_counter(),
        committed.wrapping_add(u32::MAX / 2).wrapping_add(1)
    );
    Ok(())
}
