//! Check-In liveness counter.
//!
//! A low-power device proves liveness by presenting a persisted,
//! strictly-advancing 32-bit counter. Receivers accept only values
//! above their last-seen high-water mark, which makes replay of a
//! captured check-in useless, provided the counter genuinely never
//! moves backward and never repeats early.
//!
//! Two properties carry the scheme:
//!
//! - The initial value is drawn from a secure random source, never 0
//!   or a fixed constant, so an observer cannot fingerprint boot count
//!   or predict the next value of a fresh device.
//! - After a key rotation, [`CheckInCounter::invalidate_half`] or
//!   [`CheckInCounter::invalidate_all`] jumps the counter far enough
//!   that any previously captured value can never be accepted as
//!   fresh, without the receiver tracking anything beyond its
//!   high-water mark.
//!
//! Wraparound via unsigned overflow is intentional and expected at
//! end of life; all arithmetic here wraps and must never saturate.

use crate::error::Result;
use crate::platform::StateStore;

/// Storage key for the persisted counter value
const STORE_KEY: &str = "icd/check-in-counter";

/// Persisted monotonic liveness counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckInCounter {
    value: u32,
}

impl CheckInCounter {
    /// Load the persisted counter, seeding a fresh one from `rng` on
    /// first boot. The seed is re-drawn until non-zero.
    pub fn load_or_init(store: &mut dyn StateStore, rng: &mut dyn rand::RngCore) -> Result<Self> {
        if let Some(bytes) = store.load(STORE_KEY)? {
            if bytes.len() == 4 {
                let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                return Ok(Self { value });
            }
            tracing::warn!("Persisted check-in counter has wrong size; reseeding");
        }

        let mut value = 0u32;
        while value == 0 {
            value = rng.next_u32();
        }
        let counter = Self { value };
        counter.persist(store)?;
        Ok(counter)
    }

    /// Current persisted value
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Value the next check-in message will carry. Does not mutate
    /// stored state: callers persist via [`CheckInCounter::advance`]
    /// once the message is actually sent.
    pub fn next(&self) -> u32 {
        self.value.wrapping_add(1)
    }

    /// Commit the value returned by [`CheckInCounter::next`]: advance
    /// by one and persist.
    pub fn advance(&mut self, store: &mut dyn StateStore) -> Result<u32> {
        self.value = self.value.wrapping_add(1);
        self.persist(store)?;
        Ok(self.value)
    }

    /// Advance the counter by half the 32-bit range.
    ///
    /// Used after key rotation: every counter value issued before the
    /// jump is left behind the receiver's high-water mark.
    pub fn invalidate_half(&mut self, store: &mut dyn StateStore) -> Result<()> {
        self.value = self.value.wrapping_add(u32::MAX / 2);
        self.persist(store)
    }

    /// Advance the counter by the full 32-bit range (effectively
    /// N → N−1 after wraparound).
    pub fn invalidate_all(&mut self, store: &mut dyn StateStore) -> Result<()> {
        self.value = self.value.wrapping_add(u32::MAX);
        self.persist(store)
    }

    fn persist(&self, store: &mut dyn StateStore) -> Result<()> {
        store.store(STORE_KEY, &self.value.to_le_bytes())
    }
}
