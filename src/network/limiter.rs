//! Per-address credit rate limiter
//!
//! Every admitted datagram adds one credit to its sender. At the same time
//! one credit is taken from whichever other address currently holds the
//! most, so state stays bounded by the number of active senders and quiet
//! senders recover as busy ones are heard from.

use std::collections::HashMap;

/// Credits an address may accumulate before it is throttled
pub const DEFAULT_RATE_LIMIT: u32 = 2048;

/// Heartbeat decay divisor applied to known peers' credits
pub const DECAY_FACTOR: f64 = 1.05;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    credits: HashMap<String, f64>,
    cap: f64,
}

impl RateLimiter {
    pub fn new(cap: u32) -> Self {
        Self {
            credits: HashMap::new(),
            cap: f64::from(cap),
        }
    }

    /// Account for one datagram from `address`.
    ///
    /// Once the sender is at the cap, `admit_anyway` decides; it is not
    /// consulted below the cap.
    pub fn admit<F>(&mut self, address: &str, admit_anyway: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let current = self.credit(address);
        if current >= self.cap && !admit_anyway() {
            log::trace!("Rate limited {} at {:.0} credits", address, current);
            return false;
        }

        *self.credits.entry(address.to_string()).or_insert(0.0) += 1.0;
        self.transfer_from_highest(address);
        true
    }

    /// Divide the credit of `address` by `factor`
    pub fn decay(&mut self, address: &str, factor: f64) {
        if let Some(credit) = self.credits.get_mut(address) {
            *credit /= factor;
        }
    }

    pub fn credit(&self, address: &str) -> f64 {
        self.credits.get(address).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.credits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credits.is_empty()
    }

    fn transfer_from_highest(&mut self, address: &str) {
        let highest = self
            .credits
            .iter()
            .filter(|(other, _)| other.as_str() != address)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(other, _)| other.clone());

        if let Some(other) = highest {
            if let Some(credit) = self.credits.get_mut(&other) {
                *credit -= 1.0;
                if *credit <= 0.0 {
                    self.credits.remove(&other);
                }
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT)
    }
}
