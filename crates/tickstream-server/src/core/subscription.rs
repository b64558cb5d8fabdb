//! Subscription state: exactly one per connection, immutable once set.

use std::sync::OnceLock;
use std::time::Instant;

use tickstream_proto::SubscriptionMode;

#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    pub mode: SubscriptionMode,
    pub created_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetSubscriptionError {
    /// A subscription already exists with the same mode.
    AlreadySubscribed,
    /// A subscription already exists with a different mode.
    ModeMismatch,
}

/// Write-once subscription slot. `set` is a compare-and-set against empty;
/// every call after the first fails, never changing the stored mode.
#[derive(Debug, Default)]
pub struct SubscriptionSlot(OnceLock<Subscription>);

impl SubscriptionSlot {
    pub fn new() -> Self {
        Self(OnceLock::new())
    }

    /// Attempts to bind `mode` to this slot. Non-blocking; safe to call from
    /// the hot read-loop path.
    pub fn set(
        &self,
        mode: SubscriptionMode,
    ) -> Result<(), SetSubscriptionError> {
        let subscription = Subscription { mode, created_at: Instant::now() };
        match self.0.set(subscription) {
            Ok(()) => Ok(()),
            Err(_) => {
                let existing = self.0.get().expect("set just failed, so a value exists");
                if subscription_modes_eq(existing.mode, mode) {
                    Err(SetSubscriptionError::AlreadySubscribed)
                } else {
                    Err(SetSubscriptionError::ModeMismatch)
                }
            }
        }
    }

    /// Returns the current subscription, if any. Non-blocking.
    pub fn get(&self) -> Option<Subscription> {
        self.0.get().copied()
    }
}

fn subscription_modes_eq(
    a: SubscriptionMode,
    b: SubscriptionMode,
) -> bool {
    matches!(
        (a, b),
        (SubscriptionMode::Second, SubscriptionMode::Second)
            | (SubscriptionMode::Minute, SubscriptionMode::Minute)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_set_succeeds() {
        let slot = SubscriptionSlot::new();
        assert!(slot.set(SubscriptionMode::Second).is_ok());
        assert!(matches!(slot.get().unwrap().mode, SubscriptionMode::Second));
    }

    #[test]
    fn second_set_same_mode_is_already_subscribed() {
        let slot = SubscriptionSlot::new();
        slot.set(SubscriptionMode::Second).unwrap();
        assert_eq!(
            slot.set(SubscriptionMode::Second).unwrap_err(),
            SetSubscriptionError::AlreadySubscribed
        );
    }

    #[test]
    fn second_set_different_mode_is_mode_mismatch() {
        let slot = SubscriptionSlot::new();
        slot.set(SubscriptionMode::Second).unwrap();
        assert_eq!(
            slot.set(SubscriptionMode::Minute).unwrap_err(),
            SetSubscriptionError::ModeMismatch
        );
    }
}
