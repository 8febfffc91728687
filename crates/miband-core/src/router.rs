//! Routing of unsolicited notifications.
//!
//! The router runs inside the link's notification callback. It matches the
//! notification handle against the activity value handle, decodes matching
//! payloads, and posts a [`Wakeup`] to the waiting session over a bounded
//! channel. It never touches the radio.

use std::sync::Arc;

use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use miband_types::{ActivitySample, CharacteristicHandle, DecodeError};

use crate::link::NotificationCallback;

/// Default capacity of the wakeup channel.
pub const DEFAULT_WAKEUP_CAPACITY: usize = 16;

/// Which notifications wake a waiting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakePolicy {
    /// Any notification wakes the session, even on an unrelated handle.
    ///
    /// A stray notification can end the wait before activity data arrived.
    #[default]
    AnyNotification,
    /// Only notifications on the activity value handle wake the session.
    MatchedHandle,
}

/// Signal from the router to the session that data was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wakeup {
    /// Handle the notification arrived on.
    pub handle: CharacteristicHandle,
    /// The decoded sample, if the notification carried one.
    pub sample: Option<ActivitySample>,
}

/// Decode a notification if it arrived on the activity value handle.
///
/// Returns `Ok(None)` for any other handle. Deterministic and side-effect free.
pub fn decode_notification(
    handle: CharacteristicHandle,
    payload: &[u8],
    expected_value_handle: CharacteristicHandle,
    captured_at: OffsetDateTime,
) -> Result<Option<ActivitySample>, DecodeError> {
    if handle != expected_value_handle {
        return Ok(None);
    }
    ActivitySample::from_bytes(payload, captured_at).map(Some)
}

/// Routes notifications for one subscription to one waiting session.
#[derive(Debug, Clone)]
pub struct NotificationRouter {
    expected: CharacteristicHandle,
    policy: WakePolicy,
    wake_tx: mpsc::Sender<Wakeup>,
}

impl NotificationRouter {
    /// Create a router and the receiving end the session waits on.
    pub fn channel(
        expected: CharacteristicHandle,
        policy: WakePolicy,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Wakeup>) {
        let (wake_tx, wake_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                expected,
                policy,
                wake_tx,
            },
            wake_rx,
        )
    }

    /// The activity value handle this router matches.
    pub fn expected_handle(&self) -> CharacteristicHandle {
        self.expected
    }

    /// Route one notification, signal the session, and return the decoded
    /// sample if there was one.
    pub fn route(&self, handle: CharacteristicHandle, payload: &[u8]) -> Option<ActivitySample> {
        let matched = handle == self.expected;
        let sample =
            match decode_notification(handle, payload, self.expected, OffsetDateTime::now_utc()) {
                Ok(Some(sample)) => {
                    debug!(
                        "Activity notification on {}: steps={} distance={}m calories={}",
                        handle, sample.steps, sample.distance_m, sample.calories
                    );
                    Some(sample)
                }
                Ok(None) => {
                    debug!(
                        "Ignoring notification on {} ({} bytes), expected {}",
                        handle,
                        payload.len(),
                        self.expected
                    );
                    None
                }
                Err(e) => {
                    warn!("Failed to decode activity notification on {}: {}", handle, e);
                    None
                }
            };

        if matched || self.policy == WakePolicy::AnyNotification {
            self.wake(Wakeup { handle, sample });
        }

        sample
    }

    fn wake(&self, wakeup: Wakeup) {
        match self.wake_tx.try_send(wakeup) {
            Ok(()) => {}
            // A pending wakeup is already queued; the waiter will run.
            Err(TrySendError::Full(dropped)) => {
                debug!("Wakeup channel full, dropping wakeup for {}", dropped.handle);
            }
            // Nobody is waiting any more.
            Err(TrySendError::Closed(_)) => trace!("Wakeup receiver gone"),
        }
    }

    /// Wrap the router as a link notification callback.
    pub fn into_callback(self) -> NotificationCallback {
        Arc::new(move |handle: CharacteristicHandle, payload: Bytes| {
            self.route(handle, &payload);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALUE: CharacteristicHandle = CharacteristicHandle(71);

    fn payload(steps: u32, distance: u32, calories: u32) -> Vec<u8> {
        let mut data = vec![0x0C, 0, 0, 0];
        data.extend_from_slice(&steps.to_le_bytes());
        data.extend_from_slice(&distance.to_le_bytes());
        data.extend_from_slice(&calories.to_le_bytes());
        data
    }

    #[test]
    fn test_decode_notification_matching_handle() {
        let sample = decode_notification(
            VALUE,
            &payload(100, 80, 5),
            VALUE,
            OffsetDateTime::UNIX_EPOCH,
        )
        .unwrap()
        .unwrap();
        assert_eq!((sample.steps, sample.distance_m, sample.calories), (100, 80, 5));
    }

    #[test]
    fn test_decode_notification_other_handle() {
        let result = decode_notification(
            CharacteristicHandle(40),
            &payload(1, 1, 1),
            VALUE,
            OffsetDateTime::UNIX_EPOCH,
        );
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_route_matching_handle_wakes_with_sample() {
        let (router, mut rx) = NotificationRouter::channel(VALUE, WakePolicy::default(), 4);

        let sample = router.route(VALUE, &payload(5000, 3500, 210));

        assert_eq!(sample.map(|s| s.steps), Some(5000));
        let wakeup = rx.try_recv().unwrap();
        assert_eq!(wakeup.handle, VALUE);
        assert_eq!(wakeup.sample, sample);
    }

    #[test]
    fn test_route_malformed_wakes_without_sample() {
        let (router, mut rx) = NotificationRouter::channel(VALUE, WakePolicy::MatchedHandle, 4);

        assert!(router.route(VALUE, &[1, 2, 3]).is_none());

        let wakeup = rx.try_recv().unwrap();
        assert!(wakeup.sample.is_none());
    }

    #[test]
    fn test_route_unrelated_handle_wakes_by_default() {
        let (router, mut rx) = NotificationRouter::channel(VALUE, WakePolicy::AnyNotification, 4);

        assert!(router.route(CharacteristicHandle(12), &payload(1, 2, 3)).is_none());

        let wakeup = rx.try_recv().unwrap();
        assert_eq!(wakeup.handle, CharacteristicHandle(12));
        assert!(wakeup.sample.is_none());
    }

    #[test]
    fn test_route_unrelated_handle_ignored_when_matched_only() {
        let (router, mut rx) = NotificationRouter::channel(VALUE, WakePolicy::MatchedHandle, 4);

        router.route(CharacteristicHandle(12), &payload(1, 2, 3));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_route_full_channel_does_not_block() {
        let (router, mut rx) = NotificationRouter::channel(VALUE, WakePolicy::default(), 1);

        router.route(VALUE, &payload(1, 1, 1));
        router.route(VALUE, &payload(2, 2, 2));

        assert_eq!(rx.try_recv().unwrap().sample.map(|s| s.steps), Some(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_route_after_receiver_dropped() {
        let (router, rx) = NotificationRouter::channel(VALUE, WakePolicy::default(), 1);
        drop(rx);
        assert!(router.route(VALUE, &payload(9, 9, 9)).is_some());
    }

    #[test]
    fn test_callback_preserves_arrival_order() {
        let (router, mut rx) = NotificationRouter::channel(VALUE, WakePolicy::default(), 8);
        let callback = router.into_callback();

        callback(VALUE, Bytes::from(payload(1, 0, 0)));
        callback(CharacteristicHandle(3), Bytes::from_static(&[0xFF]));
        callback(VALUE, Bytes::from(payload(2, 0, 0)));

        let handles: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|w| (w.handle, w.sample.map(|s| s.steps)))
            .collect();
        assert_eq!(
            handles,
            vec![
                (VALUE, Some(1)),
                (CharacteristicHandle(3), None),
                (VALUE, Some(2)),
            ]
        );
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    const VALUE: CharacteristicHandle = CharacteristicHandle(71);

    proptest! {
        /// Every notification wakes the session; only a full payload on the
        /// value handle carries a sample.
        #[test]
        fn route_always_wakes(handle in 60u16..80, data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let (router, mut rx) = NotificationRouter::channel(VALUE, WakePolicy::AnyNotification, 4);
            let handle = CharacteristicHandle(handle);

            let sample = router.route(handle, &data);
            let wakeup = rx.try_recv().unwrap();

            prop_assert_eq!(wakeup.handle, handle);
            prop_assert_eq!(wakeup.sample, sample);
            prop_assert_eq!(sample.is_some(), handle == VALUE && data.len() >= 16);
        }

        /// With `MatchedHandle`, unrelated handles never wake the session.
        #[test]
        fn matched_policy_ignores_other_handles(handle in 60u16..80, data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let (router, mut rx) = NotificationRouter::channel(VALUE, WakePolicy::MatchedHandle, 4);
            let handle = CharacteristicHandle(handle);

            router.route(handle, &data);
            prop_assert_eq!(rx.try_recv().is_ok(), handle == VALUE);
        }
    }
}
