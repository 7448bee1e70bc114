//! A status is only believed after it was seen [`CONFIRMATION_THRESHOLD`] polls in a row.
//! Any differing observation throws away the whole streak. No partial credit.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{Handle, ProbeStatus, ProfileDetails, CONFIRMATION_THRESHOLD};

/// What has been seen about a handle so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfirmation {
    /// Last status seen.
    pub observed_status: ProbeStatus,
    /// How many polls in a row returned `observed_status`.
    pub streak: u32,
    pub last_checked_at: DateTime<Utc>,
    /// Profile details from the latest poll, if the probe had any.
    pub details: Option<ProfileDetails>,
}

/// Result of [`ConfirmationTracker::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// `true` if the streak just reached the threshold. The record is gone by now.
    pub confirmed: bool,
    /// Streak length including this observation.
    pub streak: u32,
    /// Details carried by the record, handy for alerting on confirmation.
    pub details: Option<ProfileDetails>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfirmationTracker {
    pending: HashMap<Handle, PendingConfirmation>,
}

impl ConfirmationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tracker from previously saved records.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = (Handle, PendingConfirmation)>) -> Self {
        Self {
            pending: records.into_iter().collect(),
        }
    }

    /// Feed a new observation for `handle` at time `now`.
    pub fn update(
        &mut self,
        handle: &Handle,
        observed_status: ProbeStatus,
        details: Option<ProfileDetails>,
        now: DateTime<Utc>,
    ) -> Observation {
        let Some(record) = self.pending.get_mut(handle) else {
            self.pending.insert(
                handle.clone(),
                PendingConfirmation {
                    observed_status,
                    streak: 1,
                    last_checked_at: now,
                    details: details.clone(),
                },
            );
            return Observation {
                confirmed: false,
                streak: 1,
                details,
            };
        };

        record.last_checked_at = now;

        if record.observed_status != observed_status {
            // Details seen under the old status don't describe this one.
            record.observed_status = observed_status;
            record.streak = 1;
            record.details.clone_from(&details);
            return Observation {
                confirmed: false,
                streak: 1,
                details,
            };
        }

        if details.is_some() {
            record.details = details;
        }
        record.streak += 1;
        let streak = record.streak;

        if streak >= CONFIRMATION_THRESHOLD {
            // Start from scratch next time.
            let record = self.pending.remove(handle);
            return Observation {
                confirmed: true,
                streak,
                details: record.and_then(|r| r.details),
            };
        }

        Observation {
            confirmed: false,
            streak,
            details: record.details.clone(),
        }
    }

    /// Forget whatever was seen about `handle`. Returns `true` if there was something.
    pub fn clear(&mut self, handle: &Handle) -> bool {
        self.pending.remove(handle).is_some()
    }

    #[must_use]
    pub fn get(&self, handle: &Handle) -> Option<&PendingConfirmation> {
        self.pending.get(handle)
    }

    /// Drop records for handles `keep` says no longer matter.
    pub fn retain(&mut self, mut keep: impl FnMut(&Handle) -> bool) {
        self.pending.retain(|handle, _| keep(handle));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Handle, &PendingConfirmation)> {
        self.pending.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::Duration;

    use super::*;
    use ProbeStatus::*;

    fn feed(
        tracker: &mut ConfirmationTracker,
        handle: &Handle,
        statuses: &[ProbeStatus],
    ) -> Vec<(bool, u32)> {
        let start = Utc::now();
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let now = start + Duration::minutes(5 * i as i64);
                let o = tracker.update(handle, *status, None, now);
                (o.confirmed, o.streak)
            })
            .collect()
    }

    #[test]
    fn status_change_resets_streak() {
        let mut tracker = ConfirmationTracker::new();
        let alice = Handle::parse("alice").unwrap();

        let results = feed(&mut tracker, &alice, &[Active, Active, Banned, Banned, Banned]);
        assert_eq!(
            results,
            vec![(false, 1), (false, 2), (false, 1), (false, 2), (true, 3)]
        );
        // Confirmed records are deleted.
        assert!(tracker.get(&alice).is_none());
    }

    #[test]
    fn confirmation_starts_fresh() {
        let mut tracker = ConfirmationTracker::new();
        let bob = Handle::parse("bob").unwrap();

        let results = feed(&mut tracker, &bob, &[Banned, Banned, Banned, Banned, Banned, Banned]);
        assert_eq!(
            results,
            vec![(false, 1), (false, 2), (true, 3), (false, 1), (false, 2), (true, 3)]
        );
    }

    #[test]
    fn confirmed_iff_last_three_agree() {
        // Every sequence of length 5 over three statuses.
        let alphabet = [Active, Banned, Error];
        let mut tracker = ConfirmationTracker::new();
        let handle = Handle::parse("carol").unwrap();

        for n in 0..3usize.pow(5) {
            let mut rest = n;
            let sequence: Vec<ProbeStatus> = (0..5)
                .map(|_| {
                    let s = alphabet[rest % 3];
                    rest /= 3;
                    s
                })
                .collect();

            tracker.clear(&handle);
            let results = feed(&mut tracker, &handle, &sequence);

            // Walk it by hand: streak resets on change, and confirmation empties it.
            let mut streak = 0;
            let mut previous = None;
            for (i, status) in sequence.iter().enumerate() {
                if previous == Some(*status) {
                    streak += 1;
                } else {
                    streak = 1;
                }
                let confirmed = streak >= CONFIRMATION_THRESHOLD;
                assert_eq!(results[i], (confirmed, streak), "sequence {sequence:?} at {i}");
                previous = if confirmed { None } else { Some(*status) };
                if confirmed {
                    streak = 0;
                }
            }
        }
    }

    #[test]
    fn inactionable_statuses_still_count() {
        let mut tracker = ConfirmationTracker::new();
        let dave = Handle::parse("dave").unwrap();
        let results = feed(&mut tracker, &dave, &[Error, Error, Error]);
        assert_eq!(results.last(), Some(&(true, 3)));
    }

    #[test]
    fn records_keep_latest_details_and_time() {
        let mut tracker = ConfirmationTracker::new();
        let erin = Handle::parse("erin").unwrap();
        let t0 = Utc::now();
        let details = ProfileDetails {
            followers: 10,
            ..Default::default()
        };

        tracker.update(&erin, Banned, Some(details.clone()), t0);
        tracker.update(&erin, Banned, None, t0 + Duration::minutes(5));

        let record = tracker.get(&erin).unwrap();
        assert_eq!(record.streak, 2);
        assert_eq!(record.last_checked_at, t0 + Duration::minutes(5));
        assert_eq!(record.details, Some(details.clone()));

        let o = tracker.update(&erin, Banned, None, t0 + Duration::minutes(10));
        assert!(o.confirmed);
        assert_eq!(o.details, Some(details));
    }

    #[test]
    fn status_change_drops_old_details() {
        let mut tracker = ConfirmationTracker::new();
        let gina = Handle::parse("gina").unwrap();
        let t0 = Utc::now();
        let details = ProfileDetails {
            followers: 99,
            ..Default::default()
        };

        tracker.update(&gina, Active, Some(details), t0);
        let o = tracker.update(&gina, Banned, None, t0);
        assert_eq!(o.details, None);
        assert_eq!(tracker.get(&gina).unwrap().details, None);

        tracker.update(&gina, Banned, None, t0);
        let o = tracker.update(&gina, Banned, None, t0);
        assert!(o.confirmed);
        assert_eq!(o.details, None);
    }

    #[test]
    fn clearing_forgets_the_streak() {
        let mut tracker = ConfirmationTracker::new();
        let frank = Handle::parse("frank").unwrap();
        feed(&mut tracker, &frank, &[Banned, Banned]);
        assert!(tracker.clear(&frank));
        assert!(!tracker.clear(&frank));
        assert_eq!(feed(&mut tracker, &frank, &[Banned]), vec![(false, 1)]);
    }
}
