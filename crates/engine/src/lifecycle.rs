//! Track lifecycle rules.
//!
//! ```text
//! active --lock--> pending --(timer | make_available)--> available --reveal--> revealed
//!                     \______________________reveal_______________________/
//! ```
//!
//! Every function here is pure: it takes the current row and `now` and
//! returns the patch to write, or `InvalidTransition` without side effects.

use chrono::{DateTime, Duration, Utc};
use vault_core::{Result, Track, TrackPatch, TrackStatus, VaultError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Lock,
    MakeAvailable,
    Reveal,
}

impl Transition {
    pub fn action(&self) -> &'static str {
        match self {
            Transition::Lock => "lock",
            Transition::MakeAvailable => "make available",
            Transition::Reveal => "reveal",
        }
    }

    fn allowed_from(&self, status: TrackStatus) -> bool {
        match self {
            Transition::Lock => status == TrackStatus::Active,
            Transition::MakeAvailable => status == TrackStatus::Pending,
            Transition::Reveal => {
                matches!(status, TrackStatus::Pending | TrackStatus::Available)
            }
        }
    }
}

/// State of a brand-new track: created already locked.
pub fn initial_lock(now: DateTime<Utc>, wait: Duration) -> TrackPatch {
    TrackPatch {
        status: TrackStatus::Pending,
        locked_at: Some(now),
        available_at: Some(now + wait),
        revealed_at: None,
    }
}

/// State of a track staged without starting its countdown.
pub fn staged() -> TrackPatch {
    TrackPatch {
        status: TrackStatus::Active,
        locked_at: None,
        available_at: None,
        revealed_at: None,
    }
}

pub fn plan(
    track: &Track,
    transition: Transition,
    now: DateTime<Utc>,
    wait: Duration,
) -> Result<TrackPatch> {
    if !transition.allowed_from(track.status) {
        return Err(VaultError::InvalidTransition {
            from: track.status,
            action: transition.action(),
        });
    }

    let current = TrackPatch::unchanged(track);
    let patch = match transition {
        Transition::Lock => initial_lock(now, wait),
        Transition::MakeAvailable => TrackPatch {
            status: TrackStatus::Available,
            available_at: Some(now),
            ..current
        },
        Transition::Reveal => TrackPatch {
            status: TrackStatus::Revealed,
            // pending rows written before unlock times existed may lack one
            available_at: current.available_at.or(Some(now)),
            revealed_at: Some(now),
            ..current
        },
    };
    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::{initial_lock, plan, staged, Transition};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use vault_core::{Track, TrackMetadata, TrackPatch, TrackStatus, VaultError};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn track(patch: TrackPatch) -> Track {
        Track {
            id: 1,
            user_id: 1,
            metadata: TrackMetadata {
                id: 1,
                external_id: "x".to_string(),
                title: "T".to_string(),
                artist: "A".to_string(),
                album: "B".to_string(),
                preview_url: None,
                image_url: None,
                release_date: None,
            },
            status: patch.status,
            locked_at: patch.locked_at,
            available_at: patch.available_at,
            revealed_at: patch.revealed_at,
            created_at: now(),
        }
    }

    fn in_status(status: TrackStatus) -> Track {
        let wait = Duration::days(7);
        let patch = match status {
            TrackStatus::Active => staged(),
            TrackStatus::Pending => initial_lock(now(), wait),
            TrackStatus::Available => TrackPatch {
                status,
                ..initial_lock(now() - wait, wait)
            },
            TrackStatus::Revealed => TrackPatch {
                status,
                revealed_at: Some(now()),
                ..initial_lock(now() - wait, wait)
            },
        };
        track(patch)
    }

    #[test]
    fn lock_starts_the_countdown_only_from_active() {
        let wait = Duration::days(7);
        let patch = plan(&in_status(TrackStatus::Active), Transition::Lock, now(), wait).unwrap();
        assert_eq!(patch.status, TrackStatus::Pending);
        assert_eq!(patch.locked_at, Some(now()));
        assert_eq!(patch.available_at, Some(now() + wait));

        for status in [TrackStatus::Pending, TrackStatus::Available, TrackStatus::Revealed] {
            let err = plan(&in_status(status), Transition::Lock, now(), wait).unwrap_err();
            assert!(matches!(err, VaultError::InvalidTransition { from, .. } if from == status));
        }
    }

    #[test]
    fn make_available_bypasses_the_timer() {
        let pending = in_status(TrackStatus::Pending);
        let later = now() + Duration::hours(1);
        let patch = plan(&pending, Transition::MakeAvailable, later, Duration::days(7)).unwrap();

        assert_eq!(patch.status, TrackStatus::Available);
        assert_eq!(patch.available_at, Some(later));
        assert_eq!(patch.locked_at, pending.locked_at);

        assert!(plan(
            &in_status(TrackStatus::Available),
            Transition::MakeAvailable,
            later,
            Duration::days(7)
        )
        .is_err());
    }

    #[test]
    fn reveal_is_legal_from_pending_and_available_only() {
        let wait = Duration::days(7);
        for status in TrackStatus::ALL {
            let result = plan(&in_status(status), Transition::Reveal, now(), wait);
            let legal = matches!(status, TrackStatus::Pending | TrackStatus::Available);
            assert_eq!(result.is_ok(), legal, "reveal from {status}");
            if let Ok(patch) = result {
                assert_eq!(patch.status, TrackStatus::Revealed);
                assert_eq!(patch.revealed_at, Some(now()));
                assert!(patch.available_at.is_some());
            }
        }
    }

    #[test]
    fn available_at_is_set_for_every_non_active_outcome() {
        let wait = Duration::days(7);
        for status in TrackStatus::ALL {
            for transition in [Transition::Lock, Transition::MakeAvailable, Transition::Reveal] {
                if let Ok(patch) = plan(&in_status(status), transition, now(), wait) {
                    assert_ne!(patch.status, TrackStatus::Active);
                    assert!(patch.available_at.is_some());
                }
            }
        }
        assert!(staged().available_at.is_none());
    }
}
