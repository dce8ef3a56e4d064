use crate::lifecycle::{self, Transition};
use crate::sweep::SweepThrottle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info};
use vault_core::{
    LockConfig, NewTrackMetadata, Result, SweepConfig, Track, TrackFilter, TrackId, TrackMetadata,
    TrackStatus, UserId, VaultError,
};
use vault_store::Store;

pub const DEFAULT_SHOWCASE_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct AvailableTrack {
    #[serde(flatten)]
    pub track: Track,
    /// Whole days since the track became available.
    pub available_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockWindow {
    pub days: i64,
    pub development_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AvailableTracks {
    pub tracks: Vec<AvailableTrack>,
    pub locked_time: LockWindow,
}

/// Owns the track state machine: creation, manual transitions, listings and
/// the time-gated promotion of pending tracks.
pub struct TrackService {
    store: Store,
    lock: LockConfig,
    throttle: SweepThrottle,
}

impl TrackService {
    pub fn new(store: Store, lock: LockConfig, sweep: &SweepConfig) -> Self {
        Self {
            store,
            lock,
            throttle: SweepThrottle::new(sweep.interval()),
        }
    }

    pub fn lock_window(&self) -> LockWindow {
        LockWindow {
            days: self.lock.wait_duration().num_days(),
            development_mode: self.lock.development_mode,
        }
    }

    /// Get-or-create the metadata and create the user's track already locked.
    pub fn create(
        &self,
        user_id: UserId,
        meta: NewTrackMetadata,
        now: DateTime<Utc>,
    ) -> Result<Track> {
        let meta = meta.normalized()?;
        let initial = lifecycle::initial_lock(now, self.lock.wait_duration());
        let track = self.store.create_track(user_id, &meta, initial, now)?;
        info!(
            user_id,
            track_id = track.id,
            external_id = %track.metadata.external_id,
            available_at = ?track.available_at,
            "track locked"
        );
        Ok(track)
    }

    /// Administrative import: creates the track in `active` without starting
    /// its countdown. It must later be locked explicitly.
    pub fn stage(
        &self,
        user_id: UserId,
        meta: NewTrackMetadata,
        now: DateTime<Utc>,
    ) -> Result<Track> {
        let meta = meta.normalized()?;
        let track = self
            .store
            .create_track(user_id, &meta, lifecycle::staged(), now)?;
        info!(user_id, track_id = track.id, "track staged");
        Ok(track)
    }

    pub fn lock(&self, user_id: UserId, track_id: TrackId, now: DateTime<Utc>) -> Result<Track> {
        self.transition(user_id, track_id, Transition::Lock, now)
    }

    pub fn make_available(
        &self,
        user_id: UserId,
        track_id: TrackId,
        now: DateTime<Utc>,
    ) -> Result<Track> {
        self.transition(user_id, track_id, Transition::MakeAvailable, now)
    }

    pub fn reveal(&self, user_id: UserId, track_id: TrackId, now: DateTime<Utc>) -> Result<Track> {
        self.transition(user_id, track_id, Transition::Reveal, now)
    }

    fn transition(
        &self,
        user_id: UserId,
        track_id: TrackId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Track> {
        let wait = self.lock.wait_duration();
        let track = self.store.apply_transition(user_id, track_id, |current| {
            lifecycle::plan(current, transition, now, wait)
        })?;
        info!(
            user_id,
            track_id,
            action = transition.action(),
            status = %track.status,
            "track transitioned"
        );
        Ok(track)
    }

    pub fn get(&self, user_id: UserId, track_id: TrackId) -> Result<Track> {
        self.store.get_track(user_id, track_id)
    }

    pub fn list(&self, user_id: UserId, filter: &TrackFilter) -> Result<Vec<Track>> {
        self.store.list_tracks(user_id, filter)
    }

    pub fn available(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<AvailableTracks> {
        let limit = limit.unwrap_or(DEFAULT_SHOWCASE_LIMIT);
        let tracks = self
            .store
            .available_tracks(user_id, now, Some(limit))?
            .into_iter()
            .map(|track| {
                let available_days = track
                    .available_at
                    .map(|at| now.signed_duration_since(at).num_days())
                    .unwrap_or(0);
                AvailableTrack {
                    track,
                    available_days,
                }
            })
            .collect();
        Ok(AvailableTracks {
            tracks,
            locked_time: self.lock_window(),
        })
    }

    pub fn revealed(&self, user_id: UserId, limit: Option<usize>) -> Result<Vec<Track>> {
        self.store
            .revealed_tracks(user_id, Some(limit.unwrap_or(DEFAULT_SHOWCASE_LIMIT)))
    }

    /// The subset of `external_ids` the user already has a track for, in
    /// input order, without duplicates. Blank entries are ignored.
    pub fn check_external_ids(&self, user_id: UserId, external_ids: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let wanted: Vec<String> = external_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty() && seen.insert(*id))
            .map(str::to_string)
            .collect();

        let found: HashSet<String> = self
            .store
            .locked_external_ids(user_id, &wanted)?
            .into_iter()
            .collect();
        Ok(wanted.into_iter().filter(|id| found.contains(id)).collect())
    }

    /// Request-triggered sweep, rate limited per user. Returns `None` when
    /// the user was swept too recently.
    pub fn sweep_if_due(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Option<usize>> {
        if !self.throttle.try_claim(user_id, now) {
            return Ok(None);
        }
        let promoted = self.store.promote_elapsed(Some(user_id), now)?;
        if promoted > 0 {
            info!(user_id, promoted, "promoted elapsed tracks");
        } else {
            debug!(user_id, "sweep found nothing to promote");
        }
        Ok(Some(promoted))
    }

    /// Batch sweep across every user.
    pub fn sweep_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let promoted = self.store.promote_elapsed(None, now)?;
        info!(promoted, "batch sweep finished");
        Ok(promoted)
    }

    /// Gives locked pending tracks that never got an unlock time one
    /// computed from their lock time.
    pub fn repair_missing_unlock_times(&self) -> Result<usize> {
        let fixed = self.store.backfill_available_at(self.lock.wait_duration())?;
        info!(fixed, "backfilled missing unlock times");
        Ok(fixed)
    }

    pub fn status_counts(&self) -> Result<Vec<(TrackStatus, i64)>> {
        self.store.status_counts()
    }

    /// Administrative removal of a metadata row. Refused while any user's
    /// track still points at it.
    pub fn delete_metadata(&self, external_id: &str) -> Result<TrackMetadata> {
        let external_id = external_id.trim();
        let meta = self
            .store
            .find_metadata(external_id)?
            .ok_or_else(|| VaultError::Validation(format!("no metadata for '{external_id}'")))?;
        self.store.delete_metadata(meta.id)?;
        info!(metadata_id = meta.id, external_id, "track metadata deleted");
        Ok(meta)
    }
}
