use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use log::{debug, info};
use shared::error::OfficeError;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Handle to the local camera/microphone tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTracks {
    pub id: u64,
    pub audio: bool,
    pub video: bool,
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_local_tracks(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalTracks, OfficeError>;

    async fn release_tracks(&self, tracks: LocalTracks);
}

/// Media source with no devices behind it. It only counts acquisitions, which
/// is all the call mesh needs to observe.
#[derive(Default)]
pub struct LoopbackMediaSource {
    next_id: AtomicU64,
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
    failing: AtomicBool,
}

impl LoopbackMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Makes every following acquisition fail, as a missing device would.
    #[cfg(test)]
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaSource for LoopbackMediaSource {
    async fn acquire_local_tracks(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalTracks, OfficeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OfficeError::SessionFormationFailed {
                peer: "local".into(),
                reason: "media devices unavailable".into(),
            });
        }

        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        Ok(LocalTracks {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            audio: constraints.audio,
            video: constraints.video,
        })
    }

    async fn release_tracks(&self, tracks: LocalTracks) {
        debug!("Released local tracks #{}", tracks.id);
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared ownership of the local tracks.
///
/// A holder registers with [`MediaLease::hold`] before it needs the tracks, so
/// a session that is closing and one that is forming overlap instead of
/// releasing and reacquiring the devices. The last release gives them back.
pub struct MediaLease {
    source: Arc<dyn MediaSource>,
    constraints: MediaConstraints,
    holders: AtomicUsize,
    tracks: Mutex<Option<LocalTracks>>,
}

impl MediaLease {
    pub fn new(source: Arc<dyn MediaSource>, constraints: MediaConstraints) -> Self {
        Self {
            source,
            constraints,
            holders: AtomicUsize::new(0),
            tracks: Mutex::new(None),
        }
    }

    pub fn hold(&self) {
        self.holders.fetch_add(1, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    /// Acquires the tracks unless a current holder already did.
    pub async fn ensure_tracks(&self) -> Result<(), OfficeError> {
        let mut tracks = self.tracks.lock().await;

        if tracks.is_none() {
            let acquired = self.source.acquire_local_tracks(&self.constraints).await?;
            info!("Acquired local tracks #{}", acquired.id);
            *tracks = Some(acquired);
        }

        Ok(())
    }

    pub async fn release(&self) {
        let mut tracks = self.tracks.lock().await;

        let previous = self
            .holders
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);

        if previous <= 1 {
            if let Some(released) = tracks.take() {
                self.source.release_tracks(released).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease() -> (Arc<LoopbackMediaSource>, Arc<MediaLease>) {
        let source = Arc::new(LoopbackMediaSource::new());
        let lease = Arc::new(MediaLease::new(source.clone(), MediaConstraints::default()));
        (source, lease)
    }

    #[tokio::test]
    async fn concurrent_holders_share_one_acquisition() {
        let (source, lease) = lease();

        lease.hold();
        lease.hold();
        let (a, b) = tokio::join!(lease.ensure_tracks(), lease.ensure_tracks());
        a.unwrap();
        b.unwrap();

        assert_eq!(source.acquisitions(), 1);
        assert_eq!(lease.holders(), 2);

        lease.release().await;
        assert_eq!(source.releases(), 0);
        lease.release().await;
        assert_eq!(source.releases(), 1);
    }

    #[tokio::test]
    async fn tracks_are_reacquired_after_full_release() {
        let (source, lease) = lease();

        lease.hold();
        lease.ensure_tracks().await.unwrap();
        lease.release().await;
        lease.hold();
        lease.ensure_tracks().await.unwrap();

        assert_eq!(source.acquisitions(), 2);
        assert_eq!(source.releases(), 1);
    }

    #[tokio::test]
    async fn failed_acquisition_leaves_no_holder() {
        let (source, lease) = lease();
        source.set_failing(true);

        lease.hold();
        assert!(lease.ensure_tracks().await.is_err());
        lease.release().await;
        assert_eq!(lease.holders(), 0);

        // a stray release must not underflow or release anything
        lease.release().await;
        assert_eq!(lease.holders(), 0);
        assert_eq!(source.releases(), 0);
    }
}
