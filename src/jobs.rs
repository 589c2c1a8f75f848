#![forbid(unsafe_code)]

//! In-memory registry of download jobs.
//!
//! The store is the only owner of job records. Handlers, the extraction
//! adapter and the stream guard all go through the accessors below, each of
//! which takes the lock once, so nobody can observe a half-applied update.
//! Reads vastly outnumber writes (every open browser tab polls), hence the
//! `RwLock`.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Downloading,
    Finished,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }
}

/// Snapshot of a job. Cloned out of the store, never shared.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub progress: u8,
    /// Name shown to the client. Tentative while the tool is still running,
    /// final once `artifact` is recorded.
    pub filename: Option<String>,
    pub error: Option<String>,
    /// Staged file on disk, recorded after post-processing and renaming.
    pub artifact: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    streaming: bool,
}

impl Job {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            progress: 0,
            filename: None,
            error: None,
            artifact: None,
            created_at: now,
            updated_at: now,
            streaming: false,
        }
    }

    /// Errored jobs and jobs with a recorded artifact accept no more updates.
    pub fn is_terminal(&self) -> bool {
        self.status == JobStatus::Error || self.artifact.is_some()
    }

    /// A job can be streamed once it finished and its file is in place.
    pub fn is_ready(&self) -> bool {
        self.status == JobStatus::Finished && self.artifact.is_some()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn apply(&mut self, update: JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(progress) = update.progress {
            let progress = progress.min(100);
            // Merged downloads restart the byte count for the audio stream;
            // the reported percentage must not go backwards.
            self.progress = if self.status == JobStatus::Downloading {
                self.progress.max(progress)
            } else {
                progress
            };
        }
        if let Some(filename) = update.filename {
            self.filename = Some(filename);
        }
        if let Some(artifact) = update.artifact {
            self.artifact = Some(artifact);
        }
        match self.status {
            JobStatus::Finished => {
                self.progress = 100;
                self.error = None;
            }
            JobStatus::Error => {
                self.error = update.error.or_else(|| self.error.take());
            }
            JobStatus::Pending | JobStatus::Downloading => {}
        }
        self.updated_at = Utc::now();
    }
}

/// Partial job state merged by [`JobStore::update`]. `None` fields are left
/// untouched.
#[derive(Clone, Debug, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub filename: Option<String>,
    pub error: Option<String>,
    pub artifact: Option<PathBuf>,
}

impl JobUpdate {
    pub fn downloading(progress: u8) -> Self {
        Self {
            status: Some(JobStatus::Downloading),
            progress: Some(progress),
            ..Self::default()
        }
    }

    /// The tool reported the end of a transfer. The filename is the tool's
    /// own and may still change during post-processing.
    pub fn finished(filename: Option<String>) -> Self {
        Self {
            status: Some(JobStatus::Finished),
            progress: Some(100),
            filename,
            ..Self::default()
        }
    }

    /// Final state after post-processing: sanitized name and staged path.
    pub fn completed(filename: String, artifact: PathBuf) -> Self {
        Self {
            status: Some(JobStatus::Finished),
            progress: Some(100),
            filename: Some(filename),
            artifact: Some(artifact),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Cloneable handle to the shared job map.
#[derive(Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh `pending` job and returns its identifier.
    pub fn create(&self) -> String {
        let mut jobs = self.jobs.write();
        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !jobs.contains_key(&candidate) {
                break candidate;
            }
        };
        jobs.insert(id.clone(), Job::new(id.clone()));
        tracing::debug!(job_id = %id, "job created");
        id
    }

    /// Merges `update` into the job. Unknown ids and terminal jobs are left
    /// alone; progress events routinely race with eviction. Returns whether
    /// the update was applied.
    pub fn update(&self, id: &str, update: JobUpdate) -> bool {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(id) else {
            return false;
        };
        if job.is_terminal() {
            return false;
        }
        let previous = job.status;
        job.apply(update);
        if previous != job.status {
            tracing::debug!(
                job_id = %id,
                from = previous.as_str(),
                to = job.status.as_str(),
                "job status changed"
            );
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    /// Deletes the job. Removing an absent id is a no-op.
    pub fn remove(&self, id: &str) -> Option<Job> {
        self.jobs.write().remove(id)
    }

    /// Marks a ready job as being streamed and returns its snapshot. Only one
    /// caller can hold the claim, so only one stream ever runs the cleanup.
    pub fn claim_for_streaming(&self, id: &str) -> Option<Job> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(id)?;
        if !job.is_ready() || job.streaming {
            return None;
        }
        job.streaming = true;
        Some(job.clone())
    }

    /// Removes every settled job idle for longer than `ttl`.
    ///
    /// Jobs whose fetch is still running are skipped: merges and transcodes
    /// emit no progress, and the fetch task still writes into the staging
    /// directory. Every fetch ends by recording an artifact or an error, so
    /// such jobs become evictable once it returns. Jobs being streamed are
    /// skipped too; their stream guard cleans them up.
    pub fn evict_idle(&self, ttl: Duration, now: DateTime<Utc>) -> Vec<Job> {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let mut jobs = self.jobs.write();
        let stale: Vec<String> = jobs
            .values()
            .filter(|job| {
                job.is_terminal()
                    && !job.streaming
                    && now.signed_duration_since(job.updated_at) > ttl
            })
            .map(|job| job.id.clone())
            .collect();
        stale.iter().filter_map(|id| jobs.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

/// Per-job staging directory under the media root.
pub fn staging_dir(media_root: &Path, id: &str) -> PathBuf {
    media_root.join(id)
}

/// Periodically evicts idle jobs and deletes their staging directories.
/// Runs until the process exits.
pub async fn run_sweeper(store: JobStore, media_root: PathBuf, ttl: Duration) {
    let period = ttl.min(Duration::from_secs(60));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for job in store.evict_idle(ttl, Utc::now()) {
            tracing::info!(
                job_id = %job.id,
                status = job.status.as_str(),
                "evicting idle job"
            );
            remove_staging_dir(&staging_dir(&media_root, &job.id)).await;
        }
    }
}

/// Best-effort removal of a job's staging directory.
pub async fn remove_staging_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %dir.display(), "could not remove staging dir: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn created_job_starts_pending() {
        let store = JobStore::new();
        let id = store.create();
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.filename.is_none());
        assert!(job.error.is_none());
    }

    #[test]
    fn identifiers_are_unique() {
        let store = JobStore::new();
        let mut ids: Vec<String> = (0..500).map(|_| store.create()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 500);
        assert_eq!(store.len(), 500);
    }

    #[test]
    fn update_unknown_id_is_a_no_op() {
        let store = JobStore::new();
        assert!(!store.update("ghost", JobUpdate::downloading(10)));
        assert!(store.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let store = JobStore::new();
        let id = store.create();
        assert!(store.remove(&id).is_some());
        assert!(store.get(&id).is_none());
        assert!(store.remove(&id).is_none());
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn progress_never_decreases_while_downloading() {
        let store = JobStore::new();
        let id = store.create();
        store.update(&id, JobUpdate::downloading(40));
        store.update(&id, JobUpdate::downloading(12));
        assert_eq!(store.get(&id).unwrap().progress, 40);
        store.update(&id, JobUpdate::downloading(250));
        assert_eq!(store.get(&id).unwrap().progress, 100);
    }

    #[test]
    fn finished_forces_full_progress() {
        let store = JobStore::new();
        let id = store.create();
        store.update(&id, JobUpdate::downloading(7));
        store.update(
            &id,
            JobUpdate {
                status: Some(JobStatus::Finished),
                ..JobUpdate::default()
            },
        );
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.progress, 100);
        assert!(!job.is_ready());
    }

    #[test]
    fn errored_job_ignores_late_updates() {
        let store = JobStore::new();
        let id = store.create();
        assert!(store.update(&id, JobUpdate::failed("boom")));
        assert!(!store.update(&id, JobUpdate::downloading(50)));
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn claim_requires_ready_job_and_is_exclusive() {
        let store = JobStore::new();
        let id = store.create();
        assert!(store.claim_for_streaming(&id).is_none());

        store.update(&id, JobUpdate::finished(Some("raw.webm".into())));
        assert!(store.claim_for_streaming(&id).is_none());

        store.update(
            &id,
            JobUpdate::completed("clip.mp4".into(), PathBuf::from("/tmp/clip.mp4")),
        );
        let claimed = store.claim_for_streaming(&id).unwrap();
        assert_eq!(claimed.filename.as_deref(), Some("clip.mp4"));
        assert!(store.get(&id).unwrap().is_streaming());
        assert!(store.claim_for_streaming(&id).is_none());
        assert!(store.claim_for_streaming("ghost").is_none());
    }

    #[test]
    fn evict_idle_takes_settled_jobs_only() {
        let store = JobStore::new();
        let failed = store.create();
        store.update(&failed, JobUpdate::failed("boom"));
        let unclaimed = store.create();
        store.update(
            &unclaimed,
            JobUpdate::completed("b.mp4".into(), PathBuf::from("/tmp/b.mp4")),
        );
        let streaming = store.create();
        store.update(
            &streaming,
            JobUpdate::completed("a.mp3".into(), PathBuf::from("/tmp/a.mp3")),
        );
        store.claim_for_streaming(&streaming).unwrap();

        assert!(store.evict_idle(Duration::from_secs(60), Utc::now()).is_empty());

        let later = Utc::now() + TimeDelta::seconds(120);
        let mut evicted: Vec<_> = store
            .evict_idle(Duration::from_secs(60), later)
            .into_iter()
            .map(|job| job.id)
            .collect();
        evicted.sort();
        let mut expected = vec![failed, unclaimed];
        expected.sort();
        assert_eq!(evicted, expected);
        assert!(store.get(&streaming).is_some());
    }

    #[test]
    fn evict_idle_keeps_running_fetches() {
        let store = JobStore::new();
        let pending = store.create();
        let downloading = store.create();
        store.update(&downloading, JobUpdate::downloading(30));
        // Transfer done, merge or transcode still running.
        let post_processing = store.create();
        store.update(&post_processing, JobUpdate::finished(Some("raw.webm".into())));

        let much_later = Utc::now() + TimeDelta::days(7);
        assert!(store.evict_idle(Duration::from_secs(60), much_later).is_empty());
        for id in [&pending, &downloading, &post_processing] {
            assert!(store.get(id).is_some());
        }

        store.update(&post_processing, JobUpdate::failed("ffmpeg exited with 1"));
        let evicted = store.evict_idle(Duration::from_secs(60), much_later);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, post_processing);
    }

    #[test]
    fn concurrent_writers_and_readers_do_not_lose_updates() {
        let store = JobStore::new();
        let ids: Vec<String> = (0..8).map(|_| store.create()).collect();

        let writers: Vec<_> = ids
            .iter()
            .cloned()
            .map(|id| {
                let store = store.clone();
                thread::spawn(move || {
                    for pct in 0..=100u8 {
                        store.update(&id, JobUpdate::downloading(pct));
                    }
                    store.update(&id, JobUpdate::finished(Some(format!("{id}.mp4"))));
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let ids = ids.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        for id in &ids {
                            let job = store.get(id).unwrap();
                            if job.status == JobStatus::Finished {
                                assert_eq!(job.progress, 100);
                            }
                        }
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        for id in &ids {
            let job = store.get(id).unwrap();
            assert_eq!(job.status, JobStatus::Finished);
            assert_eq!(job.filename, Some(format!("{id}.mp4")));
        }
    }

    #[tokio::test]
    async fn sweeper_removes_settled_jobs_and_their_staging_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let store = JobStore::new();

        let done = store.create();
        let done_dir = staging_dir(temp.path(), &done);
        std::fs::create_dir_all(&done_dir).unwrap();
        std::fs::write(done_dir.join("clip.mp4"), b"video").unwrap();
        store.update(
            &done,
            JobUpdate::completed("clip.mp4".into(), done_dir.join("clip.mp4")),
        );

        let running = store.create();
        let running_dir = staging_dir(temp.path(), &running);
        std::fs::create_dir_all(&running_dir).unwrap();
        std::fs::write(running_dir.join("clip.mp4.part"), b"partial").unwrap();
        store.update(&running, JobUpdate::downloading(10));

        // Job ages are wall-clock timestamps, so this runs on real time with
        // a short TTL rather than a paused clock.
        let sweeper = tokio::spawn(run_sweeper(
            store.clone(),
            temp.path().to_path_buf(),
            Duration::from_millis(20),
        ));
        for _ in 0..200 {
            if store.get(&done).is_none() && !done_dir.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sweeper.abort();

        assert!(store.get(&done).is_none());
        assert!(!done_dir.exists());
        assert!(store.get(&running).is_some());
        assert!(running_dir.join("clip.mp4.part").exists());
    }

    #[tokio::test]
    async fn remove_staging_dir_tolerates_missing_dir() {
        let temp = tempfile::tempdir().unwrap();
        let dir = staging_dir(temp.path(), "job");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("file.mp4"), b"x").unwrap();
        remove_staging_dir(&dir).await;
        assert!(!dir.exists());
        remove_staging_dir(&dir).await;
    }
}
