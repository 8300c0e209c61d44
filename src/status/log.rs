//! Lock-free loop status shared between the acquisition thread and observers.
//!
//! Only the acquisition thread writes; any other thread (CLI, operator UI)
//! reads through [`LoopStatus::stats`] or the per-group flags without
//! blocking the loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Counters and flags for the current run.
#[derive(Debug)]
pub struct LoopStatus {
    /// Loop iterations started
    ticks: AtomicU64,
    /// Iterations that processed a frame
    processed_ticks: AtomicU64,
    /// Iterations that carried no usable data
    skipped_ticks: AtomicU64,
    /// Individual failed fetch attempts
    fetch_failures: AtomicU64,
    /// Frames rejected by the parser
    malformed_frames: AtomicU64,
    /// Buffer keys dropped on concatenation
    shape_errors: AtomicU64,
    /// Stimulator calls that failed
    capability_failures: AtomicU64,
    /// Iterations that panicked and were contained
    panics: AtomicU64,
    /// Gait cycles handed off
    cycles_completed: AtomicU64,
    stimulations_started: AtomicU64,
    stimulations_stopped: AtomicU64,
    /// Per channel group: currently stimulating
    stimulating: Vec<AtomicBool>,
    /// Loop thread running
    running: AtomicBool,
    run_id: Uuid,
    run_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl LoopStatus {
    /// Create a status block for `groups` channel groups.
    pub fn new(groups: usize) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            processed_ticks: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            shape_errors: AtomicU64::new(0),
            capability_failures: AtomicU64::new(0),
            panics: AtomicU64::new(0),
            cycles_completed: AtomicU64::new(0),
            stimulations_started: AtomicU64::new(0),
            stimulations_stopped: AtomicU64::new(0),
            stimulating: (0..groups).map(|_| AtomicBool::new(false)).collect(),
            running: AtomicBool::new(false),
            run_id: Uuid::new_v4(),
            run_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a status block that loads and saves cumulative counters.
    pub fn with_persistence(groups: usize, path: PathBuf) -> Self {
        let mut status = Self::new(groups);
        status.persist_path = Some(path);

        if let Err(e) = status.load() {
            tracing::warn!(error = %e, "could not load previous loop statistics");
        }

        status
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed_tick(&self) {
        self.processed_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped_tick(&self) {
        self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shape_errors(&self, count: u64) {
        self.shape_errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_capability_failure(&self) {
        self.capability_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_completed(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a started session for `group`.
    pub fn record_stimulation_started(&self, group: usize) {
        self.stimulations_started.fetch_add(1, Ordering::Relaxed);
        self.set_stimulating(group, true);
    }

    /// Record a stopped session for `group`.
    pub fn record_stimulation_stopped(&self, group: usize) {
        self.stimulations_stopped.fetch_add(1, Ordering::Relaxed);
        self.set_stimulating(group, false);
    }

    fn set_stimulating(&self, group: usize, value: bool) {
        if let Some(flag) = self.stimulating.get(group) {
            flag.store(value, Ordering::Release);
        }
    }

    /// Whether `group` is stimulating, as last recorded by the loop.
    pub fn is_stimulating(&self, group: usize) -> bool {
        self.stimulating
            .get(group)
            .map_or(false, |f| f.load(Ordering::Acquire))
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Get the current statistics.
    pub fn stats(&self) -> LoopStats {
        LoopStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            processed_ticks: self.processed_ticks.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            shape_errors: self.shape_errors.load(Ordering::Relaxed),
            capability_failures: self.capability_failures.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            stimulations_started: self.stimulations_started.load(Ordering::Relaxed),
            stimulations_stopped: self.stimulations_stopped.load(Ordering::Relaxed),
            stimulating: (0..self.stimulating.len())
                .map(|g| self.is_stimulating(g))
                .collect(),
            run_id: self.run_id,
            run_start: self.run_start,
            run_duration_secs: (Utc::now() - self.run_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Loop Statistics (run {}):\n\
             - Ticks: {} ({} processed, {} skipped)\n\
             - Fetch failures: {}\n\
             - Malformed frames: {}\n\
             - Dropped buffer keys: {}\n\
             - Stimulator call failures: {}\n\
             - Contained panics: {}\n\
             - Gait cycles completed: {}\n\
             - Stimulations started/stopped: {}/{}\n\
             - Run duration: {} seconds",
            stats.run_id,
            stats.ticks,
            stats.processed_ticks,
            stats.skipped_ticks,
            stats.fetch_failures,
            stats.malformed_frames,
            stats.shape_errors,
            stats.capability_failures,
            stats.panics,
            stats.cycles_completed,
            stats.stimulations_started,
            stats.stimulations_stopped,
            stats.run_duration_secs
        )
    }

    /// Save cumulative counters to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                ticks: stats.ticks,
                processed_ticks: stats.processed_ticks,
                skipped_ticks: stats.skipped_ticks,
                fetch_failures: stats.fetch_failures,
                malformed_frames: stats.malformed_frames,
                shape_errors: stats.shape_errors,
                capability_failures: stats.capability_failures,
                panics: stats.panics,
                cycles_completed: stats.cycles_completed,
                stimulations_started: stats.stimulations_started,
                stimulations_stopped: stats.stimulations_stopped,
                last_run_id: stats.run_id,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.ticks.store(persisted.ticks, Ordering::Relaxed);
                self.processed_ticks
                    .store(persisted.processed_ticks, Ordering::Relaxed);
                self.skipped_ticks
                    .store(persisted.skipped_ticks, Ordering::Relaxed);
                self.fetch_failures
                    .store(persisted.fetch_failures, Ordering::Relaxed);
                self.malformed_frames
                    .store(persisted.malformed_frames, Ordering::Relaxed);
                self.shape_errors
                    .store(persisted.shape_errors, Ordering::Relaxed);
                self.capability_failures
                    .store(persisted.capability_failures, Ordering::Relaxed);
                self.panics.store(persisted.panics, Ordering::Relaxed);
                self.cycles_completed
                    .store(persisted.cycles_completed, Ordering::Relaxed);
                self.stimulations_started
                    .store(persisted.stimulations_started, Ordering::Relaxed);
                self.stimulations_stopped
                    .store(persisted.stimulations_stopped, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

/// Snapshot of loop statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub processed_ticks: u64,
    pub skipped_ticks: u64,
    pub fetch_failures: u64,
    pub malformed_frames: u64,
    pub shape_errors: u64,
    pub capability_failures: u64,
    pub panics: u64,
    pub cycles_completed: u64,
    pub stimulations_started: u64,
    pub stimulations_stopped: u64,
    pub stimulating: Vec<bool>,
    pub run_id: Uuid,
    pub run_start: DateTime<Utc>,
    pub run_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStats {
    pub ticks: u64,
    pub processed_ticks: u64,
    pub skipped_ticks: u64,
    pub fetch_failures: u64,
    pub malformed_frames: u64,
    /// Counters added after the first file format default to zero
    #[serde(default)]
    pub shape_errors: u64,
    #[serde(default)]
    pub capability_failures: u64,
    #[serde(default)]
    pub panics: u64,
    pub cycles_completed: u64,
    pub stimulations_started: u64,
    #[serde(default)]
    pub stimulations_stopped: u64,
    pub last_run_id: Uuid,
    pub last_updated: DateTime<Utc>,
}

/// Thread-safe shared loop status.
pub type SharedLoopStatus = Arc<LoopStatus>;

/// Create a new shared loop status.
pub fn create_shared_status(groups: usize) -> SharedLoopStatus {
    Arc::new(LoopStatus::new(groups))
}

/// Create a new shared loop status with persistence.
pub fn create_shared_status_with_persistence(groups: usize, path: PathBuf) -> SharedLoopStatus {
    Arc::new(LoopStatus::with_persistence(groups, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let status = LoopStatus::new(2);
        status.record_tick();
        status.record_tick();
        status.record_skipped_tick();
        status.record_fetch_failure();
        status.record_shape_errors(3);

        let stats = status.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.skipped_ticks, 1);
        assert_eq!(stats.fetch_failures, 1);
        assert_eq!(stats.shape_errors, 3);
    }

    #[test]
    fn test_group_flags() {
        let status = LoopStatus::new(2);
        status.record_stimulation_started(1);
        assert!(!status.is_stimulating(0));
        assert!(status.is_stimulating(1));
        assert_eq!(status.stats().stimulating, vec![false, true]);

        status.record_stimulation_stopped(1);
        assert!(!status.is_stimulating(1));
        assert!(!status.is_stimulating(7));
    }

    #[test]
    fn test_persistence_roundtrip() {
        let path = std::env::temp_dir()
            .join(format!("gait-stim-status-{}", std::process::id()))
            .join("loop_stats.json");

        let status = LoopStatus::with_persistence(2, path.clone());
        status.record_tick();
        status.record_cycle_completed();
        status.record_stimulation_started(0);
        status.record_stimulation_stopped(0);
        status.record_capability_failure();
        status.record_shape_errors(2);
        status.record_panic();
        status.save().unwrap();

        let reloaded = LoopStatus::with_persistence(2, path.clone());
        let stats = reloaded.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.cycles_completed, 1);
        assert_eq!(stats.stimulations_started, 1);
        assert_eq!(stats.stimulations_stopped, 1);
        assert_eq!(stats.capability_failures, 1);
        assert_eq!(stats.shape_errors, 2);
        assert_eq!(stats.panics, 1);
        assert_eq!(stats.stimulating, vec![false, false]);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_older_stats_file_still_loads() {
        let json = r#"{
            "ticks": 7,
            "processed_ticks": 6,
            "skipped_ticks": 1,
            "fetch_failures": 1,
            "malformed_frames": 0,
            "cycles_completed": 2,
            "stimulations_started": 3,
            "last_run_id": "00000000-0000-0000-0000-000000000000",
            "last_updated": "2024-01-01T00:00:00Z"
        }"#;
        let persisted: PersistedStats = serde_json::from_str(json).unwrap();
        assert_eq!(persisted.stimulations_started, 3);
        assert_eq!(persisted.stimulations_stopped, 0);
        assert_eq!(persisted.panics, 0);
    }

    #[test]
    fn test_summary_format() {
        let status = LoopStatus::new(1);
        let summary = status.summary();
        assert!(summary.contains("Ticks"));
        assert!(summary.contains("Gait cycles completed"));
    }
}
