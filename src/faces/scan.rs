//! Run the matcher or outlier detector for every known subject.
//!
//! Subjects are independent, so they run on a bounded rayon pool. Each
//! subject reports its own outcome; one failing subject never aborts the
//! batch. Cancellation is checked before each subject starts.

use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

use super::{
    find_matches, find_outliers, MatchRequest, MatchSummary, OutlierRequest, ReconcileResponse,
};
use crate::config::FaceConfig;
use crate::db::{EmbeddingStore, Subject};
use crate::error::{EngineError, Result};
use crate::tasks::{CancelFlag, Progress, TaskProgress, TaskType, TaskUpdate};

/// Outcome for one subject in a batch scan.
#[derive(Debug)]
pub struct SubjectScan {
    pub subject: Subject,
    pub result: Result<ReconcileResponse>,
}

impl SubjectScan {
    /// Number of faces needing some action (anything but `already_done`).
    pub fn pending_actions(&self) -> usize {
        match &self.result {
            Ok(resp) => resp.summary.total() - resp.summary.already_done,
            Err(_) => 0,
        }
    }

    pub fn summary(&self) -> ScanSummary {
        let (summary, error) = match &self.result {
            Ok(resp) => (resp.summary, None),
            Err(e) => (MatchSummary::default(), Some(e.to_string())),
        };
        ScanSummary {
            subject_uid: self.subject.uid.clone(),
            subject_name: self.subject.name.clone(),
            pending: self.pending_actions(),
            summary,
            error,
        }
    }
}

/// Flat, serializable view of one [`SubjectScan`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    pub subject_uid: String,
    pub subject_name: String,
    pub pending: usize,
    pub summary: MatchSummary,
    pub error: Option<String>,
}

/// Scan every subject for new matches.
pub fn scan_all_subjects(
    store: &dyn EmbeddingStore,
    config: &FaceConfig,
    search_limit: usize,
    cancel: &CancelFlag,
    progress: &Progress,
) -> Result<Vec<SubjectScan>> {
    let result = run_batch(store, config, cancel, progress, TaskType::ScanPeople, |subject| {
        let request = MatchRequest {
            subject_name: subject.uid.clone(),
            distance_threshold: None,
            limit: None,
        };
        find_matches(store, &request, config, search_limit)
    });
    progress.finish(&result, |scans| summarize(scans, "matched"));
    result
}

/// Scan every subject for faces that no longer fit.
pub fn scan_all_outliers(
    store: &dyn EmbeddingStore,
    config: &FaceConfig,
    search_limit: usize,
    cancel: &CancelFlag,
    progress: &Progress,
) -> Result<Vec<SubjectScan>> {
    let result = run_batch(store, config, cancel, progress, TaskType::ScanOutliers, |subject| {
        let request = OutlierRequest {
            subject_name: subject.uid.clone(),
            distance_threshold: None,
            limit: None,
        };
        find_outliers(store, &request, config, search_limit)
    });
    progress.finish(&result, |scans| summarize(scans, "with outliers"));
    result
}

fn summarize(scans: &[SubjectScan], what: &str) -> String {
    let failed = scans.iter().filter(|s| s.result.is_err()).count();
    let with_work = scans.iter().filter(|s| s.pending_actions() > 0).count();
    format!(
        "Scanned {} people: {} {}, {} failed",
        scans.len(),
        with_work,
        what,
        failed
    )
}

/// Bounded pool for one batch; zero workers means one.
fn scan_pool(workers: usize) -> Result<rayon::ThreadPool> {
    Ok(rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()?)
}

fn run_batch<F>(
    store: &dyn EmbeddingStore,
    config: &FaceConfig,
    cancel: &CancelFlag,
    progress: &Progress,
    task: TaskType,
    per_subject: F,
) -> Result<Vec<SubjectScan>>
where
    F: Fn(&Subject) -> Result<ReconcileResponse> + Sync,
{
    cancel.check()?;
    let subjects = store.list_subjects()?;
    let total = subjects.len();
    progress.send(TaskUpdate::Started { task, total });

    let pool = scan_pool(config.scan_workers)?;

    let done = AtomicUsize::new(0);
    let scans: Vec<SubjectScan> = pool.install(|| {
        subjects
            .into_par_iter()
            .map(|subject| {
                let result = match cancel.check() {
                    Ok(()) => per_subject(&subject),
                    Err(e) => Err(e),
                };
                if let Err(e) = &result {
                    if !matches!(e, EngineError::Cancelled) {
                        warn!(subject = %subject.name, error = %e, "Subject scan failed");
                    }
                }
                let current = done.fetch_add(1, Ordering::SeqCst) + 1;
                progress.send(TaskUpdate::Progress(
                    TaskProgress::new(current, total).with_item(subject.name.clone()),
                ));
                SubjectScan { subject, result }
            })
            .collect()
    });

    cancel.check()?;
    info!(task = task.display_name(), subjects = scans.len(), "Batch scan finished");
    Ok(scans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::db::{FaceEmbedding, MemoryStore, SnapshotWriter};
    use crate::faces::MatchAction;
    use std::sync::mpsc;

    const DIM: usize = FaceEmbedding::DIM;

    fn people_store() -> MemoryStore {
        let store = MemoryStore::new();
        let alice = subject("js1", "Alice");
        let bob = subject("js2", "Bob");
        let carol = subject("js3", "Carol");
        store
            .replace_subjects(&[alice.clone(), bob.clone(), carol])
            .unwrap();
        store
            .upsert_face_embedding(&linked_face("a1", 0, axis_vector(DIM, 0, 0.0), &alice, "m1"))
            .unwrap();
        store
            .upsert_face_embedding(&linked_face("a2", 0, axis_vector(DIM, 0, 0.1), &alice, "m2"))
            .unwrap();
        store
            .upsert_face_embedding(&linked_face("b1", 0, axis_vector(DIM, 10, 0.0), &bob, "m3"))
            .unwrap();
        store
            .upsert_face_embedding(&linked_face("b2", 0, axis_vector(DIM, 10, 0.1), &bob, "m4"))
            .unwrap();
        store
            .upsert_face_embedding(&face("new", 0, axis_vector(DIM, 10, 0.05)))
            .unwrap();
        store
    }

    #[test]
    fn test_scan_reports_each_subject_independently() {
        let store = people_store();
        let scans = scan_all_subjects(
            &store,
            &FaceConfig::default(),
            1000,
            &CancelFlag::new(),
            &Progress::none(),
        )
        .unwrap();

        assert_eq!(scans.len(), 3);
        let by_name = |n: &str| scans.iter().find(|s| s.subject.name == n).unwrap();

        // Carol has no faces: reported, not fatal
        assert!(matches!(by_name("Carol").result, Err(EngineError::NotFound(_))));

        let bob = by_name("Bob").result.as_ref().unwrap();
        assert!(bob
            .matches
            .iter()
            .any(|m| m.photo_uid == "new" && m.action == MatchAction::CreateMarker));
        assert_eq!(by_name("Bob").pending_actions(), 1);

        let alice = by_name("Alice").result.as_ref().unwrap();
        assert!(alice.matches.iter().all(|m| m.photo_uid != "new"));

        let carol = by_name("Carol").summary();
        assert_eq!(carol.pending, 0);
        assert!(carol.error.is_some());
        let bob = by_name("Bob").summary();
        assert_eq!(bob.summary.create_marker, 1);
        assert!(bob.error.is_none());
    }

    #[test]
    fn test_scan_pool_size() {
        assert_eq!(scan_pool(0).unwrap().current_num_threads(), 1);
        assert_eq!(scan_pool(3).unwrap().current_num_threads(), 3);
    }

    #[test]
    fn test_scan_stops_when_cancelled() {
        let store = people_store();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = scan_all_subjects(
            &store,
            &FaceConfig::default(),
            1000,
            &cancel,
            &Progress::none(),
        );
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[test]
    fn test_scan_sends_progress() {
        let store = people_store();
        let (tx, rx) = mpsc::channel();
        let config = FaceConfig {
            scan_workers: 2,
            ..FaceConfig::default()
        };
        scan_all_outliers(&store, &config, 1000, &CancelFlag::new(), &Progress::channel(tx))
            .unwrap();

        let updates: Vec<TaskUpdate> = rx.try_iter().collect();
        assert!(matches!(
            updates.first(),
            Some(TaskUpdate::Started { task: TaskType::ScanOutliers, total: 3 })
        ));
        let progress_count = updates
            .iter()
            .filter(|u| matches!(u, TaskUpdate::Progress(_)))
            .count();
        assert_eq!(progress_count, 3);
        assert!(matches!(updates.last(), Some(TaskUpdate::Completed { .. })));
    }
}
