//! Face reconciliation against the photo server's marker/subject graph.
//!
//! Every call re-reads the cached external state and classifies from
//! scratch; nothing about a previous run is remembered.

pub mod matcher;
pub mod outliers;
pub mod scan;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{EmbeddingStore, FaceEmbedding, Subject};
use crate::error::{EngineError, Result};
use crate::similarity::{centroid, BoundingBox};

pub use matcher::{classify_face, find_matches, MatchRequest};
pub use outliers::{find_outliers, OutlierRequest};
pub use scan::{scan_all_outliers, scan_all_subjects, ScanSummary, SubjectScan};

/// What the apply step has to do to reconcile one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchAction {
    /// No marker covers the face yet.
    CreateMarker,
    /// A marker exists but points at nobody or someone else.
    AssignPerson,
    /// Already linked to the subject.
    AlreadyDone,
    /// Linked to the subject but too far from its centroid.
    UnassignPerson,
}

impl MatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchAction::CreateMarker => "create_marker",
            MatchAction::AssignPerson => "assign_person",
            MatchAction::AlreadyDone => "already_done",
            MatchAction::UnassignPerson => "unassign_person",
        }
    }
}

/// One classified face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceMatch {
    pub photo_uid: String,
    pub face_index: u32,
    /// Marker to act on: the face's own, or the one overlapping it.
    pub marker_uid: Option<String>,
    /// Subject the face is currently linked to, if any.
    pub subject_uid: Option<String>,
    pub subject_name: Option<String>,
    pub bbox_rel: BoundingBox,
    pub action: MatchAction,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    pub create_marker: usize,
    pub assign_person: usize,
    pub already_done: usize,
    pub unassign_person: usize,
}

impl MatchSummary {
    pub fn from_matches(matches: &[FaceMatch]) -> Self {
        let mut summary = Self::default();
        for m in matches {
            match m.action {
                MatchAction::CreateMarker => summary.create_marker += 1,
                MatchAction::AssignPerson => summary.assign_person += 1,
                MatchAction::AlreadyDone => summary.already_done += 1,
                MatchAction::UnassignPerson => summary.unassign_person += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.create_marker + self.assign_person + self.already_done + self.unassign_person
    }
}

/// Result of a reconciliation or outlier query for one subject.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResponse {
    pub subject_uid: String,
    pub subject_name: String,
    pub matches: Vec<FaceMatch>,
    pub summary: MatchSummary,
    /// When the cached marker/subject state was last synced.
    pub as_of: Option<DateTime<Utc>>,
}

impl ReconcileResponse {
    fn new(
        subject: &Subject,
        mut matches: Vec<FaceMatch>,
        limit: usize,
        as_of: Option<DateTime<Utc>>,
    ) -> Self {
        matches.truncate(limit);
        let summary = MatchSummary::from_matches(&matches);
        Self {
            subject_uid: subject.uid.clone(),
            subject_name: subject.name.clone(),
            matches,
            summary,
            as_of,
        }
    }
}

pub(crate) fn resolve_subject(store: &dyn EmbeddingStore, name: &str) -> Result<Subject> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::InvalidInput("subject name must not be empty".into()));
    }
    store
        .find_subject(name)?
        .ok_or_else(|| EngineError::NotFound(format!("subject {:?}", name)))
}

/// A subject's faces that carry an embedding, plus their unit-length centroid.
///
/// `None` when no linked face has a usable vector.
pub fn subject_reference(
    store: &dyn EmbeddingStore,
    subject_uid: &str,
) -> Result<Option<(Vec<FaceEmbedding>, Vec<f32>)>> {
    let faces: Vec<FaceEmbedding> = store
        .faces_for_subject(subject_uid)?
        .into_iter()
        .filter(FaceEmbedding::has_embedding)
        .collect();

    Ok(centroid(faces.iter().map(|f| f.embedding.as_slice())).map(|c| (faces, c)))
}
