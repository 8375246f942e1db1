//! Find faces that likely belong to a subject and decide what each needs.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{resolve_subject, subject_reference, FaceMatch, MatchAction, ReconcileResponse};
use crate::config::FaceConfig;
use crate::db::{EmbeddingStore, FaceEmbedding, Marker};
use crate::error::{check_limit, check_threshold, EngineError, Result};
use crate::similarity::intersection_over_union;

/// Reconciliation request as sent by the web layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchRequest {
    pub subject_name: String,
    #[serde(default)]
    pub distance_threshold: Option<f32>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl MatchRequest {
    pub fn new(subject_name: impl Into<String>) -> Self {
        Self {
            subject_name: subject_name.into(),
            ..Self::default()
        }
    }
}

/// Classify one face for `subject_uid` given the markers cached for its photo.
///
/// Returns the action and the marker it applies to. An already-linked face
/// wins; then a face carrying its own marker; then the marker with the
/// highest overlap of at least `iou_threshold` (ties go to the lower uid).
/// A chosen marker already linked to the subject means `AlreadyDone`.
pub fn classify_face(
    face: &FaceEmbedding,
    subject_uid: &str,
    markers: &[Marker],
    iou_threshold: f32,
) -> (MatchAction, Option<String>) {
    if face.cache.subject_uid.as_deref() == Some(subject_uid) {
        return (MatchAction::AlreadyDone, face.cache.marker_uid.clone());
    }

    if let Some(marker_uid) = &face.cache.marker_uid {
        let own = markers.iter().find(|m| &m.marker_uid == marker_uid);
        return (marker_action(own, subject_uid), Some(marker_uid.clone()));
    }

    let mut best: Option<(&Marker, f32)> = None;
    for marker in markers.iter().filter(|m| m.photo_uid == face.photo_uid) {
        let iou = intersection_over_union(&face.bbox, &marker.bbox);
        if iou < iou_threshold {
            continue;
        }
        best = match best {
            Some((b, b_iou))
                if b_iou > iou || (b_iou == iou && b.marker_uid <= marker.marker_uid) =>
            {
                Some((b, b_iou))
            }
            _ => Some((marker, iou)),
        };
    }

    match best {
        Some((marker, _)) => (
            marker_action(Some(marker), subject_uid),
            Some(marker.marker_uid.clone()),
        ),
        None => (MatchAction::CreateMarker, None),
    }
}

/// A marker already pointing at the subject needs nothing, even when the
/// face row's cached fields lag behind it.
fn marker_action(marker: Option<&Marker>, subject_uid: &str) -> MatchAction {
    match marker {
        Some(m) if m.subject_uid.as_deref() == Some(subject_uid) => MatchAction::AlreadyDone,
        _ => MatchAction::AssignPerson,
    }
}

/// Run the matcher for one subject.
///
/// Candidates come from the face index nearest the subject's centroid,
/// capped at `limit` (request value, else `search_limit`), and are kept
/// when their distance is at most the threshold (inclusive).
pub fn find_matches(
    store: &dyn EmbeddingStore,
    request: &MatchRequest,
    config: &FaceConfig,
    search_limit: usize,
) -> Result<ReconcileResponse> {
    let threshold = check_threshold(
        "distance_threshold",
        request.distance_threshold.unwrap_or(config.distance_threshold),
    )?;
    let limit = check_limit("limit", request.limit.unwrap_or(search_limit))?;
    let iou_threshold = check_threshold("iou_threshold", config.iou_threshold)?;

    let subject = resolve_subject(store, &request.subject_name)?;
    let (_, reference) = subject_reference(store, &subject.uid)?.ok_or_else(|| {
        EngineError::NotFound(format!(
            "no reference faces with embeddings for subject {:?}",
            subject.name
        ))
    })?;

    let candidates = store.query_nearest_faces(&reference, limit)?;
    debug!(
        subject = %subject.uid,
        candidates = candidates.len(),
        threshold,
        "Face candidates fetched"
    );

    let mut markers_by_photo: HashMap<String, Vec<Marker>> = HashMap::new();
    let mut matches = Vec::new();

    for candidate in candidates {
        if candidate.distance > threshold {
            // Ordered by distance, nothing further can qualify
            break;
        }
        let face = candidate.face;
        if !face.has_embedding() {
            continue;
        }

        if !markers_by_photo.contains_key(&face.photo_uid) {
            let markers = store.markers_for_photo(&face.photo_uid)?;
            markers_by_photo.insert(face.photo_uid.clone(), markers);
        }
        let markers = markers_by_photo
            .get(&face.photo_uid)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let (action, marker_uid) = classify_face(&face, &subject.uid, markers, iou_threshold);
        matches.push(FaceMatch {
            photo_uid: face.photo_uid,
            face_index: face.face_index,
            marker_uid,
            subject_uid: face.cache.subject_uid,
            subject_name: face.cache.subject_name,
            bbox_rel: face.bbox,
            action,
            distance: candidate.distance,
        });
    }

    let response = ReconcileResponse::new(&subject, matches, limit, store.snapshot_as_of()?);
    info!(
        subject = %subject.name,
        matches = response.matches.len(),
        create_marker = response.summary.create_marker,
        assign_person = response.summary.assign_person,
        already_done = response.summary.already_done,
        "Face reconciliation finished"
    );
    Ok(response)
}
