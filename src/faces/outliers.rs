//! Flag faces linked to a subject that sit far from the subject's centroid.

use serde::Deserialize;
use std::cmp::Ordering;
use tracing::info;

use super::{resolve_subject, subject_reference, FaceMatch, MatchAction, ReconcileResponse};
use crate::config::FaceConfig;
use crate::db::EmbeddingStore;
use crate::error::{check_limit, check_threshold, Result};
use crate::similarity::cosine_distance;

/// Fewer linked faces than this give no usable centroid signal.
pub const MIN_FACES_FOR_OUTLIERS: usize = 2;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutlierRequest {
    pub subject_name: String,
    #[serde(default)]
    pub distance_threshold: Option<f32>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl OutlierRequest {
    pub fn new(subject_name: impl Into<String>) -> Self {
        Self {
            subject_name: subject_name.into(),
            ..Self::default()
        }
    }
}

/// Every linked face further than the threshold (exclusive) from the
/// centroid becomes `unassign_person`, worst first.
pub fn find_outliers(
    store: &dyn EmbeddingStore,
    request: &OutlierRequest,
    config: &FaceConfig,
    search_limit: usize,
) -> Result<ReconcileResponse> {
    let threshold = check_threshold(
        "distance_threshold",
        request.distance_threshold.unwrap_or(config.distance_threshold),
    )?;
    let limit = check_limit("limit", request.limit.unwrap_or(search_limit))?;

    let subject = resolve_subject(store, &request.subject_name)?;
    let as_of = store.snapshot_as_of()?;

    let (faces, reference) = match subject_reference(store, &subject.uid)? {
        Some((faces, reference)) if faces.len() >= MIN_FACES_FOR_OUTLIERS => (faces, reference),
        _ => {
            info!(subject = %subject.name, "Too few linked faces for outlier detection");
            return Ok(ReconcileResponse::new(&subject, Vec::new(), limit, as_of));
        }
    };

    let mut outliers: Vec<FaceMatch> = faces
        .into_iter()
        .filter_map(|face| {
            let distance = cosine_distance(&reference, &face.embedding);
            if distance <= threshold {
                return None;
            }
            Some(FaceMatch {
                photo_uid: face.photo_uid,
                face_index: face.face_index,
                marker_uid: face.cache.marker_uid,
                subject_uid: face.cache.subject_uid,
                subject_name: face.cache.subject_name,
                bbox_rel: face.bbox,
                action: MatchAction::UnassignPerson,
                distance,
            })
        })
        .collect();

    outliers.sort_by(|a, b| {
        b.distance
            .partial_cmp(&a.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.photo_uid.cmp(&b.photo_uid))
            .then_with(|| a.face_index.cmp(&b.face_index))
    });

    let response = ReconcileResponse::new(&subject, outliers, limit, as_of);
    info!(
        subject = %subject.name,
        outliers = response.matches.len(),
        threshold,
        "Outlier scan finished"
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::db::{FaceEmbedding, MemoryStore, SnapshotWriter, Subject};
    use crate::error::EngineError;

    const DIM: usize = FaceEmbedding::DIM;

    fn store_with(faces: &[(&str, Vec<f32>)]) -> (MemoryStore, Subject) {
        let store = MemoryStore::new();
        let alice = subject("js1", "Alice");
        store.replace_subjects(&[alice.clone()]).unwrap();
        for (i, (photo, v)) in faces.iter().enumerate() {
            store
                .upsert_face_embedding(&linked_face(photo, 0, v.clone(), &alice, &format!("m{}", i)))
                .unwrap();
        }
        (store, alice)
    }

    #[test]
    fn test_flags_misassigned_face() {
        let (store, _) = store_with(&[
            ("p1", axis_vector(DIM, 0, 0.0)),
            ("p2", axis_vector(DIM, 0, 0.05)),
            ("p3", axis_vector(DIM, 0, -0.05)),
            ("p4", axis_vector(DIM, 0, 0.02)),
            ("stranger", axis_vector(DIM, 7, 0.0)),
        ]);

        let resp = find_outliers(
            &store,
            &OutlierRequest::new("alice"),
            &FaceConfig::default(),
            1000,
        )
        .unwrap();

        assert_eq!(resp.matches.len(), 1);
        let m = &resp.matches[0];
        assert_eq!(m.photo_uid, "stranger");
        assert_eq!(m.action, MatchAction::UnassignPerson);
        assert_eq!(m.marker_uid.as_deref(), Some("m4"));
        assert!(m.distance > 0.5);
        assert_eq!(resp.summary.unassign_person, 1);
        assert_eq!(resp.summary.total(), 1);
    }

    #[test]
    fn test_threshold_boundary_is_exclusive() {
        // e1 and -e1 cancel, so the centroid is exactly e0 and both sit at
        // distance exactly 1.0 from it.
        let up = axis_vector(DIM, 1, 0.0);
        let down: Vec<f32> = up.iter().map(|x| -x).collect();
        let (store, _) = store_with(&[
            ("center", axis_vector(DIM, 0, 0.0)),
            ("down", down),
            ("up", up),
        ]);

        let at = OutlierRequest {
            subject_name: "alice".into(),
            distance_threshold: Some(1.0),
            limit: None,
        };
        let resp = find_outliers(&store, &at, &FaceConfig::default(), 1000).unwrap();
        assert!(resp.matches.is_empty());

        let below = OutlierRequest {
            distance_threshold: Some(1.0 - 1e-4),
            ..at
        };
        let resp = find_outliers(&store, &below, &FaceConfig::default(), 1000).unwrap();
        let flagged: Vec<&str> = resp.matches.iter().map(|m| m.photo_uid.as_str()).collect();
        assert_eq!(flagged, vec!["down", "up"]);
    }

    #[test]
    fn test_single_face_gives_empty_result() {
        let (store, _) = store_with(&[("p1", axis_vector(DIM, 0, 0.0))]);
        let resp = find_outliers(
            &store,
            &OutlierRequest::new("alice"),
            &FaceConfig::default(),
            1000,
        )
        .unwrap();
        assert!(resp.matches.is_empty());
        assert_eq!(resp.summary.total(), 0);
    }

    #[test]
    fn test_no_faces_gives_empty_result() {
        let (store, _) = store_with(&[]);
        let resp = find_outliers(
            &store,
            &OutlierRequest::new("alice"),
            &FaceConfig::default(),
            1000,
        )
        .unwrap();
        assert!(resp.matches.is_empty());
    }

    #[test]
    fn test_unknown_subject_is_not_found() {
        let (store, _) = store_with(&[]);
        assert!(matches!(
            find_outliers(&store, &OutlierRequest::new("zed"), &FaceConfig::default(), 1000),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_sorted_worst_first_and_limited() {
        let (store, _) = store_with(&[
            ("p1", axis_vector(DIM, 0, 0.0)),
            ("p2", axis_vector(DIM, 0, 0.0)),
            ("p3", axis_vector(DIM, 0, 0.0)),
            ("p4", axis_vector(DIM, 0, 0.0)),
            ("far", axis_vector(DIM, 9, 0.0)),
            ("mid", axis_vector(DIM, 0, 1.0)),
        ]);
        let request = OutlierRequest {
            subject_name: "alice".into(),
            distance_threshold: Some(0.1),
            limit: None,
        };
        let resp = find_outliers(&store, &request, &FaceConfig::default(), 1000).unwrap();
        let order: Vec<&str> = resp.matches.iter().map(|m| m.photo_uid.as_str()).collect();
        assert_eq!(order, vec!["far", "mid"]);

        let limited = OutlierRequest {
            limit: Some(1),
            ..request
        };
        let resp = find_outliers(&store, &limited, &FaceConfig::default(), 1000).unwrap();
        assert_eq!(resp.matches.len(), 1);
        assert_eq!(resp.summary.unassign_person, 1);
    }
}
