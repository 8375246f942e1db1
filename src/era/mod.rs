//! Era estimation against precomputed era centroids.

use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::debug;

use crate::db::{EmbeddingStore, EraCentroid};
use crate::error::{EngineError, Result};
use crate::similarity::cosine_similarity;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EraEstimate {
    pub era_slug: String,
    pub era_name: String,
    pub representative_date: NaiveDate,
    /// Cosine similarity to the winning centroid. No floor is applied.
    pub similarity: f32,
}

/// Best-matching era for an embedding, or `None` when there are no centroids.
///
/// Ties go to the earliest representative date, then to the smaller slug.
pub fn estimate_era(embedding: &[f32], centroids: &[EraCentroid]) -> Option<EraEstimate> {
    centroids
        .iter()
        .map(|era| (era, cosine_similarity(embedding, &era.embedding)))
        .min_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.representative_date.cmp(&b.representative_date))
                .then_with(|| a.slug.cmp(&b.slug))
        })
        .map(|(era, similarity)| EraEstimate {
            era_slug: era.slug.clone(),
            era_name: era.label.clone(),
            representative_date: era.representative_date,
            similarity,
        })
}

pub fn estimate_photo_era(store: &dyn EmbeddingStore, photo_uid: &str) -> Result<EraEstimate> {
    let photo = store
        .get_image_embedding(photo_uid)?
        .filter(|p| !p.embedding.is_empty())
        .ok_or_else(|| EngineError::NotFound(format!("image embedding for photo {:?}", photo_uid)))?;

    let centroids = store.list_era_centroids()?;
    let estimate = estimate_era(&photo.embedding, &centroids)
        .ok_or_else(|| EngineError::NotFound("era centroids".to_string()))?;

    debug!(
        photo = photo_uid,
        era = %estimate.era_slug,
        similarity = estimate.similarity,
        "Era estimated"
    );
    Ok(estimate)
}
