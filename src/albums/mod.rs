//! Album membership suggestions from album centroids.
//!
//! An album needs at least `min_album_size` member photos with embeddings to
//! get a centroid. Albums below that are out entirely: they receive no
//! suggestions and their members still count as unsorted.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::config::AlbumConfig;
use crate::db::EmbeddingStore;
use crate::error::{check_limit, check_threshold, EngineError, Result};
use crate::similarity::{centroid, cosine_similarity};
use crate::tasks::CancelFlag;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlbumSuggestionRequest {
    /// Suggest for this photo only; otherwise for every unsorted photo.
    #[serde(default)]
    pub photo_uid: Option<String>,
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlbumScore {
    pub album_uid: String,
    pub album_title: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoSuggestion {
    pub photo_uid: String,
    pub albums: Vec<AlbumScore>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlbumSuggestionResponse {
    pub suggestions: Vec<PhotoSuggestion>,
    pub count: usize,
    /// Albums large enough to have a centroid.
    pub eligible_albums: usize,
}

/// Unit-length mean of an album's member embeddings.
#[derive(Debug, Clone)]
pub struct AlbumCentroid {
    pub uid: String,
    pub title: String,
    pub centroid: Vec<f32>,
    pub members: HashSet<String>,
}

/// Centroids for every album with at least `min_size` embedded members.
pub fn album_centroids(
    store: &dyn EmbeddingStore,
    min_size: usize,
    search_limit: usize,
) -> Result<Vec<AlbumCentroid>> {
    let min_size = min_size.max(1);
    let mut centroids = Vec::new();

    for album in store.list_albums()? {
        let members: Vec<_> = store
            .list_image_embeddings(Some(&album.uid), search_limit)?
            .into_iter()
            .filter(|e| !e.embedding.is_empty())
            .collect();

        if members.len() < min_size {
            debug!(album = %album.uid, members = members.len(), "Album too small for a centroid");
            continue;
        }

        if let Some(c) = centroid(members.iter().map(|m| m.embedding.as_slice())) {
            centroids.push(AlbumCentroid {
                uid: album.uid,
                title: album.title,
                centroid: c,
                members: album.photo_uids.into_iter().collect(),
            });
        }
    }

    Ok(centroids)
}

/// Albums scoring at least `threshold`, best first, ties by album uid,
/// at most `top_k`. Albums already holding `photo_uid` are skipped.
pub fn rank_albums(
    photo_uid: &str,
    embedding: &[f32],
    centroids: &[AlbumCentroid],
    threshold: f32,
    top_k: usize,
) -> Vec<AlbumScore> {
    let mut scores: Vec<AlbumScore> = centroids
        .iter()
        .filter(|a| !a.members.contains(photo_uid))
        .map(|a| AlbumScore {
            album_uid: a.uid.clone(),
            album_title: a.title.clone(),
            similarity: cosine_similarity(embedding, &a.centroid),
        })
        .filter(|s| s.similarity >= threshold)
        .collect();

    scores.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.album_uid.cmp(&b.album_uid))
    });
    scores.truncate(top_k);
    scores
}

pub fn suggest_albums(
    store: &dyn EmbeddingStore,
    request: &AlbumSuggestionRequest,
    config: &AlbumConfig,
    search_limit: usize,
    cancel: &CancelFlag,
) -> Result<AlbumSuggestionResponse> {
    let threshold = check_threshold(
        "similarity_threshold",
        request.similarity_threshold.unwrap_or(config.similarity_threshold),
    )?;
    let top_k = check_limit("top_k", request.top_k.unwrap_or(config.top_k))?;
    let search_limit = check_limit("limit", search_limit)?;

    let centroids = album_centroids(store, config.min_album_size, search_limit)?;

    let photos = match request.photo_uid.as_deref() {
        Some(uid) => {
            let photo = store
                .get_image_embedding(uid)?
                .filter(|p| !p.embedding.is_empty())
                .ok_or_else(|| EngineError::NotFound(format!("image embedding for photo {:?}", uid)))?;
            vec![photo]
        }
        None => {
            let sorted: HashSet<&str> = centroids
                .iter()
                .flat_map(|a| a.members.iter().map(String::as_str))
                .collect();
            store
                .list_image_embeddings(None, search_limit)?
                .into_iter()
                .filter(|p| !p.embedding.is_empty() && !sorted.contains(p.photo_uid.as_str()))
                .collect()
        }
    };

    let mut suggestions = Vec::new();
    for photo in &photos {
        cancel.check()?;
        let albums = rank_albums(&photo.photo_uid, &photo.embedding, &centroids, threshold, top_k);
        if !albums.is_empty() {
            suggestions.push(PhotoSuggestion {
                photo_uid: photo.photo_uid.clone(),
                albums,
            });
        }
    }

    info!(
        photos = photos.len(),
        eligible_albums = centroids.len(),
        suggestions = suggestions.len(),
        "Album suggestions computed"
    );

    Ok(AlbumSuggestionResponse {
        count: suggestions.len(),
        suggestions,
        eligible_albums: centroids.len(),
    })
}
