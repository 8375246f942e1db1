mod embeddings;
mod schema;
pub mod memory;
pub mod sqlite;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{EngineError, Result};
use crate::similarity::{cosine_distance, BoundingBox};

pub use embeddings::{bytes_to_embedding, embedding_to_bytes};
pub use memory::MemoryStore;
pub use schema::SCHEMA;
pub use sqlite::SqliteStore;

/// Default row cap for every store query.
pub const DEFAULT_LIMIT: usize = 1000;

/// Whole-photo visual embedding, one row per photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEmbedding {
    pub photo_uid: String,
    pub embedding: Vec<f32>,
    pub model_name: String,
    #[serde(default)]
    pub model_variant: Option<String>,
}

impl ImageEmbedding {
    pub const DIM: usize = 768;

    pub fn validate(&self) -> Result<()> {
        check_uid("photo_uid", &self.photo_uid)?;
        check_dim("image embedding", &self.photo_uid, &self.embedding, Self::DIM)
    }
}

/// Marker and subject state copied from the photo server at the last sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceCache {
    #[serde(default)]
    pub marker_uid: Option<String>,
    #[serde(default)]
    pub subject_uid: Option<String>,
    #[serde(default)]
    pub subject_name: Option<String>,
}

/// One detected face instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub photo_uid: String,
    pub face_index: u32,
    pub embedding: Vec<f32>,
    pub bbox: BoundingBox,
    pub confidence: f32,
    #[serde(default)]
    pub cache: FaceCache,
}

impl FaceEmbedding {
    pub const DIM: usize = 512;

    pub fn validate(&self) -> Result<()> {
        check_uid("photo_uid", &self.photo_uid)?;
        let label = format!("{}#{}", self.photo_uid, self.face_index);
        check_dim("face embedding", &label, &self.embedding, Self::DIM)?;
        check_bbox(&label, &self.bbox)
    }

    /// Whether this face has a vector worth comparing.
    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }
}

/// Representative embedding for a historical period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EraCentroid {
    pub slug: String,
    pub label: String,
    pub representative_date: NaiveDate,
    pub embedding: Vec<f32>,
    pub prompt_count: u32,
}

impl EraCentroid {
    pub fn validate(&self) -> Result<()> {
        check_uid("era slug", &self.slug)?;
        check_dim("era centroid", &self.slug, &self.embedding, ImageEmbedding::DIM)
    }
}

/// A face marker as last seen on the photo server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub marker_uid: String,
    pub photo_uid: String,
    pub bbox: BoundingBox,
    #[serde(default)]
    pub subject_uid: Option<String>,
    #[serde(default)]
    pub subject_name: Option<String>,
}

impl Marker {
    pub fn validate(&self) -> Result<()> {
        check_uid("marker_uid", &self.marker_uid)?;
        check_uid("photo_uid", &self.photo_uid)?;
        check_bbox(&self.marker_uid, &self.bbox)
    }
}

/// A person known to the photo server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub uid: String,
    pub name: String,
}

impl Subject {
    pub fn validate(&self) -> Result<()> {
        check_uid("subject uid", &self.uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub uid: String,
    pub title: String,
    #[serde(default)]
    pub photo_uids: Vec<String>,
}

impl Album {
    pub fn validate(&self) -> Result<()> {
        check_uid("album uid", &self.uid)?;
        for photo_uid in &self.photo_uids {
            check_uid("album photo_uid", photo_uid)?;
        }
        Ok(())
    }
}

/// A face returned by a nearest-neighbor query.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCandidate {
    pub face: FaceEmbedding,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageNeighbor {
    pub photo_uid: String,
    pub distance: f32,
}

/// Read side of the embedding store.
///
/// Nearest-neighbor queries return rows ordered by increasing cosine
/// distance. Rows with an empty embedding are never returned by them.
/// Implementations must tolerate concurrent readers.
pub trait EmbeddingStore: Send + Sync {
    fn get_image_embedding(&self, photo_uid: &str) -> Result<Option<ImageEmbedding>>;

    fn get_face_embeddings(&self, photo_uid: &str) -> Result<Vec<FaceEmbedding>>;

    fn query_nearest_faces(&self, vector: &[f32], limit: usize) -> Result<Vec<FaceCandidate>>;

    fn query_nearest_images(&self, vector: &[f32], limit: usize) -> Result<Vec<ImageNeighbor>>;

    fn list_era_centroids(&self) -> Result<Vec<EraCentroid>>;

    /// Look up a subject by uid, or by name ignoring case.
    fn find_subject(&self, name_or_uid: &str) -> Result<Option<Subject>>;

    fn list_subjects(&self) -> Result<Vec<Subject>>;

    /// Faces whose cached subject uid equals `subject_uid`.
    fn faces_for_subject(&self, subject_uid: &str) -> Result<Vec<FaceEmbedding>>;

    fn markers_for_photo(&self, photo_uid: &str) -> Result<Vec<Marker>>;

    /// Image embeddings ordered by photo uid, optionally restricted to one album.
    fn list_image_embeddings(&self, album_uid: Option<&str>, limit: usize)
        -> Result<Vec<ImageEmbedding>>;

    fn list_albums(&self) -> Result<Vec<Album>>;

    /// When the cached marker/subject state was last refreshed.
    fn snapshot_as_of(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Write side used by the external sync collaborator. The engine never calls it.
pub trait SnapshotWriter {
    fn upsert_image_embedding(&self, embedding: &ImageEmbedding) -> Result<()>;

    fn upsert_face_embedding(&self, face: &FaceEmbedding) -> Result<()>;

    fn upsert_era_centroid(&self, centroid: &EraCentroid) -> Result<()>;

    fn replace_subjects(&self, subjects: &[Subject]) -> Result<()>;

    fn replace_markers(&self, markers: &[Marker]) -> Result<()>;

    /// Overwrite the cached marker/subject fields of one face.
    /// Returns false when no such face exists.
    fn update_face_cache(&self, photo_uid: &str, face_index: u32, cache: &FaceCache)
        -> Result<bool>;

    fn replace_albums(&self, albums: &[Album]) -> Result<()>;

    fn set_snapshot_as_of(&self, as_of: DateTime<Utc>) -> Result<()>;
}

fn check_uid(what: &str, uid: &str) -> Result<()> {
    if uid.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn check_dim(what: &str, id: &str, v: &[f32], dim: usize) -> Result<()> {
    if v.len() != dim {
        return Err(EngineError::InvalidInput(format!(
            "{} for {} has {} dimensions, expected {}",
            what,
            id,
            v.len(),
            dim
        )));
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err(EngineError::InvalidInput(format!(
            "{} for {} contains non-finite values",
            what, id
        )));
    }
    Ok(())
}

fn check_bbox(id: &str, bbox: &BoundingBox) -> Result<()> {
    if !bbox.is_relative() {
        return Err(EngineError::InvalidInput(format!(
            "bounding box for {} is outside relative coordinates: {:?}",
            id, bbox
        )));
    }
    Ok(())
}

/// Brute-force ranking shared by both stores: skip empty vectors, sort by
/// distance then by key, keep the first `limit`.
pub(crate) fn rank_by_distance<T, K, F, G>(
    rows: impl IntoIterator<Item = T>,
    query: &[f32],
    limit: usize,
    vector: F,
    key: G,
) -> Vec<(T, f32)>
where
    F: Fn(&T) -> &[f32],
    G: Fn(&T) -> K,
    K: Ord,
{
    let mut ranked: Vec<(T, f32)> = rows
        .into_iter()
        .filter(|row| !vector(row).is_empty())
        .map(|row| {
            let d = cosine_distance(query, vector(&row));
            (row, d)
        })
        .collect();

    ranked.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| key(&a.0).cmp(&key(&b.0)))
    });
    ranked.truncate(limit);
    ranked
}
