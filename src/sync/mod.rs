//! Import of externally produced snapshots.
//!
//! Embeddings are upserted. Subjects, markers and albums replace the cached
//! copy only when the snapshot carries them. Every row is validated before
//! anything is written, so a bad snapshot leaves the store untouched.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::db::{
    Album, EraCentroid, FaceCache, FaceEmbedding, ImageEmbedding, Marker, SnapshotWriter, Subject,
};

/// Refreshed marker/subject fields for a face that is already stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceCacheUpdate {
    pub photo_uid: String,
    pub face_index: u32,
    #[serde(flatten)]
    pub cache: FaceCache,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub images: Vec<ImageEmbedding>,
    #[serde(default)]
    pub faces: Vec<FaceEmbedding>,
    #[serde(default)]
    pub era_centroids: Vec<EraCentroid>,
    #[serde(default)]
    pub face_caches: Vec<FaceCacheUpdate>,
    #[serde(default)]
    pub subjects: Option<Vec<Subject>>,
    #[serde(default)]
    pub markers: Option<Vec<Marker>>,
    #[serde(default)]
    pub albums: Option<Vec<Album>>,
    /// When the source graph was read. Defaults to import time.
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))
    }

    pub fn validate(&self) -> crate::Result<()> {
        for image in &self.images {
            image.validate()?;
        }
        for face in &self.faces {
            face.validate()?;
        }
        for era in &self.era_centroids {
            era.validate()?;
        }
        for marker in self.markers.iter().flatten() {
            marker.validate()?;
        }
        for subject in self.subjects.iter().flatten() {
            subject.validate()?;
        }
        for album in self.albums.iter().flatten() {
            album.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub images: usize,
    pub faces: usize,
    pub era_centroids: usize,
    pub face_caches: usize,
    /// Cache updates naming a face the store does not have.
    pub unknown_faces: usize,
    pub subjects: usize,
    pub markers: usize,
    pub albums: usize,
}

/// Validate and write a snapshot, then stamp the store's as-of time.
pub fn apply_snapshot(writer: &dyn SnapshotWriter, snapshot: &Snapshot) -> crate::Result<ImportStats> {
    snapshot.validate()?;
    let mut stats = ImportStats::default();

    for image in &snapshot.images {
        writer.upsert_image_embedding(image)?;
        stats.images += 1;
    }
    for face in &snapshot.faces {
        writer.upsert_face_embedding(face)?;
        stats.faces += 1;
    }
    for era in &snapshot.era_centroids {
        writer.upsert_era_centroid(era)?;
        stats.era_centroids += 1;
    }
    for update in &snapshot.face_caches {
        if writer.update_face_cache(&update.photo_uid, update.face_index, &update.cache)? {
            stats.face_caches += 1;
        } else {
            warn!(
                photo = %update.photo_uid,
                face_index = update.face_index,
                "Cache update for unknown face"
            );
            stats.unknown_faces += 1;
        }
    }
    if let Some(subjects) = &snapshot.subjects {
        writer.replace_subjects(subjects)?;
        stats.subjects = subjects.len();
    }
    if let Some(markers) = &snapshot.markers {
        writer.replace_markers(markers)?;
        stats.markers = markers.len();
    }
    if let Some(albums) = &snapshot.albums {
        writer.replace_albums(albums)?;
        stats.albums = albums.len();
    }

    writer.set_snapshot_as_of(snapshot.as_of.unwrap_or_else(Utc::now))?;
    Ok(stats)
}

/// Load a JSON snapshot file and apply it.
pub fn import_file(writer: &dyn SnapshotWriter, path: &Path) -> Result<ImportStats> {
    let snapshot = Snapshot::load(path)?;
    let stats = apply_snapshot(writer, &snapshot)
        .with_context(|| format!("Failed to import snapshot {}", path.display()))?;
    info!(
        path = %path.display(),
        images = stats.images,
        faces = stats.faces,
        eras = stats.era_centroids,
        "Snapshot imported"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::db::{EmbeddingStore, MemoryStore, SqliteStore};
    use crate::error::EngineError;
    use chrono::TimeZone;

    fn snapshot() -> Snapshot {
        let alice = subject("js1", "Alice");
        Snapshot {
            images: vec![
                image("p1", axis_vector(ImageEmbedding::DIM, 0, 0.0)),
                image("p2", axis_vector(ImageEmbedding::DIM, 1, 0.0)),
            ],
            faces: vec![
                linked_face("p1", 0, axis_vector(FaceEmbedding::DIM, 0, 0.0), &alice, "m1"),
                face("p2", 0, axis_vector(FaceEmbedding::DIM, 0, 0.1)),
            ],
            era_centroids: Vec::new(),
            face_caches: vec![FaceCacheUpdate {
                photo_uid: "p2".into(),
                face_index: 0,
                cache: FaceCache {
                    marker_uid: Some("m2".into()),
                    subject_uid: None,
                    subject_name: None,
                },
            }],
            subjects: Some(vec![alice]),
            markers: None,
            albums: Some(vec![Album {
                uid: "a1".into(),
                title: "Holiday".into(),
                photo_uids: vec!["p1".into(), "p2".into()],
            }]),
            as_of: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
        }
    }

    #[test]
    fn test_apply_snapshot() {
        let store = MemoryStore::new();
        let stats = apply_snapshot(&store, &snapshot()).unwrap();
        assert_eq!(stats.images, 2);
        assert_eq!(stats.faces, 2);
        assert_eq!(stats.face_caches, 1);
        assert_eq!(stats.subjects, 1);
        assert_eq!(stats.albums, 1);

        let faces = store.get_face_embeddings("p2").unwrap();
        assert_eq!(faces[0].cache.marker_uid.as_deref(), Some("m2"));
        assert_eq!(
            store.snapshot_as_of().unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_row_writes_nothing() {
        let store = MemoryStore::new();
        let mut bad = snapshot();
        bad.images.push(image("short", vec![1.0, 2.0]));
        assert!(matches!(
            apply_snapshot(&store, &bad),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(store.get_image_embedding("p1").unwrap().is_none());
        assert!(store.snapshot_as_of().unwrap().is_none());
    }

    #[test]
    fn test_blank_subject_or_album_uid_writes_nothing() {
        let store = MemoryStore::new();
        let mut bad = snapshot();
        bad.subjects = Some(vec![subject("", "Nobody")]);
        assert!(matches!(
            apply_snapshot(&store, &bad),
            Err(EngineError::InvalidInput(_))
        ));

        let mut bad = snapshot();
        if let Some(albums) = bad.albums.as_mut() {
            albums[0].uid = "  ".into();
        }
        assert!(matches!(
            apply_snapshot(&store, &bad),
            Err(EngineError::InvalidInput(_))
        ));

        assert!(store.get_image_embedding("p1").unwrap().is_none());
        assert!(store.list_subjects().unwrap().is_empty());
        assert!(store.list_albums().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_face_cache_counted() {
        let store = MemoryStore::new();
        let mut snap = snapshot();
        snap.face_caches[0].photo_uid = "nowhere".into();
        let stats = apply_snapshot(&store, &snap).unwrap();
        assert_eq!(stats.face_caches, 0);
        assert_eq!(stats.unknown_faces, 1);
    }

    #[test]
    fn test_import_file_into_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        fs::write(&path, serde_json::to_string(&snapshot()).unwrap()).unwrap();

        let store = SqliteStore::open_in_memory().unwrap();
        store.initialize().unwrap();
        let stats = import_file(&store, &path).unwrap();
        assert_eq!(stats.images, 2);
        assert_eq!(store.list_albums().unwrap()[0].photo_uids.len(), 2);
        assert!(store.find_subject("alice").unwrap().is_some());
    }

    #[test]
    fn test_import_missing_or_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        assert!(import_file(&store, &dir.path().join("missing.json")).is_err());

        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        let err = import_file(&store, &path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
