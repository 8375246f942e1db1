//! In-memory embedding store for embedders and tests.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{
    rank_by_distance, Album, EmbeddingStore, EraCentroid, FaceCache, FaceCandidate,
    FaceEmbedding, ImageEmbedding, ImageNeighbor, Marker, SnapshotWriter, Subject,
};
use crate::error::Result;

#[derive(Default)]
struct Inner {
    images: BTreeMap<String, ImageEmbedding>,
    faces: BTreeMap<(String, u32), FaceEmbedding>,
    eras: BTreeMap<String, EraCentroid>,
    subjects: BTreeMap<String, Subject>,
    markers: BTreeMap<String, Marker>,
    albums: BTreeMap<String, Album>,
    as_of: Option<DateTime<Utc>>,
}

/// Keeps every row in ordered maps behind a read-write lock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmbeddingStore for MemoryStore {
    fn get_image_embedding(&self, photo_uid: &str) -> Result<Option<ImageEmbedding>> {
        Ok(self.inner.read()?.images.get(photo_uid).cloned())
    }

    fn get_face_embeddings(&self, photo_uid: &str) -> Result<Vec<FaceEmbedding>> {
        let inner = self.inner.read()?;
        Ok(inner
            .faces
            .values()
            .filter(|f| f.photo_uid == photo_uid)
            .cloned()
            .collect())
    }

    fn query_nearest_faces(&self, vector: &[f32], limit: usize) -> Result<Vec<FaceCandidate>> {
        let inner = self.inner.read()?;
        let ranked = rank_by_distance(
            inner.faces.values(),
            vector,
            limit,
            |f| f.embedding.as_slice(),
            |f| (f.photo_uid.clone(), f.face_index),
        );
        Ok(ranked
            .into_iter()
            .map(|(face, distance)| FaceCandidate {
                face: face.clone(),
                distance,
            })
            .collect())
    }

    fn query_nearest_images(&self, vector: &[f32], limit: usize) -> Result<Vec<ImageNeighbor>> {
        let inner = self.inner.read()?;
        let ranked = rank_by_distance(
            inner.images.values(),
            vector,
            limit,
            |i| i.embedding.as_slice(),
            |i| i.photo_uid.clone(),
        );
        Ok(ranked
            .into_iter()
            .map(|(image, distance)| ImageNeighbor {
                photo_uid: image.photo_uid.clone(),
                distance,
            })
            .collect())
    }

    fn list_era_centroids(&self) -> Result<Vec<EraCentroid>> {
        let inner = self.inner.read()?;
        let mut eras: Vec<EraCentroid> = inner.eras.values().cloned().collect();
        eras.sort_by(|a, b| {
            a.representative_date
                .cmp(&b.representative_date)
                .then_with(|| a.slug.cmp(&b.slug))
        });
        Ok(eras)
    }

    fn find_subject(&self, name_or_uid: &str) -> Result<Option<Subject>> {
        let inner = self.inner.read()?;
        if let Some(s) = inner.subjects.get(name_or_uid) {
            return Ok(Some(s.clone()));
        }
        let wanted = name_or_uid.to_lowercase();
        Ok(inner
            .subjects
            .values()
            .find(|s| s.name.to_lowercase() == wanted)
            .cloned())
    }

    fn list_subjects(&self) -> Result<Vec<Subject>> {
        let inner = self.inner.read()?;
        let mut subjects: Vec<Subject> = inner.subjects.values().cloned().collect();
        subjects.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.uid.cmp(&b.uid)));
        Ok(subjects)
    }

    fn faces_for_subject(&self, subject_uid: &str) -> Result<Vec<FaceEmbedding>> {
        let inner = self.inner.read()?;
        Ok(inner
            .faces
            .values()
            .filter(|f| f.cache.subject_uid.as_deref() == Some(subject_uid))
            .cloned()
            .collect())
    }

    fn markers_for_photo(&self, photo_uid: &str) -> Result<Vec<Marker>> {
        let inner = self.inner.read()?;
        Ok(inner
            .markers
            .values()
            .filter(|m| m.photo_uid == photo_uid)
            .cloned()
            .collect())
    }

    fn list_image_embeddings(
        &self,
        album_uid: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ImageEmbedding>> {
        let inner = self.inner.read()?;
        let images = match album_uid {
            Some(uid) => match inner.albums.get(uid) {
                Some(album) => {
                    let mut members: Vec<&String> = album.photo_uids.iter().collect();
                    members.sort();
                    members.dedup();
                    members
                        .into_iter()
                        .filter_map(|p| inner.images.get(p.as_str()).cloned())
                        .take(limit)
                        .collect()
                }
                None => Vec::new(),
            },
            None => inner.images.values().take(limit).cloned().collect(),
        };
        Ok(images)
    }

    fn list_albums(&self) -> Result<Vec<Album>> {
        let inner = self.inner.read()?;
        Ok(inner
            .albums
            .values()
            .map(|a| {
                let mut album = a.clone();
                album.photo_uids.sort();
                album.photo_uids.dedup();
                album
            })
            .collect())
    }

    fn snapshot_as_of(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.inner.read()?.as_of)
    }
}

impl SnapshotWriter for MemoryStore {
    fn upsert_image_embedding(&self, embedding: &ImageEmbedding) -> Result<()> {
        embedding.validate()?;
        self.inner
            .write()?
            .images
            .insert(embedding.photo_uid.clone(), embedding.clone());
        Ok(())
    }

    fn upsert_face_embedding(&self, face: &FaceEmbedding) -> Result<()> {
        face.validate()?;
        self.inner
            .write()?
            .faces
            .insert((face.photo_uid.clone(), face.face_index), face.clone());
        Ok(())
    }

    fn upsert_era_centroid(&self, centroid: &EraCentroid) -> Result<()> {
        centroid.validate()?;
        self.inner
            .write()?
            .eras
            .insert(centroid.slug.clone(), centroid.clone());
        Ok(())
    }

    fn replace_subjects(&self, subjects: &[Subject]) -> Result<()> {
        for s in subjects {
            s.validate()?;
        }
        let mut inner = self.inner.write()?;
        inner.subjects = subjects.iter().map(|s| (s.uid.clone(), s.clone())).collect();
        Ok(())
    }

    fn replace_markers(&self, markers: &[Marker]) -> Result<()> {
        for m in markers {
            m.validate()?;
        }
        let mut inner = self.inner.write()?;
        inner.markers = markers
            .iter()
            .map(|m| (m.marker_uid.clone(), m.clone()))
            .collect();
        Ok(())
    }

    fn update_face_cache(&self, photo_uid: &str, face_index: u32, cache: &FaceCache) -> Result<bool> {
        let mut inner = self.inner.write()?;
        match inner.faces.get_mut(&(photo_uid.to_string(), face_index)) {
            Some(face) => {
                face.cache = cache.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn replace_albums(&self, albums: &[Album]) -> Result<()> {
        for a in albums {
            a.validate()?;
        }
        let mut inner = self.inner.write()?;
        inner.albums = albums.iter().map(|a| (a.uid.clone(), a.clone())).collect();
        Ok(())
    }

    fn set_snapshot_as_of(&self, as_of: DateTime<Utc>) -> Result<()> {
        self.inner.write()?.as_of = Some(as_of);
        Ok(())
    }
}
