//! SQLite backend implementation.
//!
//! Nearest-neighbor queries are a brute-force scan over the stored blobs;
//! they honour the same ordering contract an ANN index would.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::embeddings::{bytes_to_embedding, embedding_to_bytes};
use super::schema::SCHEMA;
use super::{
    rank_by_distance, Album, EmbeddingStore, EraCentroid, FaceCache, FaceCandidate,
    FaceEmbedding, ImageEmbedding, ImageNeighbor, Marker, SnapshotWriter, Subject,
};
use crate::error::{EngineError, Result};
use crate::similarity::BoundingBox;

const FACE_COLUMNS: &str = "photo_uid, face_index, embedding, bbox_x, bbox_y, bbox_w, bbox_h, \
                            confidence, marker_uid, subject_uid, subject_name";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::StoreUnavailable(format!("cannot create {:?}: {}", parent, e))
            })?;
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn count_image_embeddings(&self) -> Result<i64> {
        let conn = self.conn.lock()?;
        let count = conn.query_row("SELECT COUNT(*) FROM image_embeddings", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_face_embeddings(&self) -> Result<i64> {
        let conn = self.conn.lock()?;
        let count = conn.query_row("SELECT COUNT(*) FROM face_embeddings", [], |row| row.get(0))?;
        Ok(count)
    }

    fn query_faces(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<FaceEmbedding>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let faces = stmt
            .query_map(args, row_to_face)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(faces)
    }

    fn query_images(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<ImageEmbedding>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let images = stmt
            .query_map(args, row_to_image)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(images)
    }
}

fn row_to_face(row: &Row) -> rusqlite::Result<FaceEmbedding> {
    let bytes: Option<Vec<u8>> = row.get(2)?;
    Ok(FaceEmbedding {
        photo_uid: row.get(0)?,
        face_index: row.get(1)?,
        embedding: bytes.map(|b| bytes_to_embedding(&b)).unwrap_or_default(),
        bbox: BoundingBox {
            x: row.get(3)?,
            y: row.get(4)?,
            width: row.get(5)?,
            height: row.get(6)?,
        },
        confidence: row.get(7)?,
        cache: FaceCache {
            marker_uid: row.get(8)?,
            subject_uid: row.get(9)?,
            subject_name: row.get(10)?,
        },
    })
}

fn row_to_image(row: &Row) -> rusqlite::Result<ImageEmbedding> {
    let bytes: Vec<u8> = row.get(1)?;
    Ok(ImageEmbedding {
        photo_uid: row.get(0)?,
        embedding: bytes_to_embedding(&bytes),
        model_name: row.get(2)?,
        model_variant: row.get(3)?,
    })
}

fn row_to_marker(row: &Row) -> rusqlite::Result<Marker> {
    Ok(Marker {
        marker_uid: row.get(0)?,
        photo_uid: row.get(1)?,
        bbox: BoundingBox {
            x: row.get(2)?,
            y: row.get(3)?,
            width: row.get(4)?,
            height: row.get(5)?,
        },
        subject_uid: row.get(6)?,
        subject_name: row.get(7)?,
    })
}

fn parse_date(slug: &str, raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
        EngineError::InvalidInput(format!("era {} has unreadable date {:?}: {}", slug, raw, e))
    })
}

impl EmbeddingStore for SqliteStore {
    fn get_image_embedding(&self, photo_uid: &str) -> Result<Option<ImageEmbedding>> {
        let conn = self.conn.lock()?;
        let result = conn
            .query_row(
                "SELECT photo_uid, embedding, model_name, model_variant \
                 FROM image_embeddings WHERE photo_uid = ?",
                [photo_uid],
                row_to_image,
            )
            .optional()?;
        Ok(result)
    }

    fn get_face_embeddings(&self, photo_uid: &str) -> Result<Vec<FaceEmbedding>> {
        let sql = format!(
            "SELECT {} FROM face_embeddings WHERE photo_uid = ? ORDER BY face_index",
            FACE_COLUMNS
        );
        self.query_faces(&sql, &[&photo_uid])
    }

    fn query_nearest_faces(&self, vector: &[f32], limit: usize) -> Result<Vec<FaceCandidate>> {
        let sql = format!(
            "SELECT {} FROM face_embeddings WHERE embedding IS NOT NULL",
            FACE_COLUMNS
        );
        let faces = self.query_faces(&sql, &[])?;
        let ranked = rank_by_distance(
            faces,
            vector,
            limit,
            |f| f.embedding.as_slice(),
            |f| (f.photo_uid.clone(), f.face_index),
        );
        Ok(ranked
            .into_iter()
            .map(|(face, distance)| FaceCandidate { face, distance })
            .collect())
    }

    fn query_nearest_images(&self, vector: &[f32], limit: usize) -> Result<Vec<ImageNeighbor>> {
        let images = self.query_images(
            "SELECT photo_uid, embedding, model_name, model_variant FROM image_embeddings",
            &[],
        )?;
        let ranked = rank_by_distance(
            images,
            vector,
            limit,
            |i| i.embedding.as_slice(),
            |i| i.photo_uid.clone(),
        );
        Ok(ranked
            .into_iter()
            .map(|(image, distance)| ImageNeighbor {
                photo_uid: image.photo_uid,
                distance,
            })
            .collect())
    }

    fn list_era_centroids(&self) -> Result<Vec<EraCentroid>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT slug, label, representative_date, embedding, prompt_count \
             FROM era_centroids ORDER BY representative_date, slug",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(3)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    bytes_to_embedding(&bytes),
                    row.get::<_, u32>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(slug, label, date, embedding, prompt_count)| {
                let representative_date = parse_date(&slug, &date)?;
                Ok(EraCentroid {
                    slug,
                    label,
                    representative_date,
                    embedding,
                    prompt_count,
                })
            })
            .collect()
    }

    fn find_subject(&self, name_or_uid: &str) -> Result<Option<Subject>> {
        let conn = self.conn.lock()?;
        let row_to_subject = |row: &Row| -> rusqlite::Result<Subject> {
            Ok(Subject {
                uid: row.get(0)?,
                name: row.get(1)?,
            })
        };
        let by_uid = conn
            .query_row(
                "SELECT uid, name FROM subjects WHERE uid = ?",
                [name_or_uid],
                row_to_subject,
            )
            .optional()?;
        if by_uid.is_some() {
            return Ok(by_uid);
        }

        // SQLite's LOWER only folds ASCII, so names are compared here
        let wanted = name_or_uid.to_lowercase();
        let mut stmt = conn.prepare("SELECT uid, name FROM subjects ORDER BY uid")?;
        let subjects = stmt
            .query_map([], row_to_subject)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subjects
            .into_iter()
            .find(|s| s.name.to_lowercase() == wanted))
    }

    fn list_subjects(&self) -> Result<Vec<Subject>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare("SELECT uid, name FROM subjects ORDER BY name, uid")?;
        let subjects = stmt
            .query_map([], |row| {
                Ok(Subject {
                    uid: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(subjects)
    }

    fn faces_for_subject(&self, subject_uid: &str) -> Result<Vec<FaceEmbedding>> {
        let sql = format!(
            "SELECT {} FROM face_embeddings WHERE subject_uid = ? ORDER BY photo_uid, face_index",
            FACE_COLUMNS
        );
        self.query_faces(&sql, &[&subject_uid])
    }

    fn markers_for_photo(&self, photo_uid: &str) -> Result<Vec<Marker>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT marker_uid, photo_uid, bbox_x, bbox_y, bbox_w, bbox_h, subject_uid, subject_name \
             FROM markers WHERE photo_uid = ? ORDER BY marker_uid",
        )?;
        let markers = stmt
            .query_map([photo_uid], row_to_marker)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(markers)
    }

    fn list_image_embeddings(
        &self,
        album_uid: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ImageEmbedding>> {
        let limit = limit as i64;
        match album_uid {
            Some(album) => self.query_images(
                r#"
                SELECT e.photo_uid, e.embedding, e.model_name, e.model_variant
                FROM image_embeddings e
                JOIN album_photos a ON a.photo_uid = e.photo_uid
                WHERE a.album_uid = ?
                ORDER BY e.photo_uid
                LIMIT ?
                "#,
                &[&album, &limit],
            ),
            None => self.query_images(
                "SELECT photo_uid, embedding, model_name, model_variant \
                 FROM image_embeddings ORDER BY photo_uid LIMIT ?",
                &[&limit],
            ),
        }
    }

    fn list_albums(&self) -> Result<Vec<Album>> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare("SELECT uid, title FROM albums ORDER BY uid")?;
        let mut albums = stmt
            .query_map([], |row| {
                Ok(Album {
                    uid: row.get(0)?,
                    title: row.get(1)?,
                    photo_uids: Vec::new(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut members = conn.prepare(
            "SELECT photo_uid FROM album_photos WHERE album_uid = ? ORDER BY photo_uid",
        )?;
        for album in albums.iter_mut() {
            album.photo_uids = members
                .query_map([&album.uid], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
        }
        Ok(albums)
    }

    fn snapshot_as_of(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock()?;
        let raw: Option<String> = conn
            .query_row("SELECT as_of FROM sync_state WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match raw {
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| EngineError::InvalidInput(format!("bad sync timestamp {:?}: {}", s, e))),
            None => Ok(None),
        }
    }
}

impl SnapshotWriter for SqliteStore {
    fn upsert_image_embedding(&self, embedding: &ImageEmbedding) -> Result<()> {
        embedding.validate()?;
        let conn = self.conn.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO image_embeddings
                (photo_uid, embedding, embedding_dim, model_name, model_variant, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            "#,
            params![
                embedding.photo_uid,
                embedding_to_bytes(&embedding.embedding),
                embedding.embedding.len() as i64,
                embedding.model_name,
                embedding.model_variant,
            ],
        )?;
        Ok(())
    }

    fn upsert_face_embedding(&self, face: &FaceEmbedding) -> Result<()> {
        face.validate()?;
        let conn = self.conn.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO face_embeddings
                (photo_uid, face_index, embedding, embedding_dim, bbox_x, bbox_y, bbox_w, bbox_h,
                 confidence, marker_uid, subject_uid, subject_name, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            "#,
            params![
                face.photo_uid,
                face.face_index,
                embedding_to_bytes(&face.embedding),
                face.embedding.len() as i64,
                face.bbox.x,
                face.bbox.y,
                face.bbox.width,
                face.bbox.height,
                face.confidence,
                face.cache.marker_uid,
                face.cache.subject_uid,
                face.cache.subject_name,
            ],
        )?;
        Ok(())
    }

    fn upsert_era_centroid(&self, centroid: &EraCentroid) -> Result<()> {
        centroid.validate()?;
        let conn = self.conn.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO era_centroids
                (slug, label, representative_date, embedding, embedding_dim, prompt_count)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                centroid.slug,
                centroid.label,
                centroid.representative_date.format("%Y-%m-%d").to_string(),
                embedding_to_bytes(&centroid.embedding),
                centroid.embedding.len() as i64,
                centroid.prompt_count,
            ],
        )?;
        Ok(())
    }

    fn replace_subjects(&self, subjects: &[Subject]) -> Result<()> {
        for s in subjects {
            s.validate()?;
        }
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM subjects", [])?;
        for s in subjects {
            tx.execute(
                "INSERT OR REPLACE INTO subjects (uid, name) VALUES (?, ?)",
                params![s.uid, s.name],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn replace_markers(&self, markers: &[Marker]) -> Result<()> {
        for m in markers {
            m.validate()?;
        }
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM markers", [])?;
        for m in markers {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO markers
                    (marker_uid, photo_uid, bbox_x, bbox_y, bbox_w, bbox_h, subject_uid, subject_name)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    m.marker_uid,
                    m.photo_uid,
                    m.bbox.x,
                    m.bbox.y,
                    m.bbox.width,
                    m.bbox.height,
                    m.subject_uid,
                    m.subject_name,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update_face_cache(&self, photo_uid: &str, face_index: u32, cache: &FaceCache) -> Result<bool> {
        let conn = self.conn.lock()?;
        let changed = conn.execute(
            r#"
            UPDATE face_embeddings
            SET marker_uid = ?, subject_uid = ?, subject_name = ?, updated_at = CURRENT_TIMESTAMP
            WHERE photo_uid = ? AND face_index = ?
            "#,
            params![
                cache.marker_uid,
                cache.subject_uid,
                cache.subject_name,
                photo_uid,
                face_index,
            ],
        )?;
        Ok(changed > 0)
    }

    fn replace_albums(&self, albums: &[Album]) -> Result<()> {
        for a in albums {
            a.validate()?;
        }
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM album_photos", [])?;
        tx.execute("DELETE FROM albums", [])?;
        for album in albums {
            tx.execute(
                "INSERT OR REPLACE INTO albums (uid, title) VALUES (?, ?)",
                params![album.uid, album.title],
            )?;
            for photo_uid in &album.photo_uids {
                tx.execute(
                    "INSERT OR IGNORE INTO album_photos (album_uid, photo_uid) VALUES (?, ?)",
                    params![album.uid, photo_uid],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn set_snapshot_as_of(&self, as_of: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_state (id, as_of) VALUES (1, ?)",
            [as_of.to_rfc3339()],
        )?;
        Ok(())
    }
}
