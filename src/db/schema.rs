pub const SCHEMA: &str = r#"
-- Whole-photo embeddings, one per photo
CREATE TABLE IF NOT EXISTS image_embeddings (
    photo_uid TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,  -- float32 array stored as bytes
    embedding_dim INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    model_variant TEXT,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_image_embeddings_model ON image_embeddings(model_name);

-- Detected faces with the marker/subject state cached at the last sync
CREATE TABLE IF NOT EXISTS face_embeddings (
    photo_uid TEXT NOT NULL,
    face_index INTEGER NOT NULL,
    embedding BLOB,
    embedding_dim INTEGER,
    bbox_x REAL NOT NULL,
    bbox_y REAL NOT NULL,
    bbox_w REAL NOT NULL,
    bbox_h REAL NOT NULL,
    confidence REAL NOT NULL,
    marker_uid TEXT,
    subject_uid TEXT,
    subject_name TEXT,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (photo_uid, face_index)
);

CREATE INDEX IF NOT EXISTS idx_face_embeddings_subject ON face_embeddings(subject_uid);

-- Era centroids built from text prompts
CREATE TABLE IF NOT EXISTS era_centroids (
    slug TEXT PRIMARY KEY,
    label TEXT NOT NULL,
    representative_date TEXT NOT NULL,  -- YYYY-MM-DD
    embedding BLOB NOT NULL,
    embedding_dim INTEGER NOT NULL,
    prompt_count INTEGER NOT NULL DEFAULT 0
);

-- Read-only copy of the photo server's people and markers
CREATE TABLE IF NOT EXISTS subjects (
    uid TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_subjects_name ON subjects(name COLLATE NOCASE);

CREATE TABLE IF NOT EXISTS markers (
    marker_uid TEXT PRIMARY KEY,
    photo_uid TEXT NOT NULL,
    bbox_x REAL NOT NULL,
    bbox_y REAL NOT NULL,
    bbox_w REAL NOT NULL,
    bbox_h REAL NOT NULL,
    subject_uid TEXT,
    subject_name TEXT
);

CREATE INDEX IF NOT EXISTS idx_markers_photo ON markers(photo_uid);

-- Album membership
CREATE TABLE IF NOT EXISTS albums (
    uid TEXT PRIMARY KEY,
    title TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS album_photos (
    album_uid TEXT NOT NULL,
    photo_uid TEXT NOT NULL,
    PRIMARY KEY (album_uid, photo_uid),
    FOREIGN KEY (album_uid) REFERENCES albums(uid) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_album_photos_photo ON album_photos(photo_uid);

-- Single-row bookkeeping for the external cache
CREATE TABLE IF NOT EXISTS sync_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    as_of TEXT NOT NULL
);
"#;
