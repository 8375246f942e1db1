use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub faces: FaceConfig,

    #[serde(default)]
    pub duplicates: DuplicateConfig,

    #[serde(default)]
    pub albums: AlbumConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceConfig {
    /// Maximum cosine distance between a face and a subject's centroid.
    #[serde(default = "default_face_distance_threshold")]
    pub distance_threshold: f32,

    /// Minimum box overlap for a face to count as an existing marker.
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Worker threads used when scanning every subject.
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,
}

fn default_face_distance_threshold() -> f32 {
    0.5
}

fn default_iou_threshold() -> f32 {
    0.1
}

fn default_scan_workers() -> usize {
    4
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            distance_threshold: default_face_distance_threshold(),
            iou_threshold: default_iou_threshold(),
            scan_workers: default_scan_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateConfig {
    /// Maximum cosine distance for two photos to be linked.
    #[serde(default = "default_duplicate_distance_threshold")]
    pub distance_threshold: f32,

    #[serde(default = "default_group_limit")]
    pub group_limit: usize,

    /// Build edges from per-photo index queries instead of comparing every pair.
    #[serde(default = "default_use_index")]
    pub use_index: bool,
}

fn default_duplicate_distance_threshold() -> f32 {
    0.10 // near-identical only; face matching is far looser
}

fn default_group_limit() -> usize {
    100
}

fn default_use_index() -> bool {
    true
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            distance_threshold: default_duplicate_distance_threshold(),
            group_limit: default_group_limit(),
            use_index: default_use_index(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlbumConfig {
    /// Minimum cosine similarity between a photo and an album centroid.
    #[serde(default = "default_album_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Albums with fewer embedded photos get no centroid.
    #[serde(default = "default_min_album_size")]
    pub min_album_size: usize,
}

fn default_album_similarity_threshold() -> f32 {
    0.30
}

fn default_top_k() -> usize {
    3
}

fn default_min_album_size() -> usize {
    2
}

impl Default for AlbumConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_album_similarity_threshold(),
            top_k: default_top_k(),
            min_album_size: default_min_album_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Row cap for every store query.
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    crate::db::DEFAULT_LIMIT
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: default_search_limit(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prismsort")
        .join("prismsort.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            faces: FaceConfig::default(),
            duplicates: DuplicateConfig::default(),
            albums: AlbumConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Config {
    /// Load from `PRISMSORT_CONFIG` or the default location, writing a
    /// default file if none exists yet.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {:?}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config {:?}", path))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("prismsort")
    }

    fn config_path() -> PathBuf {
        match std::env::var_os("PRISMSORT_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => Self::config_dir().join("config.toml"),
        }
    }
}
