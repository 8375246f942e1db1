use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use crate::albums::AlbumSuggestionResponse;
use crate::db::ImageNeighbor;
use crate::duplicates::DuplicateResponse;
use crate::era::EraEstimate;
use crate::faces::{ReconcileResponse, ScanSummary};

/// Export format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "JSON",
            ExportFormat::Csv => "CSV",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(anyhow!("unknown output format {:?} (expected json or csv)", other)),
        }
    }
}

/// An engine response that can also be flattened into CSV rows.
pub trait Report: Serialize {
    fn headers(&self) -> &'static [&'static str];
    fn rows(&self) -> Vec<Vec<String>>;
}

/// Render a report as pretty JSON or as CSV with a header row.
pub fn render<R: Report + ?Sized>(report: &R, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(report).context("Failed to serialize report as JSON")
        }
        ExportFormat::Csv => render_csv(report),
    }
}

/// Write a rendered report to `output_path`. Returns the number of CSV rows.
pub fn export_report<R: Report + ?Sized>(
    report: &R,
    output_path: &Path,
    format: ExportFormat,
) -> Result<usize> {
    let rendered = render(report, format)?;
    let mut file = File::create(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    file.write_all(rendered.as_bytes())?;
    Ok(report.rows().len())
}

fn render_csv<R: Report + ?Sized>(report: &R) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(report.headers())?;
    for row in report.rows() {
        wtr.write_record(&row)?;
    }
    let bytes = wtr.into_inner().map_err(|e| e.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn score(value: f32) -> String {
    format!("{:.4}", value)
}

impl Report for ReconcileResponse {
    fn headers(&self) -> &'static [&'static str] {
        &[
            "subject_name",
            "photo_uid",
            "face_index",
            "action",
            "distance",
            "marker_uid",
            "current_subject_uid",
            "current_subject_name",
            "x",
            "y",
            "width",
            "height",
        ]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        self.matches
            .iter()
            .map(|m| {
                vec![
                    self.subject_name.clone(),
                    m.photo_uid.clone(),
                    m.face_index.to_string(),
                    m.action.as_str().to_string(),
                    score(m.distance),
                    opt(&m.marker_uid),
                    opt(&m.subject_uid),
                    opt(&m.subject_name),
                    m.bbox_rel.x.to_string(),
                    m.bbox_rel.y.to_string(),
                    m.bbox_rel.width.to_string(),
                    m.bbox_rel.height.to_string(),
                ]
            })
            .collect()
    }
}

impl Report for DuplicateResponse {
    fn headers(&self) -> &'static [&'static str] {
        &["group", "group_size", "photo_uid"]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        self.groups
            .iter()
            .enumerate()
            .flat_map(|(i, group)| {
                let size = group.photo_uids.len().to_string();
                group
                    .photo_uids
                    .iter()
                    .map(move |uid| vec![(i + 1).to_string(), size.clone(), uid.clone()])
            })
            .collect()
    }
}

impl Report for AlbumSuggestionResponse {
    fn headers(&self) -> &'static [&'static str] {
        &["photo_uid", "rank", "album_uid", "album_title", "similarity"]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        self.suggestions
            .iter()
            .flat_map(|s| {
                s.albums.iter().enumerate().map(move |(rank, a)| {
                    vec![
                        s.photo_uid.clone(),
                        (rank + 1).to_string(),
                        a.album_uid.clone(),
                        a.album_title.clone(),
                        score(a.similarity),
                    ]
                })
            })
            .collect()
    }
}

impl Report for EraEstimate {
    fn headers(&self) -> &'static [&'static str] {
        &["era_slug", "era_name", "representative_date", "similarity"]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        vec![vec![
            self.era_slug.clone(),
            self.era_name.clone(),
            self.representative_date.to_string(),
            score(self.similarity),
        ]]
    }
}

impl Report for [ScanSummary] {
    fn headers(&self) -> &'static [&'static str] {
        &[
            "subject_uid",
            "subject_name",
            "create_marker",
            "assign_person",
            "already_done",
            "unassign_person",
            "pending",
            "error",
        ]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        self.iter()
            .map(|s| {
                vec![
                    s.subject_uid.clone(),
                    s.subject_name.clone(),
                    s.summary.create_marker.to_string(),
                    s.summary.assign_person.to_string(),
                    s.summary.already_done.to_string(),
                    s.summary.unassign_person.to_string(),
                    s.pending.to_string(),
                    opt(&s.error),
                ]
            })
            .collect()
    }
}

impl Report for [ImageNeighbor] {
    fn headers(&self) -> &'static [&'static str] {
        &["photo_uid", "distance"]
    }

    fn rows(&self) -> Vec<Vec<String>> {
        self.iter()
            .map(|n| vec![n.photo_uid.clone(), score(n.distance)])
            .collect()
    }
}
