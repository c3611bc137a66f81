//! Knowledge ingestion: markdown files become classified observations.
//!
//! Re-ingestion uses a full soft-delete+recreate per source file: all live
//! observations from `ingest:<file>` are soft-deleted, then the file's
//! current sections are recreated. Running twice over unchanged input
//! yields `sections_created == sections_removed`.

use crate::models::{Classification, Kind, NewObservation};
use crate::rendering::clip_chars;
use crate::storage::{ListOptions, ObservationStore};
use crate::Result;
use std::path::Path;

/// Counters returned to the tool surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Markdown files processed.
    pub files_processed: usize,
    /// Sections created as observations.
    pub sections_created: usize,
    /// Prior observations soft-deleted.
    pub sections_removed: usize,
}

/// Ingests every `.md` file directly inside `directory`.
///
/// # Errors
///
/// Returns a storage error when writes fail; unreadable files are skipped
/// with a warning.
pub fn ingest_directory(store: &ObservationStore, directory: &Path) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(directory = %directory.display(), error = %e, "ingest directory unreadable");
            return Ok(report);
        },
    };

    let mut files: Vec<std::path::PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();

    for path in files {
        let Ok(raw) = std::fs::read_to_string(&path) else {
            tracing::warn!(file = %path.display(), "ingest file unreadable, skipped");
            continue;
        };
        let file_name = path
            .file_name()
            .map_or_else(|| "unknown.md".to_string(), |n| n.to_string_lossy().to_string());
        let file_report = ingest_file(store, &file_name, &raw)?;
        report.files_processed += 1;
        report.sections_created += file_report.sections_created;
        report.sections_removed += file_report.sections_removed;
    }
    Ok(report)
}

/// Ingests one file's content under `ingest:<file_name>`.
///
/// # Errors
///
/// Returns a storage error when writes fail.
pub fn ingest_file(
    store: &ObservationStore,
    file_name: &str,
    content: &str,
) -> Result<IngestReport> {
    let source = format!("ingest:{file_name}");
    let mut report = IngestReport { files_processed: 1, ..Default::default() };

    // Full soft-delete+recreate: the live set for this source becomes
    // exactly the file's current sections.
    let existing = store.list(&ListOptions {
        source_prefix: Some(source.clone()),
        limit: 10_000,
        include_purged: true,
        ..Default::default()
    })?;
    for observation in &existing {
        if observation.source == source && store.soft_delete(&observation.id)? {
            report.sections_removed += 1;
        }
    }

    for section in split_sections(content) {
        store.create_classified(
            NewObservation {
                session_id: None,
                title: section.title.map(|t| clip_chars(&t, 180)),
                content: section.body,
                source: source.clone(),
                kind: Some(Kind::Reference),
            },
            Classification::Discovery,
        )?;
        report.sections_created += 1;
    }
    Ok(report)
}

struct Section {
    title: Option<String>,
    body: String,
}

/// Splits markdown into heading-delimited sections. Content before the
/// first heading becomes an untitled section.
fn split_sections(content: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut title: Option<String> = None;
    let mut body: Vec<&str> = Vec::new();

    let mut flush = |title: &mut Option<String>, body: &mut Vec<&str>, out: &mut Vec<Section>| {
        let text = body.join("\n").trim().to_string();
        if !text.is_empty() {
            out.push(Section {
                title: title.clone(),
                body: text,
            });
        }
        body.clear();
    };

    for line in content.lines() {
        if let Some(heading) = line.strip_prefix('#') {
            flush(&mut title, &mut body, &mut sections);
            title = Some(heading.trim_start_matches('#').trim().to_string());
        } else {
            body.push(line);
        }
    }
    flush(&mut title, &mut body, &mut sections);
    sections
}
