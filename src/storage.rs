//! On-disk artifacts. A recording's lifecycle state lives in its path
//! suffix, and moving between states is always a rename.

use crate::error::{RecorderError, Result};
use crate::programme::Programme;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    InProgress,
    Raw,
    PostProcessed,
    Successful,
    /// Keyed by when the attempt started, so every failed attempt at the
    /// same programme keeps its own artifact.
    Failed(DateTime<Utc>),
    Metadata,
    Thumbnail,
}

impl FileState {
    pub fn suffix(self) -> String {
        match self {
            FileState::InProgress => ".inprogress".into(),
            FileState::Raw => ".raw".into(),
            FileState::PostProcessed => ".postprocessed".into(),
            FileState::Successful => String::new(),
            FileState::Failed(attempt) => format!(".{}.failed", sanitize_filename(&iso(attempt))),
            FileState::Metadata => ".metadata".into(),
            FileState::Thumbnail => ".jpg".into(),
        }
    }
}

/// Wall-clock bounds of a capture attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutcome {
    pub trimmed: bool,
    pub cropped: bool,
    pub kept_original: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Metadata<'a> {
    #[serde(flatten)]
    programme: &'a Programme,
    record_date_start: String,
    record_date_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
    #[serde(flatten)]
    outcome: RecordingOutcome,
}

fn iso(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Strips characters that are unsafe in file names on common platforms.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| {
            !c.is_control() && !matches!(c, '/' | '\\' | '?' | '<' | '>' | ':' | '*' | '|' | '"')
        })
        .collect();
    let cleaned = cleaned.trim_end_matches(['.', ' ']);
    match cleaned {
        "" | "." | ".." => "_".into(),
        _ => cleaned.into(),
    }
}

/// `title - series - airing [- subtitle].mp4`. Generic airings ("000") are
/// told apart by start time instead.
pub fn filename(programme: &Programme) -> String {
    let mut parts = vec![programme.title.clone(), programme.series_id.clone()];
    if programme.airing_id == "000" {
        parts.push(iso(programme.start_date));
    } else {
        parts.push(programme.airing_id.clone());
    }
    if !programme.subtitle.is_empty() {
        parts.push(programme.subtitle.clone());
    }
    sanitize_filename(&format!("{}.mp4", parts.join(" - "))).replace('\'', "")
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct Storage {
    save_dir: PathBuf,
}

impl Storage {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
        }
    }

    pub fn make_save_directory(&self) -> Result<&Path> {
        if !self.save_dir.is_dir() {
            debug!(dir = %self.save_dir.display(), "save directory does not exist, creating it");
            fs::create_dir_all(&self.save_dir)?;
        }
        Ok(&self.save_dir)
    }

    pub fn save_path(&self, programme: &Programme) -> PathBuf {
        self.save_dir.join(filename(programme))
    }

    pub fn path_for(&self, programme: &Programme, state: FileState) -> PathBuf {
        let mut path = self.save_path(programme).into_os_string();
        path.push(state.suffix());
        PathBuf::from(path)
    }

    pub fn in_progress_path(&self, programme: &Programme) -> PathBuf {
        self.path_for(programme, FileState::InProgress)
    }

    pub fn post_processed_path(&self, programme: &Programme) -> PathBuf {
        self.path_for(programme, FileState::PostProcessed)
    }

    /// A capture is underway or already archived.
    pub fn recording_exists(&self, programme: &Programme) -> bool {
        self.in_progress_path(programme).exists() || self.save_path(programme).exists()
    }

    pub fn rename_with_suffix(
        &self,
        programme: &Programme,
        from: FileState,
        to: FileState,
    ) -> Result<PathBuf> {
        let from = self.path_for(programme, from);
        let to = self.path_for(programme, to);
        debug!(from = %from.display(), to = %to.display(), "moving");
        fs::rename(&from, &to).map_err(|source| {
            error!(from = %from.display(), to = %to.display(), "rename failed");
            RecorderError::Rename {
                from: from.clone(),
                to: to.clone(),
                source,
            }
        })?;
        Ok(to)
    }

    pub fn remove(&self, path: &Path) -> Result<()> {
        debug!(path = %path.display(), "removing");
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn write_thumbnail(&self, programme: &Programme, data: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(programme, FileState::Thumbnail);
        fs::write(&path, data)?;
        Ok(path)
    }

    /// Writes `<artifact>.metadata` next to the artifact in `state`. Only
    /// successful artifacts are hashed.
    pub fn write_metadata(
        &self,
        programme: &Programme,
        state: FileState,
        window: RecordingWindow,
        outcome: RecordingOutcome,
    ) -> Result<PathBuf> {
        let artifact = self.path_for(programme, state);
        let sha256 = match state {
            FileState::Successful => {
                let started = Instant::now();
                let hash = sha256_file(&artifact)?;
                info!(
                    path = %artifact.display(),
                    sha256 = %hash,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "hashed"
                );
                Some(hash)
            }
            _ => None,
        };

        let metadata = Metadata {
            programme,
            record_date_start: iso(window.start),
            record_date_end: iso(window.end),
            sha256,
            outcome,
        };
        let mut path = artifact.into_os_string();
        path.push(FileState::Metadata.suffix());
        let path = PathBuf::from(path);
        debug!(path = %path.display(), "writing metadata");
        fs::write(&path, serde_json::to_string_pretty(&metadata)?)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programme::fixtures::programme;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn window() -> RecordingWindow {
        RecordingWindow {
            start: Utc.with_ymd_and_hms(2020, 11, 17, 23, 29, 20).unwrap(),
            end: Utc.with_ymd_and_hms(2020, 11, 18, 0, 0, 40).unwrap(),
        }
    }

    #[test]
    fn test_filename() {
        let mut p = programme();
        assert_eq!(filename(&p), "Direct Talk - 2058 - 520 - Building Bridges.mp4");

        p.airing_id = "000".into();
        p.subtitle.clear();
        p.title = "Japan's Top: Inventions".into();
        assert_eq!(
            filename(&p),
            "Japans Top Inventions - 2058 - 2020-11-17T233000.000Z.mp4"
        );
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b\\c?*"), "abc");
        assert_eq!(sanitize_filename("trailing. "), "trailing");
        assert_eq!(sanitize_filename(".."), "_");
    }

    #[test]
    fn test_state_paths() {
        let storage = Storage::new("/rec");
        let p = programme();
        let base = "/rec/Direct Talk - 2058 - 520 - Building Bridges.mp4";
        assert_eq!(storage.in_progress_path(&p), PathBuf::from(format!("{base}.inprogress")));
        assert_eq!(storage.path_for(&p, FileState::Raw), PathBuf::from(format!("{base}.raw")));
        assert_eq!(
            storage.path_for(&p, FileState::Failed(window().start)),
            PathBuf::from(format!("{base}.2020-11-17T232920.000Z.failed"))
        );
        assert_eq!(storage.path_for(&p, FileState::Successful), PathBuf::from(base));
    }

    #[test]
    fn test_rename_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let p = programme();
        fs::write(storage.in_progress_path(&p), b"data").unwrap();
        assert!(storage.recording_exists(&p));

        let attempt = FileState::Failed(window().start);
        let failed = storage
            .rename_with_suffix(&p, FileState::InProgress, attempt)
            .unwrap();
        assert!(failed.exists());
        assert!(!storage.recording_exists(&p));

        let back = storage
            .rename_with_suffix(&p, attempt, FileState::InProgress)
            .unwrap();
        assert_eq!(back, storage.in_progress_path(&p));
        assert_eq!(fs::read(&back).unwrap(), b"data");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_rename_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let err = storage
            .rename_with_suffix(&programme(), FileState::InProgress, FileState::Successful)
            .unwrap_err();
        assert_matches!(err, RecorderError::Rename { .. });
    }

    #[test]
    fn test_write_metadata_successful() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let p = programme();
        fs::write(storage.save_path(&p), b"abc").unwrap();

        let outcome = RecordingOutcome { trimmed: true, ..Default::default() };
        let path = storage
            .write_metadata(&p, FileState::Successful, window(), outcome)
            .unwrap();
        assert!(path.to_string_lossy().ends_with("Building Bridges.mp4.metadata"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(
            json["sha256"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(json["seriesId"], "2058");
        assert_eq!(json["recordDateStart"], "2020-11-17T23:29:20.000Z");
        assert_eq!(json["trimmed"], true);
        assert_eq!(json["keptOriginal"], false);
    }

    #[test]
    fn test_write_metadata_failed_has_no_hash() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let p = programme();
        let path = storage
            .write_metadata(
                &p,
                FileState::Failed(window().start),
                window(),
                RecordingOutcome::default(),
            )
            .unwrap();
        assert!(path.to_string_lossy().ends_with("T232920.000Z.failed.metadata"));
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert!(json.get("sha256").is_none());
        assert_eq!(json["title"], "Direct Talk");
    }

    #[test]
    fn test_make_save_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("nested/recordings"));
        assert!(storage.make_save_directory().unwrap().is_dir());
    }
}
