use crate::cli::{DetectionConfig, PostProcessConfig};
use crate::crop::find_crop_parameters;
use crate::error::{RecorderError, Result};
use crate::ffmpeg::MediaTool;
use crate::programme::Programme;
use crate::storage::{FileState, RecordingOutcome, RecordingWindow, Storage};
use crate::trim::{TrimParameters, find_trim_parameters};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Capturing,
    Validating,
    PostProcessing,
    Archiving,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub safety_buffer_ms: u64,
    pub post_process: PostProcessConfig,
    pub detection: DetectionConfig,
}

/// How long to capture so the recording overruns the scheduled end by the
/// safety buffer.
pub fn target_duration(
    programme: &Programme,
    now: DateTime<Utc>,
    safety_buffer_ms: u64,
) -> Duration {
    let remaining = (programme.end_date - now).num_milliseconds() + safety_buffer_ms as i64;
    Duration::from_millis(remaining.max(0) as u64)
}

/// Drives one programme from capture to an archived artifact. Every attempt
/// ends as either [`FileState::Successful`] or [`FileState::Failed`], the
/// latter keyed by the attempt's start time.
pub struct Recorder<T> {
    pub tool: T,
    pub storage: Storage,
    pub settings: RecorderSettings,
}

impl<T: MediaTool> Recorder<T> {
    pub fn new(tool: T, storage: Storage, settings: RecorderSettings) -> Self {
        Self {
            tool,
            storage,
            settings,
        }
    }

    pub fn record(&self, programme: &Programme, thumbnail: Option<Vec<u8>>) -> FileState {
        let start = Utc::now();
        let target = target_duration(programme, start, self.settings.safety_buffer_ms);
        let path = self.storage.in_progress_path(programme);
        info!(
            stage = ?Stage::Capturing,
            title = %programme.title,
            seconds = target.as_secs_f64(),
            "recording"
        );

        match self.capture_and_archive(programme, &path, target, start, thumbnail.as_deref()) {
            Ok(outcome) => {
                info!(title = %programme.title, ?outcome, "recording archived");
                FileState::Successful
            }
            Err(err) => {
                self.fail(programme, &path, start, &err);
                FileState::Failed(start)
            }
        }
    }

    fn capture_and_archive(
        &self,
        programme: &Programme,
        path: &Path,
        target: Duration,
        start: DateTime<Utc>,
        thumbnail: Option<&[u8]>,
    ) -> Result<RecordingOutcome> {
        self.tool.capture(path, programme, target, thumbnail)?;
        let window = RecordingWindow {
            start,
            end: Utc::now(),
        };
        info!(path = %path.display(), "finished recording");

        let expected_ms = programme.scheduled_duration_ms();
        let actual_ms = self.tool.probe_duration_ms(path)?;
        debug!(stage = ?Stage::Validating, actual_ms, expected_ms, "probed capture");
        if actual_ms <= expected_ms {
            return Err(RecorderError::Validation(format!(
                "recording is {actual_ms} ms, expected more than {expected_ms} ms"
            )));
        }

        let processed = if self.settings.post_process.enabled() {
            let output = self.storage.post_processed_path(programme);
            self.try_post_process(path, &output, actual_ms)
        } else {
            None
        };

        info!(stage = ?Stage::Archiving, processed = processed.is_some(), "archiving");
        let outcome = self.archive(programme, processed)?;

        // The recording is archived from here on; later errors only lose extras.
        if let Some(data) = thumbnail {
            if let Err(err) = self.storage.write_thumbnail(programme, data) {
                warn!(%err, "failed to write thumbnail");
            }
        }
        if let Err(err) = self
            .storage
            .write_metadata(programme, FileState::Successful, window, outcome)
        {
            error!(%err, "failed to write metadata for archived recording");
        }
        Ok(outcome)
    }

    /// Moves the processed file into place, or the untouched capture when
    /// there is none or it cannot be moved.
    fn archive(
        &self,
        programme: &Programme,
        processed: Option<RecordingOutcome>,
    ) -> Result<RecordingOutcome> {
        if let Some(outcome) = processed {
            match self.storage.rename_with_suffix(
                programme,
                FileState::PostProcessed,
                FileState::Successful,
            ) {
                Ok(_) => return Ok(self.dispose_original(programme, outcome)),
                Err(err) => {
                    warn!(%err, "could not archive processed file, archiving original capture");
                    let output = self.storage.post_processed_path(programme);
                    if let Err(err) = self.storage.remove(&output) {
                        warn!(%err, "failed to remove processed file");
                    }
                }
            }
        }
        self.storage
            .rename_with_suffix(programme, FileState::InProgress, FileState::Successful)?;
        Ok(RecordingOutcome::default())
    }

    fn dispose_original(
        &self,
        programme: &Programme,
        mut outcome: RecordingOutcome,
    ) -> RecordingOutcome {
        if self.settings.post_process.keep_original {
            outcome.kept_original = self
                .storage
                .rename_with_suffix(programme, FileState::InProgress, FileState::Raw)
                .is_ok();
        } else if let Err(err) = self.storage.remove(&self.storage.in_progress_path(programme)) {
            warn!(%err, "failed to remove original capture");
        }
        outcome
    }

    /// Post-processing never fails a recording: on any error the partial
    /// output is removed and the caller archives the untouched capture.
    fn try_post_process(
        &self,
        input: &Path,
        output: &Path,
        total_ms: u64,
    ) -> Option<RecordingOutcome> {
        info!(stage = ?Stage::PostProcessing, input = %input.display(), "post-processing");
        match self.process(input, output, total_ms) {
            Ok(outcome) => outcome,
            Err(err) => {
                log_failure(&err);
                warn!("post-processing failed, archiving original capture");
                if output.exists() {
                    if let Err(err) = self.storage.remove(output) {
                        warn!(%err, "failed to remove partial output");
                    }
                }
                None
            }
        }
    }

    /// Resolves trim and crop for `input` and writes the result to `output`
    /// in one pass. `None` when there was nothing worth changing.
    pub fn process(
        &self,
        input: &Path,
        output: &Path,
        total_ms: u64,
    ) -> Result<Option<RecordingOutcome>> {
        let cfg = &self.settings;
        let trim = if cfg.post_process.trim {
            find_trim_parameters(&self.tool, input, total_ms, cfg.safety_buffer_ms, &cfg.detection)?
        } else {
            TrimParameters::default()
        };
        let crop = if cfg.post_process.crop {
            find_crop_parameters(&self.tool, input, total_ms, &cfg.detection)?
        } else {
            Vec::new()
        };
        info!(?trim, crop_samples = crop.len(), "post-processing parameters");

        if !trim.is_trimmable() && crop.is_empty() {
            info!("nothing to trim or crop");
            return Ok(None);
        }

        self.tool.post_process(input, output, &trim, &crop)?;
        let processed_ms = self.tool.probe_duration_ms(output)?;
        debug!(processed_ms, "probed processed file");
        if processed_ms < cfg.detection.minimum_programme_duration {
            return Err(RecorderError::Validation(format!(
                "processed file is only {processed_ms} ms"
            )));
        }

        Ok(Some(RecordingOutcome {
            trimmed: trim.is_trimmable(),
            cropped: !crop.is_empty(),
            kept_original: false,
        }))
    }

    /// Standalone post-processing of an existing capture.
    pub fn process_file(&self, input: &Path, output: &Path) -> Result<Option<RecordingOutcome>> {
        let total_ms = self.tool.probe_duration_ms(input)?;
        info!(input = %input.display(), total_ms, "processing file");
        let result = self.process(input, output, total_ms);
        if result.is_err() && output.exists() {
            self.storage.remove(output)?;
        }
        result
    }

    fn fail(&self, programme: &Programme, path: &Path, start: DateTime<Utc>, err: &RecorderError) {
        log_failure(err);
        let window = RecordingWindow {
            start,
            end: Utc::now(),
        };
        let failed = FileState::Failed(start);
        match self
            .storage
            .rename_with_suffix(programme, FileState::InProgress, failed)
        {
            Ok(failed_path) => {
                info!(stage = ?Stage::Failed, path = %failed_path.display(), "kept failed capture");
                if let Err(err) = self.storage.write_metadata(
                    programme,
                    failed,
                    window,
                    RecordingOutcome::default(),
                ) {
                    error!(%err, "failed to write failure metadata");
                }
            }
            Err(err) => error!(%err, "could not keep failed capture"),
        }
        error!(path = %path.display(), "error during recording");
    }
}

fn log_failure(err: &RecorderError) {
    match err {
        RecorderError::ToolExecution { tool, exit_code, stdout, stderr } => {
            error!(%tool, ?exit_code, "{}", stdout.join("\n"));
            debug!(%tool, "{}", stderr.join("\n"));
        }
        other => error!(err = %other, "recording step failed"),
    }
}
