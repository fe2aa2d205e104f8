mod cli;
mod crop;
mod diagnostics;
mod error;
mod ffmpeg;
mod filters;
mod interval;
mod logging;
mod programme;
mod progress;
mod record;
mod schedule;
mod storage;
mod strategy;
mod thumbnail;
mod trim;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use cli::{AppConfig, Cli, Command, PostProcessConfig};
use ffmpeg::{Ffmpeg, resolve_tools};
use filters::ReferenceImages;
use programme::Programme;
use record::{Recorder, RecorderSettings};
use schedule::{ProgrammeFilter, ScheduleCache, ScheduleClient, current_programme};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use storage::Storage;
use thumbnail::ThumbnailSource;
use tracing::{debug, error, info};

const IDLE_POLL: Duration = Duration::from_secs(3);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone();
    let cfg = cli.into_config()?;
    logging::init(&cfg.log)?;

    let tools = resolve_tools(cfg.ffmpeg.clone(), cfg.ffprobe.clone())?;
    let images = ReferenceImages::in_dir(&cfg.data_dir);
    let ffmpeg = Ffmpeg {
        tools,
        stream_url: cfg.stream_url.clone(),
        images,
        encode: cfg.encode.clone(),
    };

    match command {
        Some(Command::Process { input, output }) => process(cfg, ffmpeg, &input, &output),
        None => run(cfg, ffmpeg),
    }
}

fn check_images(images: &ReferenceImages, post: PostProcessConfig) -> Result<()> {
    let missing = images.missing(post.trim, post.crop);
    if let Some(first) = missing.first() {
        bail!(
            "reference image not found: {} (set --data-dir; {} missing)",
            first.display(),
            missing.len()
        );
    }
    Ok(())
}

/// The standalone harness does both steps unless told otherwise.
fn standalone_post_process(configured: PostProcessConfig) -> PostProcessConfig {
    if configured.enabled() {
        configured
    } else {
        PostProcessConfig {
            trim: true,
            crop: true,
            keep_original: false,
        }
    }
}

fn process(cfg: AppConfig, ffmpeg: Ffmpeg, input: &Path, output: &Path) -> Result<()> {
    if !input.is_file() {
        bail!("Input not found: {}", input.display());
    }
    let post_process = standalone_post_process(cfg.post_process);
    check_images(&ffmpeg.images, post_process)?;

    let settings = RecorderSettings {
        safety_buffer_ms: cfg.safety_buffer_ms,
        post_process,
        detection: cfg.detection,
    };
    let recorder = Recorder::new(ffmpeg, Storage::new(&cfg.save_dir), settings);
    match recorder
        .process_file(input, output)
        .with_context(|| format!("failed to process {}", input.display()))?
    {
        Some(outcome) => info!(output = %output.display(), ?outcome, "processed"),
        None => info!("nothing to trim or crop, no output written"),
    }
    Ok(())
}

fn run(cfg: AppConfig, ffmpeg: Ffmpeg) -> Result<()> {
    check_images(&ffmpeg.images, cfg.post_process)?;
    let storage = Storage::new(&cfg.save_dir);
    storage
        .make_save_directory()
        .context("failed to create save directory")?;

    let schedule = ScheduleClient::new(&cfg.schedule_url, &cfg.assets_url, cfg.api_key.clone())?;
    let thumbnails = ThumbnailSource::new(&cfg.assets_url)?;
    let filter = ProgrammeFilter::new(&cfg.match_pattern, cfg.minimum_duration_ms)?;
    let recorder = Arc::new(Recorder::new(
        ffmpeg,
        storage,
        RecorderSettings {
            safety_buffer_ms: cfg.safety_buffer_ms,
            post_process: cfg.post_process,
            detection: cfg.detection.clone(),
        },
    ));
    let mut cache = ScheduleCache::default();

    info!(
        save_dir = %cfg.save_dir.display(),
        patterns = ?cfg.match_pattern,
        "waiting for programmes"
    );
    loop {
        let pause = match poll(&cfg, &schedule, &mut cache, &filter, &recorder, &thumbnails) {
            Ok(pause) => pause,
            Err(err) => {
                error!("{err:#}");
                ERROR_BACKOFF
            }
        };
        thread::sleep(pause);
    }
}

/// One scheduling cycle. Returns how long to wait before the next one.
fn poll(
    cfg: &AppConfig,
    schedule: &ScheduleClient,
    cache: &mut ScheduleCache,
    filter: &ProgrammeFilter,
    recorder: &Arc<Recorder<Ffmpeg>>,
    thumbnails: &ThumbnailSource,
) -> Result<Duration> {
    let now = Utc::now();
    let programmes = cache
        .get(now, || schedule.fetch(now))
        .context("failed to get schedule")?;
    let Some(programme) = current_programme(programmes, now, cfg.safety_buffer_ms).cloned() else {
        debug!("nothing currently airing");
        return Ok(IDLE_POLL);
    };

    info!(title = %programme.title, "currently airing");
    record_if_desired(programme.clone(), filter, recorder, thumbnails)?;

    let remaining =
        (programme.end_date - Utc::now()).num_milliseconds() - cfg.safety_buffer_ms as i64;
    let pause = Duration::from_millis(remaining.max(0) as u64);
    info!(seconds = pause.as_secs(), "sleeping until next programme");
    Ok(pause)
}

fn record_if_desired(
    programme: Programme,
    filter: &ProgrammeFilter,
    recorder: &Arc<Recorder<Ffmpeg>>,
    thumbnails: &ThumbnailSource,
) -> Result<()> {
    let desired = filter.is_desired(&programme);
    info!(title = %programme.title, desired, "checked programme");
    if !desired {
        return Ok(());
    }
    if recorder.storage.recording_exists(&programme) {
        info!(title = %programme.title, "recording already exists");
        return Ok(());
    }

    // The capture overruns into the next programme's safety buffer, so the
    // scheduler must not wait for it.
    let recorder = Arc::clone(recorder);
    let thumbnails = thumbnails.clone();
    thread::Builder::new()
        .name(format!("record-{}", programme.airing_id))
        .spawn(move || {
            let thumbnail = thumbnails.get(&programme.thumbnail);
            recorder.record(&programme, thumbnail);
        })
        .context("failed to start recording thread")?;
    Ok(())
}
