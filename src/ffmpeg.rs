use crate::cli::EncodeSettings;
use crate::crop::CropParameter;
use crate::error::{RecorderError, Result};
use crate::filters::{
    CROP_DETECT_FILTER, ReferenceImages, build_boundary_detection_graph, build_crop_graph,
    build_news_banner_detection_graph,
};
use crate::progress::ProgressUi;
use crate::programme::Programme;
use crate::trim::TrimParameters;
use serde::Deserialize;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use which::which;

pub const NETWORK_NAME: &str = "NHK World";

#[derive(Debug, Clone)]
pub struct Tools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

pub fn resolve_tools(ffmpeg: Option<PathBuf>, ffprobe: Option<PathBuf>) -> Result<Tools> {
    Ok(Tools {
        ffmpeg: resolve_bin(ffmpeg, "ffmpeg")?,
        ffprobe: resolve_bin(ffprobe, "ffprobe")?,
    })
}

fn resolve_bin(bin_opt: Option<PathBuf>, default: &str) -> Result<PathBuf> {
    if let Some(path) = bin_opt {
        if path.is_file() {
            return Ok(path);
        }
        return Err(RecorderError::ToolNotFound(path.display().to_string()));
    }

    which(default)
        .or_else(|_| {
            if cfg!(windows) {
                which(format!("{default}.exe"))
            } else {
                Err(which::Error::CannotFindBinaryPath)
            }
        })
        .map_err(|_| RecorderError::ToolNotFound(default.into()))
}

/// Everything a tool printed, one entry per line.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

pub fn execute(program: &Path, args: &[String], input: Option<Vec<u8>>) -> Result<ToolOutput> {
    execute_with(program, args, input, |_| {})
}

/// Runs `program` to completion. `input`, when given, is written to stdin
/// and closed before this returns. `on_stdout` sees each stdout line as it
/// arrives; stderr is collected on a separate thread.
pub fn execute_with<F>(
    program: &Path,
    args: &[String],
    input: Option<Vec<u8>>,
    mut on_stdout: F,
) -> Result<ToolOutput>
where
    F: FnMut(&str),
{
    let tool = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());
    debug!(%tool, args = %args.join(" "), "invoking");
    let started = Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RecorderError::ToolNotFound(tool.clone()),
            _ => RecorderError::Io(e),
        })?;

    let writer = match (child.stdin.take(), input) {
        (Some(mut stdin), Some(bytes)) => Some(thread::spawn(move || stdin.write_all(&bytes))),
        _ => None,
    };

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other(format!("failed to capture {tool} stderr")))?;
    let stderr_tool = tool.clone();
    let stderr_reader = thread::spawn(move || {
        let mut lines = Vec::new();
        read_lines_lossy(stderr, |line| {
            trace!(tool = %stderr_tool, "{line}");
            lines.push(line);
        })
        .map(|_| lines)
    });

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other(format!("failed to capture {tool} stdout")))?;
    let mut stdout_lines = Vec::new();
    let read = read_lines_lossy(stdout, |line| {
        trace!(%tool, "{line}");
        on_stdout(&line);
        stdout_lines.push(line);
    });
    if let Err(err) = read {
        let err = stop_after_read_error(&mut child, &tool, err);
        // both helpers end once the child's pipes close
        let _ = stderr_reader.join();
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        return Err(err);
    }

    let stderr_lines = stderr_reader
        .join()
        .map_err(|_| io::Error::other("stderr reader panicked"))??;

    if let Some(writer) = writer {
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                warn!(%tool, "tool closed stdin before all input was written");
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(io::Error::other("stdin writer panicked").into()),
        }
    }

    let status = child.wait()?;
    info!(%tool, elapsed_ms = started.elapsed().as_millis() as u64, %status, "done");
    if !status.success() {
        return Err(RecorderError::ToolExecution {
            tool,
            exit_code: status.code(),
            stdout: stdout_lines,
            stderr: stderr_lines,
        });
    }

    Ok(ToolOutput {
        stdout: stdout_lines,
        stderr: stderr_lines,
    })
}

/// Kills and reaps `child` so a failed read never leaves it running.
fn stop_after_read_error(child: &mut Child, tool: &str, err: io::Error) -> RecorderError {
    warn!(%tool, %err, "failed reading tool output, stopping it");
    if let Err(kill_err) = child.kill() {
        debug!(%tool, %kill_err, "tool already exited");
    }
    if let Err(wait_err) = child.wait() {
        warn!(%tool, %wait_err, "failed to reap tool");
    }
    err.into()
}

fn read_lines_lossy<R: Read>(reader: R, mut f: impl FnMut(String)) -> io::Result<()> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        f(line.trim_end_matches(['\r', '\n']).to_string());
    }
}

/// The analysis, capture and encode operations the recorder needs from the
/// external tool. Detection methods return the raw diagnostic lines.
pub trait MediaTool {
    fn probe_duration_ms(&self, path: &Path) -> Result<u64>;

    fn capture(
        &self,
        output: &Path,
        programme: &Programme,
        duration: Duration,
        thumbnail: Option<&[u8]>,
    ) -> Result<()>;

    fn detect_boundaries(&self, path: &Path, from_ms: u64, limit_ms: Option<u64>)
    -> Result<Vec<String>>;

    fn detect_news_banners(&self, path: &Path) -> Result<Vec<String>>;

    fn detect_crop(&self, path: &Path, from_ms: u64, limit_ms: u64) -> Result<Vec<String>>;

    fn post_process(
        &self,
        input: &Path,
        output: &Path,
        trim: &TrimParameters,
        crop: &[CropParameter],
    ) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Ffmpeg {
    pub tools: Tools,
    pub stream_url: Option<String>,
    pub images: ReferenceImages,
    pub encode: EncodeSettings,
}

impl MediaTool for Ffmpeg {
    fn probe_duration_ms(&self, path: &Path) -> Result<u64> {
        let out = execute(&self.tools.ffprobe, &probe_args(path), None)?;
        let probe: FfprobeOutput = serde_json::from_str(&out.stdout.join(""))?;
        let raw = probe.format.duration.unwrap_or_default();
        let seconds = crate::diagnostics::parse_number(&raw).ok_or(RecorderError::Parse {
            what: "duration",
            value: raw,
        })?;
        Ok(crate::diagnostics::seconds_to_ms(seconds))
    }

    fn capture(
        &self,
        output: &Path,
        programme: &Programme,
        duration: Duration,
        thumbnail: Option<&[u8]>,
    ) -> Result<()> {
        let stream_url = self
            .stream_url
            .as_deref()
            .ok_or_else(|| RecorderError::Validation("no stream URL configured".into()))?;
        let args = capture_args(stream_url, output, programme, duration, thumbnail.is_some());
        let ui = ProgressUi::new(duration.as_millis() as u64, &programme.title);
        let result = execute_with(
            &self.tools.ffmpeg,
            &args,
            thumbnail.map(<[u8]>::to_vec),
            |line| {
                ui.observe(line);
            },
        );
        ui.finish(result.is_ok());
        let out = result?;
        for line in &out.stderr {
            debug!("{line}");
        }
        Ok(())
    }

    fn detect_boundaries(
        &self,
        path: &Path,
        from_ms: u64,
        limit_ms: Option<u64>,
    ) -> Result<Vec<String>> {
        let args = boundary_detection_args(path, &self.images, from_ms, limit_ms);
        Ok(execute(&self.tools.ffmpeg, &args, None)?.stderr)
    }

    fn detect_news_banners(&self, path: &Path) -> Result<Vec<String>> {
        let args = news_banner_detection_args(path, &self.images.news_background);
        Ok(execute(&self.tools.ffmpeg, &args, None)?.stderr)
    }

    fn detect_crop(&self, path: &Path, from_ms: u64, limit_ms: u64) -> Result<Vec<String>> {
        let args = crop_detection_args(path, from_ms, limit_ms);
        Ok(execute(&self.tools.ffmpeg, &args, None)?.stderr)
    }

    fn post_process(
        &self,
        input: &Path,
        output: &Path,
        trim: &TrimParameters,
        crop: &[CropParameter],
    ) -> Result<()> {
        let args = post_process_args(input, output, trim, crop, &self.encode);
        let out = execute(&self.tools.ffmpeg, &args, None)?;
        for line in &out.stderr {
            debug!("{line}");
        }
        Ok(())
    }
}

fn seconds_arg(ms: u64) -> String {
    (ms as f64 / 1000.0).to_string()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn probe_args(path: &Path) -> Vec<String> {
    ["-v", "quiet", "-print_format", "json", "-show_format"]
        .into_iter()
        .map(String::from)
        .chain([path_arg(path)])
        .collect()
}

pub fn capture_args(
    stream_url: &str,
    output: &Path,
    programme: &Programme,
    duration: Duration,
    with_thumbnail: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-y".into(),
        "-i".into(),
        stream_url.into(),
    ];
    if with_thumbnail {
        args.extend(
            ["-i", "-", "-map", "0", "-map", "1", "-disposition:v:1", "attached_pic"]
                .map(String::from),
        );
    }
    args.extend([
        "-t".into(),
        duration.as_secs_f64().to_string(),
        "-codec".into(),
        "copy".into(),
        "-f".into(),
        "mp4".into(),
    ]);

    let start = programme.start_date.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let tags = [
        ("show", programme.title.as_str()),
        ("title", programme.subtitle.as_str()),
        ("description", programme.description.as_str()),
        ("synopsis", programme.content.as_str()),
        ("date", start.as_str()),
        ("episode_id", programme.airing_id.as_str()),
        ("network", NETWORK_NAME),
    ];
    for (key, value) in tags {
        if !value.is_empty() {
            args.push("-metadata".into());
            args.push(format!("{key}={value}"));
        }
    }
    args.push(path_arg(output));
    args
}

pub fn boundary_detection_args(
    path: &Path,
    images: &ReferenceImages,
    from_ms: u64,
    limit_ms: Option<u64>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-copyts".into(),
        "-ss".into(),
        seconds_arg(from_ms),
    ];
    if let Some(limit) = limit_ms {
        args.extend(["-t".into(), seconds_arg(limit)]);
    }
    args.extend(["-i".into(), path_arg(path)]);
    for image in images.boundary_inputs() {
        args.extend(["-i".into(), path_arg(image)]);
    }
    args.extend([
        "-filter_complex".into(),
        build_boundary_detection_graph(),
        "-f".into(),
        "null".into(),
        "-".into(),
    ]);
    args
}

pub fn news_banner_detection_args(path: &Path, background: &Path) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-i".into(),
        path_arg(path),
        "-i".into(),
        path_arg(background),
        "-filter_complex".into(),
        build_news_banner_detection_graph(),
        "-f".into(),
        "null".into(),
        "-".into(),
    ]
}

pub fn crop_detection_args(path: &Path, from_ms: u64, limit_ms: u64) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-copyts".into(),
        "-ss".into(),
        seconds_arg(from_ms),
        "-t".into(),
        seconds_arg(limit_ms),
        "-i".into(),
        path_arg(path),
        "-vf".into(),
        CROP_DETECT_FILTER.into(),
        "-f".into(),
        "null".into(),
        "-".into(),
    ]
}

/// Single pass: output-side seek for the trim (so filter time stays on the
/// source timeline), stream copy unless a crop forces a re-encode.
pub fn post_process_args(
    input: &Path,
    output: &Path,
    trim: &TrimParameters,
    crop: &[CropParameter],
    encode: &EncodeSettings,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-y".into(),
        "-i".into(),
        path_arg(input),
    ];
    if let Some(start) = trim.start_ms {
        args.extend(["-ss".into(), seconds_arg(start)]);
        if let Some(end) = trim.end_ms {
            args.extend(["-to".into(), seconds_arg(end)]);
        }
    }

    if crop.is_empty() {
        args.extend(["-map", "0", "-codec", "copy"].map(String::from));
    } else {
        args.extend([
            "-filter_complex".into(),
            build_crop_graph(crop),
            "-map".into(),
            "[vout]".into(),
            "-map".into(),
            "0:a".into(),
            "-c:v".into(),
            "libx264".into(),
            "-crf".into(),
            encode.crf.to_string(),
            "-preset".into(),
            encode.preset.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-c:a".into(),
            "copy".into(),
        ]);
        if encode.threads > 0 {
            args.extend(["-threads".into(), encode.threads.to_string()]);
        }
    }

    args.extend(["-map_metadata", "0", "-f", "mp4"].map(String::from));
    args.push(path_arg(output));
    args
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::fs;

    type BoundaryOutput = Box<dyn Fn(u64, Option<u64>) -> Vec<String>>;
    type CropOutput = Box<dyn Fn(u64, u64) -> Vec<String>>;

    /// Scripted stand-in for ffmpeg. Durations are looked up by path suffix.
    pub struct FakeTool {
        pub durations: Vec<(&'static str, u64)>,
        pub boundaries: BoundaryOutput,
        pub banners: Vec<String>,
        pub crops: CropOutput,
        pub fail_capture: bool,
        pub fail_post_process: bool,
        pub calls: RefCell<Vec<String>>,
    }

    impl Default for FakeTool {
        fn default() -> Self {
            Self {
                durations: Vec::new(),
                boundaries: Box::new(|_, _| Vec::new()),
                banners: Vec::new(),
                crops: Box::new(|_, _| Vec::new()),
                fail_capture: false,
                fail_post_process: false,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    pub fn tool_failure(tool: &str) -> RecorderError {
        RecorderError::ToolExecution {
            tool: tool.into(),
            exit_code: Some(1),
            stdout: Vec::new(),
            stderr: vec!["Conversion failed!".into()],
        }
    }

    impl MediaTool for FakeTool {
        fn probe_duration_ms(&self, path: &Path) -> Result<u64> {
            let path = path.to_string_lossy();
            self.calls.borrow_mut().push(format!("probe {path}"));
            self.durations
                .iter()
                .find(|(suffix, _)| path.ends_with(suffix))
                .map(|(_, ms)| *ms)
                .ok_or_else(|| tool_failure("ffprobe"))
        }

        fn capture(
            &self,
            output: &Path,
            _programme: &Programme,
            duration: Duration,
            thumbnail: Option<&[u8]>,
        ) -> Result<()> {
            self.calls.borrow_mut().push(format!(
                "capture {}s thumbnail={}",
                duration.as_secs(),
                thumbnail.is_some()
            ));
            fs::write(output, b"captured stream")?;
            if self.fail_capture {
                return Err(tool_failure("ffmpeg"));
            }
            Ok(())
        }

        fn detect_boundaries(
            &self,
            _path: &Path,
            from_ms: u64,
            limit_ms: Option<u64>,
        ) -> Result<Vec<String>> {
            self.calls
                .borrow_mut()
                .push(format!("boundaries {from_ms} {limit_ms:?}"));
            Ok((self.boundaries)(from_ms, limit_ms))
        }

        fn detect_news_banners(&self, _path: &Path) -> Result<Vec<String>> {
            self.calls.borrow_mut().push("banners".into());
            Ok(self.banners.clone())
        }

        fn detect_crop(&self, _path: &Path, from_ms: u64, limit_ms: u64) -> Result<Vec<String>> {
            self.calls
                .borrow_mut()
                .push(format!("crop {from_ms} {limit_ms}"));
            Ok((self.crops)(from_ms, limit_ms))
        }

        fn post_process(
            &self,
            _input: &Path,
            output: &Path,
            trim: &TrimParameters,
            crop: &[CropParameter],
        ) -> Result<()> {
            self.calls
                .borrow_mut()
                .push(format!("post_process {trim:?} crops={}", crop.len()));
            fs::write(output, b"processed stream")?;
            if self.fail_post_process {
                return Err(tool_failure("ffmpeg"));
            }
            Ok(())
        }
    }

    pub fn blackframe(filter: u32, frame: u64, time_ms: u64) -> String {
        format!(
            "[Parsed_blackframe_{filter} @ 0x6000] frame:{frame} pblack:99 pts:{frame} t:{} type:P last_keyframe:0",
            time_ms as f64 / 1000.0
        )
    }

    pub fn silence(start_ms: u64, end_ms: u64) -> String {
        format!(
            "[silencedetect @ 0x6000] silence_end: {} | silence_duration: {}",
            end_ms as f64 / 1000.0,
            (end_ms - start_ms) as f64 / 1000.0
        )
    }

    pub fn cropdetect(width: u32, time_ms: u64) -> String {
        format!(
            "[Parsed_cropdetect_0 @ 0x6000] x1:0 x2:{} y1:0 y2:1079 w:{width} h:1080 x:0 y:0 pts:0 t:{} crop={width}:1080:0:0",
            width - 1,
            time_ms as f64 / 1000.0
        )
    }
}
