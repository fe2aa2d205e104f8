//! Typed events extracted from ffmpeg's diagnostic text.
//!
//! Every extractor is pure: lines that do not match a pattern, or that match
//! its shape but carry an unparseable number, are dropped.

use crate::strategy::FrameEvent;
use regex::{Captures, Regex};
use std::sync::LazyLock;

static SILENCEDETECT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[(?:Parsed_)?silencedetect(?:_\d+)? @ \w+\] silence_end: (?<end>[\d.]+) \| silence_duration: (?<duration>[\d.]+)",
    )
    .unwrap()
});

static BLACKFRAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[Parsed_blackframe_(?<filter>\d+) @ \w+\] frame:(?<frame>[\d.]+) pblack:[\d.]+ pts:\S+ t:(?<time>[\d.]+) type:\w+ last_keyframe:\S+",
    )
    .unwrap()
});

static CROPDETECT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[Parsed_cropdetect_\d+ @ \w+\] x1:\S+ x2:\S+ y1:\S+ y2:\S+ w:(?<width>[\d.]+) h:(?<height>[\d.]+) x:(?<x>[\d.]+) y:(?<y>[\d.]+) pts:\S+ t:(?<time>[\d.]+)",
    )
    .unwrap()
});

/// A window of silence, in milliseconds on the analysed file's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Silence {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl Silence {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }
}

/// One `cropdetect` report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropGeometry {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub time_ms: u64,
}

pub fn find_silences<S: AsRef<str>>(lines: &[S]) -> Vec<Silence> {
    lines
        .iter()
        .filter_map(|line| parse_silence(line.as_ref()))
        .collect()
}

pub fn find_frame_events<S: AsRef<str>>(lines: &[S]) -> Vec<FrameEvent> {
    lines
        .iter()
        .filter_map(|line| parse_frame_event(line.as_ref()))
        .collect()
}

pub fn find_crop_geometry<S: AsRef<str>>(lines: &[S]) -> Vec<CropGeometry> {
    lines
        .iter()
        .filter_map(|line| parse_crop_geometry(line.as_ref()))
        .collect()
}

pub fn parse_silence(line: &str) -> Option<Silence> {
    let caps = SILENCEDETECT_PATTERN.captures(line)?;
    let end = number(&caps, "end")?;
    let duration = number(&caps, "duration")?;
    let end_ms = seconds_to_ms(end);
    Some(Silence {
        start_ms: seconds_to_ms(end - duration).min(end_ms),
        end_ms,
    })
}

pub fn parse_frame_event(line: &str) -> Option<FrameEvent> {
    let caps = BLACKFRAME_PATTERN.captures(line)?;
    Some(FrameEvent {
        filter_id: whole(&caps, "filter")? as u32,
        frame: whole(&caps, "frame")?,
        time_ms: seconds_to_ms(number(&caps, "time")?),
    })
}

pub fn parse_crop_geometry(line: &str) -> Option<CropGeometry> {
    let caps = CROPDETECT_PATTERN.captures(line)?;
    Some(CropGeometry {
        x: whole(&caps, "x")? as u32,
        y: whole(&caps, "y")? as u32,
        width: whole(&caps, "width")? as u32,
        height: whole(&caps, "height")? as u32,
        time_ms: seconds_to_ms(number(&caps, "time")?),
    })
}

/// Accepts integer or decimal text; rejects anything `f64` cannot represent.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|n| n.is_finite() && *n >= 0.0)
}

pub fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds * 1000.0).round().max(0.0) as u64
}

fn number(caps: &Captures<'_>, name: &str) -> Option<f64> {
    caps.name(name).and_then(|m| parse_number(m.as_str()))
}

fn whole(caps: &Captures<'_>, name: &str) -> Option<u64> {
    number(caps, name)
        .filter(|n| n.fract() == 0.0 && *n <= u32::MAX as f64)
        .map(|n| n as u64)
}
