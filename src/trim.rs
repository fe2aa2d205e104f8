//! Finds where the programme proper starts and ends inside a capture that
//! was deliberately started early and stopped late.

use crate::cli::DetectionConfig;
use crate::diagnostics::{find_frame_events, find_silences};
use crate::error::Result;
use crate::ffmpeg::MediaTool;
use crate::interval::IntervalTree;
use crate::strategy::{BoundaryCandidate, boundary_strategies, search};
use std::path::Path;
use tracing::{debug, info};

/// Resolved boundaries in milliseconds. No `start` means the capture cannot
/// be trimmed; no `end` means keep everything through the end of file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimParameters {
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

impl TrimParameters {
    pub fn is_trimmable(&self) -> bool {
        self.start_ms.is_some()
    }
}

/// Interprets one boundary-detection run. Without any silence in the window
/// there is nothing to anchor a boundary to.
pub fn boundaries_from_output<S: AsRef<str>>(lines: &[S]) -> Vec<BoundaryCandidate> {
    let silences = find_silences(lines);
    let mut windows = IntervalTree::new();
    for silence in &silences {
        windows.insert(silence.start_ms, silence.end_ms, silence.duration_ms());
    }
    debug!(count = windows.len(), ?silences, "silences found");
    if windows.is_empty() {
        info!("no silences of sufficient length, terminating boundary search");
        return Vec::new();
    }

    let events = find_frame_events(lines);
    let strategies = boundary_strategies();
    match search(&events, &windows, &strategies) {
        Some((strategy, candidates)) => {
            info!(strategy = %strategy.name, count = candidates.len(), "boundary candidates found");
            candidates
        }
        None => Vec::new(),
    }
}

pub fn detect_potential_boundaries(
    tool: &dyn MediaTool,
    path: &Path,
    from_ms: u64,
    limit_ms: Option<u64>,
) -> Result<Vec<BoundaryCandidate>> {
    let lines = tool.detect_boundaries(path, from_ms, limit_ms)?;
    Ok(boundaries_from_output(&lines))
}

/// Picks the end boundary. Trailing interstitials repeat in fixed-length
/// blocks, so measured back from the last candidate, a real boundary sits a
/// whole number of blocks away; the earliest such candidate wins.
pub fn resolve_end(
    candidates: &[BoundaryCandidate],
    block_ms: u64,
    tolerance_ms: u64,
) -> Option<u64> {
    let anchor = candidates.last()?.start_ms;
    let on_block = |start_ms: u64| {
        let distance = start_ms.abs_diff(anchor);
        if block_ms == 0 {
            return distance <= tolerance_ms;
        }
        let rem = distance % block_ms;
        rem.min(block_ms - rem) <= tolerance_ms
    };

    candidates
        .iter()
        .map(|c| c.start_ms)
        .filter(|start| on_block(*start))
        .min()
        .or(Some(anchor))
}

pub fn find_trim_parameters(
    tool: &dyn MediaTool,
    path: &Path,
    total_duration_ms: u64,
    safety_buffer_ms: u64,
    cfg: &DetectionConfig,
) -> Result<TrimParameters> {
    let start_from = safety_buffer_ms.saturating_sub(cfg.start_search_buffer);
    info!(
        from_ms = start_from,
        limit_ms = cfg.start_search_duration,
        "searching for start boundary"
    );
    let start_candidates =
        detect_potential_boundaries(tool, path, start_from, Some(cfg.start_search_duration))?;
    let Some(start) = start_candidates.last().map(|c| c.start_ms) else {
        info!("no start boundary found, recording cannot be trimmed");
        return Ok(TrimParameters::default());
    };
    info!(start_ms = start, "start boundary resolved");

    let end_from = (start + cfg.minimum_programme_duration).max(
        total_duration_ms
            .saturating_sub(cfg.end_search_duration)
            .saturating_sub(2 * safety_buffer_ms),
    );
    let end_limit = cfg.end_search_duration + cfg.end_search_buffer + safety_buffer_ms;
    info!(from_ms = end_from, limit_ms = end_limit, "searching for end boundary");
    let end_candidates = detect_potential_boundaries(tool, path, end_from, Some(end_limit))?;
    let end = resolve_end(
        &end_candidates,
        cfg.interstitial_block,
        cfg.interstitial_tolerance,
    );
    match end {
        Some(end_ms) => info!(end_ms, "end boundary resolved"),
        None => info!("no end boundary found, keeping through end of file"),
    }

    Ok(TrimParameters {
        start_ms: Some(start),
        end_ms: end,
    })
}
