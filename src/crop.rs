use crate::cli::DetectionConfig;
use crate::diagnostics::{find_crop_geometry, find_frame_events};
use crate::error::Result;
use crate::ffmpeg::MediaTool;
use crate::interval::IntervalTree;
use crate::strategy::{BoundaryCandidate, find_candidates, news_banner_strategy};
use std::path::Path;
use tracing::{debug, info};

/// Picture width to keep from `time_ms` onwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropParameter {
    pub time_ms: u64,
    pub width_px: u32,
}

pub fn detect_news_banners(tool: &dyn MediaTool, path: &Path) -> Result<Vec<BoundaryCandidate>> {
    let lines = tool.detect_news_banners(path)?;
    let events = find_frame_events(&lines);
    let banners = find_candidates(&events, &news_banner_strategy(), &IntervalTree::new());
    info!(count = banners.len(), ?banners, "news banners detected");
    Ok(banners)
}

/// Sorts by time and drops every sample whose width matches the one before it.
pub fn collapse(mut params: Vec<CropParameter>) -> Vec<CropParameter> {
    params.sort_by_key(|p| p.time_ms);
    params.dedup_by_key(|p| p.width_px);
    params
}

fn probe_edge(
    tool: &dyn MediaTool,
    path: &Path,
    edge_ms: u64,
    cfg: &DetectionConfig,
) -> Result<Vec<CropParameter>> {
    let lines = tool.detect_crop(
        path,
        edge_ms.saturating_sub(cfg.crop_probe_lead),
        cfg.crop_probe_duration,
    )?;
    Ok(find_crop_geometry(&lines)
        .into_iter()
        .map(|g| {
            debug!(
                x = g.x,
                y = g.y,
                width = g.width,
                height = g.height,
                time_ms = g.time_ms,
                "crop geometry"
            );
            CropParameter {
                time_ms: g.time_ms,
                width_px: g.width,
            }
        })
        .collect())
}

pub fn find_crop_parameters(
    tool: &dyn MediaTool,
    path: &Path,
    total_duration_ms: u64,
    cfg: &DetectionConfig,
) -> Result<Vec<CropParameter>> {
    let banners = detect_news_banners(tool, path)?;
    if banners.is_empty() {
        info!("no news banners, nothing to crop");
        return Ok(Vec::new());
    }

    if let [banner] = banners.as_slice() {
        // runs are ordered by frame, so a timestamp jump can reverse them
        let span = banner.end_ms.abs_diff(banner.start_ms);
        if span.abs_diff(total_duration_ms) <= cfg.banner_tolerance {
            info!(
                width = cfg.constant_crop_width,
                "banner covers whole recording, using constant crop"
            );
            return Ok(vec![CropParameter {
                time_ms: 0,
                width_px: cfg.constant_crop_width,
            }]);
        }
    }

    // One probe at a time keeps a single ffmpeg analysis running.
    let mut samples = Vec::new();
    for banner in &banners {
        for edge in [banner.start_ms, banner.end_ms] {
            let found = probe_edge(tool, path, edge, cfg)?;
            debug!(edge_ms = edge, ?found, "crop samples");
            samples.extend(found);
        }
    }

    let params = collapse(samples);
    info!(?params, "crop parameters resolved");
    Ok(params)
}
