use crate::crop::CropParameter;
use std::fmt::Display;
use std::path::{Path, PathBuf};

pub const FRAME_WIDTH: u32 = 1920;
pub const FRAME_HEIGHT: u32 = 1080;

/// Shortest silence `silencedetect` reports during boundary search.
pub const MINIMUM_BOUNDARY_SILENCE_SECONDS: f64 = 0.1;

// `Parsed_blackframe_<n>` indices, fixed by filter order in the graphs below.
pub const BLACK_LOGO_FILTER: u32 = 9;
pub const WHITE_LOGO_FILTER: u32 = 11;
pub const WHITE_BORDERS_LOGO_FILTER: u32 = 13;
pub const NO_LOGO_FILTER: u32 = 14;
pub const NEWSLINE_INTRO_FILTER: u32 = 16;
pub const NEWS_BANNER_FILTER: u32 = 13;

pub const CROP_DETECT_FILTER: &str = "cropdetect=limit=24:round=2:reset=1";

/// Reference stills compared against the broadcast, in ffmpeg input order
/// after the recording itself.
#[derive(Debug, Clone)]
pub struct ReferenceImages {
    pub black_logo: PathBuf,
    pub white_logo: PathBuf,
    pub white_borders_logo: PathBuf,
    pub newsline_intro: PathBuf,
    pub news_background: PathBuf,
}

impl ReferenceImages {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            black_logo: dir.join("black_cropped.jpg"),
            white_logo: dir.join("white_cropped.jpg"),
            white_borders_logo: dir.join("white_borders_cropped.jpg"),
            newsline_intro: dir.join("newsline_intro.jpg"),
            news_background: dir.join("news_background.jpg"),
        }
    }

    pub fn boundary_inputs(&self) -> [&Path; 4] {
        [
            &self.black_logo,
            &self.white_logo,
            &self.white_borders_logo,
            &self.newsline_intro,
        ]
    }

    /// Stills that the enabled post-processing steps need but are not on disk.
    pub fn missing(&self, trim: bool, crop: bool) -> Vec<&Path> {
        let mut needed: Vec<&Path> = Vec::new();
        if trim {
            needed.extend(self.boundary_inputs());
        }
        if crop {
            needed.push(&self.news_background);
        }
        needed.retain(|p| !p.is_file());
        needed
    }
}

/// Luma comparisons of the top-left corner against the logo cards, a plain
/// blackframe check, a full-frame comparison against the Newsline intro and
/// silence detection on the first audio stream.
pub fn build_boundary_detection_graph() -> String {
    let silence = format!("[0:1]silencedetect=n=-50dB:d={MINIMUM_BOUNDARY_SILENCE_SECONDS}");
    [
        "[0:0]extractplanes=y[vy]",
        "[1]extractplanes=y[by]",
        "[2]extractplanes=y[wy]",
        "[3]extractplanes=y[wby]",
        "[4]extractplanes=y[nly]",
        "[vy]split=outputs=2[vy0][vy1]",
        "[vy0]crop=w=960:h=540:x=0:y=0[cvy]",
        "[cvy]split=outputs=4[cvy0][cvy1][cvy2][cvy3]",
        "[cvy0][by]blend=difference,blackframe=99",
        "[cvy1][wy]blend=difference,blackframe=99:50",
        "[cvy2][wby]blend=difference,blackframe=99:50",
        "[cvy3]blackframe=99",
        "[vy1][nly]blend=difference,blackframe=99",
        silence.as_str(),
    ]
    .join(";")
}

/// Compares the left and right picture margins with the banner background.
pub fn build_news_banner_detection_graph() -> String {
    [
        "nullsrc=size=184x800[base]",
        "[0:0]extractplanes=y[vy]",
        "[1]extractplanes=y[iy]",
        "[vy]split=2[vy0][vy1]",
        "[iy]split=2[iy0][iy1]",
        "[vy0]crop=92:800:0:174[vyl]",
        "[vy1]crop=92:800:1828:174[vyr]",
        "[iy0]crop=92:800:0:174[iyl]",
        "[iy1]crop=92:800:1828:174[iyr]",
        "[vyl][iyl]blend=difference[dl]",
        "[vyr][iyr]blend=difference[dr]",
        "[base][dl]overlay=0:0:shortest=1[ol]",
        "[ol][dr]overlay=92:0,blackframe=99:16",
    ]
    .join(";")
}

/// Width the frame is scaled to so that a `crop_width` wide picture fills
/// the output. Always even.
pub fn scale_width_for_crop_width(crop_width: u32) -> u32 {
    let crop_width = crop_width.clamp(2, FRAME_WIDTH);
    let scaled = (FRAME_WIDTH as f64 * FRAME_WIDTH as f64 / crop_width as f64).round() as u32;
    scaled + scaled % 2
}

/// Horizontal overlay position that centres the scaled frame.
pub fn offset_x_for_crop_width(crop_width: u32) -> i64 {
    -((scale_width_for_crop_width(crop_width) as i64 - FRAME_WIDTH as i64) / 2)
}

pub fn offset_y_for_crop_width(crop_width: u32) -> i64 {
    let scaled_height = scale_width_for_crop_width(crop_width) as i64 * FRAME_HEIGHT as i64
        / FRAME_WIDTH as i64;
    -((scaled_height - FRAME_HEIGHT as i64) / 2)
}

/// Folds `params` into one nested `if(gte(t,..),..,..)` expression. The
/// latest sample is tested first; before the first sample `full_width` is
/// used.
pub fn build_time_sequence<T, F>(params: &[CropParameter], full_width: u32, derive: F) -> String
where
    T: Display,
    F: Fn(u32) -> T,
{
    params.iter().fold(derive(full_width).to_string(), |earlier, p| {
        format!(
            "if(gte(t,{}),{},{earlier})",
            p.time_ms as f64 / 1000.0,
            derive(p.width_px)
        )
    })
}

/// Scale-and-overlay graph applying the time-varying crop. Output pad is
/// `[vout]`.
pub fn build_crop_graph(params: &[CropParameter]) -> String {
    let width = build_time_sequence(params, FRAME_WIDTH, scale_width_for_crop_width);
    let x = build_time_sequence(params, FRAME_WIDTH, offset_x_for_crop_width);
    let y = build_time_sequence(params, FRAME_WIDTH, offset_y_for_crop_width);
    [
        format!("color=black:s={FRAME_WIDTH}x{FRAME_HEIGHT}[bg]"),
        format!("[0:v]scale=w='{width}':h=-2:eval=frame[sv]"),
        format!("[bg][sv]overlay=x='{x}':y='{y}':shortest=1[vout]"),
    ]
    .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(time_ms: u64, width_px: u32) -> CropParameter {
        CropParameter { time_ms, width_px }
    }

    #[test]
    fn test_missing_reference_images() {
        let dir = tempfile::tempdir().unwrap();
        let images = ReferenceImages::in_dir(dir.path());
        assert!(images.missing(false, false).is_empty());
        assert_eq!(images.missing(true, true).len(), 5);

        std::fs::write(&images.news_background, b"jpeg").unwrap();
        assert!(images.missing(false, true).is_empty());
        assert_eq!(images.missing(true, false).len(), 4);
    }

    #[test]
    fn test_full_width_is_identity() {
        assert_eq!(scale_width_for_crop_width(FRAME_WIDTH), FRAME_WIDTH);
        assert_eq!(offset_x_for_crop_width(FRAME_WIDTH), 0);
        assert_eq!(offset_y_for_crop_width(FRAME_WIDTH), 0);
    }

    #[test]
    fn test_banner_crop_width_mapping() {
        assert_eq!(scale_width_for_crop_width(1736), 2124);
        assert_eq!(offset_x_for_crop_width(1736), -102);
        assert_eq!(offset_y_for_crop_width(1736), -57);
    }

    #[test]
    fn test_time_sequence_without_samples() {
        assert_eq!(build_time_sequence(&[], 1920, |w| w), "1920");
    }

    #[test]
    fn test_time_sequence_tests_latest_first() {
        let params = [param(0, 1736), param(60_500, 1920), param(120_000, 1736)];
        assert_eq!(
            build_time_sequence(&params, 1920, |w| w),
            "if(gte(t,120),1736,if(gte(t,60.5),1920,if(gte(t,0),1736,1920)))"
        );
    }

    #[test]
    fn test_crop_graph_uses_derived_values() {
        let graph = build_crop_graph(&[param(0, 1736)]);
        assert!(graph.contains("scale=w='if(gte(t,0),2124,1920)'"));
        assert!(graph.contains("overlay=x='if(gte(t,0),-102,0)':y='if(gte(t,0),-57,0)'"));
        assert!(graph.ends_with("[vout]"));
    }

    #[test]
    fn test_boundary_graph_blackframe_order() {
        let graph = build_boundary_detection_graph();
        let filters: Vec<&str> = graph
            .split(';')
            .flat_map(|chain| chain.split(','))
            .collect();
        let index_of =
            |needle: &str| filters.iter().position(|f| f.contains(needle)).unwrap() as u32;
        assert_eq!(index_of("[cvy0][by]blend") + 1, BLACK_LOGO_FILTER);
        assert_eq!(index_of("[cvy1][wy]blend") + 1, WHITE_LOGO_FILTER);
        assert_eq!(index_of("[cvy2][wby]blend") + 1, WHITE_BORDERS_LOGO_FILTER);
        assert_eq!(index_of("[cvy3]blackframe"), NO_LOGO_FILTER);
        assert_eq!(index_of("[vy1][nly]blend") + 1, NEWSLINE_INTRO_FILTER);
        assert!(graph.ends_with("silencedetect=n=-50dB:d=0.1"));
    }

    #[test]
    fn test_banner_graph_blackframe_index() {
        let graph = build_news_banner_detection_graph();
        let count = graph.split(';').flat_map(|c| c.split(',')).count() as u32;
        assert_eq!(count - 1, NEWS_BANNER_FILTER);
    }
}
