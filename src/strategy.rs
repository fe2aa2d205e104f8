//! Ordered-fallback search for runs of matching frames.
//!
//! Each [`Strategy`] names the blackframe filters it trusts, how long a run
//! must be and how close to a silence it must sit. Strategies are tried most
//! reliable first; the first one that yields anything wins.

use crate::filters::{
    BLACK_LOGO_FILTER, NEWS_BANNER_FILTER, NEWSLINE_INTRO_FILTER, NO_LOGO_FILTER,
    WHITE_BORDERS_LOGO_FILTER, WHITE_LOGO_FILTER,
};
use crate::interval::IntervalTree;
use tracing::debug;

/// A frame reported by one of the analysis filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEvent {
    pub filter_id: u32,
    pub frame: u64,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub name: String,
    pub filter_ids: Vec<u32>,
    pub max_frame_gap: u64,
    pub min_silence_seconds: f64,
    pub min_consecutive_frames: usize,
}

impl Strategy {
    pub fn new(name: impl Into<String>, filter_ids: &[u32], min_consecutive_frames: usize) -> Self {
        Self {
            name: name.into(),
            filter_ids: filter_ids.to_vec(),
            max_frame_gap: 1,
            min_silence_seconds: 0.0,
            min_consecutive_frames,
        }
    }

    pub fn with_max_frame_gap(mut self, gap: u64) -> Self {
        self.max_frame_gap = gap;
        self
    }

    pub fn with_min_silence_seconds(mut self, seconds: f64) -> Self {
        self.min_silence_seconds = seconds;
        self
    }

    fn accepts_silence(&self, silences: &IntervalTree<u64>, time_ms: u64) -> bool {
        if self.min_silence_seconds <= 0.0 {
            return true;
        }
        let min_ms = self.min_silence_seconds * 1000.0;
        silences
            .overlaps(time_ms)
            .into_iter()
            .any(|duration_ms| *duration_ms as f64 >= min_ms)
    }
}

/// One maximal run of same-filter frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryCandidate {
    pub filter_id: u32,
    pub start_ms: u64,
    pub end_ms: u64,
    pub first_frame: u64,
    pub last_frame: u64,
}

/// Strategies for programme boundaries, most reliable first.
pub fn boundary_strategies() -> Vec<Strategy> {
    vec![
        Strategy::new("black-logo", &[BLACK_LOGO_FILTER], 5).with_min_silence_seconds(1.5),
        Strategy::new("white-logo", &[WHITE_LOGO_FILTER], 5).with_min_silence_seconds(1.5),
        Strategy::new("white-borders-logo", &[WHITE_BORDERS_LOGO_FILTER], 5)
            .with_min_silence_seconds(1.5),
        Strategy::new("no-logo", &[NO_LOGO_FILTER], 3).with_min_silence_seconds(0.1),
        Strategy::new("newsline", &[NEWSLINE_INTRO_FILTER], 1),
    ]
}

/// Sustained match against the news banner background.
pub fn news_banner_strategy() -> Strategy {
    Strategy::new("news-banner-background", &[NEWS_BANNER_FILTER], 60).with_max_frame_gap(120)
}

pub fn find_candidates(
    events: &[FrameEvent],
    strategy: &Strategy,
    silences: &IntervalTree<u64>,
) -> Vec<BoundaryCandidate> {
    let mut frames: Vec<FrameEvent> = events
        .iter()
        .filter(|e| strategy.filter_ids.contains(&e.filter_id))
        .filter(|e| strategy.accepts_silence(silences, e.time_ms))
        .copied()
        .collect();
    frames.sort_by_key(|e| (e.filter_id, e.frame));

    let mut runs: Vec<Vec<FrameEvent>> = Vec::new();
    for frame in frames {
        let extends = runs.last().and_then(|run| run.last()).is_some_and(|last| {
            last.filter_id == frame.filter_id && frame.frame - last.frame <= strategy.max_frame_gap
        });
        match runs.last_mut() {
            Some(run) if extends => run.push(frame),
            _ => runs.push(vec![frame]),
        }
    }

    runs.into_iter()
        .filter(|run| run.len() >= strategy.min_consecutive_frames)
        .filter_map(|run| {
            let (first, last) = (run.first()?, run.last()?);
            Some(BoundaryCandidate {
                filter_id: first.filter_id,
                start_ms: first.time_ms,
                end_ms: last.time_ms,
                first_frame: first.frame,
                last_frame: last.frame,
            })
        })
        .collect()
}

/// Runs `strategies` in order and returns the first non-empty result along
/// with the strategy that produced it.
pub fn search<'a>(
    events: &[FrameEvent],
    silences: &IntervalTree<u64>,
    strategies: &'a [Strategy],
) -> Option<(&'a Strategy, Vec<BoundaryCandidate>)> {
    for strategy in strategies {
        debug!(strategy = %strategy.name, "searching for candidates");
        let candidates = find_candidates(events, strategy, silences);
        debug!(
            strategy = %strategy.name,
            count = candidates.len(),
            ?candidates,
            "candidates found"
        );
        if !candidates.is_empty() {
            return Some((strategy, candidates));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop, prop_assert, prop_assert_eq, proptest};
    use proptest::strategy::Strategy as _;

    fn ev(filter_id: u32, frame: u64, time_ms: u64) -> FrameEvent {
        FrameEvent { filter_id, frame, time_ms }
    }

    fn run(filter_id: u32, first: u64, count: u64, fps_ms: u64) -> Vec<FrameEvent> {
        (first..first + count)
            .map(|f| ev(filter_id, f, f * fps_ms))
            .collect()
    }

    fn silence_tree(windows: &[(u64, u64)]) -> IntervalTree<u64> {
        let mut tree = IntervalTree::new();
        for (start, end) in windows {
            tree.insert(*start, *end, end - start);
        }
        tree
    }

    #[test]
    fn test_groups_consecutive_frames() {
        let mut events = run(9, 100, 6, 40);
        events.extend(run(9, 200, 2, 40));
        let strategy = Strategy::new("t", &[9], 5);
        let found = find_candidates(&events, &strategy, &IntervalTree::new());
        assert_eq!(
            found,
            vec![BoundaryCandidate {
                filter_id: 9,
                start_ms: 4_000,
                end_ms: 4_200,
                first_frame: 100,
                last_frame: 105,
            }]
        );
    }

    #[test]
    fn test_frame_gap_tolerance() {
        let events = vec![ev(13, 10, 400), ev(13, 100, 4_000), ev(13, 300, 12_000)];
        let tight = Strategy::new("t", &[13], 2);
        assert!(find_candidates(&events, &tight, &IntervalTree::new()).is_empty());

        let loose = Strategy::new("t", &[13], 2).with_max_frame_gap(120);
        let found = find_candidates(&events, &loose, &IntervalTree::new());
        assert_eq!(found.len(), 1);
        assert_eq!((found[0].first_frame, found[0].last_frame), (10, 100));
    }

    #[test]
    fn test_different_filters_never_merge() {
        let events = vec![ev(9, 1, 40), ev(11, 2, 80), ev(9, 2, 80), ev(11, 3, 120)];
        let strategy = Strategy::new("t", &[9, 11], 2);
        let found = find_candidates(&events, &strategy, &IntervalTree::new());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].filter_id, 9);
        assert_eq!(found[1].filter_id, 11);
    }

    #[test]
    fn test_silence_gate() {
        let events = run(9, 100, 5, 40);
        let strategy = Strategy::new("t", &[9], 5).with_min_silence_seconds(1.5);

        let short = silence_tree(&[(3_900, 4_500)]);
        assert!(find_candidates(&events, &strategy, &short).is_empty());

        let long = silence_tree(&[(3_000, 4_600)]);
        assert_eq!(find_candidates(&events, &strategy, &long).len(), 1);
    }

    #[test]
    fn test_search_falls_back_in_order() {
        let mut events = run(NO_LOGO_FILTER, 100, 3, 40);
        events.extend(run(NEWSLINE_INTRO_FILTER, 500, 1, 40));
        let silences = silence_tree(&[(3_900, 4_200)]);
        let strategies = boundary_strategies();

        let (strategy, found) = search(&events, &silences, &strategies).unwrap();
        assert_eq!(strategy.name, "no-logo");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start_ms, 4_000);
    }

    #[test]
    fn test_search_without_matches() {
        let strategies = boundary_strategies();
        assert!(search(&[], &IntervalTree::new(), &strategies).is_none());
    }

    fn events_strategy() -> impl proptest::strategy::Strategy<Value = Vec<FrameEvent>> {
        prop::collection::vec((0u32..4, 0u64..60, 0u64..10_000), 0..120)
            .prop_map(|raw| raw.into_iter().map(|(f, n, t)| ev(f, n, t)).collect())
    }

    fn strategies_strategy() -> impl proptest::strategy::Strategy<Value = Vec<Strategy>> {
        prop::collection::vec(
            (
                prop::collection::vec(0u32..4, 1..3),
                0u64..4,
                1usize..5,
                prop::sample::select(vec![0.0, 0.1, 1.5]),
            ),
            1..5,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (ids, gap, min, silence))| {
                    Strategy::new(format!("s{i}"), &ids, min)
                        .with_max_frame_gap(gap)
                        .with_min_silence_seconds(silence)
                })
                .collect()
        })
    }

    fn silences_strategy() -> impl proptest::strategy::Strategy<Value = Vec<(u64, u64)>> {
        prop::collection::vec((0u64..10_000, 0u64..3_000), 0..8)
            .prop_map(|raw| raw.into_iter().map(|(start, len)| (start, start + len)).collect())
    }

    fn in_long_enough_silence(windows: &[(u64, u64)], time_ms: u64, min_seconds: f64) -> bool {
        min_seconds <= 0.0
            || windows.iter().any(|(start, end)| {
                *start <= time_ms && time_ms <= *end && (end - start) as f64 >= min_seconds * 1000.0
            })
    }

    proptest! {
        #[test]
        fn test_search_returns_first_non_empty_strategy(
            events in events_strategy(),
            strategies in strategies_strategy(),
            windows in silences_strategy(),
        ) {
            let silences = silence_tree(&windows);
            let first = strategies
                .iter()
                .position(|s| !find_candidates(&events, s, &silences).is_empty());
            match (search(&events, &silences, &strategies), first) {
                (Some((chosen, found)), Some(index)) => {
                    prop_assert_eq!(&chosen.name, &strategies[index].name);
                    prop_assert_eq!(found, find_candidates(&events, &strategies[index], &silences));
                }
                (None, None) => {}
                (got, expected) => {
                    prop_assert!(false, "got {:?}, expected index {:?}", got, expected)
                }
            }
        }

        #[test]
        fn test_candidates_are_well_formed(
            events in events_strategy(),
            strategies in strategies_strategy(),
            windows in silences_strategy(),
        ) {
            let silences = silence_tree(&windows);
            for strategy in &strategies {
                for c in find_candidates(&events, strategy, &silences) {
                    prop_assert!(c.first_frame <= c.last_frame);
                    prop_assert!(strategy.filter_ids.contains(&c.filter_id));
                    let members: Vec<&FrameEvent> = events
                        .iter()
                        .filter(|e| e.filter_id == c.filter_id)
                        .filter(|e| e.frame == c.first_frame || e.frame == c.last_frame)
                        .collect();
                    prop_assert!(!members.is_empty());
                    for edge in [c.start_ms, c.end_ms] {
                        prop_assert!(in_long_enough_silence(
                            &windows,
                            edge,
                            strategy.min_silence_seconds
                        ));
                    }
                }
            }
        }

        #[test]
        fn test_silence_gate_matches_naive_scan(
            events in events_strategy(),
            windows in silences_strategy(),
            min_seconds in prop::sample::select(vec![0.1, 1.0, 1.5]),
        ) {
            let silences = silence_tree(&windows);
            let strategy = Strategy::new("gate", &[0, 1, 2, 3], 1)
                .with_max_frame_gap(0)
                .with_min_silence_seconds(min_seconds);
            let accepted = events
                .iter()
                .filter(|e| strategy.accepts_silence(&silences, e.time_ms))
                .count();
            let expected = events
                .iter()
                .filter(|e| in_long_enough_silence(&windows, e.time_ms, min_seconds))
                .count();
            prop_assert_eq!(accepted, expected);
        }
    }
}
