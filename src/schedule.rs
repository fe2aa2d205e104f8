//! The broadcaster's EPG: fetching, caching and picking what is on air.

use crate::error::{RecorderError, Result};
use crate::programme::Programme;
use chrono::{DateTime, Duration, Utc};
use regex::{Regex, RegexBuilder};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::{debug, error, info, warn};

const SCHEDULE_LOOKBEHIND: Duration = Duration::hours(2);
const SCHEDULE_LOOKAHEAD: Duration = Duration::days(7);
pub const MAX_CACHE_AGE: Duration = Duration::hours(1);

static API_KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"window\.nw_api_key=window\.nw_api_key\|\|"(?<key>[^"]+)""#).unwrap()
});

#[derive(Debug, Deserialize)]
struct ScheduleResponse {
    channel: Option<Channel>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    item: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    subtitle: String,
    #[serde(default)]
    series_id: String,
    #[serde(default)]
    airing_id: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    thumbnail: String,
    #[serde(default, rename = "content_clean")]
    content: String,
    #[serde(default)]
    pub_date: String,
    #[serde(default)]
    end_date: String,
}

fn parse_epoch_ms(value: &str) -> Result<DateTime<Utc>> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| RecorderError::Parse {
            what: "schedule date",
            value: value.into(),
        })
}

impl TryFrom<ScheduleItem> for Programme {
    type Error = RecorderError;

    fn try_from(item: ScheduleItem) -> Result<Self> {
        let start_date = parse_epoch_ms(&item.pub_date)?;
        let end_date = parse_epoch_ms(&item.end_date)?;
        if end_date <= start_date {
            return Err(RecorderError::Validation(format!(
                "'{}' ends before it starts",
                item.title
            )));
        }
        Ok(Programme {
            title: item.title,
            subtitle: item.subtitle,
            series_id: item.series_id,
            airing_id: item.airing_id,
            description: item.description,
            content: item.content,
            thumbnail: item.thumbnail,
            start_date,
            end_date,
        })
    }
}

pub fn parse_schedule(body: &str) -> Result<Vec<Programme>> {
    let response: ScheduleResponse = serde_json::from_str(body)?;
    let items = response
        .channel
        .and_then(|c| c.item)
        .ok_or_else(|| RecorderError::Parse {
            what: "schedule",
            value: "missing channel.item".into(),
        })?;
    Ok(items.into_iter().filter_map(parse_item).collect())
}

/// One malformed entry is skipped rather than hiding the rest of the week.
fn parse_item(value: serde_json::Value) -> Option<Programme> {
    let title = value
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    let programme = serde_json::from_value::<ScheduleItem>(value)
        .map_err(RecorderError::from)
        .and_then(Programme::try_from);
    match programme {
        Ok(programme) => Some(programme),
        Err(err) => {
            warn!(%title, %err, "skipping schedule item");
            None
        }
    }
}

pub fn parse_api_key(script: &str) -> Option<String> {
    API_KEY_PATTERN
        .captures(script)
        .map(|caps| caps["key"].to_string())
}

pub fn schedule_url(base: &str, api_key: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "{base}/nhkworld/epg/v7a/world/s{}-e{}.json?apikey={api_key}",
        start.timestamp_millis(),
        end.timestamp_millis()
    )
}

/// Blocking client for the schedule API.
#[derive(Debug, Clone)]
pub struct ScheduleClient {
    schedule_url: String,
    assets_url: String,
    api_key: Option<String>,
    http: Client,
}

impl ScheduleClient {
    pub fn new(
        schedule_url: impl Into<String>,
        assets_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            schedule_url: schedule_url.into().trim_end_matches('/').to_string(),
            assets_url: assets_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
        })
    }

    /// The configured key, otherwise the one embedded in the site's script.
    pub fn api_key(&self) -> Result<String> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }
        let url = format!("{}/nhkworld/common/js/common.js", self.assets_url);
        let script = self.http.get(url).send()?.error_for_status()?.text()?;
        let key = parse_api_key(&script).ok_or_else(|| RecorderError::Parse {
            what: "API key",
            value: "not present in common.js".into(),
        })?;
        debug!(%key, "retrieved API key");
        Ok(key)
    }

    pub fn fetch(&self, now: DateTime<Utc>) -> Result<Vec<Programme>> {
        let key = self.api_key()?;
        let url = schedule_url(
            &self.schedule_url,
            &key,
            now - SCHEDULE_LOOKBEHIND,
            now + SCHEDULE_LOOKAHEAD,
        );
        let body = self.http.get(url).send()?.error_for_status()?.text()?;
        let programmes = parse_schedule(&body)?;
        info!(count = programmes.len(), "schedule retrieved");
        Ok(programmes)
    }
}

/// Schedule memo with an expiry. A stale copy is served when a refresh fails.
#[derive(Debug)]
pub struct ScheduleCache {
    programmes: Option<Vec<Programme>>,
    fetched_at: Option<DateTime<Utc>>,
    max_age: Duration,
}

impl Default for ScheduleCache {
    fn default() -> Self {
        Self::new(MAX_CACHE_AGE)
    }
}

impl ScheduleCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            programmes: None,
            fetched_at: None,
            max_age,
        }
    }

    pub fn get<F>(&mut self, now: DateTime<Utc>, fetch: F) -> Result<&[Programme]>
    where
        F: FnOnce() -> Result<Vec<Programme>>,
    {
        let age = self.fetched_at.map(|at| now - at);
        if let (Some(age), Some(_)) = (age, &self.programmes) {
            if age < self.max_age {
                debug!(age_secs = age.num_seconds(), "using cached schedule");
                return Ok(self.programmes.as_deref().unwrap_or_default());
            }
        }

        debug!("retrieving schedule");
        match fetch() {
            Ok(programmes) => {
                self.programmes = Some(programmes);
                self.fetched_at = Some(now);
            }
            Err(err) if self.programmes.is_some() => {
                error!(%err, "failed to get schedule data");
                info!(
                    age_secs = age.map(|a| a.num_seconds()),
                    "falling back to old cached schedule"
                );
            }
            Err(err) => return Err(err),
        }
        Ok(self.programmes.as_deref().unwrap_or_default())
    }
}

/// The programme on air `safety_buffer_ms` from now, so a capture starts
/// ahead of its scheduled start.
pub fn current_programme(
    programmes: &[Programme],
    now: DateTime<Utc>,
    safety_buffer_ms: u64,
) -> Option<&Programme> {
    let at = now + Duration::milliseconds(safety_buffer_ms as i64);
    programmes.iter().find(|p| p.is_airing_at(at))
}

fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');
    RegexBuilder::new(&expr).case_insensitive(true).build()
}

/// Which programmes are worth recording.
#[derive(Debug, Clone)]
pub struct ProgrammeFilter {
    patterns: Vec<Regex>,
    minimum_duration_ms: u64,
}

impl ProgrammeFilter {
    pub fn new(patterns: &[String], minimum_duration_ms: u64) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob_to_regex(p).map_err(|_| RecorderError::Parse {
                    what: "match pattern",
                    value: p.clone(),
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            patterns,
            minimum_duration_ms,
        })
    }

    pub fn is_desired(&self, programme: &Programme) -> bool {
        self.patterns.iter().any(|re| re.is_match(&programme.title))
            && programme.scheduled_duration_ms() > self.minimum_duration_ms
    }
}
