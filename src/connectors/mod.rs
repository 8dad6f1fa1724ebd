pub mod espn;
pub mod pfr;
pub mod thesportsdb;

use chrono::{NaiveDateTime, TimeDelta};
use serde_json::Value;

use crate::config::LeagueSchedule;
use crate::error::Result;
use crate::model::{GameType, League, RawRecord, RawTeamRecord, SourceTag};

pub use espn::EspnConnector;
pub use pfr::PfrConnector;
pub use thesportsdb::TheSportsDbConnector;

/// What part of a season to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchScope {
    Full,
    Phases(Vec<GameType>),
}

impl FetchScope {
    pub fn includes(&self, phase: GameType) -> bool {
        match self {
            FetchScope::Full => true,
            FetchScope::Phases(phases) => phases.contains(&phase),
        }
    }
}

/// Records a connector could parse, plus descriptions of the ones it could
/// not. A malformed record never fails the batch.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub records: Vec<RawRecord>,
    pub malformed: Vec<String>,
}

pub trait SourceConnector: Send + Sync {
    fn source(&self) -> SourceTag;

    fn fetch_games(&self, league: League, season: i32, scope: &FetchScope) -> Result<FetchBatch>;

    fn fetch_teams(&self, league: League) -> Result<Vec<RawTeamRecord>>;

    /// Requests sent so far, retries included.
    fn request_count(&self) -> u64 {
        0
    }
}

pub(crate) fn as_i64_any(v: &Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    if let Some(f) = v.as_f64() {
        return Some(f.round() as i64);
    }
    v.as_str()?.trim().parse::<i64>().ok()
}

pub(crate) fn as_i32_any(v: &Value) -> Option<i32> {
    let n = as_i64_any(v)?;
    i32::try_from(n).ok()
}

pub(crate) fn as_f64_any(v: &Value) -> Option<f64> {
    if let Some(f) = v.as_f64() {
        return Some(f);
    }
    v.as_str()?.trim().parse::<f64>().ok()
}

pub(crate) fn as_string_any(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

pub(crate) fn field<'a>(v: &'a Value, key: &str) -> Option<&'a Value> {
    v.get(key).filter(|f| !f.is_null())
}

/// Shifts a UTC kickoff into the league's fixed local offset.
pub(crate) fn utc_to_local(utc: NaiveDateTime, offset_hours: i32) -> NaiveDateTime {
    utc + TimeDelta::hours(i64::from(offset_hours))
}

pub(crate) fn offset_for(schedules: &[LeagueSchedule], league: League) -> i32 {
    schedules
        .iter()
        .find(|s| s.league == league)
        .map(|s| s.local_utc_offset_hours)
        .unwrap_or_default()
}

/// Collapses free-text weather into a handful of conditions.
pub fn normalize_weather(raw: &str) -> Option<String> {
    let k = raw.trim().to_ascii_lowercase();
    if k.is_empty() {
        return None;
    }
    let condition = if k.contains("snow") || k.contains("flurr") {
        "snow"
    } else if k.contains("rain") || k.contains("storm") || k.contains("shower") {
        "rain"
    } else if k.contains("wind") {
        "windy"
    } else if k.contains("cloud") || k.contains("overcast") {
        "cloudy"
    } else if k.contains("clear") || k.contains("sun") || k.contains("fair") {
        "clear"
    } else if k.contains("indoor") || k.contains("dome") {
        "indoor"
    } else {
        "other"
    };
    Some(condition.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_helpers_accept_strings() {
        assert_eq!(as_i32_any(&json!("21")), Some(21));
        assert_eq!(as_i32_any(&json!(17)), Some(17));
        assert_eq!(as_i32_any(&json!("")), None);
        assert_eq!(as_string_any(&json!(134944)), Some("134944".to_string()));
    }

    #[test]
    fn weather_is_normalized() {
        assert_eq!(normalize_weather("Partly Sunny").as_deref(), Some("clear"));
        assert_eq!(normalize_weather("Mostly Cloudy").as_deref(), Some("cloudy"));
        assert_eq!(normalize_weather("Thunderstorms").as_deref(), Some("rain"));
        assert_eq!(normalize_weather("Light Snow").as_deref(), Some("snow"));
        assert_eq!(normalize_weather("Haze").as_deref(), Some("other"));
        assert_eq!(normalize_weather("  "), None);
    }
}
