use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{NaiveDate, NaiveTime};
use serde_json::Value;
use tracing::{debug, info};

use super::{
    FetchBatch, FetchScope, SourceConnector, as_i32_any, as_i64_any, as_string_any, field,
    offset_for, utc_to_local,
};
use crate::config::{LeagueSchedule, SourceSettings};
use crate::error::{Result, SyncError};
use crate::model::{League, RawRecord, RawTeamRecord, ScheduleRecord, SourceTag};
use crate::transport::{SourceClient, Transport};

const SCHEDULE_KEYS: [&str; 3] = ["schedule", "events", "list"];

pub fn league_id(league: League) -> u32 {
    match league {
        League::Nfl => 4391,
        League::Cfl => 4405,
        League::Ncaa => 4479,
    }
}

/// Primary schedule API. One request returns every phase of a season, so the
/// fetch scope never narrows the request.
pub struct TheSportsDbConnector {
    client: SourceClient,
    base_url: String,
    schedules: Vec<LeagueSchedule>,
}

impl TheSportsDbConnector {
    pub fn new(
        settings: &SourceSettings,
        transport: Arc<dyn Transport>,
        schedules: Vec<LeagueSchedule>,
    ) -> Self {
        Self {
            client: SourceClient::new(settings, transport),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            schedules,
        }
    }

    fn get_json(&self, url: &str) -> Result<Value> {
        let body = self.client.get_text(url)?;
        serde_json::from_str::<Value>(body.trim()).map_err(|e| SyncError::MalformedRecord {
            source_tag: SourceTag::TheSportsDb,
            message: format!("invalid json from {url}: {e}"),
        })
    }
}

impl SourceConnector for TheSportsDbConnector {
    fn source(&self) -> SourceTag {
        SourceTag::TheSportsDb
    }

    fn fetch_games(&self, league: League, season: i32, _scope: &FetchScope) -> Result<FetchBatch> {
        let url = format!(
            "{}/schedule/league/{}/{season}",
            self.base_url,
            league_id(league)
        );
        let value = self.get_json(&url)?;
        let batch = parse_schedule(&value, league, season, offset_for(&self.schedules, league));
        info!(
            source = "thesportsdb",
            %league,
            season,
            events = batch.records.len(),
            malformed = batch.malformed.len(),
            "schedule fetched"
        );
        Ok(batch)
    }

    fn fetch_teams(&self, league: League) -> Result<Vec<RawTeamRecord>> {
        let url = format!("{}/list/teams/{}", self.base_url, league_id(league));
        let value = self.get_json(&url)?;
        Ok(parse_teams(&value))
    }

    fn request_count(&self) -> u64 {
        self.client.request_count()
    }
}

pub fn parse_schedule(value: &Value, league: League, season: i32, offset_hours: i32) -> FetchBatch {
    let events = SCHEDULE_KEYS
        .iter()
        .find_map(|k| value.get(*k).and_then(|v| v.as_array()));
    let mut batch = FetchBatch::default();
    let Some(events) = events else {
        debug!(%league, season, "schedule payload has no events");
        return batch;
    };
    for event in events {
        match parse_event(event, league, season, offset_hours) {
            Ok(rec) => batch.records.push(RawRecord::Schedule(rec)),
            Err(err) => batch.malformed.push(format!("thesportsdb: {err:#}")),
        }
    }
    batch
}

fn parse_event(
    v: &Value,
    league: League,
    fallback_season: i32,
    offset_hours: i32,
) -> anyhow::Result<ScheduleRecord> {
    let event_id = field(v, "idEvent")
        .and_then(as_string_any)
        .ok_or_else(|| anyhow!("event without idEvent"))?;
    let home = field(v, "idHomeTeam")
        .and_then(as_string_any)
        .with_context(|| format!("event {event_id}: missing idHomeTeam"))?;
    let away = field(v, "idAwayTeam")
        .and_then(as_string_any)
        .with_context(|| format!("event {event_id}: missing idAwayTeam"))?;
    let (date, time) = event_kickoff(v, offset_hours)
        .with_context(|| format!("event {event_id}: no usable dateEvent"))?;
    let season = field(v, "strSeason")
        .and_then(as_string_any)
        .and_then(|s| s.get(..4).and_then(|y| y.parse::<i32>().ok()))
        .unwrap_or(fallback_season);

    Ok(ScheduleRecord {
        event_id,
        league,
        season,
        round: field(v, "intRound").and_then(as_i32_any),
        date,
        time,
        home_team_id: home,
        away_team_id: away,
        home_score: field(v, "intHomeScore").and_then(as_i32_any),
        away_score: field(v, "intAwayScore").and_then(as_i32_any),
        venue: field(v, "strVenue").and_then(as_string_any),
        status: field(v, "strStatus").and_then(as_string_any),
        payload: v.clone(),
    })
}

// Local date/time fields win; otherwise the UTC pair is shifted.
fn event_kickoff(v: &Value, offset_hours: i32) -> Option<(NaiveDate, Option<NaiveTime>)> {
    if let Some(local) = field(v, "dateEventLocal").and_then(as_string_any)
        && let Ok(date) = NaiveDate::parse_from_str(&local, "%Y-%m-%d")
    {
        let time = field(v, "strTimeLocal")
            .and_then(as_string_any)
            .and_then(|t| parse_time(&t));
        return Some((date, time));
    }
    let raw = field(v, "dateEvent").and_then(as_string_any)?;
    let date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d").ok()?;
    let Some(utc_time) = field(v, "strTime")
        .and_then(as_string_any)
        .and_then(|t| parse_time(&t))
    else {
        return Some((date, None));
    };
    let local = utc_to_local(date.and_time(utc_time), offset_hours);
    Some((local.date(), Some(local.time())))
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    let t = raw.get(..8).unwrap_or(raw);
    let t = t.trim();
    NaiveTime::parse_from_str(t, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M"))
        .ok()
        // The API writes 00:00:00 for "time not announced".
        .filter(|t| Some(*t) != NaiveTime::from_hms_opt(0, 0, 0))
}

pub fn parse_teams(value: &Value) -> Vec<RawTeamRecord> {
    let Some(list) = ["list", "teams"]
        .iter()
        .find_map(|k| value.get(*k).and_then(|v| v.as_array()))
    else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|t| {
            let native_id = field(t, "idTeam").and_then(as_string_any)?;
            let name = field(t, "strTeam").and_then(as_string_any)?;
            Some(RawTeamRecord {
                source: SourceTag::TheSportsDb,
                native_id,
                name,
                city: field(t, "strLocation").and_then(as_string_any),
                abbreviation: field(t, "strTeamShort").and_then(as_string_any),
                stadium_name: field(t, "strStadium").and_then(as_string_any),
                stadium_capacity: field(t, "intStadiumCapacity").and_then(as_i64_any),
                latitude: None,
                longitude: None,
                conference: None,
                division: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn utc_kickoff_shifts_to_local_calendar_day() {
        let v = json!({
            "idEvent": "1", "idHomeTeam": "134944", "idAwayTeam": "134927",
            "dateEvent": "2023-09-08", "strTime": "00:20:00"
        });
        let rec = parse_event(&v, League::Nfl, 2023, -5).expect("event");
        assert_eq!(rec.date, NaiveDate::from_ymd_opt(2023, 9, 7).expect("date"));
        assert_eq!(rec.time, NaiveTime::from_hms_opt(19, 20, 0));
    }

    #[test]
    fn midnight_time_means_unknown() {
        assert_eq!(parse_time("00:00:00"), None);
        assert_eq!(parse_time("13:00:00+00:00"), NaiveTime::from_hms_opt(13, 0, 0));
    }

    #[test]
    fn event_without_teams_is_malformed() {
        let v = json!({ "schedule": [ { "idEvent": "9", "dateEvent": "2023-09-10" } ] });
        let batch = parse_schedule(&v, League::Nfl, 2023, -5);
        assert!(batch.records.is_empty());
        assert_eq!(batch.malformed.len(), 1);
    }
}
