use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::NaiveDateTime;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    FetchBatch, FetchScope, SourceConnector, as_f64_any, as_i32_any, as_i64_any, as_string_any,
    field, normalize_weather, offset_for, utc_to_local,
};
use crate::config::{LeagueSchedule, SourceSettings};
use crate::error::{Result, SyncError};
use crate::model::{GameType, League, RawBoxScore, RawRecord, RawTeamRecord, SourceTag, StatsRecord};
use crate::transport::{SourceClient, Transport};

// Postseason week 4 is the all-star game.
const POSTSEASON_WEEKS: [u32; 4] = [1, 2, 3, 5];
const PRESEASON_WEEKS: u32 = 4;
const ALL_STAR_TEAMS: [&str; 2] = ["afc", "nfc"];

fn season_type_code(phase: GameType) -> u8 {
    match phase {
        GameType::Preseason => 1,
        GameType::Regular => 2,
        GameType::Playoff => 3,
    }
}

fn phase_for_code(code: i64) -> Option<GameType> {
    match code {
        1 => Some(GameType::Preseason),
        2 => Some(GameType::Regular),
        3 => Some(GameType::Playoff),
        _ => None,
    }
}

/// Statistics API: week-by-week scoreboards, plus one summary request per
/// finished game for box scores.
pub struct EspnConnector {
    client: SourceClient,
    base_url: String,
    schedules: Vec<LeagueSchedule>,
    fetch_box_scores: bool,
}

impl EspnConnector {
    pub fn new(
        settings: &SourceSettings,
        transport: Arc<dyn Transport>,
        schedules: Vec<LeagueSchedule>,
        fetch_box_scores: bool,
    ) -> Self {
        Self {
            client: SourceClient::new(settings, transport),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            schedules,
            fetch_box_scores,
        }
    }

    fn get_json(&self, url: &str) -> Result<Value> {
        let body = self.client.get_text(url)?;
        serde_json::from_str::<Value>(body.trim()).map_err(|e| SyncError::MalformedRecord {
            source_tag: SourceTag::Espn,
            message: format!("invalid json from {url}: {e}"),
        })
    }

    fn weeks_for(&self, league: League, season: i32, phase: GameType) -> Vec<u32> {
        match phase {
            GameType::Preseason => (1..=PRESEASON_WEEKS).collect(),
            GameType::Playoff => POSTSEASON_WEEKS.to_vec(),
            GameType::Regular => {
                let games = self
                    .schedules
                    .iter()
                    .find(|s| s.league == league)
                    .map(|s| s.games_per_team(season))
                    .unwrap_or(17);
                // One bye week per team.
                (1..=games + 1).collect()
            }
        }
    }

    fn attach_box_score(&self, rec: &mut StatsRecord) -> Result<()> {
        let url = format!("{}/summary?event={}", self.base_url, rec.event_id);
        let value = self.get_json(&url)?;
        rec.box_scores = parse_box_scores(&value, &rec.home_abbr);
        Ok(())
    }
}

impl SourceConnector for EspnConnector {
    fn source(&self) -> SourceTag {
        SourceTag::Espn
    }

    fn fetch_games(&self, league: League, season: i32, scope: &FetchScope) -> Result<FetchBatch> {
        let phases: Vec<GameType> = match scope {
            FetchScope::Full => vec![GameType::Regular, GameType::Playoff],
            FetchScope::Phases(phases) => phases.clone(),
        };
        let offset = offset_for(&self.schedules, league);
        let mut batch = FetchBatch::default();

        for phase in phases {
            for week in self.weeks_for(league, season, phase) {
                let url = format!(
                    "{}/scoreboard?dates={season}&seasontype={}&week={week}",
                    self.base_url,
                    season_type_code(phase)
                );
                let value = self.get_json(&url)?;
                let page = parse_scoreboard(&value, league, season, phase, offset);
                batch.malformed.extend(page.malformed);
                for mut rec in page.records {
                    if self.fetch_box_scores
                        && rec.completed
                        && let Err(err) = self.attach_box_score(&mut rec)
                    {
                        warn!(source = "espn", event = %rec.event_id, error = %err, "box score unavailable");
                        batch
                            .malformed
                            .push(format!("espn: box score for {}: {err}", rec.event_id));
                    }
                    batch.records.push(RawRecord::Stats(rec));
                }
            }
        }
        info!(
            source = "espn",
            %league,
            season,
            events = batch.records.len(),
            malformed = batch.malformed.len(),
            "scoreboards fetched"
        );
        Ok(batch)
    }

    fn fetch_teams(&self, league: League) -> Result<Vec<RawTeamRecord>> {
        let value = self.get_json(&format!("{}/teams", self.base_url))?;
        let teams = value
            .pointer("/sports/0/leagues/0/teams")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|t| parse_team(t.get("team")?)).collect())
            .unwrap_or_default();
        debug!(%league, "espn team listing parsed");
        Ok(teams)
    }

    fn request_count(&self) -> u64 {
        self.client.request_count()
    }
}

fn parse_team(t: &Value) -> Option<RawTeamRecord> {
    let abbr = field(t, "abbreviation").and_then(as_string_any)?;
    Some(RawTeamRecord {
        source: SourceTag::Espn,
        native_id: abbr.clone(),
        name: field(t, "displayName").and_then(as_string_any)?,
        city: field(t, "location").and_then(as_string_any),
        abbreviation: Some(abbr),
        stadium_name: None,
        stadium_capacity: None,
        latitude: None,
        longitude: None,
        conference: None,
        division: None,
    })
}

pub struct ScoreboardPage {
    pub records: Vec<StatsRecord>,
    pub malformed: Vec<String>,
}

pub fn parse_scoreboard(
    value: &Value,
    league: League,
    season: i32,
    requested: GameType,
    offset_hours: i32,
) -> ScoreboardPage {
    let mut page = ScoreboardPage {
        records: Vec::new(),
        malformed: Vec::new(),
    };
    let Some(events) = value.get("events").and_then(|v| v.as_array()) else {
        return page;
    };
    for event in events {
        match parse_event(event, league, season, requested, offset_hours) {
            Ok(Some(rec)) => page.records.push(rec),
            Ok(None) => {}
            Err(err) => page.malformed.push(format!("espn: {err:#}")),
        }
    }
    page
}

fn parse_event(
    v: &Value,
    league: League,
    season: i32,
    requested: GameType,
    offset_hours: i32,
) -> anyhow::Result<Option<StatsRecord>> {
    let event_id = field(v, "id")
        .and_then(as_string_any)
        .ok_or_else(|| anyhow!("event without id"))?;
    let comp = v
        .pointer("/competitions/0")
        .with_context(|| format!("event {event_id}: no competition"))?;
    let competitors = comp
        .get("competitors")
        .and_then(|c| c.as_array())
        .with_context(|| format!("event {event_id}: no competitors"))?;

    let side = |which: &str| {
        competitors
            .iter()
            .find(|c| c.get("homeAway").and_then(|h| h.as_str()) == Some(which))
    };
    let (Some(home), Some(away)) = (side("home"), side("away")) else {
        return Err(anyhow!("event {event_id}: missing home or away competitor"));
    };
    let abbr = |c: &Value| c.pointer("/team/abbreviation").and_then(as_string_any);
    let home_abbr = abbr(home).with_context(|| format!("event {event_id}: home team code"))?;
    let away_abbr = abbr(away).with_context(|| format!("event {event_id}: away team code"))?;
    if ALL_STAR_TEAMS.contains(&home_abbr.to_ascii_lowercase().as_str()) {
        debug!(event = %event_id, "skipping all-star game");
        return Ok(None);
    }

    let raw_date = field(v, "date")
        .and_then(as_string_any)
        .with_context(|| format!("event {event_id}: no date"))?;
    let utc = parse_utc(&raw_date).with_context(|| format!("event {event_id}: bad date {raw_date}"))?;
    let local = utc_to_local(utc, offset_hours);

    let status = comp.get("status").unwrap_or(&Value::Null);
    let completed = status
        .pointer("/type/completed")
        .and_then(|c| c.as_bool())
        .unwrap_or(false);
    let period = status.get("period").and_then(as_i64_any).unwrap_or(0);
    let detail = status
        .pointer("/type/detail")
        .and_then(as_string_any)
        .unwrap_or_default();
    let overtime = period > 4 || detail.contains("OT");

    let weather = field(v, "weather").or_else(|| field(comp, "weather"));
    let weather_condition = weather
        .and_then(|w| field(w, "displayValue"))
        .and_then(|d| d.as_str())
        .and_then(normalize_weather);
    let weather_temp = weather.and_then(|w| field(w, "temperature")).and_then(as_f64_any);

    Ok(Some(StatsRecord {
        event_id,
        league,
        season: v
            .pointer("/season/year")
            .and_then(as_i32_any)
            .unwrap_or(season),
        season_type: v
            .pointer("/season/type")
            .and_then(as_i64_any)
            .and_then(phase_for_code)
            .or(Some(requested)),
        week: v.pointer("/week/number").and_then(as_i32_any),
        local_date: local.date(),
        kickoff_time: Some(local.time()),
        home_abbr,
        away_abbr,
        home_score: field(home, "score").and_then(as_i32_any),
        away_score: field(away, "score").and_then(as_i32_any),
        completed,
        overtime,
        venue: comp.pointer("/venue/fullName").and_then(as_string_any),
        attendance: field(comp, "attendance").and_then(as_i64_any),
        weather_condition,
        weather_temp,
        box_scores: Vec::new(),
        payload: v.clone(),
    }))
}

fn parse_utc(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M"))
        .ok()
}

/// Team box scores from a game summary payload.
pub fn parse_box_scores(value: &Value, home_abbr: &str) -> Vec<RawBoxScore> {
    let Some(teams) = value.pointer("/boxscore/teams").and_then(|t| t.as_array()) else {
        return Vec::new();
    };
    teams
        .iter()
        .filter_map(|entry| {
            let abbr = entry.pointer("/team/abbreviation").and_then(as_string_any)?;
            let is_home = match entry.get("homeAway").and_then(|h| h.as_str()) {
                Some(side) => side == "home",
                None => abbr.eq_ignore_ascii_case(home_abbr),
            };
            let mut out = RawBoxScore {
                team_ref: abbr,
                is_home,
                payload: entry.get("statistics").cloned().unwrap_or(Value::Null),
                ..RawBoxScore::default()
            };
            for stat in entry
                .get("statistics")
                .and_then(|s| s.as_array())
                .into_iter()
                .flatten()
            {
                let name = stat
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_ascii_lowercase()
                    .replace(' ', "");
                let value = stat
                    .get("displayValue")
                    .and_then(|d| d.as_str())
                    .and_then(leading_number);
                match name.as_str() {
                    "totalyards" => out.total_yards = value,
                    "netpassingyards" | "passingyards" => out.passing_yards = value,
                    "rushingyards" => out.rushing_yards = value,
                    "firstdowns" => out.first_downs = value,
                    "turnovers" => out.turnovers = value,
                    "totalpenaltiesyards" | "penalties" => out.penalties = value,
                    _ => {}
                }
            }
            Some(out)
        })
        .collect()
}

// "389" -> 389; "6-45" -> 6.
fn leading_number(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    let (neg, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let n = digits[..end].parse::<i32>().ok()?;
    Some(if neg { -n } else { n })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_number_handles_compound_values() {
        assert_eq!(leading_number("389"), Some(389));
        assert_eq!(leading_number("6-45"), Some(6));
        assert_eq!(leading_number("-3"), Some(-3));
        assert_eq!(leading_number("30:12"), Some(30));
        assert_eq!(leading_number("--"), None);
    }

    #[test]
    fn utc_formats_parse() {
        assert!(parse_utc("2023-09-08T00:20Z").is_some());
        assert!(parse_utc("2023-09-08T00:20:00Z").is_some());
        assert!(parse_utc("yesterday").is_none());
    }

    #[test]
    fn regular_weeks_follow_schedule_length() {
        let settings = SourceSettings::defaults(SourceTag::Espn);
        struct Never;
        impl Transport for Never {
            fn get(
                &self,
                _url: &str,
                _headers: &[(String, String)],
            ) -> std::result::Result<crate::transport::HttpResponse, crate::transport::TransportError> {
                Ok(crate::transport::HttpResponse::status(500))
            }
        }
        let c = EspnConnector::new(&settings, Arc::new(Never), vec![LeagueSchedule::nfl()], false);
        assert_eq!(c.weeks_for(League::Nfl, 2023, GameType::Regular).len(), 18);
        assert_eq!(c.weeks_for(League::Nfl, 2019, GameType::Regular).len(), 17);
    }
}
