use std::fs;
use std::path::PathBuf;

use chrono::{NaiveDate, NaiveTime};
use serde_json::Value;

use gridiron_sync::connectors::espn::{parse_box_scores, parse_scoreboard};
use gridiron_sync::connectors::pfr::parse_games_table;
use gridiron_sync::connectors::thesportsdb::{parse_schedule, parse_teams};
use gridiron_sync::model::{GameType, League, RawRecord};

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

fn read_json(name: &str) -> Value {
    serde_json::from_str(&read_fixture(name)).expect("fixture should be valid json")
}

#[test]
fn parses_thesportsdb_schedule_fixture() {
    let batch = parse_schedule(&read_json("tsdb_schedule.json"), League::Nfl, 2023, -5);
    assert_eq!(batch.records.len(), 2);
    assert_eq!(batch.malformed.len(), 1);

    let RawRecord::Schedule(first) = &batch.records[0] else {
        panic!("expected a schedule record");
    };
    assert_eq!(first.event_id, "1850101");
    assert_eq!(first.home_team_id, "134944");
    assert_eq!(first.date, NaiveDate::from_ymd_opt(2023, 9, 10).expect("date"));
    assert_eq!(first.time, NaiveTime::from_hms_opt(12, 0, 0));
    assert_eq!((first.home_score, first.away_score), (Some(21), Some(17)));

    let game = batch.records[0].clone().into_game_record();
    assert_eq!(game.week, Some(1));
    assert_eq!(game.declared_type, Some(GameType::Regular));
    assert_eq!(game.native_id.as_deref(), Some("1850101"));
}

#[test]
fn unplayed_schedule_event_has_no_scores() {
    let batch = parse_schedule(&read_json("tsdb_schedule.json"), League::Nfl, 2023, -5);
    let game = batch.records[1].clone().into_game_record();
    assert_eq!(game.away_ref, "999999");
    assert_eq!(game.home_score, None);
    // UTC 17:00 shifted five hours back
    assert_eq!(game.kickoff_time, NaiveTime::from_hms_opt(12, 0, 0));
}

#[test]
fn parses_thesportsdb_team_list() {
    let teams = parse_teams(&read_json("tsdb_teams.json"));
    assert_eq!(teams.len(), 2);
    assert_eq!(teams[0].native_id, "134944");
    assert_eq!(teams[0].stadium_capacity, Some(76_416));
    assert_eq!(teams[1].city, None);
}

#[test]
fn parses_espn_scoreboard_fixture() {
    let page = parse_scoreboard(
        &read_json("espn_scoreboard.json"),
        League::Nfl,
        2023,
        GameType::Regular,
        -5,
    );
    // the all-star exhibition is skipped, the competitor-less event is malformed
    assert_eq!(page.records.len(), 1);
    assert_eq!(page.malformed.len(), 1);

    let rec = &page.records[0];
    assert_eq!(rec.event_id, "401547353");
    assert_eq!(rec.local_date, NaiveDate::from_ymd_opt(2023, 9, 10).expect("date"));
    assert_eq!(rec.kickoff_time, NaiveTime::from_hms_opt(12, 0, 0));
    assert_eq!(rec.attendance, Some(68_000));
    assert_eq!(rec.weather_condition.as_deref(), Some("clear"));
    assert_eq!(rec.weather_temp, Some(84.0));
    assert!(rec.completed);
    assert!(!rec.overtime);
    assert_eq!(rec.season_type, Some(GameType::Regular));
    assert_eq!(rec.week, Some(1));
}

#[test]
fn parses_espn_box_scores() {
    let boxes = parse_box_scores(&read_json("espn_summary.json"), "KC");
    assert_eq!(boxes.len(), 2);
    let home = boxes.iter().find(|b| b.is_home).expect("home box");
    assert_eq!(home.team_ref, "KC");
    assert_eq!(home.total_yards, Some(389));
    assert_eq!(home.passing_yards, Some(265));
    assert_eq!(home.penalties, Some(5));
    let away = boxes.iter().find(|b| !b.is_home).expect("away box");
    assert_eq!(away.first_downs, Some(18));
    assert_eq!(away.turnovers, Some(2));
}

#[test]
fn parses_pfr_games_table() {
    let batch = parse_games_table(&read_fixture("pfr_games.htm"), League::Nfl, 2023)
        .expect("table should parse");
    assert_eq!(batch.records.len(), 3);
    assert_eq!(batch.malformed.len(), 1);

    let RawRecord::Scraped(first) = &batch.records[0] else {
        panic!("expected a scraped record");
    };
    assert_eq!(first.home_name, "Kansas City Chiefs");
    assert_eq!(first.boxscore_id.as_deref(), Some("202309100kan"));
    assert_eq!(first.home_yards, Some(389));

    // winner marked "@" played away
    let RawRecord::Scraped(road) = &batch.records[1] else {
        panic!("expected a scraped record");
    };
    assert_eq!(road.home_name, "Oakland Raiders");
    assert_eq!((road.home_score, road.away_score), (Some(10), Some(38)));
    assert_eq!(road.time, NaiveTime::from_hms_opt(16, 25, 0));

    let playoff = batch.records[2].clone().into_game_record();
    assert_eq!(playoff.declared_type, Some(GameType::Playoff));
    assert_eq!(playoff.week, None);
    assert_eq!(playoff.box_scores.len(), 2);
}

#[test]
fn page_without_games_table_is_an_error() {
    assert!(parse_games_table("<html><body></body></html>", League::Nfl, 2023).is_err());
}
