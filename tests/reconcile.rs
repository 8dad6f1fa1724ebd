use chrono::NaiveDate;

use gridiron_sync::classifier::classify;
use gridiron_sync::config::LeagueSchedule;
use gridiron_sync::connectors::pfr::parse_games_table;
use gridiron_sync::identity::IdentityResolver;
use gridiron_sync::merger::{ResolvedRecord, merge, resolve_record};
use gridiron_sync::model::{GameType, League, RawGameRecord, SourceTag};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn resolved(raw: RawGameRecord) -> ResolvedRecord {
    let resolver = IdentityResolver::seeded(League::Nfl);
    resolve_record(&resolver, &LeagueSchedule::nfl(), raw).expect("record should resolve")
}

fn chiefs_cardinals() -> Vec<ResolvedRecord> {
    let mut primary = RawGameRecord::new(
        SourceTag::TheSportsDb,
        League::Nfl,
        2023,
        date(2023, 9, 10),
        "134944",
        "134946",
    );
    primary.native_id = Some("1850101".to_string());
    primary.week = Some(1);
    primary.home_score = Some(21);
    primary.away_score = Some(17);

    let mut stats = RawGameRecord::new(
        SourceTag::Espn,
        League::Nfl,
        2023,
        date(2023, 9, 10),
        "KC",
        "ARI",
    );
    stats.native_id = Some("401547353".to_string());
    stats.attendance = Some(68_000);
    stats.away_score = Some(17);

    let mut scraped = RawGameRecord::new(
        SourceTag::ProFootballReference,
        League::Nfl,
        2023,
        date(2023, 9, 10),
        "Kansas City Chiefs",
        "Arizona Cardinals",
    );
    scraped.native_id = Some("202309100kan".to_string());
    scraped.home_score = Some(24);
    scraped.weather_condition = Some("clear".to_string());

    vec![resolved(primary), resolved(stats), resolved(scraped)]
}

#[test]
fn two_source_merge_keeps_primary_scores_and_fills_attendance() {
    let records = chiefs_cardinals().into_iter().take(2).collect();
    let merged = merge(League::Nfl, records);
    assert_eq!(merged.len(), 1);
    let game = &merged[0].game;
    assert_eq!(game.home_team_uid, "NFL_134944");
    assert_eq!(game.away_team_uid, "NFL_134946");
    assert_eq!((game.home_score, game.away_score), (Some(21), Some(17)));
    assert_eq!(game.attendance, Some(68_000));
    assert!(merged[0].conflicts.is_empty());
}

#[test]
fn merge_is_independent_of_arrival_order() {
    let base = chiefs_cardinals();
    let orders: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    let mut outputs = Vec::new();
    for order in orders {
        let records = order.iter().map(|&i| base[i].clone()).collect();
        let merged = merge(League::Nfl, records);
        assert_eq!(merged.len(), 1);
        outputs.push((merged[0].game.clone(), merged[0].conflicts.clone()));
    }
    for out in &outputs[1..] {
        assert_eq!(out, &outputs[0]);
    }
    let (game, conflicts) = &outputs[0];
    assert_eq!(game.home_score, Some(21));
    assert_eq!(game.weather_condition.as_deref(), Some("clear"));
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].discarded_source, SourceTag::ProFootballReference);
}

#[test]
fn august_playoff_label_is_preseason() {
    let nfl = LeagueSchedule::nfl();
    let class = classify(&nfl, Some(GameType::Playoff), date(2022, 8, 13), 2022);
    assert_eq!(class.game_type, GameType::Preseason);
    assert!(!class.missing_cutoff);
}

#[test]
fn resolver_rejects_unknown_teams() {
    let resolver = IdentityResolver::seeded(League::Nfl);
    let raw = RawGameRecord::new(
        SourceTag::Espn,
        League::Nfl,
        2023,
        date(2023, 9, 10),
        "KC",
        "XYZ",
    );
    assert!(resolve_record(&resolver, &LeagueSchedule::nfl(), raw).is_err());
}

const LONDON_ROW: &str = r#"<table id="games"><tbody>
<tr>
  <th data-stat="week_num">6</th>
  <td data-stat="game_date">2023-10-15</td>
  <td data-stat="gametime">9:30AM</td>
  <td data-stat="winner"><a href="/teams/rav/2023.htm">Baltimore Ravens</a></td>
  <td data-stat="game_location">N</td>
  <td data-stat="loser"><a href="/teams/oti/2023.htm">Tennessee Titans</a></td>
  <td data-stat="boxscore_word"><a href="/boxscores/202310150oti.htm">boxscore</a></td>
  <td data-stat="pts_win">24</td>
  <td data-stat="pts_lose">16</td>
  <td data-stat="yards_win">320</td>
  <td data-stat="to_win">0</td>
  <td data-stat="yards_lose">280</td>
  <td data-stat="to_lose">1</td>
</tr>
</tbody></table>"#;

#[test]
fn neutral_site_game_won_by_the_away_side_stays_one_game() {
    let mut primary = RawGameRecord::new(
        SourceTag::TheSportsDb,
        League::Nfl,
        2023,
        date(2023, 10, 15),
        "134945",
        "134922",
    );
    primary.native_id = Some("1850300".to_string());
    primary.week = Some(6);
    primary.home_score = Some(16);
    primary.away_score = Some(24);

    let batch = parse_games_table(LONDON_ROW, League::Nfl, 2023).expect("table should parse");
    assert_eq!(batch.records.len(), 1);
    let scraped = batch.records[0].clone().into_game_record();
    assert!(scraped.neutral_site);

    let merged = merge(League::Nfl, vec![resolved(scraped), resolved(primary)]);
    assert_eq!(merged.len(), 1);
    let m = &merged[0];
    assert_eq!(m.game.game_uid, "NFL_1850300");
    assert_eq!(m.game.home_team_uid, "NFL_134945");
    assert_eq!(m.game.away_team_uid, "NFL_134922");
    assert_eq!((m.game.home_score, m.game.away_score), (Some(16), Some(24)));
    assert!(m.conflicts.is_empty());

    let ravens = m
        .stats
        .iter()
        .find(|s| s.team_uid == "NFL_134922")
        .expect("ravens stats");
    assert!(!ravens.is_home);
    assert_eq!(ravens.total_yards, Some(320));
}
