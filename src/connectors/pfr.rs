use std::sync::Arc;

use anyhow::{Context, anyhow};
use chrono::{NaiveDate, NaiveTime};
use scraper::{ElementRef, Html, Selector};
use tracing::info;

use super::{FetchBatch, FetchScope, SourceConnector};
use crate::config::SourceSettings;
use crate::error::{Result, SyncError};
use crate::model::{League, RawRecord, RawTeamRecord, ScrapedRecord, SourceTag};
use crate::transport::{SourceClient, Transport};

/// Season schedule table scraped from pro-football-reference. Only the NFL
/// is published there.
pub struct PfrConnector {
    client: SourceClient,
    base_url: String,
}

impl PfrConnector {
    pub fn new(settings: &SourceSettings, transport: Arc<dyn Transport>) -> Self {
        Self {
            client: SourceClient::new(settings, transport),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl SourceConnector for PfrConnector {
    fn source(&self) -> SourceTag {
        SourceTag::ProFootballReference
    }

    fn fetch_games(&self, league: League, season: i32, _scope: &FetchScope) -> Result<FetchBatch> {
        if league != League::Nfl {
            return Ok(FetchBatch::default());
        }
        let url = format!("{}/years/{season}/games.htm", self.base_url);
        let html = self.client.get_text(&url)?;
        let batch = parse_games_table(&html, league, season).map_err(|e| {
            SyncError::MalformedRecord {
                source_tag: SourceTag::ProFootballReference,
                message: format!("{url}: {e:#}"),
            }
        })?;
        info!(
            source = "pro_football_reference",
            %league,
            season,
            rows = batch.records.len(),
            malformed = batch.malformed.len(),
            "schedule table scraped"
        );
        Ok(batch)
    }

    fn fetch_teams(&self, _league: League) -> Result<Vec<RawTeamRecord>> {
        Ok(Vec::new())
    }

    fn request_count(&self) -> u64 {
        self.client.request_count()
    }
}

fn selector(css: &str) -> anyhow::Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("bad selector {css:?}: {e}"))
}

/// Rows of `table#games`. Header rows repeated inside the body are skipped.
pub fn parse_games_table(html: &str, league: League, season: i32) -> anyhow::Result<FetchBatch> {
    let doc = Html::parse_document(html);
    let table = selector("table#games")?;
    let rows = selector("tbody tr")?;
    let cell = selector("th[data-stat], td[data-stat]")?;
    let link = selector("a")?;

    let table = doc
        .select(&table)
        .next()
        .ok_or_else(|| anyhow!("no games table"))?;

    let mut batch = FetchBatch::default();
    for row in table.select(&rows) {
        if row
            .value()
            .attr("class")
            .is_some_and(|c| c.split_whitespace().any(|k| k == "thead" || k == "over_header"))
        {
            continue;
        }
        let cells = RowCells {
            row,
            cell: &cell,
            link: &link,
        };
        if cells.text("game_date").is_none() && cells.text("boxscore_word").is_none() {
            continue;
        }
        match parse_row(&cells, league, season) {
            Ok(rec) => batch.records.push(RawRecord::Scraped(rec)),
            Err(err) => batch.malformed.push(format!("pro_football_reference: {err:#}")),
        }
    }
    Ok(batch)
}

struct RowCells<'a, 'b> {
    row: ElementRef<'a>,
    cell: &'b Selector,
    link: &'b Selector,
}

impl<'a> RowCells<'a, '_> {
    fn find(&self, stat: &str) -> Option<ElementRef<'a>> {
        self.row
            .select(self.cell)
            .find(|c| c.value().attr("data-stat") == Some(stat))
    }

    fn text(&self, stat: &str) -> Option<String> {
        let text = self.find(stat)?.text().collect::<String>();
        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    fn int(&self, stat: &str) -> Option<i32> {
        self.text(stat)?.parse::<i32>().ok()
    }

    fn href(&self, stat: &str) -> Option<String> {
        let cell = self.find(stat)?;
        let a = cell.select(self.link).next()?;
        a.value().attr("href").map(str::to_string)
    }
}

fn parse_row(cells: &RowCells<'_, '_>, league: League, season: i32) -> anyhow::Result<ScrapedRecord> {
    let week_label = cells.text("week_num").unwrap_or_default();
    let raw_date = cells
        .text("game_date")
        .ok_or_else(|| anyhow!("week {week_label}: row without date"))?;
    let date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d")
        .with_context(|| format!("week {week_label}: bad date {raw_date:?}"))?;
    let winner = cells
        .text("winner")
        .with_context(|| format!("{date}: missing winner column"))?;
    let loser = cells
        .text("loser")
        .with_context(|| format!("{date}: missing loser column"))?;
    let marker = cells.text("game_location").unwrap_or_default();

    // "@" means the winner played away; "N" is a neutral site listed winner-first.
    let winner_away = marker == "@";
    let (home_name, away_name) = if winner_away {
        (loser, winner)
    } else {
        (winner, loser)
    };
    let pts_win = cells.int("pts_win");
    let pts_lose = cells.int("pts_lose");
    let (home_score, away_score) = if winner_away {
        (pts_lose, pts_win)
    } else {
        (pts_win, pts_lose)
    };
    let (yards_win, yards_lose) = (cells.int("yards_win"), cells.int("yards_lose"));
    let (to_win, to_lose) = (cells.int("to_win"), cells.int("to_lose"));
    let (home_yards, away_yards, home_turnovers, away_turnovers) = if winner_away {
        (yards_lose, yards_win, to_lose, to_win)
    } else {
        (yards_win, yards_lose, to_win, to_lose)
    };

    Ok(ScrapedRecord {
        boxscore_id: cells.href("boxscore_word").and_then(|h| boxscore_id(&h)),
        league,
        season,
        week_label,
        date,
        time: cells.text("gametime").and_then(|t| parse_clock(&t)),
        home_name,
        away_name,
        home_score,
        away_score,
        home_yards,
        away_yards,
        home_turnovers,
        away_turnovers,
        neutral_site: marker == "N",
    })
}

// "/boxscores/202309070kan.htm" -> "202309070kan"
fn boxscore_id(href: &str) -> Option<String> {
    let file = href.rsplit('/').next()?;
    let id = file.strip_suffix(".htm")?;
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())).then(|| id.to_string())
}

// "8:20PM" / "1:00 PM"
fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let compact = raw.replace(' ', "").to_ascii_uppercase();
    NaiveTime::parse_from_str(&compact, "%I:%M%p").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boxscore_links_yield_ids() {
        assert_eq!(
            boxscore_id("/boxscores/202309070kan.htm").as_deref(),
            Some("202309070kan")
        );
        assert_eq!(boxscore_id("/boxscores/"), None);
    }

    #[test]
    fn clock_times_parse() {
        assert_eq!(parse_clock("8:20PM"), NaiveTime::from_hms_opt(20, 20, 0));
        assert_eq!(parse_clock("1:00 PM"), NaiveTime::from_hms_opt(13, 0, 0));
        assert_eq!(parse_clock("TBD"), None);
    }
}
