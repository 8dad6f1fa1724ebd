use std::collections::HashMap;
use std::sync::RwLock;

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};
use crate::model::{GameType, League, RawTeamRecord, SourceTag, Team, UidOrigin};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamAlias {
    pub source: SourceTag,
    pub native_id: String,
    pub team_uid: String,
}

struct Franchise {
    abbr: &'static str,
    tsdb_id: u32,
    espn_code: &'static str,
    city: &'static str,
    name: &'static str,
    conference: &'static str,
    division: &'static str,
    stadium: &'static str,
    capacity: i64,
    lat: f64,
    lon: f64,
}

const fn franchise(
    abbr: &'static str,
    tsdb_id: u32,
    espn_code: &'static str,
    city: &'static str,
    name: &'static str,
    conference: &'static str,
    division: &'static str,
    stadium: (&'static str, i64, f64, f64),
) -> Franchise {
    Franchise {
        abbr,
        tsdb_id,
        espn_code,
        city,
        name,
        conference,
        division,
        stadium: stadium.0,
        capacity: stadium.1,
        lat: stadium.2,
        lon: stadium.3,
    }
}

const SOFI: (&str, i64, f64, f64) = ("SoFi Stadium", 70_240, 33.9535, -118.3392);
const METLIFE: (&str, i64, f64, f64) = ("MetLife Stadium", 82_500, 40.8128, -74.0742);

const NFL_FRANCHISES: [Franchise; 32] = [
    franchise("ARI", 134946, "ari", "Arizona", "Cardinals", "NFC", "West", ("State Farm Stadium", 63_400, 33.5276, -112.2626)),
    franchise("ATL", 134942, "atl", "Atlanta", "Falcons", "NFC", "South", ("Mercedes-Benz Stadium", 71_000, 33.7554, -84.4009)),
    franchise("BAL", 134922, "bal", "Baltimore", "Ravens", "AFC", "North", ("M&T Bank Stadium", 71_008, 39.2780, -76.6227)),
    franchise("BUF", 134918, "buf", "Buffalo", "Bills", "AFC", "East", ("Highmark Stadium", 71_608, 42.7738, -78.7870)),
    franchise("CAR", 134943, "car", "Carolina", "Panthers", "NFC", "South", ("Bank of America Stadium", 75_523, 35.2258, -80.8528)),
    franchise("CHI", 134938, "chi", "Chicago", "Bears", "NFC", "North", ("Soldier Field", 61_500, 41.8623, -87.6167)),
    franchise("CIN", 134923, "cin", "Cincinnati", "Bengals", "AFC", "North", ("Paycor Stadium", 65_515, 39.0955, -84.5161)),
    franchise("CLE", 134924, "cle", "Cleveland", "Browns", "AFC", "North", ("Cleveland Browns Stadium", 67_431, 41.5061, -81.6995)),
    franchise("DAL", 134934, "dal", "Dallas", "Cowboys", "NFC", "East", ("AT&T Stadium", 80_000, 32.7473, -97.0945)),
    franchise("DEN", 134930, "den", "Denver", "Broncos", "AFC", "West", ("Empower Field at Mile High", 76_125, 39.7439, -105.0201)),
    franchise("DET", 134927, "det", "Detroit", "Lions", "NFC", "North", ("Ford Field", 65_000, 42.3400, -83.0456)),
    franchise("GB", 134929, "gb", "Green Bay", "Packers", "NFC", "North", ("Lambeau Field", 81_441, 44.5013, -88.0622)),
    franchise("HOU", 134932, "hou", "Houston", "Texans", "AFC", "South", ("NRG Stadium", 72_220, 29.6847, -95.4107)),
    franchise("IND", 134926, "ind", "Indianapolis", "Colts", "AFC", "South", ("Lucas Oil Stadium", 67_000, 39.7601, -86.1639)),
    franchise("JAX", 134948, "jax", "Jacksonville", "Jaguars", "AFC", "South", ("TIAA Bank Field", 69_132, 30.3239, -81.6373)),
    franchise("KC", 134944, "kc", "Kansas City", "Chiefs", "AFC", "West", ("Arrowhead Stadium", 76_416, 39.0489, -94.4839)),
    franchise("LV", 135908, "lv", "Las Vegas", "Raiders", "AFC", "West", ("Allegiant Stadium", 65_000, 36.0909, -115.1833)),
    franchise("LAC", 134940, "lac", "Los Angeles", "Chargers", "AFC", "West", SOFI),
    franchise("LAR", 134941, "lar", "Los Angeles", "Rams", "NFC", "West", SOFI),
    franchise("MIA", 134920, "mia", "Miami", "Dolphins", "AFC", "East", ("Hard Rock Stadium", 65_326, 25.9580, -80.2389)),
    franchise("MIN", 134939, "min", "Minnesota", "Vikings", "NFC", "North", ("U.S. Bank Stadium", 66_860, 44.9737, -93.2577)),
    franchise("NE", 134921, "ne", "New England", "Patriots", "AFC", "East", ("Gillette Stadium", 66_829, 42.0909, -71.2643)),
    franchise("NO", 134925, "no", "New Orleans", "Saints", "NFC", "South", ("Caesars Superdome", 73_208, 29.9511, -90.0812)),
    franchise("NYG", 134935, "nyg", "New York", "Giants", "NFC", "East", METLIFE),
    franchise("NYJ", 134936, "nyj", "New York", "Jets", "AFC", "East", METLIFE),
    franchise("PHI", 134931, "phi", "Philadelphia", "Eagles", "NFC", "East", ("Lincoln Financial Field", 69_596, 39.9008, -75.1675)),
    franchise("PIT", 134937, "pit", "Pittsburgh", "Steelers", "AFC", "North", ("Acrisure Stadium", 68_400, 40.4468, -80.0158)),
    franchise("SF", 135907, "sf", "San Francisco", "49ers", "NFC", "West", ("Levi's Stadium", 68_500, 37.4030, -121.9700)),
    franchise("SEA", 134949, "sea", "Seattle", "Seahawks", "NFC", "West", ("Lumen Field", 69_000, 47.5952, -122.3316)),
    franchise("TB", 134928, "tb", "Tampa Bay", "Buccaneers", "NFC", "South", ("Raymond James Stadium", 65_890, 27.9759, -82.5033)),
    franchise("TEN", 134945, "ten", "Tennessee", "Titans", "AFC", "South", ("Nissan Stadium", 69_143, 36.1665, -86.7713)),
    franchise("WAS", 134919, "wsh", "Washington", "Commanders", "NFC", "East", ("FedExField", 82_000, 38.9076, -76.8645)),
];

// Names the scraped source uses for seasons before a relocation or rename.
const NFL_HISTORICAL_NAMES: [(&str, &str); 5] = [
    ("Oakland Raiders", "LV"),
    ("San Diego Chargers", "LAC"),
    ("St. Louis Rams", "LAR"),
    ("Washington Redskins", "WAS"),
    ("Washington Football Team", "WAS"),
];

fn team_uid(league: League, tsdb_id: u32) -> String {
    format!("{}_{tsdb_id}", league.as_str())
}

/// Built-in franchise rows. Only the NFL ships with a table.
pub fn franchise_seed(league: League) -> Vec<Team> {
    if league != League::Nfl {
        return Vec::new();
    }
    NFL_FRANCHISES
        .iter()
        .map(|f| Team {
            team_uid: team_uid(league, f.tsdb_id),
            league,
            city: f.city.to_string(),
            name: f.name.to_string(),
            abbreviation: Some(f.abbr.to_string()),
            stadium_name: Some(f.stadium.to_string()),
            stadium_capacity: Some(f.capacity),
            latitude: Some(f.lat),
            longitude: Some(f.lon),
            conference: Some(f.conference.to_string()),
            division: Some(format!("{} {}", f.conference, f.division)),
        })
        .collect()
}

/// Seed aliases for every source: numeric ids for the schedule API, team
/// codes for the statistics API, full names for the scraped tables.
pub fn seed_aliases(league: League) -> Vec<TeamAlias> {
    if league != League::Nfl {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut push = |source, native: &str, uid: &str| {
        out.push(TeamAlias {
            source,
            native_id: normalize_native_id(native),
            team_uid: uid.to_string(),
        })
    };
    for f in &NFL_FRANCHISES {
        let uid = team_uid(league, f.tsdb_id);
        push(SourceTag::TheSportsDb, &f.tsdb_id.to_string(), &uid);
        push(SourceTag::Espn, f.espn_code, &uid);
        if !f.abbr.eq_ignore_ascii_case(f.espn_code) {
            push(SourceTag::Espn, f.abbr, &uid);
        }
        push(SourceTag::ProFootballReference, &format!("{} {}", f.city, f.name), &uid);
    }
    for (name, abbr) in NFL_HISTORICAL_NAMES {
        if let Some(f) = NFL_FRANCHISES.iter().find(|f| f.abbr == abbr) {
            push(SourceTag::ProFootballReference, name, &team_uid(league, f.tsdb_id));
        }
    }
    out
}

pub fn normalize_native_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Source-native team ids to canonical team uids. Append-only: an alias
/// may be added but never re-pointed.
pub struct IdentityResolver {
    league: League,
    aliases: RwLock<HashMap<(SourceTag, String), String>>,
}

impl IdentityResolver {
    pub fn empty(league: League) -> Self {
        Self {
            league,
            aliases: RwLock::new(HashMap::new()),
        }
    }

    pub fn seeded(league: League) -> Self {
        let resolver = Self::empty(league);
        for alias in seed_aliases(league) {
            // Seed rows never collide with each other.
            let _ = resolver.add_alias(alias.source, &alias.native_id, &alias.team_uid);
        }
        resolver
    }

    pub fn league(&self) -> League {
        self.league
    }

    /// Returns `Ok(true)` when the alias is new, `Ok(false)` when it already
    /// points at the same team.
    pub fn add_alias(&self, source: SourceTag, native_id: &str, team_uid: &str) -> Result<bool> {
        let key = (source, normalize_native_id(native_id));
        let mut aliases = self
            .aliases
            .write()
            .map_err(|_| SyncError::Config("alias table lock poisoned".to_string()))?;
        if let Some(existing) = aliases.get(&key) {
            if existing == team_uid {
                return Ok(false);
            }
            return Err(SyncError::AliasReassignment {
                source_tag: source,
                native_id: key.1,
                existing: existing.clone(),
            });
        }
        aliases.insert(key, team_uid.to_string());
        Ok(true)
    }

    pub fn resolve(&self, source: SourceTag, native_id: &str) -> Result<String> {
        let key = (source, normalize_native_id(native_id));
        let aliases = self
            .aliases
            .read()
            .map_err(|_| SyncError::Config("alias table lock poisoned".to_string()))?;
        aliases
            .get(&key)
            .cloned()
            .ok_or_else(|| SyncError::UnresolvedIdentity {
                source_tag: source,
                native_id: native_id.trim().to_string(),
            })
    }

    pub fn resolve_pair(&self, source: SourceTag, home: &str, away: &str) -> Result<(String, String)> {
        Ok((self.resolve(source, home)?, self.resolve(source, away)?))
    }

    pub fn aliases(&self) -> Vec<TeamAlias> {
        let Ok(aliases) = self.aliases.read() else {
            return Vec::new();
        };
        let mut out: Vec<TeamAlias> = aliases
            .iter()
            .map(|((source, native_id), team_uid)| TeamAlias {
                source: *source,
                native_id: native_id.clone(),
                team_uid: team_uid.clone(),
            })
            .collect();
        out.sort_by(|a, b| (a.source, &a.native_id).cmp(&(b.source, &b.native_id)));
        out
    }
}

/// Canonical game uid. Primary-source ids are kept verbatim; anything else
/// hashes the fields that identify the fixture.
#[allow(clippy::too_many_arguments)]
pub fn game_uid(
    league: League,
    source: SourceTag,
    native_id: Option<&str>,
    season: i32,
    game_type: GameType,
    week: Option<i32>,
    date: NaiveDate,
    home_uid: &str,
    away_uid: &str,
) -> (String, UidOrigin) {
    if source.is_primary()
        && let Some(id) = native_id.map(str::trim).filter(|id| !id.is_empty())
    {
        return (format!("{}_{id}", league.as_str()), UidOrigin::Native);
    }
    let slot = match (game_type, week) {
        (GameType::Regular, Some(w)) => format!("W{w}"),
        _ => date.format("%Y-%m-%d").to_string(),
    };
    (
        derived_game_uid(league, season, &slot, home_uid, away_uid),
        UidOrigin::Derived,
    )
}

pub fn derived_game_uid(league: League, season: i32, slot: &str, home_uid: &str, away_uid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{season}|{slot}|{home_uid}|{away_uid}", league.as_str()));
    let digest = format!("{:x}", hasher.finalize());
    format!("{}_G{}", league.as_str(), &digest[..16])
}

/// Fills gaps in a seeded team from a source's team listing. Seeded values
/// are never overwritten.
pub fn enrich_team(team: &mut Team, raw: &RawTeamRecord) -> bool {
    let mut changed = false;
    let mut fill = |slot: &mut Option<String>, value: &Option<String>| {
        if slot.is_none()
            && let Some(v) = value.as_ref().filter(|v| !v.trim().is_empty())
        {
            *slot = Some(v.trim().to_string());
            changed = true;
        }
    };
    fill(&mut team.abbreviation, &raw.abbreviation);
    fill(&mut team.stadium_name, &raw.stadium_name);
    fill(&mut team.conference, &raw.conference);
    fill(&mut team.division, &raw.division);
    if team.stadium_capacity.is_none() && raw.stadium_capacity.is_some_and(|c| c > 0) {
        team.stadium_capacity = raw.stadium_capacity;
        changed = true;
    }
    if team.latitude.is_none() && team.longitude.is_none() && raw.latitude.is_some() && raw.longitude.is_some() {
        team.latitude = raw.latitude;
        team.longitude = raw.longitude;
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_covers_every_franchise_once() {
        let teams = franchise_seed(League::Nfl);
        assert_eq!(teams.len(), 32);
        let mut uids: Vec<_> = teams.iter().map(|t| t.team_uid.clone()).collect();
        uids.sort();
        uids.dedup();
        assert_eq!(uids.len(), 32);
        let per_division = teams.iter().filter(|t| t.division.as_deref() == Some("AFC West")).count();
        assert_eq!(per_division, 4);
    }

    #[test]
    fn resolves_each_source_spelling() {
        let r = IdentityResolver::seeded(League::Nfl);
        assert_eq!(r.resolve(SourceTag::TheSportsDb, "134944").expect("kc"), "NFL_134944");
        assert_eq!(r.resolve(SourceTag::Espn, " KC ").expect("kc"), "NFL_134944");
        assert_eq!(r.resolve(SourceTag::Espn, "WAS").expect("was"), "NFL_134919");
        assert_eq!(
            r.resolve(SourceTag::ProFootballReference, "Oakland Raiders").expect("lv"),
            "NFL_135908"
        );
    }

    #[test]
    fn unknown_alias_is_unresolved() {
        let r = IdentityResolver::seeded(League::Nfl);
        let err = r.resolve(SourceTag::Espn, "afc").expect_err("pro bowl team");
        assert!(matches!(err, SyncError::UnresolvedIdentity { .. }));
    }

    #[test]
    fn aliases_are_append_only() {
        let r = IdentityResolver::seeded(League::Nfl);
        assert_eq!(r.add_alias(SourceTag::Espn, "kc", "NFL_134944").expect("same"), false);
        assert!(r.add_alias(SourceTag::Espn, "KAN", "NFL_134944").expect("new"));
        let err = r.add_alias(SourceTag::Espn, "kc", "NFL_134946").expect_err("repoint");
        assert!(matches!(err, SyncError::AliasReassignment { .. }));
    }

    #[test]
    fn game_uids_are_native_or_stable_hashes() {
        let date = NaiveDate::from_ymd_opt(2023, 9, 10).expect("date");
        let (native, origin) = game_uid(
            League::Nfl,
            SourceTag::TheSportsDb,
            Some("1850101"),
            2023,
            GameType::Regular,
            Some(1),
            date,
            "NFL_134944",
            "NFL_134927",
        );
        assert_eq!(native, "NFL_1850101");
        assert_eq!(origin, UidOrigin::Native);

        let derive = || {
            game_uid(
                League::Nfl,
                SourceTag::Espn,
                Some("401547353"),
                2023,
                GameType::Regular,
                Some(1),
                date,
                "NFL_134944",
                "NFL_134927",
            )
        };
        let (a, origin) = derive();
        assert_eq!(origin, UidOrigin::Derived);
        assert_eq!(a, derive().0);
        assert!(a.starts_with("NFL_G"));
        assert_eq!(a.len(), "NFL_G".len() + 16);
    }

    #[test]
    fn enrichment_only_fills_gaps() {
        let mut team = franchise_seed(League::Nfl).remove(0);
        team.stadium_capacity = None;
        let raw = RawTeamRecord {
            source: SourceTag::TheSportsDb,
            native_id: "134946".to_string(),
            name: "Arizona Cardinals".to_string(),
            city: None,
            abbreviation: Some("XXX".to_string()),
            stadium_name: Some("Elsewhere".to_string()),
            stadium_capacity: Some(64_000),
            latitude: None,
            longitude: None,
            conference: None,
            division: None,
        };
        assert!(enrich_team(&mut team, &raw));
        assert_eq!(team.abbreviation.as_deref(), Some("ARI"));
        assert_eq!(team.stadium_capacity, Some(64_000));
    }
}
