//! Sansabet live feed: market decoder
//!
//! Turns one match detail response (already gunzipped and parsed into a
//! `serde_json::Value`) into a normalized [`MatchOdds`] record.
//!
//! Provider shape (only the parts we read):
//!   [ { "H": { "LigaNaziv": "...", "SLID": 123, "ParNaziv": "A - B" },
//!       "M": [ { "B": "2.5", "R": "0-1", "S": [ { "N": 103, "O": 1.85 } ] } ] } ]
//!
//! Only the first snapshot is authoritative. Bet-type codes are mapped by a
//! fixed table; anything outside it is skipped.

pub mod model;

pub use model::{
    HandicapPrices, MatchOdds, Moneyline, OverUnder, Period, PeriodOdds, TeamTotals, SOURCE_NAME,
};

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("payload is not an array of snapshots")]
    NotAnArray,
    /// Provider answers with `[]` for expired or unavailable matches.
    #[error("empty feed")]
    EmptyFeed,
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("malformed market array: {0}")]
    MalformedMarkets(String),
}

// ====================================================================
// Raw provider types
// ====================================================================

#[derive(Debug, Deserialize)]
struct RawHeader {
    #[serde(rename = "LigaNaziv")]
    league_name: Option<String>,
    #[serde(rename = "SLID")]
    refresh_key: Option<i64>,
    #[serde(rename = "ParNaziv")]
    match_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMarket {
    /// Total / team-total line ("2.5")
    #[serde(rename = "B", default, deserialize_with = "line_key")]
    line: Option<String>,
    /// Score-state handicap line ("0-1")
    #[serde(rename = "R", default, deserialize_with = "line_key")]
    score_line: Option<String>,
    #[serde(rename = "S", default)]
    prices: Option<Vec<RawPrice>>,
}

#[derive(Debug, Deserialize)]
struct RawPrice {
    #[serde(rename = "N")]
    code: Option<i64>,
    #[serde(rename = "O")]
    price: Option<f64>,
}

impl RawMarket {
    fn total_key(&self) -> String {
        self.line.clone().unwrap_or_default()
    }

    fn handicap_key(&self) -> String {
        self.score_line
            .clone()
            .or_else(|| self.line.clone())
            .unwrap_or_default()
    }
}

/// Line keys arrive as strings, occasionally as bare numbers.
fn line_key<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ====================================================================
// Bet-type code table
// ====================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Home,
    Draw,
    Away,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Over,
    Under,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Team {
    Home,
    Away,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandicapLeg {
    FullMatchHome,
    FullMatchDraw,
    FullMatchAway,
    FirstHalfHome,
    FirstHalfDraw,
    FirstHalfAway,
}

/// Where one bet-type code lands in the normalized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Moneyline(Period, Outcome),
    Totals(Period, Side),
    TeamTotal(Period, Team, Side),
    Handicap(HandicapLeg),
}

fn slot_for(code: i64) -> Option<Slot> {
    use Period::*;

    let slot = match code {
        1   => Slot::Moneyline(FullMatch, Outcome::Home),
        2   => Slot::Moneyline(FullMatch, Outcome::Draw),
        10  => Slot::Moneyline(FullMatch, Outcome::Away),
        103 => Slot::Totals(FullMatch, Side::Under),
        105 => Slot::Totals(FullMatch, Side::Over),
        168 => Slot::TeamTotal(FullMatch, Team::Home, Side::Over),
        169 => Slot::TeamTotal(FullMatch, Team::Home, Side::Under),
        170 => Slot::TeamTotal(FullMatch, Team::Away, Side::Over),
        171 => Slot::TeamTotal(FullMatch, Team::Away, Side::Under),
        734 => Slot::Handicap(HandicapLeg::FullMatchHome),
        735 => Slot::Handicap(HandicapLeg::FullMatchDraw),
        736 => Slot::Handicap(HandicapLeg::FullMatchAway),
        737 => Slot::Handicap(HandicapLeg::FirstHalfHome),
        738 => Slot::Handicap(HandicapLeg::FirstHalfDraw),
        739 => Slot::Handicap(HandicapLeg::FirstHalfAway),

        // first half
        93  => Slot::Moneyline(FirstHalf, Outcome::Home),
        94  => Slot::Moneyline(FirstHalf, Outcome::Draw),
        95  => Slot::Moneyline(FirstHalf, Outcome::Away),
        165 => Slot::Totals(FirstHalf, Side::Under),
        167 => Slot::Totals(FirstHalf, Side::Over),
        746 => Slot::TeamTotal(FirstHalf, Team::Home, Side::Under),
        747 => Slot::TeamTotal(FirstHalf, Team::Home, Side::Over),
        748 => Slot::TeamTotal(FirstHalf, Team::Away, Side::Under),
        749 => Slot::TeamTotal(FirstHalf, Team::Away, Side::Over),

        // second half
        96  => Slot::Moneyline(SecondHalf, Outcome::Home),
        97  => Slot::Moneyline(SecondHalf, Outcome::Draw),
        98  => Slot::Moneyline(SecondHalf, Outcome::Away),
        754 => Slot::Totals(SecondHalf, Side::Under),
        755 => Slot::Totals(SecondHalf, Side::Over),

        _ => return None,
    };
    Some(slot)
}

fn apply(odds: &mut MatchOdds, slot: Slot, market: &RawMarket, price: f64) {
    match slot {
        Slot::Moneyline(period, outcome) => {
            let ml = odds.moneyline_mut(period);
            match outcome {
                Outcome::Home => ml.home = price,
                Outcome::Draw => ml.draw = price,
                Outcome::Away => ml.away = price,
            }
        }
        Slot::Totals(period, side) => {
            let entry = odds.totals_mut(period).entry(market.total_key()).or_default();
            set_side(entry, side, price);
        }
        Slot::TeamTotal(period, team, side) => {
            let team_totals = odds.team_totals_mut(period);
            let lines = match team {
                Team::Home => &mut team_totals.home,
                Team::Away => &mut team_totals.away,
            };
            set_side(lines.entry(market.total_key()).or_default(), side, price);
        }
        Slot::Handicap(leg) => {
            let h = odds.handicaps.entry(market.handicap_key()).or_default();
            match leg {
                HandicapLeg::FullMatchHome => h.full_match_home = price,
                HandicapLeg::FullMatchDraw => h.full_match_draw = price,
                HandicapLeg::FullMatchAway => h.full_match_away = price,
                HandicapLeg::FirstHalfHome => h.first_half_home = price,
                HandicapLeg::FirstHalfDraw => h.first_half_draw = price,
                HandicapLeg::FirstHalfAway => h.first_half_away = price,
            }
        }
    }
}

fn set_side(entry: &mut OverUnder, side: Side, price: f64) {
    match side {
        Side::Over  => entry.over = price,
        Side::Under => entry.under = price,
    }
}

// ====================================================================
// Decoding
// ====================================================================

fn decode_header(snapshot: &Value) -> Result<(i64, String, String), DecodeError> {
    let raw = snapshot
        .get("H")
        .ok_or_else(|| DecodeError::MalformedHeader("missing H".to_string()))?;
    let header: RawHeader = serde_json::from_value(raw.clone())
        .map_err(|e| DecodeError::MalformedHeader(e.to_string()))?;

    let league_name = header
        .league_name
        .ok_or_else(|| DecodeError::MalformedHeader("missing LigaNaziv".to_string()))?;
    let refresh_key = header
        .refresh_key
        .ok_or_else(|| DecodeError::MalformedHeader("missing SLID".to_string()))?;
    let match_name = header
        .match_name
        .ok_or_else(|| DecodeError::MalformedHeader("missing ParNaziv".to_string()))?;

    Ok((refresh_key, league_name, match_name))
}

/// Decode one match detail payload.
///
/// A missing or empty `M` array is not an error: the record carries header
/// fields only and `incomplete_markets = true`.
pub fn decode_match(match_id: i64, payload: &Value) -> Result<MatchOdds, DecodeError> {
    let snapshots = payload.as_array().ok_or(DecodeError::NotAnArray)?;
    let snapshot = snapshots.first().ok_or(DecodeError::EmptyFeed)?;

    let (refresh_key, league_name, match_name) = decode_header(snapshot)?;
    let mut odds = MatchOdds::header_only(match_id, refresh_key, league_name, match_name);

    let markets = match snapshot.get("M") {
        None | Some(Value::Null) => return Ok(odds),
        Some(Value::Array(m)) => m,
        Some(other) => {
            return Err(DecodeError::MalformedMarkets(format!(
                "expected array, got {}",
                json_kind(other)
            )))
        }
    };
    if markets.is_empty() {
        return Ok(odds);
    }
    odds.incomplete_markets = false;

    for raw in markets {
        let market: RawMarket = match RawMarket::deserialize(raw) {
            Ok(m) => m,
            Err(e) => {
                debug!("match {}: skipping market entry: {}", match_id, e);
                continue;
            }
        };

        for entry in market.prices.iter().flatten() {
            let (Some(code), Some(price)) = (entry.code, entry.price) else {
                continue;
            };
            if let Some(slot) = slot_for(code) {
                apply(&mut odds, slot, &market, price);
            }
        }
    }

    Ok(odds)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
