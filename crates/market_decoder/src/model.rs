//! Normalized wire record relayed between stages.
//!
//! Every price field is always present in the serialized shape; an unset
//! market stays at `0.0`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SOURCE_NAME: &str = "sansabet";

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Moneyline {
    pub home: f64,
    pub draw: f64,
    pub away: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OverUnder {
    pub over:  f64,
    pub under: f64,
}

/// Remaining-match and first-half handicap prices sharing one line key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandicapPrices {
    pub full_match_home: f64,
    pub full_match_draw: f64,
    pub full_match_away: f64,
    pub first_half_home: f64,
    pub first_half_draw: f64,
    pub first_half_away: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamTotals {
    pub home: BTreeMap<String, OverUnder>,
    pub away: BTreeMap<String, OverUnder>,
}

/// Markets priced for a single half.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodOdds {
    pub moneyline:   Moneyline,
    pub totals:      BTreeMap<String, OverUnder>,
    pub team_totals: TeamTotals,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchOdds {
    pub source:      String,
    pub match_id:    i64,
    pub refresh_key: i64,
    pub league_name: String,
    pub match_name:  String,
    /// Set when the provider sent no market array for this match.
    pub incomplete_markets: bool,

    pub moneyline:   Moneyline,
    pub totals:      BTreeMap<String, OverUnder>,
    pub team_totals: TeamTotals,
    pub handicaps:   BTreeMap<String, HandicapPrices>,

    pub first_half:  PeriodOdds,
    pub second_half: PeriodOdds,
}

/// Which slice of the match a market prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    FullMatch,
    FirstHalf,
    SecondHalf,
}

impl MatchOdds {
    pub fn header_only(match_id: i64, refresh_key: i64, league_name: String, match_name: String) -> Self {
        Self {
            source: SOURCE_NAME.to_string(),
            match_id,
            refresh_key,
            league_name,
            match_name,
            incomplete_markets: true,
            ..Self::default()
        }
    }

    pub fn moneyline_mut(&mut self, period: Period) -> &mut Moneyline {
        match period {
            Period::FullMatch  => &mut self.moneyline,
            Period::FirstHalf  => &mut self.first_half.moneyline,
            Period::SecondHalf => &mut self.second_half.moneyline,
        }
    }

    pub fn totals_mut(&mut self, period: Period) -> &mut BTreeMap<String, OverUnder> {
        match period {
            Period::FullMatch  => &mut self.totals,
            Period::FirstHalf  => &mut self.first_half.totals,
            Period::SecondHalf => &mut self.second_half.totals,
        }
    }

    pub fn team_totals_mut(&mut self, period: Period) -> &mut TeamTotals {
        match period {
            Period::FullMatch  => &mut self.team_totals,
            Period::FirstHalf  => &mut self.first_half.team_totals,
            Period::SecondHalf => &mut self.second_half.team_totals,
        }
    }

    /// Count of priced lines across every keyed market, used for log lines.
    pub fn line_count(&self) -> usize {
        let period = |p: &PeriodOdds| p.totals.len() + p.team_totals.home.len() + p.team_totals.away.len();
        self.totals.len()
            + self.team_totals.home.len()
            + self.team_totals.away.len()
            + self.handicaps.len()
            + period(&self.first_half)
            + period(&self.second_half)
    }
}
