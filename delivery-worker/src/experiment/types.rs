//! A/B test types and rate computation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::hours;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    A,
    B,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::A => "A",
            Variant::B => "B",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(Variant::A),
            "B" | "b" => Ok(Variant::B),
            other => Err(format!("unknown variant '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerCriteria {
    OpenRate,
    ClickRate,
}

impl WinnerCriteria {
    pub fn as_str(&self) -> &'static str {
        match self {
            WinnerCriteria::OpenRate => "open_rate",
            WinnerCriteria::ClickRate => "click_rate",
        }
    }
}

impl FromStr for WinnerCriteria {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open_rate" => Ok(WinnerCriteria::OpenRate),
            "click_rate" => Ok(WinnerCriteria::ClickRate),
            other => Err(format!("unknown winner criteria '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Running,
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Running => "running",
            ExperimentStatus::Completed => "completed",
        }
    }
}

impl FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExperimentStatus::Running),
            "completed" => Ok(ExperimentStatus::Completed),
            other => Err(format!("unknown experiment status '{other}'")),
        }
    }
}

/// Engagement counters for one arm of a test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantStats {
    pub sent: u64,
    pub opens: u64,
    pub clicks: u64,
}

impl VariantStats {
    pub fn new(sent: u64, opens: u64, clicks: u64) -> Self {
        Self {
            sent,
            opens,
            clicks,
        }
    }

    /// Rate under `criteria`; zero when the denominator is zero.
    pub fn rate(&self, criteria: WinnerCriteria) -> f64 {
        let (numerator, denominator) = match criteria {
            WinnerCriteria::OpenRate => (self.opens, self.sent),
            WinnerCriteria::ClickRate => (self.clicks, self.opens),
        };
        if denominator == 0 {
            0.0
        } else {
            numerator as f64 / denominator as f64
        }
    }
}

/// Which counter an engagement event bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Sent,
    Opens,
    Clicks,
}

impl Counter {
    pub fn column(&self, variant: Variant) -> &'static str {
        match (self, variant) {
            (Counter::Sent, Variant::A) => "a_sent",
            (Counter::Opens, Variant::A) => "a_opens",
            (Counter::Clicks, Variant::A) => "a_clicks",
            (Counter::Sent, Variant::B) => "b_sent",
            (Counter::Opens, Variant::B) => "b_opens",
            (Counter::Clicks, Variant::B) => "b_clicks",
        }
    }
}

/// A two-variant comparison with a fixed observation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTest {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub test_duration_hours: f64,
    pub winner_criteria: WinnerCriteria,
    pub variant_a: VariantStats,
    pub variant_b: VariantStats,
    pub status: ExperimentStatus,
    pub winner: Option<Variant>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExperimentTest {
    pub fn new(
        id: impl Into<String>,
        started_at: DateTime<Utc>,
        test_duration_hours: f64,
        winner_criteria: WinnerCriteria,
    ) -> Self {
        Self {
            id: id.into(),
            started_at,
            test_duration_hours,
            winner_criteria,
            variant_a: VariantStats::default(),
            variant_b: VariantStats::default(),
            status: ExperimentStatus::Running,
            winner: None,
            completed_at: None,
        }
    }

    pub fn window_end(&self) -> DateTime<Utc> {
        self.started_at
            .checked_add_signed(hours(self.test_duration_hours))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn stats_mut(&mut self, variant: Variant) -> &mut VariantStats {
        match variant {
            Variant::A => &mut self.variant_a,
            Variant::B => &mut self.variant_b,
        }
    }

    /// Variant with the strictly higher rate; A wins ties.
    pub fn pick_winner(&self) -> (Variant, f64, f64) {
        let rate_a = self.variant_a.rate(self.winner_criteria);
        let rate_b = self.variant_b.rate(self.winner_criteria);
        let winner = if rate_b > rate_a { Variant::B } else { Variant::A };
        (winner, rate_a, rate_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rate() {
        let stats = VariantStats::new(100, 40, 10);
        assert!((stats.rate(WinnerCriteria::OpenRate) - 0.4).abs() < f64::EPSILON);
        assert!((stats.rate(WinnerCriteria::ClickRate) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_denominators() {
        let empty = VariantStats::default();
        assert_eq!(empty.rate(WinnerCriteria::OpenRate), 0.0);
        assert_eq!(empty.rate(WinnerCriteria::ClickRate), 0.0);

        let no_opens = VariantStats::new(50, 0, 3);
        assert_eq!(no_opens.rate(WinnerCriteria::ClickRate), 0.0);
    }

    #[test]
    fn test_pick_winner_higher_rate() {
        let mut test = ExperimentTest::new("t", Utc::now(), 24.0, WinnerCriteria::OpenRate);
        test.variant_a = VariantStats::new(100, 40, 0);
        test.variant_b = VariantStats::new(100, 55, 0);
        assert_eq!(test.pick_winner().0, Variant::B);
    }

    #[test]
    fn test_pick_winner_tie_goes_to_a() {
        let mut test = ExperimentTest::new("t", Utc::now(), 24.0, WinnerCriteria::ClickRate);
        test.variant_a = VariantStats::new(100, 50, 10);
        test.variant_b = VariantStats::new(200, 100, 20);
        assert_eq!(test.pick_winner().0, Variant::A);

        let empty = ExperimentTest::new("t", Utc::now(), 24.0, WinnerCriteria::OpenRate);
        assert_eq!(empty.pick_winner().0, Variant::A);
    }

    #[test]
    fn test_variant_parse() {
        assert_eq!("a".parse::<Variant>(), Ok(Variant::A));
        assert_eq!("B".parse::<Variant>(), Ok(Variant::B));
        assert!("C".parse::<Variant>().is_err());
    }

    #[test]
    fn test_counter_columns() {
        assert_eq!(Counter::Opens.column(Variant::B), "b_opens");
        assert_eq!(Counter::Sent.column(Variant::A), "a_sent");
    }
}
