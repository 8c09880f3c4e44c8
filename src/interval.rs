//! Calendar-duration value type used for billing-cycle and retry-delay math.
//!
//! An [`Interval`] is an immutable bundle of calendar components. Adding it to
//! a timestamp is calendar-aware: months clamp to the end of shorter months
//! (Jan 31 + 1 month = Feb 28), then weeks/days, then hours/minutes are
//! applied in that order.

use chrono::{DateTime, Days, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BillingError;

/// An immutable calendar duration.
///
/// Equality is structural: one month is not equal to thirty days even though
/// they may cover the same span from a particular start date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Interval {
    #[serde(default)]
    pub years: u32,
    #[serde(default)]
    pub months: u32,
    #[serde(default)]
    pub weeks: u32,
    #[serde(default)]
    pub days: u32,
    #[serde(default)]
    pub hours: u32,
    #[serde(default)]
    pub minutes: u32,
}

impl Interval {
    /// The empty interval.
    pub const NONE: Self = Self {
        years: 0,
        months: 0,
        weeks: 0,
        days: 0,
        hours: 0,
        minutes: 0,
    };

    /// One day.
    pub const DAY: Self = Self {
        years: 0,
        months: 0,
        weeks: 0,
        days: 1,
        hours: 0,
        minutes: 0,
    };

    /// One week.
    pub const WEEK: Self = Self {
        years: 0,
        months: 0,
        weeks: 1,
        days: 0,
        hours: 0,
        minutes: 0,
    };

    /// Two weeks.
    pub const TWO_WEEKS: Self = Self {
        years: 0,
        months: 0,
        weeks: 2,
        days: 0,
        hours: 0,
        minutes: 0,
    };

    /// One calendar month.
    pub const MONTH: Self = Self {
        years: 0,
        months: 1,
        weeks: 0,
        days: 0,
        hours: 0,
        minutes: 0,
    };

    /// Three calendar months.
    pub const THREE_MONTHS: Self = Self {
        years: 0,
        months: 3,
        weeks: 0,
        days: 0,
        hours: 0,
        minutes: 0,
    };

    /// An interval of whole years.
    #[must_use]
    pub fn years(years: u32) -> Self {
        Self { years, ..Self::NONE }
    }

    /// An interval of whole calendar months.
    #[must_use]
    pub fn months(months: u32) -> Self {
        Self { months, ..Self::NONE }
    }

    /// An interval of whole weeks.
    #[must_use]
    pub fn weeks(weeks: u32) -> Self {
        Self { weeks, ..Self::NONE }
    }

    /// An interval of whole days.
    #[must_use]
    pub fn days(days: u32) -> Self {
        Self { days, ..Self::NONE }
    }

    /// An interval of whole hours.
    #[must_use]
    pub fn hours(hours: u32) -> Self {
        Self { hours, ..Self::NONE }
    }

    /// An interval of whole minutes.
    #[must_use]
    pub fn minutes(minutes: u32) -> Self {
        Self { minutes, ..Self::NONE }
    }

    /// Check whether every component is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::NONE
    }

    /// Add this interval to a timestamp.
    ///
    /// Calendar components first (years as twelve months each, clamping to
    /// month ends), then weeks/days, then hours/minutes. Returns `None` only
    /// when the result falls outside the representable date range.
    #[must_use]
    pub fn add_to(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut out = ts;

        let total_months = self.years.checked_mul(12)?.checked_add(self.months)?;
        if total_months > 0 {
            out = out.checked_add_months(Months::new(total_months))?;
        }

        let total_days = u64::from(self.weeks) * 7 + u64::from(self.days);
        if total_days > 0 {
            out = out.checked_add_days(Days::new(total_days))?;
        }

        if self.hours > 0 {
            out = out.checked_add_signed(Duration::hours(i64::from(self.hours)))?;
        }
        if self.minutes > 0 {
            out = out.checked_add_signed(Duration::minutes(i64::from(self.minutes)))?;
        }

        Some(out)
    }

    /// Compact textual form, e.g. `"1mo2w"`. The empty interval is `"none"`.
    #[must_use]
    pub fn as_compact_string(&self) -> String {
        if self.is_zero() {
            return "none".to_string();
        }

        let mut out = String::new();
        let parts: [(u32, &str); 6] = [
            (self.years, "y"),
            (self.months, "mo"),
            (self.weeks, "w"),
            (self.days, "d"),
            (self.hours, "h"),
            (self.minutes, "min"),
        ];
        for (value, unit) in parts {
            if value > 0 {
                out.push_str(&value.to_string());
                out.push_str(unit);
            }
        }
        out
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_compact_string())
    }
}

impl std::str::FromStr for Interval {
    type Err = BillingError;

    /// Parse the compact form: digit runs followed by a unit, where the unit
    /// is one of `y`, `mo`, `w`, `d`, `h`, `min`. Components may repeat and
    /// accumulate. `"none"` parses to the empty interval.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BillingError::bad_interval("empty interval string"));
        }
        if s == "none" {
            return Ok(Self::NONE);
        }

        let mut interval = Self::NONE;
        let mut chars = s.chars().peekable();

        while chars.peek().is_some() {
            let mut digits = String::new();
            while let Some(c) = chars.peek() {
                if c.is_ascii_digit() {
                    digits.push(*c);
                    chars.next();
                } else {
                    break;
                }
            }
            if digits.is_empty() {
                return Err(BillingError::bad_interval(format!(
                    "expected a number in '{s}'"
                )));
            }
            let value: u32 = digits
                .parse()
                .map_err(|_| BillingError::bad_interval(format!("number out of range in '{s}'")))?;

            let mut unit = String::new();
            while let Some(c) = chars.peek() {
                if c.is_ascii_alphabetic() {
                    unit.push(*c);
                    chars.next();
                } else {
                    break;
                }
            }
            match unit.as_str() {
                "y" => interval.years += value,
                "mo" => interval.months += value,
                "w" => interval.weeks += value,
                "d" => interval.days += value,
                "h" => interval.hours += value,
                "min" => interval.minutes += value,
                "" => {
                    return Err(BillingError::bad_interval(format!(
                        "missing unit after '{digits}' in '{s}'"
                    )));
                }
                other => {
                    return Err(BillingError::bad_interval(format!(
                        "unknown unit '{other}' in '{s}'"
                    )));
                }
            }
        }

        Ok(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_add_month_clamps_to_month_end() {
        let start = ts(2025, 1, 31);
        let end = Interval::MONTH.add_to(start).unwrap();
        assert_eq!(end, ts(2025, 2, 28));

        let leap = Interval::MONTH.add_to(ts(2024, 1, 31)).unwrap();
        assert_eq!(leap, ts(2024, 2, 29));
    }

    #[test]
    fn test_add_applies_months_before_days() {
        let start = ts(2025, 1, 31);
        let interval = Interval {
            months: 1,
            days: 1,
            ..Interval::NONE
        };
        // Jan 31 -> Feb 28 (clamped) -> Mar 1.
        assert_eq!(interval.add_to(start).unwrap(), ts(2025, 3, 1));
    }

    #[test]
    fn test_two_weeks_is_fourteen_days() {
        let start = ts(2025, 6, 1);
        assert_eq!(
            Interval::TWO_WEEKS.add_to(start).unwrap(),
            ts(2025, 6, 15)
        );
    }

    #[test]
    fn test_years_add_as_twelve_months() {
        let start = ts(2024, 2, 29);
        assert_eq!(Interval::years(1).add_to(start).unwrap(), ts(2025, 2, 28));
    }

    #[test]
    fn test_hours_and_minutes() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 30, 0).unwrap();
        let interval = Interval {
            hours: 2,
            minutes: 45,
            ..Interval::NONE
        };
        assert_eq!(
            interval.add_to(start).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 1, 13, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_none_adds_nothing() {
        let start = ts(2025, 6, 1);
        assert_eq!(Interval::NONE.add_to(start).unwrap(), start);
        assert!(Interval::NONE.is_zero());
        assert!(!Interval::DAY.is_zero());
    }

    #[test]
    fn test_structural_equality() {
        assert_eq!(Interval::weeks(2), Interval::TWO_WEEKS);
        assert_ne!(Interval::days(30), Interval::MONTH);
    }

    #[test]
    fn test_parse_compact_forms() {
        assert_eq!("1d".parse::<Interval>().unwrap(), Interval::DAY);
        assert_eq!("2w".parse::<Interval>().unwrap(), Interval::TWO_WEEKS);
        assert_eq!("3mo".parse::<Interval>().unwrap(), Interval::THREE_MONTHS);
        assert_eq!("none".parse::<Interval>().unwrap(), Interval::NONE);
        assert_eq!(
            "1y2mo3w4d5h6min".parse::<Interval>().unwrap(),
            Interval {
                years: 1,
                months: 2,
                weeks: 3,
                days: 4,
                hours: 5,
                minutes: 6,
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!("".parse::<Interval>().is_err());
        assert!("1".parse::<Interval>().is_err());
        assert!("mo".parse::<Interval>().is_err());
        assert!("1fortnight".parse::<Interval>().is_err());
        assert!("1m".parse::<Interval>().is_err());
    }

    #[test]
    fn test_compact_string_round_trip() {
        let interval = Interval {
            months: 1,
            weeks: 2,
            ..Interval::NONE
        };
        assert_eq!(interval.as_compact_string(), "1mo2w");
        assert_eq!(
            interval.as_compact_string().parse::<Interval>().unwrap(),
            interval
        );
        assert_eq!(Interval::NONE.as_compact_string(), "none");
    }
}
