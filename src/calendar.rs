//! Exchange calendar and trading-hours checks
//!
//! Evaluates everything in the exchange's local time zone (XNYS ->
//! America/New_York). Session boundaries are inclusive at both open and
//! close. Early-close sessions (day after Thanksgiving, Christmas Eve)
//! are treated as full sessions; unfilled entries on those days are
//! swept by the broker's day TIF instead of the EOD cancel window.
//!
//! Crypto never consults this module; the orchestrator treats it as
//! always open.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

/// Trading-hours checker for a named exchange calendar.
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    tz: Tz,
    allow_pre_market: bool,
    allow_after_hours: bool,
    rth_open: NaiveTime,
    rth_close: NaiveTime,
    pre_market_open: NaiveTime,
    after_hours_close: NaiveTime,
}

impl MarketCalendar {
    /// Build a calendar by name. Only the NYSE calendar is wired up;
    /// unknown names fail at startup rather than trading blind.
    pub fn new(calendar: &str, allow_pre_market: bool, allow_after_hours: bool) -> Result<Self> {
        let tz = match calendar.to_uppercase().as_str() {
            "XNYS" | "NYSE" => chrono_tz::America::New_York,
            other => bail!("unsupported exchange calendar: {other}"),
        };

        Ok(MarketCalendar {
            tz,
            allow_pre_market,
            allow_after_hours,
            rth_open: NaiveTime::from_hms_opt(9, 30, 0).context("invalid open time")?,
            rth_close: NaiveTime::from_hms_opt(16, 0, 0).context("invalid close time")?,
            pre_market_open: NaiveTime::from_hms_opt(4, 0, 0).context("invalid pre-market time")?,
            after_hours_close: NaiveTime::from_hms_opt(20, 0, 0)
                .context("invalid after-hours time")?,
        })
    }

    /// Weekday and not an exchange holiday.
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        !nyse_holidays(date.year()).contains(&date)
    }

    /// Inside 09:30-16:00 local on a trading day, boundaries inclusive.
    pub fn is_regular_hours(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.tz);
        if !self.is_trading_day(local.date_naive()) {
            return false;
        }
        let t = local.time();
        self.rth_open <= t && t <= self.rth_close
    }

    /// Like [`is_regular_hours`](Self::is_regular_hours) but widened by
    /// the pre-/after-hours flags.
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.tz);
        if !self.is_trading_day(local.date_naive()) {
            return false;
        }
        let start = if self.allow_pre_market {
            self.pre_market_open
        } else {
            self.rth_open
        };
        let end = if self.allow_after_hours {
            self.after_hours_close
        } else {
            self.rth_close
        };
        let t = local.time();
        start <= t && t <= end
    }

    /// Next regular-session open strictly after `from`.
    pub fn next_open(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_boundary(from, self.rth_open)
    }

    /// Next regular-session close strictly after `from`.
    pub fn next_close(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_boundary(from, self.rth_close)
    }

    pub fn seconds_until_close(&self, from: DateTime<Utc>) -> Option<i64> {
        self.next_close(from).map(|close| (close - from).num_seconds())
    }

    fn next_boundary(&self, from: DateTime<Utc>, time: NaiveTime) -> Option<DateTime<Utc>> {
        let local_date = from.with_timezone(&self.tz).date_naive();
        // 30 days covers any stretch of weekends plus holidays
        for offset in 0..30 {
            let date = local_date + Duration::days(offset);
            if !self.is_trading_day(date) {
                continue;
            }
            if let Some(at) = self.local_instant(date, time) {
                if at > from {
                    return Some(at);
                }
            }
        }
        None
    }

    fn local_instant(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        // DST transitions happen at 02:00 local; session boundaries never
        // land on an ambiguous wall-clock time.
        self.tz
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

// =============================================================================
// NYSE holiday table
// =============================================================================

/// Saturday holidays are observed the Friday before, Sunday holidays the
/// Monday after.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, nth: u32) -> Option<NaiveDate> {
    let mut count = 0;
    for day in 1..=31 {
        let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
            break;
        };
        if date.weekday() == weekday {
            count += 1;
            if count == nth {
                return Some(date);
            }
        }
    }
    None
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let mut found = None;
    for day in 1..=31 {
        let Some(date) = NaiveDate::from_ymd_opt(year, month, day) else {
            break;
        };
        if date.weekday() == weekday {
            found = Some(date);
        }
    }
    found
}

/// Easter Sunday (Gregorian, Meeus/Jones/Butcher algorithm).
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

/// Full NYSE closures for a year. Half-days are not included.
fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let mut holidays = Vec::with_capacity(10);

    if let Some(new_year) = NaiveDate::from_ymd_opt(year, 1, 1) {
        // NYSE rule: a Saturday New Year's Day is not observed on the
        // prior-year Friday, so only shift the Sunday case.
        if new_year.weekday() == Weekday::Sun {
            holidays.push(new_year + Duration::days(1));
        } else if new_year.weekday() != Weekday::Sat {
            holidays.push(new_year);
        }
    }
    holidays.extend(nth_weekday(year, 1, Weekday::Mon, 3)); // MLK Day
    holidays.extend(nth_weekday(year, 2, Weekday::Mon, 3)); // Washington's Birthday
    holidays.extend(easter_sunday(year).map(|e| e - Duration::days(2))); // Good Friday
    holidays.extend(last_weekday(year, 5, Weekday::Mon)); // Memorial Day
    if year >= 2022 {
        holidays.extend(NaiveDate::from_ymd_opt(year, 6, 19).map(observed)); // Juneteenth
    }
    holidays.extend(NaiveDate::from_ymd_opt(year, 7, 4).map(observed)); // Independence Day
    holidays.extend(nth_weekday(year, 9, Weekday::Mon, 1)); // Labor Day
    holidays.extend(nth_weekday(year, 11, Weekday::Thu, 4)); // Thanksgiving
    holidays.extend(NaiveDate::from_ymd_opt(year, 12, 25).map(observed)); // Christmas

    holidays
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cal() -> MarketCalendar {
        MarketCalendar::new("XNYS", false, false).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_unknown_calendar_rejected() {
        assert!(MarketCalendar::new("XLON", false, false).is_err());
    }

    #[test]
    fn test_weekends_closed() {
        assert!(!cal().is_trading_day(date(2025, 6, 14))); // Saturday
        assert!(!cal().is_trading_day(date(2025, 6, 15))); // Sunday
        assert!(cal().is_trading_day(date(2025, 6, 16))); // Monday
    }

    #[test]
    fn test_fixed_holidays() {
        let c = cal();
        assert!(!c.is_trading_day(date(2025, 7, 4))); // Independence Day
        assert!(!c.is_trading_day(date(2025, 1, 1))); // New Year's Day
        assert!(!c.is_trading_day(date(2025, 12, 25))); // Christmas
        assert!(!c.is_trading_day(date(2025, 11, 27))); // Thanksgiving
        assert!(!c.is_trading_day(date(2025, 1, 20))); // MLK Day
        assert!(!c.is_trading_day(date(2025, 5, 26))); // Memorial Day
        assert!(!c.is_trading_day(date(2025, 9, 1))); // Labor Day
    }

    #[test]
    fn test_good_friday() {
        assert!(!cal().is_trading_day(date(2024, 3, 29)));
        assert!(!cal().is_trading_day(date(2025, 4, 18)));
        // Maundy Thursday trades
        assert!(cal().is_trading_day(date(2024, 3, 28)));
    }

    #[test]
    fn test_observed_shifts() {
        let c = cal();
        // Christmas 2021 fell on Saturday; observed Friday Dec 24
        assert!(!c.is_trading_day(date(2021, 12, 24)));
        // New Year's Day 2022 fell on Saturday; NOT observed Dec 31 2021
        assert!(c.is_trading_day(date(2021, 12, 31)));
        // July 4 2021 fell on Sunday; observed Monday July 5
        assert!(!c.is_trading_day(date(2021, 7, 5)));
    }

    #[test]
    fn test_juneteenth_starts_2022() {
        assert!(!cal().is_trading_day(date(2023, 6, 19)));
        assert!(cal().is_trading_day(date(2020, 6, 19)));
    }

    #[test]
    fn test_regular_hours_inclusive_boundaries() {
        let c = cal();
        // Wednesday 2025-06-11, EDT (UTC-4): RTH is 13:30-20:00 UTC
        assert!(!c.is_regular_hours(utc(2025, 6, 11, 13, 29)));
        assert!(c.is_regular_hours(utc(2025, 6, 11, 13, 30)));
        assert!(c.is_regular_hours(utc(2025, 6, 11, 17, 0)));
        assert!(c.is_regular_hours(utc(2025, 6, 11, 20, 0)));
        assert!(!c.is_regular_hours(utc(2025, 6, 11, 20, 1)));
    }

    #[test]
    fn test_regular_hours_in_winter() {
        // Wednesday 2025-01-15, EST (UTC-5): RTH is 14:30-21:00 UTC
        let c = cal();
        assert!(c.is_regular_hours(utc(2025, 1, 15, 14, 30)));
        assert!(!c.is_regular_hours(utc(2025, 1, 15, 13, 30)));
    }

    #[test]
    fn test_extended_hours_flags() {
        let extended = MarketCalendar::new("XNYS", true, true).unwrap();
        let rth_only = cal();
        // 08:00 ET on a Wednesday = 12:00 UTC in June
        let pre = utc(2025, 6, 11, 12, 0);
        assert!(extended.is_open(pre));
        assert!(!extended.is_regular_hours(pre));
        assert!(!rth_only.is_open(pre));
        // 18:00 ET = 22:00 UTC
        let after = utc(2025, 6, 11, 22, 0);
        assert!(extended.is_open(after));
        assert!(!rth_only.is_open(after));
    }

    #[test]
    fn test_next_open_skips_weekend() {
        // From Saturday noon UTC -> Monday 09:30 ET = 13:30 UTC
        let next = cal().next_open(utc(2025, 6, 14, 12, 0)).unwrap();
        assert_eq!(next, utc(2025, 6, 16, 13, 30));
    }

    #[test]
    fn test_next_open_same_day_before_open() {
        let next = cal().next_open(utc(2025, 6, 11, 11, 0)).unwrap();
        assert_eq!(next, utc(2025, 6, 11, 13, 30));
    }

    #[test]
    fn test_seconds_until_close() {
        // 15:50 ET Wednesday -> 600 seconds to the bell
        let secs = cal().seconds_until_close(utc(2025, 6, 11, 19, 50)).unwrap();
        assert_eq!(secs, 600);

        // After the close, the next close is tomorrow's
        let next = cal().next_close(utc(2025, 6, 11, 20, 30)).unwrap();
        assert_eq!(next, utc(2025, 6, 12, 20, 0));
    }
}
