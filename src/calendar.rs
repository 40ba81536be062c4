use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone,
    Utc,
};

/// Day and week boundaries in the configured local offset.
#[derive(Debug, Clone, Copy)]
pub struct Calendar {
    offset: FixedOffset,
}

impl Calendar {
    pub fn new(utc_offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    #[cfg(test)]
    pub fn utc() -> Self {
        Self::new(0)
    }

    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn start_of_day(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.midnight(self.local_date(at))
    }

    /// 23:59:59.999 local on the day of `at`.
    pub fn end_of_day(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.start_of_day(at) + Duration::days(1) - Duration::milliseconds(1)
    }

    /// 23:59:59.999 local on the coming Sunday. On a Sunday this is the
    /// following Sunday, so a weekly cycle started on Sunday spans eight days.
    pub fn end_of_week(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = self.local_date(at);
        let days_ahead = 7 - i64::from(date.weekday().num_days_from_sunday());
        self.midnight(date + Duration::days(days_ahead + 1)) - Duration::milliseconds(1)
    }

    /// Monday 00:00 local of the week ending on the next Sunday.
    pub fn start_of_week(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = self.local_date(at);
        let back = i64::from(date.weekday().num_days_from_monday());
        self.midnight(date - Duration::days(back))
    }

    /// Whole local calendar days from `earlier` to `later`.
    pub fn days_between(&self, earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
        (self.local_date(later) - self.local_date(earlier)).num_days()
    }

    fn midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = NaiveDateTime::new(date, NaiveTime::MIN);
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }
}
