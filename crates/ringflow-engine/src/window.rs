//! Business-hour gating for the scheduler.
//!
//! Windows are expressed in campaign-local minutes; evaluation converts the
//! UTC tick time into the campaign's IANA timezone and matches it against
//! every window. An empty window list means 24x7 dialing. An invalid
//! timezone passes open: it is surfaced as a warning at campaign creation
//! time and must not silently freeze a running campaign.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;

use ringflow_core::{BusinessHourWindow, Campaign};

/// Checks whether `now_utc` falls inside any of the campaign's calling
/// windows, evaluated in `timezone`.
#[must_use]
pub fn within_business_hours(
    now_utc: DateTime<Utc>,
    timezone: &str,
    windows: &[BusinessHourWindow],
) -> bool {
    if windows.is_empty() {
        return true;
    }

    let Ok(tz) = timezone.parse::<Tz>() else {
        tracing::warn!(timezone, "invalid campaign timezone, treating as 24x7");
        return true;
    };

    let local = now_utc.with_timezone(&tz);
    #[allow(clippy::cast_possible_truncation)]
    let minute = (local.hour() * 60 + local.minute()) as u16;
    #[allow(clippy::cast_possible_truncation)]
    let weekday = local.weekday().num_days_from_sunday() as u8;

    windows.iter().any(|w| w.contains(weekday, minute))
}

/// Convenience wrapper evaluating a campaign's own timezone and windows.
#[must_use]
pub fn campaign_within_hours(now_utc: DateTime<Utc>, campaign: &Campaign) -> bool {
    within_business_hours(now_utc, &campaign.timezone, &campaign.business_hours)
}
