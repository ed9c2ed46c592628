use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::FromRow;

/// Raw counters over a notice's ledger rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow)]
pub struct LedgerTotals {
    pub total_sent: i64,
    pub total_viewed: i64,
    pub total_dismissed: i64,
    pub total_cta_clicks: i64,
    pub total_view_duration: i64,
}

/// Counters read together with the notice's ledger version in one statement.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct LedgerSnapshot {
    pub ledger_version: i64,
    pub total_sent: i64,
    pub total_viewed: i64,
    pub total_dismissed: i64,
    pub total_cta_clicks: i64,
    pub total_view_duration: i64,
}

impl LedgerSnapshot {
    pub fn totals(&self) -> LedgerTotals {
        LedgerTotals {
            total_sent: self.total_sent,
            total_viewed: self.total_viewed,
            total_dismissed: self.total_dismissed,
            total_cta_clicks: self.total_cta_clicks,
            total_view_duration: self.total_view_duration,
        }
    }
}

/// Row of the `notice_analytics` cache table.
#[derive(Debug, Clone, FromRow)]
pub struct NoticeAnalyticsRow {
    pub notice_id: String,
    pub total_sent: i64,
    pub total_viewed: i64,
    pub total_dismissed: i64,
    pub total_cta_clicks: i64,
    pub total_view_duration: i64,
    pub ledger_version: i64,
    pub computed_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeAnalytics {
    pub notice_id: String,
    pub total_sent: i64,
    pub total_viewed: i64,
    pub total_dismissed: i64,
    pub total_cta_clicks: i64,
    pub view_rate: f64,
    pub dismiss_rate: f64,
    pub conversion_rate: f64,
    /// Seconds per viewer.
    pub avg_view_duration: f64,
    #[serde(skip)]
    pub total_view_duration: i64,
    #[serde(skip)]
    pub ledger_version: i64,
    pub computed_at: NaiveDateTime,
}

fn ratio(numerator: i64, denominator: i64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl NoticeAnalytics {
    pub fn from_totals(notice_id: &str, totals: LedgerTotals, computed_at: NaiveDateTime) -> Self {
        NoticeAnalytics {
            notice_id: notice_id.to_string(),
            total_sent: totals.total_sent,
            total_viewed: totals.total_viewed,
            total_dismissed: totals.total_dismissed,
            total_cta_clicks: totals.total_cta_clicks,
            view_rate: ratio(totals.total_viewed, totals.total_sent),
            dismiss_rate: ratio(totals.total_dismissed, totals.total_viewed),
            conversion_rate: ratio(totals.total_cta_clicks, totals.total_viewed),
            avg_view_duration: ratio(totals.total_view_duration, totals.total_viewed),
            total_view_duration: totals.total_view_duration,
            ledger_version: 0,
            computed_at,
        }
    }

    pub fn totals(&self) -> LedgerTotals {
        LedgerTotals {
            total_sent: self.total_sent,
            total_viewed: self.total_viewed,
            total_dismissed: self.total_dismissed,
            total_cta_clicks: self.total_cta_clicks,
            total_view_duration: self.total_view_duration,
        }
    }
}

impl From<NoticeAnalyticsRow> for NoticeAnalytics {
    fn from(row: NoticeAnalyticsRow) -> Self {
        let totals = LedgerTotals {
            total_sent: row.total_sent,
            total_viewed: row.total_viewed,
            total_dismissed: row.total_dismissed,
            total_cta_clicks: row.total_cta_clicks,
            total_view_duration: row.total_view_duration,
        };
        NoticeAnalytics {
            ledger_version: row.ledger_version,
            ..NoticeAnalytics::from_totals(&row.notice_id, totals, row.computed_at)
        }
    }
}
