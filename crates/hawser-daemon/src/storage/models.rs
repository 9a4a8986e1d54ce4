//! Database models for the Hawser control plane.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

use crate::passage::Argument;

/// Consecutive failed pings after which a node is considered down.
///
/// A node at the cap is no longer pinged and no longer appears in passage
/// sets until it proactively re-registers.
pub const MAX_FAILURE_COUNT: i64 = 10;

/// Expiry sentinel for server/relay tickets (9999-12-31T23:59:59Z).
/// These tickets only go away through explicit revocation or retirement.
pub const NEVER_EXPIRES: i64 = 253_402_300_799;

/// Bearer ticket role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum TicketType {
    User,
    Server,
    Relay,
}

impl TicketType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Server => "server",
            Self::Relay => "relay",
        }
    }

    /// The node role on the other side of a relay relationship.
    pub const fn counterpart(self) -> Option<Self> {
        match self {
            Self::Server => Some(Self::Relay),
            Self::Relay => Some(Self::Server),
            Self::User => None,
        }
    }
}

impl std::fmt::Display for TicketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ticket record from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Ticket {
    pub ticket: String,
    pub chat_identifier: String,
    pub ticket_type: TicketType,
    pub expire_at: i64,
}

impl Ticket {
    pub const fn expired(&self, now: i64) -> bool {
        self.expire_at <= now
    }
}

/// Registered node record (endpoint server or relay) from the database.
///
/// Which role the node plays is decided by the type of its ticket.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Server {
    pub ticket: String,
    pub name: String,
    /// Comma-joined ordered host list (IPs or domains).
    pub hosts: String,
    pub port: u16,
    /// Management credential the control plane presents to the node.
    #[sqlx(flatten)]
    pub argument: Argument,
    /// When set, the node refuses to exchange traffic with relays.
    pub no_relay: bool,
    pub failure_count: i64,
    pub last_seen: i64,
    /// Retry-on-next-liveness flag: a failed push sets it; the next
    /// successful ping or registration triggers exactly one more sync.
    pub sync_next_seen: bool,
    #[sqlx(flatten)]
    pub bandwidth: BandwidthLimit,
}

impl Server {
    /// The preferred dial target: first entry of the host list.
    pub fn first_host(&self) -> &str {
        self.hosts.split(',').next().map_or("", str::trim)
    }

    pub const fn is_down(&self) -> bool {
        self.failure_count >= MAX_FAILURE_COUNT
    }
}

/// A node joined with the type of its ticket, as returned by
/// [`super::Database::servers_by_chat`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChatNode {
    pub ticket_type: TicketType,
    #[sqlx(flatten)]
    pub server: Server,
}

/// Monthly bandwidth accounting for one node, in KiB.
///
/// Counters are absolute values as reported by the node; the `*_initial`
/// columns are the baselines at the start of the current billing cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct BandwidthLimit {
    /// Day of month the cycle rolls over; 0 disables the cycle.
    pub reset_day: u32,
    pub uplink_limit_kib: i64,
    pub downlink_limit_kib: i64,
    pub total_limit_kib: i64,
    pub uplink_kib: i64,
    pub downlink_kib: i64,
    pub uplink_initial_kib: i64,
    pub downlink_initial_kib: i64,
    pub last_reset: i64,
}

impl BandwidthLimit {
    /// Usage since the start of the current cycle, as (uplink, downlink).
    pub const fn usage_kib(&self) -> (i64, i64) {
        (
            self.uplink_kib - self.uplink_initial_kib,
            self.downlink_kib - self.downlink_initial_kib,
        )
    }

    /// Whether any configured cap has been met or exceeded this cycle.
    pub const fn exhausted(&self) -> bool {
        let (up, down) = self.usage_kib();
        (self.uplink_limit_kib > 0 && up >= self.uplink_limit_kib)
            || (self.downlink_limit_kib > 0 && down >= self.downlink_limit_kib)
            || (self.total_limit_kib > 0 && up + down >= self.total_limit_kib)
    }

    /// Merge externally reported limits and absolute counters.
    ///
    /// A reported counter lower than the last known value means the node
    /// restarted and its counters started over; the cycle baseline is
    /// re-based so the accumulated usage carries forward instead of the
    /// whole cycle appearing spent or empty.
    pub fn update(&mut self, reported: &Self) {
        if reported.reset_day != 0 {
            self.reset_day = reported.reset_day;
        }
        self.uplink_limit_kib = reported.uplink_limit_kib;
        self.downlink_limit_kib = reported.downlink_limit_kib;
        self.total_limit_kib = reported.total_limit_kib;

        if reported.uplink_kib < self.uplink_kib {
            let used = self.uplink_kib - self.uplink_initial_kib;
            self.uplink_initial_kib = reported.uplink_kib - used;
        }
        self.uplink_kib = reported.uplink_kib;

        if reported.downlink_kib < self.downlink_kib {
            let used = self.downlink_kib - self.downlink_initial_kib;
            self.downlink_initial_kib = reported.downlink_kib - used;
        }
        self.downlink_kib = reported.downlink_kib;
    }

    /// Whether the monthly rollover point has been passed since the last
    /// reset.
    pub fn is_time_to_reset(&self, now: i64) -> bool {
        self.latest_reset_point(now)
            .is_some_and(|point| self.last_reset < point)
    }

    /// Start a new billing cycle at `now`.
    pub const fn reset(&mut self, now: i64) {
        self.uplink_initial_kib = self.uplink_kib;
        self.downlink_initial_kib = self.downlink_kib;
        self.last_reset = now;
    }

    /// The most recent cycle boundary at or before `now`: midnight UTC of
    /// the reset day, clamped to the length of the month.
    fn latest_reset_point(&self, now: i64) -> Option<i64> {
        if self.reset_day == 0 {
            return None;
        }
        let now_dt = DateTime::<Utc>::from_timestamp(now, 0)?;
        let (mut year, mut month) = (now_dt.year(), now_dt.month());
        if let Some(point) = reset_point_for(year, month, self.reset_day)
            && now >= point
        {
            return Some(point);
        }
        if month == 1 {
            year -= 1;
            month = 12;
        } else {
            month -= 1;
        }
        reset_point_for(year, month, self.reset_day)
    }
}

impl From<hawser_proto::v1::BandwidthReport> for BandwidthLimit {
    fn from(report: hawser_proto::v1::BandwidthReport) -> Self {
        Self {
            reset_day: report.reset_day,
            uplink_limit_kib: report.uplink_limit_kib,
            downlink_limit_kib: report.downlink_limit_kib,
            total_limit_kib: report.total_limit_kib,
            uplink_kib: report.uplink_kib,
            downlink_kib: report.downlink_kib,
            uplink_initial_kib: 0,
            downlink_initial_kib: 0,
            last_reset: 0,
        }
    }
}

fn reset_point_for(year: i32, month: u32, reset_day: u32) -> Option<i64> {
    let day = reset_day.min(days_in_month(year, month));
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map_or(28, |d| d.day())
}
