use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

use crate::limits::{MIN_APPOINTMENT_MINUTES, MINUTES_PER_DAY};

/// Unix milliseconds — instants (queue timestamps) use this.
pub type Ms = i64;

/// Minutes since local midnight — all wall-clock arithmetic uses this.
pub type Minute = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

// ── Wall-clock primitives ────────────────────────────────────────

/// Half-open interval `[start, end)` in minutes since midnight.
/// `end` may exceed `24*60` for appointments that roll past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinuteSpan {
    pub start: Minute,
    pub end: Minute,
}

impl MinuteSpan {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "MinuteSpan start must be before end");
        Self { start, end }
    }

    pub fn duration_minutes(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &MinuteSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_minute(&self, m: Minute) -> bool {
        self.start <= m && m < self.end
    }
}

/// `"HH:MM"` label for a minute offset. Offsets past midnight wrap
/// back to wall-clock (1470 → `"00:30"`).
pub fn minutes_to_label(m: Minute) -> String {
    let m = m.rem_euclid(MINUTES_PER_DAY);
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Parse `"HH:MM"` into minutes since midnight. Rejects out-of-range fields.
pub fn label_to_minutes(label: &str) -> Option<Minute> {
    let (h, m) = label.split_once(':')?;
    let h: Minute = h.trim().parse().ok()?;
    let m: Minute = m.trim().parse().ok()?;
    if !(0..24).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    Some(h * 60 + m)
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InService,
    Completed,
    Canceled,
    NoShow,
}

/// One named service line on an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceItem {
    pub name: String,
}

/// An appointment as the remote store returns it: the start timestamp is
/// the raw stored literal (which may or may not carry a zone suffix) and
/// the end is a bare `"HH:MM"` time-of-day that may roll past midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentRow {
    pub id: Ulid,
    pub establishment_id: Ulid,
    pub staff_id: Option<Ulid>,
    /// Nullable: walk-in records identify the client by name only.
    pub client_id: Option<Ulid>,
    pub client_name: Option<String>,
    pub starts_at: String,
    pub end_time: String,
    pub status: AppointmentStatus,
    pub services: Vec<ServiceItem>,
}

/// An appointment after timestamp normalization. Everything past the
/// remote boundary consumes this, never raw literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub establishment_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub client_id: Option<Ulid>,
    pub client_name: Option<String>,
    pub starts_at: NaiveDateTime,
    pub end_time: String,
    pub status: AppointmentStatus,
    pub services: Vec<ServiceItem>,
}

impl Appointment {
    pub fn from_row(row: &AppointmentRow) -> Self {
        Self {
            id: row.id,
            establishment_id: row.establishment_id,
            staff_id: row.staff_id,
            client_id: row.client_id,
            client_name: row.client_name.clone(),
            starts_at: crate::localtime::parse_local(&row.starts_at),
            end_time: row.end_time.clone(),
            status: row.status,
            services: row.services.clone(),
        }
    }

    /// Back to the wire shape. The start literal is re-rendered
    /// zone-naive, which round-trips through [`from_row`](Self::from_row).
    pub fn to_row(&self) -> AppointmentRow {
        AppointmentRow {
            id: self.id,
            establishment_id: self.establishment_id,
            staff_id: self.staff_id,
            client_id: self.client_id,
            client_name: self.client_name.clone(),
            starts_at: self.starts_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
            end_time: self.end_time.clone(),
            status: self.status,
            services: self.services.clone(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.starts_at.date()
    }

    pub fn start_minute(&self) -> Minute {
        let t = self.starts_at.time();
        t.hour() as Minute * 60 + t.minute() as Minute
    }

    /// Minute interval for lane packing. An end time-of-day numerically
    /// smaller than the start rolls past midnight; a non-positive
    /// duration (bad data) gets the minimum-duration floor instead of
    /// failing.
    pub fn span(&self) -> MinuteSpan {
        let start = self.start_minute();
        let end = match label_to_minutes(&self.end_time) {
            Some(e) if e < start => e + MINUTES_PER_DAY,
            Some(e) => e,
            None => {
                warn!(appointment = %self.id, end_time = %self.end_time, "unparseable end time");
                start
            }
        };
        if end <= start {
            MinuteSpan::new(start, start + MIN_APPOINTMENT_MINUTES)
        } else {
            MinuteSpan::new(start, end)
        }
    }
}

/// Partial update for an appointment. `None` fields are untouched; the
/// start literal, when present, is raw and goes through the same
/// normalization as fetched rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppointmentPatch {
    pub staff_id: Option<Option<Ulid>>,
    pub starts_at: Option<String>,
    pub end_time: Option<String>,
    pub status: Option<AppointmentStatus>,
    pub services: Option<Vec<ServiceItem>>,
}

impl AppointmentPatch {
    /// Fold a later patch into this one. Fields the later patch sets
    /// win; fields it leaves alone keep their value here.
    pub fn merge(&mut self, later: &AppointmentPatch) {
        if later.staff_id.is_some() {
            self.staff_id = later.staff_id;
        }
        if later.starts_at.is_some() {
            self.starts_at = later.starts_at.clone();
        }
        if later.end_time.is_some() {
            self.end_time = later.end_time.clone();
        }
        if later.status.is_some() {
            self.status = later.status;
        }
        if later.services.is_some() {
            self.services = later.services.clone();
        }
    }

    pub fn apply_to(&self, appt: &mut Appointment) {
        if let Some(staff) = self.staff_id {
            appt.staff_id = staff;
        }
        if let Some(ref raw) = self.starts_at {
            appt.starts_at = crate::localtime::parse_local(raw);
        }
        if let Some(ref end) = self.end_time {
            appt.end_time = end.clone();
        }
        if let Some(status) = self.status {
            appt.status = status;
        }
        if let Some(ref services) = self.services {
            appt.services = services.clone();
        }
    }
}

// ── Establishment configuration ──────────────────────────────────

pub const SETTING_OPEN: &str = "horario_inicio";
pub const SETTING_CLOSE: &str = "horario_fim";
pub const SETTING_BREAK_START: &str = "horario_intervalo_inicio";
pub const SETTING_BREAK_END: &str = "horario_intervalo_fim";
pub const SETTING_STEP: &str = "intervalo_agendamentos";
pub const SETTING_LANE_CAPACITY: &str = "limite_simultaneos";
pub const SETTING_BLOCKED_WEEKDAYS: &str = "dias_semana_bloqueados";
pub const SETTING_BLOCKED_DATES: &str = "datas_bloqueadas";

/// Opening hours, optional midday break, slot granularity and lane
/// capacity. Values are raw — validation happens at grid-generation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub open: Minute,
    pub close: Minute,
    pub break_start: Option<Minute>,
    pub break_end: Option<Minute>,
    pub step_minutes: Minute,
    pub lane_capacity: usize,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            open: 8 * 60,
            close: 18 * 60,
            break_start: None,
            break_end: None,
            step_minutes: 30,
            lane_capacity: 3,
        }
    }
}

impl BusinessHours {
    /// Decode from the persisted string-keyed settings map. Missing or
    /// malformed values fall back to defaults, logged — a broken
    /// settings row must not take the booking screen down.
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let time_field = |key: &str, fallback: Minute| -> Minute {
            match settings.get(key) {
                None => fallback,
                Some(raw) => label_to_minutes(raw).unwrap_or_else(|| {
                    warn!(key, raw = %raw, "malformed time in settings");
                    fallback
                }),
            }
        };
        let optional_time = |key: &str| -> Option<Minute> {
            let raw = settings.get(key)?;
            if raw.is_empty() {
                return None;
            }
            let parsed = label_to_minutes(raw);
            if parsed.is_none() {
                warn!(key, raw = %raw, "malformed time in settings");
            }
            parsed
        };
        let step = match settings.get(SETTING_STEP) {
            None => defaults.step_minutes,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(raw = %raw, "malformed slot granularity in settings");
                defaults.step_minutes
            }),
        };
        let lanes = match settings.get(SETTING_LANE_CAPACITY) {
            None => defaults.lane_capacity,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(raw = %raw, "malformed lane capacity in settings");
                defaults.lane_capacity
            }),
        };
        Self {
            open: time_field(SETTING_OPEN, defaults.open),
            close: time_field(SETTING_CLOSE, defaults.close),
            break_start: optional_time(SETTING_BREAK_START),
            break_end: optional_time(SETTING_BREAK_END),
            step_minutes: step,
            lane_capacity: lanes,
        }
    }

    pub fn to_settings(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(SETTING_OPEN.into(), minutes_to_label(self.open));
        map.insert(SETTING_CLOSE.into(), minutes_to_label(self.close));
        if let Some(b) = self.break_start {
            map.insert(SETTING_BREAK_START.into(), minutes_to_label(b));
        }
        if let Some(b) = self.break_end {
            map.insert(SETTING_BREAK_END.into(), minutes_to_label(b));
        }
        map.insert(SETTING_STEP.into(), self.step_minutes.to_string());
        map.insert(SETTING_LANE_CAPACITY.into(), self.lane_capacity.to_string());
        map
    }
}

/// Dates on which no new bookings may be created: whole weekdays
/// (0 = Sunday … 6 = Saturday) plus specific calendar days.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlackoutConfig {
    pub weekdays: HashSet<u8>,
    pub dates: HashSet<NaiveDate>,
}

impl BlackoutConfig {
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        let weekdays = settings
            .get(SETTING_BLOCKED_WEEKDAYS)
            .map(|raw| match serde_json::from_str::<Vec<u8>>(raw) {
                Ok(days) => days.into_iter().filter(|d| *d <= 6).collect(),
                Err(e) => {
                    warn!(raw = %raw, error = %e, "malformed blocked-weekday list");
                    HashSet::new()
                }
            })
            .unwrap_or_default();
        let dates = settings
            .get(SETTING_BLOCKED_DATES)
            .map(|raw| match serde_json::from_str::<Vec<String>>(raw) {
                Ok(days) => days
                    .iter()
                    .filter_map(|d| {
                        let parsed = NaiveDate::parse_from_str(d, "%Y-%m-%d").ok();
                        if parsed.is_none() {
                            warn!(date = %d, "malformed blocked date");
                        }
                        parsed
                    })
                    .collect(),
                Err(e) => {
                    warn!(raw = %raw, error = %e, "malformed blocked-date list");
                    HashSet::new()
                }
            })
            .unwrap_or_default();
        Self { weekdays, dates }
    }

    pub fn to_settings(&self) -> HashMap<String, String> {
        let mut weekdays: Vec<u8> = self.weekdays.iter().copied().collect();
        weekdays.sort_unstable();
        let mut dates: Vec<String> = self
            .dates
            .iter()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect();
        dates.sort();
        let mut map = HashMap::new();
        map.insert(
            SETTING_BLOCKED_WEEKDAYS.into(),
            serde_json::to_string(&weekdays).unwrap_or_else(|_| "[]".into()),
        );
        map.insert(
            SETTING_BLOCKED_DATES.into(),
            serde_json::to_string(&dates).unwrap_or_else(|_| "[]".into()),
        );
        map
    }
}

// ── Mutation queue records ───────────────────────────────────────

/// One write against the remote store — flat, no nesting. This is the
/// journal record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationOp {
    Insert(AppointmentRow),
    Update { id: Ulid, patch: AppointmentPatch },
    Delete { id: Ulid },
    SaveBlackout(BlackoutConfig),
    SaveHours(BusinessHours),
}

/// Which logical record a mutation targets. Ordering and supersede
/// rules apply per key; config saves key on the establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Appointment(Ulid),
    Blackout(Ulid),
    Hours(Ulid),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: Ulid,
    pub establishment_id: Ulid,
    pub op: MutationOp,
    pub queued_at_ms: Ms,
    pub retries: u32,
}

impl QueuedMutation {
    pub fn new(establishment_id: Ulid, op: MutationOp) -> Self {
        Self {
            id: Ulid::new(),
            establishment_id,
            op,
            queued_at_ms: now_ms(),
            retries: 0,
        }
    }

    pub fn record_key(&self) -> RecordKey {
        match &self.op {
            MutationOp::Insert(row) => RecordKey::Appointment(row.id),
            MutationOp::Update { id, .. } => RecordKey::Appointment(*id),
            MutationOp::Delete { id } => RecordKey::Appointment(*id),
            MutationOp::SaveBlackout(_) => RecordKey::Blackout(self.establishment_id),
            MutationOp::SaveHours(_) => RecordKey::Hours(self.establishment_id),
        }
    }
}

// ── Change notifications ─────────────────────────────────────────

/// Typed payloads on the change channel. Views subscribe per
/// establishment; mutations and replay publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    /// An appointment was created locally (optimistic or confirmed).
    Upserted(Appointment),
    /// An appointment was patched locally.
    Patched(Ulid),
    /// An appointment was removed locally.
    Removed(Ulid),
    /// Business hours or blackout rules changed.
    ConfigChanged,
    /// Another session altered remote data; cached reads were dropped.
    RemoteChanged,
    MutationQueued(Ulid),
    MutationConfirmed(Ulid),
    MutationRejected { id: Ulid, reason: String },
}

// ── View assembly results ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedAppointment {
    pub appointment: Appointment,
    pub span: MinuteSpan,
    pub lane: usize,
}

#[derive(Debug, Clone)]
pub struct DayView {
    pub date: NaiveDate,
    /// New bookings are not allowed on this date.
    pub blocked: bool,
    pub grid: Vec<String>,
    /// Sorted by start minute, lanes assigned.
    pub appointments: Vec<PlacedAppointment>,
    /// True when the remote read failed and the view shows local data only.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub count: usize,
    pub blocked: bool,
}

#[derive(Debug, Clone)]
pub struct MonthView {
    pub year: i32,
    pub month: u32,
    pub days: Vec<DaySummary>,
    pub degraded: bool,
}
