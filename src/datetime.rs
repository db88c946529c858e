//! Datetime/timezone codec.
//!
//! Metadata timestamps arrive in ad-hoc shapes: `2023:05:17 15:54:30`,
//! `2023-05-17`, `2023:05:17 15:54:30.123456-08:00`, bare Unix epochs,
//! occasionally real ISO-8601. Parsing must never hard-fail (an unparsable
//! value is displayed raw), and serializing must reproduce the sub-second
//! precision and offset the source carried.

use std::sync::OnceLock;

use chrono::{
    DateTime, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, Timelike, Utc,
};
use regex::Regex;

/// A parsed timestamp: wall-clock time, optional offset, and the number of
/// sub-second digits the source carried.
///
/// `subsec_digits == Some(0)` means "precision is explicitly zero" (emit no
/// fraction, rounding if needed); `None` means the source gave no precision
/// information at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instant {
    pub naive: NaiveDateTime,
    pub offset: Option<FixedOffset>,
    pub subsec_digits: Option<u8>,
}

impl Instant {
    /// Absolute position in microseconds, treating a naive value as UTC.
    /// Used for ordering and for delta computation.
    pub fn timestamp_micros(&self) -> i64 {
        let utc_wall = match self.offset {
            Some(off) => self.naive - Duration::seconds(i64::from(off.local_minus_utc())),
            None => self.naive,
        };
        utc_wall.and_utc().timestamp_micros()
    }

    /// Shift by `delta`, preserving the offset and precision of the source.
    pub fn shifted(&self, delta: Duration) -> Self {
        Self {
            naive: self.naive + delta,
            ..*self
        }
    }

    /// Rewrite the wall-clock time as UTC and mark the offset as +00:00.
    /// No-op for naive values.
    pub fn into_utc(self) -> Self {
        match self.offset {
            Some(off) => Self {
                naive: self.naive - Duration::seconds(i64::from(off.local_minus_utc())),
                offset: Some(FixedOffset::east_opt(0).unwrap()),
                ..self
            },
            None => self,
        }
    }
}

fn structured_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)^
            (?P<year>\d{4})
            (?:[-:]?(?P<month>\d{2}))?
            (?:[-:]?(?P<day>\d{2}))?
            (?:[\ ]
                (?P<hour>\d{2})
                (?:[-:]?(?P<minute>\d{2}))
                (?:[-:]?(?P<second>\d{2}))?
                (?:\.(?P<frac>\d*))?
            )?
            (?:[\ ]?
                (?P<tzh>[-+]\d{2})
                (?:[-:]?(?P<tzm>\d{2}))?
                (?:[-:]?(?P<tzs>\d{2}(?:\.\d+)?))?
            )?
            $",
        )
        .expect("structured datetime pattern")
    })
}

fn epoch_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{10,16}$").expect("epoch pattern"))
}

fn group_u32(caps: &regex::Captures, name: &str) -> Option<u32> {
    caps.name(name).and_then(|m| m.as_str().parse().ok())
}

/// Parse a timestamp string, trying the structured grammar, then bare Unix
/// epoch digits, then ISO-8601. `None` means "not a recognizable timestamp";
/// callers fall back to the raw string and must not treat this as an error.
pub fn parse_instant(text: &str) -> Option<Instant> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    parse_structured(text)
        .or_else(|| parse_epoch(text))
        .or_else(|| parse_iso(text))
}

fn parse_structured(text: &str) -> Option<Instant> {
    let caps = structured_re().captures(text)?;

    let date = NaiveDate::from_ymd_opt(
        group_u32(&caps, "year")? as i32,
        group_u32(&caps, "month").unwrap_or(1),
        group_u32(&caps, "day").unwrap_or(1),
    )?;

    let (micros, subsec_digits) = match caps.name("frac") {
        Some(m) if !m.as_str().is_empty() => {
            (frac_digits_to_micros(m.as_str()), Some(m.as_str().len().min(255) as u8))
        }
        // A bare trailing `.` carries no precision information.
        _ => (0, None),
    };

    let naive = date.and_hms_micro_opt(
        group_u32(&caps, "hour").unwrap_or(0),
        group_u32(&caps, "minute").unwrap_or(0),
        group_u32(&caps, "second").unwrap_or(0),
        micros,
    )?;

    let offset = match caps.name("tzh") {
        Some(tzh) => {
            let hours: i32 = tzh.as_str().parse().ok()?;
            let minutes = group_u32(&caps, "tzm").unwrap_or(0) as i32;
            let seconds = caps
                .name("tzs")
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .map(|s| s.round() as i32)
                .unwrap_or(0);
            let magnitude = hours.abs() * 3600 + minutes * 60 + seconds;
            let total = if hours < 0 || tzh.as_str().starts_with('-') {
                -magnitude
            } else {
                magnitude
            };
            Some(FixedOffset::east_opt(total)?)
        }
        None => None,
    };

    Some(Instant {
        naive,
        offset,
        subsec_digits,
    })
}

/// First (at most) six fractional digits, zero-padded to microseconds.
fn frac_digits_to_micros(digits: &str) -> u32 {
    let mut micros = 0u32;
    for i in 0..6 {
        let d = digits.as_bytes().get(i).map_or(0, |b| u32::from(b - b'0'));
        micros = micros * 10 + d;
    }
    micros
}

/// Bare 10-16 digit integer as a Unix timestamp: 10 digits are seconds, each
/// further digit one more decimal place. Always UTC.
fn parse_epoch(text: &str) -> Option<Instant> {
    if !epoch_re().is_match(text) {
        return None;
    }
    let secs: i64 = text[..10].parse().ok()?;
    let frac = &text[10..];
    let micros = frac_digits_to_micros(frac);
    let utc: DateTime<Utc> = DateTime::from_timestamp(secs, micros * 1000)?;
    Some(Instant {
        naive: utc.naive_utc(),
        offset: Some(FixedOffset::east_opt(0)?),
        subsec_digits: Some(frac.len() as u8),
    })
}

fn parse_iso(text: &str) -> Option<Instant> {
    let subsec_digits = iso_frac_digits(text);
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(Instant {
            naive: dt.naive_local(),
            offset: Some(*dt.offset()),
            subsec_digits,
        });
    }
    if let Ok(naive) = text.parse::<NaiveDateTime>() {
        return Some(Instant {
            naive,
            offset: None,
            subsec_digits,
        });
    }
    if let Ok(date) = text.parse::<NaiveDate>() {
        return Some(Instant {
            naive: date.and_hms_opt(0, 0, 0)?,
            offset: None,
            subsec_digits: None,
        });
    }
    None
}

/// Digits following the first `.` in an ISO string, if any.
fn iso_frac_digits(text: &str) -> Option<u8> {
    let (_, after) = text.split_once('.')?;
    let count = after.bytes().take_while(u8::is_ascii_digit).count();
    (count > 0).then_some(count.min(255) as u8)
}

/// Serialize an instant back to `YYYY:MM:DD HH:MM:SS[.ff..][±HH:MM[:SS]]`.
///
/// A `subsec_digits` of zero with a nonzero fractional component rounds
/// half-up into the seconds field and emits no fraction (the deliberate
/// precision-loss path). Otherwise the fraction is emitted zero-padded to
/// six digits with trailing zeros stripped down to a minimum of two.
pub fn format_instant(instant: &Instant) -> String {
    let mut naive = instant.naive;
    let mut micros = naive.time().nanosecond() / 1000;

    if instant.subsec_digits == Some(0) && micros != 0 {
        if micros >= 500_000 {
            naive += Duration::seconds(1);
        }
        naive = naive.with_nanosecond(0).unwrap_or(naive);
        micros = 0;
    }

    let mut out = naive.format("%Y:%m:%d %H:%M:%S").to_string();

    if micros != 0 || instant.subsec_digits.unwrap_or(0) > 0 {
        let mut frac = format!("{micros:06}");
        while frac.len() > 2 && frac.ends_with('0') {
            frac.pop();
        }
        out.push('.');
        out.push_str(&frac);
    }

    if let Some(off) = instant.offset {
        out.push_str(&format_offset(off));
    }
    out
}

/// `±HH:MM[:SS]`, seconds omitted when zero.
pub fn format_offset(off: FixedOffset) -> String {
    let total = off.local_minus_utc();
    let sign = if total < 0 { '-' } else { '+' };
    let abs = total.abs();
    let (h, m, s) = (abs / 3600, abs % 3600 / 60, abs % 60);
    if s > 0 {
        format!("{sign}{h:02}:{m:02}:{s:02}")
    } else {
        format!("{sign}{h:02}:{m:02}")
    }
}

fn timezone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<sign>[-+])(?P<h>\d{1,2})(?::?(?P<m>\d{2}))?(?::?(?P<s>\d{2}(?:\.\d+)?))?$")
            .expect("timezone pattern")
    })
}

/// Resolve a timezone override string: the literal `local` (host offset at
/// call time) or a signed `±HH[[:]MM[[:]SS[.frac]]]` offset. Unparsable
/// input means "no override", never an error.
pub fn resolve_timezone(text: &str) -> Option<FixedOffset> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("local") {
        return Some(*Local::now().offset());
    }
    let caps = timezone_re().captures(text)?;
    let h: i32 = caps.name("h")?.as_str().parse().ok()?;
    let m: i32 = group_u32(&caps, "m").unwrap_or(0) as i32;
    let s = caps
        .name("s")
        .and_then(|c| c.as_str().parse::<f64>().ok())
        .map(|s| s.round() as i32)
        .unwrap_or(0);
    let magnitude = h * 3600 + m * 60 + s;
    let total = if caps.name("sign")?.as_str() == "-" {
        -magnitude
    } else {
        magnitude
    };
    FixedOffset::east_opt(total)
}

/// Parse a signed `[days ]HH:MM:SS[.frac]` duration, every unit but the
/// seconds optional. Units fill from the seconds end, so `02:03` is two
/// minutes and three seconds.
pub fn parse_timedelta(text: &str) -> Option<Duration> {
    let text = text.trim();
    let (negative, rest) = match text.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let (days, clock) = match rest.split_once(' ') {
        Some((d, c)) => (d.trim().parse::<i64>().ok()?, c.trim()),
        None => (0, rest),
    };

    let parts: Vec<&str> = clock.split(':').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let seconds: f64 = parts.last()?.parse().ok()?;
    let minutes: i64 = match parts.len() {
        n if n >= 2 => parts[n - 2].parse().ok()?,
        _ => 0,
    };
    let hours: i64 = match parts.len() {
        3 => parts[0].parse().ok()?,
        _ => 0,
    };

    let micros = (seconds * 1_000_000.0).round() as i64
        + (days * 86_400 + hours * 3_600 + minutes * 60) * 1_000_000;
    Some(Duration::microseconds(if negative { -micros } else { micros }))
}
