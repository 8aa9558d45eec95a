//! Internal record header codec.
//!
//! Every message in a mailbox file is prefixed by a single ASCII header line:
//!
//! ```text
//! DD-Mon-YYYY HH:MM:SS +HHMM,SIZE;UUUUUUUUUUSS\n
//! ```
//!
//! where `SIZE` is the exact byte length of the message text that follows
//! the terminator, and the final field is exactly 12 octal digits: 10 digits
//! of user-flag bitmap followed by 2 digits of system flags. The flag field
//! width never varies, so rewriting flags in place never moves a byte.
//!
//! Decoding is strict: every character position must match its expected
//! class. Any deviation is a decode failure, never a best-effort recovery —
//! the scanner turns such failures into fatal stream corruption.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike};

use crate::model::flags::{FlagField, SystemFlags, UserFlags, FLAG_FIELD_WIDTH};

/// Absolute byte position inside a mailbox file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(pub u64);

/// Byte count of a region inside a mailbox file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Length(pub u64);

impl Offset {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Length {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::ops::Add<Length> for Offset {
    type Output = Offset;

    fn add(self, rhs: Length) -> Offset {
        Offset(self.0 + rhs.0)
    }
}

impl std::ops::Sub<Length> for Offset {
    type Output = Offset;

    fn sub(self, rhs: Length) -> Offset {
        Offset(self.0 - rhs.0)
    }
}

impl std::ops::Add<Length> for Length {
    type Output = Length;

    fn add(self, rhs: Length) -> Length {
        Length(self.0 + rhs.0)
    }
}

/// The byte geometry of one record: internal header plus message text.
///
/// All offset arithmetic in the engine (scanner, flag updater, compactor)
/// goes through this view, so the computations live in exactly one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordView {
    /// Absolute offset of the first byte of the internal header line.
    pub offset: Offset,
    /// Length of the internal header line, terminator included.
    pub header_len: Length,
    /// Length of the message text (the `SIZE` field of the header).
    pub body_len: Length,
}

impl RecordView {
    /// Offset of the first byte of message text.
    pub fn body_offset(&self) -> Offset {
        self.offset + self.header_len
    }

    /// Offset one past the last byte of this record; equals the next
    /// record's `offset` in a well-formed mailbox.
    pub fn end(&self) -> Offset {
        self.offset + self.header_len + self.body_len
    }

    /// Total bytes this record occupies on disk.
    pub fn total_len(&self) -> Length {
        self.header_len + self.body_len
    }

    /// Absolute byte range of the fixed-width flag field.
    ///
    /// The field is the 12 digits immediately before the header terminator.
    pub fn flag_field_range(&self) -> std::ops::Range<u64> {
        let end = self.body_offset().get() - 1; // before the '\n'
        end - FLAG_FIELD_WIDTH as u64..end
    }
}

/// Upper bound on a well-formed internal header line, terminator included.
///
/// Fixed prefix (26) + ',' + at most 20 size digits + ';' + 12 flag digits
/// + '\n' = 61; rounded up for slack in the scanner's read window.
pub const MAX_HEADER_LINE: usize = 80;

/// A decoded internal header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHeader {
    /// Arrival timestamp, with the zone it was written in.
    pub date: DateTime<FixedOffset>,
    /// Exact byte length of the message text following the terminator.
    pub body_len: Length,
    /// User-flag bitmap (in-memory order, reversal already undone).
    pub user: UserFlags,
    /// System flag bits.
    pub system: SystemFlags,
}

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Encode an internal header line, terminator included.
///
/// Re-encoding with an unchanged flag set always yields a byte-identical
/// flag field, which is what makes in-place rewrite safe.
pub fn encode_internal_header(
    date: &DateTime<FixedOffset>,
    body_len: Length,
    user: UserFlags,
    system: SystemFlags,
) -> String {
    let offset_secs = date.offset().local_minus_utc();
    let sign = if offset_secs < 0 { '-' } else { '+' };
    let abs = offset_secs.unsigned_abs();
    format!(
        "{:02}-{}-{:04} {:02}:{:02}:{:02} {}{:02}{:02},{};{}\n",
        date.day(),
        MONTHS[date.month0() as usize],
        date.year(),
        date.hour(),
        date.minute(),
        date.second(),
        sign,
        abs / 3600,
        (abs % 3600) / 60,
        body_len.get(),
        FlagField::encode(user, system),
    )
}

/// Decode an internal header line. `line` must include the trailing `\n`.
///
/// Returns a plain reason string on failure; callers wrap it with the byte
/// offset where the record started.
pub fn decode_internal_header(line: &[u8]) -> Result<DecodedHeader, String> {
    let mut s = Scanner { line, pos: 0 };

    let day = s.fixed_digits(2, "day")?;
    s.expect(b'-')?;
    let month = s.month()?;
    s.expect(b'-')?;
    let year = s.fixed_digits(4, "year")?;
    s.expect(b' ')?;
    let hour = s.fixed_digits(2, "hour")?;
    s.expect(b':')?;
    let minute = s.fixed_digits(2, "minute")?;
    s.expect(b':')?;
    let second = s.fixed_digits(2, "second")?;
    s.expect(b' ')?;
    let zone_sign = s.sign()?;
    let zone_hours = s.fixed_digits(2, "zone hours")?;
    let zone_minutes = s.fixed_digits(2, "zone minutes")?;
    s.expect(b',')?;
    let body_len = s.decimal_run(b';')?;
    s.expect(b';')?;
    let field = s.take(FLAG_FIELD_WIDTH, "flag field")?;
    let (user, system) = FlagField::decode(field)?;
    s.expect(b'\n')?;
    if s.pos != line.len() {
        return Err("trailing bytes after header terminator".into());
    }

    let date = NaiveDate::from_ymd_opt(year as i32, month, day)
        .ok_or_else(|| format!("invalid calendar date {day:02}-{month:02}-{year:04}"))?;
    let time = NaiveTime::from_hms_opt(hour, minute, second)
        .ok_or_else(|| format!("invalid time {hour:02}:{minute:02}:{second:02}"))?;
    let zone = FixedOffset::east_opt(zone_sign * (zone_hours as i32 * 3600 + zone_minutes as i32 * 60))
        .ok_or_else(|| format!("invalid zone offset {zone_sign:+}{zone_hours:02}{zone_minutes:02}"))?;
    let date = zone
        .from_local_datetime(&date.and_time(time))
        .single()
        .ok_or_else(|| "unrepresentable timestamp".to_string())?;

    Ok(DecodedHeader {
        date,
        body_len: Length(body_len),
        user,
        system,
    })
}

/// Strict positional scanner over a header line.
struct Scanner<'a> {
    line: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn byte(&mut self) -> Result<u8, String> {
        let b = *self
            .line
            .get(self.pos)
            .ok_or_else(|| "header line ends prematurely".to_string())?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, want: u8) -> Result<(), String> {
        let at = self.pos;
        let got = self.byte()?;
        if got != want {
            return Err(format!(
                "expected '{}' at column {at}, found 0x{got:02x}",
                want as char
            ));
        }
        Ok(())
    }

    fn fixed_digits(&mut self, n: usize, what: &str) -> Result<u32, String> {
        let mut value: u32 = 0;
        for _ in 0..n {
            let b = self.byte()?;
            if !b.is_ascii_digit() {
                return Err(format!("non-digit 0x{b:02x} in {what} field"));
            }
            value = value * 10 + (b - b'0') as u32;
        }
        Ok(value)
    }

    /// Decimal digits up to (not including) `stop`; at least one digit.
    fn decimal_run(&mut self, stop: u8) -> Result<u64, String> {
        let mut value: u64 = 0;
        let mut digits = 0usize;
        while let Some(&b) = self.line.get(self.pos) {
            if b == stop {
                break;
            }
            if !b.is_ascii_digit() {
                return Err(format!("non-digit 0x{b:02x} in size field"));
            }
            if digits >= 20 {
                return Err("size field too long".into());
            }
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add((b - b'0') as u64))
                .ok_or_else(|| "size field overflows".to_string())?;
            digits += 1;
            self.pos += 1;
        }
        if digits == 0 {
            return Err("empty size field".into());
        }
        Ok(value)
    }

    fn sign(&mut self) -> Result<i32, String> {
        match self.byte()? {
            b'+' => Ok(1),
            b'-' => Ok(-1),
            other => Err(format!("expected zone sign, found 0x{other:02x}")),
        }
    }

    fn month(&mut self) -> Result<u32, String> {
        let name = self.take(3, "month")?;
        MONTHS
            .iter()
            .position(|m| m.as_bytes() == name)
            .map(|i| i as u32 + 1)
            .ok_or_else(|| format!("unknown month '{}'", String::from_utf8_lossy(name)))
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], String> {
        if self.pos + n > self.line.len() {
            return Err(format!("header line ends inside {what}"));
        }
        let slice = &self.line[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_date() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_encode_layout() {
        let line = encode_internal_header(
            &sample_date(),
            Length(42),
            UserFlags::empty(),
            SystemFlags::SEEN,
        );
        assert_eq!(line, "01-Jan-2020 00:00:00 +0000,42;000000000001\n");
    }

    #[test]
    fn test_roundtrip() {
        let date = FixedOffset::east_opt(-5 * 3600)
            .unwrap()
            .with_ymd_and_hms(2023, 12, 31, 23, 59, 59)
            .unwrap();
        let flags = SystemFlags::SEEN | SystemFlags::ANSWERED;
        let user = UserFlags::from_bits(0b101);
        let line = encode_internal_header(&date, Length(1234), user, flags);
        let decoded = decode_internal_header(line.as_bytes()).unwrap();
        assert_eq!(decoded.date, date);
        assert_eq!(decoded.body_len, Length(1234));
        assert_eq!(decoded.user, user);
        assert_eq!(decoded.system, flags);
    }

    #[test]
    fn test_flag_field_is_fixed_width() {
        let none = encode_internal_header(
            &sample_date(),
            Length(1),
            UserFlags::empty(),
            SystemFlags::empty(),
        );
        let all = encode_internal_header(
            &sample_date(),
            Length(1),
            UserFlags::from_bits((1 << 30) - 1),
            SystemFlags::all(),
        );
        assert_eq!(none.len(), all.len());
    }

    #[test]
    fn test_decode_rejects_bad_month() {
        let line = b"01-Foo-2020 00:00:00 +0000,42;000000000001\n";
        assert!(decode_internal_header(line).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_terminator() {
        let line = b"01-Jan-2020 00:00:00 +0000,42;000000000001";
        assert!(decode_internal_header(line).is_err());
    }

    #[test]
    fn test_decode_rejects_non_octal_flag_digit() {
        let line = b"01-Jan-2020 00:00:00 +0000,42;000000000091\n";
        assert!(decode_internal_header(line).is_err());
    }

    #[test]
    fn test_decode_rejects_calendar_nonsense() {
        let line = b"31-Feb-2020 00:00:00 +0000,42;000000000001\n";
        assert!(decode_internal_header(line).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let line = b"01-Jan-2020 00:00:00 +0000,42;000000000001\nx";
        assert!(decode_internal_header(line).is_err());
    }

    #[test]
    fn test_record_view_arithmetic() {
        let view = RecordView {
            offset: Offset(100),
            header_len: Length(44),
            body_len: Length(56),
        };
        assert_eq!(view.body_offset(), Offset(144));
        assert_eq!(view.end(), Offset(200));
        assert_eq!(view.total_len(), Length(100));
        // 12-digit field sits just before the terminator at 143.
        assert_eq!(view.flag_field_range(), 131..143);
    }
}
