//! Fixed-width ASCII spool record.
//!
//! # Layout (48 bytes, the plaintext of blocks 4–6)
//!
//! | Field    | Offset | Width | Content                        |
//! |----------|-------:|------:|--------------------------------|
//! | Batch    |      0 |     2 | literal `A2`                   |
//! | Date     |      2 |     5 | date code                      |
//! | Supplier |      7 |     4 | supplier code                  |
//! | Material |     11 |     5 | material code                  |
//! | Color    |     16 |     6 | `0` + five hex digits          |
//! | Length   |     22 |     4 | length code                    |
//! | Serial   |     26 |     6 | serial number                  |
//! | Reserve  |     32 |    16 | literal `0000000000000000`     |
//!
//! Older writers produced a 38-byte record (Reserve of 6) followed by ten
//! `0` bytes of padding, which is byte-identical to this layout.  Records of
//! any other length are only accepted through [`SpoolRecord::decode_lenient`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Total record length in bytes.
pub const RECORD_LEN:        usize = 48;
/// Length of records written by the first generation of the tool.
pub const LEGACY_RECORD_LEN: usize = 38;

pub const BATCH_LITERAL:   &str = "A2";
pub const RESERVE_LITERAL: &str = "0000000000000000";
/// Leading digit of every Color value.
pub const COLOR_PREFIX:    u8   = b'0';
/// Byte used to pad short legacy records.
const PAD_BYTE: u8 = b'0';

// ── Field ─────────────────────────────────────────────────────────────────────

/// Subfields in on-tag order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Batch,
    Date,
    Supplier,
    Material,
    Color,
    Length,
    Serial,
    Reserve,
}

const WIDTHS: [usize; 8] = [2, 5, 4, 5, 6, 4, 6, 16];

const fn total_width() -> usize {
    let mut sum = 0;
    let mut i = 0;
    while i < WIDTHS.len() {
        sum += WIDTHS[i];
        i += 1;
    }
    sum
}

const _: () = assert!(total_width() == RECORD_LEN);

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Batch,
        Field::Date,
        Field::Supplier,
        Field::Material,
        Field::Color,
        Field::Length,
        Field::Serial,
        Field::Reserve,
    ];

    #[inline]
    pub fn width(self) -> usize { WIDTHS[self as usize] }

    pub fn offset(self) -> usize {
        WIDTHS[..self as usize].iter().sum()
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::Batch    => "batch",
            Field::Date     => "date",
            Field::Supplier => "supplier",
            Field::Material => "material",
            Field::Color    => "color",
            Field::Length   => "length",
            Field::Serial   => "serial",
            Field::Reserve  => "reserve",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Field '{field}' must be {expected} characters, got {actual}")]
    FieldSizeMismatch { field: Field, expected: usize, actual: usize },
    #[error("Record must be exactly {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField { field: Field, reason: String },
}

// ── SpoolRecord ───────────────────────────────────────────────────────────────

/// Decoded spool attributes.  Values are kept as the raw codes stored on the
/// tag; use [`crate::catalog`] for display names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub batch:    String,
    pub date:     String,
    pub supplier: String,
    pub material: String,
    pub color:    String,
    pub length:   String,
    pub serial:   String,
    pub reserve:  String,
}

impl SpoolRecord {
    /// Build a record with Batch and Reserve set to their literals.
    pub fn new(
        date:     impl Into<String>,
        supplier: impl Into<String>,
        material: impl Into<String>,
        color:    impl Into<String>,
        length:   impl Into<String>,
        serial:   impl Into<String>,
    ) -> Self {
        Self {
            batch:    BATCH_LITERAL.to_owned(),
            date:     date.into(),
            supplier: supplier.into(),
            material: material.into(),
            color:    color.into(),
            length:   length.into(),
            serial:   serial.into(),
            reserve:  RESERVE_LITERAL.to_owned(),
        }
    }

    /// Set Color from five hex digits (optionally `#`-prefixed), adding the
    /// leading `0`.
    pub fn with_color_hex(mut self, hex5: &str) -> Result<Self, RecordError> {
        let hex5 = hex5.trim().trim_start_matches('#');
        let expected = Field::Color.width() - 1;
        if hex5.len() != expected {
            return Err(RecordError::FieldSizeMismatch {
                field:    Field::Color,
                expected,
                actual:   hex5.len(),
            });
        }
        if !hex5.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RecordError::InvalidField {
                field:  Field::Color,
                reason: format!("'{hex5}' is not hexadecimal"),
            });
        }
        self.color = format!("{}{}", COLOR_PREFIX as char, hex5.to_ascii_uppercase());
        Ok(self)
    }

    pub fn get(&self, field: Field) -> &str {
        match field {
            Field::Batch    => &self.batch,
            Field::Date     => &self.date,
            Field::Supplier => &self.supplier,
            Field::Material => &self.material,
            Field::Color    => &self.color,
            Field::Length   => &self.length,
            Field::Serial   => &self.serial,
            Field::Reserve  => &self.reserve,
        }
    }

    fn get_mut(&mut self, field: Field) -> &mut String {
        match field {
            Field::Batch    => &mut self.batch,
            Field::Date     => &mut self.date,
            Field::Supplier => &mut self.supplier,
            Field::Material => &mut self.material,
            Field::Color    => &mut self.color,
            Field::Length   => &mut self.length,
            Field::Serial   => &mut self.serial,
            Field::Reserve  => &mut self.reserve,
        }
    }

    /// The five hex digits after the Color prefix.
    pub fn color_hex(&self) -> &str {
        self.color.get(1..).unwrap_or("")
    }

    // ── Encode ───────────────────────────────────────────────────────────────

    /// Produce the 48-byte ASCII record.
    ///
    /// Batch and Reserve are overwritten with their literals whatever the
    /// caller supplied; every other field must already have its exact width.
    pub fn encode(&self) -> Result<String, RecordError> {
        let mut fields = self.clone();
        fields.batch   = BATCH_LITERAL.to_owned();
        fields.reserve = RESERVE_LITERAL.to_owned();

        let mut out = String::with_capacity(RECORD_LEN);
        for field in Field::ALL {
            let value = fields.get(field);
            if !value.is_ascii() {
                return Err(RecordError::InvalidField {
                    field,
                    reason: format!("'{value}' contains non-ASCII characters"),
                });
            }
            if value.len() != field.width() {
                return Err(RecordError::FieldSizeMismatch {
                    field,
                    expected: field.width(),
                    actual:   value.len(),
                });
            }
            out.push_str(value);
        }
        validate_color(&fields.color)?;
        Ok(out)
    }

    // ── Decode ───────────────────────────────────────────────────────────────

    /// Slice an exactly-48-byte record at the fixed offsets.
    pub fn decode(ascii: &[u8]) -> Result<Self, RecordError> {
        if ascii.len() != RECORD_LEN {
            return Err(RecordError::LengthMismatch { expected: RECORD_LEN, actual: ascii.len() });
        }
        let mut record = SpoolRecord::new("", "", "", "", "", "");
        for field in Field::ALL {
            let raw = &ascii[field.offset()..field.offset() + field.width()];
            if !raw.is_ascii() {
                return Err(RecordError::InvalidField {
                    field,
                    reason: format!("bytes {} are not ASCII", hex::encode_upper(raw)),
                });
            }
            // ASCII is valid UTF-8.
            *record.get_mut(field) = String::from_utf8_lossy(raw).into_owned();
        }
        Ok(record)
    }

    /// Best-effort decode for records of a legacy length.
    ///
    /// Short input is right-padded with `0`, long input is truncated, and the
    /// result goes through [`SpoolRecord::decode`].  Offsets never move.
    pub fn decode_lenient(ascii: &[u8]) -> Result<Self, RecordError> {
        if ascii.len() == RECORD_LEN {
            return Self::decode(ascii);
        }
        warn!(
            actual = ascii.len(),
            expected = RECORD_LEN,
            "record length differs from canonical layout, decoding leniently"
        );
        let mut buf = ascii[..ascii.len().min(RECORD_LEN)].to_vec();
        buf.resize(RECORD_LEN, PAD_BYTE);
        Self::decode(&buf)
    }
}

fn validate_color(color: &str) -> Result<(), RecordError> {
    let bytes = color.as_bytes();
    if bytes.first() != Some(&COLOR_PREFIX) {
        return Err(RecordError::InvalidField {
            field:  Field::Color,
            reason: format!("'{color}' must start with '{}'", COLOR_PREFIX as char),
        });
    }
    if !bytes[1..].iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(RecordError::InvalidField {
            field:  Field::Color,
            reason: format!("'{color}' must continue with hexadecimal digits"),
        });
    }
    Ok(())
}

impl fmt::Display for SpoolRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Batch: {}, Date: {}, Supplier: {}, Material: {}, Color: {}, Length: {}, Serial: {}, Reserve: {}",
            self.batch, self.date, self.supplier, self.material,
            self.color, self.length, self.serial, self.reserve,
        )
    }
}
