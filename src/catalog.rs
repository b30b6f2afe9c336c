//! Code tables: supplier, material and length codes → display names.
//!
//! Tables are frozen data.  A code missing from a table is never an error;
//! it resolves to `"<code> (unknown)"` so tags written by newer firmware
//! still display.

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::record::SpoolRecord;

// ── Tables ────────────────────────────────────────────────────────────────────

pub const SUPPLIERS: &[(&str, &str)] = &[
    ("0276", "Creality"),
    ("0000", "Generic"),
];

pub const MATERIALS: &[(&str, &str)] = &[
    ("00001", "Generic PLA"),
    ("00002", "Generic PLA-Silk"),
    ("00003", "Generic PETG"),
    ("00004", "Generic ABS"),
    ("00005", "Generic TPU"),
    ("00006", "Generic PLA-CF"),
    ("00007", "Generic ASA"),
    ("00008", "Generic PA"),
    ("00009", "Generic PA-CF"),
    ("00010", "Generic BVOH"),
    ("00012", "Generic HIPS"),
    ("00013", "Generic PET-CF"),
    ("00014", "Generic PETG-CF"),
    ("00015", "Generic PA6-CF"),
    ("00016", "Generic PAHT-CF"),
    ("00020", "Generic PET"),
    ("00021", "Generic PC"),
    ("01001", "Hyper PLA"),
    ("02001", "Hyper PLA-CF"),
    ("03001", "Hyper ABS"),
    ("04001", "CR-PLA"),
    ("05001", "CR-Silk"),
    ("06001", "CR-PETG"),
    ("07001", "CR-ABS"),
    ("08001", "Ender-PLA"),
    ("09001", "EN-PLA+"),
    ("09002", "ENDER FAST PLA"),
    ("10001", "HP-TPU"),
    ("11001", "CR-Nylon"),
    ("13001", "CR-PLA Carbon"),
    ("14001", "CR-PLA Matte"),
    ("15001", "CR-PLA Fluo"),
    ("16001", "CR-TPU"),
    ("17001", "CR-Wood"),
    ("18001", "HP Ultra PLA"),
    ("19001", "HP-ASA"),
];

/// (code, name, nominal weight in grams)
pub const LENGTHS: &[(&str, &str, u32)] = &[
    ("0083", "83 m (250 g)",  250),
    ("0165", "165 m (500 g)", 500),
    ("0330", "330 m (1 kg)",  1000),
    ("0660", "660 m (2 kg)",  2000),
];

const MONTHS: [&str; 12] = [
    "January", "February", "March", "April", "May", "June",
    "July", "August", "September", "October", "November", "December",
];

// ── Lookups ───────────────────────────────────────────────────────────────────

fn lookup(table: &[(&str, &str)], code: &str) -> String {
    table.iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| (*name).to_owned())
        .unwrap_or_else(|| unknown(code))
}

fn unknown(code: &str) -> String { format!("{code} (unknown)") }

pub fn supplier_name(code: &str) -> String { lookup(SUPPLIERS, code) }

pub fn material_name(code: &str) -> String { lookup(MATERIALS, code) }

pub fn length_name(code: &str) -> String {
    LENGTHS.iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, name, _)| (*name).to_owned())
        .unwrap_or_else(|| unknown(code))
}

pub fn is_known_supplier(code: &str) -> bool {
    SUPPLIERS.iter().any(|(c, _)| *c == code)
}

/// Resolve a material given either its code or its display name
/// (case-insensitive).  Returns the code.
pub fn material_code(code_or_name: &str) -> Option<&'static str> {
    let needle = code_or_name.trim();
    MATERIALS.iter()
        .find(|(code, name)| *code == needle || name.eq_ignore_ascii_case(needle))
        .map(|(code, _)| *code)
}

/// Resolve a length given its code or nominal weight in grams.
pub fn length_code(code_or_grams: &str) -> Option<&'static str> {
    let needle = code_or_grams.trim();
    LENGTHS.iter()
        .find(|(code, _, grams)| *code == needle || needle.parse::<u32>().ok() == Some(*grams))
        .map(|(code, _, _)| *code)
}

// ── Date and colour rendering ─────────────────────────────────────────────────

/// Date code for a calendar date: two-digit year, month as one hex digit
/// (1–9, A–C), two-digit day.
pub fn date_code(date: NaiveDate) -> String {
    format!("{:02}{:X}{:02}", date.year() % 100, date.month(), date.day())
}

/// Render a date code as `DD Month 20YY`, or pass it through marked as
/// unrecognised.
pub fn format_date(code: &str) -> String {
    parse_date_code(code)
        .map(|(year, month, day)| format!("{day:02} {} {year}", MONTHS[month as usize - 1]))
        .unwrap_or_else(|| format!("{code} (unrecognised date)"))
}

fn parse_date_code(code: &str) -> Option<(u32, u32, u32)> {
    if code.len() != 5 || !code.is_ascii() {
        return None;
    }
    let year  = code[0..2].parse::<u32>().ok()?;
    let month = u32::from_str_radix(&code[2..3], 16).ok()?;
    let day   = code[3..5].parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(2000 + year as i32, month, day)?;
    Some((2000 + year, month, day))
}

pub fn format_color(color: &str) -> String {
    match color.strip_prefix('0') {
        Some(hex) if hex.len() == 5 => format!("#{hex} (hex)"),
        _ => color.to_owned(),
    }
}

// ── Resolved names ────────────────────────────────────────────────────────────

/// Human-readable rendering of a record's coded fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpoolNames {
    pub supplier: String,
    pub material: String,
    pub length:   String,
    pub color:    String,
    pub date:     String,
}

impl SpoolNames {
    pub fn resolve(record: &SpoolRecord) -> Self {
        Self {
            supplier: supplier_name(&record.supplier),
            material: material_name(&record.material),
            length:   length_name(&record.length),
            color:    format_color(&record.color),
            date:     format_date(&record.date),
        }
    }
}

// ── Options (front-end dropdown data) ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CodeOption {
    pub code: &'static str,
    pub name: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct LengthOption {
    pub code:  &'static str,
    pub name:  &'static str,
    pub grams: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogOptions {
    pub suppliers: Vec<CodeOption>,
    pub materials: Vec<CodeOption>,
    pub lengths:   Vec<LengthOption>,
}

/// The full code tables, in table order.
pub fn options() -> CatalogOptions {
    let to_opts = |table: &[(&'static str, &'static str)]| -> Vec<CodeOption> {
        table.iter().map(|&(code, name)| CodeOption { code, name }).collect()
    };
    CatalogOptions {
        suppliers: to_opts(SUPPLIERS),
        materials: to_opts(MATERIALS),
        lengths:   LENGTHS.iter()
            .map(|&(code, name, grams)| LengthOption { code, name, grams })
            .collect(),
    }
}
