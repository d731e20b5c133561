//! Patient list handling.
//!
//! The input file carries one record per line, comma separated:
//! `Name,PatientID,StudyDate[,Modality]`. Names arrive as "First Last",
//! dates as "D.M.YYYY"; both are normalized to their DICOM forms before
//! querying.

use std::collections::{BTreeSet, HashSet};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{Months, NaiveDate};
use snafu::{ResultExt, Snafu};
use tracing::warn;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not read patient list {}", path.display()))]
    ReadList {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One batch entry: query keys plus the study UIDs found for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientRecord {
    /// Patient name in DICOM form ("Last^First").
    pub name: String,
    /// Patient ID, zero-padded to ten digits.
    pub id: String,
    /// Study date as YYYYMMDD, or a YYYYMMDD-YYYYMMDD range.
    pub study_date: String,
    /// ModalitiesInStudy filter, backslash-separated when multi-valued.
    pub modality: Option<String>,
    pub study_uids: BTreeSet<String>,
}

impl PatientRecord {
    /// Record a found study UID. Duplicate notifications are absorbed.
    /// Returns whether the UID was new.
    pub fn insert_study_uid(&mut self, uid: &str) -> bool {
        let uid = uid.trim_end_matches('\0').trim();
        if uid.is_empty() {
            return false;
        }
        self.study_uids.insert(uid.to_string())
    }
}

pub fn read_patient_records(path: &Path) -> Result<Vec<PatientRecord>, Error> {
    let file = std::fs::File::open(path).context(ReadListSnafu { path })?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        lines.push(line.context(ReadListSnafu { path })?);
    }
    Ok(parse_records(lines.iter().map(String::as_str)))
}

/// Parse patient list lines, skipping and warning about malformed entries.
pub fn parse_records<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<PatientRecord> {
    let mut records = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for (lineno, line) in lines.into_iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 3 || fields[..3].iter().any(|f| f.is_empty()) {
            warn!("line {}: incomplete record, skipping", lineno + 1);
            continue;
        }
        let name = normalize_name(fields[0]);
        let id = match normalize_id(fields[1]) {
            Some(id) => id,
            None => {
                warn!("line {}: patient ID {:?} is not numeric, skipping", lineno + 1, fields[1]);
                continue;
            }
        };
        let study_date = match normalize_date(fields[2]) {
            Some(date) => date,
            None => {
                warn!("line {}: study date {:?} is not valid, skipping", lineno + 1, fields[2]);
                continue;
            }
        };
        if !seen.insert((id.clone(), study_date.clone())) {
            warn!("line {}: duplicate of patient {} on {}, skipping", lineno + 1, id, study_date);
            continue;
        }
        let modality = fields
            .get(3)
            .filter(|m| !m.is_empty())
            .map(|m| normalize_modality(m));
        records.push(PatientRecord {
            name,
            id,
            study_date,
            modality,
            study_uids: BTreeSet::new(),
        });
    }
    records
}

/// "First Last" becomes "Last^First"; digits are stripped beforehand.
fn normalize_name(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| !c.is_ascii_digit()).collect();
    let parts: Vec<&str> = cleaned.split_whitespace().collect();
    match parts.as_slice() {
        [] => String::new(),
        [single] => (*single).to_string(),
        [first @ .., last] => format!("{}^{}", last, first.join(" ")),
    }
}

fn normalize_id(raw: &str) -> Option<String> {
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{:0>10}", raw))
}

/// Accepts "D.M.YYYY" or an already normalized YYYYMMDD.
fn normalize_date(raw: &str) -> Option<String> {
    if raw.len() == 8 && raw.chars().all(|c| c.is_ascii_digit()) {
        return NaiveDate::parse_from_str(raw, "%Y%m%d")
            .ok()
            .map(|_| raw.to_string());
    }
    let mut parts = raw.split('.');
    let day: u32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let year: i32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    Some(date.format("%Y%m%d").to_string())
}

/// DICOM multi-valued modalities use `\`; accept `/` as input separator.
pub fn normalize_modality(raw: &str) -> String {
    raw.trim().replace('/', "\\")
}

/// Widen a single YYYYMMDD date into the DICOM range
/// `date-months .. date+months`. Ranges are passed through untouched.
pub fn extend_date_range(date: &str, months: u32) -> String {
    if months == 0 || date.contains('-') {
        return date.to_string();
    }
    let parsed = match NaiveDate::parse_from_str(date, "%Y%m%d") {
        Ok(d) => d,
        Err(_) => return date.to_string(),
    };
    let lo = parsed
        .checked_sub_months(Months::new(months))
        .unwrap_or(parsed);
    let hi = parsed
        .checked_add_months(Months::new(months))
        .unwrap_or(parsed);
    format!("{}-{}", lo.format("%Y%m%d"), hi.format("%Y%m%d"))
}

/// Report of the records no study was found for, one `NOT FOUND` row
/// each.
pub fn write_missing_report<W: Write>(
    out: &mut W,
    timestamp: &str,
    records: &[PatientRecord],
) -> std::io::Result<()> {
    writeln!(out, "Missing studies as of {}", timestamp)?;
    writeln!(out, "PatientID, StudyDate")?;
    for record in records.iter().filter(|r| r.study_uids.is_empty()) {
        writeln!(out, "{}, {} - NOT FOUND", record.id, record.study_date)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes_records() {
        let records = parse_records([
            "Jane Doe,4711,1.2.2024,CT",
            "",
            "John Roe,000012,24.12.2023",
        ]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "Doe^Jane");
        assert_eq!(records[0].id, "0000004711");
        assert_eq!(records[0].study_date, "20240201");
        assert_eq!(records[0].modality.as_deref(), Some("CT"));
        assert_eq!(records[1].name, "Roe^John");
        assert_eq!(records[1].study_date, "20231224");
        assert_eq!(records[1].modality, None);
    }

    #[test]
    fn skips_malformed_and_duplicate_lines() {
        let records = parse_records([
            "Jane Doe,47x1,1.2.2024",    // non-numeric ID
            "Jane Doe,4711,31.31.2024",  // impossible date
            "Jane Doe,4711,1.2.2024",
            "Jane Doe,4711,1.2.2024,CT", // duplicate (id, date)
            "OnlyAName,4711",            // missing fields
        ]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "0000004711");
    }

    #[test]
    fn name_digits_are_stripped() {
        let records = parse_records(["Jane2 Doe3,1,1.1.2020"]);
        assert_eq!(records[0].name, "Doe^Jane");
    }

    #[test]
    fn uid_set_is_idempotent() {
        let mut record = parse_records(["A B,1,1.1.2020"]).remove(0);
        assert!(record.insert_study_uid("1.2.3\0"));
        assert!(!record.insert_study_uid("1.2.3"));
        assert!(!record.insert_study_uid("  "));
        assert_eq!(record.study_uids.len(), 1);
    }

    #[test]
    fn modality_separator_is_normalized() {
        assert_eq!(normalize_modality("CT/MR"), "CT\\MR");
    }

    #[test]
    fn missing_report_lists_only_uidless_records() {
        let mut records = parse_records(["Jane Doe,1,1.1.2020,CT", "John Roe,2,2.1.2020,CT"]);
        records[1].insert_study_uid("1.2.3");
        let mut out = Vec::new();
        write_missing_report(&mut out, "2026-08-27-12-00-00", &records).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Missing studies as of 2026-08-27-12-00-00\n"));
        assert!(text.contains("0000000001, 20200101 - NOT FOUND"));
        assert!(!text.contains("0000000002"));
    }

    #[test]
    fn date_range_extension() {
        assert_eq!(extend_date_range("20240315", 1), "20240215-20240415");
        assert_eq!(extend_date_range("20240315", 0), "20240315");
        // ranges stay as they are
        assert_eq!(extend_date_range("20240101-20240301", 2), "20240101-20240301");
    }
}
