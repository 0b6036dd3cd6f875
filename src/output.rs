use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::types::{Credential, ProbeOutcome, ScanResult};

const TXT_TITLE: &str = "MQTT Scan Results";
const CSV_HEADER: [&str; 4] = ["Target", "Status", "Username", "Password"];

/// Report file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Txt,
    Json,
    Csv,
}

/// A parsed report: scan date plus outcome per `host:port` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReport {
    pub scan_date: String,
    pub results: BTreeMap<String, ProbeOutcome>,
}

#[derive(Serialize, Deserialize, Debug)]
struct JsonReport {
    scan_date: String,
    results: BTreeMap<String, JsonEntry>,
}

#[derive(Serialize, Deserialize, Debug)]
struct JsonEntry {
    status: String,
    credentials: JsonCredentials,
}

#[derive(Serialize, Deserialize, Debug)]
struct JsonCredentials {
    username: Option<String>,
    password: Option<String>,
}

/// Current UTC time as `YYYY-MM-DD HH:MM:SS`.
pub fn scan_date_now() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))
        .context("failed to format scan date")
}

/// Render results in `format`.
pub fn render(
    results: &BTreeMap<String, ScanResult>,
    format: Format,
    scan_date: &str,
) -> Result<String> {
    match format {
        Format::Txt => Ok(render_txt(results, scan_date)),
        Format::Json => render_json(results, scan_date),
        Format::Csv => Ok(render_csv(results)),
    }
}

/// Render and write results to `path`.
pub fn write_report(
    path: impl AsRef<Path>,
    results: &BTreeMap<String, ScanResult>,
    format: Format,
) -> Result<()> {
    let body = render(results, format, &scan_date_now()?)?;
    fs::write(path.as_ref(), body)
        .with_context(|| format!("failed to write results to {}", path.as_ref().display()))
}

pub fn render_txt(results: &BTreeMap<String, ScanResult>, scan_date: &str) -> String {
    let mut out = String::new();
    out.push_str(TXT_TITLE);
    out.push('\n');
    out.push_str(&format!("Generated on: {scan_date}\n"));
    out.push_str(&"=".repeat(50));
    out.push_str("\n\n");
    for (key, r) in results {
        out.push_str(&format!("Target: {key}\n"));
        out.push_str(&format!("Status: {}\n", r.outcome.status()));
        if let Some(c) = r.outcome.reported_credentials() {
            out.push_str(&format!("Credentials: {c}\n"));
        }
        out.push_str(&"-".repeat(30));
        out.push('\n');
    }
    out
}

pub fn render_json(results: &BTreeMap<String, ScanResult>, scan_date: &str) -> Result<String> {
    let report = JsonReport {
        scan_date: scan_date.to_string(),
        results: results
            .iter()
            .map(|(key, r)| {
                let creds = r.outcome.reported_credentials();
                let entry = JsonEntry {
                    status: r.outcome.status().to_string(),
                    credentials: JsonCredentials {
                        username: creds.as_ref().map(|c| c.username.clone()),
                        password: creds.map(|c| c.password),
                    },
                };
                (key.clone(), entry)
            })
            .collect(),
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

pub fn render_csv(results: &BTreeMap<String, ScanResult>) -> String {
    let mut out = String::new();
    out.push_str(&CSV_HEADER.join(","));
    out.push_str("\r\n");
    for (key, r) in results {
        let creds = r.outcome.reported_credentials();
        let (user, pass) = creds
            .as_ref()
            .map(|c| (c.username.as_str(), c.password.as_str()))
            .unwrap_or(("", ""));
        let row = [key.as_str(), r.outcome.status(), user, pass]
            .iter()
            .map(|f| csv_escape(f))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&row);
        out.push_str("\r\n");
    }
    out
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Parse a report produced by [`render`].
pub fn parse(content: &str, format: Format) -> Result<ParsedReport> {
    match format {
        Format::Txt => parse_txt(content),
        Format::Json => parse_json(content),
        Format::Csv => parse_csv(content),
    }
}

fn outcome_from(key: &str, status: &str, credential: Option<Credential>) -> Result<ProbeOutcome> {
    ProbeOutcome::from_status(status, credential)
        .ok_or_else(|| anyhow!("{key}: unrecognised status {status:?}"))
}

pub fn parse_txt(content: &str) -> Result<ParsedReport> {
    let mut scan_date = String::new();
    let mut results = BTreeMap::new();
    let mut target: Option<String> = None;
    let mut status: Option<String> = None;
    let mut creds: Option<Credential> = None;

    for line in content.lines() {
        if let Some(d) = line.strip_prefix("Generated on: ") {
            scan_date = d.to_string();
        } else if let Some(t) = line.strip_prefix("Target: ") {
            target = Some(t.to_string());
        } else if let Some(s) = line.strip_prefix("Status: ") {
            status = Some(s.to_string());
        } else if let Some(c) = line.strip_prefix("Credentials: ") {
            let (u, p) = c
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed credentials line: {line}"))?;
            creds = Some(Credential::new(u, p));
        } else if !line.is_empty() && line.chars().all(|ch| ch == '-') {
            let key = target.take().ok_or_else(|| anyhow!("entry without a Target line"))?;
            let st = status
                .take()
                .ok_or_else(|| anyhow!("{key}: entry without a Status line"))?;
            let outcome = outcome_from(&key, &st, creds.take())?;
            results.insert(key, outcome);
        }
    }
    if target.is_some() {
        bail!("truncated report: last entry has no separator");
    }
    Ok(ParsedReport { scan_date, results })
}

pub fn parse_json(content: &str) -> Result<ParsedReport> {
    let report: JsonReport = serde_json::from_str(content).context("invalid JSON report")?;
    let mut results = BTreeMap::new();
    for (key, entry) in report.results {
        let creds = match (entry.credentials.username, entry.credentials.password) {
            (Some(u), Some(p)) => Some(Credential::new(u, p)),
            _ => None,
        };
        let outcome = outcome_from(&key, &entry.status, creds)?;
        results.insert(key, outcome);
    }
    Ok(ParsedReport {
        scan_date: report.scan_date,
        results,
    })
}

pub fn parse_csv(content: &str) -> Result<ParsedReport> {
    let rows = split_csv_records(content)?;
    let mut iter = rows.into_iter();
    let header = iter.next().ok_or_else(|| anyhow!("empty CSV report"))?;
    if header != CSV_HEADER {
        bail!("unexpected CSV header: {header:?}");
    }
    let mut results = BTreeMap::new();
    for (idx, row) in iter.enumerate() {
        let [key, status, user, pass]: [String; 4] = row.try_into().map_err(|r: Vec<String>| {
            anyhow!("row {}: expected 4 fields, got {}", idx + 2, r.len())
        })?;
        // Open access reports an empty pair, so emptiness alone says nothing here.
        let creds = match status.as_str() {
            ProbeOutcome::AUTHENTICATED => Some(Credential::new(user, pass)),
            _ => None,
        };
        let outcome = outcome_from(&key, &status, creds)?;
        results.insert(key, outcome);
    }
    Ok(ParsedReport {
        scan_date: String::new(),
        results,
    })
}

/// RFC 4180 record splitter. Quoted fields may contain commas, quotes and newlines.
fn split_csv_records(content: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(ch),
        }
    }
    if in_quotes {
        bail!("unterminated quoted CSV field");
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}
