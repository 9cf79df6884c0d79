//! Catalog rows and parsing of index records

use crate::identifier::{Identifier, IdentifierError};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use thiserror::Error;
use time::PrimitiveDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

/// Timestamp layout used by the index and stored in the catalog
pub const INDEX_DATETIME: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

time::serde::format_description!(
    index_datetime,
    PrimitiveDateTime,
    "[year]-[month]-[day] [hour]:[minute]:[second]"
);

const MARKET_SEPARATOR: char = '|';

/// Metadata for one package, as mirrored from the remote index.
///
/// `None` means the index did not give a usable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub sha256: Identifier,
    pub sha1: Option<String>,
    pub md5: Option<String>,
    #[serde(with = "index_datetime::option")]
    pub dex_date: Option<PrimitiveDateTime>,
    pub apk_size: Option<i64>,
    pub pkg_name: String,
    pub vercode: Option<i64>,
    pub vt_detection: Option<i64>,
    #[serde(with = "index_datetime::option")]
    pub vt_scan_date: Option<PrimitiveDateTime>,
    pub dex_size: Option<i64>,
    /// Stores the package was seen in, e.g. `play.google.com`
    pub markets: Vec<String>,
}

impl CatalogEntry {
    pub fn new(sha256: Identifier, pkg_name: impl Into<String>) -> Self {
        Self {
            sha256,
            sha1: None,
            md5: None,
            dex_date: None,
            apk_size: None,
            pkg_name: pkg_name.into(),
            vercode: None,
            vt_detection: None,
            vt_scan_date: None,
            dex_size: None,
            markets: Vec::new(),
        }
    }

    pub(crate) fn dex_date_column(&self) -> Option<String> {
        self.dex_date.and_then(|d| d.format(INDEX_DATETIME).ok())
    }

    pub(crate) fn vt_scan_date_column(&self) -> Option<String> {
        self.vt_scan_date.and_then(|d| d.format(INDEX_DATETIME).ok())
    }

    pub(crate) fn markets_column(&self) -> Option<String> {
        if self.markets.is_empty() {
            None
        } else {
            Some(self.markets.join("|"))
        }
    }
}

fn parse_datetime(value: Option<&str>) -> Option<PrimitiveDateTime> {
    value.and_then(|v| PrimitiveDateTime::parse(v, INDEX_DATETIME).ok())
}

fn parse_int(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.parse().ok())
}

fn parse_markets(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(MARKET_SEPARATOR)
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn decode_error(column: &str, source: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(source),
    }
}

impl<'r> FromRow<'r, SqliteRow> for CatalogEntry {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let sha256: String = row.try_get("sha256")?;
        let sha256 = Identifier::parse(&sha256).map_err(|e| decode_error("sha256", e))?;
        let dex_date: Option<String> = row.try_get("dex_date")?;
        let vt_scan_date: Option<String> = row.try_get("vt_scan_date")?;
        let markets: Option<String> = row.try_get("markets")?;

        Ok(Self {
            sha256,
            sha1: row.try_get("sha1")?,
            md5: row.try_get("md5")?,
            dex_date: parse_datetime(dex_date.as_deref()),
            apk_size: row.try_get("apk_size")?,
            pkg_name: row.try_get("pkg_name")?,
            vercode: row.try_get("vercode")?,
            vt_detection: row.try_get("vt_detection")?,
            vt_scan_date: parse_datetime(vt_scan_date.as_deref()),
            dex_size: row.try_get("dex_size")?,
            markets: parse_markets(markets.as_deref()),
        })
    }
}

/// Why a single index line was skipped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("expected {expected} columns, got {actual}")]
    ColumnCount { expected: usize, actual: usize },

    #[error("unterminated quoted field")]
    UnterminatedQuote,

    #[error("missing sha256")]
    MissingSha256,

    #[error("invalid sha256: {0}")]
    InvalidSha256(IdentifierError),

    #[error("missing pkg_name")]
    MissingPackageName,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("index header has no '{0}' column")]
pub struct MissingColumn(pub &'static str);

/// Column positions resolved from the index header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    width: usize,
    sha256: usize,
    pkg_name: usize,
    sha1: Option<usize>,
    md5: Option<usize>,
    dex_date: Option<usize>,
    apk_size: Option<usize>,
    vercode: Option<usize>,
    vt_detection: Option<usize>,
    vt_scan_date: Option<usize>,
    dex_size: Option<usize>,
    markets: Option<usize>,
}

impl IndexHeader {
    pub fn parse(line: &str) -> Result<Self, MissingColumn> {
        let names: Vec<String> = split_csv_line(line)
            .unwrap_or_default()
            .into_iter()
            .map(|n| n.trim().to_ascii_lowercase())
            .collect();
        let find = |name: &str| names.iter().position(|n| n == name);

        Ok(Self {
            width: names.len(),
            sha256: find("sha256").ok_or(MissingColumn("sha256"))?,
            pkg_name: find("pkg_name").ok_or(MissingColumn("pkg_name"))?,
            sha1: find("sha1"),
            md5: find("md5"),
            dex_date: find("dex_date"),
            apk_size: find("apk_size"),
            vercode: find("vercode"),
            vt_detection: find("vt_detection"),
            vt_scan_date: find("vt_scan_date"),
            dex_size: find("dex_size"),
            markets: find("markets"),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Parse one data line. Unusable optional values become `None`; only
    /// identity problems make the whole record malformed.
    pub fn parse_record(&self, line: &str) -> Result<CatalogEntry, MalformedRecord> {
        let fields = split_csv_line(line)?;
        if fields.len() != self.width {
            return Err(MalformedRecord::ColumnCount {
                expected: self.width,
                actual: fields.len(),
            });
        }

        let get = |idx: Option<usize>| {
            idx.and_then(|i| fields.get(i))
                .map(|f| f.trim())
                .filter(|f| !f.is_empty())
        };

        let sha256 = get(Some(self.sha256)).ok_or(MalformedRecord::MissingSha256)?;
        let sha256 = Identifier::parse(sha256).map_err(MalformedRecord::InvalidSha256)?;
        let pkg_name = get(Some(self.pkg_name)).ok_or(MalformedRecord::MissingPackageName)?;

        Ok(CatalogEntry {
            sha256,
            sha1: get(self.sha1).map(str::to_string),
            md5: get(self.md5).map(str::to_string),
            dex_date: parse_datetime(get(self.dex_date)),
            apk_size: parse_int(get(self.apk_size)),
            pkg_name: pkg_name.to_string(),
            vercode: parse_int(get(self.vercode)),
            vt_detection: parse_int(get(self.vt_detection)),
            vt_scan_date: parse_datetime(get(self.vt_scan_date)),
            dex_size: parse_int(get(self.dex_size)),
            markets: parse_markets(get(self.markets)),
        })
    }
}

/// Split one CSV line, honouring double quotes and `""` escapes
pub fn split_csv_line(line: &str) -> Result<Vec<String>, MalformedRecord> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
        } else {
            match c {
                '"' => in_quotes = true,
                ',' => fields.push(std::mem::take(&mut field)),
                _ => field.push(c),
            }
        }
    }

    if in_quotes {
        return Err(MalformedRecord::UnterminatedQuote);
    }
    fields.push(field);
    Ok(fields)
}
