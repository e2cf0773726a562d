//! Core data types: the wanted [`Query`], plugin-reported [`Candidate`]s, and
//! accepted [`Item`]s.
//!
//! Fields are split into two groups, mirroring how they are compared:
//! [`Exacts`] need precise (or relational, for the year) equality, while
//! [`NonExacts`] are matched fuzzily by substring or set intersection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::QueryError;

/// Relation between a candidate's year and the wanted year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YearModifier {
    #[default]
    Equal,
    /// Candidate year ≥ wanted year.
    EqGt,
    /// Candidate year ≤ wanted year.
    EqLt,
    Lt,
    Gt,
}

impl YearModifier {
    /// Whether `candidate` stands in this relation to `wanted`.
    pub fn admits(self, candidate: i32, wanted: i32) -> bool {
        match self {
            YearModifier::Equal => candidate == wanted,
            YearModifier::EqGt => candidate >= wanted,
            YearModifier::EqLt => candidate <= wanted,
            YearModifier::Lt => candidate < wanted,
            YearModifier::Gt => candidate > wanted,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            YearModifier::Equal => "equal",
            YearModifier::EqGt => "eq_gt",
            YearModifier::EqLt => "eq_lt",
            YearModifier::Lt => "lt",
            YearModifier::Gt => "gt",
        }
    }
}

/// A year with its relational modifier, parsed from user input such as
/// `2004`, `=2004`, `>=1990`, `<=2010`, `>1990` or `<2010`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearSpec {
    pub year: i32,
    pub modifier: YearModifier,
}

impl FromStr for YearSpec {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // Two-character prefixes first so ">=" is not read as ">".
        let (modifier, rest) = [
            (">=", YearModifier::EqGt),
            ("<=", YearModifier::EqLt),
            (">", YearModifier::Gt),
            ("<", YearModifier::Lt),
            ("=", YearModifier::Equal),
        ]
        .iter()
        .find_map(|(prefix, m)| trimmed.strip_prefix(prefix).map(|r| (*m, r)))
        .unwrap_or((YearModifier::Equal, trimmed));

        let year = rest
            .trim()
            .parse::<i32>()
            .map_err(|_| QueryError::InvalidYear(s.to_string()))?;

        Ok(YearSpec { year, modifier })
    }
}

/// Fields compared by (relational) equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exacts {
    pub year: Option<i32>,
    pub extension: Option<String>,
    pub volume: Option<u32>,
    /// Issue number.
    pub number: Option<u32>,
    pub pages: Option<u32>,
    pub language: Option<String>,
}

/// Fields compared case-insensitively by substring or set intersection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonExacts {
    #[serde(default)]
    pub authors: Vec<String>,
    pub title: Option<String>,
    pub series: Option<String>,
    pub publisher: Option<String>,
    pub journal: Option<String>,
    pub edition: Option<String>,
}

/// Identifiers and retrieval locations attached to a candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Misc {
    #[serde(default)]
    pub isbns: Vec<String>,
    /// Where the item can be fetched from (http(s) URLs, magnet links, ...).
    #[serde(default)]
    pub uris: Vec<String>,
    /// Free-form identifiers such as a DOI or a mirror's record id.
    #[serde(default)]
    pub identifiers: Vec<String>,
}

/// A raw record reported by a plugin, not yet matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidate {
    pub nonexacts: NonExacts,
    pub exacts: Exacts,
    pub misc: Misc,
}

/// A candidate that matched the query and carries at least one URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    /// Name of the plugin that reported this item.
    pub source: String,
    #[serde(flatten)]
    pub nonexacts: NonExacts,
    #[serde(flatten)]
    pub exacts: Exacts,
    #[serde(flatten)]
    pub misc: Misc,
}

impl Item {
    pub(crate) fn from_candidate(source: &str, candidate: Candidate) -> Self {
        Self {
            source: source.to_string(),
            nonexacts: candidate.nonexacts,
            exacts: candidate.exacts,
            misc: candidate.misc,
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nonexacts.title.as_deref().unwrap_or("untitled"))?;
        if !self.nonexacts.authors.is_empty() {
            write!(f, " by {}", self.nonexacts.authors.join(", "))?;
        }
        if let Some(year) = self.exacts.year {
            write!(f, " ({})", year)?;
        }
        if let Some(ext) = &self.exacts.extension {
            write!(f, " [{}]", ext)?;
        }
        write!(f, " via {}", self.source)
    }
}

/// The wanted record. Built once through [`QueryBuilder`] and never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Query {
    #[serde(flatten)]
    nonexacts: NonExacts,
    #[serde(flatten)]
    exacts: Exacts,
    year_modifier: YearModifier,
    isbns: Vec<String>,
}

impl Query {
    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }

    pub fn nonexacts(&self) -> &NonExacts {
        &self.nonexacts
    }

    pub fn exacts(&self) -> &Exacts {
        &self.exacts
    }

    pub fn year_modifier(&self) -> YearModifier {
        self.year_modifier
    }

    pub fn isbns(&self) -> &[String] {
        &self.isbns
    }

    /// True when every field is a wildcard.
    pub fn is_empty(&self) -> bool {
        self.nonexacts == NonExacts::default()
            && self.exacts == Exacts::default()
            && self.isbns.is_empty()
    }
}

/// Builder for [`Query`]. Blank strings are treated as unspecified.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    query: Query,
}

impl QueryBuilder {
    pub fn author(mut self, author: impl Into<String>) -> Self {
        if let Some(a) = non_blank(author.into()) {
            self.query.nonexacts.authors.push(a);
        }
        self
    }

    pub fn authors<I, S>(self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        authors.into_iter().fold(self, |b, a| b.author(a))
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.query.nonexacts.title = non_blank(title.into());
        self
    }

    pub fn series(mut self, series: impl Into<String>) -> Self {
        self.query.nonexacts.series = non_blank(series.into());
        self
    }

    pub fn publisher(mut self, publisher: impl Into<String>) -> Self {
        self.query.nonexacts.publisher = non_blank(publisher.into());
        self
    }

    pub fn journal(mut self, journal: impl Into<String>) -> Self {
        self.query.nonexacts.journal = non_blank(journal.into());
        self
    }

    pub fn edition(mut self, edition: impl Into<String>) -> Self {
        self.query.nonexacts.edition = non_blank(edition.into());
        self
    }

    pub fn year(mut self, spec: YearSpec) -> Self {
        self.query.exacts.year = Some(spec.year);
        self.query.year_modifier = spec.modifier;
        self
    }

    /// Parse a year with an optional `<`, `>`, `<=`, `>=` or `=` prefix.
    pub fn year_str(self, input: &str) -> Result<Self, QueryError> {
        Ok(self.year(input.parse()?))
    }

    pub fn extension(mut self, extension: &str) -> Result<Self, QueryError> {
        let ext = normalize_extension(extension);
        if ext.is_empty() {
            return Err(QueryError::EmptyExtension);
        }
        self.query.exacts.extension = Some(ext);
        Ok(self)
    }

    pub fn volume(mut self, volume: u32) -> Self {
        self.query.exacts.volume = Some(volume);
        self
    }

    pub fn number(mut self, number: u32) -> Self {
        self.query.exacts.number = Some(number);
        self
    }

    pub fn pages(mut self, pages: u32) -> Self {
        self.query.exacts.pages = Some(pages);
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.query.exacts.language = non_blank(language.into());
        self
    }

    pub fn isbn(mut self, isbn: impl Into<String>) -> Self {
        if let Some(i) = non_blank(isbn.into()) {
            self.query.isbns.push(i);
        }
        self
    }

    pub fn build(self) -> Query {
        self.query
    }
}

fn non_blank(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Lower-case an extension and strip a leading dot: `".PDF"` → `"pdf"`.
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Severity of a log line sent to a frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Off,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
            LogLevel::Off => "off",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "err" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            "off" => Ok(LogLevel::Off),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_spec_prefixes() {
        let cases = [
            ("2004", 2004, YearModifier::Equal),
            ("=2004", 2004, YearModifier::Equal),
            (">=1990", 1990, YearModifier::EqGt),
            ("<=2010", 2010, YearModifier::EqLt),
            (">1990", 1990, YearModifier::Gt),
            ("<2010", 2010, YearModifier::Lt),
            (" >= 1990 ", 1990, YearModifier::EqGt),
        ];
        for (input, year, modifier) in cases {
            let spec: YearSpec = input.parse().unwrap();
            assert_eq!(spec, YearSpec { year, modifier }, "input {:?}", input);
        }
    }

    #[test]
    fn year_spec_rejects_garbage() {
        assert!("".parse::<YearSpec>().is_err());
        assert!("=>2000".parse::<YearSpec>().is_err());
        assert!("nineteen".parse::<YearSpec>().is_err());
    }

    #[test]
    fn builder_ignores_blank_fields() {
        let q = Query::builder().title("   ").author("").build();
        assert!(q.is_empty());
    }

    #[test]
    fn builder_normalizes_extension() {
        let q = Query::builder().extension(".PDF").unwrap().build();
        assert_eq!(q.exacts().extension.as_deref(), Some("pdf"));
        assert_eq!(
            Query::builder().extension(" . ").unwrap_err(),
            QueryError::EmptyExtension
        );
    }

    #[test]
    fn query_serializes_flat() {
        let q = Query::builder()
            .title("Dune")
            .year_str(">=1965")
            .unwrap()
            .build();
        let v = serde_json::to_value(&q).unwrap();
        assert_eq!(v["title"], "Dune");
        assert_eq!(v["year"], 1965);
        assert_eq!(v["year_modifier"], "eq_gt");
        assert!(v["series"].is_null());
    }

    #[test]
    fn log_level_parse_and_order() {
        assert_eq!("err".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Critical > LogLevel::Error);
        assert_eq!(LogLevel::Info.to_string(), "info");
    }
}
