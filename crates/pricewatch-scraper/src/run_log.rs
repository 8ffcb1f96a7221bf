//! Per-run outcome log.
//!
//! Lines are buffered in memory and written to disk once, after the run or
//! at interrupt, so an aborted run never leaves a half-written file.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

const LINE_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";
const FILE_TIMESTAMP: &str = "%Y-%m-%d_%H-%M-%S";

/// How one product × region pair ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairOutcome {
    Succeeded,
    FetchFailed,
    ExtractionFailed,
    ParseFailed,
    /// The pair panicked; a failure observation was emitted in its place.
    Crashed,
}

impl PairOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PairOutcome::Succeeded => "ok",
            PairOutcome::FetchFailed => "fetch-failed",
            PairOutcome::ExtractionFailed => "extraction-failed",
            PairOutcome::ParseFailed => "parse-failed",
            PairOutcome::Crashed => "crashed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub fetch_failed: usize,
    pub extraction_failed: usize,
    pub parse_failed: usize,
    pub crashed: usize,
    /// Counted independently of the outcome: an observation with an
    /// unresolved region is still emitted.
    pub unresolved_region: usize,
    pub persistence_failed: usize,
}

impl RunSummary {
    pub fn record(&mut self, outcome: PairOutcome) {
        match outcome {
            PairOutcome::Succeeded => self.succeeded += 1,
            PairOutcome::FetchFailed => self.fetch_failed += 1,
            PairOutcome::ExtractionFailed => self.extraction_failed += 1,
            PairOutcome::ParseFailed => self.parse_failed += 1,
            PairOutcome::Crashed => self.crashed += 1,
        }
    }

    /// Pairs processed, whatever their outcome.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.fetch_failed + self.extraction_failed + self.parse_failed + self.crashed
    }

    /// At least one pair ran and nothing failed, including persistence.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.processed() > 0 && self.failed() == 0 && self.persistence_failed == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "succeeded={} fetch_failed={} extraction_failed={} parse_failed={} crashed={} \
             unresolved_region={} persistence_failed={}",
            self.succeeded,
            self.fetch_failed,
            self.extraction_failed,
            self.parse_failed,
            self.crashed,
            self.unresolved_region,
            self.persistence_failed,
        )
    }
}

#[derive(Debug, Clone)]
pub struct RunLog {
    started: DateTime<Local>,
    lines: Vec<String>,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Local::now(),
            lines: Vec::new(),
        }
    }

    /// Append a timestamped line.
    pub fn line(&mut self, message: impl AsRef<str>) {
        self.lines.push(format!(
            "[{}] {}",
            Local::now().format(LINE_TIMESTAMP),
            message.as_ref()
        ));
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn file_name(&self) -> String {
        format!("scrape_{}.log", self.started.format(FILE_TIMESTAMP))
    }

    /// Full log text with `summary` as the final line.
    #[must_use]
    pub fn render(&self, summary: &RunSummary) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(&format!(
            "[{}] summary: {summary}\n",
            Local::now().format(LINE_TIMESTAMP)
        ));
        out
    }

    /// Write the rendered log into `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the directory or file cannot be
    /// written.
    pub fn write_to(&self, dir: &Path, summary: &RunSummary) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        std::fs::write(&path, self.render(summary))?;
        Ok(path)
    }
}
