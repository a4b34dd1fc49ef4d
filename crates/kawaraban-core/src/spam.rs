//! Spam ruleset
//!
//! Records are matched against a regex ruleset loaded from a plain-text
//! file (one pattern per line, `#` comments) and against a size cap.
//! Matching or oversize records are rejected before storage, and any copy
//! already written is deleted by the caller.

use std::path::Path;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{BbsError, BbsResult};
use crate::record::Record;

/// Regex ruleset plus size cap applied to inbound records
pub struct SpamFilter {
    rules: Vec<Regex>,
    limit_bytes: usize,
}

impl SpamFilter {
    /// Filter with no patterns, size cap only
    pub fn new(limit_kb: usize) -> Self {
        Self {
            rules: Vec::new(),
            limit_bytes: limit_kb * 1024,
        }
    }

    /// Load patterns from a rule file.
    ///
    /// An unreadable file is fatal at startup; a single bad pattern is
    /// logged and skipped so one typo cannot disable the whole ruleset.
    pub fn load(path: impl AsRef<Path>, limit_kb: usize) -> BbsResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BbsError::Config(format!("spam rules {:?}: {}", path.as_ref(), e)))?;
        let mut rules = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Regex::new(line) {
                Ok(re) => rules.push(re),
                Err(e) => warn!(pattern = line, error = %e, "Skipping bad spam pattern"),
            }
        }
        debug!(count = rules.len(), "Loaded spam ruleset");
        Ok(Self {
            rules,
            limit_bytes: limit_kb * 1024,
        })
    }

    /// Whether the record is oversize or matches a rule
    pub fn is_spam(&self, record: &Record) -> bool {
        if record.len_bytes() > self.limit_bytes {
            return true;
        }
        let body = record.body_string();
        self.rules.iter().any(|re| re.is_match(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record_with_body(body: &str) -> Record {
        Record::build("tea", 100, vec![("body".to_string(), body.to_string())], "").unwrap()
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let filter = SpamFilter::new(250);
        assert!(!filter.is_spam(&record_with_body("hello")));
    }

    #[test]
    fn test_oversize_record_is_spam() {
        let filter = SpamFilter::new(1);
        let big = "x".repeat(2 * 1024);
        assert!(filter.is_spam(&record_with_body(&big)));
    }

    #[test]
    fn test_pattern_match_is_spam() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "buy .* now").unwrap();
        writeln!(file, "(broken").unwrap(); // skipped, not fatal
        let filter = SpamFilter::load(file.path(), 250).unwrap();

        assert!(filter.is_spam(&record_with_body("buy pills now")));
        assert!(!filter.is_spam(&record_with_body("ordinary post")));
    }

    #[test]
    fn test_missing_rule_file_is_fatal() {
        assert!(SpamFilter::load("/nonexistent/rules.txt", 250).is_err());
    }
}
