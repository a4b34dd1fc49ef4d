//! Plain-text wire formats
//!
//! Every protocol response is a sequence of `<>`-separated lines. This
//! module holds the pieces shared by the server, the peer client, and
//! record serialization: the field separator and the stamp-range syntax.
//!
//! Range syntax: `begin-end`, `begin-` (open, up to now), `-end`, `-`
//! (everything), or `stamp/id` (exact match).

use crate::error::{BbsError, BbsResult};

/// Separator between fields of a wire line
pub const SEP: &str = "<>";

/// A stamp range or exact-record selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Range {
    /// `begin-end`, both bounds inclusive
    Between(i64, i64),
    /// `begin-`, from begin up to now
    Since(i64),
    /// `-end`, everything up to end
    Until(i64),
    /// `-`, everything up to now
    All,
    /// `stamp/id`, one specific record
    Exact { stamp: i64, id: String },
}

impl Range {
    /// Parse a range path segment.
    pub fn parse(s: &str) -> BbsResult<Self> {
        let s = s.trim();
        if let Some((stamp, id)) = s.split_once('/') {
            let stamp = stamp
                .parse::<i64>()
                .map_err(|_| BbsError::InvalidRange(s.to_string()))?;
            if id.is_empty() {
                return Err(BbsError::InvalidRange(s.to_string()));
            }
            return Ok(Range::Exact {
                stamp,
                id: id.to_string(),
            });
        }
        let (begin, end) = s
            .split_once('-')
            .ok_or_else(|| BbsError::InvalidRange(s.to_string()))?;
        let parse_bound = |b: &str| -> BbsResult<Option<i64>> {
            if b.is_empty() {
                Ok(None)
            } else {
                b.parse::<i64>()
                    .map(Some)
                    .map_err(|_| BbsError::InvalidRange(s.to_string()))
            }
        };
        match (parse_bound(begin)?, parse_bound(end)?) {
            (Some(b), Some(e)) => Ok(Range::Between(b, e)),
            (Some(b), None) => Ok(Range::Since(b)),
            (None, Some(e)) => Ok(Range::Until(e)),
            (None, None) => Ok(Range::All),
        }
    }

    /// Whether a record identified by (stamp, id) falls inside the range
    pub fn contains(&self, stamp: i64, id: &str) -> bool {
        match self {
            Range::Between(b, e) => *b <= stamp && stamp <= *e,
            Range::Since(b) => *b <= stamp,
            Range::Until(e) => stamp <= *e,
            Range::All => true,
            Range::Exact { stamp: s, id: i } => *s == stamp && i == id,
        }
    }

    /// The path-segment form used in outbound requests
    pub fn to_path(&self) -> String {
        match self {
            Range::Between(b, e) => format!("{}-{}", b, e),
            Range::Since(b) => format!("{}-", b),
            Range::Until(e) => format!("-{}", e),
            Range::All => "-".to_string(),
            Range::Exact { stamp, id } => format!("{}/{}", stamp, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_between() {
        let r = Range::parse("100-200").unwrap();
        assert_eq!(r, Range::Between(100, 200));
        assert!(r.contains(100, "x"));
        assert!(r.contains(200, "x"));
        assert!(!r.contains(99, "x"));
        assert!(!r.contains(201, "x"));
    }

    #[test]
    fn test_parse_open_ranges() {
        assert_eq!(Range::parse("100-").unwrap(), Range::Since(100));
        assert_eq!(Range::parse("-200").unwrap(), Range::Until(200));
        assert_eq!(Range::parse("-").unwrap(), Range::All);
        assert!(Range::parse("-").unwrap().contains(0, "x"));
    }

    #[test]
    fn test_parse_exact() {
        let r = Range::parse("123/abcdef").unwrap();
        assert!(r.contains(123, "abcdef"));
        assert!(!r.contains(123, "other"));
        assert!(!r.contains(124, "abcdef"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Range::parse("abc").is_err());
        assert!(Range::parse("a-b").is_err());
        assert!(Range::parse("12/").is_err());
        assert!(Range::parse("x/id").is_err());
    }

    #[test]
    fn test_to_path_round_trip() {
        for s in ["100-200", "100-", "-200", "-", "5/beef"] {
            assert_eq!(Range::parse(s).unwrap().to_path(), s);
        }
    }
}
