use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SessionTokenError;

/// Progress marker of one partition, as handed out by the store in `x-ms-session-token`.
///
/// Two wire forms exist: the legacy simple form is a bare LSN (`"57"`), the vector form carries a
/// version, the global LSN and the per-region progress (`"1#100#4=90#5=1"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionToken {
    Simple {
        lsn: i64,
    },
    Vector {
        version: u64,
        lsn: i64,
        regions: BTreeMap<u32, i64>,
    },
}

impl SessionToken {
    pub fn simple(lsn: i64) -> Self {
        SessionToken::Simple { lsn }
    }

    pub fn vector(version: u64, lsn: i64, regions: &[(u32, i64)]) -> Self {
        SessionToken::Vector {
            version,
            lsn,
            regions: regions.iter().copied().collect(),
        }
    }

    /// The global log sequence number.
    pub fn lsn(&self) -> i64 {
        match self {
            SessionToken::Simple { lsn } | SessionToken::Vector { lsn, .. } => *lsn,
        }
    }

    /// Combines two observations of the same partition; the result is at least as recent as both.
    ///
    /// Vector tokens of equal version take the per-region maximum. Otherwise the region set of the
    /// higher version wins, keeping the larger progress for regions both sides know.
    pub fn merge(&self, other: &SessionToken) -> SessionToken {
        match (self, other) {
            (
                SessionToken::Vector {
                    version: left_version,
                    lsn: left_lsn,
                    regions: left_regions,
                },
                SessionToken::Vector {
                    version: right_version,
                    lsn: right_lsn,
                    regions: right_regions,
                },
            ) => {
                let lsn = (*left_lsn).max(*right_lsn);
                let regions = if left_version == right_version {
                    let mut merged = left_regions.clone();
                    for (region, progress) in right_regions {
                        let entry = merged.entry(*region).or_insert(*progress);
                        *entry = (*entry).max(*progress);
                    }
                    merged
                } else {
                    let (newer, older) = if left_version > right_version {
                        (left_regions, right_regions)
                    } else {
                        (right_regions, left_regions)
                    };
                    newer
                        .iter()
                        .map(|(region, progress)| {
                            let known = older.get(region).copied().unwrap_or(*progress);
                            (*region, (*progress).max(known))
                        })
                        .collect()
                };

                SessionToken::Vector {
                    version: (*left_version).max(*right_version),
                    lsn,
                    regions,
                }
            }
            _ if other.lsn() > self.lsn() => other.clone(),
            _ => self.clone(),
        }
    }

    /// Whether this token has seen at least as much as `other`.
    pub fn is_as_recent_as(&self, other: &SessionToken) -> bool {
        self.lsn() >= other.lsn()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionToken::Simple { lsn } => write!(f, "{lsn}"),
            SessionToken::Vector {
                version,
                lsn,
                regions,
            } => {
                write!(f, "{version}#{lsn}")?;
                for (region, progress) in regions {
                    write!(f, "#{region}={progress}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for SessionToken {
    type Err = SessionTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SessionTokenError::Malformed(s.to_owned());
        let trimmed = s.trim();

        if !trimmed.contains('#') {
            return trimmed
                .parse::<i64>()
                .map(SessionToken::simple)
                .map_err(|_| malformed());
        }

        let mut parts = trimmed.split('#');
        let version = parts
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(malformed)?;
        let lsn = parts
            .next()
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(malformed)?;

        let mut regions = BTreeMap::new();
        for part in parts {
            let (region, progress) = part.split_once('=').ok_or_else(malformed)?;
            let region = region.parse::<u32>().map_err(|_| malformed())?;
            let progress = progress.parse::<i64>().map_err(|_| malformed())?;
            regions.insert(region, progress);
        }

        Ok(SessionToken::Vector {
            version,
            lsn,
            regions,
        })
    }
}

/// Splits a `x-ms-session-token` header (`"0:1#100#4=90,1:1#57"`) into `(range id, token)` pairs.
pub fn parse_session_header(header: &str) -> Result<Vec<(String, SessionToken)>, SessionTokenError> {
    header
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (range_id, token) = entry
                .split_once(':')
                .ok_or_else(|| SessionTokenError::MissingRangeId(entry.to_owned()))?;
            Ok((range_id.to_owned(), token.parse()?))
        })
        .collect()
}

/// Renders `(range id, token)` pairs in header form.
pub fn format_session_header<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a SessionToken)>,
{
    entries
        .into_iter()
        .map(|(range_id, token)| format!("{range_id}:{token}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn test_parse_vector_token() {
        let token: SessionToken = "1#100#4=90#5=1".parse().unwrap();

        assert_eq!(token.lsn(), 100);
        assert_eq!(token, SessionToken::vector(1, 100, &[(4, 90), (5, 1)]));
        assert_eq!(token.to_string(), "1#100#4=90#5=1");
    }

    #[test]
    fn test_parse_simple_token() {
        let token: SessionToken = "57".parse().unwrap();
        assert_eq!(token, SessionToken::simple(57));
        assert_eq!(token.to_string(), "57");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "abc", "1#", "1#x", "1#100#4", "1#100#a=1", "1#100#4=z"] {
            assert!(
                bad.parse::<SessionToken>().is_err(),
                "'{bad}' should not parse"
            );
        }
    }

    #[test]
    fn test_parse_session_header() {
        let entries = parse_session_header("range_0:1#100#4=90#5=1, range_1:1#57").unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "range_0");
        assert_eq!(entries[0].1.lsn(), 100);
        assert_eq!(entries[1].0, "range_1");
        assert_eq!(entries[1].1.lsn(), 57);

        assert_eq!(
            parse_session_header("1#100"),
            Err(SessionTokenError::MissingRangeId("1#100".to_owned()))
        );
        assert!(parse_session_header("").unwrap().is_empty());
    }

    #[test]
    fn test_format_session_header() {
        let a = SessionToken::vector(1, 100, &[(4, 90)]);
        let b = SessionToken::simple(7);
        assert_eq!(
            format_session_header([("0", &a), ("1", &b)]),
            "0:1#100#4=90,1:7"
        );
    }

    #[test]
    fn test_merge_same_version_takes_region_maximum() {
        let left = SessionToken::vector(1, 100, &[(4, 90), (5, 1)]);
        let right = SessionToken::vector(1, 80, &[(4, 95), (5, 0)]);

        assert_eq!(
            left.merge(&right),
            SessionToken::vector(1, 100, &[(4, 95), (5, 1)])
        );
    }

    #[test]
    fn test_merge_newer_version_wins_region_set() {
        let old = SessionToken::vector(1, 100, &[(4, 90), (5, 10)]);
        let new = SessionToken::vector(2, 90, &[(4, 80), (6, 3)]);

        let merged = old.merge(&new);
        assert_eq!(merged, SessionToken::vector(2, 100, &[(4, 90), (6, 3)]));
        assert_eq!(merged, new.merge(&old));
    }

    #[test]
    fn test_merge_simple_keeps_higher_lsn() {
        let low = SessionToken::simple(3);
        let high = SessionToken::simple(9);
        assert_eq!(low.merge(&high), high);
        assert_eq!(high.merge(&low), high);
        assert!(high.is_as_recent_as(&low));
        assert!(!low.is_as_recent_as(&high));
    }

    #[test]
    fn test_merge_in_any_order_reaches_max_lsn() {
        let mut tokens: Vec<SessionToken> = (0..20)
            .map(|lsn| SessionToken::vector(1, lsn * 7 % 23, &[(1, lsn)]))
            .collect();
        let max_lsn = tokens.iter().map(SessionToken::lsn).max().unwrap();
        let mut rng = rand::thread_rng();

        for _ in 0..50 {
            tokens.shuffle(&mut rng);
            let merged = tokens[1..]
                .iter()
                .fold(tokens[0].clone(), |acc, token| acc.merge(token));
            assert_eq!(merged.lsn(), max_lsn);
            assert_eq!(merged, SessionToken::vector(1, max_lsn, &[(1, 19)]));
        }
    }
}
