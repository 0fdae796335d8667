//! Parses candidate endpoint lists from files, literals and CIDR blocks.

use std::fs;
use std::net::IpAddr;
use std::str::FromStr;

use cidr_utils::cidr::IpCidr;
use itertools::Itertools;
use log::{debug, warn};
use rand::seq::SliceRandom;

use crate::error::ScanError;

/// Knobs applied after parsing, in order: per-subnet sampling happens during
/// expansion, then the whole set is optionally shuffled, then capped.
#[derive(Debug, Clone, Default)]
pub struct CandidateOptions {
    /// Upper bound on the final candidate count.
    pub cap: Option<usize>,
    /// Randomize candidate order before capping.
    pub shuffle: bool,
    /// Keep at most this many addresses per expanded subnet.
    pub sample_per_subnet: Option<usize>,
}

/// Loads candidates from `source`: either a single CIDR expression, or a
/// path to a newline-delimited file where blank lines and lines starting
/// with `#` are ignored and every other line is a literal address or a CIDR
/// block (detected by the presence of `/`).
///
/// CIDR blocks expand to individual addresses; for IPv4 subnets of width
/// /24 through /30 the network and broadcast addresses are elided. An empty
/// resulting set is a fatal [`ScanError::NoCandidates`].
pub fn load_candidates(
    source: &str,
    options: &CandidateOptions,
) -> Result<Vec<String>, ScanError> {
    let mut candidates = if source.contains('/') && IpCidr::from_str(source).is_ok() {
        expand_cidr(source, options.sample_per_subnet)
    } else {
        let content = fs::read_to_string(source)
            .map_err(|_| ScanError::NoCandidates(source.to_owned()))?;
        parse_lines(&content, options.sample_per_subnet)
    };

    if options.shuffle {
        candidates.shuffle(&mut rand::rng());
    }
    if let Some(cap) = options.cap {
        candidates.truncate(cap);
    }
    if candidates.is_empty() {
        return Err(ScanError::NoCandidates(source.to_owned()));
    }
    debug!("loaded {} candidates from {source:?}", candidates.len());
    Ok(candidates)
}

/// Parses file content: one address or CIDR block per meaningful line.
fn parse_lines(content: &str, sample_per_subnet: Option<usize>) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .flat_map(|line| {
            if line.contains('/') {
                if IpCidr::from_str(line).is_ok() {
                    expand_cidr(line, sample_per_subnet)
                } else {
                    warn!("skipping unparseable CIDR line {line:?}");
                    Vec::new()
                }
            } else {
                vec![line.to_owned()]
            }
        })
        .unique()
        .collect()
}

/// Expands one CIDR block into individual addresses, eliding network and
/// broadcast addresses for /24-through-/30 IPv4 subnets and sub-sampling to
/// a bounded count when requested.
fn expand_cidr(expression: &str, sample_per_subnet: Option<usize>) -> Vec<String> {
    let Ok(cidr) = IpCidr::from_str(expression) else {
        return Vec::new();
    };
    let prefix: u8 = expression
        .split('/')
        .nth(1)
        .and_then(|bits| bits.parse().ok())
        .unwrap_or(32);

    let mut hosts: Vec<IpAddr> = cidr.iter().map(|c| c.address()).collect();
    let elide_edges = matches!(hosts.first(), Some(IpAddr::V4(_)))
        && (24..=30).contains(&prefix)
        && hosts.len() > 2;
    if elide_edges {
        hosts.remove(0);
        hosts.pop();
    }

    if let Some(limit) = sample_per_subnet {
        if hosts.len() > limit {
            hosts.shuffle(&mut rand::rng());
            hosts.truncate(limit);
        }
    }

    hosts.iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_lines_pass_through() {
        let parsed = parse_lines("203.0.113.1\nexample.com\n", None);
        assert_eq!(parsed, vec!["203.0.113.1", "example.com"]);
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        let content = "# harvested 2025-11-02\n\n203.0.113.1\n   \n# trailing\n203.0.113.2\n";
        let parsed = parse_lines(content, None);
        assert_eq!(parsed, vec!["203.0.113.1", "203.0.113.2"]);
    }

    #[test]
    fn duplicate_lines_collapse() {
        let parsed = parse_lines("203.0.113.1\n203.0.113.1\n", None);
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn slash_30_elides_network_and_broadcast() {
        let hosts = expand_cidr("192.168.0.0/30", None);
        assert_eq!(hosts, vec!["192.168.0.1", "192.168.0.2"]);
    }

    #[test]
    fn slash_24_expands_to_254_hosts() {
        let hosts = expand_cidr("10.0.0.0/24", None);
        assert_eq!(hosts.len(), 254);
        assert!(!hosts.contains(&"10.0.0.0".to_owned()));
        assert!(!hosts.contains(&"10.0.0.255".to_owned()));
    }

    #[test]
    fn wide_subnets_keep_their_edges() {
        // /31 and /32 have no usable network/broadcast distinction
        assert_eq!(expand_cidr("10.0.0.0/32", None), vec!["10.0.0.0"]);
        assert_eq!(expand_cidr("10.0.0.0/31", None).len(), 2);
    }

    #[test]
    fn subnet_sampling_bounds_expansion() {
        let hosts = expand_cidr("10.0.0.0/24", Some(16));
        assert_eq!(hosts.len(), 16);
    }

    #[test]
    fn single_cidr_source_expands_directly() {
        let candidates = load_candidates("192.168.0.0/30", &CandidateOptions::default()).unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn cap_limits_the_final_set() {
        let options = CandidateOptions {
            cap: Some(5),
            ..CandidateOptions::default()
        };
        let candidates = load_candidates("10.0.0.0/24", &options).unwrap();
        assert_eq!(candidates.len(), 5);
    }

    #[test]
    fn shuffle_preserves_the_set() {
        let options = CandidateOptions {
            shuffle: true,
            ..CandidateOptions::default()
        };
        let mut shuffled = load_candidates("10.0.0.0/24", &options).unwrap();
        let mut plain = load_candidates("10.0.0.0/24", &CandidateOptions::default()).unwrap();
        shuffled.sort();
        plain.sort();
        assert_eq!(shuffled, plain);
    }

    #[test]
    fn missing_file_is_no_candidates() {
        let err = load_candidates("fixtures/does-not-exist.txt", &CandidateOptions::default())
            .unwrap_err();
        assert!(matches!(err, ScanError::NoCandidates(_)));
    }

    #[test]
    fn candidate_file_mixes_literals_and_cidrs() {
        let candidates =
            load_candidates("fixtures/candidates.txt", &CandidateOptions::default()).unwrap();
        assert!(candidates.contains(&"203.0.113.10".to_owned()));
        assert!(candidates.contains(&"192.168.0.1".to_owned()));
        assert!(!candidates.contains(&"192.168.0.0".to_owned()));
    }

    #[test]
    fn empty_file_is_no_candidates() {
        let err = load_candidates("fixtures/empty.txt", &CandidateOptions::default()).unwrap_err();
        assert!(matches!(err, ScanError::NoCandidates(_)));
    }
}
