//! Filename-pattern (glob) matching.
//!
//! Rules are split at parse time into *hashable* suffix rules (`*.ext` with
//! no further wildcards), indexed through a hash table sized to the nearest
//! prime at or above the rule count, and a *fallback* list of everything
//! else, matched with ordinary shell-glob semantics.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use glob::Pattern;
use mime::Mime;

use crate::error::GlobError;

const HASH_MULTIPLIER: u64 = 27;

struct GlobRule {
    /// Full pattern text, as it appeared in the database. Kept for
    /// diagnostics; matching itself goes through `suffix` or `compiled`.
    pattern: String,
    mime: Mime,
    /// `Some(suffix)` when the pattern is of the form `*.suffix` with no
    /// further wildcard characters in `suffix`.
    suffix: Option<String>,
    /// The compiled shell-glob pattern, built once at parse time for
    /// non-hashable rules. `None` for hashable rules (they never reach the
    /// fallback scan) and for a pattern that failed to compile.
    compiled: Option<Pattern>,
}

/// The outcome of a single glob lookup.
///
/// `Ambiguous` is kept distinct from `None` so a caller that cares about the
/// difference can observe it; callers that only want a usable MIME type can
/// collapse it with [`GlobLookup::mime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobLookup {
    Unique(Mime),
    Ambiguous,
    None,
}

impl GlobLookup {
    /// Collapses `Ambiguous` and `None` into a single `None`.
    pub fn mime(self) -> Option<Mime> {
        match self {
            GlobLookup::Unique(m) => Some(m),
            GlobLookup::Ambiguous | GlobLookup::None => None,
        }
    }
}

/// Parsed glob database: a hash index over hashable suffix rules plus an
/// ordered fallback list for everything else.
pub struct GlobDatabase {
    rules: Vec<GlobRule>,
    buckets: Vec<Vec<usize>>,
    fallback: Vec<usize>,
    bucket_count: usize,
}

fn is_wildcard_byte(b: u8) -> bool {
    b == b'*' || b == b'?' || b == b'['
}

/// Classifies a pattern as hashable (`*.suffix`, suffix free of further
/// wildcards) or not.
fn classify(pattern: &str) -> Option<String> {
    let bytes = pattern.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'*' || bytes[1] != b'.' {
        return None;
    }
    let suffix = &pattern[2..];
    if suffix.bytes().any(is_wildcard_byte) {
        return None;
    }
    Some(suffix.to_string())
}

/// Smallest prime `>= n`. Trial division is adequate at the scale of a mime
/// database (a few thousand rules).
fn next_prime(n: usize) -> usize {
    fn is_prime(n: usize) -> bool {
        if n < 2 {
            return false;
        }
        if n % 2 == 0 {
            return n == 2;
        }
        let mut d = 3;
        while d * d <= n {
            if n % d == 0 {
                return false;
            }
            d += 2;
        }
        true
    }

    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

/// Polynomial hash with multiplier 27, folded modulo `bucket_count` after
/// each byte. Case folding (when `ignore_case`) happens per-byte,
/// ASCII-only.
fn hash_key(key: &str, ignore_case: bool, bucket_count: usize) -> usize {
    let mut h: u64 = 0;
    for b in key.bytes() {
        let b = if ignore_case { b.to_ascii_lowercase() } else { b };
        h = h * HASH_MULTIPLIER;
        h += (b as u64) % HASH_MULTIPLIER;
        h %= bucket_count as u64;
    }
    h as usize
}

/// Splits a `priority:mime:pattern` data line into its three fields. Only
/// the first two colons are significant; any further colons belong to the
/// pattern.
fn split_data_line(line: &str) -> Option<(&str, &str, &str)> {
    let mut parts = line.splitn(3, ':');
    let priority = parts.next()?;
    let mime = parts.next()?;
    let pattern = parts.next()?;
    Some((priority, mime, pattern))
}

impl GlobDatabase {
    /// Parses a globs database file.
    ///
    /// Lines starting with `#`, blank lines, and lines not beginning with a
    /// digit are skipped. A malformed data line (wrong field count, an
    /// unparseable priority, or a mime type that doesn't parse) is skipped
    /// too, rather than reported as an error.
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<GlobDatabase, GlobError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| GlobError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);

        let mut rules = Vec::new();
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(source) => {
                    return Err(GlobError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            };

            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !line.as_bytes()[0].is_ascii_digit() {
                continue;
            }

            let (priority, mime_str, pattern) = match split_data_line(&line) {
                Some(v) => v,
                None => {
                    tracing::debug!(line = %line, "skipping malformed globs line");
                    continue;
                }
            };

            if priority.parse::<u32>().is_err() {
                tracing::debug!(line = %line, "skipping globs line with bad priority");
                continue;
            }

            let mime: Mime = match mime_str.parse() {
                Ok(m) => m,
                Err(_) => {
                    tracing::debug!(mime = %mime_str, "skipping globs line with bad mime type");
                    continue;
                }
            };

            let suffix = classify(pattern);
            let compiled = if suffix.is_none() {
                Pattern::new(pattern).ok()
            } else {
                None
            };
            rules.push(GlobRule {
                pattern: pattern.to_string(),
                mime,
                suffix,
                compiled,
            });
        }

        let bucket_count = next_prime(rules.len());
        let mut buckets: Vec<Vec<usize>> = (0..bucket_count).map(|_| Vec::new()).collect();
        let mut fallback = Vec::new();

        for (idx, rule) in rules.iter().enumerate() {
            match &rule.suffix {
                Some(suffix) => {
                    let bucket = hash_key(suffix, false, bucket_count);
                    buckets[bucket].push(idx);
                }
                None => fallback.push(idx),
            }
        }

        tracing::debug!(
            rules = rules.len(),
            buckets = bucket_count,
            fallback = fallback.len(),
            "parsed globs database"
        );

        Ok(GlobDatabase {
            rules,
            buckets,
            fallback,
            bucket_count,
        })
    }

    /// Looks up the MIME type for `file_name`: hashable suffixes first,
    /// falling back to shell-glob matching over the non-hashable rules.
    pub fn lookup(&self, file_name: &str, ignore_case: bool) -> GlobLookup {
        let mut search_from = 0;
        while let Some(rel) = file_name[search_from..].find('.') {
            let dot = search_from + rel;
            let candidate = &file_name[dot + 1..];

            let bucket = hash_key(candidate, ignore_case, self.bucket_count);
            let mut count = 0usize;
            let mut found: Option<Mime> = None;

            for &idx in &self.buckets[bucket] {
                let rule = &self.rules[idx];
                let key = rule.suffix.as_ref().expect("bucketed rule is hashable");

                let matched = if ignore_case {
                    key.eq_ignore_ascii_case(candidate)
                } else {
                    key.as_str() == candidate || key.eq_ignore_ascii_case(candidate)
                };

                if matched {
                    count += 1;
                    found = Some(rule.mime.clone());
                }
            }

            if count == 1 {
                tracing::trace!(file_name, candidate, "unique glob match");
                return GlobLookup::Unique(found.unwrap());
            } else if count > 1 {
                tracing::trace!(file_name, candidate, count, "ambiguous glob match");
                return GlobLookup::Ambiguous;
            }

            search_from = dot + 1;
        }

        for &idx in &self.fallback {
            let rule = &self.rules[idx];
            if let Some(pattern) = &rule.compiled {
                if pattern.matches(file_name) {
                    tracing::trace!(file_name, pattern = %rule.pattern, "fallback glob match");
                    return GlobLookup::Unique(rule.mime.clone());
                }
            }
        }

        GlobLookup::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_globs(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        f.flush().unwrap();
        f
    }

    #[test]
    fn classify_hashable_and_full() {
        assert_eq!(classify("*.txt"), Some("txt".to_string()));
        assert_eq!(classify("*.tar.gz"), Some("tar.gz".to_string()));
        assert_eq!(classify("*.anim[1-9j]"), None);
        assert_eq!(classify("Makefile"), None);
        assert_eq!(classify("[Mm]akefile"), None);
    }

    #[test]
    fn next_prime_is_prime_and_minimal() {
        assert_eq!(next_prime(0), 2);
        assert_eq!(next_prime(1), 2);
        assert_eq!(next_prime(4), 5);
        assert_eq!(next_prime(10), 11);
        assert_eq!(next_prime(25), 29);
    }

    #[test]
    fn simple_suffix_match() {
        let f = write_globs(&["50:text/plain:*.txt"]);
        let db = GlobDatabase::parse(f.path()).unwrap();

        assert_eq!(
            db.lookup("notes.txt", false).mime(),
            Some("text/plain".parse().unwrap())
        );
        // Case-sensitive miss, case-insensitive hit.
        assert_eq!(db.lookup("NOTES.TXT", false).mime(), None);
        assert_eq!(
            db.lookup("NOTES.TXT", true).mime(),
            Some("text/plain".parse().unwrap())
        );
    }

    #[test]
    fn ambiguous_hashable_rules_collapse() {
        let f = write_globs(&["50:image/x-a:*.dat", "50:image/x-b:*.dat"]);
        let db = GlobDatabase::parse(f.path()).unwrap();

        assert_eq!(db.lookup("sample.dat", false), GlobLookup::Ambiguous);
        assert_eq!(db.lookup("sample.dat", false).mime(), None);
    }

    #[test]
    fn pattern_fallback() {
        let f = write_globs(&["50:text/x-makefile:[Mm]akefile"]);
        let db = GlobDatabase::parse(f.path()).unwrap();

        assert_eq!(
            db.lookup("Makefile", false).mime(),
            Some("text/x-makefile".parse().unwrap())
        );
        assert_eq!(db.lookup("nonmakefile", false).mime(), None);
    }

    #[test]
    fn no_dot_skips_straight_to_fallback() {
        let f = write_globs(&["50:text/x-makefile:[Mm]akefile", "50:text/plain:*.txt"]);
        let db = GlobDatabase::parse(f.path()).unwrap();

        assert_eq!(
            db.lookup("Makefile", false).mime(),
            Some("text/x-makefile".parse().unwrap())
        );
        assert_eq!(db.lookup("README", false).mime(), None);
    }

    #[test]
    fn leading_dot_matches_by_extension() {
        let f = write_globs(&["50:text/plain:*.txt"]);
        let db = GlobDatabase::parse(f.path()).unwrap();

        assert_eq!(
            db.lookup(".txt", false).mime(),
            Some("text/plain".parse().unwrap())
        );
    }

    #[test]
    fn comments_and_non_digit_lines_are_skipped() {
        let f = write_globs(&["# comment", "bogus line", "50:text/plain:*.txt"]);
        let db = GlobDatabase::parse(f.path()).unwrap();

        assert_eq!(
            db.lookup("notes.txt", false).mime(),
            Some("text/plain".parse().unwrap())
        );
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(GlobDatabase::parse("/nonexistent/globs2").is_err());
    }
}
