//! Fuzzy name resolution for generator/parser pairing.
//!
//! Names are normalized (case, separators, known suffixes) and then ranked
//! by an indel-based similarity ratio. Used for local pairing and for
//! searching remote parser listings.

use std::cmp::Ordering;

use serde::Serialize;

/// Suffixes stripped from the end of a name, checked in this order and
/// repeatedly until none applies, so `foo_parser_latest` becomes `foo`.
pub const KNOWN_SUFFIXES: &[&str] = &[
    "_latest",
    "_marketplace",
    "_parser",
    "_generator",
    "_logs",
    "_log",
    "_production",
    "_prod",
    "_staging",
    "_dev",
    "_test",
    "_enterprise",
    "_premium",
    "_free",
    "_v1",
    "_v2",
    "_v3",
];

/// One ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub candidate: String,
    /// Ratio in `[0, 1]` over normalized names.
    pub similarity: f64,
    /// Both names normalize to the same string.
    pub exact_normalized: bool,
}

/// Normalize a product name: lower-case, unify `-`, `.` and whitespace to
/// `_`, collapse repeats, then strip known suffixes to a fixpoint.
pub fn normalize(name: &str) -> String {
    let mut s = String::with_capacity(name.len());
    for c in name.trim().chars().flat_map(char::to_lowercase) {
        let c = if c == '-' || c == '.' || c.is_whitespace() {
            '_'
        } else {
            c
        };
        if c == '_' && s.ends_with('_') {
            continue;
        }
        s.push(c);
    }

    loop {
        let trimmed = s.trim_matches('_');
        if trimmed.len() != s.len() {
            s = trimmed.to_string();
        }
        let suffix = KNOWN_SUFFIXES
            .iter()
            .find(|suffix| s.len() > suffix.len() && s.ends_with(*suffix));
        match suffix {
            Some(suffix) => s.truncate(s.len() - suffix.len()),
            None => break,
        }
    }
    s
}

/// Symmetric similarity of two names after normalization.
///
/// The larger of the plain indel ratio and the ratio over `_`-separated
/// tokens sorted alphabetically, so reordered words still score high.
pub fn similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (normalize(a), normalize(b));
    ratio(&a, &b).max(ratio(&token_sort(&a), &token_sort(&b)))
}

/// Rank `candidates` against `name`.
///
/// Sorted by exact-normalized first, then similarity, then candidate name.
pub fn resolve<S: AsRef<str>>(name: &str, candidates: &[S]) -> Vec<Match> {
    let target = normalize(name);
    let mut ranked: Vec<Match> = candidates
        .iter()
        .map(|c| {
            let candidate = c.as_ref();
            Match {
                candidate: candidate.to_string(),
                similarity: similarity(name, candidate),
                exact_normalized: normalize(candidate) == target,
            }
        })
        .collect();
    ranked.sort_by(compare);
    ranked
}

/// The best candidate, if it is an exact normalized match or at least
/// `min_similarity` similar.
pub fn best_match<S: AsRef<str>>(name: &str, candidates: &[S], min_similarity: f64) -> Option<Match> {
    resolve(name, candidates)
        .into_iter()
        .next()
        .filter(|m| m.exact_normalized || m.similarity >= min_similarity)
}

pub(crate) fn compare(a: &Match, b: &Match) -> Ordering {
    b.exact_normalized
        .cmp(&a.exact_normalized)
        .then_with(|| b.similarity.total_cmp(&a.similarity))
        .then_with(|| a.candidate.cmp(&b.candidate))
}

fn token_sort(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split('_').filter(|t| !t.is_empty()).collect();
    tokens.sort_unstable();
    tokens.join("_")
}

/// `2 * lcs / (len(a) + len(b))`, i.e. one minus the normalized indel distance.
fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * lcs_len(&a, &b) as f64 / total as f64
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut cur = vec![0usize; b.len() + 1];
    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            cur[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                cur[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}
