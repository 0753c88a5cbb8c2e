//! Subsequence scoring for fuzzy search.
//!
//! Costs are integers and lower is better. A match walks the candidate
//! left to right and charges every gap between consecutive matched bytes
//! plus the unmatched tail, so contiguous matches near the start of a
//! short candidate win. `None` means the query is not a subsequence at
//! all and the candidate is excluded.

/// Added to the combined cost when the filename side did not match.
/// Large enough that any filename match outranks every content-only match.
pub const FILENAME_MISS_PENALTY: usize = 10_000;

/// Added when no content line matched. Dominates any single line cost
/// (excerpt lines are capped well below this).
pub const CONTENT_MISS_PENALTY: usize = 2_500;

/// Filename cost counts double so filename quality dominates ordering
/// between entries that match on both sides.
pub const FILENAME_WEIGHT: usize = 2;

/// A successful subsequence match against one candidate string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub cost: usize,
    /// Byte range from the first to one past the last matched byte,
    /// in the original (non-lowercased) candidate.
    pub span: (usize, usize),
}

/// Case-insensitive subsequence match of `query` inside `candidate`.
///
/// The query must already be ASCII-lowercased; candidates are lowercased
/// here. Lowercasing is ASCII-only so byte offsets in the span stay valid
/// for the original string.
pub fn subsequence_match(query: &str, candidate: &str) -> Option<Match> {
    if query.is_empty() {
        return Some(Match {
            cost: 0,
            span: (0, 0),
        });
    }
    let q = query.as_bytes();
    let c_lower = candidate.to_ascii_lowercase();
    let c = c_lower.as_bytes();

    let mut qi = 0usize;
    let mut cost = 0usize;
    let mut last_match = 0usize;
    let mut first_match = 0usize;

    for (i, b) in c.iter().enumerate() {
        if qi < q.len() && *b == q[qi] {
            if qi == 0 {
                first_match = i;
            }
            cost += i.saturating_sub(last_match);
            last_match = i;
            qi += 1;
            if qi == q.len() {
                cost += candidate.len().saturating_sub(i);
                return Some(Match {
                    cost,
                    span: (first_match, i + 1),
                });
            }
        }
    }
    None
}

/// Fold the filename and content components into one ranking cost.
///
/// Returns `None` when neither side matched (the entry is not a result).
/// Missing sides are charged a flat penalty instead of being dropped, so
/// an entry matching both sides always ranks above one matching only the
/// filename, which in turn ranks above any content-only match.
pub fn combine(filename: Option<usize>, content: Option<usize>) -> Option<usize> {
    if filename.is_none() && content.is_none() {
        return None;
    }
    let filename_component = filename.unwrap_or(FILENAME_MISS_PENALTY);
    let content_component = content.unwrap_or(CONTENT_MISS_PENALTY);
    Some(filename_component * FILENAME_WEIGHT + content_component)
}
