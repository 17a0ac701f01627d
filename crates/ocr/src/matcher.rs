//! Noise-tolerant lookup of a short transaction id inside OCR output.

/// Keep only ASCII letters and digits, uppercased.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Map characters OCR commonly confuses onto one representative. Expects
/// normalised (uppercase alphanumeric) input.
pub fn fold_confusables(normalized: &str) -> String {
    normalized
        .chars()
        .map(|c| match c {
            'O' | 'Q' => '0',
            'I' | 'L' => '1',
            'Z' => '2',
            'S' => '5',
            'B' => '8',
            other => other,
        })
        .collect()
}

/// Levenshtein edit distance using the two-row O(min(m,n)) space algorithm.
pub fn distance(s1: &str, s2: &str) -> usize {
    let a: Vec<char> = s1.chars().collect();
    let b: Vec<char> = s2.chars().collect();
    char_distance(&a, &b)
}

fn char_distance(a: &[char], b: &[char]) -> usize {
    let (m, n) = (a.len(), b.len());

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    // Keep the shorter string in the inner loop to minimise allocation.
    let (a, b, m, n) = if m <= n { (b, a, n, m) } else { (a, b, m, n) };

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Smallest edit distance between `needle` and any `|needle|`-long window of
/// `haystack`. Stops early on an exact window.
pub fn best_window_distance(needle: &str, haystack: &str) -> usize {
    let needle: Vec<char> = needle.chars().collect();
    let haystack: Vec<char> = haystack.chars().collect();

    if needle.is_empty() {
        return 0;
    }
    if haystack.is_empty() {
        return needle.len();
    }
    if haystack.len() < needle.len() {
        return char_distance(&needle, &haystack);
    }

    let mut best = usize::MAX;
    for window in haystack.windows(needle.len()) {
        best = best.min(char_distance(&needle, window));
        if best == 0 {
            break;
        }
    }
    best
}

/// Match decision for one expected id against extracted text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMatch {
    /// `None` when there was nothing to look for.
    pub matched: Option<bool>,
    pub distance: Option<usize>,
}

impl IdMatch {
    pub const UNKNOWN: IdMatch = IdMatch { matched: None, distance: None };
}

/// Normalise both sides (optionally folding look-alikes), then accept when
/// the windowed distance is within `threshold`. Containment short-circuits to
/// distance 0.
pub fn match_transaction_id(
    expected: Option<&str>,
    extracted: &str,
    threshold: usize,
    fold: bool,
) -> IdMatch {
    let Some(expected) = expected else {
        return IdMatch::UNKNOWN;
    };
    let mut needle = normalize(expected);
    if needle.is_empty() {
        return IdMatch::UNKNOWN;
    }
    let mut haystack = normalize(extracted);
    if fold {
        needle = fold_confusables(&needle);
        haystack = fold_confusables(&haystack);
    }

    let d = if haystack.contains(&needle) {
        0
    } else {
        best_window_distance(&needle, &haystack)
    };

    IdMatch { matched: Some(d <= threshold), distance: Some(d) }
}
