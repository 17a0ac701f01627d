use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::Decimal;

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// A number with optional comma grouping and optional fraction.
macro_rules! num {
    () => {
        r"(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)"
    };
}

macro_rules! currency_code {
    () => {
        r"(?:MVR|USD|EUR|GBP|INR|LKR|AED|SGD|RF|RS)"
    };
}

re!(re_currency_before,
    concat!(r"(?i)(?:\b", currency_code!(), r"\.?|[$€£₹¥])\s*", num!()));
re!(re_currency_after,
    concat!(r"(?i)\b", num!(), r"\s*(?:", currency_code!(), r"\b|[$€£₹¥])"));
re!(re_keyword,
    concat!(r"(?i)\b(?:grand\s+total|total|amount|due)\b[^\d\n]{0,20}?\b", num!()));
re!(re_any_number,
    concat!(r"\b", num!()));

/// Heuristic locator of the transferred total in free OCR text.
#[derive(Debug, Clone)]
pub struct AmountExtractor {
    ceiling: Decimal,
}

impl Default for AmountExtractor {
    fn default() -> Self {
        Self { ceiling: Decimal::from(10_000_000) }
    }
}

impl AmountExtractor {
    pub fn new(ceiling: Decimal) -> Self {
        Self { ceiling }
    }

    /// Labelled candidates first (currency-adjacent or keyword-led); only when
    /// there are none, the largest plausible bare number. Never panics.
    pub fn extract(&self, text: &str) -> Option<Decimal> {
        labelled_candidates(text)
            .into_iter()
            .max()
            .or_else(|| self.fallback(text))
    }

    fn fallback(&self, text: &str) -> Option<Decimal> {
        re_any_number()
            .captures_iter(text)
            .filter_map(|c| {
                let raw = c.get(1)?.as_str();
                let value = parse_number(raw)?;
                (value > Decimal::ZERO && value <= self.ceiling && !looks_like_year(raw))
                    .then_some(value)
            })
            .max()
    }
}

/// Free-function form using the default ceiling.
pub fn extract_amount(text: &str) -> Option<Decimal> {
    AmountExtractor::default().extract(text)
}

fn labelled_candidates(text: &str) -> Vec<Decimal> {
    [re_currency_before(), re_currency_after(), re_keyword()]
        .into_iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|c| parse_number(c.get(1)?.as_str()))
        .collect()
}

// Known limitation: a genuine whole-unit amount between 1900 and 2099 with
// no label is indistinguishable from a year and gets dropped.
fn looks_like_year(raw: &str) -> bool {
    raw.len() == 4
        && raw.bytes().all(|b| b.is_ascii_digit())
        && matches!(raw.parse::<u32>(), Ok(1900..=2099))
}

// ── Amount parsing ────────────────────────────────────────────────────────────

fn parse_number(s: &str) -> Option<Decimal> {
    let clean = s.replace(',', "");
    Decimal::from_str(&clean).ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
