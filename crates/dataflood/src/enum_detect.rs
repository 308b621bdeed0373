// Enum detection decides whether a string field should be pinned to a
// closed set of values. It scores a value multiset on uniqueness, entropy,
// frequency concentration, and structural pattern flags, branching on the
// sample size so small and huge populations are judged differently.

use super::entropy::shannon;
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use std::collections::BTreeMap;

#[derive(Clone, Debug)]
pub struct EnumConfig {
    /// Populations above this size are reservoir-sampled down to it.
    pub max_sample: usize,
    /// Hard cap on the emitted enum value list.
    pub max_enum_values: usize,
}

impl Default for EnumConfig {
    fn default() -> Self {
        Self {
            max_sample: 10_000,
            max_enum_values: 1_000,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Confidence {
    VeryLow,
    Low,
    Medium,
    High,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Category {
    NotEnum,
    StandardSet,
    ApplicationEnum,
    NaturalConstraint,
}

#[derive(Clone, Debug)]
pub struct EnumDecision {
    pub should_create_enum: bool,
    pub enum_values: Vec<serde_json::Value>,
    pub confidence: Confidence,
    pub reasoning: String,
    pub category: Category,
}

impl EnumDecision {
    fn not_enum(confidence: Confidence, reasoning: impl Into<String>) -> Self {
        Self {
            should_create_enum: false,
            enum_values: Vec::new(),
            confidence,
            reasoning: reasoning.into(),
            category: Category::NotEnum,
        }
    }
}

// Built-in sets recognized for early-exit classification. Matching is
// case-insensitive.
const STANDARD_SETS: &[(&str, &[&str])] = &[
    ("weekdays", &["mon", "tue", "wed", "thu", "fri", "sat", "sun",
        "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday"]),
    ("months", &["jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
        "january", "february", "march", "april", "june", "july", "august",
        "september", "october", "november", "december"]),
    ("http_methods", &["get", "post", "put", "delete", "patch", "head", "options", "trace", "connect"]),
    ("http_statuses", &["200", "201", "202", "204", "301", "302", "304", "400", "401", "403",
        "404", "405", "409", "410", "418", "429", "500", "501", "502", "503", "504"]),
    ("currencies", &["usd", "eur", "gbp", "jpy", "cny", "chf", "cad", "aud", "nzd", "sek",
        "nok", "inr", "brl", "mxn", "krw", "sgd", "hkd", "pln", "rub", "zar"]),
    ("us_states", &["al", "ak", "az", "ar", "ca", "co", "ct", "de", "fl", "ga", "hi", "id",
        "il", "in", "ia", "ks", "ky", "la", "me", "md", "ma", "mi", "mn", "ms", "mo", "mt",
        "ne", "nv", "nh", "nj", "nm", "ny", "nc", "nd", "oh", "ok", "or", "pa", "ri", "sc",
        "sd", "tn", "tx", "ut", "vt", "va", "wa", "wv", "wi", "wy"]),
    ("countries", &["usa", "canada", "mexico", "brazil", "argentina", "uk", "france", "germany",
        "spain", "italy", "netherlands", "sweden", "norway", "poland", "russia", "china",
        "japan", "korea", "india", "australia", "egypt", "nigeria", "kenya", "south africa"]),
    ("priorities", &["low", "medium", "high", "critical", "urgent", "normal", "minor", "major", "blocker"]),
    ("sizes", &["xs", "s", "m", "l", "xl", "xxl", "xxxl", "small", "medium", "large", "extra large"]),
    ("directions", &["north", "south", "east", "west", "northeast", "northwest", "southeast",
        "southwest", "up", "down", "left", "right"]),
    ("booleans", &["true", "false", "yes", "no", "on", "off", "y", "n", "0", "1"]),
];

lazy_static! {
    static ref CODE_PATTERNS: Vec<Regex> = [
        r"^[A-Z_]+$",
        r"^[A-Z][A-Z0-9_]*$",
        r"^\w+_\w+$",
        r"^[A-Z][a-z]+(?:[A-Z][a-z]+)*$",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("is a valid regex"))
    .collect();
}

struct Metrics {
    total: usize,
    unique: usize,
    unique_ratio: f64,
    entropy: f64,
    power_law_exponent: f64,
    concentration: f64,
    is_standard_set: bool,
    semantic_coherence: f64,
    is_code_pattern: bool,
    is_natural_language: bool,
    has_structured_format: bool,
}

/// Decide whether `values` of field `field` constitute an enum.
/// `rng` drives reservoir sampling of oversized populations.
pub fn detect_enum(
    values: &[&str],
    field: &str,
    rng: &mut impl Rng,
    config: &EnumConfig,
) -> EnumDecision {
    if values.is_empty() {
        return EnumDecision::not_enum(Confidence::VeryLow, "no values observed");
    }

    let total_population = values.len();
    let sampled: Vec<&str> = if values.len() > config.max_sample {
        reservoir_sample(values, config.max_sample, rng)
    } else {
        values.to_vec()
    };

    let metrics = compute_metrics(&sampled);
    let mut decision = classify(&metrics, total_population, field);

    if decision.should_create_enum {
        let mut seen = BTreeMap::new();
        for v in &sampled {
            *seen.entry(*v).or_insert(0u64) += 1;
        }
        let mut ordered: Vec<(&str, u64)> = seen.into_iter().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        decision.enum_values = ordered
            .into_iter()
            .take(config.max_enum_values)
            .map(|(v, _)| serde_json::Value::String(v.to_owned()))
            .collect();
    }
    decision
}

fn reservoir_sample<'v>(values: &[&'v str], size: usize, rng: &mut impl Rng) -> Vec<&'v str> {
    let mut reservoir: Vec<&str> = values[..size].to_vec();
    for (seen, v) in values[size..].iter().enumerate() {
        let slot = rng.gen_range(0..size + seen + 1);
        if slot < size {
            reservoir[slot] = v;
        }
    }
    reservoir
}

fn compute_metrics(values: &[&str]) -> Metrics {
    let total = values.len();
    let mut frequency: BTreeMap<&str, u64> = BTreeMap::new();
    for v in values {
        *frequency.entry(v).or_default() += 1;
    }
    let unique = frequency.len();
    let unique_ratio = unique as f64 / total as f64;
    let entropy = shannon(frequency.values().copied().collect::<Vec<_>>());

    let mut counts: Vec<u64> = frequency.values().copied().collect();
    counts.sort_unstable_by(|a, b| b.cmp(a));

    // Power law: |slope| of the log-rank vs log-frequency regression over
    // the top 100 frequencies.
    let power_law_exponent = {
        let points: Vec<(f64, f64)> = counts
            .iter()
            .take(100)
            .enumerate()
            .map(|(rank, count)| (((rank + 1) as f64).ln(), (*count as f64).ln()))
            .collect();
        linear_slope(&points).abs()
    };

    // Fraction of distinct values needed to cover 80% of observations.
    let concentration = {
        let needed = (total as f64 * 0.8).ceil() as u64;
        let mut covered = 0u64;
        let mut used = 0usize;
        for count in &counts {
            if covered >= needed {
                break;
            }
            covered += count;
            used += 1;
        }
        used as f64 / unique as f64
    };

    // Standard-set overlap: the best fraction of distinct values found in
    // any one built-in set.
    let distinct_lower: Vec<String> = frequency.keys().map(|v| v.to_lowercase()).collect();
    let semantic_coherence = STANDARD_SETS
        .iter()
        .map(|(_, set)| {
            let hits = distinct_lower
                .iter()
                .filter(|v| set.contains(&v.as_str()))
                .count();
            hits as f64 / distinct_lower.len() as f64
        })
        .fold(0.0f64, f64::max);
    let is_standard_set = semantic_coherence >= 0.5;

    let code_matches = frequency
        .keys()
        .filter(|v| CODE_PATTERNS.iter().any(|re| re.is_match(v)))
        .count();
    let is_code_pattern = code_matches as f64 / unique as f64 >= 0.7;

    let natural = frequency
        .keys()
        .filter(|v| {
            v.contains(' ') && v.chars().all(|c| c.is_alphabetic() || c.is_whitespace())
        })
        .count();
    let is_natural_language = natural as f64 / unique as f64 >= 0.5;

    // Structure signatures: letters fold to A/a, digits to 0.
    let signatures: std::collections::BTreeSet<String> = frequency
        .keys()
        .map(|v| {
            v.chars()
                .map(|c| {
                    if c.is_ascii_uppercase() {
                        'A'
                    } else if c.is_ascii_lowercase() {
                        'a'
                    } else if c.is_ascii_digit() {
                        '0'
                    } else {
                        c
                    }
                })
                .collect()
        })
        .collect();
    let has_structured_format =
        signatures.len() <= 3 || (signatures.len() as f64 / unique as f64) < 0.2;

    Metrics {
        total,
        unique,
        unique_ratio,
        entropy,
        power_law_exponent,
        concentration,
        is_standard_set,
        semantic_coherence,
        is_code_pattern,
        is_natural_language,
        has_structured_format,
    }
}

fn linear_slope(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}

fn classify(m: &Metrics, population: usize, field: &str) -> EnumDecision {
    let mk = |confidence, category, reasoning: String| EnumDecision {
        should_create_enum: !matches!(category, Category::NotEnum),
        enum_values: Vec::new(),
        confidence,
        reasoning,
        category,
    };

    if population <= 1_000 {
        if m.unique_ratio > 0.8 {
            return EnumDecision::not_enum(
                Confidence::VeryLow,
                format!("field {field}: {:.0}% of values are distinct", m.unique_ratio * 100.0),
            );
        }
        if m.is_standard_set {
            return mk(
                Confidence::High,
                Category::StandardSet,
                format!("field {field} matches a well-known value set"),
            );
        }
        if m.is_code_pattern && m.unique <= 50 {
            return mk(
                Confidence::High,
                Category::ApplicationEnum,
                format!("field {field}: {} code-like values", m.unique),
            );
        }
        if m.unique <= 20 && m.concentration < 0.3 {
            return mk(
                Confidence::Medium,
                Category::ApplicationEnum,
                format!("field {field}: few values with concentrated frequency"),
            );
        }
        if m.is_natural_language {
            return EnumDecision::not_enum(
                Confidence::Low,
                format!("field {field} looks like natural language"),
            );
        }
        if m.unique <= 30 && m.entropy < 3.0 {
            return mk(
                Confidence::Low,
                Category::ApplicationEnum,
                format!("field {field}: low-entropy small value set"),
            );
        }
        return EnumDecision::not_enum(Confidence::VeryLow, format!("field {field}: no enum signal"));
    }

    if population <= 100_000 {
        if m.unique_ratio > 0.5 || m.unique > 1_000 {
            return EnumDecision::not_enum(
                Confidence::VeryLow,
                format!("field {field}: too many distinct values ({})", m.unique),
            );
        }
        if m.is_standard_set {
            return mk(
                Confidence::High,
                Category::StandardSet,
                format!("field {field} matches a well-known value set"),
            );
        }
        if m.power_law_exponent > 1.5 && m.unique <= 100 {
            return mk(
                Confidence::Medium,
                Category::ApplicationEnum,
                format!("field {field}: power-law frequency distribution"),
            );
        }
        if m.is_code_pattern && m.unique <= 200 {
            return mk(
                Confidence::Medium,
                Category::ApplicationEnum,
                format!("field {field}: code-like values"),
            );
        }
        if m.entropy < 4.0 && m.unique <= 50 {
            return mk(
                Confidence::Medium,
                Category::ApplicationEnum,
                format!("field {field}: low entropy across a small set"),
            );
        }
        return EnumDecision::not_enum(Confidence::Low, format!("field {field}: no enum signal"));
    }

    // Very large populations demand stronger evidence.
    if m.unique > 500 {
        return EnumDecision::not_enum(
            Confidence::VeryLow,
            format!("field {field}: {} distinct values in a large population", m.unique),
        );
    }
    if m.is_standard_set && m.semantic_coherence > 0.3 {
        return mk(
            Confidence::High,
            Category::StandardSet,
            format!("field {field} matches a well-known value set"),
        );
    }
    if m.power_law_exponent > 2.0 && m.unique <= 50 {
        return mk(
            Confidence::Medium,
            Category::ApplicationEnum,
            format!("field {field}: strong power-law frequency distribution"),
        );
    }
    if m.has_structured_format && m.unique <= 20 {
        return mk(
            Confidence::Low,
            Category::NaturalConstraint,
            format!("field {field}: structurally uniform values"),
        );
    }
    EnumDecision::not_enum(Confidence::VeryLow, format!("field {field}: no enum signal"))
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    #[test]
    fn weekdays_are_a_standard_set() {
        let days = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
        let values: Vec<&str> = days.iter().cycle().take(70).copied().collect();

        let decision = detect_enum(&values, "day", &mut rng(), &EnumConfig::default());
        assert!(decision.should_create_enum);
        assert_eq!(decision.confidence, Confidence::High);
        assert_eq!(decision.category, Category::StandardSet);
        assert_eq!(decision.enum_values.len(), 7);
        for day in days {
            assert!(decision
                .enum_values
                .iter()
                .any(|v| v.as_str() == Some(day)));
        }
    }

    #[test]
    fn unique_ids_are_not_an_enum() {
        let owned: Vec<String> = (0..100).map(|i| format!("id-{i}")).collect();
        let values: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();

        let decision = detect_enum(&values, "user_id", &mut rng(), &EnumConfig::default());
        assert!(!decision.should_create_enum);
        assert_eq!(decision.category, Category::NotEnum);
        assert_eq!(decision.confidence, Confidence::VeryLow);
    }

    #[test]
    fn code_constants_are_an_application_enum() {
        let states = ["ACTIVE_STATE", "IDLE_STATE", "ERROR_STATE", "RETRY_STATE"];
        let values: Vec<&str> = states.iter().cycle().take(200).copied().collect();

        let decision = detect_enum(&values, "state", &mut rng(), &EnumConfig::default());
        assert!(decision.should_create_enum);
        assert_eq!(decision.category, Category::ApplicationEnum);
        assert_eq!(decision.confidence, Confidence::High);
    }

    #[test]
    fn natural_language_is_refused() {
        let phrases = [
            "the quick brown fox",
            "lorem ipsum dolor",
            "a fine day indeed",
            "many words here",
        ];
        let values: Vec<&str> = phrases.iter().cycle().take(40).copied().collect();

        let decision = detect_enum(&values, "note", &mut rng(), &EnumConfig::default());
        assert!(!decision.should_create_enum);
    }

    #[test]
    fn detection_is_stable_for_a_fixed_input() {
        let days = ["Mon", "Tue", "Wed"];
        let values: Vec<&str> = days.iter().cycle().take(30).copied().collect();

        let a = detect_enum(&values, "day", &mut rng(), &EnumConfig::default());
        let b = detect_enum(&values, "day", &mut rng(), &EnumConfig::default());
        assert_eq!(a.should_create_enum, b.should_create_enum);
        assert_eq!(a.enum_values, b.enum_values);
        assert_eq!(a.confidence, b.confidence);
    }
}
