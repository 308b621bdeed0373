use super::entropy::{round4, shannon, StringComplexity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Caps applied when building and merging models.
const MAX_PATTERNS: usize = 10;
const MAX_NGRAMS: usize = 20;
const MAX_AFFIXES: usize = 10;
const MAX_SAMPLES: usize = 20;

/// StringModel aggregates per-character, per-n-gram, and per-value
/// statistics of an observed string field, used to synthesize new values.
/// Character-keyed maps use single-character string keys so the JSON form
/// is a plain object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StringModel {
    pub min_length: usize,
    pub max_length: usize,
    pub average_length: f64,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unique_characters: Vec<char>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub character_frequency: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub character_probability: BTreeMap<String, f64>,

    /// Pattern-class string (e.g. `UL{3}d{2}`) to occurrence count.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub patterns: BTreeMap<String, u64>,
    /// 2- and 3-grams which occurred more than once.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub n_grams: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub common_prefixes: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub common_suffixes: BTreeMap<String, u64>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub value_frequency: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sample_values: Vec<String>,
    /// Whether every observed value was distinct.
    pub unique_values: bool,
    pub total_samples: u64,
    pub unique_value_count: u64,

    pub entropy_score: f64,
    pub max_entropy: f64,
    pub complexity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entropy_override: Option<f64>,
}

/// Encode a string's character categories: digit `d`, upper `U`, lower `L`,
/// whitespace `s`, other `p`, with runs of four or more compressed `c{n}`.
pub fn pattern_class(s: &str) -> String {
    let classes: Vec<char> = s.chars().map(classify).collect();

    let mut out = String::new();
    let mut idx = 0;
    while idx < classes.len() {
        let class = classes[idx];
        let mut run = 1;
        while idx + run < classes.len() && classes[idx + run] == class {
            run += 1;
        }
        if run >= 4 {
            out.push(class);
            out.push_str(&format!("{{{run}}}"));
        } else {
            for _ in 0..run {
                out.push(class);
            }
        }
        idx += run;
    }
    out
}

pub(crate) fn classify(c: char) -> char {
    if c.is_ascii_digit() {
        'd'
    } else if c.is_uppercase() {
        'U'
    } else if c.is_lowercase() {
        'L'
    } else if c.is_whitespace() {
        's'
    } else {
        'p'
    }
}

// Keep the `limit` highest-count entries, breaking ties by key.
fn retain_top(map: &mut BTreeMap<String, u64>, limit: usize) {
    if map.len() <= limit {
        return;
    }
    let mut entries: Vec<(String, u64)> = std::mem::take(map).into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(limit);
    *map = entries.into_iter().collect();
}

impl StringModel {
    /// Build a model from observed values. Value frequencies count every
    /// observation; character, pattern, n-gram, and affix statistics are
    /// drawn from the top-frequency sample set (cap 20).
    pub fn build(values: &[&str]) -> Self {
        let mut value_frequency: BTreeMap<String, u64> = BTreeMap::new();
        for v in values {
            *value_frequency.entry((*v).to_owned()).or_default() += 1;
        }

        let mut samples: Vec<(String, u64)> = value_frequency
            .iter()
            .map(|(v, c)| (v.clone(), *c))
            .collect();
        samples.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        samples.truncate(MAX_SAMPLES);
        let sample_values: Vec<String> = samples.into_iter().map(|(v, _)| v).collect();

        let mut model = Self {
            min_length: values.iter().map(|v| v.chars().count()).min().unwrap_or(0),
            max_length: values.iter().map(|v| v.chars().count()).max().unwrap_or(0),
            average_length: if values.is_empty() {
                0.0
            } else {
                round4(
                    values.iter().map(|v| v.chars().count()).sum::<usize>() as f64
                        / values.len() as f64,
                )
            },
            total_samples: values.len() as u64,
            unique_value_count: value_frequency.len() as u64,
            unique_values: value_frequency.len() == values.len(),
            value_frequency,
            sample_values,
            ..Self::default()
        };

        for value in &model.sample_values.clone() {
            for c in value.chars() {
                *model
                    .character_frequency
                    .entry(c.to_string())
                    .or_default() += 1;
            }
            *model
                .patterns
                .entry(pattern_class(value))
                .or_default() += 1;

            let chars: Vec<char> = value.chars().collect();
            for n in [2usize, 3] {
                for gram in chars.windows(n) {
                    *model
                        .n_grams
                        .entry(gram.iter().collect())
                        .or_default() += 1;
                }
            }
            for len in 1..=3usize {
                if chars.len() > len {
                    let prefix: String = chars[..len].iter().collect();
                    let suffix: String = chars[chars.len() - len..].iter().collect();
                    *model.common_prefixes.entry(prefix).or_default() += 1;
                    *model.common_suffixes.entry(suffix).or_default() += 1;
                }
            }
        }

        // N-grams and affixes only earn a slot by repeating.
        model.n_grams.retain(|_, count| *count > 1);
        model.common_prefixes.retain(|_, count| *count > 1);
        model.common_suffixes.retain(|_, count| *count > 1);

        retain_top(&mut model.patterns, MAX_PATTERNS);
        retain_top(&mut model.n_grams, MAX_NGRAMS);
        retain_top(&mut model.common_prefixes, MAX_AFFIXES);
        retain_top(&mut model.common_suffixes, MAX_AFFIXES);

        model.unique_characters = model
            .character_frequency
            .keys()
            .filter_map(|k| k.chars().next())
            .collect();
        model.recompute_scores();
        model
    }

    /// Recompute probabilities, entropy, and complexity from frequencies.
    pub fn recompute_scores(&mut self) {
        let char_total: u64 = self.character_frequency.values().sum();
        self.character_probability = self
            .character_frequency
            .iter()
            .map(|(c, count)| (c.clone(), round4(*count as f64 / char_total.max(1) as f64)))
            .collect();

        self.entropy_score = round4(shannon(
            self.value_frequency.values().copied().collect::<Vec<_>>(),
        ));

        // The entropy ceiling considers per-character entropy of sampled
        // values and the character-set capacity.
        let per_value_entropy = self
            .sample_values
            .iter()
            .map(|v| {
                let mut counts: BTreeMap<char, u64> = BTreeMap::new();
                for c in v.chars() {
                    *counts.entry(c).or_default() += 1;
                }
                shannon(counts.values().copied().collect::<Vec<_>>())
            })
            .fold(0.0f64, f64::max);
        let charset_entropy = (self.unique_characters.len() as f64).log2().max(0.0);
        self.max_entropy = round4(
            self.entropy_score
                .max(per_value_entropy)
                .max(charset_entropy),
        );

        let complexity = StringComplexity {
            normalized_entropy: if self.max_entropy > 0.0 {
                self.entropy_score / self.max_entropy
            } else {
                0.0
            },
            length_variability: if self.max_length > 0 {
                (self.max_length - self.min_length) as f64 / self.max_length as f64
            } else {
                0.0
            },
            char_diversity: self.unique_characters.len() as f64 / 95.0,
            pattern_diversity: if self.total_samples > 0 {
                self.patterns.len() as f64 / self.total_samples.min(20) as f64
            } else {
                0.0
            },
            uniqueness_ratio: if self.total_samples > 0 {
                self.unique_value_count as f64 / self.total_samples as f64
            } else {
                0.0
            },
        };
        self.complexity = round4(complexity.score());
    }

    /// Merge `rhs` into a model of the union population: frequency maps
    /// sum, character sets union, entropy averages, complexity maximizes.
    pub fn merge(lhs: &Self, rhs: &Self) -> Self {
        let mut out = Self {
            min_length: lhs.min_length.min(rhs.min_length),
            max_length: lhs.max_length.max(rhs.max_length),
            total_samples: lhs.total_samples + rhs.total_samples,
            entropy_override: lhs.entropy_override.or(rhs.entropy_override),
            ..Self::default()
        };

        for (map, l, r) in [
            (&mut out.character_frequency, &lhs.character_frequency, &rhs.character_frequency),
            (&mut out.value_frequency, &lhs.value_frequency, &rhs.value_frequency),
            (&mut out.n_grams, &lhs.n_grams, &rhs.n_grams),
            (&mut out.patterns, &lhs.patterns, &rhs.patterns),
            (&mut out.common_prefixes, &lhs.common_prefixes, &rhs.common_prefixes),
            (&mut out.common_suffixes, &lhs.common_suffixes, &rhs.common_suffixes),
        ] {
            for (k, v) in l.iter().chain(r.iter()) {
                *map.entry(k.clone()).or_default() += v;
            }
        }
        retain_top(&mut out.patterns, MAX_PATTERNS);
        retain_top(&mut out.n_grams, MAX_NGRAMS);
        retain_top(&mut out.common_prefixes, MAX_AFFIXES);
        retain_top(&mut out.common_suffixes, MAX_AFFIXES);

        out.unique_characters = lhs
            .unique_characters
            .iter()
            .chain(rhs.unique_characters.iter())
            .copied()
            .collect::<std::collections::BTreeSet<char>>()
            .into_iter()
            .collect();

        // Union of samples, keeping both sides' highest-frequency values.
        let mut samples: Vec<String> = lhs.sample_values.clone();
        for v in &rhs.sample_values {
            if !samples.contains(v) {
                samples.push(v.clone());
            }
        }
        samples.truncate(MAX_SAMPLES);
        out.sample_values = samples;

        out.unique_value_count = out.value_frequency.len() as u64;
        out.unique_values = out.unique_value_count == out.total_samples;
        out.average_length = round4(
            (lhs.average_length * lhs.total_samples as f64
                + rhs.average_length * rhs.total_samples as f64)
                / (out.total_samples.max(1)) as f64,
        );

        out.recompute_scores();
        // Post-merge policy: entropy averages across the two populations,
        // complexity keeps the richer side.
        out.entropy_score = round4((lhs.entropy_score + rhs.entropy_score) / 2.0);
        out.max_entropy = out.max_entropy.max(out.entropy_score);
        out.complexity = round4(lhs.complexity.max(rhs.complexity));
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pattern_classes() {
        assert_eq!(pattern_class("Abc12"), "ULLdd");
        assert_eq!(pattern_class("HELLO"), "U{5}");
        assert_eq!(pattern_class("a b-c"), "LsLpL");
        assert_eq!(pattern_class("20240101"), "d{8}");
        assert_eq!(pattern_class(""), "");
    }

    #[test]
    fn builds_frequencies_and_samples() {
        let values = ["tech", "tech", "health", "energy"];
        let m = StringModel::build(&values);

        assert_eq!(m.total_samples, 4);
        assert_eq!(m.unique_value_count, 3);
        assert!(!m.unique_values);
        assert_eq!(m.value_frequency["tech"], 2);
        assert_eq!(m.min_length, 4);
        assert_eq!(m.max_length, 6);
        // Highest-frequency value leads the samples.
        assert_eq!(m.sample_values[0], "tech");
        assert!(m.unique_characters.contains(&'t'));
        assert!(m.entropy_score <= m.max_entropy);
    }

    #[test]
    fn merge_sums_and_unions() {
        let a = StringModel::build(&["aa", "ab", "aa"]);
        let b = StringModel::build(&["zz", "aa"]);
        let merged = StringModel::merge(&a, &b);

        assert_eq!(merged.total_samples, 5);
        assert_eq!(merged.value_frequency["aa"], 3);
        assert_eq!(merged.value_frequency["zz"], 1);
        assert!(merged.unique_characters.contains(&'z'));
        assert_eq!(
            merged.entropy_score,
            round4((a.entropy_score + b.entropy_score) / 2.0)
        );
        assert!(merged.complexity >= a.complexity.max(b.complexity) - 1e-9);
    }

    #[test]
    fn merge_identity_preserves_value_set() {
        let a = StringModel::build(&["x", "y", "x"]);
        let merged = StringModel::merge(&a, &a);
        assert_eq!(
            merged.value_frequency.keys().collect::<Vec<_>>(),
            a.value_frequency.keys().collect::<Vec<_>>()
        );
        assert_eq!(merged.sample_values, a.sample_values);
    }
}
