// Entropy and complexity scoring shared by histograms and string models.
// All persisted scores are rounded: entropy and complexity to 4 decimal
// places, cumulative frequency windows to 2.

pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Shannon entropy in bits over a set of occurrence counts.
/// Zero counts contribute nothing.
pub fn shannon<I>(counts: I) -> f64
where
    I: IntoIterator<Item = u64> + Clone,
{
    let total: u64 = counts.clone().into_iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;

    -counts
        .into_iter()
        .filter(|c| *c > 0)
        .map(|c| {
            let p = c as f64 / total;
            p * p.log2()
        })
        .sum::<f64>()
}

pub fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Histogram complexity: a weighted blend of entropy, bin density, spread,
/// and count uniformity. Missing factors contribute 0; the result is
/// clamped into [0, 1].
pub fn histogram_complexity(
    counts: &[u64],
    total: u64,
    std_deviation: f64,
    min_value: f64,
    max_value: f64,
) -> f64 {
    if total == 0 || counts.is_empty() {
        return 0.0;
    }
    let bins = counts.len() as f64;
    let total_f = total as f64;

    let entropy = shannon(counts.iter().copied());

    let density = (bins / total_f.min(100.0)).min(1.0);

    let spread = if max_value > min_value {
        (std_deviation / (max_value - min_value)).min(1.0)
    } else {
        0.0
    };

    // Uniformity measures how close bin counts sit to the flat expectation.
    let expected = total_f / bins;
    let variance = counts
        .iter()
        .map(|c| {
            let deviation = *c as f64 / expected - 1.0;
            deviation * deviation
        })
        .sum::<f64>()
        / bins;
    let uniformity = (1.0 - variance.min(1.0)).max(0.0);

    clamp01(0.4 * entropy + 0.2 * density + 0.2 * spread + 0.2 * uniformity)
}

/// String-model complexity: entropy normalized against its ceiling, plus
/// length variability, character diversity, pattern diversity, and value
/// uniqueness. Each factor is clamped into [0, 1] before weighting.
pub struct StringComplexity {
    pub normalized_entropy: f64,
    pub length_variability: f64,
    pub char_diversity: f64,
    pub pattern_diversity: f64,
    pub uniqueness_ratio: f64,
}

impl StringComplexity {
    pub fn score(&self) -> f64 {
        clamp01(
            0.3 * clamp01(self.normalized_entropy)
                + 0.2 * clamp01(self.length_variability)
                + 0.2 * clamp01(self.char_diversity)
                + 0.15 * clamp01(self.pattern_diversity)
                + 0.15 * clamp01(self.uniqueness_ratio),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shannon_of_uniform_counts() {
        // Ten equally likely outcomes: log2(10) bits.
        let h = shannon(std::iter::repeat(1u64).take(10).collect::<Vec<_>>());
        assert!((h - 3.321928).abs() < 1e-5);

        assert_eq!(shannon(vec![10u64]), 0.0);
        assert_eq!(shannon(Vec::<u64>::new()), 0.0);
    }

    #[test]
    fn rounding() {
        assert_eq!(round4(3.32192809), 3.3219);
        assert_eq!(round2(99.995), 100.0);
    }

    #[test]
    fn complexity_is_clamped() {
        let c = histogram_complexity(&[1; 10], 10, 2.87, 1.0, 10.0);
        assert!((0.0..=1.0).contains(&c));

        // Perfectly uniform counts maximize the uniformity factor.
        let flat = histogram_complexity(&[5; 4], 20, 1.0, 0.0, 4.0);
        assert!(flat > 0.0);
    }
}
