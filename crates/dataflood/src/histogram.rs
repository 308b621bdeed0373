use super::entropy::{histogram_complexity, round2, round4, shannon};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Histogram summarizes a numeric field as frequency-weighted ranges.
/// Bins are sorted by `range_start` and non-overlapping; every bin but the
/// last is half-open `[start, end)`, and the last is closed on both ends.
/// `freq_start`/`freq_end` carry each bin's cumulative frequency window as
/// percentages, so a uniform draw in [0, 100) lands in exactly one bin.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Histogram {
    pub bins: Vec<Bin>,
    pub total_count: u64,
    pub min_value: f64,
    pub max_value: f64,
    pub standard_deviation: f64,
    pub entropy_score: f64,
    pub max_entropy: f64,
    pub complexity: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bin {
    pub range_start: f64,
    pub range_end: f64,
    pub count: u64,
    pub freq_start: f64,
    pub freq_end: f64,
}

impl Histogram {
    /// Build an equal-width histogram over `values`. Bins which capture no
    /// value are omitted.
    pub fn build(values: &[f64], bin_count: usize) -> Option<Self> {
        if values.is_empty() || bin_count == 0 {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut counts = vec![0u64; bin_count];
        if max > min {
            let width = (max - min) / bin_count as f64;
            for v in values {
                let idx = (((v - min) / width) as usize).min(bin_count - 1);
                counts[idx] += 1;
            }
        } else {
            // A constant field collapses to a single bin.
            counts = vec![values.len() as u64];
        }

        let width = if max > min {
            (max - min) / counts.len() as f64
        } else {
            0.0
        };
        let total = values.len() as u64;

        let mut bins = Vec::new();
        let mut cumulative = 0u64;
        for (idx, count) in counts.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let freq_start = cumulative as f64 / total as f64 * 100.0;
            cumulative += count;
            let freq_end = cumulative as f64 / total as f64 * 100.0;

            bins.push(Bin {
                range_start: round4(min + width * idx as f64),
                range_end: round4(if idx + 1 == counts.len() {
                    max
                } else {
                    min + width * (idx + 1) as f64
                }),
                count: *count,
                freq_start: round2(freq_start),
                freq_end: round2(freq_end),
            });
        }

        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;

        let mut histogram = Self {
            bins,
            total_count: total,
            min_value: round4(min),
            max_value: round4(max),
            standard_deviation: round4(variance.sqrt()),
            entropy_score: 0.0,
            max_entropy: 0.0,
            complexity: 0.0,
        };
        histogram.recompute_scores();
        Some(histogram)
    }

    /// Recompute entropy, max entropy, and complexity from current bins.
    pub fn recompute_scores(&mut self) {
        let counts: Vec<u64> = self.bins.iter().map(|b| b.count).collect();
        self.entropy_score = round4(shannon(counts.iter().copied()));
        self.max_entropy = round4((counts.len() as f64).log2().max(0.0));
        self.complexity = round4(histogram_complexity(
            &counts,
            self.total_count,
            self.standard_deviation,
            self.min_value,
            self.max_value,
        ));
    }

    /// Rebuild the cumulative frequency windows from bin counts.
    pub fn recompute_frequencies(&mut self) {
        let total: u64 = self.bins.iter().map(|b| b.count).sum();
        self.total_count = total;
        if total == 0 {
            return;
        }
        let mut cumulative = 0u64;
        for bin in self.bins.iter_mut() {
            bin.freq_start = round2(cumulative as f64 / total as f64 * 100.0);
            cumulative += bin.count;
            bin.freq_end = round2(cumulative as f64 / total as f64 * 100.0);
        }
    }

    /// Sample a value: a uniform percentage selects the bin, then the value
    /// is uniform within the bin's range.
    pub fn sample(&self, rng: &mut impl Rng) -> f64 {
        if self.bins.is_empty() {
            return self.min_value;
        }
        let u: f64 = rng.gen_range(0.0..100.0);
        let bin = self
            .bins
            .iter()
            .find(|b| b.freq_start <= u && u < b.freq_end)
            .unwrap_or_else(|| self.bins.last().unwrap());

        if bin.range_end > bin.range_start {
            rng.gen_range(bin.range_start..bin.range_end)
        } else {
            bin.range_start
        }
    }

    /// Merge `other` into a union of both sample populations: bins are
    /// concatenated, sorted, coalesced where they overlap, and capped.
    pub fn merge(lhs: &Self, rhs: &Self, max_bins: usize) -> Self {
        let mut bins: Vec<Bin> = lhs.bins.iter().chain(rhs.bins.iter()).cloned().collect();
        bins.sort_by(|a, b| {
            a.range_start
                .partial_cmp(&b.range_start)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut merged: Vec<Bin> = Vec::with_capacity(bins.len());
        for bin in bins {
            match merged.last_mut() {
                Some(last) if bin.range_start < last.range_end => {
                    last.range_end = last.range_end.max(bin.range_end);
                    last.count += bin.count;
                }
                _ => merged.push(bin),
            }
        }

        // Coalesce the narrowest adjacent pair until under the cap.
        while merged.len() > max_bins {
            let mut narrowest = 0;
            let mut narrowest_width = f64::INFINITY;
            for idx in 0..merged.len() - 1 {
                let width = merged[idx + 1].range_end - merged[idx].range_start;
                if width < narrowest_width {
                    narrowest_width = width;
                    narrowest = idx;
                }
            }
            let absorbed = merged.remove(narrowest + 1);
            merged[narrowest].range_end = merged[narrowest].range_end.max(absorbed.range_end);
            merged[narrowest].count += absorbed.count;
        }

        let mut out = Self {
            bins: merged,
            total_count: 0,
            min_value: round4(lhs.min_value.min(rhs.min_value)),
            max_value: round4(lhs.max_value.max(rhs.max_value)),
            // Approximate the union deviation as the larger of the two.
            standard_deviation: lhs.standard_deviation.max(rhs.standard_deviation),
            entropy_score: 0.0,
            max_entropy: 0.0,
            complexity: 0.0,
        };
        out.recompute_frequencies();
        out.recompute_scores();
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn ten_uniform_values() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let h = Histogram::build(&values, 10).unwrap();

        assert_eq!(h.bins.len(), 10);
        assert_eq!(h.total_count, 10);
        assert_eq!(h.min_value, 1.0);
        assert_eq!(h.max_value, 10.0);
        assert!(h.bins.iter().all(|b| b.count == 1));
        assert_eq!(h.bins[0].freq_start, 0.0);
        assert_eq!(h.bins[9].freq_end, 100.0);
        assert_eq!(h.entropy_score, 3.3219);
        assert_eq!(h.max_entropy, 3.3219);
        // Bin width is (10 - 1) / 10.
        assert_eq!(h.bins[0].range_end, 1.9);
        assert_eq!(h.bins[9].range_end, 10.0);
    }

    #[test]
    fn counts_sum_to_total() {
        let values = vec![1.0, 1.0, 2.0, 5.0, 5.0, 5.0, 9.0, 9.5, 10.0, 3.0, 4.0];
        let h = Histogram::build(&values, 10).unwrap();
        assert_eq!(
            h.bins.iter().map(|b| b.count).sum::<u64>(),
            h.total_count
        );
        assert!(h.entropy_score <= h.max_entropy);
        assert!((h.bins.last().unwrap().freq_end - 100.0).abs() < 0.01);
    }

    #[test]
    fn constant_field_is_one_bin() {
        let h = Histogram::build(&[7.0; 12], 10).unwrap();
        assert_eq!(h.bins.len(), 1);
        assert_eq!(h.bins[0].count, 12);
        assert_eq!(h.entropy_score, 0.0);
        assert_eq!(h.standard_deviation, 0.0);
    }

    #[test]
    fn samples_stay_in_range() {
        let values: Vec<f64> = (1..=10).map(|v| v as f64).collect();
        let h = Histogram::build(&values, 10).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let v = h.sample(&mut rng);
            assert!((1.0..=10.0).contains(&v), "sample {v} out of range");
        }
    }

    #[test]
    fn merge_caps_bins_and_recomputes() {
        let a = Histogram::build(&(0..20).map(|v| v as f64).collect::<Vec<_>>(), 10).unwrap();
        let b = Histogram::build(&(100..120).map(|v| v as f64).collect::<Vec<_>>(), 10).unwrap();
        let merged = Histogram::merge(&a, &b, 20);

        assert!(merged.bins.len() <= 20);
        assert_eq!(merged.total_count, 40);
        assert_eq!(merged.min_value, 0.0);
        assert_eq!(merged.max_value, 119.0);
        assert!((merged.bins.last().unwrap().freq_end - 100.0).abs() < 0.01);
        // Bins remain sorted and non-overlapping.
        for window in merged.bins.windows(2) {
            assert!(window[0].range_end <= window[1].range_start + 1e-9);
        }
    }
}
