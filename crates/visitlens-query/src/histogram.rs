//! Histogram engine
//!
//! Bins coerced numeric values into the fixed-width ranges of a
//! [`HistogramComputation`]. Bin membership is decided against the shared bin
//! edges, the same edges the pushdown renderer turns into range predicates, so
//! both backends count a value on an edge into the same bin.

use crate::model::HistogramComputation;
use visitlens_core::{round2, FieldValue};

/// Sparkline glyph ramp; index 0 marks an empty bin
pub const SPARK_GLYPHS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Outcome of binning one group's values
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramResult {
    pub bin_counts: Vec<u64>,
    pub sparkline: String,
    /// Mean of every coerced value, rounded to 2 decimals
    pub mean: Option<f64>,
    /// Number of values that coerced to a number
    pub count: u64,
}

impl HistogramResult {
    /// Output columns in config order: bins, sparkline, mean, count
    pub fn into_fields(self, histogram: &HistogramComputation) -> Vec<(String, Option<FieldValue>)> {
        let mut fields: Vec<(String, Option<FieldValue>)> = histogram
            .bin_names()
            .into_iter()
            .zip(self.bin_counts)
            .map(|(name, count)| (name, Some(FieldValue::Integer(count as i64))))
            .collect();
        fields.push((histogram.sparkline_name(), Some(FieldValue::String(self.sparkline))));
        fields.push((histogram.mean_name(), self.mean.map(FieldValue::Float)));
        fields.push((histogram.count_name(), Some(FieldValue::Integer(self.count as i64))));
        fields
    }
}

/// Bin a numeric value. `None` means the value falls outside the bounds and
/// out-of-range inclusion is off.
pub fn bin_index(value: f64, histogram: &HistogramComputation) -> Option<usize> {
    let n = histogram.num_bins as usize;
    if n == 0 || !value.is_finite() {
        return None;
    }
    if value < histogram.lower_bound {
        return histogram.include_out_of_range.then_some(0);
    }
    if value >= histogram.upper_bound {
        return histogram.include_out_of_range.then_some(n - 1);
    }

    let edges = histogram.edges();
    let raw = ((value - histogram.lower_bound) / histogram.bin_width()).floor();
    let mut index = (raw.max(0.0) as usize).min(n - 1);

    // Floating point division can land one bin off an edge
    while index > 0 && value < edges[index] {
        index -= 1;
    }
    while index + 1 < n && value >= edges[index + 1] {
        index += 1;
    }
    Some(index)
}

/// Bin present values; values that do not coerce to a number are ignored
pub fn bin(values: &[Option<FieldValue>], histogram: &HistogramComputation) -> HistogramResult {
    let numbers: Vec<f64> = values
        .iter()
        .flatten()
        .filter_map(FieldValue::coerce_f64)
        .collect();
    bin_numbers(&numbers, histogram)
}

/// Bin already coerced numbers
pub fn bin_numbers(numbers: &[f64], histogram: &HistogramComputation) -> HistogramResult {
    let mut bin_counts = vec![0u64; histogram.num_bins as usize];
    for &v in numbers {
        if let Some(i) = bin_index(v, histogram) {
            bin_counts[i] += 1;
        }
    }

    let count = numbers.len() as u64;
    let mean = if numbers.is_empty() {
        None
    } else {
        Some(round2(numbers.iter().sum::<f64>() / numbers.len() as f64))
    };

    HistogramResult {
        sparkline: sparkline(&bin_counts),
        bin_counts,
        mean,
        count,
    }
}

/// Render bin counts as a glyph per bin
pub fn sparkline(counts: &[u64]) -> String {
    let max = counts.iter().copied().max().unwrap_or(0);
    if max == 0 {
        return SPARK_GLYPHS[0].to_string().repeat(counts.len());
    }
    counts
        .iter()
        .map(|&c| {
            if c == 0 {
                SPARK_GLYPHS[0]
            } else {
                let level = ((c as f64 / max as f64) * 7.0).round() as usize;
                SPARK_GLYPHS[level.clamp(1, 7)]
            }
        })
        .collect()
}
