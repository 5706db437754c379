//! Scale calibration.
//!
//! Computes a per-tensor quantization scale from observed activation values,
//! either from the largest magnitude (MinMax) or from the truncation
//! threshold that minimizes the KL divergence between the observed
//! distribution and its 255-level quantized approximation.
//!
//! The KL search is split into four stages so each can be tested on its
//! own: [`Histogram::build`], [`Histogram::search_window`],
//! [`Histogram::candidate_divergence`] and [`Histogram::select_threshold`].

use std::path::PathBuf;

use crate::scale::SignClass;

/// Default number of histogram bins.
pub const DEFAULT_NUM_BINS: usize = 2048;

/// Number of quantization levels a candidate distribution is merged into.
pub const NUM_QUANTIZED_BINS: usize = 255;

/// Errors loading warmup data from disk.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    /// Failed to read a warmup data file.
    #[error("failed to read warmup file {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Warmup data file has invalid size (not a multiple of 4 bytes for f32).
    #[error("warmup file {path} has invalid size {size} (must be a multiple of 4 bytes)")]
    InvalidFileSize { path: PathBuf, size: u64 },
    /// A sample does not have the element count its declared dims require.
    #[error("warmup file {path} holds {found} values, expected {expected}")]
    SampleLength {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
    /// No warmup samples found in the directory.
    #[error("no .bin warmup files found in {0}")]
    NoSamples(PathBuf),
}

/// Why no finite scale could be computed for a tensor.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DegenerateData {
    #[error("tensor was not populated by the warmup run")]
    Missing,
    #[error("tensor does not hold f32 data")]
    NotFloat,
    #[error("tensor is empty")]
    Empty,
    #[error("tensor contains non-finite values")]
    NonFinite,
    #[error("tensor is all zeros")]
    AllZero,
    #[error("histogram needs more than {NUM_QUANTIZED_BINS} bins, got {0}")]
    TooFewBins(usize),
    #[error("no truncation candidate has a finite divergence")]
    NoFiniteCandidate,
    #[error("value range {0} does not give a finite scale")]
    OutOfRange(f32),
}

fn value_range(values: &[f32]) -> Result<(f32, f32), DegenerateData> {
    if values.is_empty() {
        return Err(DegenerateData::Empty);
    }
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in values {
        if !v.is_finite() {
            return Err(DegenerateData::NonFinite);
        }
        min = min.min(v);
        max = max.max(v);
    }
    if min == 0.0 && max == 0.0 {
        return Err(DegenerateData::AllZero);
    }
    Ok((min, max))
}

/// `max(|min|, |max|)` of the values.
pub fn max_abs(values: &[f32]) -> Result<f32, DegenerateData> {
    let (min, max) = value_range(values)?;
    Ok(min.abs().max(max.abs()))
}

/// MinMax calibration: `int_max / max(|min|, |max|)`.
pub fn calibrate_minmax(values: &[f32], sign: SignClass) -> Result<f32, DegenerateData> {
    finite_scale(sign, max_abs(values)?)
}

/// KL-divergence calibration: `int_max / threshold` for the
/// divergence-minimizing truncation threshold.
pub fn calibrate_kl(values: &[f32], sign: SignClass, num_bins: usize) -> Result<f32, DegenerateData> {
    let hist = Histogram::build(values, num_bins)?;
    let index = hist.select_threshold()?;
    let threshold = hist.threshold(index);
    log::debug!(
        "kl: range [{}, {}], threshold bin {} of {}, threshold {}",
        hist.min,
        hist.max,
        index,
        hist.bins.len(),
        threshold
    );
    finite_scale(sign, threshold)
}

fn finite_scale(sign: SignClass, threshold: f32) -> Result<f32, DegenerateData> {
    let scale = sign.int_max() / threshold;
    if scale.is_finite() && scale > 0.0 {
        Ok(scale)
    } else {
        Err(DegenerateData::OutOfRange(threshold))
    }
}

/// Equal-width histogram of one tensor's values.
#[derive(Clone, Debug, PartialEq)]
pub struct Histogram {
    /// Bin counts.
    pub bins: Vec<u64>,
    /// Lower edge of bin 0.
    pub range_start: f32,
    pub bin_width: f32,
    /// `[0, max]` when no value is negative, otherwise `[-T, T]`.
    pub one_sided: bool,
    /// Values were negated before binning so the larger-magnitude tail
    /// ends up in the last bins.
    pub mirrored: bool,
    /// Observed minimum of the original values.
    pub min: f32,
    /// Observed maximum of the original values.
    pub max: f32,
}

impl Histogram {
    /// Bin `values` into `num_bins` equal-width bins.
    ///
    /// Identical inputs always produce identical bins.
    pub fn build(values: &[f32], num_bins: usize) -> Result<Self, DegenerateData> {
        if num_bins <= NUM_QUANTIZED_BINS {
            return Err(DegenerateData::TooFewBins(num_bins));
        }
        let (min, max) = value_range(values)?;

        let one_sided = min >= 0.0;
        let mirrored = !one_sided && min.abs() > max.abs();
        let (range_start, range_end) = if one_sided {
            (0.0, max)
        } else {
            let t = min.abs().max(max.abs());
            (-t, t)
        };
        let bin_width = (range_end - range_start) / num_bins as f32;
        if !(bin_width.is_finite() && bin_width > 0.0) {
            return Err(DegenerateData::OutOfRange(range_end - range_start));
        }

        let mut bins = vec![0u64; num_bins];
        for &v in values {
            let v = if mirrored { -v } else { v };
            let idx = ((v - range_start) / bin_width) as usize;
            bins[idx.min(num_bins - 1)] += 1;
        }

        Ok(Self {
            bins,
            range_start,
            bin_width,
            one_sided,
            mirrored,
            min,
            max,
        })
    }

    /// Upper edge of bin `index - 1`, i.e. the real value a candidate
    /// truncating at `index` clips to.
    pub fn threshold(&self, index: usize) -> f32 {
        self.range_start + index as f32 * self.bin_width
    }

    /// Inclusive range of candidate truncation indices.
    ///
    /// One-sided histograms start at 70% of the last bin index. Two-sided
    /// histograms skip leading empty bins and start 60% of the way from the
    /// first populated bin to the last bin. The start never drops below
    /// [`NUM_QUANTIZED_BINS`]; the end is the bin count, i.e. no truncation.
    pub fn search_window(&self) -> (usize, usize) {
        let n = self.bins.len();
        let last = n - 1;
        let start = if self.one_sided {
            (last as f64 * 0.7) as usize
        } else {
            let first = self.bins.iter().position(|&c| c > 0).unwrap_or(last);
            first + ((last - first) as f64 * 0.6) as usize
        };
        (start.max(NUM_QUANTIZED_BINS), n)
    }

    /// KL(P || Q) for truncation at `index`, or `None` if the candidate is
    /// not admissible (bin `index - 1` empty, non-positive threshold, or no
    /// finite divergence).
    ///
    /// P is bins `[0, index)` with the mass of the remaining bins added to
    /// its last entry. Q merges P into [`NUM_QUANTIZED_BINS`] contiguous
    /// groups (the last group absorbs the remainder) and spreads each
    /// group's mass evenly over its non-empty bins.
    pub fn candidate_divergence(&self, index: usize) -> Option<f64> {
        if index < NUM_QUANTIZED_BINS || index > self.bins.len() || self.bins[index - 1] == 0 {
            return None;
        }
        if self.threshold(index) <= 0.0 {
            return None;
        }

        let mut p: Vec<f64> = self.bins[..index].iter().map(|&c| c as f64).collect();
        let tail: u64 = self.bins[index..].iter().sum();
        p[index - 1] += tail as f64;

        let q = expand_groups(&p, NUM_QUANTIZED_BINS);
        kl_divergence(&p, &q)
    }

    /// Index of the candidate with the smallest divergence; ties go to the
    /// smallest index.
    pub fn select_threshold(&self) -> Result<usize, DegenerateData> {
        let (start, end) = self.search_window();
        let mut best: Option<(usize, f64)> = None;
        for i in start..=end {
            if let Some(d) = self.candidate_divergence(i)
                && best.is_none_or(|(_, b)| d < b)
            {
                best = Some((i, d));
            }
        }
        best.map(|(i, _)| i).ok_or(DegenerateData::NoFiniteCandidate)
    }
}

/// Merge `p` into `groups` contiguous groups and re-expand each group's
/// mass evenly over the group's non-zero bins.
fn expand_groups(p: &[f64], groups: usize) -> Vec<f64> {
    let n = p.len();
    let width = n / groups;
    let mut q = vec![0.0f64; n];
    for g in 0..groups {
        let start = g * width;
        let end = if g + 1 == groups { n } else { start + width };
        let group = &p[start..end];
        let nonzero = group.iter().filter(|&&v| v > 0.0).count();
        if nonzero == 0 {
            continue;
        }
        let share = group.iter().sum::<f64>() / nonzero as f64;
        for (qj, &pj) in q[start..end].iter_mut().zip(group) {
            if pj > 0.0 {
                *qj = share;
            }
        }
    }
    q
}

/// KL divergence of the normalized distributions. `None` if Q is zero
/// where P is not, or the result is not finite.
fn kl_divergence(p: &[f64], q: &[f64]) -> Option<f64> {
    let p_sum: f64 = p.iter().sum();
    let q_sum: f64 = q.iter().sum();
    if p_sum <= 0.0 || q_sum <= 0.0 {
        return None;
    }
    let mut divergence = 0.0f64;
    for (&pi, &qi) in p.iter().zip(q) {
        if pi == 0.0 {
            continue;
        }
        if qi == 0.0 {
            return None;
        }
        let pn = pi / p_sum;
        let qn = qi / q_sum;
        divergence += pn * (pn / qn).ln();
    }
    divergence.is_finite().then_some(divergence)
}
