//! Weight algebra of the negated-log (tropical) semiring.
//!
//! Probabilities and counts are stored as negated natural logarithms:
//! `⊕ = -log(e^-a + e^-b)`, `⊗ = +`, zero is `+inf`, one is `0.0`. Long
//! reductions carry an explicit Kahan compensation term so that results are
//! reproducible bit-for-bit across implementations; the compensation variable
//! is part of the numeric contract, not an optimization.

use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::Error;

/// The weight of no mass, `-log(0)`.
pub const ZERO: f64 = f64::INFINITY;

/// The weight of full mass, `-log(1)`.
pub const ONE: f64 = 0.0;

/// Number of bins carried by a [`HistWeight`]. Index 0 holds the raw
/// expected count; index `i > 0` holds `-log P(count = i - 1)`.
pub const HIST_BINS: usize = 16;

/// `-log(e^-a + e^-b)` without compensation.
pub fn neg_log_sum(a: f64, b: f64) -> f64 {
    let mut comp = 0.0;
    neg_log_sum_kahan(a, b, &mut comp)
}

/// `-log(e^-a + e^-b)`, folding the low-order bits lost by the addition
/// into `comp` so a chain of sums stays exact.
pub fn neg_log_sum_kahan(a: f64, b: f64, comp: &mut f64) -> f64 {
    if a == ZERO {
        return b;
    }
    if b == ZERO {
        return a;
    }
    // hi is the larger probability (smaller cost); the increment is <= ln 2.
    let (hi, lo) = if a <= b { (a, b) } else { (b, a) };
    let y = -(-(lo - hi)).exp().ln_1p() - *comp;
    let t = hi + y;
    *comp = (t - hi) - y;
    t
}

/// `-log(e^-a - e^-b)`. Requires `a < b` (the first operand carries the
/// larger probability); returns an error when the difference would be
/// negative mass beyond rounding.
pub fn neg_log_diff(a: f64, b: f64) -> Result<f64, Error> {
    if b == ZERO {
        return Ok(a);
    }
    if b < a {
        if b - a < -1e-10 {
            return Err(Error::NegativeMass { a, b });
        }
        return Ok(ZERO); // equal within rounding, nothing remains
    }
    let x = (a - b).exp(); // e^-a - e^-b = e^-a * (1 - x) with x < 1
    Ok(a - (-x).ln_1p())
}

/// Arc weight abstraction shared by scalar tropical models and
/// histogram-count models.
///
/// `scalar` projects a weight onto its negated-log scalar value (for a
/// histogram weight, the raw expected count at index 0); `times_scalar` is
/// tropical multiplication by a scalar cost.
pub trait Weight: Clone + PartialEq + std::fmt::Debug {
    fn zero() -> Self;
    fn one() -> Self;
    fn plus(&self, other: &Self) -> Self;
    fn scalar(&self) -> f64;
    fn from_scalar(value: f64) -> Self;
    fn times_scalar(&self, cost: f64) -> Self;
    fn approx_eq(&self, other: &Self, eps: f64) -> bool;

    fn write_to<W: io::Write>(&self, writer: &mut W) -> io::Result<()>;
    fn read_from<R: io::Read>(reader: &mut R) -> io::Result<Self>;

    /// Number of `f64` components in the serialized form.
    fn arity() -> u32;
}

impl Weight for f64 {
    fn zero() -> Self {
        ZERO
    }

    fn one() -> Self {
        ONE
    }

    fn plus(&self, other: &Self) -> Self {
        neg_log_sum(*self, *other)
    }

    fn scalar(&self) -> f64 {
        *self
    }

    fn from_scalar(value: f64) -> Self {
        value
    }

    fn times_scalar(&self, cost: f64) -> Self {
        if *self == ZERO {
            ZERO
        } else {
            *self + cost
        }
    }

    fn approx_eq(&self, other: &Self, eps: f64) -> bool {
        (*self == ZERO && *other == ZERO) || (*self - *other).abs() < eps
    }

    fn write_to<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_f64::<LittleEndian>(*self)
    }

    fn read_from<R: io::Read>(reader: &mut R) -> io::Result<Self> {
        reader.read_f64::<LittleEndian>()
    }

    fn arity() -> u32 {
        1
    }
}

/// Product of tropical weights recording fractional-count evidence.
///
/// Index 0 carries the raw expected count in negated-log space; index
/// `i > 0` carries `-log P(count = i - 1)`. Fractional Katz smoothing reads
/// the bins as a distribution over integer counts.
#[derive(Clone, Copy, PartialEq)]
pub struct HistWeight {
    pub bins: [f64; HIST_BINS],
}

impl HistWeight {
    /// Spreads a scalar expected count over the two adjacent integer bins.
    ///
    /// An expected count `c` with `f = floor(c)` is read as observing `f`
    /// with probability `f + 1 - c` and `f + 1` with probability `c - f`.
    pub fn from_expected_count(value: f64) -> Self {
        let mut bins = [ZERO; HIST_BINS];
        bins[0] = value;
        let count = (-value).exp();
        let round_down = count.floor();
        let round_up = round_down + 1.0;
        let index = round_up as usize;
        if index + 1 < HIST_BINS {
            let frac = count - round_down;
            bins[index + 1] = if frac > 0.0 { -frac.ln() } else { ZERO };
        }
        if index > 0 && index < HIST_BINS {
            let frac = round_up - count;
            bins[index] = if frac > 0.0 { -frac.ln() } else { ZERO };
        }
        HistWeight { bins }
    }
}

impl std::fmt::Debug for HistWeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HistWeight({:.4}", self.bins[0])?;
        for b in &self.bins[1..] {
            if *b != ZERO {
                write!(f, ", {b:.4}")?;
            }
        }
        write!(f, ")")
    }
}

impl Weight for HistWeight {
    fn zero() -> Self {
        HistWeight {
            bins: [ZERO; HIST_BINS],
        }
    }

    fn one() -> Self {
        HistWeight {
            bins: [ONE; HIST_BINS],
        }
    }

    fn plus(&self, other: &Self) -> Self {
        let mut bins = [ZERO; HIST_BINS];
        for (i, bin) in bins.iter_mut().enumerate() {
            *bin = neg_log_sum(self.bins[i], other.bins[i]);
        }
        HistWeight { bins }
    }

    fn scalar(&self) -> f64 {
        self.bins[0]
    }

    fn from_scalar(value: f64) -> Self {
        HistWeight::from_expected_count(value)
    }

    fn times_scalar(&self, cost: f64) -> Self {
        let mut bins = self.bins;
        for bin in bins.iter_mut() {
            if *bin != ZERO {
                *bin += cost;
            }
        }
        HistWeight { bins }
    }

    fn approx_eq(&self, other: &Self, eps: f64) -> bool {
        self.bins
            .iter()
            .zip(other.bins.iter())
            .all(|(a, b)| a.approx_eq(b, eps))
    }

    fn write_to<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        for bin in &self.bins {
            writer.write_f64::<LittleEndian>(*bin)?;
        }
        Ok(())
    }

    fn read_from<R: io::Read>(reader: &mut R) -> io::Result<Self> {
        let mut bins = [ZERO; HIST_BINS];
        for bin in bins.iter_mut() {
            *bin = reader.read_f64::<LittleEndian>()?;
        }
        Ok(HistWeight { bins })
    }

    fn arity() -> u32 {
        HIST_BINS as u32
    }
}

#[cfg(test)]
mod test {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn sum_of_halves_is_one() {
        let half = -0.5f64.ln();
        assert_abs_diff_eq!(neg_log_sum(half, half), ONE, epsilon = 1e-12);
    }

    #[test]
    fn sum_with_zero_is_identity() {
        assert_eq!(neg_log_sum(ZERO, 1.25), 1.25);
        assert_eq!(neg_log_sum(1.25, ZERO), 1.25);
    }

    #[test]
    fn kahan_chain_matches_direct_log() {
        // 1000 summands of 1/1000 must come back to exactly one.
        let term = -(0.001f64).ln();
        let mut sum = ZERO;
        let mut comp = 0.0;
        for _ in 0..1000 {
            sum = neg_log_sum_kahan(sum, term, &mut comp);
        }
        assert_abs_diff_eq!(sum, ONE, epsilon = 1e-12);
    }

    #[test]
    fn diff_restores_summand() {
        let a = -0.7f64.ln();
        let b = -0.3f64.ln();
        let sum = neg_log_sum(a, b);
        assert_abs_diff_eq!(neg_log_diff(sum, b).unwrap(), a, epsilon = 1e-9);
    }

    #[test]
    fn diff_of_larger_mass_errors() {
        let a = -0.3f64.ln();
        let b = -0.7f64.ln();
        assert!(matches!(
            neg_log_diff(a, b),
            Err(crate::Error::NegativeMass { .. })
        ));
    }

    #[test]
    fn hist_weight_spreads_fractional_count() {
        // Expected count 1.1 becomes P(1) = 0.9, P(2) = 0.1.
        let w = HistWeight::from_expected_count(-(1.1f64).ln());
        assert_abs_diff_eq!((-w.bins[0]).exp(), 1.1, epsilon = 1e-9);
        assert_abs_diff_eq!((-w.bins[2]).exp(), 0.9, epsilon = 1e-9);
        assert_abs_diff_eq!((-w.bins[3]).exp(), 0.1, epsilon = 1e-9);
    }

    #[test]
    fn hist_weight_integer_count_is_certain() {
        let w = HistWeight::from_expected_count(-(2.0f64).ln());
        assert_abs_diff_eq!((-w.bins[3]).exp(), 1.0, epsilon = 1e-12);
        assert_eq!(w.bins[2], ZERO);
    }
}
