//! Linear voltage ramp generation.
//!
//! A [`LinearRange`] is the ordered, finite, restartable sequence of voltage
//! set-points between two endpoints. Direction is inferred from the endpoints
//! and the sign of the configured step is ignored: ramps always move from
//! `begin` toward `end`. Non-empty sequences include both endpoints exactly;
//! the final segment may be shorter than the nominal step so the ramp lands
//! precisely on `end`.

/// Ordered sequence of voltage set-points from `begin` to `end`.
///
/// Degenerate inputs (`begin == end`, or a zero step) produce an empty
/// sequence rather than an error; a ramp of zero length is a valid no-op.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearRange {
    pub begin: f64,
    pub end: f64,
    pub step: f64,
}

impl LinearRange {
    pub fn new(begin: f64, end: f64, step: f64) -> Self {
        Self { begin, end, step }
    }

    /// Number of set-points in the sequence (including both endpoints).
    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let distance = (self.end - self.begin).abs();
        let steps = (distance / self.step.abs()).ceil() as usize;
        steps + 1
    }

    /// True when the sequence yields no set-points at all.
    pub fn is_empty(&self) -> bool {
        self.begin == self.end || self.step == 0.0 || !self.span_is_finite()
    }

    /// Signed step in the direction of travel, regardless of configured sign.
    pub fn signed_step(&self) -> f64 {
        if self.end >= self.begin {
            self.step.abs()
        } else {
            -self.step.abs()
        }
    }

    /// Restartable iterator over the set-points.
    pub fn iter(&self) -> LinearRangeIter {
        LinearRangeIter {
            range: *self,
            index: 0,
            len: self.len(),
        }
    }

    fn span_is_finite(&self) -> bool {
        self.begin.is_finite() && self.end.is_finite() && self.step.is_finite()
    }
}

impl IntoIterator for LinearRange {
    type Item = f64;
    type IntoIter = LinearRangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for &LinearRange {
    type Item = f64;
    type IntoIter = LinearRangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct LinearRangeIter {
    range: LinearRange,
    index: usize,
    len: usize,
}

impl Iterator for LinearRangeIter {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.index >= self.len {
            return None;
        }
        // Compute from the index instead of accumulating, so rounding error
        // does not drift over long ramps; the last point is exactly `end`.
        let value = if self.index + 1 == self.len {
            self.range.end
        } else {
            self.range.begin + self.index as f64 * self.range.signed_step()
        };
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for LinearRangeIter {}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(begin: f64, end: f64, step: f64) -> Vec<f64> {
        LinearRange::new(begin, end, step).iter().collect()
    }

    #[test]
    fn test_ascending() {
        assert_eq!(collect(0.0, 5.0, 2.5), vec![0.0, 2.5, 5.0]);
    }

    #[test]
    fn test_descending_ignores_step_sign() {
        assert_eq!(collect(5.0, 0.0, 2.5), vec![5.0, 2.5, 0.0]);
        assert_eq!(collect(5.0, 0.0, -2.5), vec![5.0, 2.5, 0.0]);
        assert_eq!(collect(0.0, 5.0, -2.5), vec![0.0, 2.5, 5.0]);
    }

    #[test]
    fn test_degenerate_equal_endpoints() {
        assert_eq!(collect(3.0, 3.0, 1.0), Vec::<f64>::new());
        assert_eq!(collect(3.0, 3.0, 0.0), Vec::<f64>::new());
        assert_eq!(collect(3.0, 3.0, -1.0), Vec::<f64>::new());
        assert!(LinearRange::new(3.0, 3.0, 1.0).is_empty());
    }

    #[test]
    fn test_zero_step_never_advances() {
        assert_eq!(collect(0.0, 5.0, 0.0), Vec::<f64>::new());
    }

    #[test]
    fn test_short_final_segment() {
        assert_eq!(collect(0.0, 5.0, 2.0), vec![0.0, 2.0, 4.0, 5.0]);
        assert_eq!(collect(0.0, -5.0, 2.0), vec![0.0, -2.0, -4.0, -5.0]);
    }

    #[test]
    fn test_endpoints_and_monotonicity() {
        let points = collect(-1.3, 4.7, 0.37);
        assert_eq!(points.first().copied(), Some(-1.3));
        assert_eq!(points.last().copied(), Some(4.7));
        assert!(points.windows(2).all(|w| w[1] > w[0]));

        let points = collect(4.7, -1.3, 0.37);
        assert_eq!(points.first().copied(), Some(4.7));
        assert_eq!(points.last().copied(), Some(-1.3));
        assert!(points.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn test_restartable() {
        let range = LinearRange::new(0.0, 2.0, 1.0);
        let first: Vec<f64> = range.iter().collect();
        let second: Vec<f64> = range.iter().collect();
        assert_eq!(first, second);
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn test_exact_size() {
        let range = LinearRange::new(0.0, 10.0, 3.0);
        assert_eq!(range.iter().len(), range.len());
        assert_eq!(range.len(), 5); // 0, 3, 6, 9, 10
    }
}
