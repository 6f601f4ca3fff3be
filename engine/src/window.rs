//! Trailing-window statistics.
//!
//! Equivalent of `avg(x)` / `stddev_samp(x)` over
//! `ROWS BETWEEN (W-1) PRECEDING AND CURRENT ROW`, partitioned by symbol:
//! - the window counts *positions*, not defined values
//! - undefined positions occupy a slot but contribute nothing
//! - early positions see a partial window
//!
//! Callers must feed values in ascending timestamp order; nothing here sorts.

use std::collections::VecDeque;

/// Mean and sample standard deviation of the defined values in one window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowStat {
    pub mean: f64,
    /// Sample standard deviation (n - 1). Always finite and > 0.
    pub stddev: f64,
    /// Number of defined values that went into the statistic (>= 2).
    pub count: usize,
}

impl WindowStat {
    /// Computes the statistic over `values`, or `None` when it is undefined:
    /// fewer than two values or zero spread.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let n = values.len();
        if n < 2 {
            return None;
        }
        // identical values: exact zero spread, whatever rounding the mean picks up
        if values.iter().all(|v| *v == values[0]) {
            return None;
        }

        let mean = values.iter().sum::<f64>() / n as f64;
        let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        let stddev = (sum_sq / (n - 1) as f64).sqrt();

        if !mean.is_finite() || !stddev.is_finite() || stddev <= 0.0 {
            return None;
        }

        Some(Self {
            mean,
            stddev,
            count: n,
        })
    }

    /// `(value - mean) / stddev`, or `None` for a non-finite result.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        let z = (value - self.mean) / self.stddev;
        z.is_finite().then_some(z)
    }
}

/// Fixed-size ring of the last `size` positions of one symbol's series.
#[derive(Clone, Debug)]
pub struct TrailingWindow {
    slots: VecDeque<Option<f64>>,
    size: usize,
}

impl TrailingWindow {
    /// `size` is the number of positions including the current one; clamped to 1.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: VecDeque::with_capacity(size),
            size,
        }
    }

    /// Advances the window by one position. Non-finite values count as undefined.
    pub fn push(&mut self, value: Option<f64>) {
        if self.slots.len() == self.size {
            self.slots.pop_front();
        }
        self.slots.push_back(value.filter(|v| v.is_finite()));
    }

    /// Defined values currently in the window, oldest first.
    pub fn defined(&self) -> impl Iterator<Item = f64> + '_ {
        self.slots.iter().flatten().copied()
    }

    pub fn defined_count(&self) -> usize {
        self.slots.iter().filter(|v| v.is_some()).count()
    }

    pub fn stat(&self) -> Option<WindowStat> {
        let values: Vec<f64> = self.defined().collect();
        WindowStat::from_values(&values)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() == self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Statistic at every position of `values` for a trailing window of `size`.
pub fn trailing_stats(values: &[Option<f64>], size: usize) -> Vec<Option<WindowStat>> {
    let mut window = TrailingWindow::new(size);
    values
        .iter()
        .map(|v| {
            window.push(*v);
            window.stat()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn single_value_is_undefined() {
        assert!(WindowStat::from_values(&[]).is_none());
        assert!(WindowStat::from_values(&[0.5]).is_none());
    }

    #[test]
    fn constant_values_have_undefined_stddev() {
        assert!(WindowStat::from_values(&[0.0, 0.0, 0.0]).is_none());
        assert!(WindowStat::from_values(&[2.5, 2.5]).is_none());
    }

    #[test]
    fn uses_sample_not_population_stddev() {
        // population stddev of {1,2,3,4} is 1.118..; sample is 1.290..
        let s = WindowStat::from_values(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(close(s.mean, 2.5));
        assert!(close(s.stddev, (5.0f64 / 3.0).sqrt()));
        assert_eq!(s.count, 4);
    }

    #[test]
    fn z_score_against_window() {
        let s = WindowStat::from_values(&[1.0, 3.0]).unwrap();
        // mean 2, sample sd sqrt(2)
        assert!(close(s.z_score(2.0).unwrap(), 0.0));
        assert!(close(s.z_score(3.0).unwrap(), 1.0 / 2f64.sqrt()));
    }

    #[test]
    fn window_evicts_oldest_position() {
        let mut w = TrailingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(Some(v));
        }

        assert!(w.is_full());
        assert_eq!(w.defined().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn undefined_positions_occupy_slots() {
        let mut w = TrailingWindow::new(3);
        w.push(Some(1.0));
        w.push(None);
        w.push(Some(3.0));
        assert_eq!(w.defined_count(), 2);

        // pushing evicts the 1.0; the gap still takes a slot
        w.push(Some(5.0));
        assert_eq!(w.defined().collect::<Vec<_>>(), vec![3.0, 5.0]);
        w.push(Some(7.0));
        assert_eq!(w.defined().collect::<Vec<_>>(), vec![3.0, 5.0, 7.0]);
    }

    #[test]
    fn non_finite_values_are_treated_as_gaps() {
        let mut w = TrailingWindow::new(4);
        w.push(Some(f64::NAN));
        w.push(Some(f64::INFINITY));
        w.push(Some(1.0));
        assert_eq!(w.len(), 3);
        assert_eq!(w.defined_count(), 1);
        assert!(w.stat().is_none());
    }

    #[test]
    fn partial_windows_emit_once_two_values_exist() {
        let stats = trailing_stats(&[None, Some(1.0), Some(3.0), Some(5.0)], 11);

        assert!(stats[0].is_none());
        assert!(stats[1].is_none());
        let s2 = stats[2].unwrap();
        assert!(close(s2.mean, 2.0));
        assert_eq!(s2.count, 2);
        let s3 = stats[3].unwrap();
        assert!(close(s3.mean, 3.0));
        assert!(close(s3.stddev, 2.0));
    }

    #[test]
    fn size_zero_is_clamped_to_one() {
        let w = TrailingWindow::new(0);
        assert_eq!(w.size(), 1);
        assert!(trailing_stats(&[Some(1.0), Some(2.0)], 0)
            .iter()
            .all(Option::is_none));
    }
}
