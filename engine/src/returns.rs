//! Minute-over-minute returns and their trailing statistics.

use corelib::Bar;

use crate::window::{TrailingWindow, WindowStat};

/// `(close - prev_close) / prev_close`; undefined for a zero or non-finite
/// previous close, or a non-finite close.
pub fn simple_return(prev_close: f64, close: f64) -> Option<f64> {
    if prev_close == 0.0 || !prev_close.is_finite() || !close.is_finite() {
        return None;
    }
    let ret = (close - prev_close) / prev_close;
    ret.is_finite().then_some(ret)
}

/// Return at every position of one symbol's bars. Position 0 has no return.
pub fn bar_returns(bars: &[Bar]) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(bars.len());
    if bars.is_empty() {
        return out;
    }

    out.push(None);
    out.extend(
        bars.windows(2)
            .map(|pair| simple_return(pair[0].close, pair[1].close)),
    );
    out
}

/// A bar's return together with the statistic of the window ending on it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReturnPoint {
    pub ret: Option<f64>,
    pub window: Option<WindowStat>,
}

impl ReturnPoint {
    /// z-score of this bar's return within its own window.
    pub fn z_score(&self) -> Option<f64> {
        let ret = self.ret?;
        self.window?.z_score(ret)
    }
}

/// Returns and trailing statistics for `bars`, which must be in ascending
/// timestamp order.
pub fn return_points(bars: &[Bar], window_size: usize) -> Vec<ReturnPoint> {
    let mut window = TrailingWindow::new(window_size);

    bar_returns(bars)
        .into_iter()
        .map(|ret| {
            window.push(ret);
            ReturnPoint {
                ret,
                window: window.stat(),
            }
        })
        .collect()
}
