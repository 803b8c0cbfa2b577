use interp::interp;

/// Linear interpolation of `xs` onto the polyline `(xp, yp)`, with linear
/// extrapolation from the terminal segments outside the sampled range.
///
/// `xp` may be ascending or descending (flow paths are walked from the
/// headwater, so curvilinear positions arrive in descending order).
pub fn interp_extrapolate(xp: &[f64], yp: &[f64], xs: &[f64]) -> Vec<f64> {
    assert_eq!(xp.len(), yp.len());
    assert!(xp.len() >= 2, "extrapolation needs at least two points");

    let (xp, yp): (Vec<f64>, Vec<f64>) = if xp[0] > xp[xp.len() - 1] {
        (
            xp.iter().rev().cloned().collect(),
            yp.iter().rev().cloned().collect(),
        )
    } else {
        (xp.to_vec(), yp.to_vec())
    };

    let n = xp.len();
    let head_slope = (yp[1] - yp[0]) / (xp[1] - xp[0]);
    let tail_slope = (yp[n - 1] - yp[n - 2]) / (xp[n - 1] - xp[n - 2]);

    xs.iter()
        .map(|&x| {
            if x < xp[0] {
                yp[0] + (x - xp[0]) * head_slope
            } else if x > xp[n - 1] {
                yp[n - 1] + (x - xp[n - 1]) * tail_slope
            } else {
                interp(&xp, &yp, x)
            }
        })
        .collect()
}

/// Discrete downstream slope series of an elevation profile.
///
/// `slope[i] = (y[i+1] - y[i]) / (x[i+1] - x[i])`, with the last node
/// repeating the previous segment's slope. `x` is curvilinear distance to
/// the outlet and decreases along the walk, so a falling profile yields a
/// positive slope.
pub fn slope_down_series(x: &[f64], y: &[f64]) -> Vec<f64> {
    assert_eq!(x.len(), y.len());
    assert!(x.len() >= 2);

    let mut slope = Vec::with_capacity(x.len());
    for i in 0..x.len() - 1 {
        slope.push((y[i + 1] - y[i]) / (x[i + 1] - x[i]));
    }
    slope.push(slope[slope.len() - 1]);
    slope
}

/// Clamp a raw slope into the configured thresholds. Without thresholds
/// the raw value passes through.
pub fn clamp_slope(raw: f64, tslopemin: Option<f64>, tslopemax: Option<f64>) -> f64 {
    let mut slope = raw;
    if let Some(tmin) = tslopemin {
        slope = slope.max(tmin);
    }
    if let Some(tmax) = tslopemax {
        slope = slope.min(tmax);
    }
    slope
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interp_interior() {
        let xp = vec![0.0, 10.0, 20.0];
        let yp = vec![0.0, 1.0, 4.0];
        let ys = interp_extrapolate(&xp, &yp, &[5.0, 15.0]);
        assert!((ys[0] - 0.5).abs() < 1e-12);
        assert!((ys[1] - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_interp_extrapolates_ends() {
        let xp = vec![0.0, 10.0, 20.0];
        let yp = vec![0.0, 1.0, 4.0];
        let ys = interp_extrapolate(&xp, &yp, &[-10.0, 30.0]);
        assert!((ys[0] - -1.0).abs() < 1e-12);
        assert!((ys[1] - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_interp_descending_input() {
        let xp = vec![20.0, 10.0, 0.0];
        let yp = vec![4.0, 1.0, 0.0];
        let ys = interp_extrapolate(&xp, &yp, &[15.0, 5.0]);
        assert!((ys[0] - 2.5).abs() < 1e-12);
        assert!((ys[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_slope_down_series_repeats_last() {
        // walked headwater -> outlet: x decreasing, y decreasing
        let x = vec![30.0, 20.0, 10.0, 0.0];
        let y = vec![9.0, 6.0, 4.0, 0.0];
        let s = slope_down_series(&x, &y);
        assert_eq!(s.len(), 4);
        assert!((s[0] - 0.3).abs() < 1e-12);
        assert!((s[1] - 0.2).abs() < 1e-12);
        assert!((s[2] - 0.4).abs() < 1e-12);
        assert_eq!(s[2], s[3]);
    }

    #[test]
    fn test_clamp_slope_thresholds() {
        assert_eq!(clamp_slope(0.5, Some(0.001), Some(0.2)), 0.2);
        assert_eq!(clamp_slope(0.0, Some(0.001), Some(0.2)), 0.001);
        assert_eq!(clamp_slope(0.05, Some(0.001), Some(0.2)), 0.05);
        assert_eq!(clamp_slope(0.5, None, None), 0.5);
        assert_eq!(clamp_slope(0.0, None, Some(0.2)), 0.0);
    }
}
