//! Anchor geometry fit from averaged belt lengths.
//!
//! Bottom-left is the origin and bottom-right sits on the x axis. Every datum is
//! trilaterated from the two bottom belts, and the top anchors are fitted so that the
//! top belt lengths agree with those positions (Levenberg-Marquardt, numeric Jacobian).

use crate::calibration::CalibrationDatum;
use cablebot_shared::{AxisId, Point3};
use serde::Serialize;
use thiserror::Error;

const PARAMS: usize = 5;
const MAX_ITERATIONS: usize = 200;

#[derive(Debug, Error, PartialEq)]
pub enum SolveError {
    #[error("need at least {needed} calibration points, got {got}")]
    NotEnoughData { needed: usize, got: usize },
    #[error("solver diverged: {0}")]
    Diverged(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    /// Fitted anchors, indexed by `AxisId::index`.
    pub anchors: [Point3; 4],
    /// RMS belt length residual in mm.
    pub fit_error: f64,
    pub iterations: usize,
}

/// Baseline between two anchors seen from two stations on a line parallel to it.
///
/// `first_*`/`second_*` are the distances from each station to the upper and lower
/// anchor of the pair. Returns `None` when the stations are placed symmetrically or
/// coincide.
pub fn compute_vertical(first_upper: f64, first_lower: f64, second_upper: f64, second_lower: f64) -> Option<f64> {
    let (d2, e2) = (first_upper * first_upper, first_lower * first_lower);
    let (b2, c2) = (second_upper * second_upper, second_lower * second_lower);
    let denom = 2.0 * (b2 + c2 - d2 - e2);
    if denom.abs() < 1e-6 {
        return None;
    }
    let a2 = ((b2 - c2).powi(2) - (d2 - e2).powi(2)) / denom;
    if a2 > 0.0 { Some(a2.sqrt()) } else { None }
}

pub fn solve_anchors(data: &[CalibrationDatum], initial: [Point3; 4]) -> Result<FitResult, SolveError> {
    if data.len() < 3 {
        return Err(SolveError::NotEnoughData { needed: 3, got: data.len() });
    }
    let problem = Problem::new(data, initial);
    let mut params = problem.seed();
    let mut cost = problem
        .cost(&params)
        .ok_or_else(|| SolveError::Diverged("seed geometry cannot place the sled".to_string()))?;

    let mut lambda = 1e-3;
    let mut iterations = 0;
    while iterations < MAX_ITERATIONS {
        iterations += 1;
        let Some((jtj, gradient)) = problem.normal_equations(&params) else {
            return Err(SolveError::Diverged("jacobian undefined".to_string()));
        };
        let mut improved = false;
        while lambda < 1e12 {
            let mut damped = jtj;
            for i in 0..PARAMS {
                damped[i][i] += lambda * jtj[i][i].max(1e-9);
            }
            let rhs = gradient.map(|g| -g);
            let Some(delta) = solve_linear(damped, rhs) else {
                lambda *= 4.0;
                continue;
            };
            let mut candidate = params;
            for i in 0..PARAMS {
                candidate[i] += delta[i];
            }
            match problem.cost(&candidate) {
                Some(next) if next < cost => {
                    let gain = cost - next;
                    params = candidate;
                    cost = next;
                    lambda = (lambda / 3.0).max(1e-12);
                    improved = gain > 1e-14 * (1.0 + cost)
                        && delta.iter().any(|d| d.abs() > 1e-9);
                    break;
                }
                _ => lambda *= 4.0,
            }
        }
        if !improved {
            break;
        }
    }

    let fit_error = (cost / problem.residual_count() as f64).sqrt();
    if !fit_error.is_finite() {
        return Err(SolveError::Diverged("non-finite residual".to_string()));
    }
    Ok(FitResult {
        anchors: problem.anchors(&params),
        fit_error,
        iterations,
    })
}

struct Problem<'a> {
    data: &'a [CalibrationDatum],
    initial: [Point3; 4],
}

impl<'a> Problem<'a> {
    fn new(data: &'a [CalibrationDatum], initial: [Point3; 4]) -> Self {
        Self { data, initial }
    }

    fn residual_count(&self) -> usize {
        self.data.len() * 2
    }

    fn planar(&self, datum: &CalibrationDatum, axis: AxisId) -> f64 {
        let length = datum.lengths[axis.index()];
        let dz = self.initial[axis.index()].z;
        (length * length - dz * dz).max(0.0).sqrt()
    }

    fn anchors(&self, p: &[f64; PARAMS]) -> [Point3; 4] {
        let z = |axis: AxisId| self.initial[axis.index()].z;
        [
            Point3::new(p[0], p[1], z(AxisId::TopLeft)),
            Point3::new(p[2], p[3], z(AxisId::TopRight)),
            Point3::new(0.0, 0.0, z(AxisId::BottomLeft)),
            Point3::new(p[4], 0.0, z(AxisId::BottomRight)),
        ]
    }

    /// Nominal geometry, refined with the baseline relation where the grid allows it.
    fn seed(&self) -> [f64; PARAMS] {
        let tl = self.initial[AxisId::TopLeft.index()];
        let tr = self.initial[AxisId::TopRight.index()];
        let br = self.initial[AxisId::BottomRight.index()];
        let bl = self.initial[AxisId::BottomLeft.index()];
        let mut seed = [tl.x - bl.x, tl.y - bl.y, tr.x - bl.x, tr.y - bl.y, br.x - bl.x];

        let same_row = |a: &CalibrationDatum, b: &CalibrationDatum| (a.target[1] - b.target[1]).abs() < 1e-6;
        let same_column = |a: &CalibrationDatum, b: &CalibrationDatum| (a.target[0] - b.target[0]).abs() < 1e-6;
        if let Some(width) = self.baseline(same_row, AxisId::BottomLeft, AxisId::BottomRight) {
            seed[4] = width;
        }
        if let Some(left) = self.baseline(same_column, AxisId::TopLeft, AxisId::BottomLeft) {
            seed[1] = left;
        }
        if let Some(right) = self.baseline(same_column, AxisId::TopRight, AxisId::BottomRight) {
            seed[3] = right;
        }
        seed
    }

    /// Median of the baseline estimates from consecutive data points that share a row
    /// or column.
    fn baseline<F>(&self, paired: F, upper: AxisId, lower: AxisId) -> Option<f64>
    where
        F: Fn(&CalibrationDatum, &CalibrationDatum) -> bool,
    {
        let mut estimates: Vec<f64> = Vec::new();
        for (i, first) in self.data.iter().enumerate() {
            let Some(second) = self.data[i + 1..].iter().find(|d| paired(first, d)) else {
                continue;
            };
            if let Some(a) = compute_vertical(
                self.planar(first, upper),
                self.planar(first, lower),
                self.planar(second, upper),
                self.planar(second, lower),
            ) {
                if a.is_finite() {
                    estimates.push(a);
                }
            }
        }
        if estimates.is_empty() {
            return None;
        }
        estimates.sort_by(|a, b| a.total_cmp(b));
        Some(estimates[estimates.len() / 2])
    }

    fn residuals(&self, p: &[f64; PARAMS]) -> Option<Vec<f64>> {
        let width = p[4];
        if width <= 0.0 || !p.iter().all(|v| v.is_finite()) {
            return None;
        }
        let mut out = Vec::with_capacity(self.residual_count());
        for datum in self.data {
            let r_bl = self.planar(datum, AxisId::BottomLeft);
            let r_br = self.planar(datum, AxisId::BottomRight);
            let x = (r_bl * r_bl - r_br * r_br + width * width) / (2.0 * width);
            let y = (r_bl * r_bl - x * x).max(0.0).sqrt();
            let r_tl = self.planar(datum, AxisId::TopLeft);
            let r_tr = self.planar(datum, AxisId::TopRight);
            out.push((p[0] - x).hypot(p[1] - y) - r_tl);
            out.push((p[2] - x).hypot(p[3] - y) - r_tr);
        }
        Some(out)
    }

    fn cost(&self, p: &[f64; PARAMS]) -> Option<f64> {
        self.residuals(p).map(|r| r.iter().map(|v| v * v).sum())
    }

    fn normal_equations(&self, p: &[f64; PARAMS]) -> Option<([[f64; PARAMS]; PARAMS], [f64; PARAMS])> {
        const H: f64 = 1e-4;
        let base = self.residuals(p)?;
        let mut columns: Vec<Vec<f64>> = Vec::with_capacity(PARAMS);
        for k in 0..PARAMS {
            let mut plus = *p;
            let mut minus = *p;
            plus[k] += H;
            minus[k] -= H;
            let rp = self.residuals(&plus)?;
            let rm = self.residuals(&minus)?;
            columns.push(rp.iter().zip(&rm).map(|(a, b)| (a - b) / (2.0 * H)).collect());
        }
        let mut jtj = [[0.0; PARAMS]; PARAMS];
        let mut gradient = [0.0; PARAMS];
        for i in 0..PARAMS {
            for j in 0..PARAMS {
                jtj[i][j] = columns[i].iter().zip(&columns[j]).map(|(a, b)| a * b).sum();
            }
            gradient[i] = columns[i].iter().zip(&base).map(|(a, r)| a * r).sum();
        }
        Some((jtj, gradient))
    }
}

/// Gaussian elimination with partial pivoting.
fn solve_linear<const N: usize>(mut a: [[f64; N]; N], mut b: [f64; N]) -> Option<[f64; N]> {
    for col in 0..N {
        let pivot = (col..N).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-15 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..N {
            let factor = a[row][col] / a[col][col];
            for k in col..N {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = [0.0; N];
    for row in (0..N).rev() {
        let tail: f64 = (row + 1..N).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::grid::generate_grid;

    fn nominal() -> [Point3; 4] {
        [
            Point3::new(0.0, 2000.0, 0.0),
            Point3::new(3000.0, 2000.0, 0.0),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(3000.0, 0.0, 0.0),
        ]
    }

    fn synthetic(anchors: [Point3; 4], noise: impl Fn(usize, usize) -> f64) -> Vec<CalibrationDatum> {
        generate_grid(3000.0, 2000.0, 500.0, 7, 5)
            .into_iter()
            .enumerate()
            .map(|(k, target)| {
                let sled = Point3::new(target[0] + 1500.0, target[1] + 1000.0, 0.0);
                let mut lengths = [0.0; 4];
                for i in 0..4 {
                    lengths[i] = anchors[i].distance_to(&sled) + noise(k, i);
                }
                CalibrationDatum { waypoint: k, target, lengths }
            })
            .collect()
    }

    #[test]
    fn baseline_relation_recovers_the_span() {
        // Anchors at (0, 0) and (0, 1800); stations on the line x = 700.
        let upper = Point3::new(0.0, 1800.0, 0.0);
        let lower = Point3::new(0.0, 0.0, 0.0);
        let s1 = Point3::new(700.0, 400.0, 0.0);
        let s2 = Point3::new(700.0, 650.0, 0.0);
        let a = compute_vertical(
            upper.distance_to(&s1),
            lower.distance_to(&s1),
            upper.distance_to(&s2),
            lower.distance_to(&s2),
        )
        .unwrap();
        assert!((a - 1800.0).abs() < 1e-6);
        // Mirror-symmetric stations carry no information.
        let s3 = Point3::new(700.0, 1400.0, 0.0);
        assert!(compute_vertical(
            upper.distance_to(&s1),
            lower.distance_to(&s1),
            upper.distance_to(&s3),
            lower.distance_to(&s3),
        )
        .is_none());
    }

    #[test]
    fn exact_lengths_recover_skewed_anchors() {
        let truth = [
            Point3::new(-8.0, 2012.0, 0.0),
            Point3::new(3006.0, 1994.0, 0.0),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(3004.0, 0.0, 0.0),
        ];
        let data = synthetic(truth, |_, _| 0.0);
        let fit = solve_anchors(&data, nominal()).unwrap();
        assert!(fit.fit_error < 1e-3, "fit error {}", fit.fit_error);
        for (fitted, expected) in fit.anchors.iter().zip(truth.iter()) {
            assert!(fitted.distance_to(expected) < 0.01, "{:?} vs {:?}", fitted, expected);
        }
    }

    #[test]
    fn inconsistent_lengths_give_a_large_fit_error() {
        let data = synthetic(nominal(), |k, i| (((k * 7 + i * 3) % 5) as f64 - 2.0) * 8.0);
        let fit = solve_anchors(&data, nominal()).unwrap();
        assert!(fit.fit_error > 2.0, "fit error {}", fit.fit_error);
    }

    #[test]
    fn too_few_points_is_an_error() {
        let data = synthetic(nominal(), |_, _| 0.0);
        assert_eq!(
            solve_anchors(&data[..2], nominal()),
            Err(SolveError::NotEnoughData { needed: 3, got: 2 })
        );
    }

    #[test]
    fn linear_solver_handles_pivoting() {
        let a = [[0.0, 2.0], [3.0, 1.0]];
        let x = solve_linear(a, [4.0, 5.0]).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 2.0).abs() < 1e-12);
        assert!(solve_linear([[1.0, 2.0], [2.0, 4.0]], [1.0, 2.0]).is_none());
    }
}
