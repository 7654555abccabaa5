//! Coherent point drift (CPD) deformable registration.
//!
//! A landmark-free alternative to warp-and-project: the moving cloud is
//! treated as the centroids of a Gaussian mixture that is fitted to the fixed
//! cloud by expectation maximization, with a Gaussian-kernel motion field
//! regularizing the displacement. Output point `i` is where moving point `i`
//! ends up, so the result is sized and ordered like the moving cloud.
//!
//! Both clouds are scaled so the moving cloud's largest bounding-box extent
//! equals [`DeformableParams::normalized_extent`] before registration, which
//! makes `alpha` and `beta` independent of the input units; the scaling is
//! undone on the result.
//!
//! Memory and time grow with the square (kernel matrix) and cube (the
//! per-iteration solve) of the moving point count. Decimate large clouds
//! first.

use std::time::Duration;

use nalgebra::{DMatrix, Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, info, trace, warn};

use crate::error::{CorrespondError, CorrespondResult};
use crate::progress::{CancelToken, StopCondition};
use crate::tracing_ext::OperationTimer;
use crate::types::bounds_of;

/// Parameters for deformable registration.
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct DeformableParams {
    /// Iteration cap. Default: 100
    pub max_iterations: usize,

    /// Stop when the variance changes by no more than this. Default: 1e-3
    pub tolerance: f64,

    /// Motion regularization weight (higher = smoother, stiffer). Default: 2.0
    pub alpha: f64,

    /// Gaussian kernel width of the motion field, in normalized units. Default: 2.0
    pub beta: f64,

    /// Weight of the uniform outlier component, in [0, 1). Default: 0.0
    pub outlier_weight: f64,

    /// Largest bounding-box extent after normalization. Default: 25.0
    pub normalized_extent: f64,

    /// Give up once this much wall-clock time has passed.
    #[cfg_attr(feature = "pipeline-config", serde(default))]
    pub deadline: Option<Duration>,

    /// External cancellation flag.
    #[cfg_attr(feature = "pipeline-config", serde(skip))]
    pub cancel: Option<CancelToken>,
}

impl Default for DeformableParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-3,
            alpha: 2.0,
            beta: 2.0,
            outlier_weight: 0.0,
            normalized_extent: 25.0,
            deadline: None,
            cancel: None,
        }
    }
}

impl DeformableParams {
    /// Create default params.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the variance-change tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Set the regularization weights.
    pub fn with_regularization(mut self, alpha: f64, beta: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }

    /// Set the outlier weight.
    pub fn with_outlier_weight(mut self, weight: f64) -> Self {
        self.outlier_weight = weight;
        self
    }

    /// Stop after `deadline` of wall-clock time.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Stop when `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Check parameter ranges.
    pub fn validate(&self) -> CorrespondResult<()> {
        if self.max_iterations == 0 {
            return Err(CorrespondError::invalid_parameter(
                "max_iterations",
                "must be at least 1",
            ));
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(CorrespondError::invalid_parameter(
                "tolerance",
                format!("{} is not a finite, non-negative value", self.tolerance),
            ));
        }
        for (name, value) in [
            ("alpha", self.alpha),
            ("beta", self.beta),
            ("normalized_extent", self.normalized_extent),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(CorrespondError::invalid_parameter(
                    name,
                    format!("{} is not a finite, positive value", value),
                ));
            }
        }
        if !(0.0..1.0).contains(&self.outlier_weight) {
            return Err(CorrespondError::invalid_parameter(
                "outlier_weight",
                format!("{} is outside [0, 1)", self.outlier_weight),
            ));
        }
        Ok(())
    }
}

/// Result of a deformable registration.
#[derive(Debug, Clone)]
pub struct DeformableResult {
    /// Deformed moving points, in input units and order.
    pub positions: Vec<Point3<f64>>,

    /// Number of EM iterations performed.
    pub iterations: usize,

    /// Whether the variance change fell below tolerance.
    pub converged: bool,

    /// Final mixture variance, in input units squared.
    pub sigma2: f64,
}

/// Deform `moving` onto the distribution of `fixed`.
///
/// Non-convergence is not an error: the best-effort result is returned with
/// `converged == false` and a warning is logged.
///
/// # Errors
///
/// - [`CorrespondError::EmptyMesh`] if either cloud is empty
/// - [`CorrespondError::InvalidParameter`] for out-of-range parameters
/// - [`CorrespondError::RegistrationCancelled`] on cancellation or deadline
/// - [`CorrespondError::SingularSystem`] if the motion-field solve fails
pub fn register_deformable(
    fixed: &[Point3<f64>],
    moving: &[Point3<f64>],
    params: &DeformableParams,
) -> CorrespondResult<DeformableResult> {
    if fixed.is_empty() || moving.is_empty() {
        return Err(CorrespondError::empty_mesh(format!(
            "deformable registration needs points on both sides ({} fixed, {} moving)",
            fixed.len(),
            moving.len()
        )));
    }
    params.validate()?;
    let _timer = OperationTimer::with_context("register_deformable", fixed.len(), moving.len());
    let stop = StopCondition::new(params.deadline, params.cancel.clone());

    let scale = normalization_scale(moving, params.normalized_extent);
    let x: Vec<Vector3<f64>> = fixed.iter().map(|p| p.coords * scale).collect();
    let y: Vec<Vector3<f64>> = moving.iter().map(|p| p.coords * scale).collect();
    let (n, m) = (x.len(), y.len());

    let g = gaussian_kernel(&y, params.beta);
    let mut ty = y.clone();
    let mut sigma2 = initial_variance(&x, &y);
    let mut diff = f64::INFINITY;
    let mut iterations = 0;

    debug!(
        fixed = n,
        moving = m,
        scale = scale,
        sigma2 = sigma2,
        "Starting deformable registration"
    );

    while iterations < params.max_iterations && diff > params.tolerance {
        if let Some(reason) = stop.check() {
            return Err(CorrespondError::RegistrationCancelled {
                iterations,
                reason,
            });
        }

        let estep = expectation(&x, &ty, sigma2, params.outlier_weight);

        // (diag(P1) G + α σ² I) W = PX - diag(P1) Y
        let mut a = DMatrix::<f64>::zeros(m, m);
        let mut b = DMatrix::<f64>::zeros(m, 3);
        for i in 0..m {
            let p1 = estep.p1[i];
            for j in 0..m {
                a[(i, j)] = p1 * g[(i, j)];
            }
            a[(i, i)] += params.alpha * sigma2;
            let rhs = estep.px[i] - y[i] * p1;
            for d in 0..3 {
                b[(i, d)] = rhs[d];
            }
        }
        let w = a.lu().solve(&b).ok_or_else(|| CorrespondError::SingularSystem {
            details: format!("motion-field system singular at iteration {}", iterations + 1),
        })?;

        let gw = &g * &w;
        for (i, p) in ty.iter_mut().enumerate() {
            *p = y[i] + Vector3::new(gw[(i, 0)], gw[(i, 1)], gw[(i, 2)]);
        }

        let previous = sigma2;
        let y_py: f64 = ty
            .iter()
            .zip(&estep.p1)
            .map(|(t, p1)| p1 * t.norm_squared())
            .sum();
        let tr_pxy: f64 = ty.iter().zip(&estep.px).map(|(t, px)| t.dot(px)).sum();
        let np: f64 = estep.p1.iter().sum();
        sigma2 = (estep.x_px - 2.0 * tr_pxy + y_py) / (np * 3.0);
        if sigma2.is_nan() || sigma2 <= 0.0 {
            sigma2 = params.tolerance / 10.0;
        }
        diff = (sigma2 - previous).abs();
        iterations += 1;

        trace!(iteration = iterations, sigma2 = sigma2, change = diff, "CPD iteration");
    }

    let converged = diff <= params.tolerance;
    if !converged {
        warn!(
            iterations = iterations,
            change = diff,
            tolerance = params.tolerance,
            "Deformable registration did not converge, returning best effort"
        );
    }
    info!(
        iterations = iterations,
        converged = converged,
        "Deformable registration complete"
    );

    Ok(DeformableResult {
        positions: ty.iter().map(|p| Point3::from(p / scale)).collect(),
        iterations,
        converged,
        sigma2: sigma2 / (scale * scale),
    })
}

/// Scale factor mapping the cloud's largest extent onto `extent`.
fn normalization_scale(points: &[Point3<f64>], extent: f64) -> f64 {
    let size = bounds_of(points)
        .map(|(min, max)| (max - min).max())
        .unwrap_or(0.0);
    if size > f64::EPSILON { extent / size } else { 1.0 }
}

fn gaussian_kernel(y: &[Vector3<f64>], beta: f64) -> DMatrix<f64> {
    let m = y.len();
    let denom = 2.0 * beta * beta;
    DMatrix::from_fn(m, m, |i, j| (-(y[i] - y[j]).norm_squared() / denom).exp())
}

/// Mean squared distance over all fixed/moving pairs, divided by the dimension.
fn initial_variance(x: &[Vector3<f64>], y: &[Vector3<f64>]) -> f64 {
    let (n, m) = (x.len() as f64, y.len() as f64);
    let sum_x: Vector3<f64> = x.iter().sum();
    let sum_y: Vector3<f64> = y.iter().sum();
    let sq_x: f64 = x.iter().map(|v| v.norm_squared()).sum();
    let sq_y: f64 = y.iter().map(|v| v.norm_squared()).sum();
    let total = m * sq_x + n * sq_y - 2.0 * sum_x.dot(&sum_y);
    let sigma2 = total / (3.0 * m * n);
    if sigma2 > 0.0 { sigma2 } else { 1.0 }
}

/// Posterior sufficient statistics, accumulated without storing the full
/// correspondence matrix.
struct EStep {
    /// Row sums of P (per moving point).
    p1: Vec<f64>,
    /// P·X (per moving point).
    px: Vec<Vector3<f64>>,
    /// Σ_n (column sum of P)_n |x_n|².
    x_px: f64,
}

impl EStep {
    fn zeros(m: usize) -> Self {
        Self {
            p1: vec![0.0; m],
            px: vec![Vector3::zeros(); m],
            x_px: 0.0,
        }
    }

    fn merge(mut self, other: EStep) -> Self {
        for (a, b) in self.p1.iter_mut().zip(other.p1) {
            *a += b;
        }
        for (a, b) in self.px.iter_mut().zip(other.px) {
            *a += b;
        }
        self.x_px += other.x_px;
        self
    }
}

fn expectation(x: &[Vector3<f64>], ty: &[Vector3<f64>], sigma2: f64, w: f64) -> EStep {
    let (n, m) = (x.len() as f64, ty.len());
    let uniform = (2.0 * std::f64::consts::PI * sigma2).powf(1.5) * w / (1.0 - w) * m as f64 / n;
    let denom = 2.0 * sigma2;

    x.par_iter()
        .fold(
            || EStep::zeros(m),
            |mut acc, xn| {
                let column: Vec<f64> = ty
                    .iter()
                    .map(|t| (-(xn - t).norm_squared() / denom).exp())
                    .collect();
                let mut total = column.iter().sum::<f64>() + uniform;
                if total == 0.0 {
                    total = f64::EPSILON;
                }
                let mut column_sum = 0.0;
                for (i, p) in column.into_iter().enumerate() {
                    let p = p / total;
                    acc.p1[i] += p;
                    acc.px[i] += xn * p;
                    column_sum += p;
                }
                acc.x_px += column_sum * xn.norm_squared();
                acc
            },
        )
        .reduce(|| EStep::zeros(m), EStep::merge)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bumpy_cloud() -> Vec<Point3<f64>> {
        let mut points = Vec::new();
        for j in 0..5 {
            for i in 0..5 {
                let (x, y) = (i as f64, j as f64);
                points.push(Point3::new(x, y, 0.4 * (x * 0.9).sin() + 0.2 * y));
            }
        }
        points
    }

    fn mean_error(a: &[Point3<f64>], b: &[Point3<f64>]) -> f64 {
        a.iter().zip(b).map(|(p, q)| (p - q).norm()).sum::<f64>() / a.len() as f64
    }

    #[test]
    fn test_identical_clouds_stay_put() {
        let cloud = bumpy_cloud();
        let result = register_deformable(&cloud, &cloud, &DeformableParams::default()).unwrap();
        assert_eq!(result.positions.len(), cloud.len());
        assert!(mean_error(&result.positions, &cloud) < 0.05);
    }

    #[test]
    fn test_moves_toward_shifted_cloud() {
        let moving = bumpy_cloud();
        let fixed: Vec<_> = moving
            .iter()
            .map(|p| p + Vector3::new(0.12, -0.08, 0.05))
            .collect();
        let before = mean_error(&moving, &fixed);
        let result = register_deformable(&fixed, &moving, &DeformableParams::default()).unwrap();
        let after = mean_error(&result.positions, &fixed);
        assert!(after < 0.5 * before, "before {} after {}", before, after);
    }

    #[test]
    fn test_output_sized_to_moving_cloud() {
        let moving = bumpy_cloud();
        let fixed: Vec<_> = moving.iter().step_by(2).copied().collect();
        let result = register_deformable(&fixed, &moving, &DeformableParams::default()).unwrap();
        assert_eq!(result.positions.len(), moving.len());
    }

    #[test]
    fn test_iteration_cap_reports_nonconvergence() {
        let moving = bumpy_cloud();
        let fixed: Vec<_> = moving.iter().map(|p| p + Vector3::new(0.5, 0.0, 0.0)).collect();
        let params = DeformableParams::default()
            .with_max_iterations(1)
            .with_tolerance(0.0);
        let result = register_deformable(&fixed, &moving, &params).unwrap();
        assert_eq!(result.iterations, 1);
        assert!(!result.converged);
    }

    #[test]
    fn test_cancelled_before_start() {
        let cloud = bumpy_cloud();
        let token = CancelToken::new();
        token.cancel();
        let params = DeformableParams::default().with_cancel_token(token);
        match register_deformable(&cloud, &cloud, &params) {
            Err(CorrespondError::RegistrationCancelled { iterations, .. }) => {
                assert_eq!(iterations, 0)
            }
            other => panic!("Expected RegistrationCancelled, got {:?}", other),
        }
    }

    #[test]
    fn test_deadline_exceeded() {
        let cloud = bumpy_cloud();
        let params = DeformableParams::default().with_deadline(Duration::ZERO);
        let err = register_deformable(&cloud, &cloud, &params).unwrap_err();
        assert!(err.to_string().contains("deadline"));
    }

    #[test]
    fn test_invalid_parameters() {
        let cloud = bumpy_cloud();
        let params = DeformableParams::default().with_regularization(0.0, 2.0);
        let err = register_deformable(&cloud, &cloud, &params).unwrap_err();
        assert!(matches!(
            err,
            CorrespondError::InvalidParameter { name: "alpha", .. }
        ));
        let err = register_deformable(&[], &cloud, &DeformableParams::default()).unwrap_err();
        assert!(matches!(err, CorrespondError::EmptyMesh { .. }));
    }
}
