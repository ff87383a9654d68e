// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the adsynth project (automatic differentiation by source transformation).

//! Five-point central differences.
//!
//! `f'(x) ≈ (f(x-2h) - 8f(x-h) + 8f(x+h) - f(x+2h)) / 12h`
//!
//! The step balances the O(h^4) truncation error against rounding:
//! `h = ε^(1/5) · max(|x|, 1)`, then snapped so that `x + h` is exact.
//! Estimates carry a truncation term from comparing steps `h` and `2h`
//! (Richardson: `|D(h) - D(2h)| / 15`) and a rounding term bounding the
//! cancellation in the numerator.

/// One derivative approximation with its error bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub derivative: f64,
    pub step: f64,
    pub truncation: f64,
    pub rounding: f64,
}

impl Estimate {
    pub fn error(&self) -> f64 {
        self.truncation + self.rounding
    }
}

pub fn step_size(x: f64) -> f64 {
    let h = f64::EPSILON.powf(0.2) * x.abs().max(1.0);
    // Snap to a step whose sum with x is representable exactly.
    let shifted = x + h;
    let snapped = shifted - x;
    if snapped > 0.0 {
        snapped
    } else {
        h
    }
}

fn stencil(samples: [f64; 4], h: f64) -> f64 {
    let [m2, m1, p1, p2] = samples;
    (m2 - 8.0 * m1 + 8.0 * p1 - p2) / (12.0 * h)
}

/// Derivative of `f` at `x`. `f` is fallible so callers can evaluate
/// through an interpreter.
pub fn five_point<E>(mut f: impl FnMut(f64) -> Result<f64, E>, x: f64) -> Result<Estimate, E> {
    let h = step_size(x);
    let near = [f(x - 2.0 * h)?, f(x - h)?, f(x + h)?, f(x + 2.0 * h)?];
    let derivative = stencil(near, h);

    let far = [f(x - 4.0 * h)?, near[0], near[3], f(x + 4.0 * h)?];
    let coarse = stencil(far, 2.0 * h);

    let truncation = (derivative - coarse).abs() / 15.0;
    let magnitude = near[0].abs() + 8.0 * near[1].abs() + 8.0 * near[2].abs() + near[3].abs();
    let rounding = f64::EPSILON * magnitude / (12.0 * h);
    Ok(Estimate {
        derivative,
        step: h,
        truncation,
        rounding,
    })
}

/// Partial derivative of a function of several variables w.r.t. `args[k]`.
pub fn partial<E>(
    mut f: impl FnMut(&[f64]) -> Result<f64, E>,
    args: &[f64],
    k: usize,
) -> Result<Estimate, E> {
    let mut point = args.to_vec();
    five_point(
        |xk| {
            point[k] = xk;
            f(&point)
        },
        args[k],
    )
}

pub fn gradient<E>(
    mut f: impl FnMut(&[f64]) -> Result<f64, E>,
    args: &[f64],
) -> Result<Vec<Estimate>, E> {
    (0..args.len()).map(|k| partial(&mut f, args, k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::convert::Infallible;

    #[test]
    fn quartics_are_exact_up_to_rounding() {
        let est = five_point(|x| Ok::<_, Infallible>(x * x * x), 2.0).expect("infallible");
        assert_abs_diff_eq!(est.derivative, 12.0, epsilon = 1e-9);
        assert!(est.truncation < 1e-8);
    }

    #[test]
    fn error_bound_covers_actual_error() {
        let est = five_point(|x: f64| Ok::<_, Infallible>(x.sin()), 1.0).expect("infallible");
        let actual = (est.derivative - 1.0f64.cos()).abs();
        assert!(actual < 1e-10, "actual error {actual}");
        assert!(est.error() > 0.0 && est.error() < 1e-8);
    }

    #[test]
    fn partials_of_a_product() {
        let grad = gradient(|v: &[f64]| Ok::<_, Infallible>(v[0] * v[1] * v[1]), &[3.0, 2.0])
            .expect("infallible");
        assert_abs_diff_eq!(grad[0].derivative, 4.0, epsilon = 1e-8);
        assert_abs_diff_eq!(grad[1].derivative, 12.0, epsilon = 1e-8);
    }
}
