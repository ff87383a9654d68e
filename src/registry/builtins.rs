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

//! Native math functions and their derivatives, prepended to every program.
//!
//! The derivatives are ordinary source so the engine can differentiate them
//! again for higher orders and Hessians.

/// Names of the natives declared in [`PRELUDE`].
pub const MATH_FUNCTIONS: &[&str] = &[
    "sin", "cos", "tan", "exp", "log", "sqrt", "pow", "abs", "tanh", "sinh", "cosh", "atan",
    "floor",
];

pub const PRELUDE: &str = r#"
extern fn sin(x: f64) -> f64;
extern fn cos(x: f64) -> f64;
extern fn tan(x: f64) -> f64;
extern fn exp(x: f64) -> f64;
extern fn log(x: f64) -> f64;
extern fn sqrt(x: f64) -> f64;
extern fn pow(x: f64, y: f64) -> f64;
extern fn abs(x: f64) -> f64;
extern fn tanh(x: f64) -> f64;
extern fn sinh(x: f64) -> f64;
extern fn cosh(x: f64) -> f64;
extern fn atan(x: f64) -> f64;
extern fn floor(x: f64) -> f64;

namespace custom_derivatives {
    fn sin_pushforward(x: f64, _d_x: f64) -> f64 {
        return cos(x) * _d_x;
    }
    fn sin_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x += cos(x) * _d_y;
    }

    fn cos_pushforward(x: f64, _d_x: f64) -> f64 {
        return -sin(x) * _d_x;
    }
    fn cos_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x -= sin(x) * _d_y;
    }

    fn tan_pushforward(x: f64, _d_x: f64) -> f64 {
        return _d_x / (cos(x) * cos(x));
    }
    fn tan_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x += _d_y / (cos(x) * cos(x));
    }

    fn exp_pushforward(x: f64, _d_x: f64) -> f64 {
        return exp(x) * _d_x;
    }
    fn exp_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x += exp(x) * _d_y;
    }

    fn log_pushforward(x: f64, _d_x: f64) -> f64 {
        return _d_x / x;
    }
    fn log_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x += _d_y / x;
    }

    fn sqrt_pushforward(x: f64, _d_x: f64) -> f64 {
        return 0.5 * _d_x / sqrt(x);
    }
    fn sqrt_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x += 0.5 * _d_y / sqrt(x);
    }

    // d/dy x^y = x^y ln x only exists for x > 0.
    fn pow_pushforward(x: f64, y: f64, _d_x: f64, _d_y: f64) -> f64 {
        let d: f64 = y * pow(x, y - 1.0) * _d_x;
        if (x > 0.0) {
            d += pow(x, y) * log(x) * _d_y;
        }
        return d;
    }
    fn pow_pullback(x: f64, y: f64, _d_ret: f64, _d_x: &f64, _d_y: &f64) {
        _d_x += y * pow(x, y - 1.0) * _d_ret;
        if (x > 0.0) {
            _d_y += pow(x, y) * log(x) * _d_ret;
        }
    }

    fn abs_pushforward(x: f64, _d_x: f64) -> f64 {
        if (x < 0.0) {
            return -_d_x;
        }
        return _d_x;
    }
    fn abs_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        if (x < 0.0) {
            _d_x -= _d_y;
        } else {
            _d_x += _d_y;
        }
    }

    fn tanh_pushforward(x: f64, _d_x: f64) -> f64 {
        return (1.0 - tanh(x) * tanh(x)) * _d_x;
    }
    fn tanh_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x += (1.0 - tanh(x) * tanh(x)) * _d_y;
    }

    fn sinh_pushforward(x: f64, _d_x: f64) -> f64 {
        return cosh(x) * _d_x;
    }
    fn sinh_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x += cosh(x) * _d_y;
    }

    fn cosh_pushforward(x: f64, _d_x: f64) -> f64 {
        return sinh(x) * _d_x;
    }
    fn cosh_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x += sinh(x) * _d_y;
    }

    fn atan_pushforward(x: f64, _d_x: f64) -> f64 {
        return _d_x / (1.0 + x * x);
    }
    fn atan_pullback(x: f64, _d_y: f64, _d_x: &f64) {
        _d_x += _d_y / (1.0 + x * x);
    }

    fn floor_pushforward(x: f64, _d_x: f64) -> f64 {
        return 0.0;
    }
    fn floor_pullback(x: f64, _d_y: f64, _d_x: &f64) {
    }
}
"#;
