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

use std::collections::HashMap;
use std::sync::Arc;

/// Implementation of an `extern fn` taking and returning `f64`s.
pub type NativeFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

pub type Natives = HashMap<String, NativeFn>;

fn unary(f: fn(f64) -> f64) -> NativeFn {
    Arc::new(move |args: &[f64]| f(args[0]))
}

/// Natives backing the math prelude.
pub fn standard() -> Natives {
    let mut natives: Natives = HashMap::new();
    let table: [(&str, fn(f64) -> f64); 12] = [
        ("sin", f64::sin),
        ("cos", f64::cos),
        ("tan", f64::tan),
        ("exp", f64::exp),
        ("log", f64::ln),
        ("sqrt", f64::sqrt),
        ("abs", f64::abs),
        ("tanh", f64::tanh),
        ("sinh", f64::sinh),
        ("cosh", f64::cosh),
        ("atan", f64::atan),
        ("floor", f64::floor),
    ];
    for (name, f) in table {
        natives.insert(name.to_string(), unary(f));
    }
    natives.insert(
        "pow".to_string(),
        Arc::new(|args: &[f64]| args[0].powf(args[1])),
    );
    natives
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::builtins::MATH_FUNCTIONS;

    #[test]
    fn covers_the_prelude() {
        let natives = standard();
        for name in MATH_FUNCTIONS {
            assert!(natives.contains_key(*name), "{name}");
        }
        assert_eq!(natives["pow"](&[2.0, 10.0]), 1024.0);
    }
}
