// Copyright 2025 Plagio Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Jaccard / containment scoring over shingle sets.

#[inline]
pub fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Jaccard and containment for an intersection of size `inter` between a
/// query of `q` unique shingles and a document of `t` shingle positions.
#[inline]
pub fn jc_compute(inter: i64, q: i64, t: i64) -> (f64, f64) {
    if inter <= 0 || q <= 0 || t <= 0 {
        return (0.0, 0.0);
    }
    let uni = q + t - inter;
    let j = if uni > 0 { inter as f64 / uni as f64 } else { 0.0 };
    let c = inter as f64 / q as f64;
    (j, c)
}

/// Combined score: `w9 * (alpha * J + (1 - alpha) * C)`.
#[inline]
pub fn combine(j: f64, c: f64, alpha: f64, w9: f64) -> f64 {
    clamp01(w9) * (clamp01(alpha) * j + (1.0 - clamp01(alpha)) * c)
}
