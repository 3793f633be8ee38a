/// Runtime-selected arithmetic kernels
///
/// The lane width is detected once per process; every hot loop in the engine
/// goes through a `Kernel` value instead of testing CPU features itself.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use wide::f64x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kernel {
    Scalar,
    /// Four f64 lanes
    Wide4,
}

static DETECTED: Lazy<Kernel> = Lazy::new(detect);

fn detect() -> Kernel {
    if wide_lanes_available() {
        Kernel::Wide4
    } else {
        Kernel::Scalar
    }
}

#[cfg(target_arch = "x86_64")]
fn wide_lanes_available() -> bool {
    std::arch::is_x86_feature_detected!("avx2")
}

#[cfg(target_arch = "aarch64")]
fn wide_lanes_available() -> bool {
    std::arch::is_aarch64_feature_detected!("neon")
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn wide_lanes_available() -> bool {
    false
}

#[inline]
fn load(s: &[f64]) -> f64x4 {
    let mut arr = [0.0f64; 4];
    arr.copy_from_slice(&s[..4]);
    f64x4::from(arr)
}

#[inline]
fn horizontal_sum(v: f64x4) -> f64 {
    let arr: [f64; 4] = v.into();
    (arr[0] + arr[1]) + (arr[2] + arr[3])
}

impl Kernel {
    /// Kernel chosen for this process
    pub fn current() -> Kernel {
        *DETECTED
    }

    pub fn lanes(self) -> usize {
        match self {
            Kernel::Scalar => 1,
            Kernel::Wide4 => 4,
        }
    }

    /// Σ a_i b_i
    #[inline]
    pub fn dot(self, a: &[f64], b: &[f64]) -> f64 {
        let n = a.len().min(b.len());
        match self {
            Kernel::Scalar => a[..n].iter().zip(&b[..n]).map(|(x, y)| x * y).sum(),
            Kernel::Wide4 => {
                let mut acc = f64x4::splat(0.0);
                let mut k = 0;
                while k + 4 <= n {
                    acc += load(&a[k..]) * load(&b[k..]);
                    k += 4;
                }
                let mut sum = horizontal_sum(acc);
                while k < n {
                    sum += a[k] * b[k];
                    k += 1;
                }
                sum
            }
        }
    }

    /// (Σ θ v0, Σ θ v1, Σ θ v2) in one pass over θ
    #[inline]
    pub fn dot3(self, theta: &[f64], v0: &[f64], v1: &[f64], v2: &[f64]) -> (f64, f64, f64) {
        let n = theta.len();
        match self {
            Kernel::Scalar => {
                let (mut s0, mut s1, mut s2) = (0.0, 0.0, 0.0);
                for k in 0..n {
                    s0 += theta[k] * v0[k];
                    s1 += theta[k] * v1[k];
                    s2 += theta[k] * v2[k];
                }
                (s0, s1, s2)
            }
            Kernel::Wide4 => {
                let mut a0 = f64x4::splat(0.0);
                let mut a1 = f64x4::splat(0.0);
                let mut a2 = f64x4::splat(0.0);
                let mut k = 0;
                while k + 4 <= n {
                    let t = load(&theta[k..]);
                    a0 += t * load(&v0[k..]);
                    a1 += t * load(&v1[k..]);
                    a2 += t * load(&v2[k..]);
                    k += 4;
                }
                let (mut s0, mut s1, mut s2) = (horizontal_sum(a0), horizontal_sum(a1), horizontal_sum(a2));
                while k < n {
                    s0 += theta[k] * v0[k];
                    s1 += theta[k] * v1[k];
                    s2 += theta[k] * v2[k];
                    k += 1;
                }
                (s0, s1, s2)
            }
        }
    }

    /// out_i = a_i b_i
    #[inline]
    pub fn mul_into(self, out: &mut [f64], a: &[f64], b: &[f64]) {
        let n = out.len();
        let mut k = 0;
        if self == Kernel::Wide4 {
            while k + 4 <= n {
                let res: [f64; 4] = (load(&a[k..]) * load(&b[k..])).into();
                out[k..k + 4].copy_from_slice(&res);
                k += 4;
            }
        }
        while k < n {
            out[k] = a[k] * b[k];
            k += 1;
        }
    }

    /// max_i |a_i|
    #[inline]
    pub fn max_abs(self, a: &[f64]) -> f64 {
        let n = a.len();
        let mut k = 0;
        let mut best = 0.0f64;
        if self == Kernel::Wide4 {
            let mut acc = f64x4::splat(0.0);
            while k + 4 <= n {
                acc = acc.max(load(&a[k..]).abs());
                k += 4;
            }
            let arr: [f64; 4] = acc.into();
            best = arr.iter().copied().fold(best, f64::max);
        }
        while k < n {
            best = best.max(a[k].abs());
            k += 1;
        }
        best
    }

    /// a_i *= factor
    #[inline]
    pub fn scale(self, a: &mut [f64], factor: f64) {
        let n = a.len();
        let mut k = 0;
        if self == Kernel::Wide4 {
            let f = f64x4::splat(factor);
            while k + 4 <= n {
                let res: [f64; 4] = (load(&a[k..]) * f).into();
                a[k..k + 4].copy_from_slice(&res);
                k += 4;
            }
        }
        while k < n {
            a[k] *= factor;
            k += 1;
        }
    }
}
