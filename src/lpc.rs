// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Linear prediction analysis
//!
//! Coefficients are found in four stages, each of which
//! is a data-parallel kernel over every (frame, channel, window):
//!
//! 1. samples are multiplied by an analysis [`Window`]
//! 2. the windowed signal is [autocorrelated](autocorrelate)
//! 3. [Levinson-Durbin recursion](levinson_durbin) yields
//!    floating point coefficients and prediction error for every order
//! 4. coefficients of the most promising orders are [quantized](quantize)
//!
//! after which the integer [residual] is computed without
//! any floating point arithmetic.

use arrayvec::ArrayVec;
use std::f64::consts::PI;

/// Largest supported LPC order
pub const MAX_LPC_ORDER: usize = 32;

/// Largest coefficient precision the 4-bit field can hold
pub const MAX_PRECISION: u32 = 15;

/// Largest coefficient shift
pub const MAX_SHIFT: u32 = 15;

/// An analysis window function
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Window {
    /// Parabolic window
    Welch = 0,
    /// Flat top window
    Flattop = 1,
    /// Tapered cosine window, with half its length tapered
    Tukey = 2,
    /// Raised cosine window
    Hann = 3,
    /// Triangular window
    Bartlett = 4,
}

impl Window {
    const ALL: [Window; 5] = [
        Window::Welch,
        Window::Flattop,
        Window::Tukey,
        Window::Hann,
        Window::Bartlett,
    ];

    /// Fills `window` with this function's coefficients
    /// over its whole length
    pub fn generate(self, window: &mut [f32]) {
        let len = window.len();
        if len < 2 {
            window.fill(1.0);
            return;
        }
        let n = (len - 1) as f64;
        let half = n / 2.0;

        match self {
            Self::Welch => window.iter_mut().enumerate().for_each(|(i, w)| {
                let x = (i as f64 - half) / half;
                *w = (1.0 - x * x) as f32;
            }),
            Self::Flattop => window.iter_mut().enumerate().for_each(|(i, w)| {
                let x = 2.0 * PI * i as f64 / n;
                *w = (1.0 - 1.93 * x.cos() + 1.29 * (2.0 * x).cos() - 0.388 * (3.0 * x).cos()
                    + 0.028 * (4.0 * x).cos()) as f32;
            }),
            Self::Tukey => {
                window.fill(1.0);
                // half the window is tapered, a quarter at each end
                let taper = (0.25 * len as f64) as usize;
                if taper > 1 {
                    let np = (taper - 1) as f64;
                    for i in 0..taper {
                        window[i] = (0.5 - 0.5 * (PI * i as f64 / np).cos()) as f32;
                        window[len - taper + i] =
                            (0.5 - 0.5 * (PI * (i as f64 + np) / np).cos()) as f32;
                    }
                }
            }
            Self::Hann => window.iter_mut().enumerate().for_each(|(i, w)| {
                *w = (0.5 - 0.5 * (2.0 * PI * i as f64 / n).cos()) as f32;
            }),
            Self::Bartlett => window.iter_mut().enumerate().for_each(|(i, w)| {
                *w = (1.0 - ((i as f64 - half) / half).abs()) as f32;
            }),
        }
    }
}

/// A set of analysis windows
///
/// Windows are always evaluated in the same order,
/// regardless of the order they were added in.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Windows(u8);

impl Windows {
    /// A set with the given window added
    pub fn with(self, window: Window) -> Self {
        Self(self.0 | (1 << window as u8))
    }

    /// Whether the set contains the given window
    pub fn contains(self, window: Window) -> bool {
        self.0 & (1 << window as u8) != 0
    }

    /// Number of windows in the set
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Whether the set is empty
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over windows in evaluation order
    pub fn iter(self) -> impl Iterator<Item = Window> {
        Window::ALL.into_iter().filter(move |w| self.contains(*w))
    }
}

impl From<Window> for Windows {
    fn from(window: Window) -> Self {
        Self::default().with(window)
    }
}

impl FromIterator<Window> for Windows {
    fn from_iter<I: IntoIterator<Item = Window>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), Self::with)
    }
}

/// Multiplies integer samples by a window
pub fn apply_window(samples: &[i32], window: &[f32], windowed: &mut [f32]) {
    windowed
        .iter_mut()
        .zip(samples.iter().zip(window))
        .for_each(|(o, (s, w))| *o = *s as f32 * w);
}

/// Computes autocorrelation for lags `0..autoc.len()`
///
/// Products are accumulated in `f64` in sample order,
/// so results are identical from run to run.
pub fn autocorrelate(windowed: &[f32], autoc: &mut [f64]) {
    autoc.iter_mut().enumerate().for_each(|(lag, a)| {
        *a = windowed
            .get(lag..)
            .unwrap_or_default()
            .iter()
            .zip(windowed)
            .map(|(x, y)| f64::from(*x) * f64::from(*y))
            .sum();
    });
}

/// Computes predictor coefficients for every order from 1 to `max_order`
///
/// `autoc` must hold at least `max_order + 1` lags.
/// The coefficients of order `o` are stored in
/// `coefficients[(o - 1) * max_order..][..o]`
/// and the order's prediction error in `errors[o - 1]`.
///
/// Once the prediction error reaches zero, higher orders
/// repeat the last usable coefficients with zero error.
pub fn levinson_durbin(
    autoc: &[f64],
    max_order: usize,
    coefficients: &mut [f64],
    errors: &mut [f64],
) {
    let mut lpc = [0.0; MAX_LPC_ORDER];
    let mut err = autoc[0];

    for i in 0..max_order {
        let row = &mut coefficients[i * max_order..(i + 1) * max_order];
        row.fill(0.0);

        if err.is_nan() || err <= 0.0 {
            negate(&lpc[..i], row);
            errors[i] = 0.0;
            continue;
        }

        let mut r = -autoc[i + 1];
        for j in 0..i {
            r -= lpc[j] * autoc[i - j];
        }
        r /= err;

        lpc[i] = r;
        for j in 0..i / 2 {
            let tmp = lpc[j];
            lpc[j] += r * lpc[i - 1 - j];
            lpc[i - 1 - j] += r * tmp;
        }
        if i % 2 == 1 {
            lpc[i / 2] += lpc[i / 2] * r;
        }
        err *= 1.0 - r * r;

        // the filter's negated taps predict the next sample
        negate(&lpc[..=i], row);
        errors[i] = err.max(0.0);
    }
}

fn negate(filter: &[f64], coefficients: &mut [f64]) {
    coefficients
        .iter_mut()
        .zip(filter)
        .for_each(|(c, f)| *c = -f);
}

/// Base coefficient precision for a given block size
pub fn base_precision(block_size: usize) -> u32 {
    match block_size {
        0..=192 => 7,
        193..=384 => 8,
        385..=576 => 9,
        577..=1152 => 10,
        1153..=2304 => 11,
        2305..=4608 => 12,
        _ => 13,
    }
}

/// Estimated bits of a predictor from its prediction error
///
/// The residual is assumed Laplacian, costing half the
/// log₂ of its variance per sample, plus the warm-up samples
/// and coefficients stored in the subframe.
pub fn estimate_bits(
    error: f64,
    block_size: usize,
    order: usize,
    precision: u32,
    sample_bits: u32,
) -> f64 {
    let per_sample = (0.5 * (error / block_size as f64).log2()).max(0.0);
    per_sample * (block_size - order) as f64 + (order as u32 * (precision + sample_bits)) as f64
}

/// Returns the `count` orders with the lowest estimated bits,
/// preferring lower orders on ties
pub fn select_orders(
    errors: &[f64],
    block_size: usize,
    min_order: usize,
    max_order: usize,
    precision: u32,
    sample_bits: u32,
    count: usize,
) -> ArrayVec<usize, MAX_LPC_ORDER> {
    let mut orders = (min_order..=max_order.min(errors.len()))
        .map(|order| {
            (
                estimate_bits(errors[order - 1], block_size, order, precision, sample_bits),
                order,
            )
        })
        .collect::<ArrayVec<(f64, usize), MAX_LPC_ORDER>>();

    orders.sort_by(|(a, o1), (b, o2)| a.total_cmp(b).then(o1.cmp(o2)));
    orders.into_iter().take(count).map(|(_, order)| order).collect()
}

/// LPC coefficients quantized to integers
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QuantizedLpc {
    /// Integer coefficients, most recent sample first
    pub coefficients: ArrayVec<i32, MAX_LPC_ORDER>,
    /// Right shift applied to the dot product
    pub shift: u32,
    /// Signed width of the widest coefficient, in bits
    pub precision: u32,
}

/// Quantizes floating point coefficients to signed integers
/// of at most `precision` bits
///
/// The largest shift in `0..=15` keeping every coefficient
/// in range is chosen, and rounding error is carried
/// from each coefficient to the next.
/// Non-finite coefficients quantize to 0.
pub fn quantize(coefficients: &[f64], precision: u32) -> QuantizedLpc {
    debug_assert!((2..=MAX_PRECISION).contains(&precision));
    let qmax = (1i64 << (precision - 1)) - 1;
    let cmax = coefficients
        .iter()
        .filter(|c| c.is_finite())
        .fold(0.0f64, |m, c| m.max(c.abs()));

    let mut shift = MAX_SHIFT;
    while shift > 0 && cmax * f64::from(1u32 << shift) > qmax as f64 {
        shift -= 1;
    }
    let scale = match f64::from(1u32 << shift) {
        scale if cmax * scale > qmax as f64 => qmax as f64 / cmax,
        scale => scale,
    };

    let mut error = 0.0;
    let coefficients = coefficients
        .iter()
        .map(|c| {
            if c.is_finite() {
                error += c * scale;
            }
            // float to int casts saturate
            let q = (error.round() as i64).clamp(-qmax, qmax);
            error -= q as f64;
            q as i32
        })
        .collect::<ArrayVec<i32, MAX_LPC_ORDER>>();

    QuantizedLpc {
        precision: coefficients
            .iter()
            .map(|c| signed_bits(*c))
            .max()
            .unwrap_or(1),
        coefficients,
        shift,
    }
}

/// Bits needed to store the value as signed two's complement
#[inline]
pub fn signed_bits(value: i32) -> u32 {
    match value {
        0.. => 33 - value.leading_zeros(),
        _ => 33 - (!value).leading_zeros(),
    }
}

/// Computes the integer residual of samples
///
/// The first `coefficients.len()` residual positions
/// hold the warm-up samples unchanged.
/// Returns `false` if any residual does not fit in 32 bits.
pub fn residual(samples: &[i32], coefficients: &[i32], shift: u32, residual: &mut [i32]) -> bool {
    let order = coefficients.len();
    residual[..order].copy_from_slice(&samples[..order]);

    samples
        .windows(order + 1)
        .zip(&mut residual[order..])
        .all(|(window, r)| {
            let (sample, history) = window.split_last().unwrap_or((&0, &[]));
            let prediction = coefficients
                .iter()
                .zip(history.iter().rev())
                .map(|(c, s)| i64::from(*c) * i64::from(*s))
                .sum::<i64>();
            match i32::try_from(i64::from(*sample) - (prediction >> shift)) {
                Ok(value) => {
                    *r = value;
                    true
                }
                Err(_) => false,
            }
        })
}

/// Restores samples in place from warm-up samples and residuals
///
/// Returns `false` if any restored sample does not fit in 32 bits.
pub fn restore(coefficients: &[i32], shift: u32, samples: &mut [i32]) -> bool {
    let order = coefficients.len();
    (order..samples.len()).all(|i| {
        let prediction = coefficients
            .iter()
            .zip(samples[i - order..i].iter().rev())
            .map(|(c, s)| i64::from(*c) * i64::from(*s))
            .sum::<i64>();
        match i32::try_from(i64::from(samples[i]) + (prediction >> shift)) {
            Ok(value) => {
                samples[i] = value;
                true
            }
            Err(_) => false,
        }
    })
}
