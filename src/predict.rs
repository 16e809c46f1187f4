// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Subframe predictor evaluation and selection
//!
//! Every channel of every frame is given a list of candidate
//! [`SubframeTask`]s which compute kernels fill in with
//! estimated sizes. The cheapest candidate is then
//! [finalized](finalize) on the host with an exact
//! Rice partitioning, falling back to a verbatim subframe
//! whenever the predictor would cost more than raw samples.

use crate::lpc::{self, MAX_LPC_ORDER};
use crate::rice::{self, RicePlan};
use crate::stream::{ChannelAssignment, SubframeHeaderType};
use arrayvec::ArrayVec;

/// Residuals of the fixed predictors are those of
/// LPC predictors with these coefficients and no shift
pub const FIXED_COEFFICIENTS: [&[i32]; 5] = [&[], &[1], &[2, -1], &[3, -3, 1], &[4, -6, 4, -1]];

/// Largest fixed predictor order
pub const MAX_FIXED_ORDER: usize = 4;

/// The kind of a candidate subframe
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SubframeType {
    /// Raw samples
    #[default]
    Verbatim,
    /// A single repeated sample
    Constant,
    /// A fixed polynomial predictor
    Fixed,
    /// A quantized linear predictor
    Lpc,
}

/// A candidate subframe for one channel of one frame
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubframeTask {
    /// Candidate's kind
    pub kind: SubframeType,
    /// Analysis channel whose samples the candidate predicts
    pub channel: u8,
    /// Predictor order
    pub order: u8,
    /// Index of the analysis window, for LPC candidates
    pub window: u8,
    /// Precision search step, for LPC candidates
    pub search: u8,
    /// Signed width of the quantized coefficients
    pub precision: u8,
    /// Right shift of the coefficient dot product
    pub shift: u8,
    /// Quantized coefficients, most recent sample first
    pub coefficients: ArrayVec<i32, MAX_LPC_ORDER>,
    /// Estimated size, in bits
    pub bits: u64,
}

impl SubframeTask {
    /// Size of a candidate which cannot be used
    pub const INVALID: u64 = u64::MAX;

    /// A constant candidate template
    pub fn constant(channel: u8) -> Self {
        Self {
            kind: SubframeType::Constant,
            channel,
            bits: Self::INVALID,
            ..Self::default()
        }
    }

    /// A fixed predictor candidate template
    pub fn fixed(channel: u8, order: u8) -> Self {
        Self {
            kind: SubframeType::Fixed,
            channel,
            order,
            bits: Self::INVALID,
            ..Self::default()
        }
    }

    /// An LPC candidate template, whose order and coefficients
    /// are filled in by quantization
    pub fn lpc(channel: u8, window: u8, search: u8) -> Self {
        Self {
            kind: SubframeType::Lpc,
            channel,
            window,
            search,
            bits: Self::INVALID,
            ..Self::default()
        }
    }

    /// A verbatim candidate of the given size
    pub fn verbatim(channel: u8, bits: u64) -> Self {
        Self {
            kind: SubframeType::Verbatim,
            channel,
            bits,
            ..Self::default()
        }
    }

    /// Whether the candidate has a usable estimate
    pub fn is_valid(&self) -> bool {
        self.bits != Self::INVALID
    }
}

/// Whether every sample in the block is identical
pub fn is_constant(samples: &[i32]) -> bool {
    match samples.split_first() {
        Some((first, rest)) => rest.iter().all(|s| s == first),
        None => false,
    }
}

/// Number of low bits which are zero in every sample
///
/// An all-zero block has no wasted bits.
pub fn wasted_bits(samples: &[i32]) -> u32 {
    match samples.iter().fold(0, |acc, s| acc | s) {
        0 => 0,
        bits => bits.trailing_zeros(),
    }
}

/// Whether predictors are worth evaluating at all
///
/// Blocks no longer than the longest predictor's warm-up
/// are stored verbatim, unless constant.
pub fn analysis_enabled(block_size: usize, max_lpc_order: usize) -> bool {
    block_size > MAX_FIXED_ORDER.max(max_lpc_order)
}

/// Bits of the subframe header, including wasted bits count
#[inline]
fn header_bits(wasted_bits: u32) -> u64 {
    8 + u64::from(wasted_bits)
}

/// Size of a verbatim subframe, in bits
pub fn verbatim_bits(block_size: usize, sample_bits: u32, wasted_bits: u32) -> u64 {
    header_bits(wasted_bits) + block_size as u64 * u64::from(sample_bits)
}

/// Computes a fixed predictor's residual
///
/// Returns `false` if any residual does not fit in 32 bits.
pub fn fixed_residual(samples: &[i32], order: usize, residual: &mut [i32]) -> bool {
    lpc::residual(samples, FIXED_COEFFICIENTS[order], 0, residual)
}

/// Fills in a candidate's estimated size, from the residual
/// sums alone, leaving it invalid if it cannot be used
///
/// `residual` is scratch space at least as long as `samples`.
pub fn estimate(
    task: &mut SubframeTask,
    samples: &[i32],
    sample_bits: u32,
    wasted_bits: u32,
    min_partition_order: u32,
    max_partition_order: u32,
    residual: &mut [i32],
) {
    let order = usize::from(task.order);
    let residual = &mut residual[..samples.len()];
    let header = header_bits(wasted_bits);

    task.bits = match task.kind {
        SubframeType::Verbatim => verbatim_bits(samples.len(), sample_bits, wasted_bits),
        SubframeType::Constant => match is_constant(samples) {
            true => header + u64::from(sample_bits),
            false => SubframeTask::INVALID,
        },
        SubframeType::Fixed => {
            if order <= MAX_FIXED_ORDER
                && order < samples.len()
                && fixed_residual(samples, order, residual)
            {
                header
                    + order as u64 * u64::from(sample_bits)
                    + rice::estimate(residual, order, min_partition_order, max_partition_order)
            } else {
                SubframeTask::INVALID
            }
        }
        SubframeType::Lpc => {
            if !task.coefficients.is_empty()
                && order < samples.len()
                && lpc::residual(samples, &task.coefficients, task.shift.into(), residual)
            {
                header
                    + order as u64 * u64::from(sample_bits + u32::from(task.precision))
                    + 4
                    + 5
                    + rice::estimate(residual, order, min_partition_order, max_partition_order)
            } else {
                SubframeTask::INVALID
            }
        }
    };
}

/// Picks the cheapest valid candidate
///
/// Earlier candidates win ties, and the verbatim candidate
/// is returned only if every other candidate costs more.
pub fn choose_best(tasks: &[SubframeTask], verbatim: SubframeTask) -> SubframeTask {
    let mut best: Option<&SubframeTask> = None;
    for task in tasks.iter().filter(|t| t.is_valid()) {
        if best.is_none_or(|best| task.bits < best.bits) {
            best = Some(task);
        }
    }
    match best {
        Some(best) if best.bits <= verbatim.bits => best.clone(),
        _ => verbatim,
    }
}

/// Stereo decorrelation modes, in order of preference,
/// with the analysis channels each stores
///
/// Analysis channels are left, right, mid and side.
pub const STEREO_MODES: [(ChannelAssignment, [usize; 2]); 4] = [
    (ChannelAssignment::Independent(2), [0, 1]),
    (ChannelAssignment::LeftSide, [0, 3]),
    (ChannelAssignment::SideRight, [3, 1]),
    (ChannelAssignment::MidSide, [2, 3]),
];

/// Picks the stereo mode whose two subframes are smallest,
/// given the best candidate of each analysis channel
pub fn choose_stereo(best: &[SubframeTask]) -> (ChannelAssignment, [usize; 2]) {
    let mut chosen = STEREO_MODES[0];
    let mut chosen_bits = u64::MAX;
    for (assignment, [a, b]) in STEREO_MODES {
        let bits = best[a].bits.saturating_add(best[b].bits);
        if bits < chosen_bits {
            chosen = (assignment, [a, b]);
            chosen_bits = bits;
        }
    }
    chosen
}

/// Recovers a frame's channel assignment from its chosen
/// candidates' analysis channels
pub fn channel_assignment(best: &[SubframeTask]) -> ChannelAssignment {
    match best {
        [a, b] => STEREO_MODES
            .iter()
            .find(|(_, channels)| *channels == [usize::from(a.channel), usize::from(b.channel)])
            .map(|(assignment, _)| *assignment)
            .unwrap_or(ChannelAssignment::Independent(2)),
        best => ChannelAssignment::Independent(best.len() as u8),
    }
}

/// A finalized subframe predictor
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Predictor {
    /// Every sample is this value
    Constant(i32),
    /// Samples are stored as-is
    Verbatim,
    /// Fixed polynomial predictor of the given order
    Fixed(usize),
    /// Quantized linear predictor
    Lpc(lpc::QuantizedLpc),
}

impl Predictor {
    /// Number of warm-up samples
    pub fn order(&self) -> usize {
        match self {
            Self::Constant(_) | Self::Verbatim => 0,
            Self::Fixed(order) => *order,
            Self::Lpc(lpc) => lpc.coefficients.len(),
        }
    }

    /// The subframe header type
    pub fn header_type(&self) -> SubframeHeaderType {
        match self {
            Self::Constant(_) => SubframeHeaderType::Constant,
            Self::Verbatim => SubframeHeaderType::Verbatim,
            Self::Fixed(order) => SubframeHeaderType::Fixed(*order as u8),
            Self::Lpc(lpc) => SubframeHeaderType::Lpc(lpc.coefficients.len() as u8),
        }
    }
}

/// A subframe ready to be written
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subframe {
    /// How samples are predicted
    pub predictor: Predictor,
    /// Low zero bits removed from every sample
    pub wasted_bits: u32,
    /// Width of each stored sample, after wasted bits are removed
    pub sample_bits: u32,
    /// Samples with wasted bits removed
    pub samples: Vec<i32>,
    /// Residual, whose first `order` entries are unused
    pub residual: Vec<i32>,
    /// Partitioning of the residual
    pub rice: Option<RicePlan>,
    /// Exact size of the subframe, in bits
    pub bits: u64,
}

impl Subframe {
    /// A verbatim subframe
    pub fn verbatim(samples: &[i32], sample_bits: u32, wasted_bits: u32) -> Self {
        Self {
            predictor: Predictor::Verbatim,
            wasted_bits,
            sample_bits,
            samples: samples.to_vec(),
            residual: vec![],
            rice: None,
            bits: verbatim_bits(samples.len(), sample_bits, wasted_bits),
        }
    }
}

/// Turns the chosen candidate into a subframe with an
/// exact residual partitioning
///
/// Falls back to a verbatim subframe if the exact size
/// exceeds it, or if the residual no longer fits.
pub fn finalize(
    task: &SubframeTask,
    samples: &[i32],
    sample_bits: u32,
    wasted_bits: u32,
    min_partition_order: u32,
    max_partition_order: u32,
) -> Subframe {
    let verbatim = verbatim_bits(samples.len(), sample_bits, wasted_bits);
    let header = header_bits(wasted_bits);
    let order = usize::from(task.order);

    let (predictor, residual, coefficient_bits) = match task.kind {
        SubframeType::Constant if is_constant(samples) => {
            return Subframe {
                predictor: Predictor::Constant(samples[0]),
                wasted_bits,
                sample_bits,
                samples: samples.to_vec(),
                residual: vec![],
                rice: None,
                bits: header + u64::from(sample_bits),
            };
        }
        SubframeType::Fixed if order <= MAX_FIXED_ORDER && order < samples.len() => {
            let mut residual = vec![0; samples.len()];
            match fixed_residual(samples, order, &mut residual) {
                true => (Predictor::Fixed(order), residual, 0),
                false => return Subframe::verbatim(samples, sample_bits, wasted_bits),
            }
        }
        SubframeType::Lpc if !task.coefficients.is_empty() && order < samples.len() => {
            let mut residual = vec![0; samples.len()];
            match lpc::residual(samples, &task.coefficients, task.shift.into(), &mut residual) {
                true => (
                    Predictor::Lpc(lpc::QuantizedLpc {
                        coefficients: task.coefficients.clone(),
                        shift: task.shift.into(),
                        precision: task.precision.into(),
                    }),
                    residual,
                    4 + 5 + order as u64 * u64::from(task.precision),
                ),
                false => return Subframe::verbatim(samples, sample_bits, wasted_bits),
            }
        }
        _ => return Subframe::verbatim(samples, sample_bits, wasted_bits),
    };

    let rice = RicePlan::optimal(&residual, order, min_partition_order, max_partition_order);
    let bits = header + order as u64 * u64::from(sample_bits) + coefficient_bits + rice.bits;

    if bits <= verbatim {
        Subframe {
            predictor,
            wasted_bits,
            sample_bits,
            samples: samples.to_vec(),
            residual,
            rice: Some(rice),
            bits,
        }
    } else {
        Subframe::verbatim(samples, sample_bits, wasted_bits)
    }
}
