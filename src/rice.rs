// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Residual partitioning and Rice coding
//!
//! A residual block is split into `2^p` equal partitions,
//! with the first partition shortened by the predictor order
//! since the warm-up samples carry no residual.
//! Each partition stores its own Rice parameter `k`
//! followed by its zigzag-mapped values as a unary quotient
//! and a `k` bit remainder.
//!
//! | Bits | Field | Meaning |
//! |-----:|------:|---------|
//! | 2    | coding method | 0 for 4-bit parameters, 1 for 5-bit
//! | 4    | partition order | `p`
//! | 4/5  | parameter₀ | Rice parameter of first partition
//! |      | residuals₀ | Rice coded residuals of first partition
//! |      |            | ⋮

use bitstream_io::BitWrite;

/// Largest parameter for 4-bit parameter coding
pub const MAX_PARAMETER: u32 = 14;

/// Largest parameter for 5-bit parameter coding
pub const MAX_EXTENDED_PARAMETER: u32 = 30;

/// Largest partition order the 4-bit field can hold
pub const MAX_PARTITION_ORDER: u32 = 15;

/// Bits taken by the coding method and partition order fields
const HEADER_BITS: u64 = 2 + 4;

/// Maps a signed residual to an unsigned one,
/// keeping values of small magnitude small
#[inline]
pub fn zigzag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

/// Reverses [`zigzag`]
#[inline]
pub fn unzigzag(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Returns the largest usable partition order not exceeding `max`
///
/// The block must divide evenly into partitions
/// and the first partition must retain at least one
/// residual past the predictor's warm-up samples.
pub fn partition_order_limit(max: u32, block_size: usize, predictor_order: usize) -> u32 {
    let mut order = max
        .min(block_size.trailing_zeros())
        .min(MAX_PARTITION_ORDER);
    while order > 0 && (block_size >> order) <= predictor_order {
        order -= 1;
    }
    order
}

/// The residual coding method
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CodingMethod {
    /// 4-bit Rice parameters
    Rice = 0,
    /// 5-bit Rice parameters
    Rice2 = 1,
}

impl CodingMethod {
    /// Size of each partition's parameter field, in bits
    pub fn parameter_bits(self) -> u32 {
        match self {
            Self::Rice => 4,
            Self::Rice2 => 5,
        }
    }

    /// The parameter value indicating an escaped partition
    pub fn escape(self) -> u32 {
        (1 << self.parameter_bits()) - 1
    }
}

/// Iterates over the residual slices of each partition
fn partitions<'r>(
    residual: &'r [i32],
    predictor_order: usize,
    partition_order: u32,
) -> impl Iterator<Item = &'r [i32]> {
    let size = residual.len() >> partition_order;
    (0..1usize << partition_order).map(move |i| match i {
        0 => &residual[predictor_order..size],
        i => &residual[i * size..(i + 1) * size],
    })
}

/// Sums of zigzagged residuals for every partition at the given order
fn partition_sums(residual: &[i32], predictor_order: usize, partition_order: u32) -> Vec<u64> {
    partitions(residual, predictor_order, partition_order)
        .map(|p| p.iter().map(|r| u64::from(zigzag(*r))).sum())
        .collect()
}

/// Sums at the next coarser partition order
fn fold_sums(sums: &[u64]) -> Vec<u64> {
    sums.chunks_exact(2).map(|pair| pair[0] + pair[1]).collect()
}

/// Parameter derived from the mean residual magnitude
#[inline]
fn estimate_parameter(sum: u64, count: u64) -> u32 {
    (sum / count.max(1))
        .checked_ilog2()
        .unwrap_or(0)
        .min(MAX_EXTENDED_PARAMETER)
}

/// Exact bits of Rice coded residuals with parameter `k`,
/// not including the parameter itself
#[inline]
fn coded_bits(partition: &[i32], k: u32) -> u64 {
    partition.len() as u64 * u64::from(k + 1)
        + partition
            .iter()
            .map(|r| u64::from(zigzag(*r) >> k))
            .sum::<u64>()
}

/// Finds the lowest-cost parameter in `0..=max`
///
/// Cost is convex in `k`, so walking downhill from
/// the estimate reaches the minimum, preferring smaller `k`.
fn best_parameter(partition: &[i32], estimate: u32, max: u32) -> (u32, u64) {
    let mut k = estimate.min(max);
    let mut bits = coded_bits(partition, k);

    while k > 0 {
        match coded_bits(partition, k - 1) {
            lower if lower <= bits => {
                k -= 1;
                bits = lower;
            }
            _ => break,
        }
    }

    while k < max {
        match coded_bits(partition, k + 1) {
            higher if higher < bits => {
                k += 1;
                bits = higher;
            }
            _ => break,
        }
    }

    (k, bits)
}

/// Estimates a residual's coded size from partition sums alone
///
/// Each partition's cost is approximated as
/// `count × (k + 1) + (sum >> k)` with `k` derived from
/// the mean magnitude, and the cheapest partition order wins.
/// This is the figure compute kernels use to rank candidates.
pub fn estimate(
    residual: &[i32],
    predictor_order: usize,
    min_partition_order: u32,
    max_partition_order: u32,
) -> u64 {
    let max_p = partition_order_limit(max_partition_order, residual.len(), predictor_order);
    let min_p = min_partition_order.min(max_p);
    let mut sums = partition_sums(residual, predictor_order, max_p);
    let mut best = u64::MAX;

    for p in (min_p..=max_p).rev() {
        let size = (residual.len() >> p) as u64;
        let mut wide = false;
        let bits = sums
            .iter()
            .enumerate()
            .map(|(i, sum)| {
                let count = if i == 0 {
                    size - predictor_order as u64
                } else {
                    size
                };
                let k = estimate_parameter(*sum, count);
                wide |= k > MAX_PARAMETER;
                count * u64::from(k + 1) + (sum >> k)
            })
            .sum::<u64>();
        let width = if wide { 5 } else { 4 };
        best = best.min(HEADER_BITS + bits + width * sums.len() as u64);

        if p > min_p {
            sums = fold_sums(&sums);
        }
    }

    best
}

/// An optimal partitioning of a residual block
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RicePlan {
    /// Parameter coding method
    pub method: CodingMethod,
    /// The partition order
    pub partition_order: u32,
    /// One Rice parameter per partition
    pub parameters: Vec<u32>,
    /// Total size in bits, including coding method
    /// and partition order fields
    pub bits: u64,
}

impl RicePlan {
    /// Finds the smallest encoding of the residual block
    /// within the given partition order range
    ///
    /// `residual` is the whole block, including the
    /// predictor's warm-up positions, which are skipped.
    ///
    /// Among equal sizes the lowest partition order,
    /// the lowest parameters and 4-bit parameters are preferred.
    pub fn optimal(
        residual: &[i32],
        predictor_order: usize,
        min_partition_order: u32,
        max_partition_order: u32,
    ) -> Self {
        let max_p = partition_order_limit(max_partition_order, residual.len(), predictor_order);
        let min_p = min_partition_order.min(max_p);
        let mut sums = partition_sums(residual, predictor_order, max_p);
        let mut best: Option<Self> = None;

        for p in (min_p..=max_p).rev() {
            let plan = Self::for_order(residual, predictor_order, p, &sums);
            if best.as_ref().is_none_or(|best| plan.bits <= best.bits) {
                best = Some(plan);
            }

            if p > min_p {
                sums = fold_sums(&sums);
            }
        }

        // the range always holds at least one order
        best.unwrap_or_else(|| Self::for_order(residual, predictor_order, 0, &[]))
    }

    fn for_order(residual: &[i32], predictor_order: usize, partition_order: u32, sums: &[u64]) -> Self {
        let mut parameters = Vec::with_capacity(1 << partition_order);
        let mut narrow_parameters = Vec::with_capacity(1 << partition_order);
        let mut wide_bits = HEADER_BITS;
        let mut narrow_bits = HEADER_BITS;

        for (i, partition) in partitions(residual, predictor_order, partition_order).enumerate() {
            let sum = match sums.get(i) {
                Some(sum) => *sum,
                None => partition.iter().map(|r| u64::from(zigzag(*r))).sum(),
            };
            let (k, bits) = best_parameter(
                partition,
                estimate_parameter(sum, partition.len() as u64),
                MAX_EXTENDED_PARAMETER,
            );
            parameters.push(k);
            wide_bits += 5 + bits;

            // cost is convex, so the clamped parameter is the narrow optimum
            match k {
                0..=MAX_PARAMETER => {
                    narrow_parameters.push(k);
                    narrow_bits += 4 + bits;
                }
                _ => {
                    narrow_parameters.push(MAX_PARAMETER);
                    narrow_bits += 4 + coded_bits(partition, MAX_PARAMETER);
                }
            }
        }

        if narrow_bits <= wide_bits {
            Self {
                method: CodingMethod::Rice,
                partition_order,
                parameters: narrow_parameters,
                bits: narrow_bits,
            }
        } else {
            Self {
                method: CodingMethod::Rice2,
                partition_order,
                parameters,
                bits: wide_bits,
            }
        }
    }

    /// Writes the residual block using our plan
    pub fn write<W: BitWrite + ?Sized>(
        &self,
        w: &mut W,
        residual: &[i32],
        predictor_order: usize,
    ) -> std::io::Result<()> {
        w.write::<2, u8>(self.method as u8)?;
        w.write::<4, u32>(self.partition_order)?;

        let width = self.method.parameter_bits();
        self.parameters
            .iter()
            .zip(partitions(residual, predictor_order, self.partition_order))
            .try_for_each(|(&k, partition)| {
                w.write_var(width, k)?;
                partition.iter().try_for_each(|r| {
                    let u = zigzag(*r);
                    w.write_unary::<1>(u >> k)?;
                    match k {
                        0 => Ok(()),
                        k => w.write_var(k, u & ((1 << k) - 1)),
                    }
                })
            })
    }
}
