// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The compute device interface
//!
//! Signal analysis runs as a fixed sequence of data-parallel
//! [`Kernel`]s over buffers owned by a [`CommandQueue`].
//! Kernels are enqueued without waiting, and their results
//! may only be read once [`CommandQueue::finish`] returns.
//!
//! Each pipeline task slot owns its own queue, so a queue's
//! buffers are never shared between slots.
//!
//! # Buffer Layouts
//!
//! All buffers are flat arrays addressed by frame `f`,
//! analysis channel `c`, window `w` and sample `i`.
//! With `cc` analysis channels, `nw` windows,
//! block size `bs` and maximum LPC order `m`:
//!
//! | Binding | Type | Index |
//! |--------:|-----:|-------|
//! | `pcm` | `i32` | `(f × bs + i) × channels + c`, interleaved input |
//! | `samples` | `i32` | `(f × cc + c) × bs + i` |
//! | `wasted` | `i32` | `f × cc + c` |
//! | `windows` | `f32` | `w × bs + i` |
//! | `windowed` | `f32` | `((f × cc + c) × nw + w) × bs + i` |
//! | `autocorrelation` | `f64` | `((f × cc + c) × nw + w) × (m + 1) + lag` |
//! | `lpc` | `f64` | `((f × cc + c) × nw + w) × (m × m + m)`, coefficients then errors |
//! | `tasks` | tasks | `(f × cc + c) × tasks_per_channel + t` |
//! | `best` | tasks | `f × channels + c` |

pub mod cpu;

use crate::Error;
use crate::predict::SubframeTask;

/// A data-parallel compute kernel
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Kernel {
    /// Deinterleaves PCM into channels, deriving mid and side for stereo
    Decorrelate,
    /// Finds and removes each channel's wasted bits
    FindWastedBits,
    /// Multiplies samples by every analysis window
    Window,
    /// Autocorrelates every windowed signal
    Autocorrelate,
    /// Runs Levinson-Durbin recursion on every autocorrelation
    ComputeLpc,
    /// Builds every candidate, quantizing the most promising LPC orders
    QuantizeLpc,
    /// Estimates the size of every candidate
    EstimateResidual,
    /// Picks each frame's best candidates
    ChooseBest,
}

impl Kernel {
    /// Every kernel, in the order a task runs them
    pub const SEQUENCE: [Kernel; 8] = [
        Kernel::Decorrelate,
        Kernel::FindWastedBits,
        Kernel::Window,
        Kernel::Autocorrelate,
        Kernel::ComputeLpc,
        Kernel::QuantizeLpc,
        Kernel::EstimateResidual,
        Kernel::ChooseBest,
    ];

    /// Number of work items the kernel runs for the given parameters
    pub fn work_items(self, params: &TaskParams) -> usize {
        let channels = params.frames * params.channels_count;
        match self {
            Self::Decorrelate | Self::FindWastedBits => channels,
            Self::Window | Self::Autocorrelate | Self::ComputeLpc => channels * params.windows,
            Self::QuantizeLpc | Self::EstimateResidual => channels,
            Self::ChooseBest => params.frames,
        }
    }
}

/// A handle to a buffer allocated by a command queue
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BufferHandle(usize);

impl BufferHandle {
    /// Wraps a backend-specific buffer index
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// The backend-specific buffer index
    pub fn index(self) -> usize {
        self.0
    }
}

/// The element type of a device buffer
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufferKind {
    /// Integer samples
    I32,
    /// Window coefficients and windowed signals
    F32,
    /// Autocorrelation and LPC coefficients
    F64,
    /// Subframe candidates
    Tasks,
}

/// A host-visible view of a device buffer
#[derive(Clone, Debug)]
pub enum DeviceBuffer {
    /// Integer samples
    I32(Vec<i32>),
    /// Window coefficients and windowed signals
    F32(Vec<f32>),
    /// Autocorrelation and LPC coefficients
    F64(Vec<f64>),
    /// Subframe candidates
    Tasks(Vec<SubframeTask>),
}

impl Default for DeviceBuffer {
    fn default() -> Self {
        Self::I32(vec![])
    }
}

impl DeviceBuffer {
    /// A zeroed buffer of the given kind and length
    pub fn new(kind: BufferKind, len: usize) -> Self {
        match kind {
            BufferKind::I32 => Self::I32(vec![0; len]),
            BufferKind::F32 => Self::F32(vec![0.0; len]),
            BufferKind::F64 => Self::F64(vec![0.0; len]),
            BufferKind::Tasks => Self::Tasks(vec![SubframeTask::default(); len]),
        }
    }

    /// The buffer's element type
    pub fn kind(&self) -> BufferKind {
        match self {
            Self::I32(_) => BufferKind::I32,
            Self::F32(_) => BufferKind::F32,
            Self::F64(_) => BufferKind::F64,
            Self::Tasks(_) => BufferKind::Tasks,
        }
    }
}

macro_rules! accessors {
    ($variant:ident, $t:ty, $get:ident, $get_mut:ident) => {
        impl DeviceBuffer {
            #[doc = concat!("The buffer's contents, if of type `", stringify!($t), "`")]
            pub fn $get(&self) -> Result<&[$t], Error> {
                match self {
                    Self::$variant(v) => Ok(v),
                    _ => Err(Error::InvalidBuffer),
                }
            }

            #[doc = concat!("The buffer's mutable contents, if of type `", stringify!($t), "`")]
            pub fn $get_mut(&mut self) -> Result<&mut [$t], Error> {
                match self {
                    Self::$variant(v) => Ok(v),
                    _ => Err(Error::InvalidBuffer),
                }
            }
        }
    };
}

accessors!(I32, i32, as_i32, as_i32_mut);
accessors!(F32, f32, as_f32, as_f32_mut);
accessors!(F64, f64, as_f64, as_f64_mut);
accessors!(Tasks, SubframeTask, as_tasks, as_tasks_mut);

/// The buffers a task's kernels operate on
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Bindings {
    /// Interleaved input samples
    pub pcm: BufferHandle,
    /// Deinterleaved, decorrelated samples
    pub samples: BufferHandle,
    /// Wasted bits per channel
    pub wasted: BufferHandle,
    /// Window function coefficients
    pub windows: BufferHandle,
    /// Windowed samples
    pub windowed: BufferHandle,
    /// Autocorrelation values
    pub autocorrelation: BufferHandle,
    /// LPC coefficients and prediction errors
    pub lpc: BufferHandle,
    /// Every candidate subframe
    pub tasks: BufferHandle,
    /// Each frame's chosen candidates
    pub best: BufferHandle,
}

/// The parameters of one task's analysis
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskParams {
    /// Frames in the task
    pub frames: usize,
    /// Samples per channel per frame
    pub block_size: usize,
    /// Input channels
    pub channels: usize,
    /// Analysis channels, 4 when searching stereo modes
    pub channels_count: usize,
    /// Input bits-per-sample
    pub bits_per_sample: u32,
    /// Number of analysis windows
    pub windows: usize,
    /// Smallest LPC order
    pub min_lpc_order: usize,
    /// Largest LPC order
    pub max_lpc_order: usize,
    /// LPC orders quantized per window
    pub orders_per_window: usize,
    /// Smallest precision reduction
    pub min_precision_search: u32,
    /// Largest precision reduction
    pub max_precision_search: u32,
    /// Smallest fixed predictor order
    pub min_fixed_order: usize,
    /// Largest fixed predictor order
    pub max_fixed_order: usize,
    /// Smallest residual partition order
    pub min_partition_order: u32,
    /// Largest residual partition order
    pub max_partition_order: u32,
    /// Whether wasted bits are removed
    pub wasted_bits: bool,
}

impl TaskParams {
    /// Whether analysis channels include mid and side
    pub fn stereo(&self) -> bool {
        self.channels == 2 && self.channels_count == 4
    }

    /// Bits-per-sample of an analysis channel, before wasted bits
    pub fn sample_bits(&self, channel: usize) -> u32 {
        match (self.stereo(), channel) {
            (true, 3) => self.bits_per_sample + 1,
            _ => self.bits_per_sample,
        }
    }

    /// LPC orders actually quantized per window
    pub fn lpc_orders(&self) -> usize {
        self.orders_per_window
            .min(self.max_lpc_order + 1 - self.min_lpc_order)
    }

    /// Number of precision search steps
    pub fn searches(&self) -> usize {
        (self.max_precision_search - self.min_precision_search) as usize + 1
    }

    /// Number of fixed predictor candidates
    pub fn fixed_tasks(&self) -> usize {
        self.max_fixed_order + 1 - self.min_fixed_order
    }

    /// Candidates per analysis channel: constant,
    /// then fixed orders, then LPC by window, order and precision
    pub fn tasks_per_channel(&self) -> usize {
        1 + self.fixed_tasks() + self.windows * self.lpc_orders() * self.searches()
    }

    /// Position of an LPC candidate within its channel's candidates
    pub fn lpc_task(&self, window: usize, slot: usize, search: usize) -> usize {
        1 + self.fixed_tasks() + (window * self.lpc_orders() + slot) * self.searches() + search
    }

    /// Entries of the LPC buffer per windowed signal
    pub fn lpc_stride(&self) -> usize {
        self.max_lpc_order * self.max_lpc_order + self.max_lpc_order
    }
}

/// The arguments of an enqueued kernel
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct KernelArgs {
    /// Buffers the kernel reads and writes
    pub buffers: Bindings,
    /// The task's analysis parameters
    pub params: TaskParams,
}

/// A compute device able to run the analysis kernels
pub trait Accelerator: Send + Sync {
    /// Device's name, for logging
    fn name(&self) -> &str;

    /// Creates a new in-order command queue with its own buffers
    fn create_queue(&self) -> Result<Box<dyn CommandQueue>, Error>;
}

/// An in-order stream of kernel invocations
pub trait CommandQueue: Send {
    /// Allocates a zeroed buffer of `len` elements
    fn allocate(&mut self, kind: BufferKind, len: usize) -> Result<BufferHandle, Error>;

    /// Enqueues a kernel over `work_items` items without waiting for it
    fn enqueue(&mut self, kernel: Kernel, args: &KernelArgs, work_items: usize)
    -> Result<(), Error>;

    /// Waits for every enqueued kernel to complete
    ///
    /// Errors from any of the kernels are returned here.
    fn finish(&mut self) -> Result<(), Error>;

    /// Maps a buffer for reading by the host
    ///
    /// Fails with [`Error::BufferBusy`] if kernels are still pending.
    fn map(&self, buffer: BufferHandle) -> Result<&DeviceBuffer, Error>;

    /// Maps a buffer for writing by the host
    ///
    /// Fails with [`Error::BufferBusy`] if kernels are still pending.
    fn map_mut(&mut self, buffer: BufferHandle) -> Result<&mut DeviceBuffer, Error>;
}
