// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Double-buffered scheduling of analysis tasks
//!
//! Interleaved samples are staged into a [`TaskSlot`] until it
//! holds a whole task's worth of frames. The slot's kernels
//! are then enqueued and the slot joins the in-flight queue,
//! while a second slot starts staging.
//!
//! In-flight slots are awaited strictly in submission order,
//! either on the calling thread or on CPU worker threads,
//! so frames always reach the [`FrameSink`] in sample order.
//!
//! A slot moves through these states:
//!
//! ```text
//! Empty → Staging → Dispatched → Ready → Writing → Empty
//! ```

use crate::Error;
use crate::accel::{
    Accelerator, Bindings, BufferKind, CommandQueue, Kernel, KernelArgs, TaskParams,
    cpu::CpuAccelerator,
};
use crate::decode;
use crate::frame;
use crate::lpc::Window;
use crate::metadata::Streaminfo;
use crate::predict;
use crate::stream::FrameHeader;
use crossbeam_channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Session-wide encoding parameters, shared with workers
#[derive(Clone, Debug)]
pub struct FrameContext {
    /// The stream's format
    pub streaminfo: Streaminfo,
    /// Analysis parameters for a task of whole frames
    pub params: TaskParams,
    /// Analysis windows, in evaluation order
    pub windows: Vec<Window>,
    /// Samples per channel in each whole frame
    pub block_size: usize,
    /// Whether frame headers carry sample numbers
    pub variable_block_size: bool,
    /// Whether frames are decoded again and compared
    pub verify: bool,
}

/// A serialized frame
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameRecord {
    /// Number of the frame's first sample
    pub first_sample: u64,
    /// Samples per channel in the frame
    pub block_size: usize,
    /// The whole frame, from sync code to CRC-16
    pub bytes: Vec<u8>,
}

/// Receives serialized frames in sample order
pub trait FrameSink {
    /// Writes a frame to the stream
    fn write_frame(&mut self, frame: FrameRecord) -> Result<(), Error>;
}

/// The state of a task slot
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotState {
    /// Holds no samples
    Empty,
    /// Samples being copied in
    Staging,
    /// Kernels enqueued
    Dispatched,
    /// Best candidates computed
    Ready,
    /// Frames being serialized
    Writing,
}

/// A reusable task buffer with its own command queue
pub struct TaskSlot {
    state: SlotState,
    queue: Box<dyn CommandQueue>,
    buffers: Bindings,
    /// Frames the slot's buffers hold
    capacity: usize,
    /// Samples per channel staged so far
    staged: usize,
    /// Block size the windows buffer was generated for
    window_size: usize,
    args: KernelArgs,
    first_frame: u64,
    first_sample: u64,
}

impl TaskSlot {
    /// Allocates a slot's buffers on a new command queue
    pub fn new(mut queue: Box<dyn CommandQueue>, ctx: &FrameContext) -> Result<Self, Error> {
        let p = TaskParams {
            block_size: ctx.block_size,
            ..ctx.params
        };
        let items = p.frames * p.channels_count;
        let signals = items * p.windows;

        let buffers = Bindings {
            pcm: queue.allocate(BufferKind::I32, p.frames * p.block_size * p.channels)?,
            samples: queue.allocate(BufferKind::I32, items * p.block_size)?,
            wasted: queue.allocate(BufferKind::I32, items)?,
            windows: queue.allocate(BufferKind::F32, p.windows * p.block_size)?,
            windowed: queue.allocate(BufferKind::F32, signals * p.block_size)?,
            autocorrelation: queue.allocate(BufferKind::F64, signals * (p.max_lpc_order + 1))?,
            lpc: queue.allocate(BufferKind::F64, signals * p.lpc_stride())?,
            tasks: queue.allocate(BufferKind::Tasks, items * p.tasks_per_channel())?,
            best: queue.allocate(BufferKind::Tasks, p.frames * p.channels)?,
        };

        Ok(Self {
            state: SlotState::Empty,
            queue,
            buffers,
            capacity: p.frames,
            staged: 0,
            window_size: 0,
            args: KernelArgs { buffers, params: p },
            first_frame: 0,
            first_sample: 0,
        })
    }

    /// The slot's current state
    #[cfg(test)]
    pub fn state(&self) -> SlotState {
        self.state
    }

    fn transition(&mut self, from: SlotState, to: SlotState) -> Result<(), Error> {
        if self.state == from {
            self.state = to;
            Ok(())
        } else {
            Err(Error::InvalidSlotState)
        }
    }

    /// Whether the slot holds a whole task's worth of frames
    pub fn is_full(&self, ctx: &FrameContext) -> bool {
        self.staged == self.capacity * ctx.block_size
    }

    /// Copies as many interleaved samples as fit,
    /// returning how many were taken
    pub fn stage(&mut self, samples: &[i32], ctx: &FrameContext) -> Result<usize, Error> {
        match self.state {
            SlotState::Empty => self.state = SlotState::Staging,
            SlotState::Staging => {}
            _ => return Err(Error::InvalidSlotState),
        }

        let channels = ctx.params.channels;
        let room = (self.capacity * ctx.block_size - self.staged) * channels;
        let taken = samples.len().min(room);

        let pcm = self.queue.map_mut(self.buffers.pcm)?.as_i32_mut()?;
        pcm[self.staged * channels..][..taken].copy_from_slice(&samples[..taken]);
        self.staged += taken / channels;

        Ok(taken)
    }

    /// Removes the staged samples which do not fill a whole frame,
    /// returning them interleaved
    pub fn leftover(&mut self, ctx: &FrameContext) -> Result<Vec<i32>, Error> {
        let channels = ctx.params.channels;
        let whole = self.staged - self.staged % ctx.block_size;
        let pcm = self.queue.map(self.buffers.pcm)?.as_i32()?;
        let leftover = pcm[whole * channels..self.staged * channels].to_vec();
        self.staged = whole;
        Ok(leftover)
    }

    /// Samples per channel staged so far
    pub fn staged(&self) -> usize {
        self.staged
    }

    /// Enqueues the analysis kernels over the staged samples,
    /// split into frames of `block_size`
    pub fn dispatch(
        &mut self,
        ctx: &FrameContext,
        block_size: usize,
        first_frame: u64,
        first_sample: u64,
    ) -> Result<(), Error> {
        self.transition(SlotState::Staging, SlotState::Dispatched)?;

        let params = TaskParams {
            frames: self.staged / block_size,
            block_size,
            ..ctx.params
        };

        if self.window_size != block_size {
            let windows = self.queue.map_mut(self.buffers.windows)?.as_f32_mut()?;
            for (window, coefficients) in ctx.windows.iter().zip(windows.chunks_exact_mut(block_size)) {
                window.generate(coefficients);
            }
            self.window_size = block_size;
        }

        self.args = KernelArgs {
            buffers: self.buffers,
            params,
        };
        self.first_frame = first_frame;
        self.first_sample = first_sample;

        tracing::trace!(
            first_frame,
            frames = params.frames,
            block_size,
            "dispatching task"
        );

        for kernel in Kernel::SEQUENCE {
            self.queue
                .enqueue(kernel, &self.args, kernel.work_items(&params))?;
        }
        Ok(())
    }

    /// Waits for the slot's kernels and serializes its frames
    pub fn process(&mut self, ctx: &FrameContext) -> Result<Vec<FrameRecord>, Error> {
        self.queue.finish()?;
        self.transition(SlotState::Dispatched, SlotState::Ready)?;

        let p = &self.args.params;
        let (bs, cc) = (p.block_size, p.channels_count);
        let channels = p.channels;
        let pcm = self.queue.map(self.buffers.pcm)?.as_i32()?;
        let samples = self.queue.map(self.buffers.samples)?.as_i32()?;
        let wasted = self.queue.map(self.buffers.wasted)?.as_i32()?;
        let best = self.queue.map(self.buffers.best)?.as_tasks()?;

        self.state = SlotState::Writing;

        let mut frames = Vec::with_capacity(p.frames);
        for (f, best) in best.chunks_exact(channels).take(p.frames).enumerate() {
            let subframes = best
                .iter()
                .map(|task| {
                    let item = f * cc + usize::from(task.channel);
                    let wasted = wasted[item] as u32;
                    predict::finalize(
                        task,
                        &samples[item * bs..(item + 1) * bs],
                        p.sample_bits(task.channel.into()) - wasted,
                        wasted,
                        p.min_partition_order,
                        p.max_partition_order,
                    )
                })
                .collect::<Vec<_>>();

            let first_sample = self.first_sample + (f * bs) as u64;
            let header = FrameHeader {
                variable_block_size: ctx.variable_block_size,
                number: match ctx.variable_block_size {
                    true => first_sample,
                    false => self.first_frame + f as u64,
                },
                block_size: u16::try_from(bs).map_err(|_| Error::InvalidBlockSize)?,
                sample_rate: ctx.streaminfo.sample_rate,
                channel_assignment: predict::channel_assignment(best),
                bits_per_sample: ctx.streaminfo.bits_per_sample,
            };

            let mut bytes = vec![];
            frame::write_frame(&mut bytes, &header, &subframes)?;

            if ctx.verify {
                decode::verify_frame(
                    &bytes,
                    &ctx.streaminfo,
                    &pcm[f * bs * channels..(f + 1) * bs * channels],
                )?;
            }

            frames.push(FrameRecord {
                first_sample,
                block_size: bs,
                bytes,
            });
        }

        Ok(frames)
    }

    /// Returns a slot to the empty state for reuse
    pub fn reset(&mut self) {
        self.state = SlotState::Empty;
        self.staged = 0;
    }
}

type Completed = (TaskSlot, Result<Vec<FrameRecord>, Error>);

/// A CPU worker thread which awaits and serializes tasks
struct Worker {
    tasks: Option<Sender<TaskSlot>>,
    completed: Receiver<Completed>,
    handle: Option<JoinHandle<()>>,
    busy: bool,
}

impl Worker {
    fn spawn(index: usize, ctx: Arc<FrameContext>) -> Result<Self, Error> {
        let (tasks, task_receiver) = crossbeam_channel::bounded::<TaskSlot>(1);
        let (completed_sender, completed) = crossbeam_channel::bounded::<Completed>(1);

        let handle = std::thread::Builder::new()
            .name(format!("flac-worker-{index}"))
            .spawn(move || {
                tracing::debug!(worker = index, "worker started");
                for mut slot in task_receiver {
                    let result = slot.process(&ctx);
                    if completed_sender.send((slot, result)).is_err() {
                        break;
                    }
                }
                tracing::debug!(worker = index, "worker stopped");
            })?;

        Ok(Self {
            tasks: Some(tasks),
            completed,
            handle: Some(handle),
            busy: false,
        })
    }

    fn send(&mut self, slot: TaskSlot) -> Result<(), Error> {
        match &self.tasks {
            Some(tasks) if !self.busy => {
                tasks.send(slot).map_err(|_| Error::WorkerDisconnected)?;
                self.busy = true;
                Ok(())
            }
            _ => Err(Error::InvalidSlotState),
        }
    }

    fn recv(&mut self) -> Result<Completed, Error> {
        let completed = self
            .completed
            .recv()
            .map_err(|_| Error::WorkerDisconnected)?;
        self.busy = false;
        Ok(completed)
    }

    fn join(&mut self) {
        self.tasks = None;
        if let Some(handle) = self.handle.take() {
            // a panicked worker has already reported itself
            // by disconnecting its channel
            let _ = handle.join();
        }
    }
}

/// A task awaiting completion, in submission order
enum InFlight {
    Local(TaskSlot),
    Worker(usize),
}

/// Stages samples into task slots and writes completed frames
pub struct Scheduler {
    ctx: Arc<FrameContext>,
    accelerator: Arc<dyn Accelerator>,
    fallback: bool,
    staging: Option<TaskSlot>,
    free: Vec<TaskSlot>,
    in_flight: VecDeque<InFlight>,
    workers: Vec<Worker>,
    next_worker: usize,
    next_frame: u64,
    next_sample: u64,
}

impl Scheduler {
    /// Starts a scheduler with the given number of CPU worker threads
    ///
    /// If `fallback` is set, slots whose queue cannot be created
    /// on the accelerator use the CPU reference backend instead.
    pub fn new(
        ctx: FrameContext,
        accelerator: Arc<dyn Accelerator>,
        fallback: bool,
        threads: usize,
    ) -> Result<Self, Error> {
        let ctx = Arc::new(ctx);

        tracing::debug!(
            accelerator = accelerator.name(),
            threads,
            frames_per_task = ctx.params.frames,
            block_size = ctx.block_size,
            "starting pipeline"
        );

        let workers = (0..threads)
            .map(|i| Worker::spawn(i, Arc::clone(&ctx)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            ctx,
            accelerator,
            fallback,
            staging: None,
            free: vec![],
            in_flight: VecDeque::new(),
            workers,
            next_worker: 0,
            next_frame: 0,
            next_sample: 0,
        })
    }

    fn new_slot(&mut self) -> Result<TaskSlot, Error> {
        if let Some(slot) = self.free.pop() {
            return Ok(slot);
        }

        let queue = match self.accelerator.create_queue() {
            Ok(queue) => queue,
            Err(err) if self.fallback => {
                tracing::warn!(
                    accelerator = self.accelerator.name(),
                    error = %err,
                    "falling back to CPU backend"
                );
                CpuAccelerator.create_queue()?
            }
            Err(err) => return Err(err),
        };
        TaskSlot::new(queue, &self.ctx)
    }

    /// Stages interleaved samples, writing any frames completed
    /// along the way
    pub fn push<S: FrameSink>(&mut self, mut samples: &[i32], sink: &mut S) -> Result<(), Error> {
        while !samples.is_empty() {
            let mut slot = match self.staging.take() {
                Some(slot) => slot,
                None => self.new_slot()?,
            };
            let taken = slot.stage(samples, &self.ctx)?;
            samples = &samples[taken..];

            if slot.is_full(&self.ctx) {
                self.dispatch(slot, self.ctx.block_size, sink)?;
            } else {
                self.staging = Some(slot);
            }
        }
        Ok(())
    }

    fn dispatch<S: FrameSink>(
        &mut self,
        mut slot: TaskSlot,
        block_size: usize,
        sink: &mut S,
    ) -> Result<(), Error> {
        let frames = slot.staged() / block_size;
        slot.dispatch(&self.ctx, block_size, self.next_frame, self.next_sample)?;
        self.next_frame += frames as u64;
        self.next_sample += (frames * block_size) as u64;

        if self.workers.is_empty() {
            self.in_flight.push_back(InFlight::Local(slot));
            // one task analyzed while the next is staged
            while self.in_flight.len() > 1 {
                self.complete_next(sink)?;
            }
        } else {
            let worker = self.next_worker;
            self.next_worker = (self.next_worker + 1) % self.workers.len();
            while self.workers[worker].busy {
                self.complete_next(sink)?;
            }
            self.workers[worker].send(slot)?;
            self.in_flight.push_back(InFlight::Worker(worker));
        }
        Ok(())
    }

    /// Awaits the oldest in-flight task and writes its frames
    fn complete_next<S: FrameSink>(&mut self, sink: &mut S) -> Result<(), Error> {
        let (mut slot, result) = match self.in_flight.pop_front() {
            Some(InFlight::Local(mut slot)) => {
                let result = slot.process(&self.ctx);
                (slot, result)
            }
            Some(InFlight::Worker(worker)) => self.workers[worker].recv()?,
            None => return Ok(()),
        };
        slot.reset();
        self.free.push(slot);

        result?
            .into_iter()
            .try_for_each(|frame| sink.write_frame(frame))
    }

    /// Dispatches every staged sample, including a final
    /// partial frame, and writes all remaining frames
    pub fn flush<S: FrameSink>(&mut self, sink: &mut S) -> Result<(), Error> {
        if let Some(mut slot) = self.staging.take() {
            let leftover = slot.leftover(&self.ctx)?;

            if slot.staged() > 0 {
                self.dispatch(slot, self.ctx.block_size, sink)?;
            } else {
                slot.reset();
                self.free.push(slot);
            }

            if !leftover.is_empty() {
                let mut tail = self.new_slot()?;
                tail.stage(&leftover, &self.ctx)?;
                let block_size = tail.staged();
                self.dispatch(tail, block_size, sink)?;
            }
        }

        while !self.in_flight.is_empty() {
            self.complete_next(sink)?;
        }
        Ok(())
    }

    /// Stops every worker thread, discarding in-flight work
    pub fn shutdown(&mut self) {
        self.in_flight.clear();
        for worker in &mut self.workers {
            worker.join();
        }
        if !self.workers.is_empty() {
            tracing::debug!(workers = self.workers.len(), "workers joined");
        }
        self.workers.clear();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lpc::Window;
    use std::num::NonZero;

    fn context(block_size: usize, frames: usize, channels: u8) -> FrameContext {
        FrameContext {
            streaminfo: Streaminfo {
                minimum_block_size: block_size as u16,
                maximum_block_size: block_size as u16,
                minimum_frame_size: None,
                maximum_frame_size: None,
                sample_rate: 44100,
                channels: NonZero::new(channels).unwrap(),
                bits_per_sample: 16,
                total_samples: None,
                md5: None,
            },
            params: TaskParams {
                frames,
                block_size,
                channels: channels.into(),
                channels_count: if channels == 2 { 4 } else { channels.into() },
                bits_per_sample: 16,
                windows: 1,
                min_lpc_order: 1,
                max_lpc_order: 8,
                orders_per_window: 2,
                min_precision_search: 0,
                max_precision_search: 0,
                min_fixed_order: 0,
                max_fixed_order: 4,
                min_partition_order: 0,
                max_partition_order: 6,
                wasted_bits: true,
            },
            windows: vec![Window::Tukey],
            block_size,
            variable_block_size: false,
            verify: true,
        }
    }

    #[derive(Default)]
    struct Frames(Vec<FrameRecord>);

    impl FrameSink for Frames {
        fn write_frame(&mut self, frame: FrameRecord) -> Result<(), Error> {
            self.0.push(frame);
            Ok(())
        }
    }

    fn signal(len: usize, channels: usize) -> Vec<i32> {
        let mut rng = fastrand::Rng::with_seed(42);
        (0..len)
            .flat_map(|i| {
                let s = ((i as f64 / 31.0).sin() * 9000.0) as i32;
                (0..channels).map(move |c| s >> c)
            })
            .map(|s| s + rng.i32(-8..=8))
            .collect()
    }

    fn encode(ctx: FrameContext, threads: usize, pcm: &[i32], chunk: usize) -> Vec<FrameRecord> {
        let mut scheduler = Scheduler::new(ctx, Arc::new(CpuAccelerator), false, threads).unwrap();
        let mut frames = Frames::default();
        for samples in pcm.chunks(chunk) {
            scheduler.push(samples, &mut frames).unwrap();
        }
        scheduler.flush(&mut frames).unwrap();
        frames.0
    }

    #[test]
    fn test_slot_states() {
        let ctx = context(64, 2, 1);
        let mut slot = TaskSlot::new(CpuAccelerator.create_queue().unwrap(), &ctx).unwrap();
        assert_eq!(slot.state(), SlotState::Empty);

        // nothing to process before dispatch
        assert!(matches!(slot.process(&ctx), Err(Error::InvalidSlotState)));

        assert_eq!(slot.stage(&signal(100, 1), &ctx).unwrap(), 100);
        assert_eq!(slot.state(), SlotState::Staging);
        assert_eq!(slot.stage(&signal(100, 1), &ctx).unwrap(), 28);
        assert!(slot.is_full(&ctx));

        slot.dispatch(&ctx, 64, 0, 0).unwrap();
        assert_eq!(slot.state(), SlotState::Dispatched);
        assert!(matches!(slot.stage(&[0], &ctx), Err(Error::InvalidSlotState)));

        let frames = slot.process(&ctx).unwrap();
        assert_eq!(slot.state(), SlotState::Writing);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].first_sample, 64);

        slot.reset();
        assert_eq!(slot.state(), SlotState::Empty);
    }

    #[test]
    fn test_leftover() {
        let ctx = context(64, 4, 2);
        let mut slot = TaskSlot::new(CpuAccelerator.create_queue().unwrap(), &ctx).unwrap();
        let pcm = signal(150, 2);
        slot.stage(&pcm, &ctx).unwrap();
        let leftover = slot.leftover(&ctx).unwrap();
        assert_eq!(slot.staged(), 128);
        assert_eq!(leftover, &pcm[256..]);
    }

    #[test]
    fn test_frames_in_order() {
        let pcm = signal(64 * 21 + 17, 2);
        let frames = encode(context(64, 4, 2), 0, &pcm, 334);
        assert_eq!(frames.len(), 22);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.first_sample, i as u64 * 64);
        }
        assert_eq!(frames[21].block_size, 17);
    }

    #[test]
    fn test_workers_match_calling_thread() {
        let pcm = signal(64 * 37 + 5, 2);
        let local = encode(context(64, 3, 2), 0, &pcm, 1000);
        let threaded = encode(context(64, 3, 2), 3, &pcm, 78);
        assert_eq!(local, threaded);

        // task size does not change the output
        let single = encode(context(64, 1, 2), 2, &pcm, 4096);
        assert_eq!(local, single);
    }

    struct Failing;

    impl Accelerator for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn create_queue(&self) -> Result<Box<dyn CommandQueue>, Error> {
            Err(Error::Accelerator("no device".into()))
        }
    }

    #[test]
    fn test_queue_fallback() {
        let pcm = signal(200, 1);
        let ctx = context(64, 2, 1);

        let mut scheduler = Scheduler::new(ctx.clone(), Arc::new(Failing), false, 0).unwrap();
        assert!(matches!(
            scheduler.push(&pcm, &mut Frames::default()),
            Err(Error::Accelerator(_))
        ));

        let mut scheduler = Scheduler::new(ctx, Arc::new(Failing), true, 0).unwrap();
        let mut frames = Frames::default();
        scheduler.push(&pcm, &mut frames).unwrap();
        scheduler.flush(&mut frames).unwrap();
        assert_eq!(frames.0.len(), 4);
    }
}
