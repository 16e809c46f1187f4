// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A reference backend running kernels on the host
//!
//! Kernels are queued by [`CommandQueue::enqueue`] and run
//! in order by [`CommandQueue::finish`], so their errors
//! surface at the point the queue is awaited, as they
//! would on a real device.
//!
//! With the `rayon` feature, each kernel's work items
//! are spread over rayon's thread pool.

use super::{
    Accelerator, BufferHandle, BufferKind, CommandQueue, DeviceBuffer, Kernel, KernelArgs,
    TaskParams,
};
use crate::Error;
use crate::lpc;
use crate::predict::{self, SubframeTask, SubframeType};

/// Runs analysis kernels on the host's CPUs
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuAccelerator;

impl Accelerator for CpuAccelerator {
    fn name(&self) -> &str {
        "cpu"
    }

    fn create_queue(&self) -> Result<Box<dyn CommandQueue>, Error> {
        Ok(Box::new(CpuQueue::default()))
    }
}

/// An in-order queue of kernels over host memory
#[derive(Debug, Default)]
pub struct CpuQueue {
    buffers: Vec<DeviceBuffer>,
    pending: Vec<(Kernel, KernelArgs)>,
}

impl CommandQueue for CpuQueue {
    fn allocate(&mut self, kind: BufferKind, len: usize) -> Result<BufferHandle, Error> {
        self.buffers.push(DeviceBuffer::new(kind, len));
        Ok(BufferHandle::new(self.buffers.len() - 1))
    }

    fn enqueue(
        &mut self,
        kernel: Kernel,
        args: &KernelArgs,
        work_items: usize,
    ) -> Result<(), Error> {
        if work_items != kernel.work_items(&args.params) {
            return Err(Error::Accelerator(format!(
                "{kernel:?} enqueued over {work_items} work items"
            )));
        }
        self.pending.push((kernel, *args));
        Ok(())
    }

    fn finish(&mut self) -> Result<(), Error> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .try_for_each(|(kernel, args)| self.run(kernel, &args))
    }

    fn map(&self, buffer: BufferHandle) -> Result<&DeviceBuffer, Error> {
        if !self.pending.is_empty() {
            return Err(Error::BufferBusy);
        }
        self.buffers.get(buffer.index()).ok_or(Error::InvalidBuffer)
    }

    fn map_mut(&mut self, buffer: BufferHandle) -> Result<&mut DeviceBuffer, Error> {
        if !self.pending.is_empty() {
            return Err(Error::BufferBusy);
        }
        self.buffers
            .get_mut(buffer.index())
            .ok_or(Error::InvalidBuffer)
    }
}

impl CpuQueue {
    fn run(&mut self, kernel: Kernel, args: &KernelArgs) -> Result<(), Error> {
        let b = &args.buffers;
        let p = &args.params;

        match kernel {
            Kernel::Decorrelate => self.with_outputs(&[b.samples], |inputs, outputs| {
                let [samples] = outputs else {
                    return Err(Error::InvalidBuffer);
                };
                decorrelate(p, input(inputs, b.pcm)?.as_i32()?, samples.as_i32_mut()?)
            }),
            Kernel::FindWastedBits => {
                self.with_outputs(&[b.samples, b.wasted], |_, outputs| {
                    let [samples, wasted] = outputs else {
                        return Err(Error::InvalidBuffer);
                    };
                    find_wasted_bits(p, samples.as_i32_mut()?, wasted.as_i32_mut()?)
                })
            }
            Kernel::Window => self.with_outputs(&[b.windowed], |inputs, outputs| {
                let [windowed] = outputs else {
                    return Err(Error::InvalidBuffer);
                };
                window(
                    p,
                    input(inputs, b.samples)?.as_i32()?,
                    input(inputs, b.windows)?.as_f32()?,
                    windowed.as_f32_mut()?,
                )
            }),
            Kernel::Autocorrelate => {
                self.with_outputs(&[b.autocorrelation], |inputs, outputs| {
                    let [autoc] = outputs else {
                        return Err(Error::InvalidBuffer);
                    };
                    autocorrelate(p, input(inputs, b.windowed)?.as_f32()?, autoc.as_f64_mut()?)
                })
            }
            Kernel::ComputeLpc => self.with_outputs(&[b.lpc], |inputs, outputs| {
                let [lpc] = outputs else {
                    return Err(Error::InvalidBuffer);
                };
                compute_lpc(
                    p,
                    input(inputs, b.autocorrelation)?.as_f64()?,
                    lpc.as_f64_mut()?,
                )
            }),
            Kernel::QuantizeLpc => self.with_outputs(&[b.tasks], |inputs, outputs| {
                let [tasks] = outputs else {
                    return Err(Error::InvalidBuffer);
                };
                quantize_lpc(
                    p,
                    input(inputs, b.lpc)?.as_f64()?,
                    input(inputs, b.wasted)?.as_i32()?,
                    tasks.as_tasks_mut()?,
                )
            }),
            Kernel::EstimateResidual => self.with_outputs(&[b.tasks], |inputs, outputs| {
                let [tasks] = outputs else {
                    return Err(Error::InvalidBuffer);
                };
                estimate_residual(
                    p,
                    input(inputs, b.samples)?.as_i32()?,
                    input(inputs, b.wasted)?.as_i32()?,
                    tasks.as_tasks_mut()?,
                )
            }),
            Kernel::ChooseBest => self.with_outputs(&[b.best], |inputs, outputs| {
                let [best] = outputs else {
                    return Err(Error::InvalidBuffer);
                };
                choose_best(
                    p,
                    input(inputs, b.tasks)?.as_tasks()?,
                    input(inputs, b.wasted)?.as_i32()?,
                    best.as_tasks_mut()?,
                )
            }),
        }
    }

    /// Detaches the output buffers while a kernel runs
    /// so the remaining buffers may be read alongside them
    fn with_outputs<F>(&mut self, handles: &[BufferHandle], f: F) -> Result<(), Error>
    where
        F: FnOnce(&[DeviceBuffer], &mut [DeviceBuffer]) -> Result<(), Error>,
    {
        if handles.iter().any(|h| h.index() >= self.buffers.len()) {
            return Err(Error::InvalidBuffer);
        }

        let mut outputs = handles
            .iter()
            .map(|h| std::mem::take(&mut self.buffers[h.index()]))
            .collect::<Vec<_>>();

        let result = f(&self.buffers, &mut outputs);

        for (handle, output) in handles.iter().zip(outputs) {
            self.buffers[handle.index()] = output;
        }

        result
    }
}

fn input(buffers: &[DeviceBuffer], handle: BufferHandle) -> Result<&DeviceBuffer, Error> {
    buffers.get(handle.index()).ok_or(Error::InvalidBuffer)
}

/// Returns the first `len` elements of a buffer
fn region<T>(buffer: &[T], len: usize) -> Result<&[T], Error> {
    buffer.get(..len).ok_or(Error::InvalidBuffer)
}

fn region_mut<T>(buffer: &mut [T], len: usize) -> Result<&mut [T], Error> {
    buffer.get_mut(..len).ok_or(Error::InvalidBuffer)
}

/// Runs `f` over each work item's chunk of `output`
fn for_each_item<T, F>(output: &mut [T], chunk: usize, f: F) -> Result<(), Error>
where
    T: Send,
    F: Fn(usize, &mut [T]) -> Result<(), Error> + Send + Sync,
{
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        output
            .par_chunks_mut(chunk.max(1))
            .enumerate()
            .try_for_each(|(item, chunk)| f(item, chunk))
    }

    #[cfg(not(feature = "rayon"))]
    {
        output
            .chunks_mut(chunk.max(1))
            .enumerate()
            .try_for_each(|(item, chunk)| f(item, chunk))
    }
}

fn decorrelate(p: &TaskParams, pcm: &[i32], samples: &mut [i32]) -> Result<(), Error> {
    let (bs, channels) = (p.block_size, p.channels);
    let pcm = region(pcm, p.frames * bs * channels)?;
    let samples = region_mut(samples, p.frames * p.channels_count * bs)?;

    for_each_item(samples, bs, |item, out| {
        let (f, c) = (item / p.channels_count, item % p.channels_count);
        let frame = pcm[f * bs * channels..(f + 1) * bs * channels].chunks_exact(channels);

        match (p.stereo(), c) {
            (true, 2) => frame
                .zip(out)
                .for_each(|(pcm, s)| *s = (pcm[0] + pcm[1]) >> 1),
            (true, 3) => frame.zip(out).for_each(|(pcm, s)| *s = pcm[0] - pcm[1]),
            (_, c) => frame.zip(out).for_each(|(pcm, s)| *s = pcm[c]),
        }
        Ok(())
    })
}

fn find_wasted_bits(p: &TaskParams, samples: &mut [i32], wasted: &mut [i32]) -> Result<(), Error> {
    let items = p.frames * p.channels_count;
    let bs = p.block_size;
    let samples = region_mut(samples, items * bs)?;
    let wasted = region_mut(wasted, items)?;

    if !p.wasted_bits {
        wasted.fill(0);
        return Ok(());
    }

    {
        let samples = &*samples;
        for_each_item(wasted, 1, |item, w| {
            w[0] = predict::wasted_bits(&samples[item * bs..(item + 1) * bs]) as i32;
            Ok(())
        })?;
    }

    let wasted = &*wasted;
    for_each_item(samples, bs, |item, s| {
        let shift = wasted[item];
        if shift > 0 {
            s.iter_mut().for_each(|s| *s >>= shift);
        }
        Ok(())
    })
}

fn window(
    p: &TaskParams,
    samples: &[i32],
    windows: &[f32],
    windowed: &mut [f32],
) -> Result<(), Error> {
    let bs = p.block_size;
    let samples = region(samples, p.frames * p.channels_count * bs)?;
    let windows = region(windows, p.windows * bs)?;
    let windowed = region_mut(windowed, Kernel::Window.work_items(p) * bs)?;

    for_each_item(windowed, bs, |item, out| {
        let (channel, w) = (item / p.windows, item % p.windows);
        lpc::apply_window(
            &samples[channel * bs..(channel + 1) * bs],
            &windows[w * bs..(w + 1) * bs],
            out,
        );
        Ok(())
    })
}

fn autocorrelate(p: &TaskParams, windowed: &[f32], autoc: &mut [f64]) -> Result<(), Error> {
    let bs = p.block_size;
    let lags = p.max_lpc_order + 1;
    let items = Kernel::Autocorrelate.work_items(p);
    let windowed = region(windowed, items * bs)?;
    let autoc = region_mut(autoc, items * lags)?;

    for_each_item(autoc, lags, |item, out| {
        lpc::autocorrelate(&windowed[item * bs..(item + 1) * bs], out);
        Ok(())
    })
}

fn compute_lpc(p: &TaskParams, autoc: &[f64], lpc: &mut [f64]) -> Result<(), Error> {
    let m = p.max_lpc_order;
    let stride = p.lpc_stride();
    let items = Kernel::ComputeLpc.work_items(p);
    let autoc = region(autoc, items * (m + 1))?;
    let lpc = region_mut(lpc, items * stride)?;

    for_each_item(lpc, stride, |item, out| {
        let (coefficients, errors) = out.split_at_mut(m * m);
        lpc::levinson_durbin(
            &autoc[item * (m + 1)..(item + 1) * (m + 1)],
            m,
            coefficients,
            errors,
        );
        Ok(())
    })
}

/// Builds every channel's candidate list,
/// quantizing each window's most promising LPC orders
fn quantize_lpc(
    p: &TaskParams,
    lpc: &[f64],
    wasted: &[i32],
    tasks: &mut [SubframeTask],
) -> Result<(), Error> {
    let m = p.max_lpc_order;
    let stride = p.lpc_stride();
    let items = Kernel::QuantizeLpc.work_items(p);
    let tpc = p.tasks_per_channel();
    let lpc = region(lpc, items * p.windows * stride)?;
    let wasted = region(wasted, items)?;
    let tasks = region_mut(tasks, items * tpc)?;
    let analyze = predict::analysis_enabled(p.block_size, m);
    let base = lpc::base_precision(p.block_size);

    for_each_item(tasks, tpc, |item, tasks| {
        let channel = item % p.channels_count;
        let sample_bits = p.sample_bits(channel) - wasted[item] as u32;
        let c = channel as u8;

        tasks[0] = SubframeTask::constant(c);
        for (task, order) in tasks[1..].iter_mut().zip(p.min_fixed_order..=p.max_fixed_order) {
            *task = SubframeTask::fixed(c, order as u8);
        }

        for w in 0..p.windows {
            for slot in 0..p.lpc_orders() {
                for s in 0..p.searches() {
                    let search = p.min_precision_search + s as u32;
                    tasks[p.lpc_task(w, slot, s)] = SubframeTask::lpc(c, w as u8, search as u8);
                }
            }

            if !analyze {
                continue;
            }

            let analysis = &lpc[(item * p.windows + w) * stride..][..stride];
            let (coefficients, errors) = analysis.split_at(m * m);
            let orders = lpc::select_orders(
                errors,
                p.block_size,
                p.min_lpc_order,
                m,
                base,
                sample_bits,
                p.lpc_orders(),
            );

            for (slot, order) in orders.into_iter().enumerate() {
                for s in 0..p.searches() {
                    let search = p.min_precision_search + s as u32;
                    let quantized = lpc::quantize(
                        &coefficients[(order - 1) * m..][..order],
                        base.saturating_sub(search).max(2),
                    );
                    let task = &mut tasks[p.lpc_task(w, slot, s)];
                    task.order = order as u8;
                    task.precision = quantized.precision as u8;
                    task.shift = quantized.shift as u8;
                    task.coefficients = quantized.coefficients;
                }
            }
        }
        Ok(())
    })
}

fn estimate_residual(
    p: &TaskParams,
    samples: &[i32],
    wasted: &[i32],
    tasks: &mut [SubframeTask],
) -> Result<(), Error> {
    let bs = p.block_size;
    let items = Kernel::EstimateResidual.work_items(p);
    let tpc = p.tasks_per_channel();
    let samples = region(samples, items * bs)?;
    let wasted = region(wasted, items)?;
    let tasks = region_mut(tasks, items * tpc)?;
    let analyze = predict::analysis_enabled(bs, p.max_lpc_order);

    for_each_item(tasks, tpc, |item, tasks| {
        let block = &samples[item * bs..(item + 1) * bs];
        let wasted = wasted[item] as u32;
        let sample_bits = p.sample_bits(item % p.channels_count) - wasted;
        let mut residual = vec![0; bs];

        for task in tasks {
            if !analyze && task.kind != SubframeType::Constant {
                task.bits = SubframeTask::INVALID;
                continue;
            }
            predict::estimate(
                task,
                block,
                sample_bits,
                wasted,
                p.min_partition_order,
                p.max_partition_order,
                &mut residual,
            );
        }
        Ok(())
    })
}

fn choose_best(
    p: &TaskParams,
    tasks: &[SubframeTask],
    wasted: &[i32],
    best: &mut [SubframeTask],
) -> Result<(), Error> {
    let cc = p.channels_count;
    let tpc = p.tasks_per_channel();
    let tasks = region(tasks, p.frames * cc * tpc)?;
    let wasted = region(wasted, p.frames * cc)?;
    let best = region_mut(best, p.frames * p.channels)?;

    for_each_item(best, p.channels, |f, best| {
        let chosen = (0..cc)
            .map(|c| {
                let item = f * cc + c;
                let wasted = wasted[item] as u32;
                predict::choose_best(
                    &tasks[item * tpc..(item + 1) * tpc],
                    SubframeTask::verbatim(
                        c as u8,
                        predict::verbatim_bits(p.block_size, p.sample_bits(c) - wasted, wasted),
                    ),
                )
            })
            .collect::<Vec<_>>();

        if p.stereo() {
            let (_, [a, b]) = predict::choose_stereo(&chosen);
            best[0] = chosen[a].clone();
            best[1] = chosen[b].clone();
        } else {
            best.clone_from_slice(&chosen);
        }
        Ok(())
    })
}
