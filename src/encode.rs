// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For encoding PCM samples to FLAC files

use crate::Counter;
use crate::Error;
use crate::accel::{Accelerator, TaskParams, cpu::CpuAccelerator};
use crate::byteorder::{Endianness, LittleEndian};
use crate::lpc::{MAX_LPC_ORDER, Window, Windows};
use crate::metadata::{
    Block, BlockSize, FLAC_TAG, Padding, SeekPoint, SeekTable, Streaminfo, VorbisComment, write_block,
    write_blocks,
};
use crate::pipeline::{FrameContext, FrameRecord, FrameSink, Scheduler};
use crate::predict::MAX_FIXED_ORDER;
use crate::rice::MAX_PARTITION_ORDER;
use std::collections::VecDeque;
use std::io::{Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::num::NonZero;
use std::sync::Arc;

/// A compression preset
struct Preset {
    windows: &'static [Window],
    max_lpc_order: usize,
    orders_per_window: usize,
    fixed_order: (usize, usize),
    stereo: bool,
    wasted_bits: bool,
    max_precision_search: u32,
}

const fn preset(
    windows: &'static [Window],
    max_lpc_order: usize,
    orders_per_window: usize,
    fixed_order: (usize, usize),
    stereo: bool,
    wasted_bits: bool,
    max_precision_search: u32,
) -> Preset {
    Preset {
        windows,
        max_lpc_order,
        orders_per_window,
        fixed_order,
        stereo,
        wasted_bits,
        max_precision_search,
    }
}

const BARTLETT: &[Window] = &[Window::Bartlett];
const TUKEY: &[Window] = &[Window::Tukey];
const FLATTOP_TUKEY: &[Window] = &[Window::Flattop, Window::Tukey];
const WITH_WELCH: &[Window] = &[Window::Welch, Window::Flattop, Window::Tukey];
const WITH_HANN: &[Window] = &[Window::Welch, Window::Flattop, Window::Tukey, Window::Hann];

const PRESETS: [Preset; 13] = [
    preset(BARTLETT, 7, 1, (2, 2), false, false, 0),
    preset(BARTLETT, 7, 1, (1, 2), true, false, 0),
    preset(BARTLETT, 8, 1, (2, 2), false, true, 0),
    preset(TUKEY, 8, 1, (2, 2), true, true, 0),
    preset(FLATTOP_TUKEY, 8, 2, (2, 2), true, true, 0),
    preset(FLATTOP_TUKEY, 8, 4, (0, 4), true, true, 0),
    preset(FLATTOP_TUKEY, 12, 2, (0, 4), true, true, 0),
    preset(FLATTOP_TUKEY, 12, 4, (2, 2), true, true, 0),
    preset(FLATTOP_TUKEY, 12, 8, (0, 4), true, true, 0),
    preset(FLATTOP_TUKEY, 32, 4, (2, 2), true, true, 0),
    preset(FLATTOP_TUKEY, 32, 7, (0, 4), true, true, 0),
    preset(WITH_WELCH, 32, 11, (0, 4), true, true, 1),
    preset(WITH_HANN, 32, 12, (0, 4), true, true, 1),
];

/// FLAC encoding options
///
/// Options start from one of the compression presets
/// and may then be adjusted individually.
/// Every adjustment is validated immediately.
///
/// # Example
///
/// ```
/// use flac_accel::encode::EncodingOptions;
///
/// let options = EncodingOptions::preset(8)
///     .and_then(|o| o.block_size(4608))
///     .and_then(|o| o.lpc_order(1, 16))
///     .unwrap();
///
/// assert!(EncodingOptions::preset(13).is_err());
/// assert!(options.clone().fixed_order(3, 2).is_err());
/// ```
#[derive(Clone)]
pub struct EncodingOptions {
    block_size: Option<u16>,
    windows: Windows,
    min_lpc_order: usize,
    max_lpc_order: usize,
    orders_per_window: usize,
    min_fixed_order: usize,
    max_fixed_order: usize,
    min_partition_order: u32,
    max_partition_order: u32,
    partition_order_set: bool,
    min_precision_search: u32,
    max_precision_search: u32,
    stereo: bool,
    wasted_bits: bool,
    variable_block_size: bool,
    verify: bool,
    seektable: bool,
    padding: u32,
    frames_per_task: usize,
    threads: usize,
    accelerator: Arc<dyn Accelerator>,
    accelerator_fallback: bool,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self::from_preset(&PRESETS[Self::DEFAULT_LEVEL as usize])
    }
}

impl std::fmt::Debug for EncodingOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodingOptions")
            .field("block_size", &self.block_size)
            .field("windows", &self.windows)
            .field("lpc_order", &(self.min_lpc_order..=self.max_lpc_order))
            .field("orders_per_window", &self.orders_per_window)
            .field("fixed_order", &(self.min_fixed_order..=self.max_fixed_order))
            .field(
                "partition_order",
                &(self.min_partition_order..=self.max_partition_order),
            )
            .field(
                "precision_search",
                &(self.min_precision_search..=self.max_precision_search),
            )
            .field("stereo", &self.stereo)
            .field("wasted_bits", &self.wasted_bits)
            .field("variable_block_size", &self.variable_block_size)
            .field("verify", &self.verify)
            .field("seektable", &self.seektable)
            .field("padding", &self.padding)
            .field("frames_per_task", &self.frames_per_task)
            .field("threads", &self.threads)
            .field("accelerator", &self.accelerator.name())
            .field("accelerator_fallback", &self.accelerator_fallback)
            .finish()
    }
}

impl EncodingOptions {
    /// The default compression level
    pub const DEFAULT_LEVEL: u8 = 5;

    /// The largest compression level
    pub const MAX_LEVEL: u8 = 12;

    const DEFAULT_PADDING: u32 = 4096;

    const MAX_PADDING: u32 = (1 << 24) - 1;

    fn from_preset(preset: &Preset) -> Self {
        Self {
            block_size: None,
            windows: preset.windows.iter().copied().collect(),
            min_lpc_order: 1,
            max_lpc_order: preset.max_lpc_order,
            orders_per_window: preset.orders_per_window,
            min_fixed_order: preset.fixed_order.0,
            max_fixed_order: preset.fixed_order.1,
            min_partition_order: 0,
            max_partition_order: 8,
            partition_order_set: false,
            min_precision_search: 0,
            max_precision_search: preset.max_precision_search,
            stereo: preset.stereo,
            wasted_bits: preset.wasted_bits,
            variable_block_size: false,
            verify: false,
            seektable: true,
            padding: Self::DEFAULT_PADDING,
            frames_per_task: 8,
            threads: 0,
            accelerator: Arc::new(CpuAccelerator),
            accelerator_fallback: false,
        }
    }

    /// Options of the given compression level, from 0 to 12
    ///
    /// Higher levels search more predictors,
    /// compressing better at the cost of speed.
    pub fn preset(level: u8) -> Result<Self, Error> {
        PRESETS
            .get(usize::from(level))
            .map(Self::from_preset)
            .ok_or(Error::InvalidCompressionLevel)
    }

    /// Sets an explicit block size, from 16 to 65535
    ///
    /// Without one, the block size is the largest of 256×2ⁿ
    /// samples no longer than 100 milliseconds.
    ///
    /// If the partition order range has not been set,
    /// its maximum is reduced to fit the block size.
    pub fn block_size(self, block_size: u16) -> Result<Self, Error> {
        if block_size < 16 {
            return Err(Error::InvalidBlockSize);
        }
        Ok(Self {
            block_size: Some(block_size),
            max_partition_order: match self.partition_order_set {
                true => self.max_partition_order,
                false => self.max_partition_order.min(block_size.ilog2()),
            },
            ..self
        })
    }

    /// Sets the range of LPC orders, from 1 to 32
    pub fn lpc_order(self, min: usize, max: usize) -> Result<Self, Error> {
        if (1..=MAX_LPC_ORDER).contains(&min) && (min..=MAX_LPC_ORDER).contains(&max) {
            Ok(Self {
                min_lpc_order: min,
                max_lpc_order: max,
                ..self
            })
        } else {
            Err(Error::InvalidLpcOrder)
        }
    }

    /// Sets the number of LPC orders evaluated per window, from 1 to 32
    ///
    /// The orders with the lowest estimated size are chosen.
    pub fn orders_per_window(self, orders: usize) -> Result<Self, Error> {
        match orders {
            1..=MAX_LPC_ORDER => Ok(Self {
                orders_per_window: orders,
                ..self
            }),
            _ => Err(Error::InvalidOrdersPerWindow),
        }
    }

    /// Sets the range of fixed predictor orders, from 0 to 4
    pub fn fixed_order(self, min: usize, max: usize) -> Result<Self, Error> {
        if min <= max && max <= MAX_FIXED_ORDER {
            Ok(Self {
                min_fixed_order: min,
                max_fixed_order: max,
                ..self
            })
        } else {
            Err(Error::InvalidFixedOrder)
        }
    }

    /// Sets the range of residual partition orders, from 0 to 15
    ///
    /// The maximum may not exceed log₂ of the block size.
    pub fn partition_order(self, min: u32, max: u32) -> Result<Self, Error> {
        if min <= max && max <= MAX_PARTITION_ORDER {
            Ok(Self {
                min_partition_order: min,
                max_partition_order: max,
                partition_order_set: true,
                ..self
            })
        } else {
            Err(Error::InvalidPartitionOrder)
        }
    }

    /// Sets the range of coefficient precision reductions, from 0 to 3
    ///
    /// Each LPC order is quantized once per reduction
    /// of the block size's base precision.
    pub fn precision_search(self, min: u32, max: u32) -> Result<Self, Error> {
        if min <= max && max <= 3 {
            Ok(Self {
                min_precision_search: min,
                max_precision_search: max,
                ..self
            })
        } else {
            Err(Error::InvalidPrecisionSearch)
        }
    }

    /// Sets the analysis windows
    pub fn windows(self, windows: Windows) -> Result<Self, Error> {
        match windows.is_empty() {
            true => Err(Error::NoWindows),
            false => Ok(Self { windows, ..self }),
        }
    }

    /// Whether to search stereo decorrelation modes
    pub fn stereo(self, stereo: bool) -> Self {
        Self { stereo, ..self }
    }

    /// Whether to remove wasted bits
    pub fn wasted_bits(self, wasted_bits: bool) -> Self {
        Self {
            wasted_bits,
            ..self
        }
    }

    /// Whether frame headers carry sample numbers
    /// rather than frame numbers
    pub fn variable_block_size(self, variable_block_size: bool) -> Self {
        Self {
            variable_block_size,
            ..self
        }
    }

    /// Whether to decode every frame again and compare it
    /// with the input, failing on any mismatch
    pub fn verify(self, verify: bool) -> Self {
        Self { verify, ..self }
    }

    /// Whether to write a SEEKTABLE block
    ///
    /// A seek table is only written for seekable streams
    /// with a known total number of samples.
    pub fn seektable(self, seektable: bool) -> Self {
        Self { seektable, ..self }
    }

    /// Sets the size of the PADDING block, in bytes
    ///
    /// A size of 0 writes no PADDING block.
    pub fn padding(self, padding: u32) -> Result<Self, Error> {
        match padding {
            0..=Self::MAX_PADDING => Ok(Self { padding, ..self }),
            _ => Err(Error::ExcessivePadding),
        }
    }

    /// Sets the frames analyzed per pipeline task, from 1 to 64
    pub fn frames_per_task(self, frames_per_task: usize) -> Result<Self, Error> {
        match frames_per_task {
            1..=64 => Ok(Self {
                frames_per_task,
                ..self
            }),
            _ => Err(Error::InvalidFramesPerTask),
        }
    }

    /// Sets the number of CPU worker threads, from 0 to 16
    ///
    /// With no workers, tasks are awaited on the calling thread.
    pub fn threads(self, threads: usize) -> Result<Self, Error> {
        match threads {
            0..=16 => Ok(Self { threads, ..self }),
            _ => Err(Error::InvalidThreadCount),
        }
    }

    /// Sets the compute device running signal analysis
    pub fn accelerator(self, accelerator: Arc<dyn Accelerator>) -> Self {
        Self {
            accelerator,
            ..self
        }
    }

    /// Whether to fall back to the CPU backend
    /// if the accelerator cannot create a queue
    pub fn accelerator_fallback(self, accelerator_fallback: bool) -> Self {
        Self {
            accelerator_fallback,
            ..self
        }
    }
}

/// The block size used when none is set explicitly
fn default_block_size(sample_rate: u32) -> u16 {
    let target = sample_rate / 10;
    let mut block_size = 256u32;
    while block_size * 2 <= target && block_size * 2 <= 32768 {
        block_size *= 2;
    }
    block_size as u16
}

/// A writer which cannot seek
///
/// Wrapping a stream in this allows it to be encoded to,
/// but its STREAMINFO and SEEKTABLE blocks will not
/// be updated once encoding finishes.
#[derive(Debug)]
pub struct Unseekable<W>(pub W);

impl<W: Write> Write for Unseekable<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl<W> Seek for Unseekable<W> {
    fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "stream is not seekable",
        ))
    }
}

/// Seek points to be resolved as frames are written
struct SeekPoints {
    targets: VecDeque<u64>,
    points: Vec<SeekPoint>,
    total: usize,
}

impl SeekPoints {
    /// One point for every 10 seconds of audio
    fn new(total_samples: u64, sample_rate: u32) -> Option<Self> {
        let interval = u64::from(sample_rate) * 10;
        let total = usize::try_from(total_samples.div_ceil(interval.max(1)))
            .ok()?
            .min(SeekTable::MAX_POINTS);
        (sample_rate > 0 && total > 0).then(|| Self {
            targets: (0..total as u64).map(|i| i * interval).collect(),
            points: Vec::with_capacity(total),
            total,
        })
    }

    /// Points every target within the frame at it
    ///
    /// Only the first target in a frame gets a point.
    fn add_frame(&mut self, frame: &FrameRecord, byte_offset: u64) {
        let end = frame.first_sample + frame.block_size as u64;
        let mut used = false;
        while self.targets.front().is_some_and(|target| *target < end) {
            self.targets.pop_front();
            if !used {
                self.points.push(SeekPoint::Defined {
                    sample_offset: frame.first_sample,
                    byte_offset,
                    frame_samples: frame.block_size as u16,
                });
                used = true;
            }
        }
    }

    fn table(&self) -> SeekTable {
        let mut points = self.points.clone();
        points.resize(self.total, SeekPoint::Placeholder);
        SeekTable { points }
    }
}

/// Where completed frames are written
struct Output<W: Write + Seek> {
    writer: Counter<W>,
    seekable: bool,
    streaminfo: Streaminfo,
    seekpoints: Option<SeekPoints>,
    frames_start: u64,
    frames: u64,
}

impl<W: Write + Seek> FrameSink for Output<W> {
    fn write_frame(&mut self, frame: FrameRecord) -> Result<(), Error> {
        let byte_offset = self.writer.count - self.frames_start;
        self.writer.write_all(&frame.bytes)?;

        self.frames += 1;
        self.streaminfo.add_frame_size(frame.bytes.len());
        if let Some(seekpoints) = &mut self.seekpoints {
            seekpoints.add_frame(&frame, byte_offset);
        }
        Ok(())
    }
}

impl<W: Write + Seek> Output<W> {
    /// Rewrites STREAMINFO and any SEEKTABLE in place,
    /// then returns to the end of the stream
    fn patch(&mut self) -> Result<(), Error> {
        self.writer.seek(SeekFrom::Start(FLAC_TAG.len() as u64))?;
        write_block(
            self.writer.by_ref(),
            &self.streaminfo.clone().into(),
            false,
        )?;
        if let Some(seekpoints) = &self.seekpoints {
            write_block(self.writer.by_ref(), &seekpoints.table().into(), false)?;
        }
        self.writer.seek(SeekFrom::End(0))?;
        self.writer.flush()?;
        Ok(())
    }
}

/// A FLAC encoder
///
/// Samples are analyzed in batches of frames as they arrive,
/// and completed frames are written in order.
/// The stream must be [finalized](Encoder::finalize)
/// once all samples have been encoded.
pub struct Encoder<W: Write + Seek> {
    output: Output<W>,
    scheduler: Scheduler,
    md5: md5::Context,
    md5_bytes: Vec<u8>,
    bytes_per_sample: usize,
    samples_received: u64,
    finalized: bool,
    failed: bool,
}

impl<W: Write + Seek> Encoder<W> {
    /// Creates new encoder and writes the stream's metadata blocks
    ///
    /// `sample_rate` must be less than 1048576 (a 20 bit field).
    ///
    /// `bits_per_sample` must be between 4 and 24.
    ///
    /// `channels` must be between 1 and 8.
    ///
    /// `total_samples`, if known, must be less than
    /// 68_719_476_736 (a 36 bit field).
    /// The number of samples encoded *must* then match it
    /// or an error will occur when encoding or finalizing.
    ///
    /// A SEEKTABLE block is only written if the total
    /// is known and the stream is seekable.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the parameters are invalid,
    /// or an I/O error if the metadata blocks cannot be written.
    pub fn new(
        writer: W,
        options: EncodingOptions,
        sample_rate: u32,
        bits_per_sample: u32,
        channels: NonZero<u8>,
        total_samples: Option<NonZero<u64>>,
    ) -> Result<Self, Error> {
        if sample_rate > Streaminfo::MAX_SAMPLE_RATE {
            return Err(Error::InvalidSampleRate);
        }
        if !(4..=24).contains(&bits_per_sample) {
            return Err(Error::InvalidBitsPerSample);
        }
        if channels.get() > Streaminfo::MAX_CHANNELS {
            return Err(Error::ExcessiveChannels);
        }
        if total_samples.is_some_and(|t| t.get() > Streaminfo::MAX_TOTAL_SAMPLES) {
            return Err(Error::ExcessiveTotalSamples);
        }

        let block_size = options
            .block_size
            .unwrap_or_else(|| default_block_size(sample_rate));
        if options.max_partition_order > block_size.ilog2() {
            return Err(Error::InvalidPartitionOrder);
        }

        let mut writer = Counter::new(writer);
        let seekable = writer.stream_position().is_ok();

        let streaminfo = Streaminfo {
            minimum_block_size: block_size,
            maximum_block_size: block_size,
            minimum_frame_size: None,
            maximum_frame_size: None,
            sample_rate,
            channels,
            bits_per_sample,
            total_samples,
            md5: None,
        };

        let seekpoints = match (options.seektable, seekable, total_samples) {
            (true, true, Some(total)) => SeekPoints::new(total.get(), sample_rate),
            _ => None,
        };

        let mut blocks: Vec<Block> = vec![streaminfo.clone().into()];
        if let Some(seekpoints) = &seekpoints {
            blocks.push(seekpoints.table().into());
        }
        blocks.push(VorbisComment::default().into());
        if options.padding > 0 {
            blocks.push(
                Padding {
                    size: BlockSize::try_from(options.padding)
                        .map_err(|_| Error::ExcessivePadding)?,
                }
                .into(),
            );
        }
        write_blocks(writer.by_ref(), &blocks)?;
        let frames_start = writer.count;

        let channels = usize::from(channels.get());
        let ctx = FrameContext {
            streaminfo: streaminfo.clone(),
            params: TaskParams {
                frames: options.frames_per_task,
                block_size: block_size.into(),
                channels,
                channels_count: match (channels, options.stereo) {
                    (2, true) => 4,
                    (channels, _) => channels,
                },
                bits_per_sample,
                windows: options.windows.len(),
                min_lpc_order: options.min_lpc_order,
                max_lpc_order: options.max_lpc_order,
                orders_per_window: options.orders_per_window,
                min_precision_search: options.min_precision_search,
                max_precision_search: options.max_precision_search,
                min_fixed_order: options.min_fixed_order,
                max_fixed_order: options.max_fixed_order,
                min_partition_order: options.min_partition_order,
                max_partition_order: options.max_partition_order,
                wasted_bits: options.wasted_bits,
            },
            windows: options.windows.iter().collect(),
            block_size: block_size.into(),
            variable_block_size: options.variable_block_size,
            verify: options.verify,
        };

        tracing::debug!(
            sample_rate,
            bits_per_sample,
            channels,
            block_size,
            seektable = seekpoints.is_some(),
            seekable,
            "starting encoder"
        );

        Ok(Self {
            scheduler: Scheduler::new(
                ctx,
                options.accelerator,
                options.accelerator_fallback,
                options.threads,
            )?,
            output: Output {
                writer,
                seekable,
                streaminfo,
                seekpoints,
                frames_start,
                frames: 0,
            },
            md5: md5::Context::new(),
            md5_bytes: vec![],
            bytes_per_sample: bits_per_sample.div_ceil(8) as usize,
            samples_received: 0,
            finalized: false,
            failed: false,
        })
    }

    /// Encodes interleaved PCM samples
    ///
    /// Depending on the encoder's block size and task size,
    /// this may write zero or more FLAC frames to the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the samples are not a whole number
    /// of PCM frames, if any sample is out of range for
    /// the stream's bits-per-sample, if more samples arrive
    /// than the stream's declared total, or if
    /// analysis or writing frames fails.
    /// After an analysis or write failure the stream cannot
    /// be finalized and every further call fails.
    pub fn encode(&mut self, samples: &[i32]) -> Result<(), Error> {
        if self.failed {
            return Err(Error::EncoderFailed);
        }

        let streaminfo = &self.output.streaminfo;
        let channels = usize::from(streaminfo.channels.get());
        if samples.len() % channels != 0 {
            return Err(Error::MisalignedSamples);
        }

        let max = (1i32 << (streaminfo.bits_per_sample - 1)) - 1;
        let min = -max - 1;
        if samples.iter().any(|s| !(min..=max).contains(s)) {
            return Err(Error::SampleOutOfRange);
        }

        let received = self.samples_received + (samples.len() / channels) as u64;
        match streaminfo.total_samples {
            Some(total) if received > total.get() => return Err(Error::SampleCountMismatch),
            _ if received > Streaminfo::MAX_TOTAL_SAMPLES => {
                return Err(Error::ExcessiveTotalSamples);
            }
            _ => {}
        }

        self.scheduler
            .push(samples, &mut self.output)
            .inspect_err(|_| self.failed = true)?;

        self.samples_received = received;
        self.md5_bytes.resize(samples.len() * self.bytes_per_sample, 0);
        for (sample, bytes) in samples
            .iter()
            .zip(self.md5_bytes.chunks_exact_mut(self.bytes_per_sample))
        {
            LittleEndian::sample_to_bytes(*sample, bytes);
        }
        self.md5.consume(&self.md5_bytes);
        Ok(())
    }

    /// Stops the workers and leaves the stream as written so far
    fn discard(&mut self) {
        self.finalized = true;
        self.scheduler.shutdown();
    }

    fn finalize_inner(&mut self) -> Result<(), Error> {
        if self.finalized {
            return Ok(());
        }
        if self.failed {
            self.discard();
            return Err(Error::EncoderFailed);
        }

        if let Err(err) = self.scheduler.flush(&mut self.output) {
            self.failed = true;
            self.discard();
            return Err(err);
        }
        self.discard();

        let streaminfo = &mut self.output.streaminfo;
        match streaminfo.total_samples {
            Some(total) if total.get() != self.samples_received => {
                return Err(Error::SampleCountMismatch);
            }
            Some(_) => {}
            None => streaminfo.total_samples = NonZero::new(self.samples_received),
        }
        streaminfo.md5 = Some(self.md5.clone().compute().0);

        tracing::info!(
            samples = self.samples_received,
            frames = self.output.frames,
            bytes = self.output.writer.count,
            "encoding finished"
        );

        if self.output.seekable {
            self.output.patch()
        } else {
            tracing::warn!("stream not seekable, leaving STREAMINFO unfinished");
            self.output.writer.flush()?;
            Ok(())
        }
    }

    /// Attempt to finalize stream
    ///
    /// It is necessary to finalize the FLAC encoder
    /// so that it will write any partially unwritten samples
    /// to the stream and update the STREAMINFO and SEEKTABLE blocks
    /// with their final values.
    ///
    /// Dropping the encoder will attempt to finalize the stream
    /// automatically, but will ignore any errors that may occur.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncoderFailed`] without touching the
    /// stream's metadata if an earlier call to
    /// [`encode`](Encoder::encode) failed during analysis or writing.
    pub fn finalize(mut self) -> Result<(), Error> {
        self.finalize_inner()
    }

    /// Stops encoding without finalizing the stream
    ///
    /// Worker threads are stopped and unwritten samples discarded.
    /// The stream is left incomplete and should be deleted.
    pub fn abort(mut self) {
        self.discard();
        tracing::debug!(
            samples = self.samples_received,
            "encoding aborted"
        );
    }
}

impl<W: Write + Seek> Drop for Encoder<W> {
    fn drop(&mut self) {
        match self.failed {
            true => self.discard(),
            false => {
                let _ = self.finalize_inner();
            }
        }
    }
}

/// A FLAC encoder accepting raw PCM bytes
///
/// Bytes are converted to samples using the given byte order,
/// with each sample taking the fewest whole bytes
/// its bits-per-sample needs.
///
/// # Example
///
/// ```
/// use flac_accel::byteorder::LittleEndian;
/// use flac_accel::encode::{EncodingOptions, FlacWriter};
/// use std::io::{Cursor, Write};
/// use std::num::NonZero;
///
/// let mut flac = Cursor::new(vec![]);
/// let mut writer = FlacWriter::<_, LittleEndian>::new(
///     &mut flac,
///     EncodingOptions::default(),
///     44100,
///     16,
///     NonZero::new(1).unwrap(),
///     None,
/// ).unwrap();
///
/// writer.write_all(&[0x01, 0x00, 0xFF, 0xFF, 0x00]).unwrap();
/// writer.write_all(&[0x80]).unwrap();
/// writer.finalize().unwrap();
/// ```
pub struct FlacWriter<W: Write + Seek, E: Endianness> {
    encoder: Encoder<W>,
    buf: Vec<u8>,
    samples: Vec<i32>,
    bytes_per_sample: usize,
    pcm_frame_size: usize,
    endianness: PhantomData<E>,
}

impl<W: Write + Seek, E: Endianness> FlacWriter<W, E> {
    /// Creates new writer, with the same parameters as [`Encoder::new`]
    pub fn new(
        writer: W,
        options: EncodingOptions,
        sample_rate: u32,
        bits_per_sample: u32,
        channels: NonZero<u8>,
        total_samples: Option<NonZero<u64>>,
    ) -> Result<Self, Error> {
        let bytes_per_sample = bits_per_sample.div_ceil(8) as usize;
        Ok(Self {
            encoder: Encoder::new(
                writer,
                options,
                sample_rate,
                bits_per_sample,
                channels,
                total_samples,
            )?,
            buf: vec![],
            samples: vec![],
            bytes_per_sample,
            pcm_frame_size: bytes_per_sample * usize::from(channels.get()),
            endianness: PhantomData,
        })
    }

    /// Encodes any buffered bytes and finalizes the stream
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes written were not
    /// a whole number of PCM frames, or if finalizing fails.
    pub fn finalize(self) -> Result<(), Error> {
        if !self.buf.is_empty() {
            self.encoder.abort();
            return Err(Error::MisalignedSamples);
        }
        self.encoder.finalize()
    }
}

impl<W: Write + Seek, E: Endianness> Write for FlacWriter<W, E> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        let whole = self.buf.len() - self.buf.len() % self.pcm_frame_size;

        self.samples.clear();
        E::bytes_to_samples(&self.buf[..whole], self.bytes_per_sample, &mut self.samples);
        self.buf.drain(..whole);

        self.encoder
            .encode(&self.samples)
            .map_err(std::io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_presets() {
        for level in 0..=EncodingOptions::MAX_LEVEL {
            let options = EncodingOptions::preset(level).unwrap();
            assert!(options.min_lpc_order <= options.max_lpc_order);
            assert!(options.min_fixed_order <= options.max_fixed_order);
            assert!(!options.windows.is_empty());
            assert_eq!(options.padding, 4096);
            assert_eq!(options.frames_per_task, 8);
            assert!(options.seektable);
            assert!(!options.verify);
        }
        assert!(matches!(
            EncodingOptions::preset(13),
            Err(Error::InvalidCompressionLevel)
        ));

        let default = EncodingOptions::default();
        assert_eq!(default.max_lpc_order, 8);
        assert_eq!(default.orders_per_window, 4);
        assert_eq!(
            default.windows.iter().collect::<Vec<_>>(),
            vec![Window::Flattop, Window::Tukey]
        );

        let level0 = EncodingOptions::preset(0).unwrap();
        assert!(!level0.stereo);
        assert!(!level0.wasted_bits);
        assert_eq!(EncodingOptions::preset(12).unwrap().windows.len(), 4);
    }

    #[test]
    fn test_validation() {
        let options = EncodingOptions::default;
        assert!(matches!(options().block_size(15), Err(Error::InvalidBlockSize)));
        assert!(matches!(options().lpc_order(0, 8), Err(Error::InvalidLpcOrder)));
        assert!(matches!(options().lpc_order(9, 8), Err(Error::InvalidLpcOrder)));
        assert!(matches!(options().lpc_order(1, 33), Err(Error::InvalidLpcOrder)));
        assert!(matches!(options().fixed_order(0, 5), Err(Error::InvalidFixedOrder)));
        assert!(matches!(
            options().partition_order(0, 16),
            Err(Error::InvalidPartitionOrder)
        ));
        assert!(matches!(
            options().precision_search(0, 4),
            Err(Error::InvalidPrecisionSearch)
        ));
        assert!(matches!(options().windows(Windows::default()), Err(Error::NoWindows)));
        assert!(matches!(
            options().orders_per_window(0),
            Err(Error::InvalidOrdersPerWindow)
        ));
        assert!(matches!(
            options().frames_per_task(65),
            Err(Error::InvalidFramesPerTask)
        ));
        assert!(matches!(options().threads(17), Err(Error::InvalidThreadCount)));
        assert!(matches!(options().padding(1 << 24), Err(Error::ExcessivePadding)));
    }

    #[test]
    fn test_partition_order_follows_block_size() {
        let options = EncodingOptions::default().block_size(64).unwrap();
        assert_eq!(options.max_partition_order, 6);

        // an explicit range is kept, and rejected once
        // the encoder knows it exceeds the block size
        let options = EncodingOptions::default()
            .partition_order(0, 8)
            .and_then(|o| o.block_size(64))
            .unwrap();
        assert_eq!(options.max_partition_order, 8);
        assert!(matches!(
            Encoder::new(
                std::io::Cursor::new(vec![]),
                options,
                44100,
                16,
                NonZero::new(1).unwrap(),
                None,
            ),
            Err(Error::InvalidPartitionOrder)
        ));
    }

    #[test]
    fn test_default_block_size() {
        assert_eq!(default_block_size(44100), 4096);
        assert_eq!(default_block_size(48000), 4096);
        assert_eq!(default_block_size(96000), 8192);
        assert_eq!(default_block_size(8000), 512);
        assert_eq!(default_block_size(0), 256);
        assert_eq!(default_block_size(Streaminfo::MAX_SAMPLE_RATE), (65536u32 / 2) as u16);
    }

    #[test]
    fn test_seek_points() {
        let mut seekpoints = SeekPoints::new(441000 * 3 + 5, 44100).unwrap();
        assert_eq!(seekpoints.total, 4);

        let frame = |first_sample, block_size| FrameRecord {
            first_sample,
            block_size,
            bytes: vec![],
        };

        seekpoints.add_frame(&frame(0, 4096), 0);
        seekpoints.add_frame(&frame(438272, 4096), 1000);
        seekpoints.add_frame(&frame(442368, 4096), 2000);
        let table = seekpoints.table();
        assert_eq!(
            table.points,
            vec![
                SeekPoint::Defined {
                    sample_offset: 0,
                    byte_offset: 0,
                    frame_samples: 4096
                },
                SeekPoint::Defined {
                    sample_offset: 438272,
                    byte_offset: 1000,
                    frame_samples: 4096
                },
                SeekPoint::Placeholder,
                SeekPoint::Placeholder,
            ]
        );

        // two targets within one frame share a single point
        let mut seekpoints = SeekPoints::new(30, 1).unwrap();
        seekpoints.add_frame(&frame(0, 25), 0);
        assert_eq!(seekpoints.points.len(), 1);
        assert_eq!(seekpoints.table().points.len(), 3);

        assert!(SeekPoints::new(1000, 0).is_none());
    }
}
