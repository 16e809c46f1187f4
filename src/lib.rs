// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A FLAC encoder whose signal analysis runs as a pipeline
//! of data-parallel kernels on a pluggable compute device.
//!
//! PCM samples are staged into task slots, analyzed by an
//! [`accel::Accelerator`] (a CPU reference backend is included),
//! finalized on the host and serialized to a FLAC stream.
//!
//! # Example
//!
//! ```
//! use flac_accel::encode::{Encoder, EncodingOptions};
//! use flac_accel::decode::Decoder;
//! use std::io::{Cursor, Seek};
//! use std::num::NonZero;
//!
//! let mut flac = Cursor::new(vec![]);
//!
//! let samples = (0..20000).map(|i| (i % 200) - 100).collect::<Vec<i32>>();
//!
//! let mut encoder = Encoder::new(
//!     &mut flac,
//!     EncodingOptions::default(),
//!     44100,
//!     16,
//!     NonZero::new(2).unwrap(),
//!     NonZero::new(10000),
//! ).unwrap();
//!
//! encoder.encode(&samples).unwrap();
//! encoder.finalize().unwrap();
//!
//! flac.rewind().unwrap();
//!
//! let decoded = Decoder::new(flac).unwrap().decode_all().unwrap();
//! assert_eq!(decoded, samples);
//! ```

pub mod accel;
pub mod byteorder;
mod crc;
pub mod decode;
pub mod encode;
mod frame;
pub mod lpc;
pub mod metadata;
mod pipeline;
pub mod predict;
pub mod rice;
pub mod stream;

/// A unified FLAC error
#[derive(Debug)]
pub enum Error {
    /// A general I/O error from the underlying stream
    Io(std::io::Error),
    /// A UTF-8 formatting error
    Utf8(std::string::FromUtf8Error),
    /// A FLAC file missing its initial "fLaC" file tag
    MissingFlacTag,
    /// A FLAC file missing its initial STREAMINFO block
    MissingStreaminfo,
    /// A FLAC file containing multiple STREAMINFO blocks
    MultipleStreaminfo,
    /// A FLAC file containing multiple SEEKTABLE blocks
    MultipleSeekTable,
    /// A FLAC file containing multiple VORBIS_COMMENT blocks
    MultipleVorbisComment,
    /// A SEEKTABLE block with a size not evenly divisible by 18
    InvalidSeekTableSize,
    /// A SEEKTABLE point whose offset does not increment properly
    InvalidSeekTablePoint,
    /// An undefined reserved block type
    ReservedMetadataBlock,
    /// A metadata block type of 127
    InvalidMetadataBlock,
    /// A metadata block whose contents differ from its declared size
    InvalidMetadataBlockSize,
    /// A metadata block larger than its 24 bit size field
    ExcessiveBlockSize,
    /// A VORBIS_COMMENT string too large for its length field
    ExcessiveStringLength,
    /// Too many VORBIS_COMMENT entries for its count field
    ExcessiveVorbisEntries,
    /// An invalid frame sync code
    InvalidSyncCode,
    /// A frame header with a reserved bit set
    ReservedFrameBit,
    /// An invalid or unsupported block size
    InvalidBlockSize,
    /// An invalid or unsupported sample rate
    InvalidSampleRate,
    /// An invalid channel count or channel assignment
    InvalidChannels,
    /// An invalid or unsupported bits-per-sample value
    InvalidBitsPerSample,
    /// An invalid UTF-8 style frame number
    InvalidFrameNumber,
    /// A frame number too large for its field
    ExcessiveFrameNumber,
    /// A frame header CRC-8 mismatch
    Crc8Mismatch,
    /// A frame CRC-16 mismatch
    Crc16Mismatch,
    /// An invalid subframe header
    InvalidSubframeHeader,
    /// More wasted bits than bits-per-sample
    ExcessiveWastedBits,
    /// A reserved residual coding method
    InvalidCodingMethod,
    /// A partition order out of range for its block
    InvalidPartitionOrder,
    /// An invalid LPC coefficient precision
    InvalidLpcPrecision,
    /// A negative LPC shift
    NegativeLpcShift,
    /// A residual or restored sample which does not fit in 32 bits
    ResidualOverflow,
    /// A compression level outside 0..=12
    InvalidCompressionLevel,
    /// An LPC order range that is empty or out of bounds
    InvalidLpcOrder,
    /// A fixed predictor order range that is empty or out of bounds
    InvalidFixedOrder,
    /// A coefficient precision search range that is empty or out of bounds
    InvalidPrecisionSearch,
    /// No analysis window functions selected
    NoWindows,
    /// An invalid number of LPC orders to evaluate per window
    InvalidOrdersPerWindow,
    /// An invalid number of frames per pipeline task
    InvalidFramesPerTask,
    /// An invalid number of CPU worker threads
    InvalidThreadCount,
    /// A PADDING block larger than its size field
    ExcessivePadding,
    /// More than 8 channels
    ExcessiveChannels,
    /// More total samples than the stream can indicate
    ExcessiveTotalSamples,
    /// A sample buffer whose length is not a multiple of its channel count
    MisalignedSamples,
    /// A sample outside the range of its bits-per-sample
    SampleOutOfRange,
    /// The number of samples written differs from the declared total
    SampleCountMismatch,
    /// A serialized subframe whose size differs from its computed size
    EstimateMismatch,
    /// A frame which does not decode back to its input samples
    VerifyMismatch,
    /// An error reported by the compute device
    Accelerator(String),
    /// A device buffer handle which is unknown or of the wrong type
    InvalidBuffer,
    /// A device buffer mapped while commands are still pending
    BufferBusy,
    /// A task slot used out of its expected state
    InvalidSlotState,
    /// A worker thread which exited unexpectedly
    WorkerDisconnected,
    /// An encoder used after an earlier analysis or write error
    EncoderFailed,
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(error: std::string::FromUtf8Error) -> Self {
        Self::Utf8(error)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Utf8(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
            Self::MissingFlacTag => "missing FLAC tag".fmt(f),
            Self::MissingStreaminfo => "STREAMINFO block not first in file".fmt(f),
            Self::MultipleStreaminfo => "multiple STREAMINFO blocks found in file".fmt(f),
            Self::MultipleSeekTable => "multiple SEEKTABLE blocks found in file".fmt(f),
            Self::MultipleVorbisComment => {
                "multiple VORBIS_COMMENT blocks found in file".fmt(f)
            }
            Self::InvalidSeekTableSize => "invalid SEEKTABLE block size".fmt(f),
            Self::InvalidSeekTablePoint => "invalid SEEKTABLE point".fmt(f),
            Self::ReservedMetadataBlock => "reserved metadata block".fmt(f),
            Self::InvalidMetadataBlock => "invalid metadata block".fmt(f),
            Self::InvalidMetadataBlockSize => "invalid metadata block size".fmt(f),
            Self::ExcessiveBlockSize => "metadata block too large".fmt(f),
            Self::ExcessiveStringLength => "VORBIS_COMMENT string too large".fmt(f),
            Self::ExcessiveVorbisEntries => "too many VORBIS_COMMENT entries".fmt(f),
            Self::InvalidSyncCode => "invalid frame sync code".fmt(f),
            Self::ReservedFrameBit => "reserved frame header bit set".fmt(f),
            Self::InvalidBlockSize => "invalid block size".fmt(f),
            Self::InvalidSampleRate => "invalid sample rate".fmt(f),
            Self::InvalidChannels => "invalid channel assignment".fmt(f),
            Self::InvalidBitsPerSample => "invalid bits-per-sample".fmt(f),
            Self::InvalidFrameNumber => "invalid frame number".fmt(f),
            Self::ExcessiveFrameNumber => "frame number too large".fmt(f),
            Self::Crc8Mismatch => "frame header CRC-8 mismatch".fmt(f),
            Self::Crc16Mismatch => "frame CRC-16 mismatch".fmt(f),
            Self::InvalidSubframeHeader => "invalid subframe header".fmt(f),
            Self::ExcessiveWastedBits => "excessive wasted bits in subframe".fmt(f),
            Self::InvalidCodingMethod => "invalid residual coding method".fmt(f),
            Self::InvalidPartitionOrder => "invalid residual partition order".fmt(f),
            Self::InvalidLpcPrecision => "invalid LPC coefficient precision".fmt(f),
            Self::NegativeLpcShift => "negative LPC shift".fmt(f),
            Self::ResidualOverflow => "residual value out of range".fmt(f),
            Self::InvalidCompressionLevel => "compression level must be 0 to 12".fmt(f),
            Self::InvalidLpcOrder => "invalid LPC order range".fmt(f),
            Self::InvalidFixedOrder => "invalid fixed predictor order range".fmt(f),
            Self::InvalidPrecisionSearch => "invalid coefficient precision search".fmt(f),
            Self::NoWindows => "no analysis windows selected".fmt(f),
            Self::InvalidOrdersPerWindow => "invalid number of orders per window".fmt(f),
            Self::InvalidFramesPerTask => "invalid number of frames per task".fmt(f),
            Self::InvalidThreadCount => "invalid number of worker threads".fmt(f),
            Self::ExcessivePadding => "PADDING block too large".fmt(f),
            Self::ExcessiveChannels => "excessive channel count".fmt(f),
            Self::ExcessiveTotalSamples => "excessive total samples".fmt(f),
            Self::MisalignedSamples => "samples not a multiple of channel count".fmt(f),
            Self::SampleOutOfRange => "sample out of range for bits-per-sample".fmt(f),
            Self::SampleCountMismatch => "samples written differ from total samples".fmt(f),
            Self::EstimateMismatch => "subframe size differs from its estimate".fmt(f),
            Self::VerifyMismatch => "encoded frame does not match input".fmt(f),
            Self::Accelerator(msg) => write!(f, "accelerator error: {msg}"),
            Self::InvalidBuffer => "invalid device buffer".fmt(f),
            Self::BufferBusy => "device buffer mapped with pending commands".fmt(f),
            Self::InvalidSlotState => "task slot in unexpected state".fmt(f),
            Self::WorkerDisconnected => "worker thread disconnected".fmt(f),
            Self::EncoderFailed => "encoder stopped by an earlier error".fmt(f),
        }
    }
}

/// Counts the bytes passing through a writer
struct Counter<W> {
    stream: W,
    count: u64,
}

impl<W> Counter<W> {
    fn new(stream: W) -> Self {
        Self { stream, count: 0 }
    }
}

impl<W: std::io::Write> std::io::Write for Counter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream.write(buf).inspect(|written| {
            self.count += *written as u64;
        })
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }
}

impl<W: std::io::Seek> std::io::Seek for Counter<W> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.stream.seek(pos)
    }
}
