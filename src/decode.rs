// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For decoding FLAC files to PCM samples

use crate::Error;
use crate::crc::{Checksum, Crc16, CrcReader};
use crate::lpc::{self, MAX_LPC_ORDER};
use crate::metadata::{Block, SeekTable, Streaminfo, read_blocks};
use crate::predict::FIXED_COEFFICIENTS;
use crate::rice::{CodingMethod, unzigzag};
use crate::stream::{ChannelAssignment, FrameHeader, SubframeHeader, SubframeHeaderType};
use arrayvec::ArrayVec;
use bitstream_io::{BigEndian, BitRead, BitReader};
use std::io::{BufRead, BufReader, Read};

/// A decoded FLAC frame
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// The frame's header
    pub header: FrameHeader,
    /// Each subframe's header, in channel order
    pub subframes: Vec<SubframeHeader>,
    /// Samples, interleaved by channel
    pub samples: Vec<i32>,
}

impl Frame {
    /// Number of channels in the frame
    pub fn channel_count(&self) -> usize {
        self.header.channel_assignment.count().into()
    }

    /// Number of samples per channel
    pub fn pcm_frames(&self) -> usize {
        self.header.block_size.into()
    }
}

/// Reads and decodes a whole frame, including its CRC-16
///
/// # Errors
///
/// Returns an error if the frame is invalid,
/// either of its checksums does not match,
/// or an I/O error occurs.
pub fn decode_frame<R: Read>(reader: R, streaminfo: &Streaminfo) -> Result<Frame, Error> {
    let mut crc16: CrcReader<R, Crc16> = CrcReader::new(reader);
    let header = FrameHeader::read(crc16.by_ref(), streaminfo)?;
    let block_size = usize::from(header.block_size);

    let mut r = BitReader::endian(crc16.by_ref(), BigEndian);

    let (subframes, channels): (Vec<_>, Vec<_>) = (0..usize::from(header.channel_assignment.count()))
        .map(|channel| {
            let bps = header.bits_per_sample
                + u32::from(header.channel_assignment.is_side(channel));
            match bps {
                ..=32 => read_subframe(&mut r, block_size, bps),
                _ => Err(Error::InvalidBitsPerSample),
            }
        })
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .unzip();

    r.byte_align();
    let _crc16 = r.read_to::<u16>()?;

    if !crc16.into_checksum().valid() {
        return Err(Error::Crc16Mismatch);
    }

    let mut samples = Vec::with_capacity(block_size * channels.len());
    match (header.channel_assignment, channels.as_slice()) {
        (ChannelAssignment::Independent(_), channels) => {
            for i in 0..block_size {
                samples.extend(channels.iter().map(|c| c[i]));
            }
        }
        (ChannelAssignment::LeftSide, [left, side]) => {
            for (l, s) in left.iter().zip(side) {
                samples.extend([*l, l.wrapping_sub(*s)]);
            }
        }
        (ChannelAssignment::SideRight, [side, right]) => {
            for (s, r) in side.iter().zip(right) {
                samples.extend([s.wrapping_add(*r), *r]);
            }
        }
        (ChannelAssignment::MidSide, [mid, side]) => {
            for (m, s) in mid.iter().zip(side) {
                let (m, s) = (i64::from(*m), i64::from(*s));
                let mid = (m << 1) | (s & 1);
                samples.extend([((mid + s) >> 1) as i32, ((mid - s) >> 1) as i32]);
            }
        }
        _ => return Err(Error::InvalidChannels),
    }

    Ok(Frame {
        header,
        subframes,
        samples,
    })
}

/// Decodes a serialized frame and compares it with
/// the interleaved samples it was encoded from
///
/// # Errors
///
/// Returns [`Error::VerifyMismatch`] if the frame cannot be decoded,
/// if decoding consumes a different number of bytes than the frame holds,
/// or if any sample differs.
pub fn verify_frame(frame: &[u8], streaminfo: &Streaminfo, expected: &[i32]) -> Result<(), Error> {
    let mut reader = frame;
    match decode_frame(&mut reader, streaminfo) {
        Ok(decoded) if reader.is_empty() && decoded.samples == expected => Ok(()),
        _ => Err(Error::VerifyMismatch),
    }
}

/// Reads a signed value of the given width
fn read_signed<R: BitRead>(r: &mut R, bits: u32) -> Result<i32, Error> {
    let unsigned = r.read_var::<u32>(bits)?;
    let unused = 32 - bits;
    Ok(((unsigned << unused) as i32) >> unused)
}

fn read_subframe<R: BitRead>(
    r: &mut R,
    block_size: usize,
    bits_per_sample: u32,
) -> Result<(SubframeHeader, Vec<i32>), Error> {
    let header = r.parse::<SubframeHeader>()?;

    let effective_bps = bits_per_sample
        .checked_sub(header.wasted_bps)
        .filter(|bps| *bps > 0)
        .ok_or(Error::ExcessiveWastedBits)?;

    let mut samples = vec![0; block_size];

    match header.type_ {
        SubframeHeaderType::Constant => {
            samples.fill(read_signed(r, effective_bps)?);
        }
        SubframeHeaderType::Verbatim => {
            samples
                .iter_mut()
                .try_for_each(|s| read_signed(r, effective_bps).map(|v| *s = v))?;
        }
        SubframeHeaderType::Fixed(order) => {
            let order = usize::from(order);
            read_warm_up(r, &mut samples, order, effective_bps)?;
            read_residual(r, order, &mut samples)?;
            if !lpc::restore(FIXED_COEFFICIENTS[order], 0, &mut samples) {
                return Err(Error::ResidualOverflow);
            }
        }
        SubframeHeaderType::Lpc(order) => {
            let order = usize::from(order);
            read_warm_up(r, &mut samples, order, effective_bps)?;

            let precision = match r.read::<4, u32>()? {
                0b1111 => return Err(Error::InvalidLpcPrecision),
                p => p + 1,
            };
            let shift = u32::try_from(read_signed(r, 5)?).map_err(|_| Error::NegativeLpcShift)?;
            let coefficients = (0..order)
                .map(|_| read_signed(r, precision))
                .collect::<Result<ArrayVec<i32, MAX_LPC_ORDER>, _>>()?;

            read_residual(r, order, &mut samples)?;
            if !lpc::restore(&coefficients, shift, &mut samples) {
                return Err(Error::ResidualOverflow);
            }
        }
    }

    if header.wasted_bps > 0 {
        samples.iter_mut().for_each(|s| *s <<= header.wasted_bps);
    }

    Ok((header, samples))
}

fn read_warm_up<R: BitRead>(
    r: &mut R,
    samples: &mut [i32],
    order: usize,
    bits: u32,
) -> Result<(), Error> {
    samples
        .get_mut(..order)
        .ok_or(Error::InvalidSubframeHeader)?
        .iter_mut()
        .try_for_each(|s| read_signed(r, bits).map(|v| *s = v))
}

/// Reads a residual block into `samples[order..]`
fn read_residual<R: BitRead>(
    r: &mut R,
    order: usize,
    samples: &mut [i32],
) -> Result<(), Error> {
    let method = match r.read::<2, u8>()? {
        0 => CodingMethod::Rice,
        1 => CodingMethod::Rice2,
        _ => return Err(Error::InvalidCodingMethod),
    };
    let partition_order = r.read::<4, u32>()?;

    let block_size = samples.len();
    let partition_size = block_size >> partition_order;
    if partition_size << partition_order != block_size || partition_size < order {
        return Err(Error::InvalidPartitionOrder);
    }

    let mut residual = &mut samples[order..];
    for partition in 0..1 << partition_order {
        let count = match partition {
            0 => partition_size - order,
            _ => partition_size,
        };
        let (values, rest) = residual.split_at_mut(count);
        residual = rest;

        match r.read_var::<u32>(method.parameter_bits())? {
            k if k == method.escape() => match r.read::<5, u32>()? {
                0 => values.fill(0),
                bits => values
                    .iter_mut()
                    .try_for_each(|v| read_signed(r, bits).map(|s| *v = s))?,
            },
            k => values.iter_mut().try_for_each(|v| {
                let msb = u64::from(r.read_unary::<1>()?);
                let lsb = match k {
                    0 => 0,
                    k => u64::from(r.read_var::<u32>(k)?),
                };
                *v = unzigzag(u32::try_from((msb << k) | lsb).map_err(|_| Error::ResidualOverflow)?);
                Ok::<(), Error>(())
            })?,
        }
    }

    Ok(())
}

/// A FLAC decoder
pub struct Decoder<R> {
    reader: BufReader<R>,
    streaminfo: Streaminfo,
    seektable: Option<SeekTable>,
    samples_read: u64,
}

impl<R: Read> Decoder<R> {
    /// Builds a new FLAC decoder from the given stream
    ///
    /// This assumes the stream is positioned at the start
    /// of the file.
    ///
    /// # Errors
    ///
    /// Returns an error of the initial FLAC metadata
    /// is invalid or an I/O error occurs reading
    /// the initial metadata.
    pub fn new(reader: R) -> Result<Self, Error> {
        let mut reader = BufReader::new(reader);
        let mut streaminfo = None;
        let mut seektable = None;

        for block in read_blocks(reader.by_ref()) {
            match block? {
                Block::Streaminfo(s) => streaminfo = Some(s),
                Block::SeekTable(s) => seektable = Some(s),
                _ => { /* ignore other blocks */ }
            }
        }

        Ok(Self {
            reader,
            // read_blocks should check for this already
            streaminfo: streaminfo.ok_or(Error::MissingStreaminfo)?,
            seektable,
            samples_read: 0,
        })
    }

    /// The stream's STREAMINFO block
    pub fn streaminfo(&self) -> &Streaminfo {
        &self.streaminfo
    }

    /// The stream's SEEKTABLE block, if any
    pub fn seektable(&self) -> Option<&SeekTable> {
        self.seektable.as_ref()
    }

    /// Reads the next whole FLAC frame
    ///
    /// Returns `None` at the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs when reading
    /// the stream, or if the stream data is invalid.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, Error> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let frame = decode_frame(self.reader.by_ref(), &self.streaminfo)?;
        self.samples_read += frame.pcm_frames() as u64;
        Ok(Some(frame))
    }

    /// Decodes every remaining frame to interleaved samples
    ///
    /// # Errors
    ///
    /// Returns an error if any frame is invalid,
    /// or if the number of samples differs from the stream's total.
    pub fn decode_all(mut self) -> Result<Vec<i32>, Error> {
        let mut samples = vec![];
        while let Some(frame) = self.read_frame()? {
            samples.extend(frame.samples);
        }
        match self.streaminfo.total_samples {
            Some(total) if total.get() != self.samples_read => Err(Error::SampleCountMismatch),
            _ => Ok(samples),
        }
    }
}
