// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For handling common FLAC stream items
//!
//! # Frame Header
//!
//! | Bits | Field | Meaning |
//! |-----:|------:|---------|
//! | 15   | sync code | always `0b111111111111100`
//! | 1    | `variable_block_size` | whether `number` is a sample number
//! | 4    | block size code | standard size, or explicit size follows
//! | 4    | sample rate code | standard rate, or explicit rate follows
//! | 4    | channel assignment | channel count or stereo decorrelation
//! | 3    | bits-per-sample code | standard depth, or 0 for STREAMINFO's
//! | 1    | reserved | always 0
//! | 8-56 | `number` | frame or sample number, UTF-8 style
//! | 0/8/16 | explicit block size | block size - 1
//! | 0/8/16 | explicit sample rate | in kHz, Hz or tens of Hz
//! | 8    | CRC-8 | of all preceding header bytes

use crate::Error;
use crate::crc::{Checksum, Crc8, CrcReader, CrcWriter};
use crate::metadata::Streaminfo;
use bitstream_io::{
    BigEndian, BitRead, BitReader, BitWrite, BitWriter, FromBitStream, FromBitStreamWith,
    ToBitStream,
};
use std::io::{Read, Write};

const SYNC_CODE: u16 = 0b111111111111100;

/// A FLAC frame header
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameHeader {
    /// Whether the stream uses a variable block size,
    /// in which case `number` is the frame's first sample number
    pub variable_block_size: bool,
    /// The frame number, or first sample number
    pub number: u64,
    /// The frame's block size, in samples
    pub block_size: u16,
    /// The frame's sample rate, in Hz
    pub sample_rate: u32,
    /// How channels are stored in the frame
    pub channel_assignment: ChannelAssignment,
    /// The frame's bits-per-sample
    pub bits_per_sample: u32,
}

impl FrameHeader {
    /// The largest number a frame header may carry (36 bits)
    pub const MAX_NUMBER: u64 = (1 << 36) - 1;

    /// Reads a frame header and its trailing CRC-8 from the given reader
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid,
    /// its CRC-8 does not match, or an I/O error occurs.
    pub fn read<R: std::io::Read>(reader: R, streaminfo: &Streaminfo) -> Result<Self, Error> {
        let mut crc: CrcReader<R, Crc8> = CrcReader::new(reader);
        let mut r = BitReader::endian(crc.by_ref(), BigEndian);
        let header = r.parse_with(streaminfo)?;
        let _crc8 = r.read_to::<u8>()?;
        crc.into_checksum()
            .valid()
            .then_some(header)
            .ok_or(Error::Crc8Mismatch)
    }

    /// Writes frame header and its trailing CRC-8 to the given writer
    pub fn write<W: std::io::Write>(&self, writer: W) -> Result<(), Error> {
        let mut crc: CrcWriter<W, Crc8> = CrcWriter::new(writer);
        BitWriter::endian(crc.by_ref(), BigEndian).build(self)?;
        let crc8 = crc.checksum();
        crc.into_writer().write_all(&[crc8])?;
        Ok(())
    }
}

impl FromBitStreamWith<'_> for FrameHeader {
    type Error = Error;
    type Context = Streaminfo;

    fn from_reader<R: BitRead + ?Sized>(
        r: &mut R,
        streaminfo: &Streaminfo,
    ) -> Result<Self, Self::Error> {
        if r.read::<15, u16>()? != SYNC_CODE {
            return Err(Error::InvalidSyncCode);
        }
        let variable_block_size = r.read_bit()?;
        let encoded_block_size = r.read::<4, u8>()?;
        let encoded_sample_rate = r.read::<4, u8>()?;
        let channel_assignment = r.parse()?;
        let encoded_bps = r.read::<3, u8>()?;
        if r.read_bit()? {
            return Err(Error::ReservedFrameBit);
        }
        let number = read_utf8(r)?;

        Ok(Self {
            variable_block_size,
            number,
            block_size: match encoded_block_size {
                0b0000 => return Err(Error::InvalidBlockSize),
                0b0001 => 192,
                v @ 0b0010..=0b0101 => 144 * (1 << v),
                0b0110 => r.read::<8, u16>()? + 1,
                0b0111 => u16::try_from(u32::from(r.read::<16, u16>()?) + 1)
                    .map_err(|_| Error::InvalidBlockSize)?,
                v => 1 << v,
            },
            sample_rate: match encoded_sample_rate {
                0b0000 => streaminfo.sample_rate,
                0b1100 => r.read::<8, u32>()? * 1000,
                0b1101 => r.read::<16, u32>()?,
                0b1110 => r.read::<16, u32>()? * 10,
                0b1111 => return Err(Error::InvalidSampleRate),
                code => STANDARD_RATES
                    .iter()
                    .find_map(|(c, rate)| (*c == code).then_some(*rate))
                    .ok_or(Error::InvalidSampleRate)?,
            },
            channel_assignment,
            bits_per_sample: match encoded_bps {
                0b000 => streaminfo.bits_per_sample,
                0b011 => return Err(Error::InvalidBitsPerSample),
                code => STANDARD_BPS
                    .iter()
                    .find_map(|(c, bps)| (*c == code).then_some(*bps))
                    .ok_or(Error::InvalidBitsPerSample)?,
            },
        })
    }
}

impl ToBitStream for FrameHeader {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        let block_size_code = match self.block_size {
            0 => return Err(Error::InvalidBlockSize),
            192 => 0b0001,
            576 => 0b0010,
            1152 => 0b0011,
            2304 => 0b0100,
            4608 => 0b0101,
            s if s.is_power_of_two() && s >= 256 => s.trailing_zeros() as u8,
            s if s <= 256 => 0b0110,
            _ => 0b0111,
        };

        let sample_rate_code = STANDARD_RATES
            .iter()
            .find_map(|(code, rate)| (*rate == self.sample_rate).then_some(*code))
            .unwrap_or(match self.sample_rate {
                r if r % 1000 == 0 && r <= 255_000 => 0b1100,
                r if r <= 65535 => 0b1101,
                r if r % 10 == 0 && r <= 655_350 => 0b1110,
                _ => 0b0000,
            });

        w.write::<15, u16>(SYNC_CODE)?;
        w.write_bit(self.variable_block_size)?;
        w.write::<4, u8>(block_size_code)?;
        w.write::<4, u8>(sample_rate_code)?;
        w.build(&self.channel_assignment)?;
        w.write::<3, u8>(
            STANDARD_BPS
                .iter()
                .find_map(|(code, bps)| (*bps == self.bits_per_sample).then_some(*code))
                .unwrap_or(0b000),
        )?;
        w.write_bit(false)?;
        write_utf8(w, self.number)?;

        match block_size_code {
            0b0110 => w.write::<8, u16>(self.block_size - 1)?,
            0b0111 => w.write::<16, u16>(self.block_size - 1)?,
            _ => { /* no explicit block size */ }
        }

        match sample_rate_code {
            0b1100 => w.write::<8, u32>(self.sample_rate / 1000)?,
            0b1101 => w.write::<16, u32>(self.sample_rate)?,
            0b1110 => w.write::<16, u32>(self.sample_rate / 10)?,
            _ => { /* no explicit sample rate */ }
        }

        Ok(())
    }
}

const STANDARD_RATES: [(u8, u32); 11] = [
    (0b0001, 88200),
    (0b0010, 176400),
    (0b0011, 192000),
    (0b0100, 8000),
    (0b0101, 16000),
    (0b0110, 22050),
    (0b0111, 24000),
    (0b1000, 32000),
    (0b1001, 44100),
    (0b1010, 48000),
    (0b1011, 96000),
];

const STANDARD_BPS: [(u8, u32); 6] = [
    (0b001, 8),
    (0b010, 12),
    (0b100, 16),
    (0b101, 20),
    (0b110, 24),
    (0b111, 32),
];

/// How a frame's channels are stored
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelAssignment {
    /// Channels stored independently, with the given count
    Independent(u8),
    /// Left channel, then side channel
    LeftSide,
    /// Side channel, then right channel
    SideRight,
    /// Mid channel, then side channel
    MidSide,
}

impl ChannelAssignment {
    /// Number of channels in the frame
    pub fn count(&self) -> u8 {
        match self {
            Self::Independent(c) => *c,
            _ => 2,
        }
    }

    /// Whether the given subframe holds a side channel,
    /// which requires one extra bit per sample
    pub fn is_side(&self, channel: usize) -> bool {
        matches!(
            (self, channel),
            (Self::LeftSide, 1) | (Self::SideRight, 0) | (Self::MidSide, 1)
        )
    }
}

impl FromBitStream for ChannelAssignment {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        match r.read::<4, u8>()? {
            c @ 0b0000..=0b0111 => Ok(Self::Independent(c + 1)),
            0b1000 => Ok(Self::LeftSide),
            0b1001 => Ok(Self::SideRight),
            0b1010 => Ok(Self::MidSide),
            _ => Err(Error::InvalidChannels),
        }
    }
}

impl ToBitStream for ChannelAssignment {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write::<4, u8>(match self {
            Self::Independent(c @ 1..=8) => c - 1,
            Self::Independent(_) => return Err(Error::InvalidChannels),
            Self::LeftSide => 0b1000,
            Self::SideRight => 0b1001,
            Self::MidSide => 0b1010,
        })
        .map_err(Error::Io)
    }
}

fn read_utf8<R: BitRead + ?Sized>(r: &mut R) -> Result<u64, Error> {
    match r.read_unary::<0>()? {
        0 => Ok(r.read::<7, _>()?),
        1 => Err(Error::InvalidFrameNumber),
        bytes @ 2..=7 => {
            let mut number = match 7 - bytes {
                0 => 0,
                bits => r.read_var::<u64>(bits)?,
            };
            for _ in 1..bytes {
                match r.read::<2, u8>()? {
                    0b10 => {
                        number = (number << 6) | r.read::<6, u64>()?;
                    }
                    _ => return Err(Error::InvalidFrameNumber),
                }
            }
            Ok(number)
        }
        _ => Err(Error::InvalidFrameNumber),
    }
}

fn write_utf8<W: BitWrite + ?Sized>(w: &mut W, number: u64) -> Result<(), Error> {
    let bytes = match number {
        0..0x80 => return w.write::<8, u64>(number).map_err(Error::Io),
        0x80..0x800 => 2,
        0x800..0x1_0000 => 3,
        0x1_0000..0x20_0000 => 4,
        0x20_0000..0x400_0000 => 5,
        0x400_0000..0x8000_0000 => 6,
        0x8000_0000..=FrameHeader::MAX_NUMBER => 7,
        _ => return Err(Error::ExcessiveFrameNumber),
    };

    w.write_unary::<0>(bytes)?;
    if bytes < 7 {
        w.write_var(7 - bytes, number >> (6 * (bytes - 1)))?;
    }
    for byte in (0..bytes - 1).rev() {
        w.write::<2, u8>(0b10)?;
        w.write::<6, u64>((number >> (6 * byte)) & 0x3F)?;
    }
    Ok(())
}

/// A subframe header
///
/// | Bits | Field | Meaning |
/// |-----:|------:|---------|
/// | 1    | pad | always 0
/// | 6    | `type_` | subframe type and predictor order
/// | 1+   | `wasted_bps` | flag, then unary count of wasted bits - 1
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SubframeHeader {
    /// The subframe's type
    pub type_: SubframeHeaderType,
    /// The number of wasted bits-per-sample
    pub wasted_bps: u32,
}

impl FromBitStream for SubframeHeader {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        if r.read_bit()? {
            return Err(Error::InvalidSubframeHeader);
        }
        Ok(Self {
            type_: r.parse()?,
            wasted_bps: match r.read_bit()? {
                false => 0,
                true => r.read_unary::<1>()? + 1,
            },
        })
    }
}

impl ToBitStream for SubframeHeader {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write_bit(false)?;
        w.build(&self.type_)?;
        match self.wasted_bps {
            0 => w.write_bit(false)?,
            wasted => {
                w.write_bit(true)?;
                w.write_unary::<1>(wasted - 1)?;
            }
        }
        Ok(())
    }
}

/// A subframe header's type and order
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubframeHeaderType {
    /// All samples are the same
    Constant,
    /// All samples stored verbatim, without compression
    Verbatim,
    /// Samples predicted with a fixed polynomial of order 0 to 4
    Fixed(u8),
    /// Samples predicted with LPC coefficients of order 1 to 32
    Lpc(u8),
}

impl FromBitStream for SubframeHeaderType {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        match r.read::<6, u8>()? {
            0b000000 => Ok(Self::Constant),
            0b000001 => Ok(Self::Verbatim),
            v @ 0b001000..=0b001100 => Ok(Self::Fixed(v & 0b111)),
            v @ 0b100000..=0b111111 => Ok(Self::Lpc((v & 0b11111) + 1)),
            _ => Err(Error::InvalidSubframeHeader),
        }
    }
}

impl ToBitStream for SubframeHeaderType {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write::<6, u8>(match self {
            Self::Constant => 0b000000,
            Self::Verbatim => 0b000001,
            Self::Fixed(order @ 0..=4) => 0b001000 | order,
            Self::Lpc(order @ 1..=32) => 0b100000 | (order - 1),
            _ => return Err(Error::InvalidSubframeHeader),
        })
        .map_err(Error::Io)
    }
}
