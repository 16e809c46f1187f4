// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For handling a FLAC stream's metadata blocks
//!
//! A stream opens with the `fLaC` tag followed by a chain of
//! metadata blocks, each behind a 32-bit header.
//!
//! | Bits | Field | Meaning |
//! |-----:|------:|---------|
//! | 1    | last | final metadata block before the frames
//! | 7    | type | block type code
//! | 24   | size | block body size, in bytes
//!
//! The encoder writes up to four block types, in this order
//!
//! | Code | Block Type | Purpose |
//! |-----:|-----------:|---------|
//! | 0 | [STREAMINFO](`Streaminfo`) | sample rate, channel count, totals and checksum |
//! | 3 | [SEEKTABLE](`SeekTable`) | sample offsets of selected frames |
//! | 4 | [VORBIS_COMMENT](`VorbisComment`) | the encoder's vendor string |
//! | 1 | [PADDING](`Padding`) | zeroed space for later metadata edits |
//!
//! Blocks of any other type are kept as raw bytes when read.

use crate::Error;
use bitstream_io::{
    BigEndian, BitRead, BitReader, BitWrite, BitWriter, FromBitStream, LittleEndian, ToBitStream,
};
use std::io::{Read, Write};
use std::num::NonZero;

/// The tag every FLAC stream begins with
pub const FLAC_TAG: &[u8; 4] = b"fLaC";

const STREAMINFO: u8 = 0;
const PADDING: u8 = 1;
const SEEKTABLE: u8 = 3;
const VORBIS_COMMENT: u8 = 4;

/// A 24-bit metadata block size, in bytes
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct BlockSize(u32);

impl BlockSize {
    const MAX: u32 = (1 << 24) - 1;

    /// The size as a u32
    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u16> for BlockSize {
    fn from(u: u16) -> Self {
        Self(u.into())
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = Error;

    fn try_from(u: u32) -> Result<Self, Self::Error> {
        match u {
            ..=Self::MAX => Ok(Self(u)),
            _ => Err(Error::ExcessiveBlockSize),
        }
    }
}

impl TryFrom<usize> for BlockSize {
    type Error = Error;

    fn try_from(u: usize) -> Result<Self, Self::Error> {
        u32::try_from(u)
            .map_err(|_| Error::ExcessiveBlockSize)
            .and_then(Self::try_from)
    }
}

/// A FLAC metadata block
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Block {
    /// The STREAMINFO block
    Streaminfo(Streaminfo),
    /// The PADDING block
    Padding(Padding),
    /// The SEEKTABLE block
    SeekTable(SeekTable),
    /// The VORBIS_COMMENT block
    VorbisComment(VorbisComment),
    /// A block of any other defined type, as its raw body
    Other {
        /// The block's type code
        block_type: u8,
        /// The block's body
        data: Vec<u8>,
    },
}

impl Block {
    /// The block's 7-bit type code
    pub fn type_code(&self) -> u8 {
        match self {
            Self::Streaminfo(_) => STREAMINFO,
            Self::Padding(_) => PADDING,
            Self::SeekTable(_) => SEEKTABLE,
            Self::VorbisComment(_) => VORBIS_COMMENT,
            Self::Other { block_type, .. } => *block_type,
        }
    }

    /// The error for a second block of this type,
    /// if the type may only occur once
    fn duplicate_error(&self) -> Option<Error> {
        match self {
            Self::Streaminfo(_) => Some(Error::MultipleStreaminfo),
            Self::SeekTable(_) => Some(Error::MultipleSeekTable),
            Self::VorbisComment(_) => Some(Error::MultipleVorbisComment),
            Self::Padding(_) | Self::Other { .. } => None,
        }
    }

    fn read_body(block_type: u8, body: &[u8]) -> Result<Self, Error> {
        let mut reader = body;
        let mut r = BitReader::endian(&mut reader, BigEndian);

        let block = match block_type {
            STREAMINFO => Self::Streaminfo(r.parse()?),
            PADDING => Self::Padding(Padding {
                size: BlockSize::try_from(body.len())?,
            }),
            SEEKTABLE => Self::SeekTable(SeekTable::read(&mut r, body.len())?),
            VORBIS_COMMENT => Self::VorbisComment(r.parse()?),
            7..=126 => return Err(Error::ReservedMetadataBlock),
            127.. => return Err(Error::InvalidMetadataBlock),
            block_type => Self::Other {
                block_type,
                data: body.to_vec(),
            },
        };

        let raw = matches!(block, Self::Padding(_) | Self::Other { .. });
        match raw || reader.is_empty() {
            true => Ok(block),
            false => Err(Error::InvalidMetadataBlockSize),
        }
    }

    fn write_body<W: BitWrite>(&self, w: &mut W) -> Result<(), Error> {
        match self {
            Self::Streaminfo(streaminfo) => w.build(streaminfo)?,
            Self::Padding(padding) => w.pad(padding.size.get() * 8)?,
            Self::SeekTable(seektable) => w.build(seektable)?,
            Self::VorbisComment(comment) => w.build(comment)?,
            Self::Other { data, .. } => w.write_bytes(data)?,
        }
        Ok(())
    }
}

macro_rules! into_block {
    ($t:ident) => {
        impl From<$t> for Block {
            fn from(b: $t) -> Self {
                Self::$t(b)
            }
        }
    };
}

into_block!(Streaminfo);
into_block!(Padding);
into_block!(SeekTable);
into_block!(VorbisComment);

/// Which of the once-only block types have been seen
#[derive(Default)]
struct Seen(u8);

impl Seen {
    fn check(&mut self, block: &Block) -> Result<(), Error> {
        match block.duplicate_error() {
            Some(err) if self.0 & (1 << block.type_code()) != 0 => Err(err),
            Some(_) => {
                self.0 |= 1 << block.type_code();
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ReadState {
    Tag,
    FirstBlock,
    Blocks,
    Done,
}

/// Reads the metadata blocks at the start of a FLAC stream
pub struct BlockReader<R> {
    reader: R,
    state: ReadState,
    seen: Seen,
}

impl<R: Read> BlockReader<R> {
    fn read_tag(&mut self) -> Result<(), Error> {
        let mut tag = [0; 4];
        self.reader.read_exact(&mut tag)?;
        match &tag {
            FLAC_TAG => Ok(()),
            _ => Err(Error::MissingFlacTag),
        }
    }

    /// Reads one block and whether it is the last
    fn read_block(&mut self) -> Result<(Block, bool), Error> {
        let mut r = BitReader::endian(self.reader.by_ref(), BigEndian);
        let last = r.read_bit()?;
        let block_type = r.read::<7, u8>()?;
        let size = r.read::<24, u32>()?;
        let body = r.read_to_vec(size as usize)?;
        Ok((Block::read_body(block_type, &body)?, last))
    }

    fn next_block(&mut self) -> Result<Block, Error> {
        if self.state == ReadState::Tag {
            self.read_tag()?;
            self.state = ReadState::FirstBlock;
        }

        let (block, last) = self.read_block()?;
        match (self.state, &block) {
            (ReadState::FirstBlock, Block::Streaminfo(_)) => {}
            (ReadState::FirstBlock, _) => return Err(Error::MissingStreaminfo),
            _ => {}
        }
        self.seen.check(&block)?;

        self.state = match last {
            true => ReadState::Done,
            false => ReadState::Blocks,
        };
        Ok(block)
    }
}

impl<R: Read> Iterator for BlockReader<R> {
    type Item = Result<Block, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            ReadState::Done => None,
            _ => Some(self.next_block().inspect_err(|_| {
                // nothing more can be read once a block fails
                self.state = ReadState::Done;
            })),
        }
    }
}

/// Returns iterator of blocks from the given reader
///
/// The reader should be positioned at the start of the FLAC
/// stream and is left positioned at its first frame
/// once the iterator is exhausted.
pub fn read_blocks<R: Read>(r: R) -> BlockReader<R> {
    BlockReader {
        reader: r,
        state: ReadState::Tag,
        seen: Seen::default(),
    }
}

/// Writes the "fLaC" tag followed by the given metadata blocks
///
/// The final block is flagged as last.
///
/// # Errors
///
/// Returns an error if STREAMINFO is not the first block,
/// if SEEKTABLE or VORBIS_COMMENT occur more than once,
/// or if an I/O error occurs.
pub fn write_blocks<W: Write>(mut w: W, blocks: &[Block]) -> Result<(), Error> {
    let Some(Block::Streaminfo(_)) = blocks.first() else {
        return Err(Error::MissingStreaminfo);
    };
    let mut seen = Seen::default();
    blocks.iter().try_for_each(|block| seen.check(block))?;

    w.write_all(FLAC_TAG)?;
    blocks
        .iter()
        .enumerate()
        .try_for_each(|(index, block)| write_block(w.by_ref(), block, index + 1 == blocks.len()))
}

/// Writes a single metadata block, including its header,
/// without any "fLaC" tag
///
/// Used to overwrite a block in place once its
/// final contents are known.
pub fn write_block<W: Write>(w: W, block: &Block, last: bool) -> Result<(), Error> {
    let mut body = BitWriter::endian(vec![], BigEndian);
    block.write_body(&mut body)?;
    let body = body.into_writer();
    let size = BlockSize::try_from(body.len())?;

    let mut w = BitWriter::endian(w, BigEndian);
    w.write_bit(last)?;
    w.write::<7, u8>(block.type_code())?;
    w.write::<24, u32>(size.get())?;
    w.write_bytes(&body)?;
    Ok(())
}

/// A STREAMINFO metadata block
///
/// Always the first block of a stream, and never repeated.
///
/// | Bits | Field | Meaning |
/// |-----:|------:|---------|
/// | 16   | `minimum_block_size` | smallest block size, in samples
/// | 16   | `maximum_block_size` | largest block size, in samples
/// | 24   | `minimum_frame_size` | smallest frame size, in bytes, or 0
/// | 24   | `maximum_frame_size` | largest frame size, in bytes, or 0
/// | 20   | `sample_rate` | sample rate, in Hz
/// | 3    | `channels` | channel count - 1
/// | 5    | `bits_per_sample` | bits-per-sample - 1
/// | 36   | `total_samples` | samples per channel, or 0
/// | 128  | `md5` | MD5 of the decoded samples, or all 0
///
/// The encoder writes this block before any frames
/// and, given a seekable stream, rewrites it in place
/// once the final frame sizes, sample count and MD5 sum are known.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Streaminfo {
    /// The minimum block size (in samples) used in the stream,
    /// excluding the last block.
    pub minimum_block_size: u16,
    /// The maximum block size (in samples) used in the stream,
    /// excluding the last block.
    pub maximum_block_size: u16,
    /// The smallest frame (in bytes), if known
    pub minimum_frame_size: Option<NonZero<u32>>,
    /// The largest frame (in bytes), if known
    pub maximum_frame_size: Option<NonZero<u32>>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels, from 1 to 8
    pub channels: NonZero<u8>,
    /// Number of bits-per-sample, from 4 to 32
    pub bits_per_sample: u32,
    /// Samples per channel in the whole stream, if known
    pub total_samples: Option<NonZero<u64>>,
    /// MD5 hash of the decoded samples, if known
    pub md5: Option<[u8; 16]>,
}

impl Streaminfo {
    /// The maximum size of a frame, in bytes (2²⁴ - 1)
    pub const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

    /// The maximum sample rate, in Hz (2²⁰ - 1)
    pub const MAX_SAMPLE_RATE: u32 = (1 << 20) - 1;

    /// The maximum number of channels (8)
    pub const MAX_CHANNELS: u8 = 8;

    /// The maximum number of total samples (2³⁶ - 1)
    pub const MAX_TOTAL_SAMPLES: u64 = (1 << 36) - 1;

    /// Widens the minimum and maximum frame sizes to include a new frame
    ///
    /// Frames too large for the 24-bit fields are not counted.
    pub fn add_frame_size(&mut self, size: usize) {
        let Some(size) = u32::try_from(size)
            .ok()
            .filter(|size| *size <= Self::MAX_FRAME_SIZE)
            .and_then(NonZero::new)
        else {
            return;
        };

        self.minimum_frame_size = Some(self.minimum_frame_size.map_or(size, |min| min.min(size)));
        self.maximum_frame_size = Some(self.maximum_frame_size.map_or(size, |max| max.max(size)));
    }
}

impl FromBitStream for Streaminfo {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        let minimum_block_size = r.read_to::<u16>()?;
        let maximum_block_size = r.read_to::<u16>()?;
        let minimum_frame_size = NonZero::new(r.read::<24, u32>()?);
        let maximum_frame_size = NonZero::new(r.read::<24, u32>()?);
        let sample_rate = r.read::<20, u32>()?;
        let channels = NonZero::new(r.read::<3, u8>()? + 1).ok_or(Error::InvalidChannels)?;
        let bits_per_sample = r.read::<5, u32>()? + 1;
        let total_samples = NonZero::new(r.read::<36, u64>()?);
        let md5 = r.read_to::<[u8; 16]>()?;

        Ok(Self {
            minimum_block_size,
            maximum_block_size,
            minimum_frame_size,
            maximum_frame_size,
            sample_rate,
            channels,
            bits_per_sample,
            total_samples,
            md5: (md5 != [0; 16]).then_some(md5),
        })
    }
}

impl ToBitStream for Streaminfo {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.write_from(self.minimum_block_size)?;
        w.write_from(self.maximum_block_size)?;
        w.write::<24, u32>(self.minimum_frame_size.map_or(0, NonZero::get))?;
        w.write::<24, u32>(self.maximum_frame_size.map_or(0, NonZero::get))?;
        w.write::<20, u32>(self.sample_rate)?;
        w.write::<3, u8>(self.channels.get() - 1)?;
        w.write::<5, u32>(self.bits_per_sample - 1)?;
        w.write::<36, u64>(self.total_samples.map_or(0, NonZero::get))?;
        w.write_bytes(&self.md5.unwrap_or_default())
    }
}

/// A PADDING metadata block of zero bytes
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Padding {
    /// The size of the padding, in bytes
    pub size: BlockSize,
}

/// A SEEKTABLE metadata block
///
/// Defined points must have strictly ascending sample offsets,
/// and placeholders may only follow them.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct SeekTable {
    /// The seek table's individual seek points
    pub points: Vec<SeekPoint>,
}

impl SeekTable {
    /// The maximum number of seek points that fit into a seek table
    pub const MAX_POINTS: usize = BlockSize::MAX as usize / SeekPoint::SIZE;

    fn read<R: BitRead>(r: &mut R, size: usize) -> Result<Self, Error> {
        if size % SeekPoint::SIZE != 0 {
            return Err(Error::InvalidSeekTableSize);
        }

        let table = Self {
            points: (0..size / SeekPoint::SIZE)
                .map(|_| r.parse())
                .collect::<Result<_, std::io::Error>>()?,
        };
        table.check_order()?;
        Ok(table)
    }

    fn check_order(&self) -> Result<(), Error> {
        let mut previous = None;
        let mut placeholders = false;

        for point in &self.points {
            match point {
                SeekPoint::Placeholder => placeholders = true,
                SeekPoint::Defined { sample_offset, .. } => {
                    if placeholders || previous.is_some_and(|p| *sample_offset <= p) {
                        return Err(Error::InvalidSeekTablePoint);
                    }
                    previous = Some(*sample_offset);
                }
            }
        }
        Ok(())
    }
}

impl ToBitStream for SeekTable {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        self.check_order()?;
        for point in &self.points {
            w.build(point)?;
        }
        Ok(())
    }
}

/// An individual SEEKTABLE seek point
///
/// | Bits | Field | Meaning |
/// |-----:|------:|---------|
/// | 64   | `sample_offset` | first sample of the target frame, or all 1s
/// | 64   | `byte_offset` | bytes from the first frame to the target frame
/// | 16   | `frame_samples` | samples in the target frame
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekPoint {
    /// A point at a specific frame
    Defined {
        /// The sample number of the first sample in the target frame
        sample_offset: u64,
        /// Offset, in bytes, from the first byte of the first frame header
        /// to the first byte in the target frame's header
        byte_offset: u64,
        /// Number of samples in the target frame
        frame_samples: u16,
    },
    /// A reserved point, to be filled in later
    Placeholder,
}

impl SeekPoint {
    const SIZE: usize = 18;

    const PLACEHOLDER: u64 = u64::MAX;
}

impl FromBitStream for SeekPoint {
    type Error = std::io::Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        let sample_offset = r.read_to::<u64>()?;
        let byte_offset = r.read_to::<u64>()?;
        let frame_samples = r.read_to::<u16>()?;

        Ok(match sample_offset {
            Self::PLACEHOLDER => Self::Placeholder,
            sample_offset => Self::Defined {
                sample_offset,
                byte_offset,
                frame_samples,
            },
        })
    }
}

impl ToBitStream for SeekPoint {
    type Error = std::io::Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        let (sample_offset, byte_offset, frame_samples) = match *self {
            Self::Defined {
                sample_offset,
                byte_offset,
                frame_samples,
            } => (sample_offset, byte_offset, frame_samples),
            Self::Placeholder => (Self::PLACEHOLDER, 0, 0),
        };
        w.write_from(sample_offset)?;
        w.write_from(byte_offset)?;
        w.write_from(frame_samples)
    }
}

/// A VORBIS_COMMENT metadata block
///
/// The encoder writes only its vendor string,
/// but any fields are kept when reading.
/// Unlike everything else in a FLAC stream,
/// its length fields are little-endian.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VorbisComment {
    /// The vendor string
    pub vendor_string: String,
    /// The individual metadata comment strings
    pub fields: Vec<String>,
}

impl Default for VorbisComment {
    fn default() -> Self {
        Self {
            vendor_string: concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))
                .to_owned(),
            fields: vec![],
        }
    }
}

fn read_utf8<R: BitRead + ?Sized>(r: &mut R) -> Result<String, Error> {
    let len = r.read_as_to::<LittleEndian, u32>()?;
    Ok(String::from_utf8(r.read_to_vec(len as usize)?)?)
}

fn write_utf8<W: BitWrite + ?Sized>(w: &mut W, s: &str) -> Result<(), Error> {
    let len = u32::try_from(s.len()).map_err(|_| Error::ExcessiveStringLength)?;
    w.write_as_from::<LittleEndian, u32>(len)?;
    w.write_bytes(s.as_bytes())?;
    Ok(())
}

impl FromBitStream for VorbisComment {
    type Error = Error;

    fn from_reader<R: BitRead + ?Sized>(r: &mut R) -> Result<Self, Self::Error> {
        let vendor_string = read_utf8(r)?;
        let count = r.read_as_to::<LittleEndian, u32>()?;
        let fields = (0..count)
            .map(|_| read_utf8(r))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            vendor_string,
            fields,
        })
    }
}

impl ToBitStream for VorbisComment {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        write_utf8(w, &self.vendor_string)?;
        let count = u32::try_from(self.fields.len()).map_err(|_| Error::ExcessiveVorbisEntries)?;
        w.write_as_from::<LittleEndian, u32>(count)?;
        self.fields.iter().try_for_each(|field| write_utf8(w, field))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn streaminfo() -> Streaminfo {
        Streaminfo {
            minimum_block_size: 1152,
            maximum_block_size: 1152,
            minimum_frame_size: NonZero::new(11),
            maximum_frame_size: NonZero::new(5000),
            sample_rate: 48000,
            channels: NonZero::new(6).unwrap(),
            bits_per_sample: 20,
            total_samples: NonZero::new(1_000_000),
            md5: Some([0xAB; 16]),
        }
    }

    fn encoded(blocks: &[Block]) -> Vec<u8> {
        let mut flac = vec![];
        write_blocks(&mut flac, blocks).unwrap();
        flac
    }

    #[test]
    fn test_streaminfo_header() {
        let flac = encoded(&[streaminfo().into()]);
        // tag, then a last STREAMINFO header of 34 bytes
        assert_eq!(flac[..8], [b'f', b'L', b'a', b'C', 0x80, 0, 0, 34]);
        assert_eq!(flac.len(), 4 + 4 + 34);
    }

    #[test]
    fn test_blocks_roundtrip() {
        let blocks = vec![
            streaminfo().into(),
            SeekTable {
                points: vec![
                    SeekPoint::Defined {
                        sample_offset: 0,
                        byte_offset: 0,
                        frame_samples: 1152,
                    },
                    SeekPoint::Defined {
                        sample_offset: 480768,
                        byte_offset: 77777,
                        frame_samples: 1152,
                    },
                    SeekPoint::Placeholder,
                ],
            }
            .into(),
            Block::Other {
                block_type: 2,
                data: b"APPLdata".to_vec(),
            },
            VorbisComment {
                vendor_string: "vendor".to_owned(),
                fields: vec!["TITLE=Test".to_owned()],
            }
            .into(),
            Padding {
                size: BlockSize::from(300u16),
            }
            .into(),
        ];

        let flac = encoded(&blocks);
        // only the final header is flagged last
        assert_eq!(flac[4], STREAMINFO);

        let mut reader = flac.as_slice();
        let read = read_blocks(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(read, blocks);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_write_ordering() {
        assert!(matches!(
            write_blocks(vec![], &[Padding::default().into()]),
            Err(Error::MissingStreaminfo)
        ));
        assert!(matches!(
            write_blocks(
                vec![],
                &[
                    streaminfo().into(),
                    VorbisComment::default().into(),
                    VorbisComment::default().into(),
                ]
            ),
            Err(Error::MultipleVorbisComment)
        ));
        assert!(matches!(
            write_blocks(vec![], &[streaminfo().into(), streaminfo().into()]),
            Err(Error::MultipleStreaminfo)
        ));
    }

    #[test]
    fn test_read_errors() {
        assert!(matches!(
            read_blocks(&b"RIFF"[..]).next(),
            Some(Err(Error::MissingFlacTag))
        ));

        // PADDING before STREAMINFO
        let mut flac = FLAC_TAG.to_vec();
        write_block(&mut flac, &Padding::default().into(), false).unwrap();
        write_block(&mut flac, &streaminfo().into(), true).unwrap();
        let mut blocks = read_blocks(flac.as_slice());
        assert!(matches!(blocks.next(), Some(Err(Error::MissingStreaminfo))));
        assert!(blocks.next().is_none());

        // two SEEKTABLEs
        let mut flac = FLAC_TAG.to_vec();
        write_block(&mut flac, &streaminfo().into(), false).unwrap();
        write_block(&mut flac, &SeekTable::default().into(), false).unwrap();
        write_block(&mut flac, &SeekTable::default().into(), true).unwrap();
        let mut blocks = read_blocks(flac.as_slice());
        assert!(matches!(blocks.next(), Some(Ok(Block::Streaminfo(_)))));
        assert!(matches!(blocks.next(), Some(Ok(Block::SeekTable(_)))));
        assert!(matches!(blocks.next(), Some(Err(Error::MultipleSeekTable))));

        // reserved block type
        let mut flac = FLAC_TAG.to_vec();
        write_block(&mut flac, &streaminfo().into(), false).unwrap();
        flac.extend([0x80 | 9, 0, 0, 0]);
        let mut blocks = read_blocks(flac.as_slice());
        assert!(matches!(blocks.next(), Some(Ok(Block::Streaminfo(_)))));
        assert!(matches!(blocks.next(), Some(Err(Error::ReservedMetadataBlock))));

        // STREAMINFO whose header claims extra bytes
        let mut flac = FLAC_TAG.to_vec();
        flac.extend([0x80, 0, 0, 35]);
        BitWriter::endian(&mut flac, BigEndian)
            .build(&streaminfo())
            .unwrap();
        flac.push(0);
        assert!(matches!(
            read_blocks(flac.as_slice()).next(),
            Some(Err(Error::InvalidMetadataBlockSize))
        ));
    }

    #[test]
    fn test_seektable_ordering() {
        let defined = |sample_offset| SeekPoint::Defined {
            sample_offset,
            byte_offset: 0,
            frame_samples: 4096,
        };

        for points in [
            vec![SeekPoint::Placeholder, defined(0)],
            vec![defined(4096), defined(4096)],
            vec![defined(8192), defined(4096)],
        ] {
            assert!(matches!(
                write_block(vec![], &SeekTable { points }.into(), true),
                Err(Error::InvalidSeekTablePoint)
            ));
        }

        assert!(
            write_block(
                vec![],
                &SeekTable {
                    points: vec![defined(0), defined(4096), SeekPoint::Placeholder],
                }
                .into(),
                true
            )
            .is_ok()
        );
    }

    #[test]
    fn test_frame_sizes() {
        let mut info = streaminfo();
        info.minimum_frame_size = None;
        info.maximum_frame_size = None;
        info.add_frame_size(100);
        info.add_frame_size(20);
        info.add_frame_size(300);
        info.add_frame_size(1 << 24);
        assert_eq!(info.minimum_frame_size, NonZero::new(20));
        assert_eq!(info.maximum_frame_size, NonZero::new(300));
    }
}
