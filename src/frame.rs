// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! For serializing finalized subframes to FLAC frames

use crate::Error;
use crate::crc::{Crc16, CrcWriter};
use crate::predict::{Predictor, Subframe};
use crate::stream::{FrameHeader, SubframeHeader};
use bitstream_io::{BigEndian, BitWrite, BitWriter, ToBitStream, write::Overflowed};
use std::io::Write;

/// Appends a complete frame to `out`
///
/// Every subframe is measured before it is written,
/// and a size differing from the one computed
/// during prediction is an error.
pub fn write_frame(
    out: &mut Vec<u8>,
    header: &FrameHeader,
    subframes: &[Subframe],
) -> Result<(), Error> {
    let mut w: CrcWriter<_, Crc16> = CrcWriter::new(out);
    header.write(w.by_ref())?;

    let mut bw = BitWriter::endian(w.by_ref(), BigEndian);
    for subframe in subframes {
        if subframe.bits::<SubframeBits>()?.0 != subframe.bits {
            return Err(Error::EstimateMismatch);
        }
        bw.build(subframe)?;
    }
    bw.byte_align()?;

    let crc16 = w.checksum();
    w.into_writer().extend_from_slice(&crc16.to_be_bytes());
    Ok(())
}

/// Writes the low `bits` of a two's complement value
#[inline]
fn write_signed<W: BitWrite + ?Sized>(w: &mut W, bits: u32, value: i32) -> std::io::Result<()> {
    w.write_var(bits, (value as u32) & (u32::MAX >> (32 - bits)))
}

impl ToBitStream for Subframe {
    type Error = Error;

    fn to_writer<W: BitWrite + ?Sized>(&self, w: &mut W) -> Result<(), Self::Error> {
        w.build(&SubframeHeader {
            type_: self.predictor.header_type(),
            wasted_bps: self.wasted_bits,
        })?;

        let order = self.predictor.order();

        match &self.predictor {
            Predictor::Constant(sample) => {
                write_signed(w, self.sample_bits, *sample)?;
            }
            Predictor::Verbatim => {
                self.samples
                    .iter()
                    .try_for_each(|s| write_signed(w, self.sample_bits, *s))?;
            }
            Predictor::Fixed(_) => {
                self.samples[..order]
                    .iter()
                    .try_for_each(|s| write_signed(w, self.sample_bits, *s))?;
            }
            Predictor::Lpc(lpc) => {
                self.samples[..order]
                    .iter()
                    .try_for_each(|s| write_signed(w, self.sample_bits, *s))?;
                w.write::<4, u32>(lpc.precision - 1)?;
                write_signed(w, 5, lpc.shift as i32)?;
                lpc.coefficients
                    .iter()
                    .try_for_each(|c| write_signed(w, lpc.precision, *c))?;
            }
        }

        if let Some(rice) = &self.rice {
            rice.write(w, &self.residual, order)?;
        }

        Ok(())
    }
}

/// Counts a subframe's bits without writing it
#[derive(Default)]
struct SubframeBits(u64);

impl From<u8> for SubframeBits {
    fn from(u: u8) -> Self {
        Self(u.into())
    }
}

impl TryFrom<u32> for SubframeBits {
    type Error = (); // the error will be replaced later

    fn try_from(u: u32) -> Result<Self, Self::Error> {
        Ok(Self(u.into()))
    }
}

impl TryFrom<usize> for SubframeBits {
    type Error = (); // the error will be replaced later

    fn try_from(u: usize) -> Result<Self, Self::Error> {
        u64::try_from(u).map(Self).map_err(|_| ())
    }
}

impl bitstream_io::write::Counter for SubframeBits {
    fn checked_add_assign(&mut self, Self(b): Self) -> Result<(), Overflowed> {
        *self = self.0.checked_add(b).map(Self).ok_or(Overflowed)?;
        Ok(())
    }

    fn checked_mul(self, Self(b): Self) -> Result<Self, Overflowed> {
        self.0.checked_mul(b).map(Self).ok_or(Overflowed)
    }

    fn byte_aligned(&self) -> bool {
        self.0.is_multiple_of(8)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lpc::QuantizedLpc;
    use crate::predict::{SubframeTask, finalize};
    use crate::stream::ChannelAssignment;

    fn header(block_size: u16) -> FrameHeader {
        FrameHeader {
            variable_block_size: false,
            number: 0,
            block_size,
            sample_rate: 44100,
            channel_assignment: ChannelAssignment::Independent(1),
            bits_per_sample: 16,
        }
    }

    #[test]
    fn test_constant_frame() {
        let subframes = [Subframe {
            predictor: Predictor::Constant(0),
            wasted_bits: 0,
            sample_bits: 16,
            samples: vec![0; 4096],
            residual: vec![],
            rice: None,
            bits: 24,
        }];
        let mut frame = vec![];
        write_frame(&mut frame, &header(4096), &subframes).unwrap();
        // 6 byte header, 3 byte subframe, 2 byte CRC-16
        assert_eq!(frame.len(), 11);
        assert_eq!(&frame[6..9], &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_sizes_match_estimates() {
        let mut rng = fastrand::Rng::with_seed(1234);
        let signal = (0..1152)
            .map(|i| ((i as f64 / 9.0).sin() * 8000.0) as i32 + rng.i32(-40..=40))
            .collect::<Vec<i32>>();
        let shifted = signal.iter().map(|s| s * 4).collect::<Vec<i32>>();

        let mut subframes = (0..=4)
            .map(|order| finalize(&SubframeTask::fixed(0, order), &signal, 16, 0, 0, 6))
            .collect::<Vec<_>>();

        subframes.push(Subframe::verbatim(&signal, 16, 0));
        subframes.push(finalize(&SubframeTask::fixed(0, 2), &signal, 14, 2, 2, 4));
        subframes.push(finalize(
            &SubframeTask {
                order: 2,
                coefficients: [1843, -829].into_iter().collect(),
                shift: 10,
                precision: 12,
                ..SubframeTask::lpc(0, 0, 0)
            },
            &signal,
            16,
            0,
            0,
            8,
        ));
        assert!(matches!(subframes.last().unwrap().predictor, Predictor::Lpc(_)));

        for subframe in &subframes {
            assert_eq!(subframe.bits::<SubframeBits>().unwrap().0, subframe.bits);
        }

        let mut frame = vec![];
        write_frame(&mut frame, &header(1152), &subframes[0..1]).unwrap();

        // a wrong size is caught before anything is emitted for it
        let mut wrong = finalize(&SubframeTask::fixed(0, 1), &shifted, 18, 0, 0, 8);
        wrong.bits += 1;
        assert!(matches!(
            write_frame(&mut vec![], &header(1152), &[wrong]),
            Err(Error::EstimateMismatch)
        ));
    }

    #[test]
    fn test_lpc_subframe_layout() {
        let subframe = Subframe {
            predictor: Predictor::Lpc(QuantizedLpc {
                coefficients: [3, -1].into_iter().collect(),
                shift: 1,
                precision: 3,
            }),
            wasted_bits: 0,
            sample_bits: 8,
            samples: vec![1, 2, 3, 4],
            residual: vec![0, 0, 0, 0],
            rice: Some(crate::rice::RicePlan::optimal(&[0, 0, 0, 0], 2, 0, 0)),
            bits: 0,
        };
        let mut w = BitWriter::endian(vec![], BigEndian);
        w.build(&subframe).unwrap();
        w.byte_align().unwrap();
        let bytes = w.into_writer();
        // header: 0 100001 0
        assert_eq!(bytes[0], 0b01000010);
        // warm-up samples
        assert_eq!(&bytes[1..3], &[1, 2]);
        // precision - 1, shift, coefficients 3 and -1
        assert_eq!(bytes[3], 0b0010_0000);
        assert_eq!(bytes[4], 0b1011_1110);
    }
}
