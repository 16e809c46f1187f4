// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Byte order for PCM samples

/// Sample byte order
pub trait Endianness: Copy + Send + Sync + 'static {
    /// Converts 1 to 4 bytes in this byte order to a sign-extended sample
    fn bytes_to_sample(bytes: &[u8]) -> i32;

    /// Converts sample to bytes in this byte order,
    /// filling the whole buffer
    fn sample_to_bytes(sample: i32, bytes: &mut [u8]);

    /// Converts a buffer of whole samples to a sample vector
    fn bytes_to_samples(bytes: &[u8], bytes_per_sample: usize, samples: &mut Vec<i32>) {
        samples.extend(
            bytes
                .chunks_exact(bytes_per_sample)
                .map(|chunk| Self::bytes_to_sample(chunk)),
        );
    }
}

#[inline]
fn sign_extend(unsigned: u32, bytes: usize) -> i32 {
    let unused = 32 - (bytes as u32 * 8);
    ((unsigned << unused) as i32) >> unused
}

/// Little-endian byte order
#[derive(Copy, Clone, Debug, Default)]
pub struct LittleEndian;

impl Endianness for LittleEndian {
    #[inline]
    fn bytes_to_sample(bytes: &[u8]) -> i32 {
        debug_assert!((1..=4).contains(&bytes.len()));
        sign_extend(
            bytes
                .iter()
                .rev()
                .fold(0, |acc, b| (acc << 8) | u32::from(*b)),
            bytes.len(),
        )
    }

    #[inline]
    fn sample_to_bytes(sample: i32, bytes: &mut [u8]) {
        let le = sample.to_le_bytes();
        let len = bytes.len();
        bytes.copy_from_slice(&le[0..len]);
    }
}

/// Big-endian byte order
#[derive(Copy, Clone, Debug, Default)]
pub struct BigEndian;

impl Endianness for BigEndian {
    #[inline]
    fn bytes_to_sample(bytes: &[u8]) -> i32 {
        debug_assert!((1..=4).contains(&bytes.len()));
        sign_extend(
            bytes.iter().fold(0, |acc, b| (acc << 8) | u32::from(*b)),
            bytes.len(),
        )
    }

    #[inline]
    fn sample_to_bytes(sample: i32, bytes: &mut [u8]) {
        let be = sample.to_be_bytes();
        let len = bytes.len();
        bytes.copy_from_slice(&be[4 - len..]);
    }
}

#[test]
fn test_16bit() {
    assert_eq!(LittleEndian::bytes_to_sample(&[0x34, 0x12]), 0x1234);
    assert_eq!(LittleEndian::bytes_to_sample(&[0xFF, 0xFF]), -1);
    assert_eq!(BigEndian::bytes_to_sample(&[0x80, 0x00]), -32768);

    let mut buf = [0; 2];
    LittleEndian::sample_to_bytes(-2, &mut buf);
    assert_eq!(buf, [0xFE, 0xFF]);
    BigEndian::sample_to_bytes(0x1234, &mut buf);
    assert_eq!(buf, [0x12, 0x34]);
}

#[test]
fn test_24bit() {
    assert_eq!(LittleEndian::bytes_to_sample(&[0x56, 0x34, 0x12]), 0x123456);
    assert_eq!(LittleEndian::bytes_to_sample(&[0x00, 0x00, 0x80]), -(1 << 23));
    assert_eq!(BigEndian::bytes_to_sample(&[0xFF, 0xFF, 0xFE]), -2);

    let mut buf = [0; 3];
    LittleEndian::sample_to_bytes(-(1 << 23), &mut buf);
    assert_eq!(buf, [0x00, 0x00, 0x80]);
    BigEndian::sample_to_bytes((1 << 23) - 1, &mut buf);
    assert_eq!(buf, [0x7F, 0xFF, 0xFF]);
}

#[test]
fn test_bytes_to_samples() {
    let mut samples = vec![];
    LittleEndian::bytes_to_samples(&[1, 0, 0xFF, 0xFF, 0, 0x80], 2, &mut samples);
    assert_eq!(samples, vec![1, -1, -32768]);
}
