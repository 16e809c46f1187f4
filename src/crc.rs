// Copyright 2025 Brian Langenberger
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Frame checksums

/// A running checksum over a byte stream
pub trait Checksum: Default {
    /// The checksum's final value
    type Output: Copy + Eq + Into<u16>;

    /// Updates checksum with a single byte
    fn update(&mut self, byte: u8);

    /// Returns our current checksum value
    fn checksum(&self) -> Self::Output;

    /// Whether the checksum is valid, having
    /// consumed its own checksum bytes at the end of the stream
    fn valid(&self) -> bool;

    /// Updates checksum with all of the given bytes
    fn update_all(&mut self, bytes: &[u8]) {
        bytes.iter().for_each(|b| self.update(*b))
    }
}

/// The CRC-8 used by frame headers (polynomial 0x07)
#[derive(Copy, Clone, Debug, Default)]
pub struct Crc8(u8);

const CRC8_TABLE: [u8; 256] = {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

impl Checksum for Crc8 {
    type Output = u8;

    #[inline]
    fn update(&mut self, byte: u8) {
        self.0 = CRC8_TABLE[usize::from(self.0 ^ byte)];
    }

    fn checksum(&self) -> u8 {
        self.0
    }

    fn valid(&self) -> bool {
        self.0 == 0
    }
}

/// The CRC-16 used by whole frames (polynomial 0x8005)
#[derive(Copy, Clone, Debug, Default)]
pub struct Crc16(u16);

const CRC16_TABLE: [u16; 256] = {
    let mut table = [0; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

impl Checksum for Crc16 {
    type Output = u16;

    #[inline]
    fn update(&mut self, byte: u8) {
        self.0 = (self.0 << 8) ^ CRC16_TABLE[usize::from((self.0 >> 8) as u8 ^ byte)];
    }

    fn checksum(&self) -> u16 {
        self.0
    }

    fn valid(&self) -> bool {
        self.0 == 0
    }
}

/// A writer which checksums all bytes written through it
pub struct CrcWriter<W, C> {
    writer: W,
    checksum: C,
}

impl<W: std::io::Write, C: Checksum> CrcWriter<W, C> {
    /// Wraps writer with a fresh checksum
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            checksum: C::default(),
        }
    }

    /// Returns checksum of bytes written so far
    pub fn checksum(&self) -> C::Output {
        self.checksum.checksum()
    }

    /// Returns wrapped writer
    pub fn into_writer(self) -> W {
        self.writer
    }
}

impl<W: std::io::Write, C: Checksum> std::io::Write for CrcWriter<W, C> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.checksum.update_all(&buf[0..written]);
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// A reader which checksums all bytes read through it
pub struct CrcReader<R, C> {
    reader: R,
    checksum: C,
}

impl<R: std::io::Read, C: Checksum> CrcReader<R, C> {
    /// Wraps reader with a fresh checksum
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            checksum: C::default(),
        }
    }

    /// Returns final checksum
    pub fn into_checksum(self) -> C {
        self.checksum
    }
}

impl<R: std::io::Read, C: Checksum> std::io::Read for CrcReader<R, C> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.reader.read(buf)?;
        self.checksum.update_all(&buf[0..read]);
        Ok(read)
    }
}

#[test]
fn test_crc8() {
    let mut crc = Crc8::default();
    crc.update_all(b"123456789");
    assert_eq!(crc.checksum(), 0xF4);
    crc.update(0xF4);
    assert!(crc.valid());
}

#[test]
fn test_crc16() {
    let mut crc = Crc16::default();
    crc.update_all(b"123456789");
    assert_eq!(crc.checksum(), 0xFEE8);
    crc.update_all(&0xFEE8u16.to_be_bytes());
    assert!(crc.valid());
}

#[test]
fn test_crc_writer_reader() {
    use std::io::{Read, Write};

    let mut w: CrcWriter<_, Crc16> = CrcWriter::new(vec![]);
    w.write_all(b"123456789").unwrap();
    assert_eq!(w.checksum(), 0xFEE8);
    let mut data = w.into_writer();
    data.extend_from_slice(&0xFEE8u16.to_be_bytes());

    let mut r: CrcReader<_, Crc16> = CrcReader::new(data.as_slice());
    let mut buf = vec![];
    r.read_to_end(&mut buf).unwrap();
    assert_eq!(buf.len(), 11);
    assert!(r.into_checksum().valid());
}
