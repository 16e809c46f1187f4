use flac_accel::byteorder::{BigEndian, Endianness, LittleEndian};
use flac_accel::decode::Decoder;
use flac_accel::encode::{Encoder, EncodingOptions, FlacWriter};
use flac_accel::metadata::{Block, BlockSize, read_blocks};
use std::io::{Cursor, Write};
use std::num::NonZero;

fn encode(
    samples: &[i32],
    options: EncodingOptions,
    bits_per_sample: u32,
    channels: u8,
    total_samples: Option<u64>,
) -> Vec<u8> {
    let mut flac = Cursor::new(vec![]);
    let mut encoder = Encoder::new(
        &mut flac,
        options,
        44100,
        bits_per_sample,
        NonZero::new(channels).unwrap(),
        total_samples.and_then(NonZero::new),
    )
    .unwrap();

    // uneven chunks exercise staging across task slots
    for chunk in samples.chunks(usize::from(channels) * 1111) {
        encoder.encode(chunk).unwrap();
    }
    encoder.finalize().unwrap();
    flac.into_inner()
}

fn md5(samples: &[i32], bits_per_sample: u32) -> [u8; 16] {
    let bytes_per_sample = bits_per_sample.div_ceil(8) as usize;
    let mut bytes = vec![0; samples.len() * bytes_per_sample];
    for (sample, chunk) in samples.iter().zip(bytes.chunks_exact_mut(bytes_per_sample)) {
        LittleEndian::sample_to_bytes(*sample, chunk);
    }
    md5::compute(bytes).0
}

fn test_signal(pcm_frames: usize, channels: usize, bits_per_sample: u32, seed: u64) -> Vec<i32> {
    let mut rng = fastrand::Rng::with_seed(seed);
    let amplitude = f64::from((1 << (bits_per_sample - 1)) - 1);
    let max = (1i32 << (bits_per_sample - 1)) - 1;
    let noise = (max / 64).max(1);

    (0..pcm_frames)
        .flat_map(|i| {
            let t = i as f64 / 44100.0;
            let base = (t * 440.0 * std::f64::consts::TAU).sin() * amplitude * 0.6;
            (0..channels)
                .map(|c| {
                    let sample = base * (1.0 - c as f64 * 0.1) + f64::from(rng.i32(-noise..=noise));
                    (sample as i32).clamp(-max - 1, max)
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Decodes a whole stream with symphonia's FLAC decoder
///
/// Returns its interleaved samples and the result
/// of its own MD5 check.
fn symphonia_decode(flac: Vec<u8>) -> (Vec<i32>, Option<bool>) {
    use symphonia::core::audio::{AudioBufferRef, Signal};
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as DecodeError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let mss = MediaSourceStream::new(Box::new(Cursor::new(flac)), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("flac");
    let mut format = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .unwrap()
        .format;

    let track = format.default_track().unwrap();
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions { verify: true })
        .unwrap();

    let mut samples = vec![];
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(DecodeError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => panic!("{e}"),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let AudioBufferRef::S32(buf) = decoder.decode(&packet).unwrap() else {
            panic!("unexpected sample format");
        };
        let channels = buf.spec().channels.count();
        for frame in 0..buf.frames() {
            samples.extend((0..channels).map(|c| buf.chan(c)[frame]));
        }
    }

    (samples, decoder.finalize().verify_ok)
}

fn assert_symphonia_decodes(flac: Vec<u8>, samples: &[i32], bits_per_sample: u32) {
    let (decoded, md5_ok) = symphonia_decode(flac);
    assert_eq!(md5_ok, Some(true));
    assert_eq!(decoded.len(), samples.len());

    // samples may come back scaled to the full 32-bit range
    let shift = 32 - bits_per_sample;
    assert!(
        decoded == samples
            || decoded
                .iter()
                .zip(samples)
                .all(|(decoded, sample)| *decoded == sample << shift),
        "symphonia output differs at {bits_per_sample} bits"
    );
}

fn assert_roundtrip(flac: Vec<u8>, samples: &[i32], bits_per_sample: u32, channels: u8) {
    // symphonia reads 8 bits-per-sample and up
    if bits_per_sample >= 8 {
        assert_symphonia_decodes(flac.clone(), samples, bits_per_sample);
    }

    let decoder = Decoder::new(Cursor::new(flac)).unwrap();
    let streaminfo = decoder.streaminfo().clone();
    assert_eq!(streaminfo.bits_per_sample, bits_per_sample);
    assert_eq!(streaminfo.channels.get(), channels);
    assert_eq!(
        streaminfo.total_samples.map(|t| t.get()),
        Some((samples.len() / usize::from(channels)) as u64)
    );
    assert_eq!(streaminfo.md5, Some(md5(samples, bits_per_sample)));
    assert!(streaminfo.minimum_frame_size <= streaminfo.maximum_frame_size);

    assert_eq!(decoder.decode_all().unwrap(), samples);
}

#[test]
fn test_bits_per_sample() {
    for bits_per_sample in [4, 8, 12, 16, 20, 24] {
        let samples = test_signal(10000, 2, bits_per_sample, bits_per_sample.into());
        let flac = encode(&samples, EncodingOptions::default(), bits_per_sample, 2, None);
        assert_roundtrip(flac, &samples, bits_per_sample, 2);
    }
}

#[test]
fn test_channel_counts() {
    for channels in 1..=8 {
        let samples = test_signal(9000, channels.into(), 16, channels.into());
        let flac = encode(
            &samples,
            EncodingOptions::default(),
            16,
            channels,
            Some(9000),
        );
        assert_roundtrip(flac, &samples, 16, channels);
    }
}

#[test]
fn test_presets() {
    let samples = test_signal(6000, 2, 16, 12);
    let mut sizes = vec![];

    for level in 0..=EncodingOptions::MAX_LEVEL {
        let flac = encode(
            &samples,
            EncodingOptions::preset(level)
                .and_then(|o| o.padding(0))
                .unwrap()
                .verify(true),
            16,
            2,
            Some(6000),
        );
        sizes.push(flac.len());
        assert_roundtrip(flac, &samples, 16, 2);
    }

    // every preset beats storing samples verbatim
    assert!(sizes.iter().all(|size| *size < samples.len() * 2));
}

#[test]
fn test_partial_final_frame() {
    // one sample beyond a whole number of blocks
    let samples = test_signal(4096 * 3 + 1, 1, 16, 3);
    let flac = encode(&samples, EncodingOptions::default(), 16, 1, Some(4096 * 3 + 1));

    let mut decoder = Decoder::new(Cursor::new(flac.clone())).unwrap();
    let mut block_sizes = vec![];
    while let Some(frame) = decoder.read_frame().unwrap() {
        block_sizes.push(frame.header.block_size);
    }
    assert_eq!(block_sizes, [4096, 4096, 4096, 1]);

    assert_roundtrip(flac, &samples, 16, 1);
}

#[test]
fn test_variable_block_size() {
    let samples = test_signal(5000, 2, 16, 4);
    let flac = encode(
        &samples,
        EncodingOptions::default()
            .block_size(1152)
            .unwrap()
            .variable_block_size(true),
        16,
        2,
        None,
    );

    let mut decoder = Decoder::new(Cursor::new(flac.clone())).unwrap();
    let mut first_sample = 0;
    while let Some(frame) = decoder.read_frame().unwrap() {
        assert!(frame.header.variable_block_size);
        assert_eq!(frame.header.number, first_sample);
        first_sample += u64::from(frame.header.block_size);
    }
    assert_eq!(first_sample, 5000);

    assert_roundtrip(flac, &samples, 16, 2);
}

#[test]
fn test_wasted_bits() {
    // 24-bit samples whose low 8 bits are always zero
    let samples = test_signal(8000, 2, 16, 5)
        .into_iter()
        .map(|s| s << 8)
        .collect::<Vec<i32>>();

    let with_wasted = encode(&samples, EncodingOptions::default().verify(true), 24, 2, None);
    let without_wasted = encode(
        &samples,
        EncodingOptions::default().wasted_bits(false),
        24,
        2,
        None,
    );
    assert!(with_wasted.len() < without_wasted.len());

    assert_roundtrip(with_wasted, &samples, 24, 2);
    assert_roundtrip(without_wasted, &samples, 24, 2);
}

#[test]
fn test_metadata_blocks() {
    let samples = test_signal(1000, 1, 16, 6);
    let flac = encode(
        &samples,
        EncodingOptions::default().padding(1024).unwrap(),
        16,
        1,
        Some(1000),
    );

    let blocks = read_blocks(flac.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    assert!(matches!(blocks[0], Block::Streaminfo(_)));
    assert!(matches!(blocks[1], Block::SeekTable(_)));
    assert!(matches!(blocks[2], Block::VorbisComment(_)));
    assert!(matches!(
        &blocks[3],
        Block::Padding(padding) if padding.size == BlockSize::from(1024u16)
    ));
    assert_eq!(blocks.len(), 4);

    // no padding, no seektable
    let flac = encode(
        &samples,
        EncodingOptions::default().seektable(false).padding(0).unwrap(),
        16,
        1,
        Some(1000),
    );
    let blocks = read_blocks(flac.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert!(matches!(
        blocks.as_slice(),
        [Block::Streaminfo(_), Block::VorbisComment(_)]
    ));
}

#[test]
fn test_flac_writer() {
    let samples = test_signal(7000, 2, 24, 7);

    let mut bytes = vec![0; samples.len() * 3];
    for (sample, chunk) in samples.iter().zip(bytes.chunks_exact_mut(3)) {
        BigEndian::sample_to_bytes(*sample, chunk);
    }

    let mut flac = Cursor::new(vec![]);
    let mut writer = FlacWriter::<_, BigEndian>::new(
        &mut flac,
        EncodingOptions::default(),
        44100,
        24,
        NonZero::new(2).unwrap(),
        None,
    )
    .unwrap();

    // split PCM frames across writes
    for chunk in bytes.chunks(1000) {
        writer.write_all(chunk).unwrap();
    }
    writer.finalize().unwrap();

    assert_roundtrip(flac.into_inner(), &samples, 24, 2);
}

#[test]
fn test_flac_writer_misaligned() {
    let mut flac = Cursor::new(vec![]);
    let mut writer = FlacWriter::<_, LittleEndian>::new(
        &mut flac,
        EncodingOptions::default(),
        44100,
        16,
        NonZero::new(2).unwrap(),
        None,
    )
    .unwrap();

    writer.write_all(&[0; 7]).unwrap();
    assert!(matches!(
        writer.finalize(),
        Err(flac_accel::Error::MisalignedSamples)
    ));
}
