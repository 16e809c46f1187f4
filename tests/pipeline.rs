use flac_accel::Error;
use flac_accel::accel::cpu::CpuAccelerator;
use flac_accel::accel::{
    Accelerator, BufferHandle, BufferKind, CommandQueue, DeviceBuffer, Kernel, KernelArgs,
};
use flac_accel::decode::{Decoder, decode_frame};
use flac_accel::encode::{Encoder, EncodingOptions, Unseekable};
use flac_accel::metadata::{Block, SeekPoint, read_blocks};
use std::io::Cursor;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn test_signal(pcm_frames: usize, channels: usize, seed: u64) -> Vec<i32> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..pcm_frames)
        .flat_map(|i| {
            let base = ((i as f64 / 30.0).sin() * 3_000_000.0) as i32;
            (0..channels)
                .map(|c| base / (c as i32 + 1) + rng.i32(-2000..=2000))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn encode(samples: &[i32], options: EncodingOptions, channels: u8) -> Result<Vec<u8>, Error> {
    let mut flac = Cursor::new(vec![]);
    let mut encoder = Encoder::new(
        &mut flac,
        options,
        44100,
        24,
        NonZero::new(channels).unwrap(),
        None,
    )?;
    for chunk in samples.chunks(usize::from(channels) * 3000) {
        encoder.encode(chunk)?;
    }
    encoder.finalize()?;
    Ok(flac.into_inner())
}

#[test]
fn test_worker_threads() {
    let samples = test_signal(50000, 3, 1);
    let options = EncodingOptions::default().block_size(1024).unwrap();

    let local = encode(&samples, options.clone(), 3).unwrap();

    for threads in [1, 2, 4] {
        assert_eq!(
            encode(&samples, options.clone().threads(threads).unwrap(), 3).unwrap(),
            local,
            "{threads} threads"
        );
    }

    assert_eq!(
        Decoder::new(Cursor::new(local))
            .unwrap()
            .decode_all()
            .unwrap(),
        samples
    );
}

#[test]
fn test_frames_per_task() {
    let samples = test_signal(20000, 2, 2);
    let options = EncodingOptions::default().block_size(576).unwrap();

    let reference = encode(&samples, options.clone().frames_per_task(1).unwrap(), 2).unwrap();

    for frames_per_task in [2, 7, 64] {
        for threads in [0, 3] {
            assert_eq!(
                encode(
                    &samples,
                    options
                        .clone()
                        .frames_per_task(frames_per_task)
                        .unwrap()
                        .threads(threads)
                        .unwrap(),
                    2
                )
                .unwrap(),
                reference,
                "{frames_per_task} frames per task, {threads} threads"
            );
        }
    }
}

/// An accelerator which cannot create any queues
struct Unavailable;

impl Accelerator for Unavailable {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn create_queue(&self) -> Result<Box<dyn CommandQueue>, Error> {
        Err(Error::Accelerator("no device".to_owned()))
    }
}

#[test]
fn test_accelerator_fallback() {
    let samples = test_signal(10000, 2, 3);

    assert!(matches!(
        encode(
            &samples,
            EncodingOptions::default().accelerator(Arc::new(Unavailable)),
            2
        ),
        Err(Error::Accelerator(_))
    ));

    assert_eq!(
        encode(
            &samples,
            EncodingOptions::default()
                .accelerator(Arc::new(Unavailable))
                .accelerator_fallback(true),
            2
        )
        .unwrap(),
        encode(&samples, EncodingOptions::default(), 2).unwrap()
    );
}

/// Runs kernels on the CPU, but fails once enough have completed
///
/// A transient fault fails a single task and then recovers.
struct Faulty {
    remaining: Arc<AtomicUsize>,
    transient: bool,
}

struct FaultyQueue {
    inner: Box<dyn CommandQueue>,
    remaining: Arc<AtomicUsize>,
    transient: bool,
}

impl Accelerator for Faulty {
    fn name(&self) -> &str {
        "faulty"
    }

    fn create_queue(&self) -> Result<Box<dyn CommandQueue>, Error> {
        Ok(Box::new(FaultyQueue {
            inner: CpuAccelerator.create_queue()?,
            remaining: self.remaining.clone(),
            transient: self.transient,
        }))
    }
}

impl CommandQueue for FaultyQueue {
    fn allocate(&mut self, kind: BufferKind, len: usize) -> Result<BufferHandle, Error> {
        self.inner.allocate(kind, len)
    }

    fn enqueue(&mut self, kernel: Kernel, args: &KernelArgs, work_items: usize) -> Result<(), Error> {
        self.inner.enqueue(kernel, args, work_items)
    }

    fn finish(&mut self) -> Result<(), Error> {
        match self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => self.inner.finish(),
            Err(_) if self.transient => {
                self.remaining.store(usize::MAX, Ordering::SeqCst);
                // leave the queue idle for reuse
                let _ = self.inner.finish();
                Err(Error::Accelerator("transient".to_owned()))
            }
            Err(_) => Err(Error::Accelerator("device lost".to_owned())),
        }
    }

    fn map(&self, buffer: BufferHandle) -> Result<&DeviceBuffer, Error> {
        self.inner.map(buffer)
    }

    fn map_mut(&mut self, buffer: BufferHandle) -> Result<&mut DeviceBuffer, Error> {
        self.inner.map_mut(buffer)
    }
}

#[test]
fn test_deferred_errors() {
    let samples = test_signal(40000, 2, 4);

    for threads in [0, 2] {
        let options = EncodingOptions::default()
            .block_size(1024)
            .unwrap()
            .frames_per_task(2)
            .unwrap()
            .threads(threads)
            .unwrap()
            .accelerator(Arc::new(Faulty {
                remaining: Arc::new(AtomicUsize::new(3)),
                transient: false,
            }));

        assert!(matches!(
            encode(&samples, options, 2),
            Err(Error::Accelerator(msg)) if msg == "device lost"
        ));
    }
}

#[test]
fn test_failed_stream_left_unfinished() {
    let samples = test_signal(8192, 1, 7);

    for finalize in [false, true] {
        let mut flac = Cursor::new(vec![]);
        let mut encoder = Encoder::new(
            &mut flac,
            EncodingOptions::default()
                .block_size(1024)
                .and_then(|o| o.frames_per_task(2))
                .and_then(|o| o.padding(0))
                .unwrap()
                .accelerator(Arc::new(Faulty {
                    remaining: Arc::new(AtomicUsize::new(0)),
                    transient: true,
                })),
            44100,
            24,
            NonZero::new(1).unwrap(),
            None,
        )
        .unwrap();

        // the first task's frames are lost
        let failure = samples
            .chunks(1024)
            .map(|chunk| encoder.encode(chunk))
            .find_map(Result::err);
        assert!(matches!(failure, Some(Error::Accelerator(msg)) if msg == "transient"));

        // later tasks would succeed, but the stream stays failed
        assert!(matches!(
            encoder.encode(&samples[..1024]),
            Err(Error::EncoderFailed)
        ));
        if finalize {
            assert!(matches!(encoder.finalize(), Err(Error::EncoderFailed)));
        } else {
            drop(encoder);
        }

        // metadata is left as first written, with no totals or checksum
        let flac = flac.into_inner();
        let Some(Ok(Block::Streaminfo(streaminfo))) = read_blocks(flac.as_slice()).next() else {
            panic!("missing STREAMINFO");
        };
        assert_eq!(streaminfo.total_samples, None);
        assert_eq!(streaminfo.md5, None);
        assert_eq!(streaminfo.minimum_frame_size, None);
    }
}

#[test]
fn test_seektable() {
    // 25 seconds of 8 kHz audio
    let samples = test_signal(200_000, 1, 5);
    let mut flac = Cursor::new(vec![]);
    let mut encoder = Encoder::new(
        &mut flac,
        EncodingOptions::preset(0).unwrap(),
        8000,
        24,
        NonZero::new(1).unwrap(),
        NonZero::new(200_000),
    )
    .unwrap();
    encoder.encode(&samples).unwrap();
    encoder.finalize().unwrap();
    let flac = flac.into_inner();

    let mut reader = flac.as_slice();
    let blocks = read_blocks(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let frames_start = flac.len() - reader.len();

    let Some(Block::Streaminfo(streaminfo)) = blocks.first() else {
        panic!("missing STREAMINFO");
    };
    assert_eq!(streaminfo.maximum_block_size, 512);

    let Some(Block::SeekTable(seektable)) = blocks.get(1) else {
        panic!("missing SEEKTABLE");
    };
    assert_eq!(seektable.points.len(), 3);

    for (point, target) in seektable.points.iter().zip([0, 80000, 160000]) {
        let SeekPoint::Defined {
            sample_offset,
            byte_offset,
            frame_samples,
        } = *point
        else {
            panic!("placeholder seek point");
        };
        assert!((sample_offset..sample_offset + u64::from(frame_samples)).contains(&target));

        let offset = frames_start + byte_offset as usize;
        assert_eq!(flac[offset..offset + 2], [0xFF, 0xF8]);

        let frame = decode_frame(&flac[offset..], streaminfo).unwrap();
        assert_eq!(frame.header.number * 512, sample_offset);
        assert_eq!(
            frame.samples,
            samples[sample_offset as usize..][..usize::from(frame_samples)]
        );
    }
}

#[test]
fn test_unseekable() {
    let samples = test_signal(10000, 2, 6);
    let mut flac = vec![];
    let mut encoder = Encoder::new(
        Unseekable(&mut flac),
        EncodingOptions::default(),
        44100,
        24,
        NonZero::new(2).unwrap(),
        NonZero::new(10000),
    )
    .unwrap();
    encoder.encode(&samples).unwrap();
    encoder.finalize().unwrap();

    let decoder = Decoder::new(Cursor::new(flac)).unwrap();
    // metadata is left as first written
    assert!(decoder.seektable().is_none());
    assert_eq!(decoder.streaminfo().md5, None);
    assert_eq!(decoder.streaminfo().minimum_frame_size, None);
    assert_eq!(decoder.decode_all().unwrap(), samples);
}

fn new_encoder(flac: &mut Cursor<Vec<u8>>, total: u64) -> Encoder<&mut Cursor<Vec<u8>>> {
    Encoder::new(
        flac,
        EncodingOptions::default(),
        44100,
        16,
        NonZero::new(2).unwrap(),
        NonZero::new(total),
    )
    .unwrap()
}

#[test]
fn test_sample_validation() {
    let mut flac = Cursor::new(vec![]);
    let mut encoder = new_encoder(&mut flac, 1000);
    assert!(matches!(encoder.encode(&[1, 2, 3]), Err(Error::MisalignedSamples)));
    assert!(matches!(encoder.encode(&[0, 32768]), Err(Error::SampleOutOfRange)));
    assert!(matches!(encoder.encode(&[-32769, 0]), Err(Error::SampleOutOfRange)));
    assert!(matches!(
        encoder.encode(&vec![0; 2002]),
        Err(Error::SampleCountMismatch)
    ));
    encoder.encode(&vec![0; 1000]).unwrap();
    assert!(matches!(encoder.finalize(), Err(Error::SampleCountMismatch)));

    let mut flac = Cursor::new(vec![]);
    let mut encoder = new_encoder(&mut flac, 1000);
    encoder.encode(&vec![0; 2000]).unwrap();
    encoder.finalize().unwrap();
}

fn try_encoder(
    options: EncodingOptions,
    sample_rate: u32,
    bits_per_sample: u32,
    channels: u8,
) -> Result<(), Error> {
    Encoder::new(
        Cursor::new(Vec::<u8>::new()),
        options,
        sample_rate,
        bits_per_sample,
        NonZero::new(channels).unwrap(),
        None,
    )
    .map(|_| ())
}

#[test]
fn test_stream_validation() {
    assert!(try_encoder(EncodingOptions::default(), 44100, 16, 2).is_ok());
    assert!(matches!(
        try_encoder(EncodingOptions::default(), 1 << 20, 16, 2),
        Err(Error::InvalidSampleRate)
    ));
    assert!(matches!(
        try_encoder(EncodingOptions::default(), 44100, 3, 2),
        Err(Error::InvalidBitsPerSample)
    ));
    assert!(matches!(
        try_encoder(EncodingOptions::default(), 44100, 25, 2),
        Err(Error::InvalidBitsPerSample)
    ));
    assert!(matches!(
        try_encoder(EncodingOptions::default(), 44100, 16, 9),
        Err(Error::ExcessiveChannels)
    ));
    // partition order larger than the block size allows
    assert!(matches!(
        try_encoder(
            EncodingOptions::default()
                .partition_order(0, 8)
                .and_then(|o| o.block_size(128))
                .unwrap(),
            44100,
            16,
            2
        ),
        Err(Error::InvalidPartitionOrder)
    ));
}
