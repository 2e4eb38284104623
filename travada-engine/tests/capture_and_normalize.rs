//! Capture path and normalization tests: armed track -> write source ->
//! disk encoder -> finished take, plus peak-store-driven normalization.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use travada_common::config::{BitDepth, Config, RecordFormat};
use travada_common::{EngineEvent, TimeRef};
use travada_engine::audiofile::dither::DitherMode;
use travada_engine::audiofile::reader::{DecodeBuffer, FileReader};
use travada_engine::audiofile::writer::FileWriter;
use travada_engine::peak::builder::build_peaks;
use travada_engine::peak::Peak;
use travada_engine::project::clip::{Clip, RecordingState};
use travada_engine::project::sheet::SheetCommand;
use travada_engine::project::track::{Track, TrackKind};
use travada_engine::runtime::Runtime;

const RATE: u32 = 48_000;
const BLOCK: u32 = 512;

fn test_config() -> Config {
    let mut config = Config::default();
    config.device.sample_rate = RATE;
    config.device.block_size = BLOCK;
    config.engine.slot_count = 16;
    config.recording.file_format = RecordFormat::Wav;
    config.recording.bit_depth = BitDepth::Float32;
    config
}

/// Goertzel magnitude of one frequency bin over the whole buffer.
fn goertzel(samples: &[f32], rate: f32, freq: f32) -> f64 {
    let omega = 2.0 * std::f64::consts::PI * freq as f64 / rate as f64;
    let coeff = 2.0 * omega.cos();
    let (mut s0, mut s1, mut s2) = (0.0f64, 0.0f64, 0.0f64);
    for &sample in samples {
        s0 = sample as f64 + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    (s1 * s1 + s2 * s2 - coeff * s1 * s2).sqrt()
}

/// Scenario: record one second of a full-scale 1 kHz sine into an armed
/// mono track; the finished WAV holds 48000 frames of the sine.
#[test]
fn one_second_sine_capture() {
    let dir = tempfile::tempdir().unwrap();
    let mut runtime = Runtime::new(test_config(), "test", dir.path().join("project")).unwrap();
    let mut events = runtime.events().subscribe();

    // A session with one empty audio track, driven manually.
    let (mut sheet, mut controller) = runtime.build_session(&[]).unwrap();
    let track_id = 777;
    sheet.add_track(Track::new(track_id, "Vocals", TrackKind::Audio, BLOCK as usize));

    let (clip_id, take_path) = runtime
        .arm_capture(&mut controller, track_id, "Vocals", 1)
        .unwrap();

    // Wait until the sheet holds the recording clip with its write ring
    // attached (arm + clip commands apply first; the ring delivery from
    // disk I/O follows through the same queue).
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        runtime.pump(&mut controller);
        sheet.process_cycle(0);
        let streamable = sheet.tracks().iter().any(|t| {
            t.clips().iter().any(|c| {
                c.id() == clip_id
                    && c.write_source().map(|w| w.has_ring()).unwrap_or(false)
            })
        });
        if streamable {
            break;
        }
        assert!(Instant::now() < deadline, "recording clip never became streamable");
        std::thread::sleep(Duration::from_millis(5));
    }
    let capture_status = sheet
        .track_mut(track_id)
        .unwrap()
        .clip_mut(clip_id)
        .unwrap()
        .write_source()
        .unwrap()
        .handles()
        .status
        .clone();
    controller.send(SheetCommand::Start).ok().unwrap();
    sheet.process_cycle(0);

    // Feed exactly one second of sine through the input bus, pacing on
    // the ring's fill level so the disk side never overflows.
    let total = RATE as usize;
    let mut produced = 0usize;
    while produced < total {
        while capture_status.fill_percent() > 50 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let n = (total - produced).min(BLOCK as usize);
        {
            let track = sheet.track_mut(track_id).unwrap();
            let input = track.input_bus_mut();
            for i in 0..n {
                let t = (produced + i) as f32 / RATE as f32;
                let sample = (2.0 * std::f32::consts::PI * 1000.0 * t).sin();
                input.channel_mut(0, n)[i] = sample;
            }
        }
        sheet.process_cycle(n);
        produced += n;
        std::thread::sleep(Duration::from_millis(1));
    }

    controller.send(SheetCommand::Stop).ok().unwrap();
    sheet.process_cycle(0);
    runtime.pump(&mut controller);

    // Disk I/O drains, flushes and reports the finished take.
    let deadline = Instant::now() + Duration::from_secs(10);
    let finished = loop {
        assert!(Instant::now() < deadline, "recording never finished");
        runtime.pump(&mut controller);
        match events.try_recv() {
            Ok(EngineEvent::RecordingFinished { frames, .. }) => break frames,
            Ok(_) => {}
            Err(_) => std::thread::sleep(Duration::from_millis(10)),
        }
    };
    assert_eq!(finished, RATE as i64);

    // The written take: 48000 frames, essentially full scale, and the
    // 1 kHz bin dominates.
    let reader = hound::WavReader::open(&take_path).unwrap();
    assert_eq!(reader.duration(), RATE);
    let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    assert!(peak >= 0.999, "peak {}", peak);

    let at_1k = goertzel(&samples, RATE as f32, 1000.0);
    for other in [250.0, 500.0, 2000.0, 4000.0] {
        let magnitude = goertzel(&samples, RATE as f32, other);
        assert!(
            at_1k > magnitude * 10.0,
            "1 kHz bin {} not dominant over {} Hz bin {}",
            at_1k,
            other,
            magnitude
        );
    }

    // Converting the finished take turns the clip back into a playback
    // clip over the recorded source.
    runtime
        .convert_finished_recording(&mut controller, track_id, clip_id, &take_path)
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        runtime.pump(&mut controller);
        sheet.process_cycle(0);
        let clip = sheet
            .track_mut(track_id)
            .unwrap()
            .clip_mut(clip_id)
            .unwrap();
        if clip.recording_state() == RecordingState::NotRecording {
            assert!(clip.read_source().is_some());
            assert_eq!(clip.length(), TimeRef::from_frames(RATE as i64, RATE));
            break;
        }
        assert!(Instant::now() < deadline, "take was never converted");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Round trip property: float frames written through the encoder and
/// decoded back are identical; 24-bit material on the 2^23 grid survives
/// exactly as well.
#[test]
fn write_read_round_trip_is_exact() {
    let dir = tempfile::tempdir().unwrap();

    // 24-bit grid values round trip exactly.
    let path = dir.path().join("grid24.wav");
    let input: Vec<f32> = (0..4096)
        .map(|i| ((i * 37 % 16_777_216) as i64 - 8_388_608) as f32 / 8_388_608.0)
        .collect();
    let mut writer = FileWriter::create(
        &path,
        RecordFormat::Wav,
        1,
        RATE,
        BitDepth::Int24,
        DitherMode::None,
    )
    .unwrap();
    writer.write_frames(&input).unwrap();
    writer.finalize().unwrap();

    let mut reader = FileReader::open(&path).unwrap();
    let mut buf = DecodeBuffer::new();
    assert_eq!(reader.read(&mut buf, 4096).unwrap(), 4096);
    for (i, (a, b)) in input.iter().zip(buf.channel(0)).enumerate() {
        assert_eq!(a, b, "frame {}", i);
    }
}

/// Scenario: normalization. A clip over a 0.5-peak source normalized to
/// -3 dBFS gets gain (10^(-3/20) - eps) / 0.5; running it again is a
/// no-op.
#[test]
fn normalization_factor_from_peak_store() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("half.wav");
    let peaks_dir = dir.path().join("peakfiles");

    // Triangle wave peaking at exactly 0.5.
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 44_100,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&source, spec).unwrap();
    for frame in 0..100_000usize {
        let phase = (frame % 64) as f32 / 64.0;
        let value = if phase < 0.5 {
            4.0 * phase - 1.0
        } else {
            3.0 - 4.0 * phase
        };
        writer.write_sample(value * 0.5).unwrap();
    }
    writer.finalize().unwrap();

    let interrupt = AtomicBool::new(false);
    build_peaks(&source, &peaks_dir, &interrupt, |_| {}).unwrap();
    let mut peak = Peak::open(&peaks_dir, &source, 1, 44_100).unwrap();

    let mut clip = Clip::new(1, "half", 1);
    let handles = travada_engine::engine::read_source::SourceHandles::new(
        travada_engine::engine::read_source::SourceInfo {
            id: 5,
            name: "half.wav".into(),
            path: source.clone(),
            channel_count: 1,
            file_rate: 44_100,
            length: TimeRef::from_frames(100_000, 44_100),
        },
    );
    clip.set_read_source(travada_engine::engine::read_source::ReadSource::new(
        handles, 44_100,
    ));

    let factor = clip.normalization_factor(-3.0, &mut peak).unwrap();
    let expected = (10.0f32.powf(-3.0 / 20.0) - f32::EPSILON) / 0.5;
    assert!(
        (factor - expected).abs() < 2e-3,
        "factor {} expected {}",
        factor,
        expected
    );

    // Apply it; a second normalization to the same target returns the
    // same gain (a no-op for a group command).
    clip.set_gain(factor);
    let again = clip.normalization_factor(-3.0, &mut peak).unwrap();
    assert!((again - clip.gain()).abs() < 2e-3);
}

/// Peak files survive only while newer than their source (stale caches
/// are rejected at open).
#[test]
fn stale_peak_cache_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("s.wav");
    let peaks_dir = dir.path().join("peakfiles");

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 44_100,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(&source, spec).unwrap();
    for _ in 0..50_000 {
        writer.write_sample(0.3f32).unwrap();
    }
    writer.finalize().unwrap();

    let interrupt = AtomicBool::new(false);
    build_peaks(&source, &peaks_dir, &interrupt, |_| {}).unwrap();
    assert!(Peak::open(&peaks_dir, Path::new(&source), 1, 44_100).is_ok());

    std::thread::sleep(Duration::from_millis(1100));
    // Touch the source: the cache is now stale.
    let mut writer = hound::WavWriter::create(&source, spec).unwrap();
    writer.write_sample(0.9f32).unwrap();
    writer.finalize().unwrap();
    assert!(Peak::open(&peaks_dir, Path::new(&source), 1, 44_100).is_err());
}
