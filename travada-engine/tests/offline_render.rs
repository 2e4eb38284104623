//! End-to-end streaming tests: files -> disk I/O rings -> clip/track mix
//! -> offline render.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use travada_common::config::{BitDepth, Config, RecordFormat};
use travada_common::TimeRef;
use travada_engine::audiofile::dither::DitherMode;
use travada_engine::export::{render, ExportSpecification};
use travada_engine::runtime::Runtime;

fn write_ramp_wav(path: &Path, frames: usize, rate: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for frame in 0..frames {
        writer.write_sample(frame as f32 / frames as f32).unwrap();
    }
    writer.finalize().unwrap();
}

fn write_dc_wav(path: &Path, frames: usize, rate: u32, value: f32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for _ in 0..frames {
        writer.write_sample(value).unwrap();
    }
    writer.finalize().unwrap();
}

fn test_config(rate: u32, block: u32) -> Config {
    let mut config = Config::default();
    config.device.sample_rate = rate;
    config.device.block_size = block;
    config.engine.slot_count = 16;
    config
}

fn export_spec(dir: &Path, name: &str, rate: u32, start: TimeRef, end: TimeRef, block: usize)
    -> ExportSpecification
{
    ExportSpecification {
        export_dir: dir.to_path_buf(),
        file_name: name.to_string(),
        format: RecordFormat::Wav,
        channel_count: 2,
        sample_rate: rate,
        bit_depth: BitDepth::Float32,
        dither: DitherMode::None,
        export_start: start,
        export_end: end,
        block_size: block,
        extra_format: HashMap::new(),
    }
}

fn wait_for_rings(runtime: &mut Runtime, controller: &mut travada_engine::project::sheet::SheetController, expected: usize) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut delivered = 0;
    while delivered < expected {
        delivered += runtime.pump(controller);
        assert!(
            std::time::Instant::now() < deadline,
            "rings were not delivered in time"
        );
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

/// Gapless playback: a 192000-frame source at 48 kHz streams through the
/// ring layer with no sync losses, and the rendered output is the file,
/// bit exact.
#[test]
fn gapless_stream_renders_bit_exact() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("ramp.wav");
    let rate = 48_000;
    let frames = 192_000usize;
    write_ramp_wav(&source, frames, rate);

    let mut runtime = Runtime::new(
        test_config(rate, 512),
        "test",
        dir.path().join("project"),
    )
    .unwrap();
    let (mut sheet, mut controller) = runtime.build_session(&[source]).unwrap();
    wait_for_rings(&mut runtime, &mut controller, 1);

    let end = sheet.end_location();
    assert_eq!(end, TimeRef::from_frames(frames as i64, rate));
    // 192000 = 375 * 512: the last cycle is a full block here; the
    // partial-tail case is covered below.
    let spec = export_spec(dir.path(), "out.wav", rate, TimeRef::ZERO, end, 512);
    let out = render(&mut sheet, &mut controller, runtime.disk(), &spec).unwrap();

    let reader = hound::WavReader::open(&out).unwrap();
    assert_eq!(reader.duration() as usize, frames);
    let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
    for (frame, pair) in samples.chunks_exact(2).enumerate() {
        let expected = frame as f32 / frames as f32;
        assert_eq!(pair[0], expected, "left frame {}", frame);
        assert_eq!(pair[1], expected, "right frame {}", frame);
    }

    // No out-of-sync transition happened once streaming was primed.
    let clip = &sheet.tracks()[0].clips()[0];
    assert_eq!(clip.read_source().unwrap().handles().status.sync_losses(), 0);
}

/// The render range does not have to be a whole number of blocks: the
/// tail cycle writes the frames actually produced, not the block size.
#[test]
fn partial_tail_block_uses_actual_frames() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("ramp.wav");
    let rate = 48_000;
    let frames = 10_000usize; // 19 * 512 + 272
    write_ramp_wav(&source, frames, rate);

    let mut runtime = Runtime::new(
        test_config(rate, 512),
        "test",
        dir.path().join("project"),
    )
    .unwrap();
    let (mut sheet, mut controller) = runtime.build_session(&[source]).unwrap();
    wait_for_rings(&mut runtime, &mut controller, 1);

    let end = sheet.end_location();
    let spec = export_spec(dir.path(), "tail.wav", rate, TimeRef::ZERO, end, 512);
    let out = render(&mut sheet, &mut controller, runtime.disk(), &spec).unwrap();

    let reader = hound::WavReader::open(&out).unwrap();
    assert_eq!(reader.duration() as usize, frames);
}

/// Two tracks sum into the master; clip gain applies per clip.
#[test]
fn tracks_mix_additively() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.wav");
    let b = dir.path().join("b.wav");
    let rate = 44_100;
    write_dc_wav(&a, 44_100, rate, 0.25);
    write_dc_wav(&b, 44_100, rate, 0.5);

    let mut runtime = Runtime::new(
        test_config(rate, 256),
        "test",
        dir.path().join("project"),
    )
    .unwrap();
    let (mut sheet, mut controller) = runtime.build_session(&[a, b]).unwrap();
    wait_for_rings(&mut runtime, &mut controller, 2);

    let end = sheet.end_location();
    let spec = export_spec(dir.path(), "mix.wav", rate, TimeRef::ZERO, end, 256);
    let out = render(&mut sheet, &mut controller, runtime.disk(), &spec).unwrap();

    let reader = hound::WavReader::open(&out).unwrap();
    let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
    // Skip the very edges; everything inside must be the plain sum.
    for pair in samples.chunks_exact(2).skip(10).take(40_000) {
        assert!((pair[0] - 0.75).abs() < 1e-6, "got {}", pair[0]);
    }
}

/// A muted clip renders silence without disturbing the other track.
#[test]
fn muted_clip_is_silent_in_the_mix() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.wav");
    let b = dir.path().join("b.wav");
    let rate = 44_100;
    write_dc_wav(&a, 22_050, rate, 0.25);
    write_dc_wav(&b, 22_050, rate, 0.5);

    let mut runtime = Runtime::new(
        test_config(rate, 256),
        "test",
        dir.path().join("project"),
    )
    .unwrap();
    let files: [PathBuf; 2] = [a, b];
    let (mut sheet, mut controller) = runtime.build_session(&files).unwrap();
    wait_for_rings(&mut runtime, &mut controller, 2);

    // Mute the second track's clip before rendering.
    let track_id = sheet.tracks()[1].id();
    let clip_id = sheet.tracks()[1].clips()[0].id();
    controller
        .send(travada_engine::project::sheet::SheetCommand::SetClipMute {
            track_id,
            clip_id,
            muted: true,
        })
        .ok()
        .unwrap();

    let end = sheet.end_location();
    let spec = export_spec(dir.path(), "muted.wav", rate, TimeRef::ZERO, end, 256);
    let out = render(&mut sheet, &mut controller, runtime.disk(), &spec).unwrap();

    let reader = hound::WavReader::open(&out).unwrap();
    let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
    for pair in samples.chunks_exact(2).skip(10).take(20_000) {
        assert!((pair[0] - 0.25).abs() < 1e-6, "got {}", pair[0]);
    }
}

/// Scenario: fade-in application. A linear one-second fade-in scales the
/// rendered samples by elapsed/range.
#[test]
fn linear_fade_in_scales_rendered_output() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("dc.wav");
    let rate = 48_000;
    write_dc_wav(&source, 96_000, rate, 1.0);

    let mut runtime = Runtime::new(
        test_config(rate, 512),
        "test",
        dir.path().join("project"),
    )
    .unwrap();
    let (mut sheet, mut controller) = runtime.build_session(&[source]).unwrap();
    wait_for_rings(&mut runtime, &mut controller, 1);

    {
        let track = &mut sheet.tracks_mut()[0];
        let clip = &mut track.clips_mut()[0];
        clip.set_fade_in_range(TimeRef::ONE_SECOND);
        clip.fade_in_mut().unwrap().set_shape("Linear");
    }

    let end = sheet.end_location();
    let spec = export_spec(dir.path(), "faded.wav", rate, TimeRef::ZERO, end, 512);
    let out = render(&mut sheet, &mut controller, runtime.disk(), &spec).unwrap();

    let reader = hound::WavReader::open(&out).unwrap();
    let samples: Vec<f32> = reader.into_samples::<f32>().map(|s| s.unwrap()).collect();
    let left: Vec<f32> = samples.chunks_exact(2).map(|p| p[0]).collect();

    assert!(left[0].abs() < 1e-5, "t=0 must be silent, got {}", left[0]);
    let mid = left[rate as usize / 2];
    assert!((mid - 0.5).abs() < 1e-3, "t=0.5s must be 0.5, got {}", mid);
    let after = left[rate as usize + 100];
    assert!((after - 1.0).abs() < 1e-5, "t>1s must be unity, got {}", after);
}
