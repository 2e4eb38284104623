//! The engine root
//!
//! One [`Runtime`] replaces any notion of global singletons: it owns the
//! configuration, the event bus, the disk I/O scheduler, the peak build
//! queue and the project. Startup order is fixed: load config, build the
//! runtime, open the device, then load (or assemble) the project.
//!
//! The runtime lives on the control thread. Its job at steady state is
//! plumbing: forwarding ring deliveries from disk I/O into the sheet's
//! command queue and routing disposals back ("lockless remove").

use crate::audiofile::dither::Dither;
use crate::engine::disk_io::{DiskIo, RingDelivery, WriteStreamSpec};
use crate::engine::read_source::{ReadSource, SourceHandles};
use crate::engine::write_source::{WriteHandles, WriteSource};
use crate::error::Result;
use crate::peak::builder::peaks_are_current;
use crate::peak::processor::PeakProcessor;
use crate::project::clip::Clip;
use crate::project::sheet::{Disposal, Sheet, SheetCommand, SheetController};
use crate::project::track::{Track, TrackKind};
use crate::project::Project;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use travada_common::config::Config;
use travada_common::ids::new_id;
use travada_common::EventBus;

pub struct Runtime {
    config: Config,
    events: EventBus,
    project: Project,
    disk: DiskIo,
    peaks: PeakProcessor,
    /// Sync-loss counters as of the last poll; the realtime thread only
    /// bumps atomics, the control thread turns deltas into events.
    sync_losses_seen: HashMap<i64, u64>,
}

impl Runtime {
    pub fn new(config: Config, project_name: &str, project_dir: PathBuf) -> Result<Runtime> {
        let events = EventBus::new();
        let disk = DiskIo::spawn(
            config.device.sample_rate,
            config.device.block_size as usize,
            config.engine.slot_count,
            events.clone(),
        );
        let peaks = PeakProcessor::spawn(events.clone());
        let project = Project::new(project_name, project_dir, config.project.clone())?;

        info!(
            "Runtime up: project '{}' at {}",
            project.name(),
            project.root_dir().display()
        );
        Ok(Runtime {
            config,
            events,
            project,
            disk,
            peaks,
            sync_losses_seen: HashMap::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn disk(&self) -> &DiskIo {
        &self.disk
    }

    pub fn peaks(&self) -> &PeakProcessor {
        &self.peaks
    }

    /// Import a file: register it with the project, hand it to disk I/O
    /// for streaming, and queue a peak build if the cache is missing or
    /// stale.
    pub fn import_file(&mut self, path: &Path) -> Result<SourceHandles> {
        let handles = self.project.import_source(path)?;
        self.disk.add_read_source(handles.clone());

        let peak_dir = self.project.peakfiles_dir();
        if !peaks_are_current(&peak_dir, &handles.info.path, handles.info.channel_count) {
            self.peaks
                .queue_build(handles.id(), handles.info.path.clone(), peak_dir);
        }
        Ok(handles)
    }

    /// Assemble a throwaway session: one audio track per file, each with
    /// a single clip covering the whole source at t = 0.
    pub fn build_session(&mut self, files: &[PathBuf]) -> Result<(Sheet, SheetController)> {
        let rate = self.config.device.sample_rate;
        let block_size = self.config.device.block_size as usize;
        let (mut sheet, controller) = Sheet::new(new_id(), rate, block_size);

        for (index, file) in files.iter().enumerate() {
            let handles = self.import_file(file)?;
            let mut track = Track::new(
                new_id(),
                format!("Track {}", index + 1),
                TrackKind::Audio,
                block_size,
            );
            let mut clip = Clip::new(new_id(), handles.info.name.clone(), sheet.id());
            clip.set_read_source(ReadSource::new(handles, rate));
            track.add_clip(clip);
            sheet.add_track(track);
        }
        Ok((sheet, controller))
    }

    /// Forward ring deliveries and disposals between disk I/O and a
    /// sheet. Returns the number of rings delivered, so callers can wait
    /// for a session to become fully streamable.
    pub fn pump(&mut self, controller: &mut SheetController) -> usize {
        let mut delivered = 0;
        for delivery in self.disk.poll_deliveries() {
            let command = match delivery {
                RingDelivery::Read { source_id, ring } => {
                    delivered += 1;
                    SheetCommand::AttachReadRing { source_id, ring }
                }
                RingDelivery::Write { source_id, ring } => {
                    delivered += 1;
                    SheetCommand::AttachWriteRing { source_id, ring }
                }
            };
            let _ = controller.send(command);
        }

        // Surface sync losses the realtime thread recorded since the
        // last poll (it never emits events itself).
        for handles in self.project.sources() {
            let losses = handles.status.sync_losses();
            let seen = self.sync_losses_seen.entry(handles.id()).or_insert(0);
            if losses > *seen {
                self.events.emit(travada_common::EngineEvent::SyncLost {
                    source_id: handles.id(),
                    occurrences: losses - *seen,
                });
                *seen = losses;
            }
        }

        for disposal in controller.poll_disposals() {
            match disposal {
                Disposal::ReadRing { source_id, half } => {
                    self.disk.dispose_read_ring(source_id, half);
                }
                Disposal::WriteRing { source_id, half } => {
                    self.disk.dispose_write_ring(source_id, half);
                }
                Disposal::Clip(mut clip) => {
                    debug!("Disposing clip {}", clip.id());
                    if let Some(mut source) = clip.take_read_source() {
                        let source_id = source.id();
                        self.disk.remove_read_source(source_id);
                        if let Some(half) = source.detach_ring() {
                            self.disk.dispose_read_ring(source_id, half);
                        }
                    }
                }
                Disposal::Track(mut track) => {
                    debug!("Disposing track {}", track.id());
                    for clip in track.clips_mut() {
                        if let Some(mut source) = clip.take_read_source() {
                            let source_id = source.id();
                            self.disk.remove_read_source(source_id);
                            if let Some(half) = source.detach_ring() {
                                self.disk.dispose_read_ring(source_id, half);
                            }
                        }
                    }
                }
            }
        }
        delivered
    }

    /// Prepare a capture for an armed track: create the write stream on
    /// disk I/O and a recording clip, and queue both into the sheet.
    /// Returns the new clip id and the capture file path.
    pub fn arm_capture(
        &mut self,
        controller: &mut SheetController,
        track_id: i64,
        track_name: &str,
        channel_count: usize,
    ) -> Result<(i64, PathBuf)> {
        let source_id = new_id();
        let file_name = Project::recording_file_name(
            track_name,
            source_id,
            self.config.recording.file_format,
        );
        let path = self.project.audiosources_dir().join(&file_name);

        let handles = WriteHandles::new(source_id, path.clone(), channel_count);
        let spec = WriteStreamSpec {
            format: self.config.recording.file_format,
            bit_depth: self.config.recording.bit_depth,
            dither: Dither::default_mode(self.config.recording.bit_depth),
            capture_rate: self.config.device.sample_rate,
            file_rate: self.config.device.sample_rate,
            peakfiles_dir: Some(self.project.peakfiles_dir()),
        };
        self.disk.add_write_source(handles.clone(), spec);

        let clip_id = new_id();
        let mut clip = Clip::new(clip_id, Project::short_name(&file_name), 0);
        clip.begin_recording(WriteSource::new(
            handles,
            self.config.device.sample_rate,
        ));

        let _ = controller.send(SheetCommand::SetTrackArm {
            track_id,
            armed: true,
        });
        let _ = controller.send(SheetCommand::AddClip {
            track_id,
            clip: Box::new(clip),
        });
        controller.transport().set_recording(true);

        info!(
            "Capture armed on track {}: clip {} -> {}",
            track_id,
            clip_id,
            path.display()
        );
        Ok((clip_id, path))
    }

    /// Turn a finished capture file into the recording clip's playback
    /// source (reacts to the disk side's RecordingFinished event).
    pub fn convert_finished_recording(
        &mut self,
        controller: &mut SheetController,
        track_id: i64,
        clip_id: i64,
        file: &Path,
    ) -> Result<()> {
        let handles = self.import_file(file)?;
        let rate = self.config.device.sample_rate;
        let _ = controller.send(SheetCommand::ConvertRecordedClip {
            track_id,
            clip_id,
            source: Box::new(ReadSource::new(handles, rate)),
        });
        Ok(())
    }
}
