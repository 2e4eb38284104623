//! Project model: sources, sheets, clips, tracks
//!
//! The project owns the source registry and the on-disk directory layout
//! (`audiosources/` for imported and recorded audio, `peakfiles/` for
//! waveform caches). Children reference each other by id only.

pub mod clip;
pub mod curve;
pub mod fade;
pub mod plugin;
pub mod sheet;
pub mod track;

use crate::audiofile::reader::FileReader;
use crate::engine::read_source::{SourceHandles, SourceInfo};
use crate::error::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;
use travada_common::config::{ProjectConfig, RecordFormat};
use travada_common::ids::new_id;

pub struct Project {
    name: String,
    root_dir: PathBuf,
    layout: ProjectConfig,
    sources: HashMap<i64, SourceHandles>,
}

impl Project {
    /// Open or create a project directory with the standard layout.
    pub fn new(name: impl Into<String>, root_dir: PathBuf, layout: ProjectConfig) -> Result<Self> {
        let project = Project {
            name: name.into(),
            root_dir,
            layout,
            sources: HashMap::new(),
        };
        std::fs::create_dir_all(project.audiosources_dir())?;
        std::fs::create_dir_all(project.peakfiles_dir())?;
        Ok(project)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn audiosources_dir(&self) -> PathBuf {
        self.root_dir.join(&self.layout.audiosources_dir)
    }

    pub fn peakfiles_dir(&self) -> PathBuf {
        self.root_dir.join(&self.layout.peakfiles_dir)
    }

    /// Import an audio file: probe its format, copy it into the audio
    /// sources directory if it lives elsewhere, and register it.
    pub fn import_source(&mut self, path: &Path) -> Result<SourceHandles> {
        let reader = FileReader::open(path)?;
        let channel_count = reader.channel_count();
        let file_rate = reader.file_rate();
        let length = reader.length();
        drop(reader);

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "import".to_string());
        let sources_dir = self.audiosources_dir();
        let resident = path.starts_with(&sources_dir);
        let resident_path = if resident {
            path.to_path_buf()
        } else {
            let dest = sources_dir.join(&file_name);
            if !dest.exists() {
                std::fs::copy(path, &dest)?;
            }
            dest
        };

        let id = new_id();
        let handles = SourceHandles::new(SourceInfo {
            id,
            name: file_name,
            path: resident_path,
            channel_count,
            file_rate,
            length,
        });
        info!(
            "Imported source {}: {} ({} ch, {} Hz, {})",
            id,
            handles.info.path.display(),
            channel_count,
            file_rate,
            length
        );
        self.sources.insert(id, handles.clone());
        Ok(handles)
    }

    /// Register a freshly recorded file (already inside audiosources/).
    pub fn register_recorded_source(&mut self, path: &Path) -> Result<SourceHandles> {
        self.import_source(path)
    }

    pub fn source(&self, id: i64) -> Option<&SourceHandles> {
        self.sources.get(&id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceHandles> {
        self.sources.values()
    }

    pub fn remove_source(&mut self, id: i64) -> Option<SourceHandles> {
        self.sources.remove(&id)
    }

    /// File name for a new capture on a track: the track name plus the
    /// source id, so takes never collide. The id suffix is what display
    /// code strips to recover the short name.
    pub fn recording_file_name(track_name: &str, source_id: i64, format: RecordFormat) -> String {
        let extension = match format {
            RecordFormat::Wav => "wav",
            RecordFormat::W64 => "w64",
        };
        format!("{}-take-{}.{}", track_name, source_id, extension)
    }

    /// Display name of a source: recorded takes lose their id suffix.
    pub fn short_name(source_name: &str) -> &str {
        match source_name.rfind("-take-") {
            Some(at) => &source_name[..at],
            None => source_name,
        }
    }
}
