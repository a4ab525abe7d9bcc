#![forbid(unsafe_code)]

//! On-disk layout for downloaded artifacts.
//!
//! Every video gets its own directory named after its identifier:
//!
//! ```text
//! <root>/<id>/<id>.mp4
//! <root>/<id>/<id>.info.json
//! <root>/<id>/<id>.jpg
//! <root>/<id>/metadata.json
//! ```
//!
//! `metadata.json` is written last and atomically, so its presence together
//! with a non-empty media file marks a finished download that can be reused.

use std::{
    fs, io,
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use crate::model::{DownloadResult, Metadata, VideoTask};

pub const METADATA_FILE: &str = "metadata.json";
pub const COOKIES_FILE: &str = "cookies.txt";
const MEDIA_EXTENSIONS: &[&str] = &["mp4"];
const THUMBNAIL_EXTENSIONS: &[&str] = &["jpg", "jpeg", "webp", "png"];
const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl"];

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub fn dir_for(&self, identifier: &str) -> PathBuf {
        self.root.join(identifier)
    }

    pub fn create_dir_for(&self, identifier: &str) -> io::Result<PathBuf> {
        let dir = self.dir_for(identifier);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Optional cookies jar handed to yt-dlp when present.
    pub fn cookies_path(&self) -> Option<PathBuf> {
        let path = self.root.join(COOKIES_FILE);
        path.is_file().then_some(path)
    }

    pub fn write_metadata(&self, identifier: &str, metadata: &Metadata) -> io::Result<PathBuf> {
        let dir = self.create_dir_for(identifier)?;
        let target = dir.join(METADATA_FILE);
        let payload = serde_json::to_vec_pretty(metadata).map_err(io::Error::other)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&payload)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|err| err.error)?;
        Ok(target)
    }

    pub fn read_metadata(&self, identifier: &str) -> Option<Metadata> {
        let path = self.dir_for(identifier).join(METADATA_FILE);
        let raw = fs::read(&path).ok()?;
        match serde_json::from_slice::<Metadata>(&raw) {
            Ok(metadata) if metadata.validate().is_ok() => Some(metadata),
            Ok(_) | Err(_) => {
                debug!(path = %path.display(), "ignoring unusable staged metadata");
                None
            }
        }
    }

    pub fn find_media(&self, identifier: &str) -> Option<PathBuf> {
        self.find_with_extension(identifier, MEDIA_EXTENSIONS)
            .filter(|path| file_len(path) > 0)
    }

    pub fn find_thumbnail(&self, identifier: &str) -> Option<PathBuf> {
        self.find_with_extension(identifier, THUMBNAIL_EXTENSIONS)
            .filter(|path| file_len(path) > 0)
    }

    pub fn find_info_json(&self, identifier: &str) -> Option<PathBuf> {
        let path = self
            .dir_for(identifier)
            .join(format!("{identifier}.info.json"));
        path.is_file().then_some(path)
    }

    /// True when yt-dlp left a resumable fragment behind.
    pub fn has_partial(&self, identifier: &str) -> bool {
        self.entries(identifier).any(|path| {
            extension_of(&path).is_some_and(|ext| PARTIAL_EXTENSIONS.contains(&ext.as_str()))
        })
    }

    /// Rebuilds a [`DownloadResult`] from a previous run's finished download.
    pub fn completed_download(&self, task: &VideoTask) -> Option<DownloadResult> {
        let metadata = self.read_metadata(&task.identifier)?;
        let media_path = self.find_media(&task.identifier)?;
        Some(DownloadResult {
            task: task.clone(),
            media_path,
            thumbnail_path: self.find_thumbnail(&task.identifier),
            metadata,
        })
    }

    pub fn remove(&self, identifier: &str) -> io::Result<()> {
        let dir = self.dir_for(identifier);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Identifiers of every per-video directory still present under the root.
    pub fn leftovers(&self) -> Vec<String> {
        let mut ids: Vec<String> = WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
            .collect();
        ids.sort();
        ids
    }

    fn entries(&self, identifier: &str) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(self.dir_for(identifier))
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
    }

    /// Only `<id>.<ext>` counts; yt-dlp intermediates such as `<id>.f137.mp4`
    /// are ignored.
    fn find_with_extension(&self, identifier: &str, extensions: &[&str]) -> Option<PathBuf> {
        let dir = self.dir_for(identifier);
        extensions
            .iter()
            .map(|ext| dir.join(format!("{identifier}.{ext}")))
            .find(|path| path.is_file())
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn metadata(title: &str) -> Metadata {
        Metadata {
            title: title.into(),
            description: "desc".into(),
            tags: BTreeSet::from(["a".to_string()]),
            published_at: None,
            duration_sec: 12,
        }
    }

    fn task(id: &str) -> VideoTask {
        VideoTask::new(id, None, None).unwrap()
    }

    #[test]
    fn metadata_round_trips_through_disk() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(temp.path());
        let path = staging.write_metadata("abc", &metadata("Title")).unwrap();
        assert!(path.ends_with("abc/metadata.json"));
        assert_eq!(staging.read_metadata("abc"), Some(metadata("Title")));
    }

    #[test]
    fn completed_download_requires_metadata_and_media() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(temp.path());
        let dir = staging.create_dir_for("abc").unwrap();
        fs::write(dir.join("abc.mp4"), b"video").unwrap();
        assert!(staging.completed_download(&task("abc")).is_none());

        staging.write_metadata("abc", &metadata("Title")).unwrap();
        fs::write(dir.join("abc.webp"), b"thumb").unwrap();
        let resumed = staging.completed_download(&task("abc")).unwrap();
        assert_eq!(resumed.media_path, dir.join("abc.mp4"));
        assert_eq!(resumed.thumbnail_path, Some(dir.join("abc.webp")));
    }

    #[test]
    fn empty_media_is_not_reused() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(temp.path());
        let dir = staging.create_dir_for("abc").unwrap();
        fs::write(dir.join("abc.mp4"), b"").unwrap();
        staging.write_metadata("abc", &metadata("Title")).unwrap();
        assert!(staging.find_media("abc").is_none());
        assert!(staging.completed_download(&task("abc")).is_none());
    }

    #[test]
    fn format_intermediates_are_not_taken_for_the_merged_file() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(temp.path());
        let dir = staging.create_dir_for("abc").unwrap();
        fs::write(dir.join("abc.f137.mp4"), b"video only").unwrap();
        assert!(staging.find_media("abc").is_none());

        fs::write(dir.join("abc.mp4"), b"merged").unwrap();
        assert_eq!(staging.find_media("abc"), Some(dir.join("abc.mp4")));
    }

    #[test]
    fn partial_fragments_are_detected() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(temp.path());
        let dir = staging.create_dir_for("abc").unwrap();
        assert!(!staging.has_partial("abc"));
        fs::write(dir.join("abc.mp4.part"), b"half").unwrap();
        assert!(staging.has_partial("abc"));
        assert!(staging.find_media("abc").is_none());
    }

    #[test]
    fn remove_and_leftovers() {
        let temp = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(temp.path());
        staging.create_dir_for("b").unwrap();
        staging.create_dir_for("a").unwrap();
        fs::write(temp.path().join("sync-state.db"), b"").unwrap();
        assert_eq!(staging.leftovers(), vec!["a", "b"]);

        staging.remove("a").unwrap();
        staging.remove("missing").unwrap();
        assert_eq!(staging.leftovers(), vec!["b"]);
    }
}
