use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use image::{DynamicImage, ImageFormat, ImageReader};
use shared::HistoryEntry;
use std::io;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Flat archive of classified images named `<unix-seconds>_<original-filename>`.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    folder: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Failed to list {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to open source image: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to copy image into archive: {0}")]
    Image(#[from] image::ImageError),
}

/// A slice of the history listing plus the number of well-formed entries overall.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,
    pub total: usize,
}

struct ArchivedName {
    file_name: String,
    timestamp: i64,
    original: String,
}

impl HistoryStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn ensure_folder(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.folder)
    }

    pub fn archive_name(timestamp: i64, original_filename: &str) -> String {
        format!("{}_{}", timestamp, original_filename)
    }

    /// Splits `<timestamp>_<original>` at the first underscore.
    pub fn parse_archive_name(file_name: &str) -> Option<(i64, &str)> {
        let (prefix, original) = file_name.split_once('_')?;
        let timestamp = prefix.parse().ok()?;
        Some((timestamp, original))
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn archive(&self, source: &Path, original_filename: &str) -> Result<PathBuf, HistoryError> {
        self.archive_at(source, original_filename, Utc::now().timestamp())
    }

    /// Writes a re-encoded copy of `source`. Same name in the same second overwrites.
    pub fn archive_at(
        &self,
        source: &Path,
        original_filename: &str,
        timestamp: i64,
    ) -> Result<PathBuf, HistoryError> {
        let target = self
            .folder
            .join(Self::archive_name(timestamp, original_filename));
        let image = ImageReader::open(source)?.with_guessed_format()?.decode()?;
        let format = ImageFormat::from_path(&target)?;
        let image = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
            _ => image,
        };
        image.save_with_format(&target, format)?;
        log::debug!("Archived {} to {}", source.display(), target.display());
        Ok(target)
    }

    /// Every archived image, newest first by descending file name.
    pub fn list_history(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        self.sorted_names()?
            .into_iter()
            .map(|name| self.load_entry(name))
            .collect()
    }

    pub fn list_page(&self, offset: usize, limit: usize) -> Result<HistoryPage, HistoryError> {
        let names = self.sorted_names()?;
        let total = names.len();
        let entries = names
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|name| self.load_entry(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(HistoryPage { entries, total })
    }

    fn sorted_names(&self) -> Result<Vec<ArchivedName>, HistoryError> {
        let read_dir = std::fs::read_dir(&self.folder).map_err(|source| HistoryError::ReadDir {
            path: self.folder.clone(),
            source,
        })?;

        let mut file_names = Vec::new();
        for dir_entry in read_dir {
            let dir_entry = dir_entry.map_err(|source| HistoryError::ReadDir {
                path: self.folder.clone(),
                source,
            })?;
            match dir_entry.file_name().into_string() {
                Ok(name) => file_names.push(name),
                Err(name) => log::warn!("Skipping non UTF-8 history file {:?}", name),
            }
        }
        file_names.sort_by(|a, b| b.cmp(a));

        Ok(file_names
            .into_iter()
            .filter(|name| has_image_extension(name))
            .filter_map(|file_name| match Self::parse_archive_name(&file_name) {
                Some((timestamp, original)) => Some(ArchivedName {
                    timestamp,
                    original: original.to_string(),
                    file_name,
                }),
                None => {
                    log::warn!("Skipping malformed history file name {}", file_name);
                    None
                }
            })
            .collect())
    }

    fn load_entry(&self, name: ArchivedName) -> Result<HistoryEntry, HistoryError> {
        let path = self.folder.join(&name.file_name);
        let bytes = std::fs::read(&path).map_err(|source| HistoryError::ReadFile {
            path: path.clone(),
            source,
        })?;
        Ok(HistoryEntry {
            timestamp: name.timestamp,
            filename: name.original,
            image: STANDARD.encode(bytes),
        })
    }
}

fn has_image_extension(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false)
}
