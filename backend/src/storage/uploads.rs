use std::io::{self, Write};
use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

pub const ALLOWED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Flat folder holding the most recent upload for each sanitized filename.
#[derive(Debug, Clone)]
pub struct UploadStore {
    folder: PathBuf,
}

impl UploadStore {
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

    /// `filename` must already be sanitized. Existing files are overwritten.
    pub fn save(&self, filename: &str, data: &[u8]) -> io::Result<PathBuf> {
        let path = self.folder.join(filename);
        let mut file = std::fs::File::create(&path)?;
        file.write_all(data)?;
        Ok(path)
    }
}

/// True when the part after the last dot is an allowed image extension.
pub fn allowed_file(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        })
        .unwrap_or(false)
}

/// Reduces a client filename to `[A-Za-z0-9_.-]` with no path components.
/// Characters are NFKD-decomposed and whatever is still non-ASCII is dropped,
/// so accents fold to their base letter. Whitespace runs become one underscore.
pub fn secure_filename(filename: &str) -> String {
    let ascii: String = filename
        .nfkd()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}
