//! Display categories and size formatting for uploaded files.

use serde::{Deserialize, Serialize};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];
const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "webm", "ogg"];
const AUDIO_EXTENSIONS: [&str; 2] = ["mp3", "wav"];
const DOCUMENT_EXTENSIONS: [&str; 7] = ["pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx"];

/// How a file should be previewed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Image,
    Video,
    Audio,
    Document,
    Other,
}

impl FileCategory {
    /// Infer the category from the extension of the last path segment of a
    /// URL or file name. Query strings and fragments are ignored.
    pub fn from_url(url: &str) -> Self {
        match extension_of(url) {
            Some(ext) => Self::from_extension(&ext),
            None => Self::Other,
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.to_ascii_lowercase();
        let ext = ext.as_str();
        if IMAGE_EXTENSIONS.contains(&ext) {
            Self::Image
        } else if VIDEO_EXTENSIONS.contains(&ext) {
            Self::Video
        } else if AUDIO_EXTENSIONS.contains(&ext) {
            Self::Audio
        } else if DOCUMENT_EXTENSIONS.contains(&ext) {
            Self::Document
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Other => "other",
        }
    }
}

/// Lowercased extension of the last path segment, without the dot.
pub fn extension_of(name: &str) -> Option<String> {
    let path = name.split(['?', '#']).next().unwrap_or(name);
    let segment = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Best-effort content type for a file name.
pub fn content_type_for(name: &str) -> Option<String> {
    mime_guess::from_path(name)
        .first()
        .map(|mime| mime.essence_str().to_string())
}

/// Human readable size using 1024-based units, e.g. `1.5 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let formatted = format!("{:.2}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_by_extension() {
        assert_eq!(
            FileCategory::from_url("http://host/media/uploads/a.JPG"),
            FileCategory::Image
        );
        assert_eq!(FileCategory::from_url("clip.webm"), FileCategory::Video);
        assert_eq!(FileCategory::from_url("song.mp3"), FileCategory::Audio);
        assert_eq!(FileCategory::from_url("report.xlsx"), FileCategory::Document);
        assert_eq!(FileCategory::from_url("archive.tar.gz"), FileCategory::Other);
        assert_eq!(FileCategory::from_url("README"), FileCategory::Other);
    }

    #[test]
    fn ignores_query_and_directory_dots() {
        assert_eq!(
            FileCategory::from_url("http://host.example/media/v1.2/photo.png?x=1"),
            FileCategory::Image
        );
        assert_eq!(FileCategory::from_url("http://host/dir.v2/noext"), FileCategory::Other);
        assert_eq!(extension_of(".hidden"), None);
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 * 1024 * 1024), "3072 TB");
    }

    #[test]
    fn guesses_content_type() {
        assert_eq!(content_type_for("a.png").as_deref(), Some("image/png"));
        assert_eq!(content_type_for("noext"), None);
    }
}
