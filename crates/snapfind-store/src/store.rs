//! Directory-backed image store.
//!
//! Files are written once under a generated name and never rewritten. The
//! directory is shared without locking; concurrent list/delete from several
//! clients may race.

use crate::name::StoredName;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use snapfind_core::Caption;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Extensions recognised as stored images (compared ASCII case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cannot create store directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("cannot list {path}: {source}")]
    ListFailed { path: PathBuf, source: io::Error },
    #[error("write failed for {path}: {source}")]
    WriteFailed { path: PathBuf, source: io::Error },
    #[error("encode failed for {path}: {source}")]
    Encode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("read failed for {path}: {source}")]
    ReadFailed { path: PathBuf, source: io::Error },
    #[error("delete failed for {path}: {source}")]
    DeleteFailed { path: PathBuf, source: io::Error },
    #[error("image not found: {0}")]
    NotFound(String),
    #[error("invalid image name: {0:?}")]
    InvalidName(String),
}

/// One image file in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub path: PathBuf,
    pub file_name: String,
    /// Embedded UUID, when the filename follows the store's naming scheme.
    pub id: Option<Uuid>,
    /// Caption recovered from the filename, when it follows the naming scheme.
    pub caption: Option<String>,
}

impl StoredImage {
    pub(crate) fn from_path(path: PathBuf, file_name: String) -> Self {
        let parsed = StoredName::parse(&file_name);
        Self {
            path,
            id: parsed.as_ref().map(|n| n.id),
            caption: parsed.as_ref().map(StoredName::caption),
            file_name,
        }
    }

    /// Filename without its extension; the text keyword search matches against.
    pub fn stem(&self) -> &str {
        self.file_name
            .rsplit_once('.')
            .map_or(self.file_name.as_str(), |(stem, _)| stem)
    }
}

/// A single directory of captioned images.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open the store at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `image` under a fresh `{uuid}_{caption}.jpg` name.
    ///
    /// The image is converted to 8-bit RGB (dropping alpha) and encoded as
    /// JPEG. The file is created with create-new semantics, so an existing
    /// file is never overwritten.
    pub fn save(&self, image: &DynamicImage, caption: &Caption) -> Result<StoredImage, StoreError> {
        let name = StoredName::generate(caption);
        let file_name = name.file_name();
        let path = self.dir.join(&file_name);

        let rgb = image.to_rgb8();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| StoreError::WriteFailed {
                path: path.clone(),
                source,
            })?;

        write_jpeg(&path, &rgb, file)?;

        tracing::info!(path = %path.display(), caption = %caption, "saved image");

        Ok(StoredImage {
            path,
            file_name,
            id: Some(name.id),
            caption: Some(name.caption()),
        })
    }

    /// All files with a recognised image extension, sorted by filename.
    pub fn list(&self) -> Result<Vec<StoredImage>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StoreError::ListFailed {
            path: self.dir.clone(),
            source,
        })?;

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::ListFailed {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(str::to_owned) else {
                tracing::debug!(path = %path.display(), "skipping non-UTF-8 filename");
                continue;
            };
            if has_image_extension(&file_name) {
                images.push(StoredImage::from_path(path, file_name));
            }
        }

        images.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(images)
    }

    /// Map a client-supplied filename to a path inside the store.
    ///
    /// Rejects anything that is not a single image filename, so a request can
    /// never reach outside the store directory.
    pub fn resolve(&self, file_name: &str) -> Result<PathBuf, StoreError> {
        let is_plain = !file_name.is_empty()
            && !file_name.starts_with('.')
            && !file_name.contains(['/', '\\', '\0'])
            && Path::new(file_name).file_name().and_then(|n| n.to_str()) == Some(file_name);

        if !is_plain || !has_image_extension(file_name) {
            return Err(StoreError::InvalidName(file_name.to_string()));
        }
        Ok(self.dir.join(file_name))
    }

    /// Raw bytes of a stored image.
    pub fn read(&self, file_name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(file_name)?;
        fs::read(&path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(file_name.to_string()),
            _ => StoreError::ReadFailed { path, source },
        })
    }

    /// Delete a stored image.
    ///
    /// Returns `Ok(true)` when a file was removed and `Ok(false)` when it was
    /// already gone; deleting a missing file is not an error.
    pub fn delete(&self, file_name: &str) -> Result<bool, StoreError> {
        let path = self.resolve(file_name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "deleted image");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "delete: image already gone");
                Ok(false)
            }
            Err(source) => Err(StoreError::DeleteFailed { path, source }),
        }
    }
}

/// Encode `rgb` into `sink`. On any failure the partial file at `path` is removed.
fn write_jpeg<W: Write>(path: &Path, rgb: &RgbImage, sink: W) -> Result<(), StoreError> {
    let mut writer = BufWriter::new(sink);
    let encoded = rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY));
    let result = match encoded {
        Ok(()) => writer.flush().map_err(|source| StoreError::WriteFailed {
            path: path.to_path_buf(),
            source,
        }),
        Err(source) => Err(StoreError::Encode {
            path: path.to_path_buf(),
            source,
        }),
    };

    if result.is_err() {
        drop(writer);
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove partial image");
        }
    }
    result
}

/// Whether `file_name` ends in one of [`IMAGE_EXTENSIONS`], ignoring ASCII case.
pub fn has_image_extension(file_name: &str) -> bool {
    file_name
        .rsplit_once('.')
        .is_some_and(|(_, ext)| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::collections::HashSet;

    fn rgba_image() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(16, 12, Rgba([200, 10, 10, 128])))
    }

    fn open_temp() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("uploaded_images")).unwrap();
        (dir, store)
    }

    /// Accepts every write, then fails to flush.
    struct FlushFails;

    impl Write for FlushFails {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    #[test]
    fn test_failed_flush_removes_partial_file() {
        let (_dir, store) = open_temp();
        let path = store.dir().join("partial.jpg");
        fs::write(&path, b"").unwrap();

        let err = write_jpeg(&path, &rgba_image().to_rgb8(), FlushFails).unwrap_err();

        assert!(matches!(err, StoreError::WriteFailed { .. }));
        assert!(!path.exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_has_image_extension() {
        assert!(has_image_extension("a.jpg"));
        assert!(has_image_extension("b.JPEG"));
        assert!(has_image_extension("c.Png"));
        assert!(!has_image_extension("d.gif"));
        assert!(!has_image_extension("png"));
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, store) = open_temp();
        assert!(store.dir().is_dir());
    }

    #[test]
    fn test_save_writes_named_rgb_jpeg() {
        let (_dir, store) = open_temp();
        let saved = store.save(&rgba_image(), &Caption::new("a red square")).unwrap();

        assert!(saved.path.exists());
        assert!(saved.file_name.ends_with("_a_red_square.jpg"));
        assert_eq!(saved.file_name.find('_'), Some(36));
        assert_eq!(saved.caption.as_deref(), Some("a red square"));

        let reloaded = image::open(&saved.path).unwrap();
        assert_eq!(reloaded.color(), image::ColorType::Rgb8);
        assert_eq!((reloaded.width(), reloaded.height()), (16, 12));
    }

    #[test]
    fn test_save_never_collides() {
        let (_dir, store) = open_temp();
        let caption = Caption::new("same");
        let names: HashSet<String> = (0..10)
            .map(|_| store.save(&rgba_image(), &caption).unwrap().file_name)
            .collect();
        assert_eq!(names.len(), 10);
        assert_eq!(store.list().unwrap().len(), 10);
    }

    #[test]
    fn test_save_empty_caption_gets_placeholder_segment() {
        let (_dir, store) = open_temp();
        let saved = store.save(&rgba_image(), &Caption::new("")).unwrap();
        assert!(saved.file_name.ends_with("_untitled.jpg"));
    }

    #[test]
    fn test_list_filters_extensions_and_sorts() {
        let (_dir, store) = open_temp();
        for name in ["b.PNG", "a.jpg", "c.jpeg", "notes.txt", "archive.jpg.zip"] {
            fs::write(store.dir().join(name), b"x").unwrap();
        }
        fs::create_dir(store.dir().join("sub.jpg")).unwrap();

        let names: Vec<String> = store.list().unwrap().into_iter().map(|i| i.file_name).collect();
        assert_eq!(names, ["a.jpg", "b.PNG", "c.jpeg"]);
    }

    #[test]
    fn test_list_parses_embedded_metadata() {
        let (_dir, store) = open_temp();
        let saved = store.save(&rgba_image(), &Caption::new("a cat")).unwrap();
        fs::write(store.dir().join("holiday.png"), b"x").unwrap();

        let listed = store.list().unwrap();
        let ours = listed.iter().find(|i| i.file_name == saved.file_name).unwrap();
        assert_eq!(ours.id, saved.id);
        let other = listed.iter().find(|i| i.file_name == "holiday.png").unwrap();
        assert_eq!(other.id, None);
        assert_eq!(other.caption, None);
        assert_eq!(other.stem(), "holiday");
    }

    #[test]
    fn test_delete_one_of_three() {
        let (_dir, store) = open_temp();
        let saved: Vec<StoredImage> = ["one", "two", "three"]
            .iter()
            .map(|c| store.save(&rgba_image(), &Caption::new(c)).unwrap())
            .collect();

        assert!(store.delete(&saved[1].file_name).unwrap());

        let remaining = store.list().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|i| i.path != saved[1].path));
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let (_dir, store) = open_temp();
        let saved = store.save(&rgba_image(), &Caption::new("gone")).unwrap();
        assert!(store.delete(&saved.file_name).unwrap());
        assert!(!store.delete(&saved.file_name).unwrap());
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let (_dir, store) = open_temp();
        for bad in ["", "../x.jpg", "a/b.jpg", "a\\b.jpg", ".hidden.jpg", "notes.txt", ".."] {
            assert!(
                matches!(store.resolve(bad), Err(StoreError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
        assert_eq!(store.resolve("ok.jpg").unwrap(), store.dir().join("ok.jpg"));
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let (_dir, store) = open_temp();
        assert!(matches!(store.read("absent.jpg"), Err(StoreError::NotFound(_))));
    }
}
