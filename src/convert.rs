use crate::config::ConversionConfig;
use crate::{EngineError, Result};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

const SUPPORTED_IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Pdf,
    Cbz,
}

impl ArchiveFormat {
    /// Accepts `pdf`/`cbz` case-insensitively; anything else is rejected
    /// before any filesystem work happens.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "cbz" => Ok(Self::Cbz),
            other => Err(EngineError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Cbz => "cbz",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub input_files_count: usize,
    pub error_message: Option<String>,
}

impl ConversionResult {
    fn completed(output_path: PathBuf, input_files_count: usize) -> Self {
        Self {
            success: true,
            output_path: Some(output_path),
            input_files_count,
            error_message: None,
        }
    }

    fn failed(input_files_count: usize, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output_path: None,
            input_files_count,
            error_message: Some(message.into()),
        }
    }
}

/// Packs a directory of downloaded images into a single PDF or CBZ.
#[derive(Debug, Clone)]
pub struct GalleryConverter {
    config: ConversionConfig,
}

struct PdfPageImage {
    width: u32,
    height: u32,
    jpeg: Vec<u8>,
}

impl GalleryConverter {
    pub fn new(config: ConversionConfig) -> Self {
        Self { config }
    }

    /// Supported images in `dir`, natural-sorted so `img2` precedes `img10`.
    pub fn list_images(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let supported = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| SUPPORTED_IMAGE_EXTS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if supported {
                files.push(path);
            }
        }

        files.sort_by_key(|path| {
            natural_sort_key(&path.file_name().unwrap_or_default().to_string_lossy())
        });
        Ok(files)
    }

    /// Subdirectories of `base_dir` that contain at least one supported image.
    pub fn find_gallery_dirs(&self, base_dir: &Path) -> Result<Vec<PathBuf>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && !self.list_images(&path)?.is_empty() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    pub fn convert(
        &self,
        source_dir: &Path,
        format: ArchiveFormat,
        output_path: Option<&Path>,
        delete_source: bool,
        quality: Option<u8>,
    ) -> ConversionResult {
        self.convert_with_log(source_dir, format, output_path, delete_source, quality, |_| {})
    }

    /// Like `convert`, with a sink for skipped-image warnings.
    pub fn convert_with_log<F>(
        &self,
        source_dir: &Path,
        format: ArchiveFormat,
        output_path: Option<&Path>,
        delete_source: bool,
        quality: Option<u8>,
        mut warn: F,
    ) -> ConversionResult
    where
        F: FnMut(&str),
    {
        match format {
            ArchiveFormat::Pdf => {
                self.convert_to_pdf(source_dir, output_path, delete_source, quality, &mut warn)
            }
            ArchiveFormat::Cbz => {
                self.convert_to_cbz(source_dir, output_path, delete_source, quality, &mut warn)
            }
        }
    }

    /// Converts every gallery directory under `base_dir`; per-directory
    /// outcomes are independent.
    pub fn convert_all(
        &self,
        base_dir: &Path,
        format: ArchiveFormat,
        delete_source: bool,
    ) -> Result<Vec<(PathBuf, ConversionResult)>> {
        let mut outcomes = Vec::new();
        for dir in self.find_gallery_dirs(base_dir)? {
            let result = self.convert(&dir, format, None, delete_source, None);
            outcomes.push((dir, result));
        }
        Ok(outcomes)
    }

    fn convert_to_pdf(
        &self,
        source_dir: &Path,
        output_path: Option<&Path>,
        delete_source: bool,
        quality: Option<u8>,
        warn: &mut dyn FnMut(&str),
    ) -> ConversionResult {
        let image_files = match self.list_images(source_dir) {
            Ok(files) => files,
            Err(e) => return ConversionResult::failed(0, format!("failed to list images: {e}")),
        };
        if image_files.is_empty() {
            return ConversionResult::failed(0, "no image files found in directory");
        }

        let output_path = resolve_output_path(source_dir, output_path, "pdf");
        let quality = quality.unwrap_or(self.config.pdf_quality).clamp(1, 100);

        let mut pages = Vec::new();
        for path in &image_files {
            match self.encode_pdf_page(path, quality) {
                Ok(page) => pages.push(page),
                Err(e) => warn(&format!(
                    "skipping {}: {e}",
                    path.file_name().unwrap_or_default().to_string_lossy()
                )),
            }
        }
        if pages.is_empty() {
            return ConversionResult::failed(image_files.len(), "no images could be processed");
        }

        if let Err(e) = write_pdf(&output_path, &pages) {
            return ConversionResult::failed(
                image_files.len(),
                format!("failed to write {}: {e}", output_path.to_string_lossy()),
            );
        }

        if delete_source {
            self.delete_source_files(source_dir, &image_files, warn);
        }
        ConversionResult::completed(output_path, image_files.len())
    }

    /// Decodes one source image into an RGB JPEG page, downscaling to the
    /// configured width cap.
    fn encode_pdf_page(&self, path: &Path, quality: u8) -> Result<PdfPageImage> {
        let decoded = image::open(path)?;
        let mut rgb = decoded.to_rgb8();

        let max_width = self.config.max_image_width.max(1);
        if rgb.width() > max_width {
            let ratio = f64::from(max_width) / f64::from(rgb.width());
            let new_height = ((f64::from(rgb.height()) * ratio).round() as u32).max(1);
            rgb = image::imageops::resize(
                &rgb,
                max_width,
                new_height,
                image::imageops::FilterType::Lanczos3,
            );
        }

        let mut jpeg = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality);
        encoder.encode_image(&rgb)?;
        Ok(PdfPageImage {
            width: rgb.width(),
            height: rgb.height(),
            jpeg,
        })
    }

    fn convert_to_cbz(
        &self,
        source_dir: &Path,
        output_path: Option<&Path>,
        delete_source: bool,
        quality: Option<u8>,
        warn: &mut dyn FnMut(&str),
    ) -> ConversionResult {
        let image_files = match self.list_images(source_dir) {
            Ok(files) => files,
            Err(e) => return ConversionResult::failed(0, format!("failed to list images: {e}")),
        };
        if image_files.is_empty() {
            return ConversionResult::failed(0, "no image files found in directory");
        }

        let output_path = resolve_output_path(source_dir, output_path, "cbz");
        let quality = quality.unwrap_or(self.config.cbz_quality).clamp(1, 100);
        let compression = self.config.cbz_compression.min(9) as i32;

        let file = match std::fs::File::create(&output_path) {
            Ok(f) => f,
            Err(e) => {
                return ConversionResult::failed(
                    image_files.len(),
                    format!("failed to create {}: {e}", output_path.to_string_lossy()),
                )
            }
        };
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .compression_level(Some(compression));

        let mut written = 0usize;
        for (index, path) in image_files.iter().enumerate() {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_default();

            // Re-encode failures fall back to the raw bytes.
            let reencoded = if self.config.optimize_cbz_images {
                self.reencode_for_cbz(path, &ext, quality).unwrap_or(None)
            } else {
                None
            };

            let (entry_name, bytes) = match reencoded {
                Some(jpeg) => (format!("{:03}.jpg", index + 1), jpeg),
                None => match std::fs::read(path) {
                    Ok(raw) => (format!("{:03}.{ext}", index + 1), raw),
                    Err(e) => {
                        warn(&format!(
                            "skipping {}: {e}",
                            path.file_name().unwrap_or_default().to_string_lossy()
                        ));
                        continue;
                    }
                },
            };

            let entry = zip
                .start_file(entry_name.as_str(), options)
                .map_err(zip_err_to_io)
                .and_then(|_| zip.write_all(&bytes));
            if let Err(e) = entry {
                warn(&format!("skipping {entry_name}: {e}"));
                continue;
            }
            written += 1;
        }

        if written == 0 {
            let _ = std::fs::remove_file(&output_path);
            return ConversionResult::failed(image_files.len(), "no images could be processed");
        }
        if let Err(e) = zip.finish() {
            return ConversionResult::failed(
                image_files.len(),
                format!("failed to finalize {}: {e}", output_path.to_string_lossy()),
            );
        }

        if delete_source {
            self.delete_source_files(source_dir, &image_files, warn);
        }
        ConversionResult::completed(output_path, image_files.len())
    }

    /// JPEG replacement bytes for an archive entry, or None when the source
    /// is already JPEG and narrow enough to keep as-is.
    fn reencode_for_cbz(&self, path: &Path, ext: &str, quality: u8) -> Result<Option<Vec<u8>>> {
        let max_width = self.config.max_cbz_width.max(1);
        if ext == "jpg" || ext == "jpeg" {
            let (width, _) = image::image_dimensions(path)?;
            if width <= max_width {
                return Ok(None);
            }
        }

        let decoded = image::open(path)?;
        let mut rgb = decoded.to_rgb8();
        if rgb.width() > max_width {
            let ratio = f64::from(max_width) / f64::from(rgb.width());
            let new_height = ((f64::from(rgb.height()) * ratio).round() as u32).max(1);
            rgb = image::imageops::resize(
                &rgb,
                max_width,
                new_height,
                image::imageops::FilterType::Lanczos3,
            );
        }

        let mut jpeg = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, quality);
        encoder.encode_image(&rgb)?;
        Ok(Some(jpeg))
    }

    /// Removes the consumed images; the directory itself goes only when it
    /// ended up empty (the archive often lives inside it).
    fn delete_source_files(
        &self,
        source_dir: &Path,
        image_files: &[PathBuf],
        warn: &mut dyn FnMut(&str),
    ) {
        for path in image_files {
            if let Err(e) = std::fs::remove_file(path) {
                warn(&format!("failed to delete {}: {e}", path.to_string_lossy()));
            }
        }

        match std::fs::read_dir(source_dir) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    if let Err(e) = std::fs::remove_dir(source_dir) {
                        warn(&format!(
                            "failed to remove {}: {e}",
                            source_dir.to_string_lossy()
                        ));
                    }
                }
            }
            Err(e) => warn(&format!(
                "failed to inspect {}: {e}",
                source_dir.to_string_lossy()
            )),
        }
    }
}

fn resolve_output_path(source_dir: &Path, output_path: Option<&Path>, ext: &str) -> PathBuf {
    match output_path {
        Some(path) => path.to_path_buf(),
        None => {
            let name = source_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "gallery".to_string());
            source_dir.join(format!("{name}.{ext}"))
        }
    }
}

fn write_pdf(output_path: &Path, pages: &[PdfPageImage]) -> Result<()> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut kids: Vec<Object> = Vec::new();
    for page in pages {
        let width = i64::from(page.width);
        let height = i64::from(page.height);

        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width,
                "Height" => height,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8i64,
                "Filter" => "DCTDecode",
            },
            page.jpeg.clone(),
        ));
        let resources_id = doc.add_object(dictionary! {
            "XObject" => dictionary! { "Im0" => image_id },
        });

        // Scale the unit image square to the page, then draw it.
        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        width.into(),
                        0i64.into(),
                        0i64.into(),
                        height.into(),
                        0i64.into(),
                        0i64.into(),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let encoded = content
            .encode()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0i64.into(), 0i64.into(), width.into(), height.into()],
            "Contents" => content_id,
            "Resources" => resources_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();
    doc.save(output_path)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    Ok(())
}

fn zip_err_to_io(err: zip::result::ZipError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, err)
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SortPiece {
    Text(String),
    Number(u128),
}

/// Splits a filename into alternating text and digit runs, always starting
/// with a (possibly empty) text run so keys of equal length compare piecewise
/// against the same run kind.
fn natural_sort_key(name: &str) -> Vec<SortPiece> {
    let mut pieces: Vec<SortPiece> = Vec::new();
    for c in name.chars() {
        if c.is_ascii_digit() {
            let digit = u128::from(c as u8 - b'0');
            match pieces.last_mut() {
                Some(SortPiece::Number(n)) => {
                    *n = n.saturating_mul(10).saturating_add(digit);
                }
                _ => {
                    if pieces.is_empty() {
                        pieces.push(SortPiece::Text(String::new()));
                    }
                    pieces.push(SortPiece::Number(digit));
                }
            }
        } else {
            match pieces.last_mut() {
                Some(SortPiece::Text(text)) => text.extend(c.to_lowercase()),
                _ => {
                    let mut text = String::new();
                    text.extend(c.to_lowercase());
                    pieces.push(SortPiece::Text(text));
                }
            }
        }
    }
    pieces
}
