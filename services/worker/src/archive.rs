use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// JPEG quality used for archive entries unless configured otherwise
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to encode frame {index}: {source}")]
    Encode {
        index: usize,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to write archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Finished archive held in memory.
///
/// Readable and seekable like a file; [`ArchiveBlob::len`] reports the total
/// size without touching the read position.
#[derive(Debug, Clone)]
pub struct ArchiveBlob {
    cursor: Cursor<Bytes>,
}

impl ArchiveBlob {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            cursor: Cursor::new(data.into()),
        }
    }

    pub fn len(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.get_ref().is_empty()
    }

    /// Current read position
    pub fn position(&self) -> u64 {
        self.cursor.position()
    }

    /// Whole archive contents, independent of the read position
    pub fn bytes(&self) -> Bytes {
        self.cursor.get_ref().clone()
    }
}

impl Read for ArchiveBlob {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for ArchiveBlob {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

/// Pack frames into a ZIP archive, one `image_<index>.jpg` entry per frame.
///
/// Fails on the first frame that cannot be encoded; no partial archive is
/// returned.
pub fn build_archive(frames: &[DynamicImage], jpeg_quality: u8) -> Result<ArchiveBlob, ArchiveError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (index, frame) in frames.iter().enumerate() {
        zip.start_file(format!("image_{index}.jpg"), options)?;
        encode_jpeg(&mut zip, frame, jpeg_quality)
            .map_err(|source| ArchiveError::Encode { index, source })?;
    }

    let cursor = zip.finish()?;
    Ok(ArchiveBlob::new(cursor.into_inner()))
}

fn encode_jpeg<W: Write>(writer: &mut W, frame: &DynamicImage, quality: u8) -> image::ImageResult<()> {
    JpegEncoder::new_with_quality(writer, quality).encode_image(&frame.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use zip::ZipArchive;

    fn frame(shade: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 8, Rgb([shade, 64, 255 - shade])))
    }

    #[test]
    fn test_archive_contains_one_decodable_entry_per_frame() {
        let frames = vec![frame(10), frame(120), frame(240)];
        let blob = build_archive(&frames, DEFAULT_JPEG_QUALITY).unwrap();
        assert!(!blob.is_empty());

        let mut archive = ZipArchive::new(blob).unwrap();
        assert_eq!(archive.len(), 3);

        for i in 0..3 {
            let mut entry = archive.by_name(&format!("image_{i}.jpg")).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();

            let decoded = image::load_from_memory_with_format(&data, image::ImageFormat::Jpeg).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (16, 8));
        }
    }

    #[test]
    fn test_empty_frame_list_builds_empty_archive() {
        let blob = build_archive(&[], DEFAULT_JPEG_QUALITY).unwrap();
        let archive = ZipArchive::new(blob).unwrap();
        assert_eq!(archive.len(), 0);
    }

    #[test]
    fn test_len_does_not_move_position() {
        let mut blob = ArchiveBlob::new(vec![1u8, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        blob.read_exact(&mut buf).unwrap();

        assert_eq!(blob.len(), 5);
        assert_eq!(blob.position(), 2);

        blob.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [3, 4]);
    }

    #[test]
    fn test_seek_and_read() {
        let mut blob = ArchiveBlob::new(b"abcdefgh".to_vec());

        assert_eq!(blob.seek(SeekFrom::End(-3)).unwrap(), 5);
        let mut tail = String::new();
        blob.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "fgh");

        assert_eq!(blob.seek(SeekFrom::Start(1)).unwrap(), 1);
        assert_eq!(blob.seek(SeekFrom::Current(2)).unwrap(), 3);
        let mut one = [0u8; 1];
        blob.read_exact(&mut one).unwrap();
        assert_eq!(&one, b"d");

        tokio_test::assert_err!(blob.seek(SeekFrom::Current(-10)));
        assert_eq!(blob.position(), 4);

        blob.seek(SeekFrom::Start(100)).unwrap();
        assert_eq!(blob.read(&mut one).unwrap(), 0);
    }
}
