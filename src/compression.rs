use std::io::{self, BufReader, Read, Write};

use crate::patch_format::{CompressionAlgorithm, CompressionSettings};

/// Writer for the patch body, compressed according to the patch header.
pub enum CompressedWriter<W: Write> {
    Plain(W),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> CompressedWriter<W> {
    pub fn new(inner: W, settings: &CompressionSettings) -> io::Result<Self> {
        Ok(match settings.algorithm {
            CompressionAlgorithm::None => CompressedWriter::Plain(inner),
            CompressionAlgorithm::Zstd => {
                CompressedWriter::Zstd(zstd::Encoder::new(inner, settings.quality)?)
            }
        })
    }

    /// Flush the compressed frame and hand back the underlying writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressedWriter::Plain(w) => Ok(w),
            CompressedWriter::Zstd(enc) => enc.finish(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressedWriter::Plain(w) => w.write(buf),
            CompressedWriter::Zstd(enc) => enc.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressedWriter::Plain(w) => w.flush(),
            CompressedWriter::Zstd(enc) => enc.flush(),
        }
    }
}

/// Reader for the patch body, the counterpart of [`CompressedWriter`].
pub enum DecompressedReader<R: Read> {
    Plain(R),
    Zstd(zstd::Decoder<'static, BufReader<R>>),
}

impl<R: Read> DecompressedReader<R> {
    pub fn new(inner: R, settings: &CompressionSettings) -> io::Result<Self> {
        Ok(match settings.algorithm {
            CompressionAlgorithm::None => DecompressedReader::Plain(inner),
            CompressionAlgorithm::Zstd => DecompressedReader::Zstd(zstd::Decoder::new(inner)?),
        })
    }
}

impl<R: Read> Read for DecompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressedReader::Plain(r) => r.read(buf),
            DecompressedReader::Zstd(dec) => dec.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(settings: CompressionSettings) {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 13) as u8).collect();
        let mut w = CompressedWriter::new(Vec::new(), &settings).unwrap();
        w.write_all(&payload).unwrap();
        let encoded = w.finish().unwrap();

        let mut r = DecompressedReader::new(&encoded[..], &settings).unwrap();
        let mut decoded = Vec::new();
        r.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_plain() {
        roundtrip(CompressionSettings {
            algorithm: CompressionAlgorithm::None,
            quality: 0,
        });
    }

    #[test]
    fn test_zstd_shrinks() {
        let settings = CompressionSettings::default();
        roundtrip(settings);

        let mut w = CompressedWriter::new(Vec::new(), &settings).unwrap();
        w.write_all(&[7u8; 100_000]).unwrap();
        assert!(w.finish().unwrap().len() < 1_000);
    }
}
