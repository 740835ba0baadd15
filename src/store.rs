//! .rvx vector file format and memory-mapped reader
//!
//! # File Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "REELVX01"
//! 0x08     4       u32 LE      N: Number of rows
//! 0x0C     4       u32 LE      D: Dimensions
//! 0x10     N*D*4   [f32]       Row data (Little Endian)
//! ```
//!
//! The writer streams rows behind a `BufWriter` and patches the row
//! count into the header on `finish()`, ending with `sync_all` so the
//! file is durable before the caller publishes it. The reader maps the
//! file and hands out alignment-checked `&[f32]` row slices via
//! `bytemuck`, so a corrupt or truncated file is an error rather than
//! undefined behavior.

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::similarity;

/// Magic bytes identifying an .rvx file.
pub const MAGIC: [u8; 8] = *b"REELVX01";

/// Header size: 8 (magic) + 4 (count) + 4 (dim).
pub const HEADER_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid magic bytes: not an .rvx file")]
    InvalidMagic,

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("row {index} out of bounds ({count} rows)")]
    RowOutOfBounds { index: usize, count: usize },

    #[error("file truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("row data not aligned to f32")]
    Misaligned,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

fn parse_header(bytes: &[u8]) -> Result<(usize, usize), StoreError> {
    if bytes.len() < HEADER_SIZE {
        return Err(StoreError::Truncated {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    if bytes[0..8] != MAGIC {
        return Err(StoreError::InvalidMagic);
    }
    let count = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
    let dim = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    Ok((count, dim))
}

/// Streaming writer for .rvx files.
pub struct RvxWriter {
    writer: BufWriter<File>,
    dim: usize,
    count: u32,
}

impl RvxWriter {
    /// Create the file and reserve the header. The row count in the
    /// header stays zero until `finish()`.
    pub fn create<P: AsRef<Path>>(path: P, dim: usize) -> Result<Self, StoreError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut header = [0u8; HEADER_SIZE];
        header[0..8].copy_from_slice(&MAGIC);
        header[12..16].copy_from_slice(&(dim as u32).to_le_bytes());
        writer.write_all(&header)?;

        Ok(Self {
            writer,
            dim,
            count: 0,
        })
    }

    /// Append one row.
    pub fn write_row(&mut self, row: &[f32]) -> Result<(), StoreError> {
        if row.len() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                actual: row.len(),
            });
        }
        for &val in row {
            self.writer.write_all(&val.to_le_bytes())?;
        }
        self.count += 1;
        Ok(())
    }

    /// Patch the final row count into the header and fsync. Returns
    /// the number of rows written.
    pub fn finish(mut self) -> Result<u32, StoreError> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(8))?;
        file.write_all(&self.count.to_le_bytes())?;
        file.sync_all()?;
        Ok(self.count)
    }
}

/// Memory-mapped, read-only view of an .rvx file.
///
/// Row norms are computed once at open so the query path pays a single
/// dot product per row.
pub struct VectorStore {
    mmap: Mmap,
    count: usize,
    dim: usize,
    norms: Vec<f32>,
}

impl VectorStore {
    /// Map an .rvx file. Fails on bad magic, truncation, or rows that
    /// don't cast cleanly to `&[f32]`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        // Safety: the file is treated as immutable once published; the
        // ingestion path never rewrites a generation in place.
        let mmap = unsafe { Mmap::map(&file)? };

        let (count, dim) = parse_header(&mmap)?;
        let expected = HEADER_SIZE + count * dim * std::mem::size_of::<f32>();
        if mmap.len() < expected {
            return Err(StoreError::Truncated {
                expected,
                actual: mmap.len(),
            });
        }

        let mut store = Self {
            mmap,
            count,
            dim,
            norms: Vec::new(),
        };
        let mut norms = Vec::with_capacity(count);
        for slot in 0..count {
            norms.push(similarity::norm(store.row_unchecked(slot)?));
        }
        store.norms = norms;
        Ok(store)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Precomputed L2 norm of a row.
    pub fn norm(&self, slot: usize) -> f32 {
        self.norms[slot]
    }

    /// Borrow a row directly out of the mapping.
    pub fn row(&self, slot: usize) -> Result<&[f32], StoreError> {
        if slot >= self.count {
            return Err(StoreError::RowOutOfBounds {
                index: slot,
                count: self.count,
            });
        }
        self.row_unchecked(slot)
    }

    fn row_unchecked(&self, slot: usize) -> Result<&[f32], StoreError> {
        let row_bytes = self.dim * std::mem::size_of::<f32>();
        let start = HEADER_SIZE + slot * row_bytes;
        let bytes = &self.mmap[start..start + row_bytes];
        bytemuck::try_cast_slice(bytes).map_err(|_| StoreError::Misaligned)
    }

    /// Total bytes mapped.
    pub fn mapped_bytes(&self) -> usize {
        self.mmap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_rvx(path: &Path, rows: &[Vec<f32>]) {
        let dim = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut writer = RvxWriter::create(path, dim).unwrap();
        for row in rows {
            writer.write_row(row).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.rvx");
        write_rvx(
            &path,
            &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0], vec![0.0, 0.0, 0.0]],
        );

        let store = VectorStore::open(&path).unwrap();
        assert_eq!(store.count(), 3);
        assert_eq!(store.dim(), 3);
        assert_eq!(store.row(0).unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(store.row(2).unwrap(), &[0.0, 0.0, 0.0]);
        assert_eq!(store.norm(2), 0.0);
    }

    #[test]
    fn empty_store_is_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.rvx");
        let writer = RvxWriter::create(&path, 4).unwrap();
        assert_eq!(writer.finish().unwrap(), 0);

        let store = VectorStore::open(&path).unwrap();
        assert_eq!(store.count(), 0);
        assert_eq!(store.dim(), 4);
    }

    #[test]
    fn writer_rejects_wrong_dimension() {
        let dir = tempdir().unwrap();
        let mut writer = RvxWriter::create(dir.path().join("bad.rvx"), 4).unwrap();
        let err = writer.write_row(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { expected: 4, actual: 2 }));
    }

    #[test]
    fn row_out_of_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors.rvx");
        write_rvx(&path, &[vec![1.0, 2.0]]);

        let store = VectorStore::open(&path).unwrap();
        assert!(matches!(
            store.row(5),
            Err(StoreError::RowOutOfBounds { index: 5, count: 1 })
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.rvx");
        std::fs::write(&path, b"NOTANRVXFILE0000").unwrap();
        assert!(matches!(VectorStore::open(&path), Err(StoreError::InvalidMagic)));
    }

    #[test]
    fn rejects_truncated_body() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trunc.rvx");
        write_rvx(&path, &[vec![1.0, 2.0], vec![3.0, 4.0]]);

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(matches!(VectorStore::open(&path), Err(StoreError::Truncated { .. })));
    }
}
