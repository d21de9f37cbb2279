//! Binary index file
//!
//! Layout, all little-endian:
//!
//! ```text
//! dimension: u32
//! count:     u64
//! metric:    u32   (0 = inner product, 1 = L2)
//! values:    count * dimension f32, row-major
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::{FlatIndex, Metric};
use crate::error::{PriorArtError, Result};

const HEADER_LEN: u64 = 4 + 8 + 4;

/// Values decoded per read; bounds the scratch buffer whatever the header says
const CHUNK_VALUES: usize = 256 * 1024;

impl Metric {
    fn tag(self) -> u32 {
        match self {
            Metric::InnerProduct => 0,
            Metric::L2 => 1,
        }
    }

    fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Metric::InnerProduct),
            1 => Ok(Metric::L2),
            other => Err(PriorArtError::IndexFormat(format!(
                "unknown metric tag {}",
                other
            ))),
        }
    }
}

impl FlatIndex {
    /// Write the index to `path`, replacing any existing file
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        tracing::info!(
            "Saved index with {} vectors to {}",
            self.len(),
            path.display()
        );
        Ok(())
    }

    /// Read an index written by `save`
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let index = Self::read_from(&mut reader, Some(file_len))?;
        tracing::info!(
            "Loaded index from {}: {} vectors, {} dimensions, {:?}",
            path.display(),
            index.len(),
            index.dimension(),
            index.metric()
        );
        Ok(index)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let dimension = u32::try_from(self.dimension).map_err(|_| {
            PriorArtError::IndexFormat(format!("dimension {} exceeds u32", self.dimension))
        })?;
        writer.write_all(&dimension.to_le_bytes())?;
        writer.write_all(&(self.len() as u64).to_le_bytes())?;
        writer.write_all(&self.metric.tag().to_le_bytes())?;
        for value in &self.data {
            writer.write_all(&value.to_le_bytes())?;
        }
        Ok(())
    }

    /// Decode an index; `total_len`, when known, must match the header exactly
    pub fn read_from<R: Read>(reader: &mut R, total_len: Option<u64>) -> Result<Self> {
        let mut u32_buf = [0u8; 4];
        let mut u64_buf = [0u8; 8];

        read_header_field(reader, &mut u32_buf)?;
        let dimension = u32::from_le_bytes(u32_buf) as usize;
        read_header_field(reader, &mut u64_buf)?;
        let count = u64::from_le_bytes(u64_buf);
        read_header_field(reader, &mut u32_buf)?;
        let metric = Metric::from_tag(u32::from_le_bytes(u32_buf))?;

        if dimension == 0 {
            return Err(PriorArtError::IndexFormat("dimension is zero".to_string()));
        }

        let payload_len = count
            .checked_mul(dimension as u64)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| PriorArtError::IndexFormat("header sizes overflow".to_string()))?;
        if let Some(total_len) = total_len {
            if total_len != HEADER_LEN + payload_len {
                return Err(PriorArtError::IndexFormat(format!(
                    "file is {} bytes, header describes {}",
                    total_len,
                    HEADER_LEN + payload_len
                )));
            }
        }

        let values = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(dimension))
            .ok_or_else(|| PriorArtError::IndexFormat("index too large".to_string()))?;
        // Without a known file length the header is unverified, so capacity
        // grows with the data actually read
        let mut data = Vec::with_capacity(if total_len.is_some() {
            values
        } else {
            values.min(CHUNK_VALUES)
        });
        let mut chunk = vec![0u8; values.min(CHUNK_VALUES) * 4];
        while data.len() < values {
            let take = (values - data.len()).min(CHUNK_VALUES);
            let bytes = &mut chunk[..take * 4];
            reader.read_exact(bytes).map_err(|e| {
                PriorArtError::IndexFormat(format!("truncated vector data: {}", e))
            })?;
            data.extend(
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            );
        }

        Self::from_flat(dimension, metric, data)
    }
}

fn read_header_field<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader
        .read_exact(buf)
        .map_err(|e| PriorArtError::IndexFormat(format!("truncated header: {}", e)))
}
