//! Binary tensor format.
//!
//! A tensor is stored as its shape followed by its values, all little-endian:
//!
//! ```text
//! i32 width | i32 height | i32 depth | i32 batch | i32 count | count × f32
//! ```
//!
//! `count` must equal `width · height · depth · batch`. Decoding validates the
//! header before reading any values, so a corrupt length never drives a huge
//! allocation.

use super::Tensor;
use crate::error::{Error, Result};
use crate::shape::Shape;
use briny::prelude::*;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Decoded header of a serialized tensor.
struct PackedHeader {
    shape: Shape,
    count: i32,
}

impl Validate for PackedHeader {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        match usize::try_from(self.count) {
            Ok(count) if count == self.shape.len() => Ok(()),
            _ => Err(ValidationError),
        }
    }
}

impl Tensor {
    /// Writes the tensor in the binary format.
    ///
    /// A device-resident tensor is read back first.
    ///
    /// # Errors
    ///
    /// I/O errors, or [`Error::Corrupt`] if an axis or the length exceeds `i32::MAX`.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        let host = self.host_view()?;
        host.shape.write_to(writer)?;
        let count = i32::try_from(host.values.len())
            .map_err(|_| Error::Corrupt(format!("{} elements do not fit in i32", host.values.len())))?;
        writer.write_all(&count.to_le_bytes())?;
        for &v in &host.values {
            writer.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a tensor written by [`Tensor::serialize`].
    ///
    /// # Errors
    ///
    /// I/O errors (including truncated input) or [`Error::Corrupt`] for a
    /// negative axis or a count that disagrees with the shape.
    pub fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let shape = Shape::read_from(reader)?;
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        let header = PackedHeader {
            shape,
            count: i32::from_le_bytes(buf),
        };
        let header = TrustedData::new(header)
            .map_err(|_| Error::Corrupt(format!("element count does not match shape {shape}")))?
            .into_inner();

        let bytes = header
            .shape
            .len()
            .checked_mul(4)
            .ok_or_else(|| Error::Corrupt(format!("shape {} is too large", header.shape)))?;
        let mut raw = Vec::new();
        reader.take(bytes as u64).read_to_end(&mut raw)?;
        if raw.len() != bytes {
            return Err(Error::Corrupt(format!(
                "expected {bytes} bytes of values, found {}",
                raw.len()
            )));
        }
        let values = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self::from_parts(header.shape, values))
    }

    /// The binary encoding as a byte vector.
    ///
    /// # Errors
    ///
    /// See [`Tensor::serialize`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(20 + self.len() * 4);
        self.serialize(&mut out)?;
        Ok(out)
    }

    /// Decodes exactly one tensor from `bytes`.
    ///
    /// # Errors
    ///
    /// See [`Tensor::deserialize`]; trailing bytes are [`Error::Corrupt`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let tensor = Self::deserialize(&mut reader)?;
        if !reader.is_empty() {
            return Err(Error::Corrupt(format!("{} trailing bytes", reader.len())));
        }
        Ok(tensor)
    }

    /// Saves the tensor to a file.
    ///
    /// # Errors
    ///
    /// See [`Tensor::serialize`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        self.serialize(&mut file)?;
        file.flush()?;
        Ok(())
    }

    /// Loads a tensor saved with [`Tensor::save`].
    ///
    /// # Errors
    ///
    /// See [`Tensor::deserialize`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        Self::deserialize(&mut file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_shape_count_values() {
        let t = Tensor::new((2, 1, 1, 1), vec![1.5, -2.0]);
        let bytes = t.to_bytes().unwrap();
        assert_eq!(bytes.len(), 16 + 4 + 8);
        assert_eq!(&bytes[16..20], &2i32.to_le_bytes());
        assert_eq!(&bytes[20..24], &1.5f32.to_le_bytes());
        assert_eq!(Tensor::from_bytes(&bytes).unwrap(), t);
    }

    #[test]
    fn count_must_match_shape() {
        let mut bytes = Tensor::new((2, 1, 1, 1), vec![1.0, 2.0]).to_bytes().unwrap();
        bytes[16..20].copy_from_slice(&3i32.to_le_bytes());
        assert!(matches!(Tensor::from_bytes(&bytes), Err(Error::Corrupt(_))));
    }

    #[test]
    fn truncated_values_are_corrupt() {
        let bytes = Tensor::filled((3, 3), 1.0).to_bytes().unwrap();
        assert!(matches!(
            Tensor::from_bytes(&bytes[..bytes.len() - 2]),
            Err(Error::Corrupt(_))
        ));
        assert!(Tensor::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn overflowing_shape_is_corrupt() {
        let mut bytes = Vec::new();
        for _ in 0..4 {
            bytes.extend_from_slice(&65536i32.to_le_bytes());
        }
        bytes.extend_from_slice(&0i32.to_le_bytes());
        assert!(matches!(Tensor::from_bytes(&bytes), Err(Error::Corrupt(_))));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = Tensor::zeros(1).to_bytes().unwrap();
        bytes.push(0);
        assert!(Tensor::from_bytes(&bytes).is_err());
    }
}
