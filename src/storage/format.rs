//! Binary container layout

use bytemuck::{Pod, Zeroable};
use crc32fast::Hasher;

use crate::{ReelError, Result};

/// File magic bytes: "REEL\x00\x02\x00\x00"
pub const FILE_MAGIC: [u8; 8] = [0x52, 0x45, 0x45, 0x4C, 0x00, 0x02, 0x00, 0x00];

/// Container major version
pub const CONTAINER_VERSION_MAJOR: u16 = 1;

/// Container minor version
pub const CONTAINER_VERSION_MINOR: u16 = 0;

/// File header size
pub const HEADER_SIZE: usize = 64;

/// Byte range of `header_crc` inside the header
const CRC_FIELD: std::ops::Range<usize> = 12..16;

/// File header (64 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FileHeader {
    /// Magic bytes for file format identification
    pub magic: [u8; 8],

    /// Container major version
    pub version_major: u16,

    /// Container minor version
    pub version_minor: u16,

    /// CRC32 of header (excluding this field)
    pub header_crc: u32,

    /// Length of the payload following the header
    pub payload_len: u64,

    /// Cassette creation time (Unix epoch milliseconds)
    pub recorded_at_ms: i64,

    /// Number of interactions in the payload
    pub interaction_count: u32,

    /// Number of cookies in the payload
    pub cookie_count: u32,

    /// CRC32 of the payload
    pub payload_crc: u32,

    /// Reserved for future use
    pub reserved: [u8; 20],
}

static_assertions::const_assert_eq!(std::mem::size_of::<FileHeader>(), HEADER_SIZE);

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            magic: FILE_MAGIC,
            version_major: CONTAINER_VERSION_MAJOR,
            version_minor: CONTAINER_VERSION_MINOR,
            header_crc: 0,
            payload_len: 0,
            recorded_at_ms: 0,
            interaction_count: 0,
            cookie_count: 0,
            payload_crc: 0,
            reserved: [0; 20],
        }
    }
}

impl FileHeader {
    /// Compute the header CRC over every byte except the CRC field
    #[must_use]
    pub fn compute_crc(&self) -> u32 {
        let bytes = bytemuck::bytes_of(self);
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..CRC_FIELD.start]);
        hasher.update(&bytes[CRC_FIELD.end..]);
        hasher.finalize()
    }

    /// Store the header CRC
    pub fn seal(&mut self) {
        self.header_crc = self.compute_crc();
    }

    /// Read a header from the start of `data`
    ///
    /// # Errors
    ///
    /// Returns error if the data is too short, the magic or major version is
    /// wrong, or the header CRC does not match
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ReelError::InvalidFormat(
                "File too small to contain header".to_string(),
            ));
        }

        let header: Self = bytemuck::pod_read_unaligned(&data[..HEADER_SIZE]);

        if header.magic != FILE_MAGIC {
            return Err(ReelError::InvalidFormat(format!(
                "Invalid magic bytes: expected {:?}, got {:?}",
                FILE_MAGIC, header.magic
            )));
        }

        if header.version_major != CONTAINER_VERSION_MAJOR {
            return Err(ReelError::InvalidFormat(format!(
                "Unsupported container version: {}.{}, expected {}.x",
                header.version_major, header.version_minor, CONTAINER_VERSION_MAJOR
            )));
        }

        let computed = header.compute_crc();
        if header.header_crc != computed {
            return Err(ReelError::CorruptedData {
                section: "header",
                expected: header.header_crc,
                actual: computed,
            });
        }

        Ok(header)
    }
}

/// CRC32 of a payload
#[must_use]
pub fn payload_crc(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 64);
    }

    #[test]
    fn test_default_header() {
        let header = FileHeader::default();
        assert_eq!(header.magic, FILE_MAGIC);
        assert_eq!(header.version_major, CONTAINER_VERSION_MAJOR);
        assert_eq!(header.interaction_count, 0);
    }

    #[test]
    fn test_crc_excludes_crc_field() {
        let mut header = FileHeader::default();
        header.payload_len = 42;
        let before = header.compute_crc();

        header.seal();
        assert_eq!(header.compute_crc(), before);
    }

    #[test]
    fn test_read_detects_corruption() {
        let mut header = FileHeader::default();
        header.interaction_count = 3;
        header.seal();

        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        assert_eq!(FileHeader::read(&bytes).unwrap(), header);

        bytes[32] ^= 0xFF;
        assert!(matches!(
            FileHeader::read(&bytes),
            Err(ReelError::CorruptedData {
                section: "header",
                ..
            })
        ));
    }

    #[test]
    fn test_read_rejects_bad_magic() {
        let bytes = [0u8; HEADER_SIZE];
        assert!(matches!(
            FileHeader::read(&bytes),
            Err(ReelError::InvalidFormat(_))
        ));
    }
}
