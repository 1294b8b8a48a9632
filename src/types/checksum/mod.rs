#![forbid(unsafe_code)]

/// Checksum of the file header fields, salted with the format magic.
pub fn header_crc32(magic: &[u8; 4], fields: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(magic);
    hasher.update(fields);
    hasher.finalize()
}
