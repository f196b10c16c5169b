//! On-disk wire format for a BlobStore file.
//!
//! ```text
//! Header:  magic(8) "SNAPBLOB" | version u32 | flags u32 (bit0=compressed) |
//!          kind u16 (1=weight, 2=kv) | reserved u16
//! Meta:    model_id str | tensor_dir_offset u64 | tensor_dir_size u64 |
//!          payload_size u64 | created_at u64 | ttl u64
//! Dir:     count u32 then count × {name str | dtype u16 | ndim u16 | shape[8] u32 |
//!          offset u64 | size u64 | row_crc u32}
//! Payload: tensors, each aligned to 64 B.
//! Trailer: header_crc u32 | payload_crc u32 | total_size u64
//! ```
//!
//! Offsets are little-endian; strings are length-prefixed UTF-8 (u32 length).

use crate::error::BlobStoreError;

/// Alignment, in bytes, every tensor's payload offset is rounded up to.
pub const TENSOR_ALIGNMENT: u64 = 64;

pub const MAGIC: &[u8; 8] = b"SNAPBLOB";
pub const FORMAT_VERSION: u32 = 1;
pub const FLAG_COMPRESSED: u32 = 1 << 0;

/// Distinguishes a weight blob from a KV-context blob in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Weight,
    Kv,
}

impl BlobKind {
    fn as_u16(self) -> u16 {
        match self {
            BlobKind::Weight => 1,
            BlobKind::Kv => 2,
        }
    }

    fn from_u16(v: u16) -> Result<Self, BlobStoreError> {
        match v {
            1 => Ok(BlobKind::Weight),
            2 => Ok(BlobKind::Kv),
            other => Err(BlobStoreError::Malformed(format!(
                "unknown blob kind tag {other}"
            ))),
        }
    }
}

/// One entry in the tensor directory.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: u16,
    pub shape: Vec<u32>,
    pub offset: u64,
    pub size: u64,
    pub row_crc: u32,
}

/// Parsed blob metadata: everything except the payload bytes.
#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub kind: BlobKind,
    pub compressed: bool,
    pub model_id: String,
    pub tensor_dir: Vec<TensorEntry>,
    pub payload_size: u64,
    pub created_at: u64,
    pub ttl: u64,
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_str(buf: &[u8], pos: &mut usize) -> Result<String, BlobStoreError> {
    let len = read_u32(buf, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| BlobStoreError::Malformed("truncated string".into()))?;
    let s = String::from_utf8(buf[*pos..end].to_vec())
        .map_err(|e| BlobStoreError::Malformed(format!("invalid utf8: {e}")))?;
    *pos = end;
    Ok(s)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, BlobStoreError> {
    let bytes = buf
        .get(*pos..*pos + 2)
        .ok_or_else(|| BlobStoreError::Malformed("truncated u16".into()))?;
    *pos += 2;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, BlobStoreError> {
    let bytes = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| BlobStoreError::Malformed("truncated u32".into()))?;
    *pos += 4;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Result<u64, BlobStoreError> {
    let bytes = buf
        .get(*pos..*pos + 8)
        .ok_or_else(|| BlobStoreError::Malformed("truncated u64".into()))?;
    *pos += 8;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Round `offset` up to the next multiple of [`TENSOR_ALIGNMENT`].
pub fn align_up(offset: u64) -> u64 {
    let rem = offset % TENSOR_ALIGNMENT;
    if rem == 0 {
        offset
    } else {
        offset + (TENSOR_ALIGNMENT - rem)
    }
}

/// Encode a full blob file: header + meta + directory + payload + trailer.
///
/// `tensors` gives (name, dtype, shape, bytes) in declared order; each
/// tensor's bytes are padded to [`TENSOR_ALIGNMENT`] in the payload.
pub fn encode(
    kind: BlobKind,
    compressed: bool,
    model_id: &str,
    created_at: u64,
    ttl: u64,
    tensors: &[(String, u16, Vec<u32>, Vec<u8>)],
) -> Vec<u8> {
    let mut payload = Vec::new();
    let mut dir = Vec::with_capacity(tensors.len());

    for (name, dtype, shape, bytes) in tensors {
        let offset = align_up(payload.len() as u64);
        payload.resize(offset as usize, 0);
        let row_crc = crc32fast::hash(bytes);
        payload.extend_from_slice(bytes);
        dir.push(TensorEntry {
            name: name.clone(),
            dtype: *dtype,
            shape: shape.clone(),
            offset,
            size: bytes.len() as u64,
            row_crc,
        });
    }

    let mut header = Vec::new();
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    let flags = if compressed { FLAG_COMPRESSED } else { 0 };
    header.extend_from_slice(&flags.to_le_bytes());
    header.extend_from_slice(&kind.as_u16().to_le_bytes());
    header.extend_from_slice(&0u16.to_le_bytes()); // reserved

    let mut dir_bytes = Vec::new();
    dir_bytes.extend_from_slice(&(dir.len() as u32).to_le_bytes());
    for entry in &dir {
        write_str(&mut dir_bytes, &entry.name);
        dir_bytes.extend_from_slice(&entry.dtype.to_le_bytes());
        dir_bytes.extend_from_slice(&(entry.shape.len() as u16).to_le_bytes());
        let mut shape = entry.shape.clone();
        shape.resize(8, 0);
        for dim in &shape[..8] {
            dir_bytes.extend_from_slice(&dim.to_le_bytes());
        }
        dir_bytes.extend_from_slice(&entry.offset.to_le_bytes());
        dir_bytes.extend_from_slice(&entry.size.to_le_bytes());
        dir_bytes.extend_from_slice(&entry.row_crc.to_le_bytes());
    }

    // meta = model_id str | tensor_dir_offset u64 | tensor_dir_size u64 |
    //        payload_size u64 | created_at u64 | ttl u64
    // tensor_dir_offset is absolute (from file start), so its value depends
    // on meta's own length; compute meta's length first with a zero
    // placeholder, then patch the single field in place.
    let meta_len = 4 + model_id.len() + 8 + 8 + 8 + 8 + 8;
    let tensor_dir_offset = (header.len() + meta_len) as u64;

    let mut meta = Vec::with_capacity(meta_len);
    write_str(&mut meta, model_id);
    meta.extend_from_slice(&tensor_dir_offset.to_le_bytes());
    meta.extend_from_slice(&(dir_bytes.len() as u64).to_le_bytes());
    meta.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    meta.extend_from_slice(&created_at.to_le_bytes());
    meta.extend_from_slice(&ttl.to_le_bytes());
    debug_assert_eq!(meta.len(), meta_len);

    let mut out = Vec::new();
    out.extend_from_slice(&header);
    out.extend_from_slice(&meta);
    out.extend_from_slice(&dir_bytes);
    out.extend_from_slice(&payload);

    let header_crc = crc32fast::hash(&out[..header.len() + meta.len() + dir_bytes.len()]);
    let payload_crc = crc32fast::hash(&payload);
    out.extend_from_slice(&header_crc.to_le_bytes());
    out.extend_from_slice(&payload_crc.to_le_bytes());
    let total_size = out.len() as u64 + 8; // + the total_size field itself
    out.extend_from_slice(&total_size.to_le_bytes());

    out
}

/// Parsed blob: metadata plus a view into the payload bytes.
pub struct DecodedBlob<'a> {
    pub meta: BlobMeta,
    pub payload: &'a [u8],
}

/// Decode and verify a blob file's header/directory/trailer.
///
/// Does not decompress — callers inspect `meta.compressed` and apply the
/// configured codec to `payload` themselves.
pub fn decode(buf: &[u8]) -> Result<DecodedBlob<'_>, BlobStoreError> {
    if buf.len() < 8 + 4 + 4 + 2 + 2 {
        return Err(BlobStoreError::Malformed("blob shorter than header".into()));
    }
    if &buf[0..8] != MAGIC {
        return Err(BlobStoreError::Malformed("bad magic".into()));
    }

    let mut pos = 8;
    let _version = read_u32(buf, &mut pos)?;
    let flags = read_u32(buf, &mut pos)?;
    let compressed = flags & FLAG_COMPRESSED != 0;
    let kind = BlobKind::from_u16(read_u16(buf, &mut pos)?)?;
    let _reserved = read_u16(buf, &mut pos)?;

    let model_id = read_str(buf, &mut pos)?;
    let tensor_dir_offset = read_u64(buf, &mut pos)? as usize;
    let tensor_dir_size = read_u64(buf, &mut pos)? as usize;
    let payload_size = read_u64(buf, &mut pos)?;
    let created_at = read_u64(buf, &mut pos)?;
    let ttl = read_u64(buf, &mut pos)?;

    if buf.len() < tensor_dir_offset + tensor_dir_size {
        return Err(BlobStoreError::Malformed("truncated tensor directory".into()));
    }

    let mut dir_pos = tensor_dir_offset;
    let count = read_u32(buf, &mut dir_pos)?;
    let mut tensor_dir = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_str(buf, &mut dir_pos)?;
        let dtype = read_u16(buf, &mut dir_pos)?;
        let ndim = read_u16(buf, &mut dir_pos)? as usize;
        let mut shape = Vec::with_capacity(8);
        for _ in 0..8 {
            shape.push(read_u32(buf, &mut dir_pos)?);
        }
        shape.truncate(ndim);
        let offset = read_u64(buf, &mut dir_pos)?;
        let size = read_u64(buf, &mut dir_pos)?;
        let row_crc = read_u32(buf, &mut dir_pos)?;
        tensor_dir.push(TensorEntry {
            name,
            dtype,
            shape,
            offset,
            size,
            row_crc,
        });
    }

    let payload_start = tensor_dir_offset + tensor_dir_size;
    let payload_end = payload_start + payload_size as usize;
    if buf.len() < payload_end + 4 + 4 + 8 {
        return Err(BlobStoreError::Malformed("truncated trailer".into()));
    }

    let payload = &buf[payload_start..payload_end];

    let mut trailer_pos = payload_end;
    let header_crc = read_u32(buf, &mut trailer_pos)?;
    let payload_crc = read_u32(buf, &mut trailer_pos)?;
    let _total_size = read_u64(buf, &mut trailer_pos)?;

    let computed_header_crc = crc32fast::hash(&buf[..payload_start]);
    if computed_header_crc != header_crc {
        return Err(BlobStoreError::Corrupt {
            id: model_id.clone(),
            expected: header_crc,
            computed: computed_header_crc,
        });
    }
    let computed_payload_crc = crc32fast::hash(payload);
    if computed_payload_crc != payload_crc {
        return Err(BlobStoreError::Corrupt {
            id: model_id.clone(),
            expected: payload_crc,
            computed: computed_payload_crc,
        });
    }

    Ok(DecodedBlob {
        meta: BlobMeta {
            kind,
            compressed,
            model_id,
            tensor_dir,
            payload_size,
            created_at,
            ttl,
        },
        payload,
    })
}
