//! # Object Codec
//!
//! The binary payload format for repository objects. Every payload is a
//! self-delimiting sequence of msgpack values beginning with a type tag:
//!
//! ```text
//! blob      "blob"     bin(contents)
//! inode     "inode"    {size, inode, uid, gid, mode, mtime, atime}
//!                      ["immediate", bin] | ["chunklist", [[offset, bin(id)], …]]
//! tree      "tree"     {uid, gid, mode, mtime, atime}
//!                      [[bin(raw_name), bin(id)], …]
//! snapshot  "snapshot" {date, root: bin(id), path: bin}
//! ```
//!
//! `mtime`/`atime` are nanosecond integers. Directory entry names and
//! snapshot paths are raw OS byte strings — they may not be valid UTF-8 and
//! must round-trip exactly. A `symlink` layout (info map plus target bytes)
//! is also understood for restore.
//!
//! This format is the compatibility boundary of the repository: integer
//! widths are minimal msgpack encodings and map keys are written in the
//! order shown, so payloads are byte-for-byte reproducible.

use crate::crypto::ObjectId;
use crate::error::CodecError;

type Result<T> = std::result::Result<T, CodecError>;

/// Stat fields carried by an inode payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub size: u64,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mtime_ns: i64,
    pub atime_ns: i64,
}

/// Stat fields carried by a tree (or symlink) payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TreeInfo {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mtime_ns: i64,
    pub atime_ns: i64,
}

/// The contents section of an inode payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contents {
    /// File contents embedded directly (small files).
    Immediate(Vec<u8>),
    /// `(offset, blob id)` pairs referencing chunk objects.
    ChunkList(Vec<(u64, ObjectId)>),
}

/// A fully decoded object payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Blob(Vec<u8>),
    Inode {
        info: FileInfo,
        contents: Contents,
    },
    Tree {
        info: TreeInfo,
        entries: Vec<(Vec<u8>, ObjectId)>,
    },
    Snapshot {
        date: i64,
        root: ObjectId,
        path: Vec<u8>,
    },
    Symlink {
        info: TreeInfo,
        target: Vec<u8>,
    },
}

/// Object type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Blob,
    Inode,
    Tree,
    Snapshot,
    Symlink,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Blob => "blob",
            Kind::Inode => "inode",
            Kind::Tree => "tree",
            Kind::Snapshot => "snapshot",
            Kind::Symlink => "symlink",
        }
    }

    fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "blob" => Ok(Kind::Blob),
            "inode" => Ok(Kind::Inode),
            "tree" => Ok(Kind::Tree),
            "snapshot" => Ok(Kind::Snapshot),
            "symlink" => Ok(Kind::Symlink),
            other => Err(CodecError::UnknownType(other.to_string())),
        }
    }
}

/// Reads just the leading type tag of a payload.
pub fn kind(payload: &[u8]) -> Result<Kind> {
    let rd = &mut &payload[..];
    Kind::from_tag(&read_string(rd)?)
}

// ─── Encoding ───────────────────────────────────────────────────────────────

fn enc<E: std::fmt::Display>(e: E) -> CodecError {
    CodecError::Encode(e.to_string())
}

pub fn encode_blob(contents: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(contents.len() + 16);
    rmp::encode::write_str(&mut buf, "blob").map_err(enc)?;
    rmp::encode::write_bin(&mut buf, contents).map_err(enc)?;
    Ok(buf)
}

pub fn encode_inode(info: &FileInfo, contents: &Contents) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    rmp::encode::write_str(&mut buf, "inode").map_err(enc)?;

    rmp::encode::write_map_len(&mut buf, 7).map_err(enc)?;
    write_uint_field(&mut buf, "size", info.size)?;
    write_uint_field(&mut buf, "inode", info.inode)?;
    write_uint_field(&mut buf, "uid", info.uid as u64)?;
    write_uint_field(&mut buf, "gid", info.gid as u64)?;
    write_uint_field(&mut buf, "mode", info.mode as u64)?;
    write_sint_field(&mut buf, "mtime", info.mtime_ns)?;
    write_sint_field(&mut buf, "atime", info.atime_ns)?;

    match contents {
        Contents::Immediate(data) => {
            rmp::encode::write_array_len(&mut buf, 2).map_err(enc)?;
            rmp::encode::write_str(&mut buf, "immediate").map_err(enc)?;
            rmp::encode::write_bin(&mut buf, data).map_err(enc)?;
        }
        Contents::ChunkList(chunks) => {
            rmp::encode::write_array_len(&mut buf, 2).map_err(enc)?;
            rmp::encode::write_str(&mut buf, "chunklist").map_err(enc)?;
            rmp::encode::write_array_len(&mut buf, chunks.len() as u32).map_err(enc)?;
            for (offset, id) in chunks {
                rmp::encode::write_array_len(&mut buf, 2).map_err(enc)?;
                rmp::encode::write_uint(&mut buf, *offset).map_err(enc)?;
                rmp::encode::write_bin(&mut buf, id.as_bytes()).map_err(enc)?;
            }
        }
    }

    Ok(buf)
}

pub fn encode_tree(info: &TreeInfo, entries: &[(Vec<u8>, ObjectId)]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    rmp::encode::write_str(&mut buf, "tree").map_err(enc)?;

    write_tree_info(&mut buf, info)?;

    rmp::encode::write_array_len(&mut buf, entries.len() as u32).map_err(enc)?;
    for (name, id) in entries {
        rmp::encode::write_array_len(&mut buf, 2).map_err(enc)?;
        rmp::encode::write_bin(&mut buf, name).map_err(enc)?;
        rmp::encode::write_bin(&mut buf, id.as_bytes()).map_err(enc)?;
    }

    Ok(buf)
}

pub fn encode_snapshot(date: i64, root: &ObjectId, path: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    rmp::encode::write_str(&mut buf, "snapshot").map_err(enc)?;
    rmp::encode::write_map_len(&mut buf, 3).map_err(enc)?;
    write_sint_field(&mut buf, "date", date)?;
    rmp::encode::write_str(&mut buf, "root").map_err(enc)?;
    rmp::encode::write_bin(&mut buf, root.as_bytes()).map_err(enc)?;
    rmp::encode::write_str(&mut buf, "path").map_err(enc)?;
    rmp::encode::write_bin(&mut buf, path).map_err(enc)?;
    Ok(buf)
}

pub fn encode_symlink(info: &TreeInfo, target: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    rmp::encode::write_str(&mut buf, "symlink").map_err(enc)?;
    write_tree_info(&mut buf, info)?;
    rmp::encode::write_bin(&mut buf, target).map_err(enc)?;
    Ok(buf)
}

fn write_tree_info(buf: &mut Vec<u8>, info: &TreeInfo) -> Result<()> {
    rmp::encode::write_map_len(buf, 5).map_err(enc)?;
    write_uint_field(buf, "uid", info.uid as u64)?;
    write_uint_field(buf, "gid", info.gid as u64)?;
    write_uint_field(buf, "mode", info.mode as u64)?;
    write_sint_field(buf, "mtime", info.mtime_ns)?;
    write_sint_field(buf, "atime", info.atime_ns)?;
    Ok(())
}

fn write_uint_field(buf: &mut Vec<u8>, key: &str, value: u64) -> Result<()> {
    rmp::encode::write_str(buf, key).map_err(enc)?;
    rmp::encode::write_uint(buf, value).map_err(enc)?;
    Ok(())
}

fn write_sint_field(buf: &mut Vec<u8>, key: &str, value: i64) -> Result<()> {
    rmp::encode::write_str(buf, key).map_err(enc)?;
    rmp::encode::write_sint(buf, value).map_err(enc)?;
    Ok(())
}

// ─── Decoding ───────────────────────────────────────────────────────────────

/// Decodes a full payload.
pub fn decode(payload: &[u8]) -> Result<Payload> {
    let rd = &mut &payload[..];
    let tag = read_string(rd)?;

    match Kind::from_tag(&tag)? {
        Kind::Blob => Ok(Payload::Blob(read_bin(rd)?)),
        Kind::Inode => {
            let info = read_file_info(rd)?;
            let contents = read_contents(rd)?;
            Ok(Payload::Inode { info, contents })
        }
        Kind::Tree => {
            let info = read_tree_info(rd)?;
            let count = read_array_len(rd)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                expect_array_len(rd, 2)?;
                let name = read_bin(rd)?;
                let id = read_object_id(rd)?;
                entries.push((name, id));
            }
            Ok(Payload::Tree { info, entries })
        }
        Kind::Snapshot => {
            let fields = read_map_len(rd)?;
            let mut date = None;
            let mut root = None;
            let mut path = None;
            for _ in 0..fields {
                match read_string(rd)?.as_str() {
                    "date" => date = Some(read_i64(rd)?),
                    "root" => root = Some(read_object_id(rd)?),
                    "path" => path = Some(read_bin(rd)?),
                    other => {
                        return Err(CodecError::Decode(format!(
                            "unknown snapshot field {other:?}"
                        )))
                    }
                }
            }
            match (date, root, path) {
                (Some(date), Some(root), Some(path)) => Ok(Payload::Snapshot { date, root, path }),
                _ => Err(CodecError::Decode(
                    "snapshot payload is missing fields".into(),
                )),
            }
        }
        Kind::Symlink => {
            let info = read_tree_info(rd)?;
            let target = read_bin(rd)?;
            Ok(Payload::Symlink { info, target })
        }
    }
}

/// Decodes a payload that must be a blob, returning its contents.
pub fn decode_blob(payload: &[u8]) -> Result<Vec<u8>> {
    match decode(payload)? {
        Payload::Blob(data) => Ok(data),
        other => Err(CodecError::UnexpectedType {
            expected: "blob",
            found: payload_kind(&other).to_string(),
        }),
    }
}

fn payload_kind(p: &Payload) -> &'static str {
    match p {
        Payload::Blob(_) => "blob",
        Payload::Inode { .. } => "inode",
        Payload::Tree { .. } => "tree",
        Payload::Snapshot { .. } => "snapshot",
        Payload::Symlink { .. } => "symlink",
    }
}

fn dec<E: std::fmt::Display>(e: E) -> CodecError {
    CodecError::Decode(e.to_string())
}

fn take<'a>(rd: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if rd.len() < n {
        return Err(CodecError::Truncated);
    }
    let (head, tail) = rd.split_at(n);
    *rd = tail;
    Ok(head)
}

fn read_string(rd: &mut &[u8]) -> Result<String> {
    let len = rmp::decode::read_str_len(rd).map_err(dec)? as usize;
    let bytes = take(rd, len)?;
    String::from_utf8(bytes.to_vec()).map_err(dec)
}

fn read_bin(rd: &mut &[u8]) -> Result<Vec<u8>> {
    let len = rmp::decode::read_bin_len(rd).map_err(dec)? as usize;
    Ok(take(rd, len)?.to_vec())
}

fn read_object_id(rd: &mut &[u8]) -> Result<ObjectId> {
    let bytes = read_bin(rd)?;
    ObjectId::try_from(bytes.as_slice()).map_err(dec)
}

fn read_i64(rd: &mut &[u8]) -> Result<i64> {
    rmp::decode::read_int(rd).map_err(dec)
}

fn read_u64(rd: &mut &[u8]) -> Result<u64> {
    rmp::decode::read_int(rd).map_err(dec)
}

fn read_u32(rd: &mut &[u8]) -> Result<u32> {
    rmp::decode::read_int(rd).map_err(dec)
}

fn read_array_len(rd: &mut &[u8]) -> Result<usize> {
    Ok(rmp::decode::read_array_len(rd).map_err(dec)? as usize)
}

fn expect_array_len(rd: &mut &[u8], expected: usize) -> Result<()> {
    let len = read_array_len(rd)?;
    if len != expected {
        return Err(CodecError::Decode(format!(
            "expected a {expected}-element array, found {len}"
        )));
    }
    Ok(())
}

fn read_map_len(rd: &mut &[u8]) -> Result<usize> {
    Ok(rmp::decode::read_map_len(rd).map_err(dec)? as usize)
}

fn read_file_info(rd: &mut &[u8]) -> Result<FileInfo> {
    let fields = read_map_len(rd)?;
    let mut info = FileInfo::default();
    for _ in 0..fields {
        match read_string(rd)?.as_str() {
            "size" => info.size = read_u64(rd)?,
            "inode" => info.inode = read_u64(rd)?,
            "uid" => info.uid = read_u32(rd)?,
            "gid" => info.gid = read_u32(rd)?,
            "mode" => info.mode = read_u32(rd)?,
            "mtime" => info.mtime_ns = read_i64(rd)?,
            "atime" => info.atime_ns = read_i64(rd)?,
            other => {
                return Err(CodecError::Decode(format!("unknown inode field {other:?}")))
            }
        }
    }
    Ok(info)
}

fn read_tree_info(rd: &mut &[u8]) -> Result<TreeInfo> {
    let fields = read_map_len(rd)?;
    let mut info = TreeInfo::default();
    for _ in 0..fields {
        match read_string(rd)?.as_str() {
            "uid" => info.uid = read_u32(rd)?,
            "gid" => info.gid = read_u32(rd)?,
            "mode" => info.mode = read_u32(rd)?,
            "mtime" => info.mtime_ns = read_i64(rd)?,
            "atime" => info.atime_ns = read_i64(rd)?,
            other => {
                return Err(CodecError::Decode(format!("unknown tree field {other:?}")))
            }
        }
    }
    Ok(info)
}

fn read_contents(rd: &mut &[u8]) -> Result<Contents> {
    expect_array_len(rd, 2)?;
    match read_string(rd)?.as_str() {
        "immediate" => Ok(Contents::Immediate(read_bin(rd)?)),
        "chunklist" => {
            let count = read_array_len(rd)?;
            let mut chunks = Vec::with_capacity(count);
            for _ in 0..count {
                expect_array_len(rd, 2)?;
                let offset = read_u64(rd)?;
                let id = read_object_id(rd)?;
                chunks.push((offset, id));
            }
            Ok(Contents::ChunkList(chunks))
        }
        other => Err(CodecError::Decode(format!(
            "unknown inode contents tag {other:?}"
        ))),
    }
}
