//! Tar-split: capture and replay of tar stream framing.
//!
//! A layer's backing store only keeps the extracted files, but exporting the
//! layer must reproduce the original tar stream byte for byte (its digest is
//! the layer's diff ID). Tar-split records everything *except* file content
//! while the stream is applied, and reassembles the stream later by
//! interleaving those records with content read back from the backing store.
//!
//! # Format
//!
//! The metadata is NDJSON, one entry per line, compatible with
//! vbatts/tar-split:
//!
//! - Type 1 (file): `name` (or base64 `name_raw` when not UTF-8), `size`, and
//!   `payload` holding the big-endian CRC-64/ISO of the content.
//! - Type 2 (segment): `payload` holding raw bytes (headers, padding, the
//!   end-of-archive trailer), base64-encoded.
//!
//! Every entry carries a `position`, counting up from zero.

use std::{
    borrow::Cow,
    ffi::OsStr,
    io::{self, BufRead, ErrorKind, Read, Write},
    os::unix::ffi::OsStrExt,
    path::{Component, Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use crc::{Crc, Digest as CrcDigest, CRC_64_GO_ISO};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

const BLOCK_SIZE: usize = 512;

/// Malformed tar-split metadata, or layer content that does not match it.
///
/// Travels inside `io::Error` through `Read` adapters and is turned back into
/// [`Error::TarSplit`] at the store boundary.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TarSplitError(pub String);

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, TarSplitError(msg.into()))
}

/// A single tar-split record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// File content reference: the content itself lives in the backing store.
    File {
        /// Entry name as recorded in the tar stream.
        name: Vec<u8>,
        /// Content size in bytes.
        size: u64,
        /// Big-endian CRC-64/ISO of the content, empty for zero-sized entries.
        checksum: Vec<u8>,
    },
    /// Raw bytes of the tar stream, written back verbatim.
    Segment(Vec<u8>),
}

/// Wire form of an entry, before validation.
#[derive(Debug, Serialize, Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    type_id: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name_raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    position: usize,
}

impl RawEntry {
    fn from_entry(entry: &Entry, position: usize) -> Self {
        match entry {
            Entry::File {
                name,
                size,
                checksum,
            } => {
                let (name, name_raw) = match std::str::from_utf8(name) {
                    Ok(s) => (Some(s.to_string()), None),
                    Err(_) => (None, Some(STANDARD.encode(name))),
                };
                RawEntry {
                    type_id: 1,
                    name,
                    name_raw,
                    size: Some(*size),
                    payload: (!checksum.is_empty()).then(|| STANDARD.encode(checksum)),
                    position,
                }
            }
            Entry::Segment(payload) => RawEntry {
                type_id: 2,
                name: None,
                name_raw: None,
                size: None,
                payload: Some(STANDARD.encode(payload)),
                position,
            },
        }
    }

    fn into_entry(self) -> io::Result<Entry> {
        let decode = |field: Option<String>| -> io::Result<Vec<u8>> {
            match field {
                Some(s) => STANDARD
                    .decode(s)
                    .map_err(|e| invalid(format!("bad base64 in entry {}: {e}", self.position))),
                None => Ok(Vec::new()),
            }
        };
        match self.type_id {
            1 => {
                let name = match (self.name.clone(), self.name_raw.clone()) {
                    (_, Some(raw)) => decode(Some(raw))?,
                    (Some(name), None) => name.into_bytes(),
                    (None, None) => Vec::new(),
                };
                Ok(Entry::File {
                    name,
                    size: self.size.unwrap_or(0),
                    checksum: decode(self.payload.clone())?,
                })
            }
            2 => Ok(Entry::Segment(decode(self.payload.clone())?)),
            other => Err(invalid(format!("invalid tar-split entry type: {other}"))),
        }
    }
}

/// Sink for tar-split entries.
pub trait Packer {
    /// Record an entry, returning its position.
    fn add_entry(&mut self, entry: Entry) -> io::Result<usize>;
}

/// Source of tar-split entries, in stream order.
pub trait Unpacker {
    /// The next entry, or `None` once the metadata is exhausted.
    fn next_entry(&mut self) -> io::Result<Option<Entry>>;
}

/// Writes entries as newline-delimited JSON.
#[derive(Debug)]
pub struct JsonPacker<W: Write> {
    writer: W,
    position: usize,
}

impl<W: Write> JsonPacker<W> {
    pub fn new(writer: W) -> Self {
        JsonPacker {
            writer,
            position: 0,
        }
    }
}

impl<W: Write> Packer for JsonPacker<W> {
    fn add_entry(&mut self, entry: Entry) -> io::Result<usize> {
        let position = self.position;
        let raw = RawEntry::from_entry(&entry, position);
        serde_json::to_writer(&mut self.writer, &raw)?;
        self.writer.write_all(b"\n")?;
        self.position += 1;
        Ok(position)
    }
}

impl<P: Packer + ?Sized> Packer for &mut P {
    fn add_entry(&mut self, entry: Entry) -> io::Result<usize> {
        (**self).add_entry(entry)
    }
}

/// Reads newline-delimited JSON entries.
#[derive(Debug)]
pub struct JsonUnpacker<R: BufRead> {
    reader: R,
    line: String,
    position: usize,
}

impl<R: BufRead> JsonUnpacker<R> {
    pub fn new(reader: R) -> Self {
        JsonUnpacker {
            reader,
            line: String::new(),
            position: 0,
        }
    }
}

impl<R: BufRead> Unpacker for JsonUnpacker<R> {
    fn next_entry(&mut self) -> io::Result<Option<Entry>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            if !self.line.trim().is_empty() {
                break;
            }
        }
        let raw: RawEntry = serde_json::from_str(&self.line)
            .map_err(|e| invalid(format!("parsing tar-split entry: {e}")))?;
        if raw.position != self.position {
            return Err(invalid(format!(
                "out of order tar-split entry: expected position {}, found {}",
                self.position, raw.position
            )));
        }
        self.position += 1;
        raw.into_entry().map(Some)
    }
}

/// Parser state for [`InputTarStream`].
enum State {
    /// Collecting the next 512 byte header block.
    Header,
    /// Reading the body of a GNU long name/link or PAX extension header.
    Extension {
        kind: ExtensionKind,
        remaining: u64,
        padding: u64,
        data: Vec<u8>,
    },
    /// Reading file content.
    Content {
        name: Vec<u8>,
        size: u64,
        remaining: u64,
        padding: u64,
        crc: CrcDigest<'static, u64>,
    },
    /// Skipping padding after file content; recorded as segment bytes.
    Padding { remaining: u64 },
    /// After the end-of-archive marker: everything left is one segment.
    Trailer,
}

#[derive(Debug, Clone, Copy)]
enum ExtensionKind {
    LongName,
    LongLink,
    Pax,
    GlobalPax,
}

fn padding_for(size: u64) -> u64 {
    let rem = size % BLOCK_SIZE as u64;
    if rem == 0 {
        0
    } else {
        BLOCK_SIZE as u64 - rem
    }
}

fn verify_checksum(block: &[u8], header: &tar::Header) -> io::Result<()> {
    let expected = header
        .cksum()
        .map_err(|e| invalid(format!("invalid tar header checksum field: {e}")))?;
    let actual: u32 = block
        .iter()
        .enumerate()
        .map(|(i, b)| if (148..156).contains(&i) { 32 } else { *b as u32 })
        .sum();
    if expected != actual {
        return Err(invalid(format!(
            "tar header checksum mismatch: expected {expected}, computed {actual}"
        )));
    }
    Ok(())
}

/// Parse PAX records (`"<len> <key>=<value>\n"`), returning `path` and `size` overrides.
fn parse_pax(data: &[u8]) -> io::Result<(Option<Vec<u8>>, Option<u64>)> {
    let mut path = None;
    let mut size = None;
    let mut rest = data;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| invalid("malformed PAX record"))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| invalid("malformed PAX record length"))?;
        if len <= space + 1 || len > rest.len() || rest[len - 1] != b'\n' {
            return Err(invalid("malformed PAX record"));
        }
        let record = &rest[space + 1..len - 1];
        if let Some(eq) = record.iter().position(|b| *b == b'=') {
            let (key, value) = (&record[..eq], &record[eq + 1..]);
            match key {
                b"path" => path = Some(value.to_vec()),
                b"size" => {
                    size = std::str::from_utf8(value).ok().and_then(|s| s.parse().ok());
                }
                _ => {}
            }
        }
        rest = &rest[len..];
    }
    Ok((path, size))
}

/// A reader that passes a tar stream through unchanged while recording its
/// framing to a [`Packer`].
///
/// The consumer must read to EOF: the final segment (the end-of-archive
/// trailer and anything after it) is only recorded then.
pub struct InputTarStream<R, P> {
    inner: R,
    packer: P,
    state: State,
    block: Vec<u8>,
    pending: Vec<u8>,
    long_name: Option<Vec<u8>>,
    pax_path: Option<Vec<u8>>,
    pax_size: Option<u64>,
    finished: bool,
}

impl<R, P> std::fmt::Debug for InputTarStream<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputTarStream")
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<R: Read, P: Packer> InputTarStream<R, P> {
    pub fn new(inner: R, packer: P) -> Self {
        InputTarStream {
            inner,
            packer,
            state: State::Header,
            block: Vec::with_capacity(BLOCK_SIZE),
            pending: Vec::new(),
            long_name: None,
            pax_path: None,
            pax_size: None,
            finished: false,
        }
    }

    fn flush_segment(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let payload = std::mem::take(&mut self.pending);
            self.packer.add_entry(Entry::Segment(payload))?;
        }
        Ok(())
    }

    fn start_entry(&mut self) -> io::Result<()> {
        let block = std::mem::take(&mut self.block);
        if block.iter().all(|b| *b == 0) {
            self.pending.extend_from_slice(&block);
            self.state = State::Trailer;
            return Ok(());
        }

        let header = tar::Header::from_byte_slice(&block);
        verify_checksum(&block, header)?;
        self.pending.extend_from_slice(&block);

        let entry_type = header.entry_type();
        let header_size = header
            .entry_size()
            .map_err(|e| invalid(format!("invalid tar entry size: {e}")))?;

        let extension = if entry_type.is_gnu_longname() {
            Some(ExtensionKind::LongName)
        } else if entry_type.is_gnu_longlink() {
            Some(ExtensionKind::LongLink)
        } else if entry_type.is_pax_local_extensions() {
            Some(ExtensionKind::Pax)
        } else if entry_type.is_pax_global_extensions() {
            Some(ExtensionKind::GlobalPax)
        } else {
            None
        };

        if let Some(kind) = extension {
            self.state = State::Extension {
                kind,
                remaining: header_size,
                padding: padding_for(header_size),
                data: Vec::new(),
            };
            return Ok(());
        }

        let name = match (self.long_name.take(), self.pax_path.take()) {
            (_, Some(path)) => path,
            (Some(long), None) => long,
            (None, None) => header.path_bytes().into_owned(),
        };
        let size = match entry_type {
            tar::EntryType::Link
            | tar::EntryType::Symlink
            | tar::EntryType::Char
            | tar::EntryType::Block
            | tar::EntryType::Directory
            | tar::EntryType::Fifo => 0,
            _ => self.pax_size.take().unwrap_or(header_size),
        };
        self.pax_size = None;

        self.flush_segment()?;
        self.block = block;
        self.block.clear();

        if size == 0 {
            self.packer.add_entry(Entry::File {
                name,
                size: 0,
                checksum: Vec::new(),
            })?;
            self.state = State::Header;
        } else {
            self.state = State::Content {
                name,
                size,
                remaining: size,
                padding: padding_for(size),
                crc: CRC64_ISO.digest(),
            };
        }
        Ok(())
    }

    fn finish_extension(&mut self, kind: ExtensionKind, data: Vec<u8>) -> io::Result<()> {
        match kind {
            ExtensionKind::LongName => {
                self.long_name = Some(trim_nul(&data).to_vec());
            }
            ExtensionKind::LongLink => {}
            ExtensionKind::Pax => {
                let (path, size) = parse_pax(&data)?;
                if path.is_some() {
                    self.pax_path = path;
                }
                if size.is_some() {
                    self.pax_size = size;
                }
            }
            ExtensionKind::GlobalPax => {}
        }
        Ok(())
    }

    /// Feed bytes that have just passed through the reader.
    fn process(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            match &mut self.state {
                State::Header => {
                    let take = (BLOCK_SIZE - self.block.len()).min(data.len());
                    self.block.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.block.len() == BLOCK_SIZE {
                        self.start_entry()?;
                    }
                }
                State::Extension {
                    remaining,
                    padding,
                    data: ext,
                    ..
                } => {
                    let want = (*remaining + *padding).min(data.len() as u64) as usize;
                    let content = (*remaining).min(want as u64) as usize;
                    ext.extend_from_slice(&data[..content]);
                    self.pending.extend_from_slice(&data[..want]);
                    *remaining -= content as u64;
                    *padding -= (want - content) as u64;
                    data = &data[want..];
                    if *remaining == 0 && *padding == 0 {
                        let State::Extension { kind, data: ext, .. } =
                            std::mem::replace(&mut self.state, State::Header)
                        else {
                            unreachable!()
                        };
                        self.finish_extension(kind, ext)?;
                    }
                }
                State::Content {
                    remaining, crc, ..
                } => {
                    let take = (*remaining).min(data.len() as u64) as usize;
                    crc.update(&data[..take]);
                    *remaining -= take as u64;
                    data = &data[take..];
                    if *remaining == 0 {
                        let State::Content {
                            name,
                            size,
                            padding,
                            crc,
                            ..
                        } = std::mem::replace(&mut self.state, State::Header)
                        else {
                            unreachable!()
                        };
                        self.packer.add_entry(Entry::File {
                            name,
                            size,
                            checksum: crc.finalize().to_be_bytes().to_vec(),
                        })?;
                        if padding > 0 {
                            self.state = State::Padding { remaining: padding };
                        }
                    }
                }
                State::Padding { remaining } => {
                    let take = (*remaining).min(data.len() as u64) as usize;
                    self.pending.extend_from_slice(&data[..take]);
                    *remaining -= take as u64;
                    data = &data[take..];
                    if *remaining == 0 {
                        self.state = State::Header;
                    }
                }
                State::Trailer => {
                    self.pending.extend_from_slice(data);
                    data = &[];
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        match &self.state {
            State::Header | State::Trailer | State::Padding { .. } => {}
            State::Extension { .. } | State::Content { .. } => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "tar stream truncated inside an entry",
                ));
            }
        }
        // A partial header block is kept verbatim rather than rejected.
        let partial = std::mem::take(&mut self.block);
        self.pending.extend_from_slice(&partial);
        self.flush_segment()
    }
}

impl<R: Read, P: Packer> Read for InputTarStream<R, P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        let n = loop {
            match self.inner.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            self.finish()?;
        } else {
            self.process(&buf[..n])?;
        }
        Ok(n)
    }
}

fn trim_nul(data: &[u8]) -> &[u8] {
    match data.iter().position(|b| *b == 0) {
        Some(end) => &data[..end],
        None => data,
    }
}

/// Access to the content of files named in tar-split metadata.
pub trait FileGetter {
    /// Open the content of the entry called `name`.
    fn get(&mut self, name: &[u8]) -> io::Result<Box<dyn Read + '_>>;
}

/// Normalise a tar entry name into a relative path, rejecting escapes.
pub(crate) fn relative_entry_path(name: &[u8]) -> io::Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(OsStr::from_bytes(name)).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(invalid(format!(
                    "entry name escapes the layer: {}",
                    String::from_utf8_lossy(name)
                )));
            }
        }
    }
    Ok(out)
}

/// Serves file content from a directory tree.
#[derive(Debug)]
pub struct PathFileGetter {
    root: PathBuf,
}

impl PathFileGetter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PathFileGetter { root: root.into() }
    }
}

impl FileGetter for PathFileGetter {
    fn get(&mut self, name: &[u8]) -> io::Result<Box<dyn Read + '_>> {
        let path = self.root.join(relative_entry_path(name)?);
        Ok(Box::new(std::fs::File::open(path)?))
    }
}

/// Reassemble a tar stream from tar-split metadata and file content.
///
/// Returns the number of bytes written.
pub fn write_output_tar_stream(
    getter: &mut dyn FileGetter,
    unpacker: &mut dyn Unpacker,
    writer: &mut dyn Write,
) -> io::Result<u64> {
    let mut written = 0u64;
    let mut buf = vec![0u8; 32 * 1024];
    while let Some(entry) = unpacker.next_entry()? {
        match entry {
            Entry::Segment(payload) => {
                writer.write_all(&payload)?;
                written += payload.len() as u64;
            }
            Entry::File {
                name,
                size,
                checksum,
            } => {
                if size == 0 {
                    continue;
                }
                let display = String::from_utf8_lossy(&name).into_owned();
                let mut content = getter.get(&name)?.take(size);
                let mut crc = CRC64_ISO.digest();
                let mut copied = 0u64;
                loop {
                    let n = match content.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    };
                    crc.update(&buf[..n]);
                    writer.write_all(&buf[..n])?;
                    copied += n as u64;
                }
                if copied != size {
                    return Err(invalid(format!(
                        "file {display:?} is {copied} bytes, expected {size}"
                    )));
                }
                if crc.finalize().to_be_bytes()[..] != checksum[..] {
                    return Err(invalid(format!(
                        "file integrity checksum failed for {display:?}"
                    )));
                }
                written += size;
            }
        }
    }
    Ok(written)
}

/// Collect every entry from an unpacker; used by tests and diagnostics.
pub fn read_entries(unpacker: &mut dyn Unpacker) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    while let Some(entry) = unpacker.next_entry().map_err(Error::from_stream)? {
        entries.push(entry);
    }
    Ok(entries)
}

impl Entry {
    /// Entry name for file records, lossily decoded.
    pub fn name(&self) -> Option<Cow<'_, str>> {
        match self {
            Entry::File { name, .. } => Some(String::from_utf8_lossy(name)),
            Entry::Segment(_) => None,
        }
    }
}
