//! BGZF: a gzip-compatible block framing that permits random access at
//! block boundaries via a 48-bit file offset + 16-bit within-block offset
//! "virtual offset".
//!
//! Grounded on `htslib::bgzf` (block header layout, EOF marker,
//! stored-block fallback) generalized to support seeking a real file rather
//! than only reading forward through an in-memory buffer.

use crate::error::{Result, VcfError};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Soft max of uncompressed bytes the writer packs per block.
pub const BLOCK_SIZE: usize = 0xff00; // 65280
/// Hard ceiling: a BGZF block (header + compressed data + footer) must fit
/// in an on-disk gzip member addressable by the 16-bit BSIZE field.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// gzip header with the mandatory `BC` extra subfield. Bytes 16-17 are the
/// BSIZE-1 placeholder, filled in per block.
const HEADER_TEMPLATE: [u8; 18] = [
    0x1f, 0x8b, 0x08, 0x04, // magic, method, FLG=FEXTRA
    0, 0, 0, 0, // MTIME
    0, 0xff, // XFL, OS=255 (unknown)
    0x06, 0x00, // XLEN=6
    b'B', b'C', 0x02, 0x00, // BC subfield id, length=2
    0, 0, // BSIZE placeholder
];

/// The canonical, byte-for-byte fixed BGZF EOF marker.
pub const EOF_BLOCK: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0, 0, 0, 0, 0, 0xff, 0x06, 0x00, b'B', b'C', 0x02, 0x00, 0x1b, 0x00,
    0x03, 0x00, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// A 64-bit virtual offset: the upper 48 bits are a byte offset in the BGZF
/// file to the start of a block, the lower 16 bits are a byte offset within
/// that block's uncompressed contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualOffset(u64);

impl VirtualOffset {
    pub const fn new(block_offset: u64, within_block: u16) -> Self {
        VirtualOffset((block_offset << 16) | within_block as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        VirtualOffset(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn block_offset(self) -> u64 {
        self.0 >> 16
    }

    pub const fn within_block(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl From<u64> for VirtualOffset {
    fn from(raw: u64) -> Self {
        VirtualOffset(raw)
    }
}

impl From<VirtualOffset> for u64 {
    fn from(v: VirtualOffset) -> Self {
        v.0
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reads a BGZF stream, tracking virtual offsets and supporting random seeks
/// by virtual offset.
pub struct BgzfReader<R> {
    inner: R,
    /// File offset of the block currently decoded into `block`.
    cur_block_start: u64,
    /// File offset just past the currently-decoded block (where the next
    /// block begins).
    cur_block_end: u64,
    block: Vec<u8>,
    pos: usize,
}

impl<R: Read> BgzfReader<R> {
    pub fn new(inner: R) -> Self {
        BgzfReader { inner, cur_block_start: 0, cur_block_end: 0, block: Vec::new(), pos: 0 }
    }

    /// Current virtual offset.
    pub fn tell(&self) -> VirtualOffset {
        VirtualOffset::new(self.cur_block_start, self.pos as u16)
    }

    fn read_block_at(&mut self, file_offset: u64) -> Result<bool>
    where
        R: Seek,
    {
        self.inner.seek(SeekFrom::Start(file_offset))?;
        self.decode_next_block(file_offset)
    }

    fn decode_next_block(&mut self, file_offset: u64) -> Result<bool> {
        let mut first_byte = [0u8; 1];
        let n = read_partial(&mut self.inner, &mut first_byte)?;
        if n == 0 {
            return Ok(false);
        }
        let mut header = [0u8; 18];
        header[0] = first_byte[0];
        read_exact_mapped(&mut self.inner, &mut header[1..])?;

        if header[0] != 0x1f || header[1] != 0x8b {
            return Err(VcfError::format("not a gzip/BGZF stream (bad magic)"));
        }
        if header[2] != 0x08 {
            return Err(VcfError::format("unsupported gzip compression method"));
        }
        if header[3] & 0x04 == 0 || header[10] != 0x06 || header[12] != b'B' || header[13] != b'C'
        {
            return Err(VcfError::format("missing mandatory BGZF `BC` extra subfield"));
        }

        let bsize = u16::from_le_bytes([header[16], header[17]]) as usize + 1;
        let deflate_len = bsize
            .checked_sub(26)
            .ok_or_else(|| VcfError::format("BGZF block smaller than its own header+footer"))?;

        let mut deflate_data = vec![0u8; deflate_len];
        read_exact_mapped(&mut self.inner, &mut deflate_data)?;

        let mut footer = [0u8; 8];
        read_exact_mapped(&mut self.inner, &mut footer)?;
        let expected_crc = u32::from_le_bytes(footer[0..4].try_into().unwrap());
        let expected_isize = u32::from_le_bytes(footer[4..8].try_into().unwrap()) as usize;

        self.block.clear();
        self.block.reserve(expected_isize);
        inflate_raw(&deflate_data, &mut self.block)?;

        if self.block.len() != expected_isize {
            return Err(VcfError::format(format!(
                "BGZF ISIZE mismatch: decompressed {} bytes, header says {}",
                self.block.len(),
                expected_isize
            )));
        }
        let actual_crc = crc32fast::hash(&self.block);
        if actual_crc != expected_crc {
            return Err(VcfError::format("BGZF CRC32 mismatch"));
        }

        self.cur_block_start = file_offset;
        self.cur_block_end = file_offset + bsize as u64;
        self.pos = 0;
        Ok(!self.block.is_empty())
    }

    /// Advance past the current (possibly empty) block, loading the next one.
    fn advance_block(&mut self) -> Result<bool> {
        self.decode_next_block(self.cur_block_end)
    }

    /// Seek to a virtual offset (requires a seekable inner reader).
    pub fn seek(&mut self, voff: VirtualOffset) -> Result<()>
    where
        R: Seek,
    {
        if voff.block_offset() != self.cur_block_start || self.block.is_empty() {
            self.read_block_at(voff.block_offset())?;
        }
        self.pos = voff.within_block() as usize;
        Ok(())
    }

    /// Read up to `buf.len()` bytes. Returns 0 on clean EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.block.len() {
            if !self.advance_block()? {
                return Ok(0);
            }
        }
        let avail = &self.block[self.pos..];
        let take = avail.len().min(buf.len());
        buf[..take].copy_from_slice(&avail[..take]);
        self.pos += take;
        Ok(take)
    }

    /// Read bytes until `delim` (inclusive) is found or EOF, appending to
    /// `buf`. Returns the number of bytes appended.
    pub fn read_until(&mut self, delim: u8, buf: &mut Vec<u8>) -> Result<usize> {
        let mut total = 0usize;
        loop {
            if self.pos >= self.block.len() && !self.advance_block()? {
                return Ok(total);
            }
            let slice = &self.block[self.pos..];
            match slice.iter().position(|&b| b == delim) {
                Some(i) => {
                    buf.extend_from_slice(&slice[..=i]);
                    total += i + 1;
                    self.pos += i + 1;
                    return Ok(total);
                }
                None => {
                    buf.extend_from_slice(slice);
                    total += slice.len();
                    self.pos = self.block.len();
                }
            }
        }
    }

    /// Read one line (through and including `\n`) into `buf`. Returns
    /// `(bytes_read, virtual_offset_of_line_start)`. `(0, tell())` on EOF.
    pub fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<(usize, VirtualOffset)> {
        if self.pos >= self.block.len() && !self.advance_block()? {
            return Ok((0, self.tell()));
        }
        let voff_start = self.tell();
        let n = self.read_until(b'\n', buf)?;
        Ok((n, voff_start))
    }
}

impl<R: Read> Read for BgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BgzfReader::read(self, buf).map_err(to_io_error)
    }
}

fn to_io_error(e: VcfError) -> io::Error {
    match e {
        VcfError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

fn read_partial<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        match r.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn read_exact_mapped<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(VcfError::format("unexpected EOF inside a BGZF block"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn inflate_raw(input: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let mut decompress = Decompress::new(false);
    let before = out.len();
    let mut scratch = vec![0u8; (input.len() * 4).max(4096)];
    loop {
        let in_consumed_before = decompress.total_in() as usize;
        let out_produced_before = decompress.total_out() as usize;
        let status = decompress
            .decompress(&input[in_consumed_before..], &mut scratch, FlushDecompress::Finish)
            .map_err(|e| VcfError::format(format!("inflate failed: {e}")))?;
        let newly_produced = decompress.total_out() as usize - out_produced_before;
        out.extend_from_slice(&scratch[..newly_produced]);
        match status {
            flate2::Status::StreamEnd => {
                debug_assert_eq!(out.len() - before, decompress.total_out() as usize);
                return Ok(());
            }
            flate2::Status::Ok | flate2::Status::BufError => {
                if newly_produced == 0 && decompress.total_in() as usize == in_consumed_before {
                    return Err(VcfError::format("inflate made no progress (truncated stream?)"));
                }
                continue;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Writes a BGZF stream, buffering uncompressed data up to [`BLOCK_SIZE`]
/// before flushing a block.
pub struct BgzfWriter<W: Write> {
    inner: Option<W>,
    buf: Vec<u8>,
    level: Compression,
    /// Bytes written to `inner` so far (start-of-next-block file offset).
    block_address: u64,
}

impl<W: Write> BgzfWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_compression(inner, Compression::default())
    }

    pub fn with_compression(inner: W, level: Compression) -> Self {
        BgzfWriter { inner: Some(inner), buf: Vec::with_capacity(BLOCK_SIZE), level, block_address: 0 }
    }

    fn inner_mut(&mut self) -> io::Result<&mut W> {
        self.inner.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::Other, "write to a closed BgzfWriter"))
    }

    /// Virtual offset of the start of the next (unwritten) block. Between
    /// flushes the within-block component is always 0 — callers who need a
    /// mid-block offset should track it from `write`'s return value context
    /// (the VCF layer calls this right after a full record+newline write,
    /// which is always block-aligned from the writer's perspective only once
    /// flushed; intra-block offsets come from tracking `self.buf.len()`).
    pub fn tell(&self) -> VirtualOffset {
        VirtualOffset::new(self.block_address, self.buf.len() as u16)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let crc = crc32fast::hash(&self.buf);
        let isize = self.buf.len() as u32;

        let compressed = {
            let mut enc = DeflateEncoder::new(Vec::new(), self.level);
            enc.write_all(&self.buf)?;
            enc.finish()?
        };

        let compressed_data: Vec<u8> = if compressed.len() + 26 > MAX_BLOCK_SIZE {
            stored_block(&self.buf)
        } else {
            compressed
        };

        let total = compressed_data.len() + 26;
        debug_assert!(total <= MAX_BLOCK_SIZE);

        let mut block = Vec::with_capacity(total);
        block.extend_from_slice(&HEADER_TEMPLATE);
        let bsize = (total - 1) as u16;
        block[16..18].copy_from_slice(&bsize.to_le_bytes());
        block.extend_from_slice(&compressed_data);
        block.extend_from_slice(&crc.to_le_bytes());
        block.extend_from_slice(&isize.to_le_bytes());

        self.inner_mut()?.write_all(&block)?;
        self.block_address += block.len() as u64;
        self.buf.clear();
        log::debug!("bgzf: flushed block of {isize} uncompressed bytes at offset {}", self.block_address - block.len() as u64);
        Ok(())
    }

    /// Flush any partial block without writing the EOF marker.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_block()?;
        self.inner_mut()?.flush()?;
        Ok(())
    }

    /// Flush remaining data, append the EOF block, and return the inner writer.
    pub fn close(mut self) -> Result<W> {
        self.flush_block()?;
        self.inner_mut()?.write_all(&EOF_BLOCK)?;
        self.block_address += EOF_BLOCK.len() as u64;
        self.inner.take().ok_or_else(|| VcfError::usage("BgzfWriter already closed"))
    }
}

impl<W: Write> Write for BgzfWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.inner.is_none() {
            return Err(io::Error::new(io::ErrorKind::Other, "write to a closed BgzfWriter"));
        }
        let mut written = 0;
        let mut remaining = data;
        while !remaining.is_empty() {
            let space = BLOCK_SIZE - self.buf.len();
            let take = remaining.len().min(space);
            self.buf.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            written += take;
            if self.buf.len() >= BLOCK_SIZE {
                self.flush_block().map_err(to_io_error)?;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        BgzfWriter::flush(self).map_err(to_io_error)
    }
}

fn stored_block(data: &[u8]) -> Vec<u8> {
    let len = data.len() as u16;
    let mut stored = Vec::with_capacity(5 + data.len());
    stored.push(0x01); // BFINAL=1, BTYPE=00 (stored)
    stored.extend_from_slice(&len.to_le_bytes());
    stored.extend_from_slice(&(!len).to_le_bytes());
    stored.extend_from_slice(data);
    stored
}

/// Compress all bytes from `input` into BGZF format, writing to `output`.
pub fn compress_all<R: Read, W: Write>(mut input: R, output: W) -> Result<()> {
    let mut writer = BgzfWriter::new(output);
    let mut buf = vec![0u8; 65536];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
    }
    writer.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_empty() {
        let mut out = Vec::new();
        compress_all(Cursor::new(b"" as &[u8]), &mut out).unwrap();
        let mut reader = BgzfReader::new(Cursor::new(out));
        let mut result = Vec::new();
        reader.read_to_end(&mut result).unwrap();
        assert_eq!(result, b"");
    }

    #[test]
    fn round_trip_small() {
        let data = b"##fileformat=VCFv4.2\nchr1\t100\t.\tA\tG\t.\tPASS\t.\n";
        let mut out = Vec::new();
        compress_all(Cursor::new(&data[..]), &mut out).unwrap();
        assert_eq!(&out[0..4], [0x1f, 0x8b, 0x08, 0x04]);
        assert!(out.ends_with(&EOF_BLOCK));

        let mut reader = BgzfReader::new(Cursor::new(out));
        let mut result = Vec::new();
        reader.read_to_end(&mut result).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn round_trip_multi_block() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        compress_all(Cursor::new(&data[..]), &mut out).unwrap();
        let mut reader = BgzfReader::new(Cursor::new(out));
        let mut result = Vec::new();
        reader.read_to_end(&mut result).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn seek_then_read_matches_sequential() {
        let data = b"line one\nline two\nline three\n";
        let mut out = Vec::new();
        compress_all(Cursor::new(&data[..]), &mut out).unwrap();

        let mut seq = BgzfReader::new(Cursor::new(out.clone()));
        let mut line1 = Vec::new();
        seq.read_line(&mut line1).unwrap();
        let voff_line2 = seq.tell();
        let mut line2_seq = Vec::new();
        seq.read_line(&mut line2_seq).unwrap();

        let mut random = BgzfReader::new(Cursor::new(out));
        random.seek(voff_line2).unwrap();
        let mut line2_random = Vec::new();
        random.read_line(&mut line2_random).unwrap();

        assert_eq!(line2_seq, line2_random);
        assert_eq!(line2_random, b"line two\n");
    }

    #[test]
    fn rejects_bad_magic() {
        let garbage = vec![0u8; 32];
        let mut reader = BgzfReader::new(Cursor::new(garbage));
        let mut buf = [0u8; 4];
        let err = reader.read(&mut buf).unwrap_err();
        assert!(matches!(err, VcfError::Format { .. }));
    }
}
