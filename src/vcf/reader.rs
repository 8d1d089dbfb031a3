//! Sequential and range-query VCF reading.
//!
//! Grounded on `original_source/vcflib/vcf.py` (`VCF.open`/`load_header`/
//! `__next__`, `VCFReader.first`/`__next__`).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bgzf::{BgzfReader, VirtualOffset};
use crate::error::{Result, VcfError};

use super::header::HeaderCatalog;
use super::record::{self, Variant};
use super::Index;

/// A plain (non-BGZF) byte-oriented source, tracking its own read position
/// the way [`BgzfReader`] tracks a virtual offset.
struct PlainSource {
    file: File,
    buf: Vec<u8>,
    buf_start: u64,
    pos_in_buf: usize,
}

impl PlainSource {
    fn new(file: File) -> Self {
        PlainSource { file, buf: Vec::new(), buf_start: 0, pos_in_buf: 0 }
    }

    fn tell(&self) -> u64 {
        self.buf_start + self.pos_in_buf as u64
    }

    fn seek(&mut self, off: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(off))?;
        self.buf.clear();
        self.buf_start = off;
        self.pos_in_buf = 0;
        Ok(())
    }

    fn fill(&mut self) -> Result<bool> {
        if self.pos_in_buf < self.buf.len() {
            return Ok(true);
        }
        self.buf_start += self.buf.len() as u64;
        let mut chunk = vec![0u8; 65536];
        let n = loop {
            match self.file.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        chunk.truncate(n);
        self.buf = chunk;
        self.pos_in_buf = 0;
        Ok(n > 0)
    }

    fn read_line(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let mut total = 0usize;
        loop {
            if self.pos_in_buf >= self.buf.len() && !self.fill()? {
                return Ok(total);
            }
            let slice = &self.buf[self.pos_in_buf..];
            match slice.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    out.extend_from_slice(&slice[..=i]);
                    total += i + 1;
                    self.pos_in_buf += i + 1;
                    return Ok(total);
                }
                None => {
                    let n = slice.len();
                    out.extend_from_slice(slice);
                    total += n;
                    self.pos_in_buf = self.buf.len();
                }
            }
        }
    }
}

enum Source {
    Bgzf(BgzfReader<File>),
    Plain(PlainSource),
}

impl Source {
    fn tell(&self) -> u64 {
        match self {
            Source::Bgzf(r) => r.tell().raw(),
            Source::Plain(p) => p.tell(),
        }
    }

    fn seek(&mut self, off: u64) -> Result<()> {
        match self {
            Source::Bgzf(r) => r.seek(VirtualOffset::from_raw(off)),
            Source::Plain(p) => p.seek(off),
        }
    }

    fn read_line(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        match self {
            Source::Bgzf(r) => r.read_line(buf).map(|(n, _)| n),
            Source::Plain(p) => p.read_line(buf),
        }
    }
}

/// An open VCF data file: header already parsed, positioned at the first
/// data record, with its sidecar index loaded if one exists.
pub struct VcfReader {
    path: PathBuf,
    source: Source,
    header: Arc<HeaderCatalog>,
    pub(crate) index: Option<Index>,
    init_offset: u64,
    pub(crate) is_gz: bool,
}

impl VcfReader {
    /// Open `path` (`.gz` dispatches to BGZF/binning-index, anything else to
    /// plain-text/tribble-index), parse its header, and position at the
    /// first data line (`VCF.open` + `load_header`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.to_string_lossy() == "-" {
            return Err(VcfError::usage("input VCF cannot be stdin"));
        }
        let is_gz = path.to_string_lossy().ends_with(".gz");
        let file = File::open(path)?;
        let mut source = if is_gz { Source::Bgzf(BgzfReader::new(file)) } else { Source::Plain(PlainSource::new(file)) };

        let mut header_lines = Vec::new();
        let mut offset = 0u64;
        let mut line_buf = Vec::new();
        loop {
            line_buf.clear();
            let n = source.read_line(&mut line_buf)?;
            if n == 0 {
                break;
            }
            let line = decode_line(&line_buf)?;
            if !line.starts_with('#') {
                break;
            }
            header_lines.push(line);
            offset = source.tell();
        }
        source.seek(offset)?;

        let header = HeaderCatalog::parse(header_lines)?;
        // A missing sidecar only matters for range queries; sequential
        // iteration never needs one, so we don't hard-fail `open` on it.
        let index = Index::open_for_read(path, is_gz)
            .inspect_err(|e| log::warn!("no usable sidecar index for {}: {e}", path.display()))
            .ok();

        Ok(VcfReader { path: path.to_path_buf(), source, header: Arc::new(header), index, init_offset: offset, is_gz })
    }

    pub fn header(&self) -> &HeaderCatalog {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reposition to the first data record, so the reader can be iterated
    /// again from the start (`VCF.__iter__`).
    pub fn rewind(&mut self) -> Result<()> {
        self.source.seek(self.init_offset)
    }

    /// Query `[start, end)` on `contig`, requiring a loaded sidecar index.
    pub fn range(mut self, contig: &str, start: u64, end: u64) -> Result<RangeIter> {
        let ranges = {
            let index = self
                .index
                .as_ref()
                .ok_or_else(|| VcfError::usage("no sidecar index loaded; range queries require one"))?;
            index.query(contig, start, end)
        };
        Ok(RangeIter { reader: self, chrom: contig.to_string(), start, end, ranges: Some(ranges) })
    }

    /// Open a fresh, independent handle onto the same file and immediately
    /// narrow it to `[start, end)` on `contig` — the per-shard worker's
    /// "owns its own file handle and index view" (used by the sharder).
    pub(crate) fn project_range(&self, contig: &str, start: u64, end: u64) -> Result<RangeIter> {
        VcfReader::open(&self.path)?.range(contig, start, end)
    }
}

impl Iterator for VcfReader {
    type Item = Result<Variant>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut buf = Vec::new();
            match self.source.read_line(&mut buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e)),
            }
            let line = match decode_line(&buf) {
                Ok(l) => l,
                Err(e) => return Some(Err(e)),
            };
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            return Some(record::parse(&self.header, &line));
        }
    }
}

fn decode_line(buf: &[u8]) -> Result<String> {
    let s = std::str::from_utf8(buf).map_err(|_| VcfError::format("non-UTF8 VCF line"))?;
    Ok(s.trim_end_matches(['\r', '\n']).to_string())
}

/// Iterator over the records overlapping a `(chrom, start, end)` window,
/// following the index's candidate byte ranges then filtering exactly
/// (`VCFReader.first`/`__next__`).
pub struct RangeIter {
    reader: VcfReader,
    chrom: String,
    start: u64,
    end: u64,
    /// `Some` until the first matching record is found (still working
    /// through `ranges`); `None` once positioned, meaning subsequent
    /// `next()` calls just keep reading sequentially until out of window.
    ranges: Option<Vec<(u64, u64)>>,
}

impl RangeIter {
    fn first(&mut self, ranges: Vec<(u64, u64)>) -> Option<Result<Variant>> {
        let mut i = 0;
        while i < ranges.len() {
            let (rstart, rend) = ranges[i];
            if let Err(e) = self.reader.source.seek(rstart) {
                return Some(Err(e));
            }
            loop {
                let v = match self.reader.next() {
                    None => {
                        i += 1;
                        break;
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    Some(Ok(v)) => v,
                };
                if v.chrom != self.chrom || v.pos >= self.end {
                    // Data is coordinate-sorted and ranges are ascending:
                    // once we're past the window there is nothing left in
                    // any remaining range either.
                    return None;
                }
                if v.end <= self.start {
                    if self.reader.source.tell() >= rend {
                        i += 1;
                        break;
                    }
                    continue;
                }
                self.ranges = None;
                return Some(Ok(v));
            }
        }
        None
    }
}

impl Iterator for RangeIter {
    type Item = Result<Variant>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(ranges) = self.ranges.take() {
            return self.first(ranges);
        }
        match self.reader.next() {
            None => None,
            Some(Ok(v)) => {
                if v.chrom != self.chrom || v.pos >= self.end {
                    None
                } else {
                    Some(Ok(v))
                }
            }
            Some(Err(e)) => Some(Err(e)),
        }
    }
}
