//! IDX (Tribble) index for plain-text data: a fixed-width linear index or
//! an interval-tree index, selected by `VCF_INDEX_TYPE` via [`crate::config`].
//!
//! Every byte layout and algorithm here is ported from
//! `original_source/vcflib/tribble.py` (`LinearIndex`, `IntervalTree`,
//! `IntervalTreeIndex`, `TribbleIndex`), kept in the same
//! struct-plus-`encode`/`decode` idiom used in `binning.rs`.

use crate::error::{Result, VcfError};
use indexmap::IndexMap;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::path::{Path, PathBuf};

pub const MAGIC: u32 = 0x5844_4954;
pub const VERSION: i32 = 3;

pub const DEFAULT_INDEX_BIN_WIDTH: u32 = 8000;
pub const GVCF_INDEX_BIN_WIDTH: u32 = 128_000;
pub const MAX_FEATURES_PER_BIN: u32 = 100;
pub const MAX_FEATURES_PER_INTERVAL: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Linear = 1,
    IntervalTree = 2,
}

/// File-level metadata carried ahead of the per-contig index bodies.
#[derive(Debug, Clone)]
pub struct TribbleHeader {
    pub filename: String,
    pub filesize: u64,
    pub timestamp: u64,
    pub md5: Vec<u8>,
    pub flags: i32,
    pub properties: Vec<(String, String)>,
}

impl TribbleHeader {
    fn new(filename: String) -> Self {
        TribbleHeader { filename, filesize: 0, timestamp: 0, md5: Vec::new(), flags: 0, properties: Vec::new() }
    }
}

#[derive(Debug, Clone)]
struct LinearIndex {
    chrom: String,
    end: u64,
    width: u32,
    longest: u32,
    count: u32,
    blocks: Vec<u64>,
}

impl LinearIndex {
    fn new(chrom: String, off: u64, width: u32) -> Self {
        LinearIndex { chrom, end: off, width, longest: 0, count: 0, blocks: Vec::new() }
    }

    fn add(&mut self, s: u64, e: u64, off: u64) {
        let bin = (s / self.width as u64) as usize;
        if bin >= self.blocks.len() {
            self.blocks.resize(bin + 1, self.end);
        }
        self.longest = self.longest.max((e - s) as u32);
        self.count += 1;
        self.end = off;
    }

    fn done(&mut self, density: u32) {
        self.blocks.push(self.end);
        self.optimize(density);
    }

    fn optimize(&mut self, density: u32) {
        if self.blocks.len() < 2 || self.count == 0 {
            return;
        }
        let maxsize = (1..self.blocks.len()).map(|i| self.blocks[i] - self.blocks[i - 1]).max().unwrap_or(0);
        if maxsize == 0 {
            return;
        }
        let fullsize = self.blocks[self.blocks.len() - 1] - self.blocks[0];
        let scale = (density as u64 * fullsize) / (self.count as u64 * maxsize);
        if scale > 1 {
            let bins = ((self.blocks.len() - 1) as u64 + scale - 1) / scale;
            let new_blocks: Vec<u64> = (0..bins).map(|i| self.blocks[(i * scale) as usize]).collect();
            self.blocks = new_blocks;
            self.width = (self.width as u64 * scale) as u32;
        }
    }

    fn query(&self, s: u64) -> Vec<(u64, u64)> {
        let s = s.saturating_sub(self.longest as u64);
        let i = (s / self.width as u64) as usize;
        if i >= self.blocks.len() {
            return Vec::new();
        }
        vec![(self.blocks[i], *self.blocks.last().unwrap())]
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.chrom.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&((self.blocks.len() - 1) as u32).to_le_bytes());
        out.extend_from_slice(&self.longest.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        for &b in &self.blocks {
            out.extend_from_slice(&b.to_le_bytes());
        }
        out
    }

    fn decode(data: &[u8], off: &mut usize) -> Result<Self> {
        let chrom = read_cstr(data, off)?;
        let width = read_u32(data, off)?;
        let bins = read_u32(data, off)?;
        let longest = read_u32(data, off)?;
        let _reserved = read_u32(data, off)?;
        let count = read_u32(data, off)?;
        let mut blocks = Vec::with_capacity(bins as usize + 1);
        for _ in 0..=bins {
            blocks.push(read_u64(data, off)?);
        }
        Ok(LinearIndex { chrom, end: 0, width, longest, count, blocks })
    }
}

type IntvlData = Option<(u64, u64)>;

#[derive(Default)]
struct IntervalTree {
    intvls: Vec<(i64, i64, IntvlData)>,
    splits: Vec<i64>,
    values: Vec<Vec<usize>>,
}

impl IntervalTree {
    fn new() -> Self {
        IntervalTree { intvls: vec![(i64::from(u32::MAX), i64::from(u32::MAX), None)], splits: Vec::new(), values: Vec::new() }
    }

    fn insert(&mut self, s: i64, e: i64, d: IntvlData) {
        self.intvls.push((s, e, d));
    }

    /// Sweep-line split-point construction, identical in shape to the
    /// bin-merge pass in `binning::optimize`: sort intervals, then for each
    /// maximal run of overlap emit one split band listing every interval
    /// alive across it.
    fn update(&mut self) {
        self.intvls.sort();
        self.splits.clear();
        self.values.clear();
        let mut cur: i64 = 0;
        let mut heap: BinaryHeap<Reverse<(i64, usize)>> = BinaryHeap::new();
        for (i, v) in self.intvls.iter().enumerate() {
            while let Some(&Reverse((end, _))) = heap.peek() {
                if end <= v.0 {
                    self.splits.push(cur);
                    self.splits.push(end);
                    self.values.push(heap.iter().map(|Reverse((_, j))| *j).collect());
                    heap.pop();
                    cur = end;
                } else {
                    break;
                }
            }
            if !heap.is_empty() && cur < v.0 {
                self.splits.push(cur);
                self.splits.push(v.0);
                self.values.push(heap.iter().map(|Reverse((_, j))| *j).collect());
            }
            cur = v.0;
            heap.push(Reverse((v.1, i)));
        }
    }

    fn query(&self, s: i64, e: i64) -> Vec<IntvlData> {
        if self.splits.is_empty() {
            return Vec::new();
        }
        let mut i = bisect_right(&self.splits, s) / 2;
        let mut seen = HashSet::new();
        while i < self.values.len() {
            if e <= self.splits[i * 2] {
                break;
            }
            seen.extend(self.values[i].iter().copied());
            i += 1;
        }
        seen.into_iter().map(|idx| self.intvls[idx].2).collect()
    }
}

fn bisect_right(sorted: &[i64], x: i64) -> usize {
    sorted.partition_point(|&v| v <= x)
}

struct IntervalTreeIndex {
    chrom: String,
    tree: IntervalTree,
    // [sloc, eloc, soff, eoff, count]
    curr: [i64; 5],
}

impl IntervalTreeIndex {
    fn new(chrom: String, off: u64) -> Self {
        IntervalTreeIndex { chrom, tree: IntervalTree::new(), curr: [0, 0, off as i64, off as i64, 0] }
    }

    fn add(&mut self, s: u64, e: u64, off: u64, density: u32) {
        if self.curr[4] == density as i64 {
            self.tree.insert(self.curr[0], self.curr[1], Some((self.curr[2] as u64, self.curr[3] as u64)));
            self.curr[0] = s as i64;
            self.curr[2] = self.curr[3];
            self.curr[4] = 0;
        }
        self.curr[1] = e as i64;
        self.curr[3] = off as i64;
        self.curr[4] += 1;
    }

    fn done(&mut self) {
        if self.curr[4] > 0 {
            self.tree.insert(self.curr[0], self.curr[1], Some((self.curr[2] as u64, self.curr[3] as u64)));
        }
        self.tree.update();
    }

    fn query(&self, s: u64, e: u64) -> Vec<(u64, u64)> {
        let hits: Vec<(u64, u64)> = self.tree.query(s as i64, e as i64).into_iter().flatten().collect();
        crate::index::merge_ranges(hits, 0)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.chrom.as_bytes());
        out.push(0);
        out.extend_from_slice(&((self.tree.intvls.len() - 1) as i32).to_le_bytes());
        for &(sloc, eloc, d) in self.tree.intvls.iter() {
            let (boff, size) = match d {
                None => continue,
                Some((boff, eoff)) => (boff, eoff - boff),
            };
            out.extend_from_slice(&((sloc + 1) as i32).to_le_bytes());
            out.extend_from_slice(&(eloc as i32).to_le_bytes());
            out.extend_from_slice(&boff.to_le_bytes());
            out.extend_from_slice(&(size as i32).to_le_bytes());
        }
        out
    }

    fn decode(data: &[u8], off: &mut usize) -> Result<Self> {
        let chrom = read_cstr(data, off)?;
        let nitvs = read_i32(data, off)?;
        let mut tree = IntervalTree::new();
        for _ in 0..nitvs {
            let sloc = read_i32(data, off)? as i64;
            let eloc = read_i32(data, off)? as i64;
            let boff = read_u64(data, off)?;
            let size = read_i32(data, off)? as u64;
            tree.insert(sloc - 1, eloc, Some((boff, boff + size)));
        }
        tree.update();
        Ok(IntervalTreeIndex { chrom, tree, curr: [0, 0, 0, 0, 0] })
    }
}

enum SeqIndex {
    Linear(LinearIndex),
    Tree(IntervalTreeIndex),
}

impl SeqIndex {
    fn chrom(&self) -> &str {
        match self {
            SeqIndex::Linear(l) => &l.chrom,
            SeqIndex::Tree(t) => &t.chrom,
        }
    }
}

/// A loaded-or-being-built `.idx` (Tribble) index.
pub struct TribbleIndex {
    path: PathBuf,
    kind: IndexKind,
    header: TribbleHeader,
    indices: IndexMap<String, SeqIndex>,
    current: Option<String>,
    pos: u64,
    end: u64,
}

impl TribbleIndex {
    /// Start building a fresh `.idx`. `path` must end in `.idx`.
    pub fn create(path: impl Into<PathBuf>, kind: IndexKind) -> Result<Self> {
        let path = path.into();
        let stem = require_idx_suffix(&path)?;
        Ok(TribbleIndex {
            header: TribbleHeader::new(stem),
            path,
            kind,
            indices: IndexMap::new(),
            current: None,
            pos: 0,
            end: 0,
        })
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn header(&self) -> &TribbleHeader {
        &self.header
    }

    /// Append one record in (contig, start) non-decreasing order. Pass
    /// `contig = None` to flush the final contig before [`Self::save`].
    pub fn add(&mut self, contig: Option<&str>, s: u64, e: u64, off: u64) -> Result<()> {
        if let Some(cur) = self.current.clone() {
            if contig != Some(cur.as_str()) {
                self.finish_current(&cur);
                self.current = None;
            }
        }
        if self.current.is_none() {
            if let Some(c) = contig {
                let seq = match self.kind {
                    IndexKind::Linear => {
                        let width = if self.path.to_string_lossy().ends_with(".g.vcf.idx") {
                            GVCF_INDEX_BIN_WIDTH
                        } else {
                            DEFAULT_INDEX_BIN_WIDTH
                        };
                        SeqIndex::Linear(LinearIndex::new(c.to_string(), self.end, width))
                    }
                    IndexKind::IntervalTree => SeqIndex::Tree(IntervalTreeIndex::new(c.to_string(), self.end)),
                };
                self.indices.insert(c.to_string(), seq);
                self.current = Some(c.to_string());
                self.pos = 0;
            }
        }
        if let Some(cur) = self.current.clone() {
            if contig != Some(cur.as_str()) {
                return Err(VcfError::usage("add() called with a mismatched contig"));
            }
            if s < self.pos {
                return Err(VcfError::usage(format!("add() called out of order: start {s} < last start {}", self.pos)));
            }
            match self.indices.get_mut(&cur).expect("current contig exists") {
                SeqIndex::Linear(l) => l.add(s, e, off),
                SeqIndex::Tree(t) => t.add(s, e, off, MAX_FEATURES_PER_INTERVAL),
            }
            self.pos = s;
        }
        self.end = off;
        Ok(())
    }

    fn finish_current(&mut self, chrom: &str) {
        match self.indices.get_mut(chrom).expect("current contig exists") {
            SeqIndex::Linear(l) => l.done(MAX_FEATURES_PER_BIN),
            SeqIndex::Tree(t) => t.done(),
        }
    }

    pub fn query(&self, contig: &str, s: u64, e: u64) -> Vec<(u64, u64)> {
        match self.indices.get(contig) {
            None => Vec::new(),
            Some(SeqIndex::Linear(l)) => l.query(s),
            Some(SeqIndex::Tree(t)) => t.query(s, e),
        }
    }

    /// Flush the final contig and write the `.idx` file.
    pub fn save(mut self) -> Result<()> {
        self.add(None, 0, 0, self.end)?;
        self.header.filesize = self.end;
        self.header.timestamp = current_unix_time();

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&(self.kind as i32).to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(self.header.filename.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.header.filesize.to_le_bytes());
        out.extend_from_slice(&self.header.timestamp.to_le_bytes());
        out.extend_from_slice(&self.header.md5);
        out.push(0);
        out.extend_from_slice(&self.header.flags.to_le_bytes());
        out.extend_from_slice(&(self.header.properties.len() as i32).to_le_bytes());
        for (k, v) in &self.header.properties {
            out.extend_from_slice(k.as_bytes());
            out.push(0);
            out.extend_from_slice(v.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(&(self.indices.len() as i32).to_le_bytes());
        for seq in self.indices.values() {
            match seq {
                SeqIndex::Linear(l) => out.extend_from_slice(&l.encode()),
                SeqIndex::Tree(t) => out.extend_from_slice(&t.encode()),
            }
        }
        std::fs::write(&self.path, out)?;
        log::debug!("tribble index: wrote {}", self.path.display());
        Ok(())
    }

    /// Load an existing `.idx` file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        require_idx_suffix(&path)?;
        let data = std::fs::read(&path)?;
        let mut off = 0usize;

        let magic = read_u32(&data, &mut off)?;
        let type_raw = read_i32(&data, &mut off)?;
        let version = read_i32(&data, &mut off)?;
        if magic != MAGIC || version != VERSION {
            return Err(VcfError::format("tribble index magic/version mismatch"));
        }
        let kind = match type_raw {
            1 => IndexKind::Linear,
            2 => IndexKind::IntervalTree,
            other => return Err(VcfError::format(format!("unknown tribble index type {other}"))),
        };

        let filename = read_cstr(&data, &mut off)?;
        let filesize = read_u64(&data, &mut off)?;
        let timestamp = read_u64(&data, &mut off)?;
        let md5 = read_cstr_bytes(&data, &mut off)?;
        let flags = read_i32(&data, &mut off)?;
        let nprop = read_i32(&data, &mut off)?;
        let mut properties = Vec::with_capacity(nprop.max(0) as usize);
        for _ in 0..nprop {
            let k = read_cstr(&data, &mut off)?;
            let v = read_cstr(&data, &mut off)?;
            properties.push((k, v));
        }

        let nchrs = read_i32(&data, &mut off)?;
        let mut indices = IndexMap::new();
        for _ in 0..nchrs {
            let seq = match kind {
                IndexKind::Linear => SeqIndex::Linear(LinearIndex::decode(&data, &mut off)?),
                IndexKind::IntervalTree => SeqIndex::Tree(IntervalTreeIndex::decode(&data, &mut off)?),
            };
            indices.insert(seq.chrom().to_string(), seq);
        }

        Ok(TribbleIndex {
            path,
            kind,
            header: TribbleHeader { filename, filesize, timestamp, md5, flags, properties },
            indices,
            current: None,
            pos: 0,
            end: 0,
        })
    }
}

fn require_idx_suffix(path: &Path) -> Result<String> {
    let s = path.to_string_lossy();
    if !s.ends_with(".idx") {
        return Err(VcfError::usage("tribble index file name must end in .idx"));
    }
    Ok(s[..s.len() - 4].to_string())
}

fn current_unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_u32(data: &[u8], off: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(read_bytes(data, off, 4)?.try_into().unwrap()))
}

fn read_i32(data: &[u8], off: &mut usize) -> Result<i32> {
    Ok(i32::from_le_bytes(read_bytes(data, off, 4)?.try_into().unwrap()))
}

fn read_u64(data: &[u8], off: &mut usize) -> Result<u64> {
    Ok(u64::from_le_bytes(read_bytes(data, off, 8)?.try_into().unwrap()))
}

fn read_bytes(data: &[u8], off: &mut usize, n: usize) -> Result<Vec<u8>> {
    if *off + n > data.len() {
        return Err(VcfError::format("tribble index truncated"));
    }
    let slice = data[*off..*off + n].to_vec();
    *off += n;
    Ok(slice)
}

fn read_cstr_bytes(data: &[u8], off: &mut usize) -> Result<Vec<u8>> {
    let rest = data.get(*off..).ok_or_else(|| VcfError::format("tribble index truncated"))?;
    let nul = rest.iter().position(|&b| b == 0).ok_or_else(|| VcfError::format("unterminated string in tribble index"))?;
    let bytes = rest[..nul].to_vec();
    *off += nul + 1;
    Ok(bytes)
}

fn read_cstr(data: &[u8], off: &mut usize) -> Result<String> {
    let bytes = read_cstr_bytes(data, off)?;
    String::from_utf8(bytes).map_err(|_| VcfError::format("non-UTF8 string in tribble index"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn linear_index_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.vcf.idx");

        let mut idx = TribbleIndex::create(&path, IndexKind::Linear).unwrap();
        idx.add(Some("chr1"), 100, 200, 500).unwrap();
        idx.add(Some("chr1"), 9000, 9100, 1500).unwrap();
        idx.add(Some("chr2"), 50, 60, 2000).unwrap();
        idx.save().unwrap();

        let loaded = TribbleIndex::open(&path).unwrap();
        assert_eq!(loaded.kind(), IndexKind::Linear);
        let hits = loaded.query("chr1", 0, 10_000);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|&(b, _)| b <= 1500));
    }

    #[test]
    fn interval_tree_index_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.vcf.idx");

        let mut idx = TribbleIndex::create(&path, IndexKind::IntervalTree).unwrap();
        idx.add(Some("chr1"), 100, 200, 500).unwrap();
        idx.add(Some("chr1"), 300, 400, 900).unwrap();
        idx.add(Some("chr1"), 9000, 9100, 1500).unwrap();
        idx.save().unwrap();

        let loaded = TribbleIndex::open(&path).unwrap();
        assert_eq!(loaded.kind(), IndexKind::IntervalTree);
        let hits = loaded.query("chr1", 50, 450);
        assert!(hits.iter().any(|&(b, e)| b <= 500 && e >= 500));
    }

    #[test]
    fn rejects_non_idx_suffix() {
        let err = TribbleIndex::create("/tmp/whatever.vcf", IndexKind::Linear).unwrap_err();
        assert!(matches!(err, VcfError::Usage { .. }));
    }

    #[test]
    fn missing_contig_query_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.vcf.idx");
        let mut idx = TribbleIndex::create(&path, IndexKind::Linear).unwrap();
        idx.add(Some("chr1"), 0, 10, 100).unwrap();
        idx.save().unwrap();

        let loaded = TribbleIndex::open(&path).unwrap();
        assert!(loaded.query("chrX", 0, 10).is_empty());
    }

    #[test]
    fn out_of_order_add_is_rejected() {
        let mut idx = TribbleIndex::create("/tmp/unused.idx", IndexKind::Linear).unwrap();
        idx.add(Some("chr1"), 200, 210, 10).unwrap();
        let err = idx.add(Some("chr1"), 100, 110, 20).unwrap_err();
        assert!(matches!(err, VcfError::Usage { .. }));
    }
}
