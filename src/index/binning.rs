//! TBI/CSI hierarchical binning index for BGZF-compressed data.
//!
//! Grounded on `htslib::tabix` (`reg2bin`, per-sequence bin map, `.tbi`
//! byte layout) extended with the CSI variant, the `optimize` merge pass,
//! and `query`, all ported from `original_source/vcflib/tabix.py`
//! (`Tabix.add`/`optimize`/`query`/`load`/`save`) — a write-once TBI builder
//! with no reader and no query has no use for those three on its own.

use crate::bgzf::{BgzfReader, BgzfWriter};
use crate::error::{Result, VcfError};
use crate::index::merge_ranges;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const TBI_MAGIC: u32 = 0x0149_4254;
pub const CSI_MAGIC: u32 = 0x0149_5343;

pub const DEFAULT_MIN_SHIFT: u32 = 14;
pub const DEFAULT_TBI_DEPTH: u32 = 5;

/// Aux header fields carried by both TBI and CSI (the column conventions a
/// tabix-style consumer needs to locate contig/start/end in the text file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxHeader {
    pub format: u32,
    pub col_seq: u32,
    pub col_beg: u32,
    pub col_end: u32,
    pub meta: u32,
    pub skip: u32,
}

impl AuxHeader {
    pub const FMT_GENERIC: u32 = 0;
    pub const FMT_SAM: u32 = 1;
    pub const FMT_VCF: u32 = 2;

    /// The aux header a VCF writer uses: 1-based CHROM/POS columns, `#`
    /// meta character, no header lines to skip.
    pub fn vcf() -> Self {
        AuxHeader { format: Self::FMT_VCF, col_seq: 1, col_beg: 2, col_end: 2, meta: b'#' as u32, skip: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Tbi,
    Csi,
}

#[derive(Debug, Clone, Default)]
struct BinEntry {
    loffset: u64,
    chunks: Vec<(u64, u64)>,
}

#[derive(Debug, Clone, Default)]
struct SeqIndex {
    bins: BTreeMap<u32, BinEntry>,
    intvs: Vec<u64>,
}

/// A loaded-or-being-built TBI/CSI index.
pub struct BinningIndex {
    magic: Magic,
    min_shift: u32,
    depth: u32,
    max_shift: u32,
    header: AuxHeader,
    indices: IndexMap<String, SeqIndex>,
    // Builder-only state.
    current: Option<String>,
    pos: u64,
    end: u64,
}

fn bin_offset(shift: u32, max_shift: u32) -> u64 {
    ((1u64 << (max_shift - shift)) - 1) / 7
}

/// Deepest-first bin number for the half-open span `[s, e)`.
fn bin_for(s: u64, e: u64, min_shift: u32, max_shift: u32) -> u32 {
    let mut shift = min_shift;
    loop {
        let bs = s >> shift;
        let be = e.saturating_sub(1) >> shift;
        if bs == be || shift >= max_shift {
            let bo = bin_offset(shift, max_shift);
            return (bo + bs) as u32;
        }
        shift += 3;
    }
}

impl BinningIndex {
    /// Start building a fresh index with the given aux header and magic.
    pub fn create(magic: Magic, min_shift: u32, depth: u32, header: AuxHeader) -> Self {
        BinningIndex {
            magic,
            min_shift,
            depth,
            max_shift: min_shift + depth * 3,
            header,
            indices: IndexMap::new(),
            current: None,
            pos: 0,
            end: 0,
        }
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn min_shift(&self) -> u32 {
        self.min_shift
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn aux_header(&self) -> AuxHeader {
        self.header
    }

    /// Append one record in (contig, start) non-decreasing order. Pass
    /// `contig = None` with `start = max_contig_length, end = 0` to flush
    /// the outgoing contig and (if the contig won't fit the current
    /// `min_shift`/`depth`) promote TBI to CSI and enlarge `depth`. Pass
    /// `contig = None, start = 0, end = 0` at save time to flush the final
    /// contig.
    pub fn add(&mut self, contig: Option<&str>, start: u64, end: u64, voff: u64) -> Result<()> {
        if contig.is_none() && start > 0 {
            let mut shift = self.min_shift;
            let mut limit = 1u64 << shift;
            while start > limit {
                limit <<= 1;
                shift += 1;
            }
            if shift >= 32 {
                return Err(VcfError::format("a contig is too long to index"));
            }
            if shift > self.min_shift + self.depth * 3 {
                self.magic = Magic::Csi;
                self.depth = (shift - self.min_shift + 2) / 3;
                self.max_shift = self.min_shift + self.depth * 3;
                log::debug!(
                    "binning index: promoted TBI to CSI (min_shift={}, depth={}) to cover contig length {start}",
                    self.min_shift,
                    self.depth
                );
            }
        }

        if let Some(cur) = self.current.clone() {
            if contig != Some(cur.as_str()) {
                self.optimize(&cur);
                self.current = None;
            }
        }
        if self.current.is_none() {
            if let Some(c) = contig {
                self.indices.entry(c.to_string()).or_default();
                self.current = Some(c.to_string());
                self.pos = 0;
            }
        }

        if let Some(cur) = self.current.clone() {
            if contig != Some(cur.as_str()) {
                return Err(VcfError::usage("add() called with a mismatched contig"));
            }
            if start < self.pos {
                return Err(VcfError::usage(format!(
                    "add() called out of order: start {start} < last start {}",
                    self.pos
                )));
            }
            let seq = self.indices.get_mut(&cur).expect("current contig exists");
            if end > 0 {
                let be = ((end - 1) >> self.min_shift) as usize;
                if be >= seq.intvs.len() {
                    seq.intvs.resize(be + 1, self.end);
                }
            }
            let bin = bin_for(start, end.max(1), self.min_shift, self.max_shift);
            let entry = seq.bins.entry(bin).or_default();
            match entry.chunks.last_mut() {
                Some(last) if last.1 == self.end => last.1 = voff,
                _ => entry.chunks.push((self.end, voff)),
            }
            self.pos = start;
        }
        self.end = voff;
        Ok(())
    }

    fn optimize(&mut self, contig: &str) {
        let min_shift = self.min_shift;
        let max_shift = self.max_shift;
        let mut shift = min_shift;
        while shift <= max_shift {
            let bo = bin_offset(shift, max_shift);
            let hi = bo << 3;
            let keys: Vec<u32> = {
                let seq = self.indices.get(contig).expect("contig exists");
                seq.bins.range((bo as u32)..=(hi as u32)).map(|(k, _)| *k).collect()
            };
            for bin in keys {
                let has_chunks = self
                    .indices
                    .get(contig)
                    .and_then(|s| s.bins.get(&bin))
                    .map(|b| !b.chunks.is_empty())
                    .unwrap_or(false);
                let exists = self.indices.get(contig).map(|s| s.bins.contains_key(&bin)).unwrap_or(false);
                if !exists {
                    continue;
                }
                if !has_chunks {
                    self.indices.get_mut(contig).unwrap().bins.remove(&bin);
                    continue;
                }
                let (bs, be) = {
                    let chunks = &self.indices[contig].bins[&bin].chunks;
                    (chunks[0].0 >> 16, chunks.last().unwrap().1 >> 16)
                };
                if be.saturating_sub(bs) < 65536 && bo > 0 {
                    let chunks = self.indices.get_mut(contig).unwrap().bins.remove(&bin).unwrap().chunks;
                    let parent_bin = ((bin as u64).saturating_sub(1) >> 3) as u32;
                    let seq = self.indices.get_mut(contig).unwrap();
                    let parent = seq.bins.entry(parent_bin).or_default();
                    let mut combined = chunks;
                    combined.extend(parent.chunks.iter().copied());
                    parent.chunks = merge_ranges(combined, 16);
                } else {
                    let seq = self.indices.get(contig).unwrap();
                    if !seq.intvs.is_empty() {
                        let intv = ((bin as u64 - bo) << (shift - min_shift)) as usize;
                        let intv = intv.min(seq.intvs.len() - 1);
                        let loffset = seq.intvs[intv];
                        self.indices.get_mut(contig).unwrap().bins.get_mut(&bin).unwrap().loffset = loffset;
                    }
                }
            }
            shift += 3;
        }
    }

    /// Look up the chunk list covering `[start, end)` on `contig`, merged
    /// and clipped per the linear-offset / loffset lower bound.
    pub fn query(&self, contig: &str, start: u64, end: u64) -> Vec<(u64, u64)> {
        let seq = match self.indices.get(contig) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let has_intvs = !seq.intvs.is_empty();
        let i = (start >> self.min_shift) as usize;
        let mut minoff = if has_intvs { seq.intvs[i.min(seq.intvs.len() - 1)] } else { 0 };

        let mut ranges = Vec::new();
        let mut shift = self.max_shift;
        loop {
            let bo = bin_offset(shift, self.max_shift);
            let bs = bo + (start >> shift);
            let be = bo + (end.saturating_sub(1) >> shift);
            if !has_intvs {
                let mut bi = bs;
                loop {
                    if let Some(b) = seq.bins.get(&(bi as u32)) {
                        minoff = minoff.max(b.loffset);
                        break;
                    }
                    if bi == bo {
                        break;
                    }
                    bi -= 1;
                }
            }
            if be >= bs {
                for bi in bs..=be {
                    if let Some(b) = seq.bins.get(&(bi as u32)) {
                        ranges.extend(b.chunks.iter().copied());
                    }
                }
            }
            if shift == self.min_shift {
                break;
            }
            shift -= 3;
        }

        if minoff > 0 {
            ranges = ranges.into_iter().filter(|&(_, e)| e > minoff).map(|(s, e)| (s.max(minoff), e)).collect();
        }
        merge_ranges(ranges, 16)
    }

    /// Flush the final contig and write the index to `<data_path>.tbi` or
    /// `.csi`, through a BGZF wrapper, as the original data file's sidecar.
    pub fn save(mut self, data_path: &Path) -> Result<()> {
        self.add(None, 0, 0, self.end)?;

        let ext = match self.magic {
            Magic::Tbi => "tbi",
            Magic::Csi => "csi",
        };
        let out_path = sidecar_path(data_path, ext);
        let file = std::fs::File::create(&out_path)?;
        let mut writer = BgzfWriter::new(file);
        self.write_to(&mut writer)?;
        writer.close()?;
        log::debug!("binning index: wrote {}", out_path.display());
        Ok(())
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut names_buf = Vec::new();
        for name in self.indices.keys() {
            names_buf.extend_from_slice(name.as_bytes());
            names_buf.push(0);
        }

        match self.magic {
            Magic::Tbi => {
                w.write_all(&TBI_MAGIC.to_le_bytes())?;
                w.write_all(&(self.indices.len() as u32).to_le_bytes())?;
                write_aux(w, &self.header)?;
                w.write_all(&(names_buf.len() as u32).to_le_bytes())?;
                w.write_all(&names_buf)?;
            }
            Magic::Csi => {
                w.write_all(&CSI_MAGIC.to_le_bytes())?;
                w.write_all(&self.min_shift.to_le_bytes())?;
                w.write_all(&self.depth.to_le_bytes())?;
                let l_aux = 24 + 4 + names_buf.len();
                w.write_all(&(l_aux as u32).to_le_bytes())?;
                write_aux(w, &self.header)?;
                w.write_all(&(names_buf.len() as u32).to_le_bytes())?;
                w.write_all(&names_buf)?;
                w.write_all(&(self.indices.len() as u32).to_le_bytes())?;
            }
        }

        for seq in self.indices.values() {
            w.write_all(&(seq.bins.len() as u32).to_le_bytes())?;
            for (&bin, entry) in seq.bins.iter() {
                w.write_all(&bin.to_le_bytes())?;
                if self.magic == Magic::Csi {
                    w.write_all(&entry.loffset.to_le_bytes())?;
                }
                w.write_all(&(entry.chunks.len() as u32).to_le_bytes())?;
                for &(s, e) in &entry.chunks {
                    w.write_all(&s.to_le_bytes())?;
                    w.write_all(&e.to_le_bytes())?;
                }
            }
            if self.magic == Magic::Tbi {
                w.write_all(&(seq.intvs.len() as u32).to_le_bytes())?;
                for &o in &seq.intvs {
                    w.write_all(&o.to_le_bytes())?;
                }
            }
        }
        if self.magic == Magic::Tbi {
            w.write_all(&0u64.to_le_bytes())?; // n_no_coor
        }
        Ok(())
    }

    /// Load a `.csi` sidecar if present, else a `.tbi` sidecar, for
    /// `data_path`.
    pub fn open(data_path: &Path) -> Result<Self> {
        let csi_path = sidecar_path(data_path, "csi");
        let (path, expect_magic) = if csi_path.exists() {
            (csi_path, CSI_MAGIC)
        } else {
            (sidecar_path(data_path, "tbi"), TBI_MAGIC)
        };
        let file = std::fs::File::open(&path)?;
        let mut reader = BgzfReader::new(file);
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::parse(&data, expect_magic)
    }

    fn parse(data: &[u8], expect_magic: u32) -> Result<Self> {
        let mut off = 0usize;
        let magic_raw = read_u32(data, &mut off)?;
        if magic_raw != expect_magic {
            return Err(VcfError::format(format!(
                "binning index magic {magic_raw:#x} does not match expected {expect_magic:#x}"
            )));
        }
        let (magic, min_shift, depth, header, n_ref);
        if magic_raw == TBI_MAGIC {
            magic = Magic::Tbi;
            min_shift = DEFAULT_MIN_SHIFT;
            depth = DEFAULT_TBI_DEPTH;
            n_ref = read_u32(data, &mut off)?;
            header = read_aux(data, &mut off)?;
            let l_nm = read_u32(data, &mut off)? as usize;
            let names_blob = read_bytes(data, &mut off, l_nm)?;
            return Self::parse_bodies(data, &mut off, magic, min_shift, depth, header, n_ref, names_blob);
        } else {
            magic = Magic::Csi;
            min_shift = read_u32(data, &mut off)?;
            depth = read_u32(data, &mut off)?;
            let l_aux = read_u32(data, &mut off)? as usize;
            if l_aux < 28 {
                return Err(VcfError::format("CSI aux block too small"));
            }
            let aux_start = off;
            header = read_aux(data, &mut off)?;
            let l_nm = read_u32(data, &mut off)? as usize;
            let names_blob = read_bytes(data, &mut off, l_nm)?;
            off = aux_start + l_aux;
            n_ref = read_u32(data, &mut off)?;
            return Self::parse_bodies(data, &mut off, magic, min_shift, depth, header, n_ref, names_blob);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_bodies(
        data: &[u8],
        off: &mut usize,
        magic: Magic,
        min_shift: u32,
        depth: u32,
        header: AuxHeader,
        n_ref: u32,
        names_blob: Vec<u8>,
    ) -> Result<Self> {
        let names: Vec<&[u8]> = names_blob.split(|&b| b == 0).collect();
        if names.len() != n_ref as usize + 1 || !names.last().map(|n| n.is_empty()).unwrap_or(false) {
            return Err(VcfError::format("binning index name table length mismatch"));
        }

        let mut indices = IndexMap::new();
        for name in names.iter().take(n_ref as usize) {
            let name = std::str::from_utf8(name)
                .map_err(|_| VcfError::format("non-UTF8 contig name in binning index"))?
                .to_string();
            let mut seq = SeqIndex::default();
            let n_bin = read_u32(data, off)?;
            for _ in 0..n_bin {
                let bin = read_u32(data, off)?;
                let loffset = if magic == Magic::Csi { read_u64(data, off)? } else { 0 };
                let n_chunk = read_u32(data, off)?;
                let mut chunks = Vec::with_capacity(n_chunk as usize);
                for _ in 0..n_chunk {
                    let s = read_u64(data, off)?;
                    let e = read_u64(data, off)?;
                    chunks.push((s, e));
                }
                seq.bins.insert(bin, BinEntry { loffset, chunks });
            }
            if magic == Magic::Tbi {
                let n_intv = read_u32(data, off)?;
                for _ in 0..n_intv {
                    seq.intvs.push(read_u64(data, off)?);
                }
                if n_intv == 0 {
                    seq.intvs.push(0);
                }
            }
            indices.insert(name, seq);
        }

        Ok(BinningIndex {
            magic,
            min_shift,
            depth,
            max_shift: min_shift + depth * 3,
            header,
            indices,
            current: None,
            pos: 0,
            end: 0,
        })
    }
}

fn sidecar_path(data_path: &Path, ext: &str) -> PathBuf {
    let mut s = data_path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

fn write_aux<W: Write>(w: &mut W, h: &AuxHeader) -> Result<()> {
    w.write_all(&h.format.to_le_bytes())?;
    w.write_all(&h.col_seq.to_le_bytes())?;
    w.write_all(&h.col_beg.to_le_bytes())?;
    w.write_all(&h.col_end.to_le_bytes())?;
    w.write_all(&h.meta.to_le_bytes())?;
    w.write_all(&h.skip.to_le_bytes())?;
    Ok(())
}

fn read_aux(data: &[u8], off: &mut usize) -> Result<AuxHeader> {
    Ok(AuxHeader {
        format: read_u32(data, off)?,
        col_seq: read_u32(data, off)?,
        col_beg: read_u32(data, off)?,
        col_end: read_u32(data, off)?,
        meta: read_u32(data, off)?,
        skip: read_u32(data, off)?,
    })
}

fn read_u32(data: &[u8], off: &mut usize) -> Result<u32> {
    let bytes = read_bytes(data, off, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(data: &[u8], off: &mut usize) -> Result<u64> {
    let bytes = read_bytes(data, off, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_bytes(data: &[u8], off: &mut usize, n: usize) -> Result<Vec<u8>> {
    if *off + n > data.len() {
        return Err(VcfError::format("binning index truncated"));
    }
    let slice = data[*off..*off + n].to_vec();
    *off += n;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn header() -> AuxHeader {
        AuxHeader::vcf()
    }

    #[test]
    fn single_record_round_trip() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("sample.vcf.gz");

        let mut idx = BinningIndex::create(Magic::Tbi, DEFAULT_MIN_SHIFT, DEFAULT_TBI_DEPTH, header());
        idx.add(Some("chr1"), 100, 101, 1 << 16).unwrap();
        idx.add(None, 10_000, 0, 2 << 16).unwrap();
        idx.save(&data_path).unwrap();

        let loaded = BinningIndex::open(&data_path).unwrap();
        let chunks = loaded.query("chr1", 0, 10_000);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().any(|&(b, e)| b <= (1u64 << 16) && e >= (1u64 << 16)));
    }

    #[test]
    fn cross_contig_query_is_isolated() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("cross.vcf.gz");

        let mut idx = BinningIndex::create(Magic::Tbi, DEFAULT_MIN_SHIFT, DEFAULT_TBI_DEPTH, header());
        idx.add(Some("chr1"), 100, 101, 10 << 16).unwrap();
        idx.add(Some("chr1"), 200, 201, 20 << 16).unwrap();
        idx.add(Some("chr2"), 50, 51, 30 << 16).unwrap();
        idx.add(Some("chr2"), 400, 401, 40 << 16).unwrap();
        idx.add(None, 1000, 0, 50 << 16).unwrap();
        idx.save(&data_path).unwrap();

        let loaded = BinningIndex::open(&data_path).unwrap();
        let chr2 = loaded.query("chr2", 0, 1000);
        assert!(chr2.iter().any(|&(b, e)| b <= (30u64 << 16) && e >= (30u64 << 16)));
        assert!(chr2.iter().any(|&(b, e)| b <= (40u64 << 16) && e >= (40u64 << 16)));
        // None of chr1's offsets should be reachable from chr2's chunk set.
        for &(b, e) in &chr2 {
            assert!(!(b <= (10u64 << 16) && e > (10u64 << 16)));
        }
    }

    #[test]
    fn huge_contig_promotes_to_csi() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("big.vcf.gz");

        let mut idx = BinningIndex::create(Magic::Tbi, DEFAULT_MIN_SHIFT, DEFAULT_TBI_DEPTH, header());
        let big_pos: u64 = 1 << 29; // just past max addressable with min_shift=14, depth=5
        idx.add(Some("chr1"), big_pos, big_pos + 1, 100 << 16).unwrap();
        idx.add(None, 1u64 << 30, 0, 200 << 16).unwrap();
        assert_eq!(idx.magic(), Magic::Csi);
        idx.save(&data_path).unwrap();

        assert!(data_path.with_extension("vcf.gz.csi").exists() || {
            let mut p = data_path.clone().into_os_string();
            p.push(".csi");
            std::path::Path::new(&p).exists()
        });

        let loaded = BinningIndex::open(&data_path).unwrap();
        assert_eq!(loaded.magic(), Magic::Csi);
        let hits = loaded.query("chr1", big_pos, big_pos + 2);
        assert!(!hits.is_empty());
    }

    #[test]
    fn rejects_wrong_extension_magic() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("x.vcf.gz");
        let tbi_path = sidecar_path(&data_path, "tbi");
        // Write a CSI-magic payload under a .tbi name.
        std::fs::write(&tbi_path, CSI_MAGIC.to_le_bytes()).unwrap();
        let err = BinningIndex::open(&data_path).unwrap_err();
        assert!(matches!(err, VcfError::Format { .. }));
    }

    #[test]
    fn out_of_order_add_is_rejected() {
        let mut idx = BinningIndex::create(Magic::Tbi, DEFAULT_MIN_SHIFT, DEFAULT_TBI_DEPTH, header());
        idx.add(Some("chr1"), 200, 201, 1 << 16).unwrap();
        let err = idx.add(Some("chr1"), 100, 101, 2 << 16).unwrap_err();
        assert!(matches!(err, VcfError::Usage { .. }));
    }
}
