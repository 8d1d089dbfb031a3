//! VCF header parsing and merging.
//!
//! Grounded on `original_source/vcflib/vcf.py` (`VCF.load_header`,
//! `VCF.parse_header`, `VCF.parse_line`, `VCF.copy_header`).

use indexmap::IndexMap;

use crate::error::{Result, VcfError};

/// The `Number` attribute of an `INFO`/`FORMAT` declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Number {
    Zero,
    One,
    PerAltAllele, // 'A'
    PerAllele,    // 'R'
    Genotype,     // 'G'
    Unknown,      // '.'
    Count(u32),
}

impl Number {
    fn parse(s: &str) -> Number {
        match s {
            "0" => Number::Zero,
            "1" => Number::One,
            "A" => Number::PerAltAllele,
            "R" => Number::PerAllele,
            "G" => Number::Genotype,
            "." => Number::Unknown,
            other => other.parse::<u32>().map(Number::Count).unwrap_or(Number::Unknown),
        }
    }

    /// Whether a value under this arity decodes as a single scalar rather
    /// than a comma-separated list (mirrors `VCF.parse_field`'s
    /// `d['Number'] != '0' and d['Number'] != '1'` branch).
    fn is_scalar(self) -> bool {
        matches!(self, Number::Zero | Number::One)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Float,
    Flag,
    Character,
    String,
}

impl FieldType {
    fn parse(s: &str) -> FieldType {
        match s {
            "Integer" => FieldType::Integer,
            "Float" => FieldType::Float,
            "Flag" => FieldType::Flag,
            "Character" => FieldType::Character,
            _ => FieldType::String,
        }
    }
}

/// A raw `##contig=<...>`/`##ALT=<...>`/`##FILTER=<...>` declaration, kept as
/// its parsed key/value attributes plus the original line.
#[derive(Debug, Clone)]
pub struct HeaderRecord {
    pub id: String,
    pub fields: IndexMap<String, String>,
    pub raw: String,
}

impl HeaderRecord {
    pub fn length(&self) -> Option<u64> {
        self.fields.get("length").and_then(|s| s.parse().ok())
    }
}

/// A `##INFO=<...>`/`##FORMAT=<...>` declaration: like [`HeaderRecord`] but
/// with `Number`/`Type` parsed out, since every record decode/encode path
/// needs them.
#[derive(Debug, Clone)]
pub struct FieldMeta {
    pub id: String,
    pub number: Number,
    pub type_: FieldType,
    pub fields: IndexMap<String, String>,
    pub raw: String,
}

/// The parsed header of a VCF stream: contig/ALT/FILTER/INFO/FORMAT
/// declarations plus the sample column names, alongside the original raw
/// lines (needed verbatim when copying a header to a new writer).
#[derive(Debug, Clone)]
pub struct HeaderCatalog {
    pub lines: Vec<String>,
    pub contigs: IndexMap<String, HeaderRecord>,
    pub alts: IndexMap<String, HeaderRecord>,
    pub filters: IndexMap<String, HeaderRecord>,
    pub infos: IndexMap<String, FieldMeta>,
    pub formats: IndexMap<String, FieldMeta>,
    pub samples: Vec<String>,
}

impl HeaderCatalog {
    pub fn empty() -> Self {
        HeaderCatalog {
            lines: Vec::new(),
            contigs: IndexMap::new(),
            alts: IndexMap::new(),
            filters: IndexMap::new(),
            infos: IndexMap::new(),
            formats: IndexMap::new(),
            samples: Vec::new(),
        }
    }

    /// Parse a set of `##`/`#CHROM` lines into a catalog (`VCF.parse_header`).
    pub fn parse(lines: Vec<String>) -> Result<Self> {
        let mut cat = HeaderCatalog::empty();
        for line in &lines {
            if let Some(body) = line.strip_prefix("##contig=") {
                let rec = parse_record(body)?;
                cat.contigs.insert(rec.id.clone(), rec);
            } else if let Some(body) = line.strip_prefix("##ALT=") {
                let rec = parse_record(body)?;
                cat.alts.insert(rec.id.clone(), rec);
            } else if let Some(body) = line.strip_prefix("##FILTER=") {
                let rec = parse_record(body)?;
                cat.filters.insert(rec.id.clone(), rec);
            } else if let Some(body) = line.strip_prefix("##INFO=") {
                let meta = parse_field_meta(body)?;
                cat.infos.insert(meta.id.clone(), meta);
            } else if let Some(body) = line.strip_prefix("##FORMAT=") {
                let meta = parse_field_meta(body)?;
                cat.formats.insert(meta.id.clone(), meta);
            } else if line.starts_with("#CHROM") {
                let cols: Vec<&str> = line[1..].split('\t').collect();
                cat.samples = cols.iter().skip(9).map(|s| s.to_string()).collect();
            }
        }
        cat.lines = lines;
        Ok(cat)
    }

    /// Build a header by copying `src`'s raw lines, replaced/added to by
    /// `update` and pruned by `remove` (glob-matched against `ID=`),
    /// exactly like `VCF.copy_header`.
    pub fn merged(src: &HeaderCatalog, update: Option<&[String]>, remove: Option<&[String]>) -> Result<HeaderCatalog> {
        let mut by_field: IndexMap<String, IndexMap<Option<String>, String>> = IndexMap::new();
        for line in &src.lines {
            let (fld, id) = parse_field_id(line);
            by_field.entry(fld).or_default().insert(id, line.clone());
        }
        if let Some(update) = update {
            for line in update {
                if let Some((fld, id)) = parse_field_id_checked(line) {
                    by_field.entry(fld).or_default().insert(id, line.clone());
                }
            }
        }
        if let Some(remove) = remove {
            for line in remove {
                let Some((fld, id)) = parse_field_id_checked(line) else { continue };
                let Some(ids) = by_field.get_mut(&fld) else { continue };
                match id {
                    None => {
                        let existing = ids.get(&None).cloned().unwrap_or_default();
                        if glob_match(line, &existing) {
                            ids.shift_remove(&None);
                        }
                    }
                    Some(pattern) => {
                        let matches: Vec<Option<String>> = ids
                            .keys()
                            .filter(|k| k.as_deref().map(|kk| glob_match(&pattern, kk)).unwrap_or(false))
                            .cloned()
                            .collect();
                        for k in matches {
                            ids.shift_remove(&k);
                        }
                    }
                }
            }
        }
        let merged_lines: Vec<String> = by_field.into_values().flat_map(|ids| ids.into_values()).collect();
        HeaderCatalog::parse(merged_lines)
    }
}

fn parse_record(body: &str) -> Result<HeaderRecord> {
    let fields = parse_structured(body)?;
    let id = fields.get("ID").cloned().ok_or_else(|| VcfError::format("header record missing ID"))?;
    Ok(HeaderRecord { id, fields, raw: body.to_string() })
}

fn parse_field_meta(body: &str) -> Result<FieldMeta> {
    let fields = parse_structured(body)?;
    let id = fields.get("ID").cloned().ok_or_else(|| VcfError::format("header record missing ID"))?;
    let number = Number::parse(fields.get("Number").map(String::as_str).unwrap_or("."));
    let type_ = FieldType::parse(fields.get("Type").map(String::as_str).unwrap_or("String"));
    Ok(FieldMeta { id, number, type_, fields, raw: body.to_string() })
}

/// Parse the `<K=V,K=V,...>` structured body of a header declaration
/// (`VCF.parse_line`): find the first `<` and the first `>`, then split the
/// interior on commas not inside a quoted value.
fn parse_structured(line: &str) -> Result<IndexMap<String, String>> {
    let s = line.find('<').ok_or_else(|| VcfError::format("structured header line missing '<'"))?;
    let e = line[s..].find('>').map(|i| s + i).ok_or_else(|| VcfError::format("structured header line missing '>'"))?;
    Ok(split_kv_list(&line[s + 1..e]))
}

fn split_kv_list(body: &str) -> IndexMap<String, String> {
    let mut out = IndexMap::new();
    let bytes = body.as_bytes();
    let n = bytes.len();
    let mut i = 0;
    while i < n {
        let key_start = i;
        while i < n && bytes[i] != b'=' {
            i += 1;
        }
        if i >= n {
            break;
        }
        let key = body[key_start..i].to_string();
        i += 1;
        let val_start = i;
        if i < n && bytes[i] == b'"' {
            i += 1;
            while i < n && bytes[i] != b'"' {
                i += 1;
            }
            if i < n {
                i += 1;
            }
        } else {
            while i < n && bytes[i] != b',' {
                i += 1;
            }
        }
        out.insert(key, body[val_start..i].to_string());
        if i < n && bytes[i] == b',' {
            i += 1;
        }
    }
    out
}

/// `(field, id)` for a `##field=<ID=id,...>` line, or `(line, None)` when the
/// line doesn't declare an `ID`. Mirrors `copy_header`'s
/// `^##([^=]+)=(<ID=([^,]+).*>)?` pattern.
fn parse_field_id(line: &str) -> (String, Option<String>) {
    parse_field_id_checked(line).unwrap_or_else(|| (line.to_string(), None))
}

/// Like [`parse_field_id`] but returns `None` when the line isn't of the
/// form `##<field>=...` at all (the regex failing to match at all, as
/// opposed to matching with no `ID` group).
fn parse_field_id_checked(line: &str) -> Option<(String, Option<String>)> {
    let rest = line.strip_prefix("##")?;
    let eq = rest.find('=')?;
    let field = rest[..eq].to_string();
    let body = &rest[eq + 1..];
    if let Some(after) = body.strip_prefix("<ID=") {
        let end = after.find(',').or_else(|| after.find('>')).unwrap_or(after.len());
        Some((field, Some(after[..end].to_string())))
    } else {
        Some((field, None))
    }
}

/// Minimal shell-glob match (`*`/`?`) used for `remove`'s `fnmatch`-style ID
/// patterns.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn recurse(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => recurse(&p[1..], t) || (!t.is_empty() && recurse(p, &t[1..])),
            Some(b'?') => !t.is_empty() && recurse(&p[1..], &t[1..]),
            Some(&c) => !t.is_empty() && t[0] == c && recurse(&p[1..], &t[1..]),
        }
    }
    recurse(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_lines() -> Vec<String> {
        vec![
            "##fileformat=VCFv4.2".to_string(),
            r#"##contig=<ID=chr1,length=1000>"#.to_string(),
            r#"##INFO=<ID=DP,Number=1,Type=Integer,Description="Total Depth">"#.to_string(),
            r#"##INFO=<ID=AC,Number=A,Type=Integer,Description="Allele count">"#.to_string(),
            r#"##FORMAT=<ID=GT,Number=1,Type=String,Description="Genotype">"#.to_string(),
            r#"##FILTER=<ID=PASS,Description="All filters passed">"#.to_string(),
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1\ts2".to_string(),
        ]
    }

    #[test]
    fn parses_contigs_infos_formats_and_samples() {
        let cat = HeaderCatalog::parse(sample_lines()).unwrap();
        assert_eq!(cat.contigs["chr1"].length(), Some(1000));
        assert_eq!(cat.infos["DP"].number, Number::One);
        assert_eq!(cat.infos["DP"].type_, FieldType::Integer);
        assert_eq!(cat.infos["AC"].number, Number::PerAltAllele);
        assert!(cat.formats.contains_key("GT"));
        assert_eq!(cat.samples, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn merged_keeps_order_and_applies_update_remove() {
        let src = HeaderCatalog::parse(sample_lines()).unwrap();
        let update = vec![r#"##INFO=<ID=MQ,Number=1,Type=Float,Description="Mapping quality">"#.to_string()];
        let remove = vec![r#"##FILTER=<ID=PASS,Description="x">"#.to_string()];
        let merged = HeaderCatalog::merged(&src, Some(&update), Some(&remove)).unwrap();
        assert!(merged.infos.contains_key("MQ"));
        assert!(!merged.filters.contains_key("PASS"));
        assert!(merged.contigs.contains_key("chr1"));
    }

    #[test]
    fn glob_matches_wildcards() {
        assert!(glob_match("PASS", "PASS"));
        assert!(glob_match("PA*", "PASS"));
        assert!(!glob_match("PA*X", "PASS"));
        assert!(glob_match("P?SS", "PASS"));
    }
}
