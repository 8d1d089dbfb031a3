//! A single VCF record (`Variant`) and its parse/format logic.
//!
//! Grounded on `original_source/vcflib/vcf.py` (`Variant`, `VCF.parse`,
//! `VCF.parse_field`, `VCF.format`, `VCF.format_field`).

use indexmap::IndexMap;

use super::header::{FieldType, HeaderCatalog, Number};
use crate::error::{Result, VcfError};

/// A decoded INFO/FORMAT field value. `Flag` is the INFO `Number=0` marker
/// value (present/absent, never a payload); `Missing` is VCF's `.`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Flag,
    Missing,
    Integer(i64),
    Float(f64),
    Str(String),
    IntegerList(Vec<i64>),
    FloatList(Vec<f64>),
    StringList(Vec<String>),
}

impl FieldValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

/// One data line of a VCF file, decoded field-by-field.
#[derive(Debug, Clone)]
pub struct Variant {
    pub chrom: String,
    pub pos: u64, // 0-based
    pub id: Option<String>,
    pub reference: String,
    pub alt: Vec<String>,
    pub qual: Option<f64>,
    pub filter: Vec<String>,
    pub info: IndexMap<String, FieldValue>,
    pub samples: Vec<IndexMap<String, FieldValue>>,
    /// End of the variant's reference span (`INFO/END` if present, else
    /// `pos + len(ref)`), used by every index/shard boundary check.
    pub end: u64,
    /// The formatted text line, cached once produced by [`format`] or read
    /// from disk by [`parse`]; cleared by nothing (once formatted, a
    /// `Variant` is immutable for emission purposes).
    pub line: Option<String>,
}

fn parse_kv(kv: &str) -> (String, Option<String>) {
    match kv.split_once('=') {
        Some((k, v)) => (k.to_string(), Some(v.to_string())),
        None => (kv.to_string(), None),
    }
}

fn decode_scalar(type_: FieldType, v: &str) -> FieldValue {
    match type_ {
        FieldType::Integer => v.parse().map(FieldValue::Integer).unwrap_or(FieldValue::Missing),
        FieldType::Float => v.parse().map(FieldValue::Float).unwrap_or(FieldValue::Missing),
        FieldType::Flag => FieldValue::Flag,
        _ => FieldValue::Str(v.to_string()),
    }
}

fn decode_field(meta: Option<&super::header::FieldMeta>, raw_val: Option<String>) -> FieldValue {
    let Some(meta) = meta else {
        return match raw_val {
            Some(v) => FieldValue::Str(v),
            None => FieldValue::Flag,
        };
    };
    let Some(v) = raw_val else {
        return FieldValue::Flag;
    };
    if v == "." {
        return FieldValue::Missing;
    }
    if meta.number.is_scalar() {
        decode_scalar(meta.type_, &v)
    } else {
        let parts: Vec<&str> = v.split(',').collect();
        if parts.iter().all(|p| *p == ".") {
            return FieldValue::Missing;
        }
        match meta.type_ {
            FieldType::Integer => FieldValue::IntegerList(parts.iter().filter_map(|p| p.parse().ok()).collect()),
            FieldType::Float => FieldValue::FloatList(parts.iter().filter_map(|p| p.parse().ok()).collect()),
            _ => FieldValue::StringList(parts.iter().map(|s| s.to_string()).collect()),
        }
    }
}

/// Decode one tab-separated VCF data line against `header`'s INFO/FORMAT
/// declarations (`VCF.parse`).
pub fn parse(header: &HeaderCatalog, line: &str) -> Result<Variant> {
    let vals: Vec<&str> = line.split('\t').collect();
    if vals.len() < 5 {
        return Err(VcfError::record_parse("fewer than 5 tab-separated fields", line));
    }
    let chrom = vals[0].to_string();
    let raw_pos: u64 = vals[1].parse().map_err(|_| VcfError::record_parse("invalid POS", line))?;
    let pos = raw_pos.checked_sub(1).ok_or_else(|| VcfError::record_parse("POS must be >= 1", line))?;
    let id = if vals[2] == "." { None } else { Some(vals[2].to_string()) };
    let reference = vals[3].to_string();
    let alt = if vals[4] == "." { Vec::new() } else { vals[4].split(',').map(str::to_string).collect() };
    let qual = match vals.get(5) {
        Some(&".") | None => None,
        Some(q) => Some(q.parse().map_err(|_| VcfError::record_parse("invalid QUAL", line))?),
    };
    let filter = match vals.get(6) {
        Some(&".") | None => Vec::new(),
        Some(f) => f.split(';').map(str::to_string).collect(),
    };

    let mut info = IndexMap::new();
    if let Some(&raw_info) = vals.get(7) {
        if raw_info != "." {
            for kv in raw_info.split(';') {
                let (k, v) = parse_kv(kv);
                let fv = decode_field(header.infos.get(&k), v);
                info.insert(k, fv);
            }
        }
    }

    let fmts: Vec<&str> = match vals.get(8) {
        Some(&".") | None => Vec::new(),
        Some(f) => f.split(':').collect(),
    };
    let mut samples = Vec::new();
    if vals.len() > 9 {
        for sample_str in &vals[9..] {
            let sub: Vec<&str> = sample_str.split(':').collect();
            let mut s = IndexMap::new();
            for (k, v) in fmts.iter().zip(sub.iter()) {
                let fv = decode_field(header.formats.get(*k), Some((*v).to_string()));
                s.insert((*k).to_string(), fv);
            }
            samples.push(s);
        }
    }

    let end = match info.get("END").and_then(FieldValue::as_integer) {
        Some(e) => e as u64,
        None => pos + reference.len() as u64,
    };

    Ok(Variant { chrom, pos, id, reference, alt, qual, filter, info, samples, end, line: Some(line.to_string()) })
}

/// Render a float the way Python's `str(float)` (the original's
/// `encoders['Float']`) does: `30.0` stays `"30.0"`, where Rust's
/// `f64::to_string` would drop the trailing `.0` and print `"30"`.
fn python_float_str(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    let s = f.to_string();
    if s.contains('.') || s.contains('e') || s.contains('E') {
        s
    } else {
        format!("{s}.0")
    }
}

fn encode_scalar(v: &FieldValue) -> String {
    match v {
        FieldValue::Missing => ".".to_string(),
        FieldValue::Integer(i) => i.to_string(),
        FieldValue::Float(f) => python_float_str(*f),
        FieldValue::Str(s) => s.clone(),
        FieldValue::Flag => String::new(),
        FieldValue::IntegerList(v) => v.iter().map(i64::to_string).collect::<Vec<_>>().join(","),
        FieldValue::FloatList(v) => v.iter().map(|f| python_float_str(*f)).collect::<Vec<_>>().join(","),
        FieldValue::StringList(v) => v.join(","),
    }
}

fn format_field(meta: Option<&super::header::FieldMeta>, key: &str, val: &FieldValue) -> Option<String> {
    match meta.map(|m| m.number) {
        Some(Number::Zero) => {
            if matches!(val, FieldValue::Missing) {
                None
            } else {
                Some(key.to_string())
            }
        }
        _ => {
            if matches!(val, FieldValue::Missing) {
                Some(format!("{key}=."))
            } else {
                Some(format!("{key}={}", encode_scalar(val)))
            }
        }
    }
}

fn format_sample_value(val: Option<&FieldValue>) -> String {
    match val {
        None => ".".to_string(),
        Some(FieldValue::Missing) => ".".to_string(),
        Some(v) => encode_scalar(v),
    }
}

/// Render `v` back to a tab-separated VCF line, caching it in `v.line`
/// (`VCF.format`).
pub fn format(header: &HeaderCatalog, v: &mut Variant) -> String {
    let mut flds = vec![
        v.chrom.clone(),
        (v.pos + 1).to_string(),
        v.id.clone().unwrap_or_else(|| ".".to_string()),
        v.reference.clone(),
        if v.alt.is_empty() { ".".to_string() } else { v.alt.join(",") },
        match v.qual {
            Some(q) => format!("{q:4.2}"),
            None => ".".to_string(),
        },
        if v.filter.is_empty() { ".".to_string() } else { v.filter.join(";") },
    ];

    let mut info_sorted: Vec<(&String, &FieldValue)> = v.info.iter().collect();
    info_sorted.sort_by(|a, b| a.0.cmp(b.0));
    let info_parts: Vec<String> =
        info_sorted.into_iter().filter_map(|(k, val)| format_field(header.infos.get(k), k, val)).collect();
    flds.push(if info_parts.is_empty() { ".".to_string() } else { info_parts.join(";") });

    if !header.samples.is_empty() {
        let mut keys: std::collections::BTreeSet<String> =
            v.samples.iter().flat_map(|s| s.keys().cloned()).collect();
        keys.remove("GT");
        let mut all_keys = vec!["GT".to_string()];
        all_keys.extend(keys);
        flds.push(all_keys.join(":"));
        for s in &v.samples {
            let parts: Vec<String> = all_keys.iter().map(|k| format_sample_value(s.get(k))).collect();
            flds.push(parts.join(":"));
        }
    }

    let line = flds.join("\t");
    v.line = Some(line.clone());
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcf::header::HeaderCatalog;

    fn header() -> HeaderCatalog {
        HeaderCatalog::parse(vec![
            "##fileformat=VCFv4.2".to_string(),
            r#"##INFO=<ID=DP,Number=1,Type=Integer,Description="Total Depth">"#.to_string(),
            r#"##INFO=<ID=AC,Number=A,Type=Integer,Description="Allele count">"#.to_string(),
            r#"##INFO=<ID=DB,Number=0,Type=Flag,Description="dbSNP membership">"#.to_string(),
            r#"##FORMAT=<ID=GT,Number=1,Type=String,Description="Genotype">"#.to_string(),
            r#"##FORMAT=<ID=DP,Number=1,Type=Integer,Description="Read depth">"#.to_string(),
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\ts1".to_string(),
        ])
        .unwrap()
    }

    #[test]
    fn parses_scalar_list_and_flag_info() {
        let h = header();
        let line = "chr1\t100\t.\tA\tG,T\t30.0\tPASS\tDP=10;AC=1,2;DB\tGT:DP\t0/1:8";
        let v = parse(&h, line).unwrap();
        assert_eq!(v.pos, 99);
        assert_eq!(v.alt, vec!["G".to_string(), "T".to_string()]);
        assert_eq!(v.info.get("DP"), Some(&FieldValue::Integer(10)));
        assert_eq!(v.info.get("AC"), Some(&FieldValue::IntegerList(vec![1, 2])));
        assert_eq!(v.info.get("DB"), Some(&FieldValue::Flag));
        assert_eq!(v.samples[0].get("DP"), Some(&FieldValue::Integer(8)));
        assert_eq!(v.end, 100);
    }

    #[test]
    fn info_end_override_widens_span() {
        let h = header();
        let line = "chr1\t100\t.\tA\t<DEL>\t.\t.\tEND=500\t.\t.";
        let v = parse(&h, line).unwrap();
        assert_eq!(v.end, 500);
    }

    #[test]
    fn format_round_trips_through_parse() {
        let h = header();
        let line = "chr1\t100\trs1\tA\tG,T\t30.00\tPASS\tAC=1,2;DP=10\tGT:DP\t0/1:8";
        let mut v = parse(&h, line).unwrap();
        v.line = None;
        let formatted = format(&h, &mut v);
        let reparsed = parse(&h, &formatted).unwrap();
        assert_eq!(reparsed.chrom, v.chrom);
        assert_eq!(reparsed.pos, v.pos);
        assert_eq!(reparsed.info.get("DP"), Some(&FieldValue::Integer(10)));
        assert_eq!(reparsed.samples[0].get("DP"), Some(&FieldValue::Integer(8)));
    }

    #[test]
    fn format_omits_missing_flag_and_prints_missing_dot() {
        let h = header();
        let line = "chr1\t1\t.\tA\tG\t.\t.\t.\t.\t.";
        let mut v = parse(&h, line).unwrap();
        let formatted = format(&h, &mut v);
        let fields: Vec<&str> = formatted.split('\t').collect();
        assert_eq!(fields[7], ".");
    }

    #[test]
    fn float_encoding_keeps_trailing_zero_like_python_str() {
        assert_eq!(python_float_str(30.0), "30.0");
        assert_eq!(python_float_str(-1.0), "-1.0");
        assert_eq!(python_float_str(1.5), "1.5");
        assert_eq!(python_float_str(0.0), "0.0");
    }
}
