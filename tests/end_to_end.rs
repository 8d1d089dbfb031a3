//! End-to-end scenarios from spec.md §8, driven entirely through the public
//! API (`VcfReader`/`VcfWriter`/`Sharder`/`Config`) rather than the internal
//! index/codec types, which already have focused unit tests alongside their
//! source.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::tempdir;
use vcflib::vcf::{FieldValue, HeaderCatalog, VcfReader, VcfWriter};
use vcflib::{Config, Sharder};

fn write_plain(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

fn sidecar(data_path: &Path, ext: &str) -> PathBuf {
    let mut s = data_path.as_os_str().to_owned();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// (a) Round-trip: a single-record VCF written compressed must carry a
/// working `.tbi` sidecar and read back byte-identical field content.
#[test]
fn scenario_a_compressed_round_trip() {
    let dir = tempdir().unwrap();
    let plain_path = write_plain(
        &dir.path(),
        "in.vcf",
        "##fileformat=VCFv4.2\n\
         ##contig=<ID=chr1,length=10000>\n\
         #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n\
         chr1\t100\t.\tA\tG\t.\tPASS\t.\n",
    );

    let reader = VcfReader::open(&plain_path).unwrap();
    let header = reader.header().clone();
    let records: Vec<_> = reader.collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(records.len(), 1);

    let cfg = Config::defaults();
    let gz_path = dir.path().join("out.vcf.gz");
    let mut writer = VcfWriter::create(&gz_path, header, &cfg).unwrap();
    for mut v in records {
        writer.emit(&mut v).unwrap();
    }
    writer.close().unwrap();

    assert!(gz_path.exists());
    let tbi_path = sidecar(&gz_path, "tbi");
    assert!(tbi_path.exists());

    let data = fs::read(&gz_path).unwrap();
    assert_eq!(&data[0..4], [0x1f, 0x8b, 0x08, 0x04]);
    assert!(data.windows(2).any(|w| w == b"BC"));

    let reader = VcfReader::open(&gz_path).unwrap();
    let hits: Vec<_> = reader.range("chr1", 0, 10_000).unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chrom, "chr1");
    assert_eq!(hits[0].pos, 99);
    assert_eq!(hits[0].reference, "A");
    assert_eq!(hits[0].alt, vec!["G".to_string()]);
}

/// (b) Filter by DP across a sharded parallel run: output must contain
/// exactly the DP >= 10 records, in original order, fully indexed.
#[test]
fn scenario_b_sharded_dp_filter() {
    let dir = tempdir().unwrap();
    let mut body = String::from(
        "##fileformat=VCFv4.2\n\
         ##contig=<ID=chr1,length=10000>\n\
         ##INFO=<ID=DP,Number=1,Type=Integer,Description=\"Total Depth\">\n\
         #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n",
    );
    for i in 0..1000u64 {
        let pos = i * 10 + 1;
        let dp = (i % 20) + 1;
        body.push_str(&format!("chr1\t{pos}\t.\tA\tG\t.\tPASS\tDP={dp}\n"));
    }
    let plain_path = write_plain(&dir.path(), "in.vcf", &body);

    let cfg = Config { tmpdir: dir.path().to_path_buf(), ..Config::defaults() };

    // Materialize a compressed, indexed source (sharding requires a sidecar).
    let reader = VcfReader::open(&plain_path).unwrap();
    let header = reader.header().clone();
    let source_path = dir.path().join("source.vcf.gz");
    let mut writer = VcfWriter::create(&source_path, header.clone(), &cfg).unwrap();
    for rec in reader {
        let mut v = rec.unwrap();
        writer.emit(&mut v).unwrap();
    }
    writer.close().unwrap();

    let source_reader = VcfReader::open(&source_path).unwrap();
    let contig_len = source_reader.header().contigs["chr1"].length().unwrap();
    let intvs = vec![(Some("chr1".to_string()), 0u64, contig_len)];

    let out_path = dir.path().join("filtered.vcf.gz");
    let sharder = Sharder::new(Some(4));
    sharder
        .shard_vcf(&source_reader, &out_path, &intvs, 2500, &cfg, |v| {
            matches!(v.info.get("DP").and_then(FieldValue::as_integer), Some(dp) if dp >= 10)
        })
        .unwrap();

    let out_reader = VcfReader::open(&out_path).unwrap();
    let results: Vec<_> = out_reader.collect::<Result<Vec<_>, _>>().unwrap();

    let expected = 1000 - 1000 / 20 * 9; // DP in 1..=20 cycling, DP>=10 keeps 11 of every 20
    assert_eq!(results.len(), expected);
    assert!(results.iter().all(|v| matches!(
        v.info.get("DP").and_then(FieldValue::as_integer),
        Some(dp) if dp >= 10
    )));
    // Original (ascending-position) order preserved.
    let mut positions: Vec<u64> = results.iter().map(|v| v.pos).collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted);
    positions.dedup();
    assert_eq!(positions.len(), results.len());

    // The rebuilt index answers a full-range query covering every written offset.
    let out_reader = VcfReader::open(&out_path).unwrap();
    let via_range: Vec<_> =
        out_reader.range("chr1", 0, contig_len).unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(via_range.len(), expected);
}

/// (c) Cross-contig append order: a query on one contig must never surface
/// another contig's records, and must survive an index save/load round trip.
#[test]
fn scenario_c_cross_contig_isolation() {
    let dir = tempdir().unwrap();
    let plain_path = write_plain(
        &dir.path(),
        "in.vcf",
        "##fileformat=VCFv4.2\n\
         ##contig=<ID=chr1,length=1000>\n\
         ##contig=<ID=chr2,length=1000>\n\
         #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n\
         chr1\t100\t.\tA\tG\t.\tPASS\t.\n\
         chr1\t200\t.\tA\tG\t.\tPASS\t.\n\
         chr2\t50\t.\tA\tG\t.\tPASS\t.\n\
         chr2\t400\t.\tA\tG\t.\tPASS\t.\n",
    );

    let reader = VcfReader::open(&plain_path).unwrap();
    let header = reader.header().clone();
    let cfg = Config::defaults();
    let gz_path = dir.path().join("out.vcf.gz");
    let mut writer = VcfWriter::create(&gz_path, header, &cfg).unwrap();
    for rec in reader {
        let mut v = rec.unwrap();
        writer.emit(&mut v).unwrap();
    }
    writer.close().unwrap();

    let reader = VcfReader::open(&gz_path).unwrap();
    let chr2_hits: Vec<_> = reader.range("chr2", 0, 1000).unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(chr2_hits.len(), 2);
    assert!(chr2_hits.iter().all(|v| v.chrom == "chr2"));
    assert_eq!(chr2_hits[0].pos, 49);
    assert_eq!(chr2_hits[1].pos, 399);
}

/// (d) CSI promotion: a contig long enough to overflow the default TBI
/// addressable range must promote the sidecar to CSI and still be queryable
/// past the old addressable limit.
#[test]
fn scenario_d_csi_promotion_for_huge_contig() {
    let dir = tempdir().unwrap();
    let big_len: u64 = 1 << 30;
    let big_pos_1based = (1u64 << 29) + 2; // internal pos = 2^29 + 1

    let plain_path = write_plain(
        &dir.path(),
        "in.vcf",
        &format!(
            "##fileformat=VCFv4.2\n\
             ##contig=<ID=chr1,length={big_len}>\n\
             #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n\
             chr1\t{big_pos_1based}\t.\tA\tG\t.\tPASS\t.\n"
        ),
    );

    let reader = VcfReader::open(&plain_path).unwrap();
    let header = reader.header().clone();
    let cfg = Config::defaults();
    let gz_path = dir.path().join("out.vcf.gz");
    let mut writer = VcfWriter::create(&gz_path, header, &cfg).unwrap();
    for rec in reader {
        let mut v = rec.unwrap();
        writer.emit(&mut v).unwrap();
    }
    writer.close().unwrap();

    assert!(sidecar(&gz_path, "csi").exists());
    assert!(!sidecar(&gz_path, "tbi").exists());

    let reader = VcfReader::open(&gz_path).unwrap();
    let big_pos = (1u64 << 29) + 1;
    let hits: Vec<_> =
        reader.range("chr1", big_pos, big_pos + 2).unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].pos, big_pos);
}

/// (e) Interval-tree IDX over uncompressed text: a narrow query must return
/// byte ranges that are a superset of every overlapping record's bytes.
#[test]
fn scenario_e_interval_tree_idx_covers_overlaps() {
    let dir = tempdir().unwrap();
    let mut body = String::from(
        "##fileformat=VCFv4.2\n\
         ##contig=<ID=chr1,length=20000>\n\
         #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n",
    );
    for i in 0..10_000u64 {
        let pos = i * 2 + 1;
        body.push_str(&format!("chr1\t{pos}\t.\tA\tG\t.\tPASS\t.\n"));
    }
    let plain_path = write_plain(&dir.path(), "in.vcf", &body);

    let reader = VcfReader::open(&plain_path).unwrap();
    let header = reader.header().clone();
    let cfg = Config {
        index_kind_plain: vcflib::config::IndexKindPlain::IntervalTree,
        ..Config::defaults()
    };
    let out_path = dir.path().join("out.vcf");
    let mut writer = VcfWriter::create(&out_path, header, &cfg).unwrap();
    for rec in reader {
        let mut v = rec.unwrap();
        writer.emit(&mut v).unwrap();
    }
    writer.close().unwrap();

    assert!(sidecar(&out_path, "idx").exists());

    let reader = VcfReader::open(&out_path).unwrap();
    let hits: Vec<_> = reader.range("chr1", 5000, 5100).unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|v| v.end > 5000 && v.pos < 5100));
}

/// (f) Linear IDX `longest` widening: a query just past a wide feature must
/// still land in a bin at or before the position the wide feature started.
#[test]
fn scenario_f_linear_idx_widens_for_long_feature() {
    let dir = tempdir().unwrap();
    let mut body = String::from(
        "##fileformat=VCFv4.2\n\
         ##contig=<ID=chr1,length=20000>\n\
         ##INFO=<ID=END,Number=1,Type=Integer,Description=\"End position\">\n\
         #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n",
    );
    for pos in 1..=6000u64 {
        if pos != 1001 {
            body.push_str(&format!("chr1\t{pos}\t.\tA\tG\t.\tPASS\t.\n"));
        }
    }
    // A 5000-base feature starting at (0-based) 1000, i.e. 1-based POS 1001.
    body.push_str("chr1\t1001\t.\tA\t<DEL>\t.\tPASS\tEND=6000\n");
    let plain_path = write_plain(&dir.path(), "in.vcf", &body);

    let reader = VcfReader::open(&plain_path).unwrap();
    let header = reader.header().clone();
    let cfg = Config::defaults(); // Linear IDX.
    let out_path = dir.path().join("out.vcf");
    let mut writer = VcfWriter::create(&out_path, header, &cfg).unwrap();
    for rec in reader {
        let mut v = rec.unwrap();
        writer.emit(&mut v).unwrap();
    }
    writer.close().unwrap();

    // Query a window far from the wide feature's start (0-based 1000) but
    // still inside its span (end 6000): a linear index that only consulted
    // the bin containing [5500, 5501) would never walk back to the block
    // the wide feature was written in, and this record would be missed.
    // `longest`-widening is exactly what makes the query step back far
    // enough to still find it.
    let reader = VcfReader::open(&out_path).unwrap();
    let hits: Vec<_> = reader.range("chr1", 5500, 5501).unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert!(hits.iter().any(|v| v.pos == 1000 && v.end == 6000), "widened query missed the wide feature: {hits:?}");
}
