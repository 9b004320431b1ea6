// Append behavior: archives grow without rewriting stored blocks and
// extraction is indistinguishable from a single-shot create

use parc_common::{sym_to_ascii, Contig};
use parc_core::{
    append_archive, create_archive, CompressorConfig, Extractor, ExtractorConfig, InputSet,
};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn test_config() -> CompressorConfig {
    CompressorConfig {
        segment_size: 1000,
        pack_cardinality: 3,
        no_threads: 2,
        verbosity: 0,
        ..CompressorConfig::default()
    }
}

fn write_fasta(dir: &Path, file: &str, records: &[(&str, &Contig)]) -> PathBuf {
    let path = dir.join(file);
    let mut out = File::create(&path).unwrap();
    for (name, seq) in records {
        writeln!(out, ">{name}").unwrap();
        let ascii: Vec<u8> = seq.iter().map(|&s| sym_to_ascii(s)).collect();
        out.write_all(&ascii).unwrap();
        writeln!(out).unwrap();
    }
    path
}

fn random_seq(len: usize, state: &mut u64) -> Contig {
    (0..len)
        .map(|_| {
            *state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((*state >> 33) & 3) as u8
        })
        .collect()
}

fn mutate(base: &Contig, step: usize) -> Contig {
    let mut out = base.clone();
    for pos in (step..out.len()).step_by(step) {
        out[pos] = (out[pos] + 1) & 3;
    }
    out
}

#[test]
fn append_then_list_and_extract() {
    let dir = TempDir::new().unwrap();
    let mut state = 3u64;
    let reference = random_seq(5000, &mut state);
    let a1 = mutate(&reference, 701);
    let a2 = random_seq(1200, &mut state);

    let archive = dir.path().join("grow.parc");
    let ref_fa = write_fasta(dir.path(), "r.fa", &[("chr1", &reference)]);
    create_archive(
        &archive,
        InputSet::Files(vec![("ref".into(), ref_fa)]),
        &test_config(),
    )
    .unwrap();

    {
        let extractor = Extractor::open(&archive, ExtractorConfig::default()).unwrap();
        assert_eq!(extractor.list_samples(), vec!["ref"]);
    }

    let a_fa = write_fasta(dir.path(), "a.fa", &[("chr1", &a1), ("chr2", &a2)]);
    append_archive(
        &archive,
        InputSet::Files(vec![("sampleA".into(), a_fa)]),
        &test_config(),
    )
    .unwrap();

    let mut extractor = Extractor::open(&archive, ExtractorConfig::default()).unwrap();
    assert_eq!(extractor.list_samples(), vec!["ref", "sampleA"]);
    assert_eq!(extractor.reference_sample(), Some("ref".to_string()));

    let sample = extractor.get_sample("sampleA").unwrap();
    assert_eq!(sample.len(), 2);
    assert_eq!(sample[0].0, "chr1");
    assert_eq!(sample[0].1, a1);
    assert_eq!(sample[1].0, "chr2");
    assert_eq!(sample[1].1, a2);
    assert_eq!(extractor.get_contig("ref", "chr1").unwrap(), reference);
}

#[test]
fn append_commutes_with_create_under_extraction() {
    // [R, A, B] created at once and [R] + append [A, B] must extract
    // identically for every contig
    let dir = TempDir::new().unwrap();
    let mut state = 5u64;
    let reference = random_seq(8000, &mut state);
    let a = mutate(&reference, 311);
    let b = mutate(&reference, 173);

    let ref_fa = write_fasta(dir.path(), "r.fa", &[("chr1", &reference)]);
    let a_fa = write_fasta(dir.path(), "a.fa", &[("chr1", &a)]);
    let b_fa = write_fasta(dir.path(), "b.fa", &[("chr1", &b)]);

    let at_once = dir.path().join("once.parc");
    create_archive(
        &at_once,
        InputSet::Files(vec![
            ("ref".into(), ref_fa.clone()),
            ("a".into(), a_fa.clone()),
            ("b".into(), b_fa.clone()),
        ]),
        &test_config(),
    )
    .unwrap();

    let grown = dir.path().join("grown.parc");
    create_archive(
        &grown,
        InputSet::Files(vec![("ref".into(), ref_fa)]),
        &test_config(),
    )
    .unwrap();
    append_archive(
        &grown,
        InputSet::Files(vec![("a".into(), a_fa), ("b".into(), b_fa)]),
        &test_config(),
    )
    .unwrap();

    let mut e1 = Extractor::open(&at_once, ExtractorConfig::default()).unwrap();
    let mut e2 = Extractor::open(&grown, ExtractorConfig::default()).unwrap();
    assert_eq!(e1.list_samples(), e2.list_samples());
    for sample in e1.list_samples() {
        let c1 = e1.get_sample(&sample).unwrap();
        let c2 = e2.get_sample(&sample).unwrap();
        assert_eq!(c1, c2, "sample {sample} differs");
    }
}

#[test]
fn repeated_appends_accumulate() {
    let dir = TempDir::new().unwrap();
    let mut state = 7u64;
    let reference = random_seq(4000, &mut state);

    let archive = dir.path().join("multi.parc");
    let ref_fa = write_fasta(dir.path(), "r.fa", &[("chr1", &reference)]);
    create_archive(
        &archive,
        InputSet::Files(vec![("ref".into(), ref_fa)]),
        &test_config(),
    )
    .unwrap();

    let mut expected = Vec::new();
    for round in 0..5 {
        let variant = mutate(&reference, 101 + round * 13);
        let name = format!("s{round}");
        let fa = write_fasta(dir.path(), &format!("{name}.fa"), &[("chr1", &variant)]);
        append_archive(
            &archive,
            InputSet::Files(vec![(name.clone(), fa)]),
            &test_config(),
        )
        .unwrap();
        expected.push((name, variant));
    }

    let mut extractor = Extractor::open(&archive, ExtractorConfig::default()).unwrap();
    assert_eq!(extractor.list_samples().len(), 6);
    for (name, variant) in &expected {
        assert_eq!(&extractor.get_contig(name, "chr1").unwrap(), variant);
    }
}

#[test]
fn appending_existing_sample_fails_and_preserves_archive() {
    let dir = TempDir::new().unwrap();
    let mut state = 11u64;
    let reference = random_seq(3000, &mut state);

    let archive = dir.path().join("dup.parc");
    let ref_fa = write_fasta(dir.path(), "r.fa", &[("chr1", &reference)]);
    create_archive(
        &archive,
        InputSet::Files(vec![("ref".into(), ref_fa.clone())]),
        &test_config(),
    )
    .unwrap();
    let size_before = std::fs::metadata(&archive).unwrap().len();

    let err = append_archive(
        &archive,
        InputSet::Files(vec![("ref".into(), ref_fa)]),
        &test_config(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("already stored"));

    // The failed append must leave the original archive intact
    assert_eq!(std::fs::metadata(&archive).unwrap().len(), size_before);
    let mut extractor = Extractor::open(&archive, ExtractorConfig::default()).unwrap();
    assert_eq!(extractor.get_contig("ref", "chr1").unwrap(), reference);
}
