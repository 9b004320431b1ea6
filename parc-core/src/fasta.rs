// FASTA reading and writing
//
// Input accepts plain or gzip-compressed FASTA over {A,C,G,T,N}
// (case-insensitive); anything else in sequence lines aborts the
// ingest. Output wraps sequence lines at 80 columns.

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use parc_common::error::ParcError;
use parc_common::{ascii_to_sym, sym_to_ascii, Contig};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

pub struct FastaReader<R> {
    reader: BufReader<R>,
    pending_header: Option<String>,
    line: Vec<u8>,
    saw_any_record: bool,
}

impl FastaReader<Box<dyn Read>> {
    /// Open a FASTA file; `.gz` suffixed files are decompressed on the
    /// fly (multi-member gzip included)
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("cannot open input {}", path.display()))?;
        let inner: Box<dyn Read> = if path.extension().and_then(|e| e.to_str()) == Some("gz") {
            Box::new(MultiGzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(FastaReader::new(inner))
    }
}

impl<R: Read> FastaReader<R> {
    pub fn new(inner: R) -> Self {
        FastaReader {
            reader: BufReader::with_capacity(1 << 20, inner),
            pending_header: None,
            line: Vec::with_capacity(1 << 10),
            saw_any_record: false,
        }
    }

    /// Next record as (header, symbols); None at end of input
    pub fn next_contig(&mut self) -> Result<Option<(String, Contig)>> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => loop {
                self.line.clear();
                if self.reader.read_until(b'\n', &mut self.line)? == 0 {
                    if !self.saw_any_record {
                        return Err(
                            ParcError::MalformedInput("no FASTA records in input".into()).into(),
                        );
                    }
                    return Ok(None);
                }
                let trimmed = trim_line(&self.line);
                if trimmed.is_empty() {
                    continue;
                }
                if trimmed[0] != b'>' {
                    return Err(ParcError::MalformedInput(
                        "sequence data before first FASTA header".into(),
                    )
                    .into());
                }
                break String::from_utf8_lossy(&trimmed[1..]).trim().to_string();
            },
        };

        self.saw_any_record = true;
        let mut sequence = Contig::new();
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line)? == 0 {
                break;
            }
            let trimmed = trim_line(&self.line);
            if trimmed.is_empty() {
                continue;
            }
            if trimmed[0] == b'>' {
                self.pending_header =
                    Some(String::from_utf8_lossy(&trimmed[1..]).trim().to_string());
                break;
            }
            for &c in trimmed {
                match ascii_to_sym(c) {
                    Some(sym) => sequence.push(sym),
                    None => {
                        return Err(ParcError::MalformedInput(format!(
                            "symbol {:?} in record {} is not in the A/C/G/T/N alphabet",
                            c as char, header
                        ))
                        .into());
                    }
                }
            }
        }

        if sequence.is_empty() {
            return Err(ParcError::MalformedInput(format!(
                "record {header} has no sequence (truncated input?)"
            ))
            .into());
        }
        Ok(Some((header, sequence)))
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|&c| c != b'\n' && c != b'\r' && c != b' ' && c != b'\t')
        .map_or(0, |p| p + 1);
    &line[..end]
}

/// Split a `sample#haplotype#chromosome` header into sample and contig
/// names; plain headers keep their first whitespace token as the contig
/// name and carry no sample.
pub fn parse_sample_header(header: &str) -> (Option<String>, String) {
    let name = header.split_whitespace().next().unwrap_or(header);
    let parts: Vec<&str> = name.split('#').collect();
    if parts.len() >= 3 {
        (
            Some(format!("{}#{}", parts[0], parts[1])),
            parts[2..].join("#"),
        )
    } else {
        (None, name.to_string())
    }
}

/// Whether the first record header carries embedded sample names
pub fn detect_multi_sample<P: AsRef<Path>>(path: P) -> Result<bool> {
    let mut reader = FastaReader::open(path)?;
    match reader.next_contig()? {
        Some((header, _)) => Ok(parse_sample_header(&header).0.is_some()),
        None => Ok(false),
    }
}

pub struct FastaWriter<W> {
    writer: W,
}

const LINE_WIDTH: usize = 80;

impl<W: Write> FastaWriter<W> {
    pub fn new(writer: W) -> Self {
        FastaWriter { writer }
    }

    pub fn write_contig(&mut self, name: &str, sequence: &Contig) -> Result<()> {
        writeln!(self.writer, ">{name}")?;
        let mut line = [0u8; LINE_WIDTH];
        for chunk in sequence.chunks(LINE_WIDTH) {
            for (i, &sym) in chunk.iter().enumerate() {
                line[i] = sym_to_ascii(sym);
            }
            self.writer.write_all(&line[..chunk.len()])?;
            writeln!(self.writer)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_records_in_order() {
        let data = b">seq1\nACGT\nacgt\n>seq2 description\nTTNN\n";
        let mut reader = FastaReader::new(Cursor::new(&data[..]));

        let (name, seq) = reader.next_contig().unwrap().unwrap();
        assert_eq!(name, "seq1");
        assert_eq!(seq, vec![0, 1, 2, 3, 0, 1, 2, 3]);

        let (name, seq) = reader.next_contig().unwrap().unwrap();
        assert_eq!(name, "seq2 description");
        assert_eq!(seq, vec![3, 3, 4, 4]);

        assert!(reader.next_contig().unwrap().is_none());
    }

    #[test]
    fn rejects_non_dna_symbols() {
        let data = b">seq\nACGR\n";
        let mut reader = FastaReader::new(Cursor::new(&data[..]));
        let err = reader.next_contig().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ParcError>(),
            Some(ParcError::MalformedInput(_))
        ));
    }

    #[test]
    fn rejects_headerless_input() {
        let data = b"ACGT\n";
        let mut reader = FastaReader::new(Cursor::new(&data[..]));
        assert!(reader.next_contig().is_err());
    }

    #[test]
    fn rejects_empty_input() {
        let mut reader = FastaReader::new(Cursor::new(&b""[..]));
        assert!(reader.next_contig().is_err());
    }

    #[test]
    fn rejects_truncated_record() {
        let data = b">seq1\nACGT\n>seq2\n";
        let mut reader = FastaReader::new(Cursor::new(&data[..]));
        reader.next_contig().unwrap().unwrap();
        assert!(reader.next_contig().is_err());
    }

    #[test]
    fn sample_header_parsing() {
        assert_eq!(
            parse_sample_header("S288C#1#chrI"),
            (Some("S288C#1".into()), "chrI".into())
        );
        assert_eq!(
            parse_sample_header("AAA#0#chr1_part#x"),
            (Some("AAA#0".into()), "chr1_part#x".into())
        );
        assert_eq!(parse_sample_header("chr7 extra"), (None, "chr7".into()));
    }

    #[test]
    fn writer_wraps_lines() {
        let mut out = Vec::new();
        {
            let mut writer = FastaWriter::new(&mut out);
            let seq: Contig = (0..200).map(|i| (i % 4) as u8).collect();
            writer.write_contig("chrX", &seq).unwrap();
        }
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(">chrX"));
        let body: Vec<&str> = lines.collect();
        assert_eq!(body.len(), 3);
        assert!(body[..2].iter().all(|l| l.len() == 80));
        assert_eq!(body[2].len(), 40);
    }

    #[test]
    fn writer_reader_roundtrip() {
        let seq: Contig = vec![0, 1, 2, 3, 4, 4, 3, 2, 1, 0];
        let mut out = Vec::new();
        FastaWriter::new(&mut out)
            .write_contig("roundtrip", &seq)
            .unwrap();
        let mut reader = FastaReader::new(Cursor::new(out));
        let (name, parsed) = reader.next_contig().unwrap().unwrap();
        assert_eq!(name, "roundtrip");
        assert_eq!(parsed, seq);
    }
}
