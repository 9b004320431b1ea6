// Archive extraction
//
// Random access into a finished archive: enumerate samples and
// contigs, extract one contig, a substring, one sample or the whole
// collection. Group references are cached after first use; everything
// here is read-only.

use crate::codec::LzDiff;
use ahash::AHashMap;
use anyhow::Result;
use parc_common::error::ParcError;
use parc_common::{
    group_delta_stream, group_ref_stream, Catalog, Container, Contig, Header, Params, SegmentPlace,
    SEGMENT_SEPARATOR,
};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct ExtractorConfig {
    pub verbosity: u32,
}

/// Summary statistics for the `info` command
#[derive(Debug, Clone)]
pub struct ArchiveInfo {
    pub header: Header,
    pub params: Params,
    pub no_samples: usize,
    pub no_contigs: usize,
    pub no_groups: usize,
    pub total_bases: u64,
    pub reference_packed_bytes: u64,
    pub delta_packed_bytes: u64,
}

#[derive(Debug)]
pub struct Extractor {
    config: ExtractorConfig,
    container: Container,
    catalog: Catalog,
    references: AHashMap<u32, Arc<Contig>>,
}

impl Extractor {
    /// Open an archive; refuses unknown major format versions
    pub fn open<P: AsRef<Path>>(path: P, config: ExtractorConfig) -> Result<Self> {
        let mut container = Container::open(path)?;
        let catalog = Catalog::load(&mut container)?;
        if config.verbosity > 0 {
            eprintln!(
                "opened archive: {} samples, {} groups",
                catalog.no_samples(),
                catalog.groups.len()
            );
        }
        Ok(Extractor {
            config,
            container,
            catalog,
            references: AHashMap::new(),
        })
    }

    pub fn list_samples(&self) -> Vec<String> {
        self.catalog.sample_names()
    }

    /// Name of the reference sample (the first one stored)
    pub fn reference_sample(&self) -> Option<String> {
        self.catalog.samples.first().map(|s| s.name.clone())
    }

    pub fn list_contigs(&self, sample: &str) -> Result<Vec<String>> {
        let ix = self
            .catalog
            .find_sample(sample)
            .ok_or_else(|| ParcError::NotFound(format!("sample {sample}")))?;
        Ok(self.catalog.samples[ix]
            .contigs
            .iter()
            .map(|c| c.name.clone())
            .collect())
    }

    pub fn contig_len(&self, sample: &str, contig: &str) -> Result<usize> {
        let places = self.contig_places(sample, contig)?;
        Ok(places.iter().map(|p| p.raw_len as usize).sum())
    }

    fn contig_places(&self, sample: &str, contig: &str) -> Result<Vec<SegmentPlace>> {
        let sample_ix = self
            .catalog
            .find_sample(sample)
            .ok_or_else(|| ParcError::NotFound(format!("sample {sample}")))?;
        let entry = &self.catalog.samples[sample_ix];
        let contig_ix = entry
            .find_contig(contig)
            .ok_or_else(|| ParcError::NotFound(format!("contig {contig} in sample {sample}")))?;
        Ok(entry.contigs[contig_ix].segments.clone())
    }

    /// Extract one whole contig
    pub fn get_contig(&mut self, sample: &str, contig: &str) -> Result<Contig> {
        let places = self.contig_places(sample, contig)?;
        if self.config.verbosity > 1 {
            eprintln!("extracting {sample}/{contig} ({} segments)", places.len());
        }
        let mut out = Contig::new();
        for place in &places {
            out.extend_from_slice(&self.read_segment(place)?);
        }
        Ok(out)
    }

    /// Extract the substring [from, to) of a contig. The range is
    /// inclusive-exclusive and must lie within the contig.
    pub fn get_contig_range(
        &mut self,
        sample: &str,
        contig: &str,
        from: usize,
        to: usize,
    ) -> Result<Contig> {
        let places = self.contig_places(sample, contig)?;
        let total: usize = places.iter().map(|p| p.raw_len as usize).sum();
        if from >= to || to > total {
            return Err(ParcError::MalformedInput(format!(
                "range {from}-{to} outside contig {contig} (length {total})"
            ))
            .into());
        }

        let mut out = Contig::with_capacity(to - from);
        let mut offset = 0usize;
        for place in &places {
            let seg_len = place.raw_len as usize;
            let seg_end = offset + seg_len;
            if seg_end > from {
                let bytes = self.read_segment(place)?;
                let lo = from.saturating_sub(offset);
                let hi = seg_len.min(to - offset);
                out.extend_from_slice(&bytes[lo..hi]);
            }
            offset = seg_end;
            if offset >= to {
                break;
            }
        }
        Ok(out)
    }

    /// Extract every contig of a sample in declaration order
    pub fn get_sample(&mut self, sample: &str) -> Result<Vec<(String, Contig)>> {
        let names = self.list_contigs(sample)?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let data = self.get_contig(sample, &name)?;
            out.push((name, data));
        }
        Ok(out)
    }

    fn group_reference(&mut self, group_id: u32) -> Result<Arc<Contig>> {
        if let Some(reference) = self.references.get(&group_id) {
            return Ok(reference.clone());
        }
        let stream = self
            .container
            .stream_id(&group_ref_stream(group_id))
            .ok_or_else(|| {
                ParcError::Corrupt(format!("reference stream for group {group_id} missing"))
            })?;
        let (compressed, raw_len) = self.container.read_part(stream, 0)?;
        let bytes = zstd::decode_all(compressed.as_slice())
            .map_err(|e| ParcError::Corrupt(format!("reference decompression failed: {e}")))?;
        if bytes.len() as u64 != raw_len {
            return Err(ParcError::Corrupt(format!(
                "group {group_id} reference length mismatch"
            ))
            .into());
        }
        let reference = Arc::new(bytes);
        self.references.insert(group_id, reference.clone());
        Ok(reference)
    }

    /// Fetch and decode one segment
    fn read_segment(&mut self, place: &SegmentPlace) -> Result<Contig> {
        let reference = self.group_reference(place.group_id)?;
        let decoded = if place.in_group == 0 {
            (*reference).clone()
        } else {
            let payload = self.delta_payload(place)?;
            let mut lz = LzDiff::new(
                self.catalog.params.variant,
                self.catalog.params.min_match_len,
            );
            lz.set_reference(&reference);
            lz.decode(&payload)?
        };

        if decoded.len() != place.raw_len as usize {
            return Err(ParcError::Corrupt(format!(
                "segment {}:{} decoded to {} bytes, expected {}",
                place.group_id,
                place.in_group,
                decoded.len(),
                place.raw_len
            ))
            .into());
        }
        Ok(decoded)
    }

    /// Locate a delta segment inside its pack by the group's pack
    /// start table
    fn delta_payload(&mut self, place: &SegmentPlace) -> Result<Vec<u8>> {
        let entry = self
            .catalog
            .groups
            .get(place.group_id as usize)
            .ok_or_else(|| {
                ParcError::Corrupt(format!("group {} not in catalog", place.group_id))
            })?;
        let pack_ix = entry
            .pack_starts
            .partition_point(|&start| start <= place.in_group)
            .checked_sub(1)
            .ok_or_else(|| {
                ParcError::Corrupt(format!(
                    "segment {}:{} not covered by any pack",
                    place.group_id, place.in_group
                ))
            })?;
        let first_id = entry.pack_starts[pack_ix];

        let stream = self
            .container
            .stream_id(&group_delta_stream(place.group_id))
            .ok_or_else(|| {
                ParcError::Corrupt(format!("delta stream for group {} missing", place.group_id))
            })?;
        let (compressed, meta_first) = self.container.read_part(stream, pack_ix)?;
        if meta_first != first_id as u64 {
            return Err(ParcError::Corrupt(format!(
                "pack {} of group {} starts at {}, catalog says {}",
                pack_ix, place.group_id, meta_first, first_id
            ))
            .into());
        }

        let block = zstd::decode_all(compressed.as_slice())
            .map_err(|e| ParcError::Corrupt(format!("pack decompression failed: {e}")))?;
        let position = (place.in_group - first_id) as usize;
        block
            .split(|&b| b == SEGMENT_SEPARATOR)
            .nth(position)
            .map(|payload| payload.to_vec())
            .ok_or_else(|| {
                ParcError::Corrupt(format!(
                    "segment {} not present in pack {} of group {}",
                    place.in_group, pack_ix, place.group_id
                ))
                .into()
            })
    }

    pub fn info(&self) -> ArchiveInfo {
        let total_bases: u64 = self
            .catalog
            .samples
            .iter()
            .flat_map(|s| s.contigs.iter())
            .flat_map(|c| c.segments.iter())
            .map(|p| p.raw_len as u64)
            .sum();

        let mut reference_packed_bytes = 0;
        let mut delta_packed_bytes = 0;
        for id in 0..self.catalog.groups.len() as u32 {
            if let Some(s) = self.container.stream_id(&group_ref_stream(id)) {
                reference_packed_bytes += self.container.packed_size(s);
            }
            if let Some(s) = self.container.stream_id(&group_delta_stream(id)) {
                delta_packed_bytes += self.container.packed_size(s);
            }
        }

        ArchiveInfo {
            header: self.catalog.header.clone(),
            params: self.catalog.params.clone(),
            no_samples: self.catalog.no_samples(),
            no_contigs: self.catalog.no_contigs(),
            no_groups: self.catalog.groups.len(),
            total_bases,
            reference_packed_bytes,
            delta_packed_bytes,
        }
    }
}
