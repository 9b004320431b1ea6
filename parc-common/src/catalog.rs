// Archive catalog: sample, contig, group and parameter tables.
//
// The catalog is the single owning table of the archive. Groups refer to
// segments and contigs refer to (group, index) pairs by integer id only;
// there are no back pointers. Each table is stored as one stream; every
// create/append writes a fresh full snapshot part and readers use the
// last part, so appends never rewrite stored segment data.

use crate::container::Container;
use crate::error::ParcError;
use crate::naming::{
    STREAM_CONTIGS, STREAM_FALLBACK, STREAM_GROUPS, STREAM_HEADER, STREAM_PARAMS, STREAM_SAMPLES,
};
use crate::types::{parc_version, CodecVariant, ARCHIVE_FMT_MAJOR, ARCHIVE_FMT_MINOR, ARCHIVE_MAGIC};
use crate::varint::{push_cstr, push_vuint, take_cstr, take_vuint, zigzag_decode, zigzag_encode};
use ahash::AHashMap;
use anyhow::Result;

/// Marker for an absent flanking minimizer (contig end, N boundary)
pub const MISSING_MINIMIZER: u64 = u64::MAX;

/// Routing key of a segment group: the canonicalized pair of flanking
/// minimizer hashes plus a split ordinal for adaptive sub-groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub front: u64,
    pub back: u64,
    pub split: u32,
}

impl GroupKey {
    /// Canonicalize so that (a, b) and (b, a) name the same group
    pub fn new(a: u64, b: u64) -> Self {
        GroupKey {
            front: a.min(b),
            back: a.max(b),
            split: 0,
        }
    }

    pub fn with_split(self, split: u32) -> Self {
        GroupKey { split, ..self }
    }

    /// Key of the group that collects segments with no usable minimizers
    pub fn raw() -> Self {
        GroupKey::new(MISSING_MINIMIZER, MISSING_MINIMIZER)
    }

    pub fn pair(&self) -> (u64, u64) {
        (self.front, self.back)
    }
}

/// Location of one segment of a contig
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlace {
    pub group_id: u32,
    /// 0 = the group's canonical reference, stored raw
    pub in_group: u32,
    pub raw_len: u32,
}

#[derive(Debug, Clone)]
pub struct ContigEntry {
    pub name: String,
    pub segments: Vec<SegmentPlace>,
}

#[derive(Debug, Clone)]
pub struct SampleEntry {
    pub name: String,
    pub contigs: Vec<ContigEntry>,
    contig_index: AHashMap<String, usize>,
}

impl SampleEntry {
    fn new(name: String) -> Self {
        SampleEntry {
            name,
            contigs: Vec::new(),
            contig_index: AHashMap::new(),
        }
    }

    pub fn find_contig(&self, name: &str) -> Option<usize> {
        self.contig_index.get(name).copied()
    }
}

/// Per-group bookkeeping persisted in the group table
#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub key: GroupKey,
    /// Segments placed so far, reference included
    pub members: u32,
    /// First in-group id of each delta pack, in pack order. Lets the
    /// reader find a pack by binary search and lets append start a new
    /// pack without touching the last stored one.
    pub pack_starts: Vec<u32>,
}

/// Creation parameters fixed for the lifetime of an archive
#[derive(Debug, Clone)]
pub struct Params {
    pub kmer_len: u32,
    pub window: u32,
    pub segment_size: u32,
    pub min_match_len: u32,
    pub pack_cardinality: u32,
    /// Per-mille sampling rate of the reference minimizer pool used for
    /// fallback routing
    pub fallback_permille: u32,
    pub adaptive: bool,
    pub variant: CodecVariant,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            kmer_len: 21,
            window: 11,
            segment_size: 10_000,
            min_match_len: 18,
            pack_cardinality: 50,
            fallback_permille: 100,
            adaptive: false,
            variant: CodecVariant::V2,
        }
    }
}

/// Archive header: identification plus provenance
#[derive(Debug, Clone)]
pub struct Header {
    pub fmt_major: u32,
    pub fmt_minor: u32,
    pub producer: String,
    pub command_line: String,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            fmt_major: ARCHIVE_FMT_MAJOR,
            fmt_minor: ARCHIVE_FMT_MINOR,
            producer: parc_version(),
            command_line: String::new(),
        }
    }
}

#[derive(Debug)]
pub struct Catalog {
    pub header: Header,
    pub params: Params,
    pub samples: Vec<SampleEntry>,
    pub groups: Vec<GroupEntry>,
    /// Sampled reference minimizers for fallback routing, sorted
    pub fallback_pool: Vec<u64>,
    sample_index: AHashMap<String, usize>,
    /// Per-sample contig counts held between the samples and contigs
    /// loading passes
    pending_contig_counts: Vec<usize>,
}

impl Catalog {
    pub fn new(params: Params) -> Self {
        Catalog {
            header: Header::default(),
            params,
            samples: Vec::new(),
            groups: Vec::new(),
            fallback_pool: Vec::new(),
            sample_index: AHashMap::new(),
            pending_contig_counts: Vec::new(),
        }
    }

    /// Register a sample in declaration order. Names are unique.
    pub fn register_sample(&mut self, name: &str) -> Result<usize> {
        if self.sample_index.contains_key(name) {
            return Err(ParcError::MalformedInput(format!(
                "duplicate sample name: {name}"
            ))
            .into());
        }
        let idx = self.samples.len();
        self.samples.push(SampleEntry::new(name.to_string()));
        self.sample_index.insert(name.to_string(), idx);
        Ok(idx)
    }

    /// Register a contig under a sample, in declaration order
    pub fn register_contig(&mut self, sample_idx: usize, name: &str) -> Result<usize> {
        let sample = &mut self.samples[sample_idx];
        if sample.contig_index.contains_key(name) {
            return Err(ParcError::MalformedInput(format!(
                "duplicate contig name {name} in sample {}",
                sample.name
            ))
            .into());
        }
        let idx = sample.contigs.len();
        sample.contigs.push(ContigEntry {
            name: name.to_string(),
            segments: Vec::new(),
        });
        sample.contig_index.insert(name.to_string(), idx);
        Ok(idx)
    }

    pub fn set_contig_layout(
        &mut self,
        sample_idx: usize,
        contig_idx: usize,
        segments: Vec<SegmentPlace>,
    ) {
        self.samples[sample_idx].contigs[contig_idx].segments = segments;
    }

    pub fn find_sample(&self, name: &str) -> Option<usize> {
        self.sample_index.get(name).copied()
    }

    pub fn sample_names(&self) -> Vec<String> {
        self.samples.iter().map(|s| s.name.clone()).collect()
    }

    pub fn no_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn no_contigs(&self) -> usize {
        self.samples.iter().map(|s| s.contigs.len()).sum()
    }

    /// Persist all tables as fresh snapshot parts
    pub fn save(&self, container: &mut Container) -> Result<()> {
        self.save_header(container)?;
        self.save_params(container)?;
        self.save_samples(container)?;
        self.save_contigs(container)?;
        self.save_groups(container)?;
        self.save_fallback(container)?;
        Ok(())
    }

    fn save_header(&self, container: &mut Container) -> Result<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(ARCHIVE_MAGIC);
        push_vuint(&mut buf, self.header.fmt_major as u64);
        push_vuint(&mut buf, self.header.fmt_minor as u64);
        push_vuint(&mut buf, self.params.variant.to_wire());
        push_cstr(&mut buf, &self.header.producer);
        push_cstr(&mut buf, &self.header.command_line);
        let id = container.register(STREAM_HEADER);
        container.append_part(id, &buf, 0)
    }

    fn save_params(&self, container: &mut Container) -> Result<()> {
        let p = &self.params;
        let mut buf = Vec::new();
        push_vuint(&mut buf, p.kmer_len as u64);
        push_vuint(&mut buf, p.window as u64);
        push_vuint(&mut buf, p.segment_size as u64);
        push_vuint(&mut buf, p.min_match_len as u64);
        push_vuint(&mut buf, p.pack_cardinality as u64);
        push_vuint(&mut buf, p.fallback_permille as u64);
        push_vuint(&mut buf, p.adaptive as u64);
        push_vuint(&mut buf, p.variant.to_wire());
        let id = container.register(STREAM_PARAMS);
        container.append_part(id, &buf, 0)
    }

    fn save_samples(&self, container: &mut Container) -> Result<()> {
        let mut buf = Vec::new();
        push_vuint(&mut buf, self.samples.len() as u64);
        for sample in &self.samples {
            push_cstr(&mut buf, &sample.name);
            push_vuint(&mut buf, sample.contigs.len() as u64);
        }
        let id = container.register(STREAM_SAMPLES);
        container.append_part(id, &buf, self.samples.len() as u64)
    }

    fn save_contigs(&self, container: &mut Container) -> Result<()> {
        let mut buf = Vec::new();
        for sample in &self.samples {
            for contig in &sample.contigs {
                push_cstr(&mut buf, &contig.name);
                push_vuint(&mut buf, contig.segments.len() as u64);
                let mut prev_group = 0i64;
                for seg in &contig.segments {
                    let delta = seg.group_id as i64 - prev_group;
                    push_vuint(&mut buf, zigzag_encode(delta));
                    push_vuint(&mut buf, seg.in_group as u64);
                    push_vuint(&mut buf, seg.raw_len as u64);
                    prev_group = seg.group_id as i64;
                }
            }
        }
        let id = container.register(STREAM_CONTIGS);
        container.append_part(id, &buf, self.no_contigs() as u64)
    }

    fn save_groups(&self, container: &mut Container) -> Result<()> {
        let mut buf = Vec::new();
        push_vuint(&mut buf, self.groups.len() as u64);
        for group in &self.groups {
            push_vuint(&mut buf, group.key.front);
            push_vuint(&mut buf, group.key.back);
            push_vuint(&mut buf, group.key.split as u64);
            push_vuint(&mut buf, group.members as u64);
            push_vuint(&mut buf, group.pack_starts.len() as u64);
            let mut prev = 0u64;
            for &start in &group.pack_starts {
                push_vuint(&mut buf, start as u64 - prev);
                prev = start as u64;
            }
        }
        let id = container.register(STREAM_GROUPS);
        container.append_part(id, &buf, self.groups.len() as u64)
    }

    fn save_fallback(&self, container: &mut Container) -> Result<()> {
        let mut buf = Vec::new();
        push_vuint(&mut buf, self.fallback_pool.len() as u64);
        let mut prev = 0u64;
        for &m in &self.fallback_pool {
            push_vuint(&mut buf, m - prev);
            prev = m;
        }
        let id = container.register(STREAM_FALLBACK);
        container.append_part(id, &buf, self.fallback_pool.len() as u64)
    }

    /// Load the catalog from an opened archive. Refuses archives with an
    /// unknown major format version.
    pub fn load(container: &mut Container) -> Result<Self> {
        let (header, variant) = Self::load_header(container)?;
        let mut params = Self::load_params(container)?;
        params.variant = variant;

        let mut catalog = Catalog::new(params);
        catalog.header = header;
        catalog.load_samples(container)?;
        catalog.load_contigs(container)?;
        catalog.load_groups(container)?;
        catalog.load_fallback(container)?;
        Ok(catalog)
    }

    fn load_header(container: &mut Container) -> Result<(Header, CodecVariant)> {
        let id = container
            .stream_id(STREAM_HEADER)
            .ok_or_else(|| ParcError::Corrupt("header stream missing".into()))?;
        let (buf, _) = container.read_last_part(id)?;
        let mut ptr = buf.as_slice();

        if ptr.len() < 4 || &ptr[..4] != ARCHIVE_MAGIC {
            return Err(ParcError::Corrupt("bad archive magic".into()).into());
        }
        ptr = &ptr[4..];

        let fmt_major = take_vuint(&mut ptr)? as u32;
        let fmt_minor = take_vuint(&mut ptr)? as u32;
        if fmt_major > ARCHIVE_FMT_MAJOR {
            return Err(ParcError::VersionMismatch {
                found_major: fmt_major,
                found_minor: fmt_minor,
                supported_major: ARCHIVE_FMT_MAJOR,
            }
            .into());
        }
        let variant = CodecVariant::from_wire(take_vuint(&mut ptr)?)
            .ok_or_else(|| ParcError::Corrupt("unknown codec variant".into()))?;
        let producer = take_cstr(&mut ptr)?;
        let command_line = take_cstr(&mut ptr)?;

        Ok((
            Header {
                fmt_major,
                fmt_minor,
                producer,
                command_line,
            },
            variant,
        ))
    }

    fn load_params(container: &mut Container) -> Result<Params> {
        let id = container
            .stream_id(STREAM_PARAMS)
            .ok_or_else(|| ParcError::Corrupt("params stream missing".into()))?;
        let (buf, _) = container.read_last_part(id)?;
        let mut ptr = buf.as_slice();
        Ok(Params {
            kmer_len: take_vuint(&mut ptr)? as u32,
            window: take_vuint(&mut ptr)? as u32,
            segment_size: take_vuint(&mut ptr)? as u32,
            min_match_len: take_vuint(&mut ptr)? as u32,
            pack_cardinality: take_vuint(&mut ptr)? as u32,
            fallback_permille: take_vuint(&mut ptr)? as u32,
            adaptive: take_vuint(&mut ptr)? != 0,
            variant: CodecVariant::from_wire(take_vuint(&mut ptr)?)
                .ok_or_else(|| ParcError::Corrupt("unknown codec variant".into()))?,
        })
    }

    fn load_samples(&mut self, container: &mut Container) -> Result<()> {
        let id = container
            .stream_id(STREAM_SAMPLES)
            .ok_or_else(|| ParcError::Corrupt("samples stream missing".into()))?;
        let (buf, _) = container.read_last_part(id)?;
        let mut ptr = buf.as_slice();

        let no_samples = take_vuint(&mut ptr)?;
        // Contig counts are re-derived while loading the contig table;
        // here they only partition the flat contig stream.
        let mut counts = Vec::with_capacity(no_samples as usize);
        for _ in 0..no_samples {
            let name = take_cstr(&mut ptr)?;
            counts.push(take_vuint(&mut ptr)? as usize);
            self.register_sample(&name)?;
        }
        self.pending_contig_counts = counts;
        Ok(())
    }

    fn load_contigs(&mut self, container: &mut Container) -> Result<()> {
        let id = container
            .stream_id(STREAM_CONTIGS)
            .ok_or_else(|| ParcError::Corrupt("contigs stream missing".into()))?;
        let (buf, _) = container.read_last_part(id)?;
        let mut ptr = buf.as_slice();

        let counts = std::mem::take(&mut self.pending_contig_counts);
        for (sample_idx, &count) in counts.iter().enumerate() {
            for _ in 0..count {
                let name = take_cstr(&mut ptr)?;
                let contig_idx = self.register_contig(sample_idx, &name)?;
                let no_segments = take_vuint(&mut ptr)?;
                let mut segments = Vec::with_capacity(no_segments as usize);
                let mut prev_group = 0i64;
                for _ in 0..no_segments {
                    let group_id = prev_group + zigzag_decode(take_vuint(&mut ptr)?);
                    let in_group = take_vuint(&mut ptr)? as u32;
                    let raw_len = take_vuint(&mut ptr)? as u32;
                    if group_id < 0 {
                        return Err(
                            ParcError::Corrupt("negative group id in layout".into()).into()
                        );
                    }
                    segments.push(SegmentPlace {
                        group_id: group_id as u32,
                        in_group,
                        raw_len,
                    });
                    prev_group = group_id;
                }
                self.set_contig_layout(sample_idx, contig_idx, segments);
            }
        }
        Ok(())
    }

    fn load_groups(&mut self, container: &mut Container) -> Result<()> {
        let id = container
            .stream_id(STREAM_GROUPS)
            .ok_or_else(|| ParcError::Corrupt("groups stream missing".into()))?;
        let (buf, _) = container.read_last_part(id)?;
        let mut ptr = buf.as_slice();

        let no_groups = take_vuint(&mut ptr)?;
        for _ in 0..no_groups {
            let front = take_vuint(&mut ptr)?;
            let back = take_vuint(&mut ptr)?;
            let split = take_vuint(&mut ptr)? as u32;
            let members = take_vuint(&mut ptr)? as u32;
            let no_packs = take_vuint(&mut ptr)?;
            let mut pack_starts = Vec::with_capacity(no_packs as usize);
            let mut prev = 0u64;
            for _ in 0..no_packs {
                prev += take_vuint(&mut ptr)?;
                pack_starts.push(prev as u32);
            }
            self.groups.push(GroupEntry {
                key: GroupKey::new(front, back).with_split(split),
                members,
                pack_starts,
            });
        }
        Ok(())
    }

    fn load_fallback(&mut self, container: &mut Container) -> Result<()> {
        let id = container
            .stream_id(STREAM_FALLBACK)
            .ok_or_else(|| ParcError::Corrupt("fallback stream missing".into()))?;
        let (buf, _) = container.read_last_part(id)?;
        let mut ptr = buf.as_slice();

        let n = take_vuint(&mut ptr)?;
        let mut pool = Vec::with_capacity(n as usize);
        let mut prev = 0u64;
        for _ in 0..n {
            prev += take_vuint(&mut ptr)?;
            pool.push(prev);
        }
        self.fallback_pool = pool;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_catalog() -> Catalog {
        let mut catalog = Catalog::new(Params::default());
        let s0 = catalog.register_sample("ref").unwrap();
        let c0 = catalog.register_contig(s0, "chr1").unwrap();
        catalog.set_contig_layout(
            s0,
            c0,
            vec![
                SegmentPlace {
                    group_id: 0,
                    in_group: 0,
                    raw_len: 9000,
                },
                SegmentPlace {
                    group_id: 1,
                    in_group: 0,
                    raw_len: 4200,
                },
            ],
        );
        let s1 = catalog.register_sample("alt").unwrap();
        let c1 = catalog.register_contig(s1, "chr1").unwrap();
        catalog.set_contig_layout(
            s1,
            c1,
            vec![SegmentPlace {
                group_id: 0,
                in_group: 1,
                raw_len: 9003,
            }],
        );
        catalog.groups = vec![
            GroupEntry {
                key: GroupKey::new(11, 22),
                members: 2,
                pack_starts: vec![1],
            },
            GroupEntry {
                key: GroupKey::new(22, 33).with_split(1),
                members: 1,
                pack_starts: vec![],
            },
        ];
        catalog.fallback_pool = vec![5, 100, 3000];
        catalog
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.parc");

        {
            let mut container = Container::create(&path).unwrap();
            sample_catalog().save(&mut container).unwrap();
            container.finalize().unwrap();
        }

        let mut container = Container::open(&path).unwrap();
        let catalog = Catalog::load(&mut container).unwrap();

        assert_eq!(catalog.sample_names(), vec!["ref", "alt"]);
        assert_eq!(catalog.no_contigs(), 2);
        let s0 = catalog.find_sample("ref").unwrap();
        let contig = &catalog.samples[s0].contigs[0];
        assert_eq!(contig.name, "chr1");
        assert_eq!(contig.segments.len(), 2);
        assert_eq!(contig.segments[1].raw_len, 4200);

        assert_eq!(catalog.groups.len(), 2);
        assert_eq!(catalog.groups[0].key, GroupKey::new(22, 11));
        assert_eq!(catalog.groups[0].pack_starts, vec![1]);
        assert_eq!(catalog.groups[1].key.split, 1);
        assert_eq!(catalog.fallback_pool, vec![5, 100, 3000]);
        assert_eq!(catalog.params.variant, CodecVariant::V2);
    }

    #[test]
    fn duplicate_sample_rejected() {
        let mut catalog = Catalog::new(Params::default());
        catalog.register_sample("a").unwrap();
        assert!(catalog.register_sample("a").is_err());
    }

    #[test]
    fn duplicate_contig_rejected_per_sample() {
        let mut catalog = Catalog::new(Params::default());
        let s = catalog.register_sample("a").unwrap();
        catalog.register_contig(s, "chr1").unwrap();
        assert!(catalog.register_contig(s, "chr1").is_err());
        // Same contig name in a different sample is fine
        let s2 = catalog.register_sample("b").unwrap();
        assert!(catalog.register_contig(s2, "chr1").is_ok());
    }

    #[test]
    fn group_key_canonical() {
        assert_eq!(GroupKey::new(7, 3), GroupKey::new(3, 7));
        assert_ne!(GroupKey::new(3, 7), GroupKey::new(3, 7).with_split(1));
        assert_eq!(GroupKey::raw().front, MISSING_MINIMIZER);
    }
}
