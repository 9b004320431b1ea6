// Compression pipeline
//
// Reader -> N segment/encode workers -> packer, wired with bounded
// channels for backpressure. The reader registers samples and contigs
// in declaration order; workers segment, route and encode; the single
// packer owns the container, batches encoded segments into delta packs
// and records contig layouts. A fatal error anywhere sets the shared
// abort flag, the stages drain, finalize is skipped and no partial
// archive survives.

use crate::codec::LzDiff;
use crate::fasta::{parse_sample_header, FastaReader};
use crate::groups::{GroupManager, Placement};
use crate::minimizers::{contig_minimizers, sample_fallback_pool};
use crate::segmenter::{split_contig, Segment, SegmenterParams};
use ahash::AHashMap;
use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use parc_common::{
    group_delta_stream, group_ref_stream, Catalog, CodecVariant, Container, Contig, GroupEntry,
    Params, SegmentPlace, SEGMENT_SEPARATOR,
};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Debug, Clone)]
pub struct CompressorConfig {
    pub kmer_len: u32,
    pub window: u32,
    pub segment_size: u32,
    pub min_match_len: u32,
    pub pack_cardinality: u32,
    pub fallback_permille: u32,
    pub zstd_level: i32,
    pub no_threads: usize,
    pub verbosity: u32,
    pub adaptive: bool,
    pub variant: CodecVariant,
    /// Recorded in the archive header
    pub command_line: String,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig {
            kmer_len: 21,
            window: 11,
            segment_size: 10_000,
            min_match_len: 18,
            pack_cardinality: 50,
            fallback_permille: 100,
            zstd_level: 17,
            no_threads: thread::available_parallelism().map_or(4, |n| n.get()),
            verbosity: 1,
            adaptive: false,
            variant: CodecVariant::V2,
            command_line: String::new(),
        }
    }
}

impl CompressorConfig {
    fn params(&self) -> Params {
        Params {
            kmer_len: self.kmer_len,
            window: self.window,
            segment_size: self.segment_size,
            min_match_len: self.min_match_len,
            pack_cardinality: self.pack_cardinality,
            fallback_permille: self.fallback_permille,
            adaptive: self.adaptive,
            variant: self.variant,
        }
    }

    /// Codec and segmentation parameters are fixed at creation; an
    /// append must reuse the stored ones
    fn with_params(&self, params: &Params) -> Self {
        CompressorConfig {
            kmer_len: params.kmer_len,
            window: params.window,
            segment_size: params.segment_size,
            min_match_len: params.min_match_len,
            pack_cardinality: params.pack_cardinality,
            fallback_permille: params.fallback_permille,
            variant: params.variant,
            ..self.clone()
        }
    }
}

/// What to compress: one sample per file, or one multi-sample FASTA
/// with `sample#haplotype#chromosome` headers
pub enum InputSet {
    Files(Vec<(String, PathBuf)>),
    MultiSample(PathBuf),
}

/// Flattens the input set into (sample, contig, sequence) records in
/// declaration order
struct RecordStream {
    mode: StreamMode,
}

enum StreamMode {
    Files {
        queue: std::vec::IntoIter<(String, PathBuf)>,
        current: Option<(String, FastaReader<Box<dyn Read>>)>,
    },
    Multi {
        reader: FastaReader<Box<dyn Read>>,
        done: bool,
    },
}

impl RecordStream {
    fn open(input: InputSet) -> Result<Self> {
        let mode = match input {
            InputSet::Files(files) => StreamMode::Files {
                queue: files.into_iter(),
                current: None,
            },
            InputSet::MultiSample(path) => StreamMode::Multi {
                reader: FastaReader::open(path)?,
                done: false,
            },
        };
        Ok(RecordStream { mode })
    }

    fn next_record(&mut self) -> Result<Option<(String, String, Contig)>> {
        match &mut self.mode {
            StreamMode::Files { queue, current } => loop {
                if current.is_none() {
                    match queue.next() {
                        Some((sample, path)) => {
                            *current = Some((sample, FastaReader::open(&path)?));
                        }
                        None => return Ok(None),
                    }
                }
                let (sample, reader) = current.as_mut().unwrap();
                match reader.next_contig()? {
                    Some((header, seq)) => {
                        let (_, contig) = parse_sample_header(&header);
                        return Ok(Some((sample.clone(), contig, seq)));
                    }
                    None => *current = None,
                }
            },
            StreamMode::Multi { reader, done } => {
                if *done {
                    return Ok(None);
                }
                match reader.next_contig()? {
                    Some((header, seq)) => {
                        let (sample, contig) = parse_sample_header(&header);
                        Ok(Some((
                            sample.unwrap_or_else(|| "unknown".to_string()),
                            contig,
                            seq,
                        )))
                    }
                    None => {
                        *done = true;
                        Ok(None)
                    }
                }
            }
        }
    }
}

struct ContigTask {
    sample_ix: usize,
    contig_ix: usize,
    seq: Contig,
}

enum PackUnit {
    Reference {
        group_id: u32,
        bytes: Contig,
    },
    Delta {
        group_id: u32,
        in_group: u32,
        payload: Vec<u8>,
    },
    Layout {
        sample_ix: usize,
        contig_ix: usize,
        places: Vec<SegmentPlace>,
    },
}

/// Per-group packing state carried by the packer thread
struct GroupPack {
    next: u32,
    buffer: BTreeMap<u32, Vec<u8>>,
    starts: Vec<u32>,
}

struct PackerState {
    packs: AHashMap<u32, GroupPack>,
    /// Member counts and pack starts of preexisting groups (append)
    preloaded_members: AHashMap<u32, u32>,
    preloaded_starts: AHashMap<u32, Vec<u32>>,
}

impl PackerState {
    fn fresh() -> Self {
        PackerState {
            packs: AHashMap::new(),
            preloaded_members: AHashMap::new(),
            preloaded_starts: AHashMap::new(),
        }
    }

    fn from_catalog(catalog: &Catalog) -> Self {
        let mut state = Self::fresh();
        for (id, entry) in catalog.groups.iter().enumerate() {
            state.preloaded_members.insert(id as u32, entry.members);
            state
                .preloaded_starts
                .insert(id as u32, entry.pack_starts.clone());
        }
        state
    }

    fn pack_for(&mut self, group_id: u32) -> &mut GroupPack {
        let members = self.preloaded_members.get(&group_id).copied();
        let starts = self.preloaded_starts.remove(&group_id);
        self.packs.entry(group_id).or_insert_with(|| GroupPack {
            next: members.unwrap_or(1).max(1),
            buffer: BTreeMap::new(),
            starts: starts.unwrap_or_default(),
        })
    }
}

/// Shared failure state: first error wins, everyone drains
#[derive(Clone)]
struct AbortFlag {
    flag: Arc<AtomicBool>,
    error: Arc<Mutex<Option<anyhow::Error>>>,
}

impl AbortFlag {
    fn new() -> Self {
        AbortFlag {
            flag: Arc::new(AtomicBool::new(false)),
            error: Arc::new(Mutex::new(None)),
        }
    }

    fn raised(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    fn raise(&self, err: anyhow::Error) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.flag.store(true, Ordering::Relaxed);
    }

    fn into_error(self) -> Option<anyhow::Error> {
        self.error.lock().unwrap().take()
    }
}

/// Create a new archive from the given inputs. The first sample seen
/// becomes the reference sample; its minimizers seed the fallback
/// routing pool.
pub fn create_archive(output: &Path, input: InputSet, config: &CompressorConfig) -> Result<()> {
    let mut catalog = Catalog::new(config.params());
    catalog.header.command_line = config.command_line.clone();
    let manager = GroupManager::new(config.variant, config.min_match_len, config.adaptive);

    let mut stream = RecordStream::open(input)?;
    let (reference_records, carried) = collect_reference_sample(&mut stream)?;

    if config.verbosity > 0 {
        let bases: usize = reference_records.iter().map(|r| r.2.len()).sum();
        eprintln!(
            "reference sample: {} ({} contigs, {} bases)",
            reference_records[0].0,
            reference_records.len(),
            bases
        );
    }

    // Fallback pool from the reference sample's minimizers
    let hashes: Vec<u64> = reference_records
        .par_iter()
        .flat_map_iter(|(_, _, seq)| {
            contig_minimizers(seq, config.kmer_len as usize, config.window as usize)
                .into_iter()
                .map(|m| m.hash)
        })
        .collect();
    catalog.fallback_pool = sample_fallback_pool(&hashes, config.fallback_permille);
    if config.verbosity > 1 {
        eprintln!(
            "fallback pool: {} of {} minimizers",
            catalog.fallback_pool.len(),
            hashes.len()
        );
    }

    let container = Container::create(output)?;
    let outcome = run_pipeline(
        container,
        catalog,
        manager,
        reference_records,
        carried,
        stream,
        config,
        PackerState::fresh(),
    );

    if let Err(err) = outcome {
        let _ = std::fs::remove_file(output);
        return Err(err);
    }
    Ok(())
}

/// Append samples to an existing archive. Stored creation parameters
/// override the codec and segmentation settings in `config`.
pub fn append_archive(archive: &Path, input: InputSet, config: &CompressorConfig) -> Result<()> {
    // Read pass: catalog plus every group's canonical reference
    let (catalog, references) = {
        let mut container = Container::open(archive)?;
        let catalog = Catalog::load(&mut container)?;
        let mut references = Vec::with_capacity(catalog.groups.len());
        for id in 0..catalog.groups.len() as u32 {
            let stream = container
                .stream_id(&group_ref_stream(id))
                .with_context(|| format!("reference stream for group {id} missing"))?;
            let (compressed, _) = container.read_part(stream, 0)?;
            references.push(Arc::new(zstd::decode_all(compressed.as_slice())?));
        }
        (catalog, references)
    };

    let config = config.with_params(&catalog.params);
    let manager = GroupManager::from_catalog(&catalog, references, config.adaptive);
    let packer = PackerState::from_catalog(&catalog);
    let stream = RecordStream::open(input)?;

    if config.verbosity > 0 {
        eprintln!(
            "appending to archive with {} samples, {} groups",
            catalog.no_samples(),
            catalog.groups.len()
        );
    }

    let container = Container::open_append(archive)?;
    run_pipeline(
        container,
        catalog,
        manager,
        Vec::new(),
        None,
        stream,
        &config,
        packer,
    )
}

type RawRecord = (String, String, Contig);

/// Read every contig of the first declared sample, returning them plus
/// the first record of the following sample, if any
fn collect_reference_sample(
    stream: &mut RecordStream,
) -> Result<(Vec<RawRecord>, Option<RawRecord>)> {
    let mut records = Vec::new();
    let first = stream
        .next_record()?
        .context("input contains no sequences")?;
    let reference_name = first.0.clone();
    records.push(first);

    loop {
        match stream.next_record()? {
            Some(record) if record.0 == reference_name => records.push(record),
            other => return Ok((records, other)),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_pipeline(
    container: Container,
    catalog: Catalog,
    manager: GroupManager,
    pending: Vec<RawRecord>,
    carried: Option<RawRecord>,
    mut stream: RecordStream,
    config: &CompressorConfig,
    packer_state: PackerState,
) -> Result<()> {
    let abort = AbortFlag::new();
    let appending = !catalog.samples.is_empty();
    let preexisting_samples = catalog.no_samples();
    let catalog = Arc::new(Mutex::new(catalog));
    let manager = Arc::new(manager);
    let pool = Arc::new(catalog.lock().unwrap().fallback_pool.clone());
    let processed_bases = Arc::new(AtomicU64::new(0));

    let workers = config.no_threads.max(1);
    let (work_tx, work_rx) = bounded::<ContigTask>(4 * workers);
    let (pack_tx, pack_rx) = bounded::<PackUnit>(8 * workers);

    let worker_handles: Vec<_> = (0..workers)
        .map(|_| {
            let work_rx = work_rx.clone();
            let pack_tx = pack_tx.clone();
            let manager = manager.clone();
            let pool = pool.clone();
            let abort = abort.clone();
            let processed_bases = processed_bases.clone();
            let config = config.clone();
            thread::spawn(move || {
                worker_loop(
                    work_rx,
                    pack_tx,
                    &manager,
                    &pool,
                    &abort,
                    &processed_bases,
                    &config,
                )
            })
        })
        .collect();
    drop(work_rx);
    drop(pack_tx);

    let packer_handle = {
        let catalog = catalog.clone();
        let abort = abort.clone();
        let config = config.clone();
        thread::spawn(move || packer_loop(pack_rx, container, packer_state, catalog, abort, config))
    };

    // Reader stage: this thread
    let read_result = feed_records(
        pending,
        carried,
        &mut stream,
        &catalog,
        preexisting_samples,
        &work_tx,
        &abort,
    );
    if let Err(err) = read_result {
        abort.raise(err);
    }
    drop(work_tx);

    for handle in worker_handles {
        let _ = handle.join();
    }
    let (mut container, packer_state) = packer_handle
        .join()
        .map_err(|_| anyhow::anyhow!("packer thread panicked"))?;

    if abort.raised() {
        if appending {
            let _ = container.abort_append();
        }
        return Err(abort
            .into_error()
            .unwrap_or_else(|| anyhow::anyhow!("compression aborted")));
    }

    // Close: group table, catalog snapshot, container footer
    let mut catalog = Arc::into_inner(catalog)
        .expect("all catalog users joined")
        .into_inner()
        .unwrap();
    let mut packs = packer_state.packs;
    let mut preloaded_starts = packer_state.preloaded_starts;
    catalog.groups = manager
        .export_keys()
        .into_iter()
        .map(|(id, key, members)| GroupEntry {
            key,
            members,
            pack_starts: packs
                .remove(&id)
                .map(|p| p.starts)
                .or_else(|| preloaded_starts.remove(&id))
                .unwrap_or_default(),
        })
        .collect();

    catalog.save(&mut container)?;
    container.finalize()?;

    if config.verbosity > 0 {
        eprintln!(
            "stored {} samples, {} contigs, {} groups, {} bases",
            catalog.no_samples(),
            catalog.no_contigs(),
            catalog.groups.len(),
            processed_bases.load(Ordering::Relaxed)
        );
    }
    Ok(())
}

fn feed_records(
    pending: Vec<RawRecord>,
    carried: Option<RawRecord>,
    stream: &mut RecordStream,
    catalog: &Arc<Mutex<Catalog>>,
    preexisting_samples: usize,
    work_tx: &Sender<ContigTask>,
    abort: &AbortFlag,
) -> Result<()> {
    let submit = |record: RawRecord| -> Result<()> {
        if abort.raised() {
            return Ok(());
        }
        let (sample, contig, seq) = record;
        let mut catalog = catalog.lock().unwrap();
        // Multi-sample inputs may interleave samples; reuse the index
        // of a sample declared earlier in this run. Samples already in
        // the archive cannot be extended.
        let sample_ix = match catalog.find_sample(&sample) {
            Some(ix) if ix >= preexisting_samples => ix,
            Some(_) => {
                return Err(parc_common::ParcError::MalformedInput(format!(
                    "sample {sample} already stored in archive"
                ))
                .into());
            }
            None => catalog.register_sample(&sample)?,
        };
        let contig_ix = catalog.register_contig(sample_ix, &contig)?;
        drop(catalog);

        // Send failure only happens after the packer died; the abort
        // flag then carries the real error
        let _ = work_tx.send(ContigTask {
            sample_ix,
            contig_ix,
            seq,
        });
        Ok(())
    };

    for record in pending {
        submit(record)?;
    }
    if let Some(record) = carried {
        submit(record)?;
    }
    while let Some(record) = stream.next_record()? {
        submit(record)?;
        if abort.raised() {
            break;
        }
    }
    Ok(())
}

fn worker_loop(
    work_rx: Receiver<ContigTask>,
    pack_tx: Sender<PackUnit>,
    manager: &GroupManager,
    pool: &[u64],
    abort: &AbortFlag,
    processed_bases: &AtomicU64,
    config: &CompressorConfig,
) {
    let seg_params = SegmenterParams {
        kmer_len: config.kmer_len as usize,
        window: config.window as usize,
        segment_size: config.segment_size as usize,
    };
    // Encoders with a prepared index, keyed by group; flushed when the
    // map grows past the cap to bound worker memory
    let mut encoders: AHashMap<u32, LzDiff> = AHashMap::new();
    const ENCODER_CACHE_CAP: usize = 64;

    while let Ok(ContigTask {
        sample_ix,
        contig_ix,
        seq,
    }) = work_rx.recv()
    {
        if abort.raised() {
            continue;
        }
        processed_bases.fetch_add(seq.len() as u64, Ordering::Relaxed);

        let segments = split_contig(&seq, &seg_params, &|h| manager.is_known_minimizer(h));
        let mut places = Vec::with_capacity(segments.len());

        for segment in &segments {
            let key = segment.group_key(pool, seg_params.kmer_len, seg_params.window);
            let placement = manager.place(key, &segment.data);
            places.push(SegmentPlace {
                group_id: placement.group_id,
                in_group: placement.in_group,
                raw_len: segment.len() as u32,
            });
            let unit = encode_unit(segment, &placement, &mut encoders, config);
            if encoders.len() > ENCODER_CACHE_CAP {
                encoders.clear();
            }
            if pack_tx.send(unit).is_err() {
                return;
            }
        }

        if pack_tx
            .send(PackUnit::Layout {
                sample_ix,
                contig_ix,
                places,
            })
            .is_err()
        {
            return;
        }
    }
}

fn encode_unit(
    segment: &Segment,
    placement: &Placement,
    encoders: &mut AHashMap<u32, LzDiff>,
    config: &CompressorConfig,
) -> PackUnit {
    match &placement.reference {
        None => PackUnit::Reference {
            group_id: placement.group_id,
            bytes: segment.data.clone(),
        },
        Some(reference) => {
            let encoder = encoders.entry(placement.group_id).or_insert_with(|| {
                let mut lz = LzDiff::new(config.variant, config.min_match_len);
                lz.set_reference(reference);
                lz
            });
            PackUnit::Delta {
                group_id: placement.group_id,
                in_group: placement.in_group,
                payload: encoder.encode(&segment.data),
            }
        }
    }
}

fn packer_loop(
    pack_rx: Receiver<PackUnit>,
    mut container: Container,
    mut state: PackerState,
    catalog: Arc<Mutex<Catalog>>,
    abort: AbortFlag,
    config: CompressorConfig,
) -> (Container, PackerState) {
    while let Ok(unit) = pack_rx.recv() {
        if abort.raised() {
            continue;
        }
        if let Err(err) = handle_pack_unit(unit, &mut container, &mut state, &catalog, &config) {
            abort.raise(err);
        }
    }

    if !abort.raised() {
        if let Err(err) = flush_partial_packs(&mut container, &mut state, &config) {
            abort.raise(err);
        }
    }
    (container, state)
}

fn handle_pack_unit(
    unit: PackUnit,
    container: &mut Container,
    state: &mut PackerState,
    catalog: &Arc<Mutex<Catalog>>,
    config: &CompressorConfig,
) -> Result<()> {
    match unit {
        PackUnit::Reference { group_id, bytes } => {
            let compressed = zstd::encode_all(bytes.as_slice(), config.zstd_level)?;
            let id = container.register(&group_ref_stream(group_id));
            container.append_part(id, &compressed, bytes.len() as u64)?;
            container.add_raw_size(id, bytes.len() as u64);
        }
        PackUnit::Delta {
            group_id,
            in_group,
            payload,
        } => {
            let pack = state.pack_for(group_id);
            pack.buffer.insert(in_group, payload);
            flush_ready_packs(container, state, group_id, config, false)?;
        }
        PackUnit::Layout {
            sample_ix,
            contig_ix,
            places,
        } => {
            catalog
                .lock()
                .unwrap()
                .set_contig_layout(sample_ix, contig_ix, places);
        }
    }
    Ok(())
}

/// Emit delta packs for a group while a full run of consecutive
/// in-group ids is buffered; `force` also emits the final short pack
fn flush_ready_packs(
    container: &mut Container,
    state: &mut PackerState,
    group_id: u32,
    config: &CompressorConfig,
    force: bool,
) -> Result<()> {
    let cardinality = config.pack_cardinality.max(1);
    let pack = state.pack_for(group_id);

    loop {
        let mut run = 0u32;
        while pack.buffer.contains_key(&(pack.next + run)) {
            run += 1;
            if run == cardinality {
                break;
            }
        }
        let emit = if run == cardinality {
            cardinality
        } else if force && run > 0 && run as usize == pack.buffer.len() {
            run
        } else {
            break;
        };

        let mut block = Vec::new();
        for ig in pack.next..pack.next + emit {
            let payload = pack.buffer.remove(&ig).expect("run was checked");
            block.extend_from_slice(&payload);
            block.push(SEGMENT_SEPARATOR);
        }
        let compressed = zstd::encode_all(block.as_slice(), config.zstd_level)?;
        let id = container.register(&group_delta_stream(group_id));
        container.append_part(id, &compressed, pack.next as u64)?;
        container.add_raw_size(id, block.len() as u64);
        pack.starts.push(pack.next);
        pack.next += emit;
    }
    Ok(())
}

fn flush_partial_packs(
    container: &mut Container,
    state: &mut PackerState,
    config: &CompressorConfig,
) -> Result<()> {
    // Sorted so stream registration order, and with it the archive
    // bytes, stay deterministic
    let mut group_ids: Vec<u32> = state.packs.keys().copied().collect();
    group_ids.sort_unstable();
    for group_id in group_ids {
        flush_ready_packs(container, state, group_id, config, true)?;
        let pack = state.pack_for(group_id);
        if !pack.buffer.is_empty() {
            return Err(parc_common::ParcError::Corrupt(format!(
                "group {group_id} has non-contiguous segments after drain"
            ))
            .into());
        }
    }
    Ok(())
}
