// Contig segmentation
//
// Walks a contig and cuts it into segments of roughly the configured
// size, breaking at minimizer positions so that homologous regions in
// different samples cut at the same places. Segments concatenate back
// to the contig exactly; there is no overlap.

use crate::codec::MIN_NRUN_LEN;
use crate::minimizers::{contig_minimizers, first_pool_minimizer, Minimizer};
use parc_common::{Contig, GroupKey, MISSING_MINIMIZER, SYM_N};

/// One segment of a contig with its flanking minimizer hashes.
/// `MISSING_MINIMIZER` marks a flank with no minimizer (contig ends,
/// forced cuts at N-runs or oversized minimizer-free stretches).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub data: Contig,
    pub front: u64,
    pub back: u64,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Group key from the flanking minimizers; falls back to a sampled
    /// pool minimizer, then to the raw group, when both flanks are bare.
    pub fn group_key(&self, pool: &[u64], k: usize, w: usize) -> GroupKey {
        if self.front != MISSING_MINIMIZER || self.back != MISSING_MINIMIZER {
            return GroupKey::new(self.front, self.back);
        }
        match first_pool_minimizer(&self.data, k, w, pool) {
            Some(m) => GroupKey::new(m, MISSING_MINIMIZER),
            None => GroupKey::raw(),
        }
    }
}

/// Segmentation tunables
#[derive(Debug, Clone, Copy)]
pub struct SegmenterParams {
    pub kmer_len: usize,
    pub window: usize,
    /// Expected segment size; cuts are allowed in
    /// [segment_size/2, 2*segment_size] from the previous cut
    pub segment_size: usize,
}

/// Split a contig into segments. `known` reports whether a minimizer
/// hash is already a group boundary; cuts at known minimizers are
/// preferred so segments gravitate toward existing groups.
pub fn split_contig(
    seq: &[u8],
    params: &SegmenterParams,
    known: &dyn Fn(u64) -> bool,
) -> Vec<Segment> {
    let mut segments = Vec::new();
    if seq.is_empty() {
        return segments;
    }

    let minimizers = contig_minimizers(seq, params.kmer_len, params.window);

    let mut region_start = 0;
    for (run_start, run_end) in n_runs(seq) {
        if run_start > region_start {
            split_region(
                seq,
                region_start,
                run_start,
                &minimizers,
                params,
                known,
                &mut segments,
            );
        }
        // The N-run itself is one segment with bare flanks
        segments.push(Segment {
            data: seq[run_start..run_end].to_vec(),
            front: MISSING_MINIMIZER,
            back: MISSING_MINIMIZER,
        });
        region_start = run_end;
    }
    if region_start < seq.len() {
        split_region(
            seq,
            region_start,
            seq.len(),
            &minimizers,
            params,
            known,
            &mut segments,
        );
    }

    segments
}

/// Maximal runs of N long enough to force a cut on each side
fn n_runs(seq: &[u8]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut i = 0;
    while i < seq.len() {
        if seq[i] == SYM_N {
            let start = i;
            while i < seq.len() && seq[i] == SYM_N {
                i += 1;
            }
            if i - start >= MIN_NRUN_LEN as usize {
                runs.push((start, i));
            }
        } else {
            i += 1;
        }
    }
    runs
}

/// Cut one N-free region at minimizer positions
fn split_region(
    seq: &[u8],
    start: usize,
    end: usize,
    minimizers: &[Minimizer],
    params: &SegmenterParams,
    known: &dyn Fn(u64) -> bool,
    out: &mut Vec<Segment>,
) {
    let k = params.kmer_len;
    let half = (params.segment_size / 2).max(k);
    let max = 2 * params.segment_size;

    // Cutting after a minimizer k-mer keeps the whole k-mer on the left
    let first = minimizers.partition_point(|m| m.pos < start);
    let mut idx = first;
    let mut seg_start = start;
    let mut front = MISSING_MINIMIZER;

    loop {
        // Candidate cuts within the soft window
        while idx < minimizers.len() && minimizers[idx].pos + k <= seg_start + half {
            idx += 1;
        }
        let mut chosen: Option<Minimizer> = None;
        let mut fallback: Option<Minimizer> = None;
        let target = seg_start + params.segment_size;
        let mut scan = idx;
        while scan < minimizers.len() {
            let m = minimizers[scan];
            let cut = m.pos + k;
            if cut > end || cut > seg_start + max {
                break;
            }
            if known(m.hash) {
                chosen = Some(m);
                break;
            }
            let better = match fallback {
                None => true,
                Some(f) => cut.abs_diff(target) < (f.pos + k).abs_diff(target),
            };
            if better {
                fallback = Some(m);
            }
            scan += 1;
        }

        match chosen.or(fallback) {
            Some(m) => {
                let cut = m.pos + k;
                out.push(Segment {
                    data: seq[seg_start..cut].to_vec(),
                    front,
                    back: m.hash,
                });
                seg_start = cut;
                front = m.hash;
            }
            None if end - seg_start > max => {
                // No usable minimizer; force a plain cut to bound the
                // segment size
                out.push(Segment {
                    data: seq[seg_start..seg_start + max].to_vec(),
                    front,
                    back: MISSING_MINIMIZER,
                });
                seg_start += max;
                front = MISSING_MINIMIZER;
            }
            None => {
                // Remainder becomes the final segment regardless of size
                out.push(Segment {
                    data: seq[seg_start..end].to_vec(),
                    front,
                    back: MISSING_MINIMIZER,
                });
                return;
            }
        }

        if seg_start == end {
            return;
        }
    }
}
