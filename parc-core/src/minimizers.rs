// Window minimizers
//
// The minimizer of a window of w consecutive k-mers is the one with the
// smallest mixed hash, ties broken by leftmost position. Canonical
// k-mer codes make a sequence and its reverse complement choose the
// same minimizers, so homologous regions across samples converge on
// the same boundary markers.

use crate::kmer::CanonicalKmer;
use parc_common::{mix64, SYM_T};
use rdst::RadixSort;
use std::collections::VecDeque;

/// A minimizer occurrence within a contig
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Minimizer {
    /// Start position of the k-mer
    pub pos: usize,
    /// Mixed hash of the canonical k-mer code
    pub hash: u64,
}

/// All distinct window minimizers of a contig, in position order.
/// K-mers containing N never participate.
pub fn contig_minimizers(seq: &[u8], k: usize, w: usize) -> Vec<Minimizer> {
    debug_assert!(k >= 1 && w >= 1);
    let mut kmers: Vec<Minimizer> = Vec::new();
    let mut kmer = CanonicalKmer::new(k as u32);

    for (i, &sym) in seq.iter().enumerate() {
        if sym > SYM_T {
            kmer.reset();
            continue;
        }
        kmer.push(sym as u64);
        if kmer.is_full() {
            kmers.push(Minimizer {
                pos: i + 1 - k,
                hash: mix64(kmer.canonical()),
            });
        }
    }

    // Sliding minimum over k-mer start positions with a monotonic deque.
    // Keeping strictly-smaller entries means the leftmost wins ties.
    let mut out: Vec<Minimizer> = Vec::new();
    let mut deque: VecDeque<usize> = VecDeque::new();

    for (i, m) in kmers.iter().enumerate() {
        while deque.back().is_some_and(|&b| kmers[b].hash > m.hash) {
            deque.pop_back();
        }
        deque.push_back(i);

        // Window of start positions (m.pos - w, m.pos]
        while kmers[*deque.front().unwrap()].pos + w <= m.pos {
            deque.pop_front();
        }

        if m.pos + 1 >= w {
            let chosen = kmers[*deque.front().unwrap()];
            if out.last() != Some(&chosen) {
                out.push(chosen);
            }
        }
    }

    // A contig shorter than one window still gets its overall minimum,
    // so short segments keep a routing signal
    if out.is_empty() {
        if let Some(&min) = kmers.iter().min_by_key(|m| (m.hash, m.pos)) {
            out.push(min);
        }
    }

    out
}

/// Sample a fallback routing pool from reference minimizers. A
/// second-level mix decides membership so the choice is stable across
/// runs and independent of minimizer order; the result is sorted and
/// deduplicated.
pub fn sample_fallback_pool(minimizer_hashes: &[u64], permille: u32) -> Vec<u64> {
    const POOL_SALT: u64 = 0x9e3779b97f4a7c15;
    let mut pool: Vec<u64> = minimizer_hashes
        .iter()
        .copied()
        .filter(|&h| mix64(h ^ POOL_SALT) % 1000 < permille as u64)
        .collect();
    pool.radix_sort_unstable();
    pool.dedup();
    pool
}

/// First minimizer of a segment that belongs to the fallback pool, if
/// any. Used to route segments whose flanks carry no minimizer.
pub fn first_pool_minimizer(seq: &[u8], k: usize, w: usize, pool: &[u64]) -> Option<u64> {
    contig_minimizers(seq, k, w)
        .into_iter()
        .map(|m| m.hash)
        .find(|h| pool.binary_search(h).is_ok())
}
