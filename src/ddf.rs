//! The decaying duplicate filter (§2 "Decaying Duplicate Filter (DDF)",
//! §4.2).
//!
//! A two-generation rotating Bloom filter: `current` absorbs new inserts,
//! `previous` is what `current` looked like one rotation ago. Membership is
//! tested against their union, so an entry inserted anywhere in a window
//! survives for one to two rotations before both generations have aged it
//! out. Rotation is driven by the same [`crate::timer::TimerService`]
//! abstraction the admission queue uses, for the same reason: a fake clock
//! in tests, a real one spawned on Tokio in production.

use crate::error::DdfError;
use crate::stats::DdfStats;
use crate::timer::{TimerHandle, TimerService};
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Bit-array width in bits: `2^23`, ≈ 1 MiB per generation (§4.2 "Sizing").
const M_BITS: usize = 1 << 23;

/// Hash positions per insert/test (§4.2 "Sizing").
const K_HASHES: usize = 11;

/// Number of `entry_bytes`-length extenders needed to widen an entry up to
/// 32 bytes (§3 "DDF state": `ceil(32 / entry_bytes) − 1`).
fn num_extenders(entry_bytes: usize) -> usize {
    (32 + entry_bytes - 1) / entry_bytes - 1
}

/// Construction-time parameters for a [`DecayingDuplicateFilter`].
#[derive(Debug, Clone, Copy)]
pub struct DecayingDuplicateFilterConfig {
    /// Rotation period; an entry's guaranteed membership lifetime is
    /// `[duration_ms, 2 * duration_ms)` (§4.2 "Rotation").
    pub duration_ms: u64,
    /// Fixed width, in bytes, every `add`/`add_long` entry is encoded to.
    /// Must be in `1..=8` for `add_long`'s numeric encoding to be
    /// meaningful; `add` itself accepts any configured width.
    pub entry_bytes: usize,
}

impl Default for DecayingDuplicateFilterConfig {
    fn default() -> Self {
        Self {
            duration_ms: 10 * 60 * 1000,
            entry_bytes: 8,
        }
    }
}

/// A fixed-size bitset backing one generation.
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn new(bits: usize) -> Self {
        Self {
            words: vec![0u64; (bits + 63) / 64],
        }
    }

    fn set(&mut self, position: usize) {
        self.words[position / 64] |= 1u64 << (position % 64);
    }

    fn test(&self, position: usize) -> bool {
        self.words[position / 64] & (1u64 << (position % 64)) != 0
    }

    fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }

    fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}

struct DdfState {
    current: BitSet,
    previous: BitSet,
}

impl DdfState {
    fn new(m: usize) -> Self {
        Self {
            current: BitSet::new(m),
            previous: BitSet::new(m),
        }
    }

    fn contains(&self, positions: &[usize]) -> bool {
        positions
            .iter()
            .all(|&p| self.current.test(p) || self.previous.test(p))
    }

    fn insert(&mut self, positions: &[usize]) {
        for &p in positions {
            self.current.set(p);
            self.previous.set(p);
        }
    }
}

/// Two-generation rotating Bloom filter giving O(1) insert-and-test replay
/// detection over a bounded, sliding time window (§4.2).
///
/// Construction returns an `Arc` because rotation re-arms itself against the
/// injected timer, the same self-rescheduling pattern `admission` uses for
/// per-entry timeouts.
pub struct DecayingDuplicateFilter {
    state: Mutex<DdfState>,
    config: DecayingDuplicateFilterConfig,
    extenders: Vec<Vec<u8>>,
    stats: DdfStats,
    timer: Arc<dyn TimerService>,
    rotation_handle: Mutex<Option<TimerHandle>>,
    stopped: AtomicBool,
}

impl DecayingDuplicateFilter {
    pub fn new(
        config: DecayingDuplicateFilterConfig,
        timer: Arc<dyn TimerService>,
    ) -> Arc<Self> {
        assert!(config.entry_bytes > 0, "entry_bytes must be nonzero");
        // ceil(32 / entry_bytes) - 1 extenders, each entry_bytes long (§3
        // "DDF state"); zero of them when entry_bytes >= 32, since `widen`
        // uses such entries as-is.
        let extenders = if config.entry_bytes >= 32 {
            Vec::new()
        } else {
            (0..num_extenders(config.entry_bytes))
                .map(|_| (0..config.entry_bytes).map(|_| rand::random()).collect())
                .collect()
        };
        let filter = Arc::new(Self {
            state: Mutex::new(DdfState::new(M_BITS)),
            config,
            extenders,
            stats: DdfStats::default(),
            timer,
            rotation_handle: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });
        Arc::clone(&filter).arm_rotation();
        filter
    }

    fn arm_rotation(self: Arc<Self>) {
        let handler_filter = self.clone();
        let handle = self.timer.schedule(
            self.config.duration_ms as i64,
            Box::new(move || handler_filter.rotate()),
        );
        *self.rotation_handle.lock().unwrap() = Some(handle);
    }

    /// Swaps generations, clears the new `current`, and re-arms itself
    /// unless [`Self::stop_decaying`] has run (§4.2 "Rotation").
    fn rotate(self: Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            std::mem::swap(&mut state.current, &mut state.previous);
            state.current.clear();
        }
        self.stats.current_duplicates.store(0, Ordering::Relaxed);
        self.stats.rotations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            size = self.size(),
            "duplicate filter generation rotated"
        );
        if !self.stopped.load(Ordering::Acquire) {
            self.arm_rotation();
        }
    }

    /// Cancels the rotation timer. Idempotent; a filter that has already
    /// stopped answers queries against whatever generations it last had.
    pub fn stop_decaying(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.rotation_handle.lock().unwrap().take() {
            self.timer.cancel(handle);
        }
    }

    /// Inserts `entry` and reports whether it was already present
    /// (§4.2 "Public operations"). Rejects an `entry` whose length does not
    /// match the configured `entry_bytes` (§7 "Wrong-length DDF entry").
    pub fn add(&self, entry: &[u8]) -> Result<bool, DdfError> {
        if entry.len() != self.config.entry_bytes {
            return Err(DdfError::WrongLength {
                expected: self.config.entry_bytes,
                actual: entry.len(),
            });
        }
        let positions = self.positions_for(entry);
        let mut state = self.state.lock().unwrap();
        let already_present = state.contains(&positions);
        state.insert(&positions);
        drop(state);
        if already_present {
            self.stats.current_duplicates.fetch_add(1, Ordering::Relaxed);
        }
        Ok(already_present)
    }

    /// Convenience wrapper around [`Self::add`] for fixed-width numeric
    /// entries (§4.2 "Long encoding"). The fold is the recommended
    /// replacement for the historical bit-twiddle: `entry`'s little-endian
    /// bit pattern truncated to `entry_bytes`. For a caller representing a
    /// negative number, the two's-complement bit pattern of that number
    /// (already what `as u64` produces) survives the same truncation, so no
    /// separate sign handling is needed; this is what the spec calls
    /// "normalized two's-complement truncation". `0` and `-0` cannot both
    /// occur because there is only one all-zero bit pattern.
    ///
    /// Only meaningful for a filter configured with `entry_bytes` in
    /// `1..=8`: a filter configured for wider raw entries (`entry_bytes >=
    /// 32`, used with [`Self::add`] directly) has no numeric encoding to
    /// offer, and this returns [`DdfError::LongWidthUnsupported`] rather than
    /// silently truncating the value.
    pub fn add_long(&self, entry: u64) -> Result<bool, DdfError> {
        let encoded = self.encode_long(entry)?;
        self.add(&encoded)
    }

    /// Membership test without insert (§4.2 "Public operations"). Like
    /// [`Self::add_long`], only meaningful for `entry_bytes` in `1..=8`; for
    /// any other configuration this always returns `false` rather than
    /// hashing a truncated, inconsistent encoding.
    pub fn is_known(&self, entry: u64) -> bool {
        let Ok(encoded) = self.encode_long(entry) else {
            return false;
        };
        let positions = self.positions_for(&encoded);
        self.state.lock().unwrap().contains(&positions)
    }

    /// Empties both generations and resets the duplicate counter.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.current.clear();
        state.previous.clear();
        drop(state);
        self.stats.current_duplicates.store(0, Ordering::Relaxed);
    }

    /// Estimated number of set bits across both generations; an occupancy
    /// proxy, not an exact insert count (§4.2 "Failure modes").
    pub fn size(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.current.count_ones().max(state.previous.count_ones())
    }

    /// Estimated false-positive rate derived from [`Self::size`] and the
    /// filter's fixed `(m, k)`: the probability that `k` independently
    /// chosen bits are all already set, given the observed occupancy
    /// fraction (§4.2 "Failure modes").
    pub fn false_positive_rate(&self) -> f64 {
        let occupancy = self.size() as f64 / M_BITS as f64;
        occupancy.powi(K_HASHES as i32)
    }

    /// Number of `add` calls since the last rotation that found their entry
    /// already present (§6 "Observability").
    pub fn current_duplicate_count(&self) -> u64 {
        self.stats.current_duplicates.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &DdfStats {
        &self.stats
    }

    fn encode_long(&self, entry: u64) -> Result<Vec<u8>, DdfError> {
        let width = self.config.entry_bytes;
        if width == 0 || width > 8 {
            return Err(DdfError::LongWidthUnsupported { entry_bytes: width });
        }
        Ok(entry.to_le_bytes()[..width].to_vec())
    }

    fn positions_for(&self, entry: &[u8]) -> Vec<usize> {
        let widened = self.widen(entry);
        hash_positions(&widened, K_HASHES, M_BITS)
    }

    /// Extends `entry` to 32 bytes by concatenating it with
    /// `entry XOR extender[i]` for each of the `ceil(32 / entry_bytes) − 1`
    /// extenders sized for this filter's `entry_bytes` (§3 "DDF state", §4.2
    /// "Entry widening"). Left untouched once already 32 bytes or wider.
    fn widen(&self, entry: &[u8]) -> Vec<u8> {
        if entry.len() >= 32 {
            return entry.to_vec();
        }
        let mut widened = Vec::with_capacity(32);
        widened.extend_from_slice(entry);
        for extender in &self.extenders {
            let xored: Vec<u8> = entry
                .iter()
                .zip(extender.iter())
                .map(|(a, b)| a ^ b)
                .collect();
            widened.extend_from_slice(&xored);
        }
        widened.truncate(32);
        widened
    }
}

/// Derives `k` bit positions from `widened` via Kirsch-Mitzenmacher double
/// hashing: two independent hashes combined as `h1 + i * h2`, avoiding `k`
/// separate hash function implementations while keeping positions
/// effectively independent.
fn hash_positions(widened: &[u8], k: usize, m: usize) -> Vec<usize> {
    let h1 = fx_hash(widened, 0);
    let h2 = fx_hash(widened, 1) | 1;
    (0..k)
        .map(|i| (h1.wrapping_add((i as u64).wrapping_mul(h2)) as usize) % m)
        .collect()
}

fn fx_hash(data: &[u8], salt: u8) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write_u8(salt);
    hasher.write(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::VirtualTimer;

    fn setup(duration_ms: u64, entry_bytes: usize) -> (Arc<DecayingDuplicateFilter>, Arc<VirtualTimer>) {
        let timer = Arc::new(VirtualTimer::new());
        let filter = DecayingDuplicateFilter::new(
            DecayingDuplicateFilterConfig {
                duration_ms,
                entry_bytes,
            },
            timer.clone(),
        );
        (filter, timer)
    }

    #[test]
    fn s5_ddf_basic() {
        let (filter, timer) = setup(1000, 8);
        assert!(!filter.add_long(42).unwrap());
        assert!(filter.add_long(42).unwrap());

        timer.advance(1001);
        assert!(filter.is_known(42));

        timer.advance(1001);
        assert!(!filter.is_known(42));
    }

    #[test]
    fn s6_ddf_window_edge() {
        let (filter, timer) = setup(1000, 8);
        assert!(!filter.add_long(42).unwrap());

        timer.advance(999);
        assert!(filter.add_long(42).unwrap());

        timer.advance(2);
        assert!(filter.add_long(42).unwrap());

        timer.advance(2000);
        assert!(!filter.add_long(42).unwrap());
    }

    #[test]
    fn property_4_known_throughout_duration() {
        let (filter, timer) = setup(500, 8);
        filter.add_long(7).unwrap();
        for _ in 0..5 {
            timer.advance(90);
            assert!(filter.is_known(7));
        }
    }

    #[test]
    fn property_6_idempotent_across_rotation() {
        let (filter, timer) = setup(200, 8);
        assert!(!filter.add_long(9).unwrap());
        timer.advance(401);
        assert!(!filter.add_long(9).unwrap());
    }

    #[test]
    fn wrong_length_entry_is_rejected() {
        let (filter, _timer) = setup(1000, 4);
        let err = filter.add(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            DdfError::WrongLength {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn entry_widening_below_32_bytes_is_deterministic() {
        let (filter, _timer) = setup(1000, 1);
        assert!(!filter.add(&[5]).unwrap());
        assert!(filter.add(&[5]).unwrap());
        assert!(!filter.add(&[6]).unwrap());
    }

    #[test]
    fn current_duplicate_count_tracks_and_resets() {
        let (filter, timer) = setup(1000, 8);
        filter.add_long(1).unwrap();
        filter.add_long(1).unwrap();
        filter.add_long(2).unwrap();
        assert_eq!(filter.current_duplicate_count(), 1);
        timer.advance(1001);
        assert_eq!(filter.current_duplicate_count(), 0);
    }

    #[test]
    fn clear_empties_both_generations() {
        let (filter, timer) = setup(1000, 8);
        filter.add_long(3).unwrap();
        timer.advance(1001);
        assert!(filter.is_known(3));
        filter.clear();
        assert!(!filter.is_known(3));
        assert_eq!(filter.current_duplicate_count(), 0);
    }

    #[test]
    fn stop_decaying_halts_rotation() {
        let (filter, timer) = setup(100, 8);
        filter.stop_decaying();
        filter.add_long(11).unwrap();
        timer.advance(1_000_000);
        assert!(filter.is_known(11));
    }

    #[test]
    fn add_long_on_wide_filter_errors_instead_of_panicking() {
        let (filter, _timer) = setup(1000, 32);
        let err = filter.add_long(42).unwrap_err();
        assert_eq!(err, DdfError::LongWidthUnsupported { entry_bytes: 32 });
        assert!(!filter.is_known(42));
        // The filter is still fully usable through `add` with raw entries.
        assert!(!filter.add(&[7u8; 32]).unwrap());
        assert!(filter.add(&[7u8; 32]).unwrap());
    }

    #[test]
    fn false_positive_rate_rises_with_occupancy() {
        let (filter, _timer) = setup(i64::MAX as u64, 8);
        let before = filter.false_positive_rate();
        for n in 0..5000u64 {
            filter.add_long(n).unwrap();
        }
        let after = filter.false_positive_rate();
        assert!(after >= before);
        assert!(after < 1.0);
    }
}
