//! Sparse device memory image with change notification
//!
//! Bytes are stored as non-overlapping runs keyed by start address; runs
//! that touch are merged. Subscribers watch an address range and are
//! called with the current bytes of that range whenever an update
//! intersects it.

use std::collections::BTreeMap;

/// A run of bytes at an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub address: u64,
    pub bytes: Vec<u8>,
    /// Owner tag, used to group subscriptions
    pub reference: Option<String>,
}

impl Chunk {
    /// Zero-filled range, not yet part of any cache
    pub fn new(address: u64, size: usize, reference: Option<&str>) -> Self {
        Self {
            address,
            bytes: vec![0; size],
            reference: reference.map(str::to_string),
        }
    }

    pub fn with_bytes(address: u64, bytes: Vec<u8>) -> Self {
        Self {
            address,
            bytes,
            reference: None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// One past the last address
    pub fn end(&self) -> u64 {
        self.address + self.bytes.len() as u64
    }

    pub fn intersects(&self, address: u64, len: usize) -> bool {
        address < self.end() && self.address < address + len as u64
    }

    /// Whether `[address, address + len)` lies entirely inside this chunk
    pub fn contains(&self, address: u64, len: usize) -> bool {
        address >= self.address && address + len as u64 <= self.end()
    }

    /// Bytes of `[address, address + len)` if the chunk covers them
    pub fn slice(&self, address: u64, len: usize) -> Option<&[u8]> {
        if !self.contains(address, len) {
            return None;
        }
        let start = (address - self.address) as usize;
        Some(&self.bytes[start..start + len])
    }
}

/// Handle returned by [`MemoryCache::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type ChunkCallback = Box<dyn FnMut(&Chunk) + Send>;

struct Subscriber {
    id: SubscriptionId,
    address: u64,
    len: usize,
    reference: Option<String>,
    callback: ChunkCallback,
}

/// Sparse byte store keyed by address
#[derive(Default)]
pub struct MemoryCache {
    runs: BTreeMap<u64, Vec<u8>>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("runs", &self.runs.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an uncommitted range
    pub fn new_chunk(&self, address: u64, size: usize, reference: Option<&str>) -> Chunk {
        Chunk::new(address, size, reference)
    }

    /// Insert a chunk, keeping bytes already cached where they overlap
    pub fn add(&mut self, chunk: &Chunk) {
        self.merge(chunk.address, &chunk.bytes, false);
    }

    /// Write the chunk's bytes and notify every intersecting subscriber
    pub fn update(&mut self, chunk: &Chunk) {
        if chunk.is_empty() {
            return;
        }
        self.merge(chunk.address, &chunk.bytes, true);

        let runs = &self.runs;
        for sub in self
            .subscribers
            .iter_mut()
            .filter(|s| chunk.intersects(s.address, s.len))
        {
            let view = Chunk {
                address: sub.address,
                bytes: read_filled(runs, sub.address, sub.len),
                reference: sub.reference.clone(),
            };
            (sub.callback)(&view);
        }
    }

    /// Watch the range of `chunk`
    ///
    /// The reference defaults to the chunk's own; several subscribers may
    /// share one.
    pub fn subscribe<F>(
        &mut self,
        chunk: &Chunk,
        reference: Option<&str>,
        callback: F,
    ) -> SubscriptionId
    where
        F: FnMut(&Chunk) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            address: chunk.address,
            len: chunk.len(),
            reference: reference
                .map(str::to_string)
                .or_else(|| chunk.reference.clone()),
            callback: Box::new(callback),
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Drop every subscriber tagged with `reference`, returning how many
    pub fn unsubscribe_by_reference(&mut self, reference: &str) -> usize {
        let before = self.subscribers.len();
        self.subscribers
            .retain(|s| s.reference.as_deref() != Some(reference));
        before - self.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Cached bytes of `[address, address + len)`, if all are present
    pub fn read(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let (start, run) = self.runs.range(..=address).next_back()?;
        let offset = (address - start) as usize;
        run.get(offset..offset + len).map(<[u8]>::to_vec)
    }

    /// Stored ranges sorted by address
    pub fn contiguous_chunks(&self) -> Vec<Chunk> {
        self.runs
            .iter()
            .map(|(address, bytes)| Chunk::with_bytes(*address, bytes.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.runs.clear();
    }

    fn merge(&mut self, address: u64, bytes: &[u8], overwrite: bool) {
        if bytes.is_empty() {
            return;
        }
        let end = address + bytes.len() as u64;

        // runs that overlap or touch [address, end)
        let touching: Vec<u64> = self
            .runs
            .range(..=end)
            .filter(|(start, run)| **start + run.len() as u64 >= address)
            .map(|(start, _)| *start)
            .collect();

        let mut start = address;
        let mut stop = end;
        let old: Vec<(u64, Vec<u8>)> = touching
            .into_iter()
            .filter_map(|key| self.runs.remove_entry(&key))
            .collect();
        for (key, run) in &old {
            start = start.min(*key);
            stop = stop.max(*key + run.len() as u64);
        }

        let mut merged = vec![0u8; (stop - start) as usize];
        let mut copy = |at: u64, data: &[u8]| {
            let offset = (at - start) as usize;
            merged[offset..offset + data.len()].copy_from_slice(data);
        };
        if overwrite {
            for (key, run) in &old {
                copy(*key, run);
            }
            copy(address, bytes);
        } else {
            copy(address, bytes);
            for (key, run) in &old {
                copy(*key, run);
            }
        }
        self.runs.insert(start, merged);
    }
}

/// Bytes of a range with holes read as zero
fn read_filled(runs: &BTreeMap<u64, Vec<u8>>, address: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let end = address + len as u64;
    for (start, run) in runs.range(..end) {
        let run_end = *start + run.len() as u64;
        if run_end <= address {
            continue;
        }
        let from = address.max(*start);
        let to = end.min(run_end);
        let src = (from - start) as usize;
        let dst = (from - address) as usize;
        let n = (to - from) as usize;
        out[dst..dst + n].copy_from_slice(&run[src..src + n]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<Chunk>>>, impl FnMut(&Chunk) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |c: &Chunk| sink.lock().push(c.clone()))
    }

    #[test]
    fn test_add_merges_overlapping_and_touching_runs() {
        let mut cache = MemoryCache::new();
        cache.add(&Chunk::with_bytes(10, vec![1, 2, 3]));
        cache.add(&Chunk::with_bytes(20, vec![9]));
        cache.add(&Chunk::with_bytes(12, vec![7, 4, 5]));
        cache.add(&Chunk::with_bytes(15, vec![6]));

        let chunks = cache.contiguous_chunks();
        assert_eq!(
            chunks,
            vec![
                Chunk::with_bytes(10, vec![1, 2, 3, 4, 5, 6]),
                Chunk::with_bytes(20, vec![9]),
            ]
        );
    }

    #[test]
    fn test_update_overwrites() {
        let mut cache = MemoryCache::new();
        let chunk = cache.new_chunk(0, 4, None);
        cache.add(&chunk);
        cache.update(&Chunk::with_bytes(2, vec![0xAA, 0xBB, 0xCC]));
        assert_eq!(cache.read(0, 5), Some(vec![0, 0, 0xAA, 0xBB, 0xCC]));
        assert_eq!(cache.read(3, 2), Some(vec![0xBB, 0xCC]));
        assert_eq!(cache.read(3, 3), None);
        assert_eq!(cache.read(100, 1), None);
    }

    #[test]
    fn test_subscribers_see_latest_bytes() {
        let mut cache = MemoryCache::new();
        let (seen, callback) = recorder();
        let watched = cache.new_chunk(4, 4, Some("speed"));
        cache.add(&watched);
        cache.subscribe(&watched, None, callback);

        // outside the range: no call
        cache.update(&Chunk::with_bytes(0, vec![1, 2, 3, 4]));
        cache.update(&Chunk::with_bytes(8, vec![1]));
        assert!(seen.lock().is_empty());

        cache.update(&Chunk::with_bytes(6, vec![0x10, 0x20, 0x30]));
        let calls = seen.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].address, 4);
        assert_eq!(calls[0].bytes, vec![0, 0, 0x10, 0x20]);
        assert_eq!(calls[0].reference.as_deref(), Some("speed"));
    }

    #[test]
    fn test_unsubscribe_by_reference() {
        let mut cache = MemoryCache::new();
        let chunk = cache.new_chunk(0, 2, None);
        let (seen, a) = recorder();
        let (_, b) = recorder();
        let (other, c) = recorder();
        cache.subscribe(&chunk, Some("row"), a);
        cache.subscribe(&chunk, Some("row"), b);
        let kept = cache.subscribe(&chunk, Some("header"), c);

        assert_eq!(cache.unsubscribe_by_reference("row"), 2);
        assert_eq!(cache.subscriber_count(), 1);
        cache.update(&Chunk::with_bytes(0, vec![1, 2]));
        assert!(seen.lock().is_empty());
        assert_eq!(other.lock().len(), 1);

        assert!(cache.unsubscribe(kept));
        assert!(!cache.unsubscribe(kept));
    }

    #[test]
    fn test_view_of_unfilled_range_reads_zero() {
        let mut cache = MemoryCache::new();
        let (seen, callback) = recorder();
        cache.subscribe(&Chunk::new(0, 6, None), None, callback);
        cache.update(&Chunk::with_bytes(2, vec![5]));
        assert_eq!(seen.lock()[0].bytes, vec![0, 0, 5, 0, 0, 0]);
    }
}
