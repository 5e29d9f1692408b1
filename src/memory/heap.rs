use super::Storage;
use crate::arena::{Arena, Key};
use crate::error::{VidmemError, VidmemResult};
use crate::surface::BufferId;

/// Upper bound of a chunk's toleration counter.
pub const MAX_TOLERATION: u8 = 255;

/// A contiguous byte range of a heap, free or holding one buffer's video placement.
#[derive(Debug, Clone)]
pub struct Chunk {
    offset: usize,
    length: usize,
    owner: Option<BufferId>,
    toleration: u8,
    // Counted against heap.avail (VIDEOONLY placements).
    reserved: bool,
    prev: Option<Key>,
    next: Option<Key>,
}

impl Chunk {
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.length
    }

    #[must_use]
    pub const fn owner(&self) -> Option<BufferId> {
        self.owner
    }

    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.owner.is_none()
    }

    #[must_use]
    pub const fn toleration(&self) -> u8 {
        self.toleration
    }

    /// Counts one survived allocation scan, saturating at [`MAX_TOLERATION`].
    pub(crate) fn tolerate(&mut self) -> u8 {
        if self.toleration < MAX_TOLERATION {
            self.toleration += 1;
        }
        self.toleration
    }

    pub(crate) fn reset_toleration(&mut self) {
        self.toleration = 0;
    }
}

/// A memory region of one storage kind, carved into chunks kept in offset order.
///
/// Chunks live in a per-heap arena and link to their neighbours by key, so a
/// coalesced-away chunk can never be reached through a stale reference.
#[derive(Debug)]
pub struct Heap {
    storage: Storage,
    offset: usize,
    length: usize,
    avail: usize,
    min_toleration: u32,
    chunks: Arena<Chunk>,
    first: Key,
}

impl Heap {
    pub(crate) fn new(storage: Storage, offset: usize, length: usize) -> VidmemResult<Self> {
        if storage == Storage::System {
            return Err(VidmemError::InvalidArgument(
                "heaps can only be created for video or auxiliary storage".into(),
            ));
        }
        if length == 0 {
            return Err(VidmemError::InvalidArgument("heap length is zero".into()));
        }

        let mut chunks = Arena::new();
        let first = chunks.insert(Chunk {
            offset,
            length,
            owner: None,
            toleration: 0,
            reserved: false,
            prev: None,
            next: None,
        })?;

        Ok(Self {
            storage,
            offset,
            length,
            avail: length,
            min_toleration: 0,
            chunks,
            first,
        })
    }

    #[must_use]
    pub const fn storage(&self) -> Storage {
        self.storage
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    /// Bytes not pinned by VIDEOONLY placements.
    #[must_use]
    pub const fn avail(&self) -> usize {
        self.avail
    }

    #[must_use]
    pub const fn min_toleration(&self) -> u32 {
        self.min_toleration
    }

    /// Toleration a chunk must exceed before an equal-policy request may evict it.
    #[must_use]
    pub const fn eviction_threshold(&self) -> u32 {
        self.min_toleration / 8 + 2
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn chunk(&self, key: Key) -> Option<&Chunk> {
        self.chunks.get(key)
    }

    pub(crate) fn chunk_mut(&mut self, key: Key) -> Option<&mut Chunk> {
        self.chunks.get_mut(key)
    }

    /// Chunks in offset order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> + '_ {
        self.iter().map(|(_, chunk)| chunk)
    }

    pub(crate) fn iter(&self) -> ChunkIter<'_> {
        ChunkIter {
            heap: self,
            next: Some(self.first),
        }
    }

    /// Keys in offset order, for scans that mutate chunks as they go.
    pub(crate) fn keys(&self) -> Vec<Key> {
        self.iter().map(|(key, _)| key).collect()
    }

    /// First free chunk that can hold `length` bytes.
    pub(crate) fn find_free(&self, length: usize) -> Option<Key> {
        self.iter()
            .find(|(_, chunk)| chunk.is_free() && chunk.length >= length)
            .map(|(key, _)| key)
    }

    /// Binds the leading `length` bytes of the free chunk `key` to `owner`.
    ///
    /// Any remainder is split off into a free chunk right after the occupied one.
    pub(crate) fn occupy(
        &mut self,
        key: Key,
        owner: BufferId,
        length: usize,
        reserve: bool,
    ) -> VidmemResult<&Chunk> {
        let chunk = self
            .chunks
            .get(key)
            .ok_or_else(|| VidmemError::bug(format!("occupy of stale chunk {key}")))?;
        if !chunk.is_free() || chunk.length < length {
            return Err(VidmemError::bug(format!(
                "occupy of chunk {key} ({} bytes, owner {:?}) for {length} bytes",
                chunk.length, chunk.owner
            )));
        }

        if chunk.length > length {
            self.split(key, length)?;
        }

        if reserve {
            self.avail = self.avail.saturating_sub(length);
        }
        self.min_toleration = self.min_toleration.saturating_add(1);

        let chunk = self
            .chunks
            .get_mut(key)
            .ok_or_else(|| VidmemError::bug(format!("chunk {key} vanished during split")))?;
        chunk.owner = Some(owner);
        chunk.reserved = reserve;
        chunk.toleration = 0;
        Ok(chunk)
    }

    /// Cuts `key` at `length`; the tail becomes a new free chunk linked after it.
    fn split(&mut self, key: Key, length: usize) -> VidmemResult<Key> {
        let (offset, total, next) = {
            let chunk = self
                .chunks
                .get(key)
                .ok_or_else(|| VidmemError::bug(format!("split of stale chunk {key}")))?;
            (chunk.offset, chunk.length, chunk.next)
        };

        let tail = self.chunks.insert(Chunk {
            offset: offset + length,
            length: total - length,
            owner: None,
            toleration: 0,
            reserved: false,
            prev: Some(key),
            next,
        })?;

        if let Some(next) = next {
            if let Some(chunk) = self.chunks.get_mut(next) {
                chunk.prev = Some(tail);
            }
        }
        if let Some(chunk) = self.chunks.get_mut(key) {
            chunk.length = length;
            chunk.next = Some(tail);
        }

        Ok(tail)
    }

    /// Releases `key` and merges it with free neighbours on both sides.
    ///
    /// Returns the key of the resulting free chunk.
    pub(crate) fn free(&mut self, key: Key) -> VidmemResult<Key> {
        let chunk = self
            .chunks
            .get_mut(key)
            .ok_or_else(|| VidmemError::bug(format!("free of stale chunk {key}")))?;
        if chunk.is_free() {
            return Err(VidmemError::bug(format!("double free of chunk {key}")));
        }

        chunk.owner = None;
        chunk.toleration = 0;
        if std::mem::take(&mut chunk.reserved) {
            self.avail += chunk.length;
        }
        let (prev, mut next) = (chunk.prev, chunk.next);
        self.min_toleration = self.min_toleration.saturating_sub(1);

        let mut merged = key;
        if let Some(prev) = prev.filter(|&p| self.is_free_chunk(p)) {
            self.merge(prev, merged);
            merged = prev;
        }
        next = next.filter(|&n| self.is_free_chunk(n));
        if let Some(next) = next {
            self.merge(merged, next);
        }

        Ok(merged)
    }

    fn is_free_chunk(&self, key: Key) -> bool {
        self.chunks.get(key).is_some_and(Chunk::is_free)
    }

    /// Absorbs `second` into its predecessor `first`.
    fn merge(&mut self, first: Key, second: Key) {
        let Some(absorbed) = self.chunks.remove(second) else {
            return;
        };
        if let Some(next) = absorbed.next {
            if let Some(chunk) = self.chunks.get_mut(next) {
                chunk.prev = Some(first);
            }
        }
        if let Some(chunk) = self.chunks.get_mut(first) {
            chunk.length += absorbed.length;
            chunk.next = absorbed.next;
        }
    }

    /// Moves the heap start to `offset`, keeping the heap end fixed.
    ///
    /// Only possible while the first chunk is free and the shift leaves it non-empty.
    /// Returns false without touching anything otherwise.
    pub(crate) fn move_start(&mut self, offset: usize) -> bool {
        let end = self.offset + self.length;
        if offset >= end {
            return false;
        }
        let Some(first) = self.chunks.get_mut(self.first) else {
            return false;
        };
        if !first.is_free() || offset >= first.end() {
            return false;
        }

        first.length = first.end() - offset;
        first.offset = offset;

        let new_length = end - offset;
        if new_length > self.length {
            self.avail += new_length - self.length;
        } else {
            self.avail -= self.length - new_length;
        }
        self.length = new_length;
        self.offset = offset;
        true
    }

    /// Checks the chunk list against the heap's layout invariants.
    pub(crate) fn verify(&self) -> Result<(), String> {
        let mut expected = self.offset;
        let mut total = 0;
        let mut prev: Option<(Key, bool)> = None;
        let mut reserved = 0;

        for (key, chunk) in self.iter() {
            if chunk.offset != expected {
                return Err(format!(
                    "chunk {key} starts at {} but previous ends at {expected}",
                    chunk.offset
                ));
            }
            if chunk.length == 0 {
                return Err(format!("chunk {key} is empty"));
            }
            if chunk.prev != prev.map(|(k, _)| k) {
                return Err(format!("chunk {key} has a broken back link"));
            }
            if let Some((prev_key, prev_free)) = prev {
                if prev_free && chunk.is_free() {
                    return Err(format!("free chunks {prev_key} and {key} are adjacent"));
                }
            }
            if chunk.reserved {
                reserved += chunk.length;
            }
            expected = chunk.end();
            total += chunk.length;
            prev = Some((key, chunk.is_free()));
        }

        if total != self.length || expected != self.offset + self.length {
            return Err(format!(
                "chunks cover {total} bytes ending at {expected}, heap is {} bytes ending at {}",
                self.length,
                self.offset + self.length
            ));
        }
        if self.chunks.len() != self.iter().count() {
            return Err("unlinked chunks left in the arena".into());
        }
        if self.avail + reserved != self.length {
            return Err(format!(
                "avail {} + reserved {reserved} != length {}",
                self.avail, self.length
            ));
        }
        Ok(())
    }
}

/// Walks a heap's chunks in offset order.
pub(crate) struct ChunkIter<'a> {
    heap: &'a Heap,
    next: Option<Key>,
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = (Key, &'a Chunk);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next?;
        let chunk = self.heap.chunks.get(key)?;
        self.next = chunk.next;
        Some((key, chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena as BufferArena;

    fn owners(count: usize) -> Vec<BufferId> {
        let mut arena = BufferArena::new();
        (0..count)
            .map(|i| BufferId(arena.insert(i).unwrap()))
            .collect()
    }

    fn layout(heap: &Heap) -> Vec<(usize, usize, bool)> {
        heap.chunks()
            .map(|c| (c.offset(), c.length(), c.is_free()))
            .collect()
    }

    #[test]
    fn system_storage_is_rejected() {
        assert!(matches!(
            Heap::new(Storage::System, 0, 100),
            Err(VidmemError::InvalidArgument(_))
        ));
        assert!(Heap::new(Storage::Video, 0, 0).is_err());
    }

    #[test]
    fn occupy_takes_leading_bytes() {
        let ids = owners(1);
        let mut heap = Heap::new(Storage::Video, 100, 1000).unwrap();
        let key = heap.find_free(400).unwrap();
        let chunk = heap.occupy(key, ids[0], 400, false).unwrap();
        assert_eq!((chunk.offset(), chunk.length()), (100, 400));

        assert_eq!(layout(&heap), vec![(100, 400, false), (500, 600, true)]);
        assert_eq!(heap.min_toleration(), 1);
        assert_eq!(heap.avail(), 1000);
        heap.verify().unwrap();
    }

    #[test]
    fn free_coalesces_both_directions() {
        let ids = owners(3);
        let mut heap = Heap::new(Storage::Video, 0, 300).unwrap();
        let mut keys = Vec::new();
        for id in &ids {
            let key = heap.find_free(100).unwrap();
            heap.occupy(key, *id, 100, false).unwrap();
            keys.push(key);
        }
        assert_eq!(heap.chunk_count(), 3);

        heap.free(keys[0]).unwrap();
        heap.free(keys[2]).unwrap();
        assert_eq!(
            layout(&heap),
            vec![(0, 100, true), (100, 100, false), (200, 100, true)]
        );

        let merged = heap.free(keys[1]).unwrap();
        assert_eq!(merged, keys[0]);
        assert_eq!(layout(&heap), vec![(0, 300, true)]);
        assert_eq!(heap.chunk_count(), 1);
        assert_eq!(heap.min_toleration(), 0);
        heap.verify().unwrap();

        assert!(heap.chunk(keys[2]).is_none());
    }

    #[test]
    fn reserved_chunks_count_against_avail() {
        let ids = owners(1);
        let mut heap = Heap::new(Storage::Auxiliary, 0, 256).unwrap();
        let key = heap.find_free(64).unwrap();
        heap.occupy(key, ids[0], 64, true).unwrap();
        assert_eq!(heap.avail(), 192);
        heap.verify().unwrap();

        heap.free(key).unwrap();
        assert_eq!(heap.avail(), 256);
    }

    #[test]
    fn double_free_is_a_bug() {
        let ids = owners(1);
        let mut heap = Heap::new(Storage::Video, 0, 64).unwrap();
        let key = heap.find_free(64).unwrap();
        heap.occupy(key, ids[0], 64, false).unwrap();
        heap.free(key).unwrap();
        assert!(matches!(heap.free(key), Err(VidmemError::Bug(_))));
    }

    #[test]
    fn toleration_saturates() {
        let ids = owners(1);
        let mut heap = Heap::new(Storage::Video, 0, 64).unwrap();
        let key = heap.find_free(64).unwrap();
        heap.occupy(key, ids[0], 64, false).unwrap();
        let chunk = heap.chunk_mut(key).unwrap();
        for _ in 0..300 {
            chunk.tolerate();
        }
        assert_eq!(chunk.toleration(), MAX_TOLERATION);
    }

    #[test]
    fn move_start_requires_free_first_chunk() {
        let ids = owners(1);
        let mut heap = Heap::new(Storage::Video, 100, 900).unwrap();
        assert!(heap.move_start(40));
        assert_eq!((heap.offset(), heap.length(), heap.avail()), (40, 960, 960));
        assert!(heap.move_start(200));
        assert_eq!((heap.offset(), heap.length()), (200, 800));
        heap.verify().unwrap();

        let key = heap.find_free(10).unwrap();
        heap.occupy(key, ids[0], 10, false).unwrap();
        assert!(!heap.move_start(100));
        assert_eq!(heap.offset(), 200);
    }
}
