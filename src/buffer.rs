//! Append-only arena for OSM items.
//!
//! A buffer owns a contiguous byte area and two watermarks: `written` marks
//! the end of data added so far, `committed` the end of data that forms
//! complete items. Data is added by reserving space and filling it (usually
//! through a [builder](crate::builder)), then committing. Items inside a
//! buffer are non-owning views; the pipeline parallelizes by moving whole
//! buffers between threads, never by sharing one.

use crate::error::{Error, Result};
use crate::item::{ItemRef, ALIGN};
use crate::osm::ObjectRef;

/// Should a buffer with internal storage grow when it runs out of space?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoGrow {
    Yes,
    No,
}

/// A memory area storing a sequence of [`ItemRef`] records.
///
/// The default-constructed buffer is the invalid end-of-stream sentinel: it
/// has capacity 0 and fails the [`Buffer::is_valid`] test. All other
/// constructors produce valid buffers.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    written: usize,
    committed: usize,
    auto_grow: bool,
    growable: bool,
}

impl Buffer {
    /// Creates a buffer with internal storage of the given capacity.
    ///
    /// Capacity must be a positive multiple of [`ALIGN`].
    pub fn new(capacity: usize, auto_grow: AutoGrow) -> Result<Buffer> {
        if capacity == 0 || capacity % ALIGN != 0 {
            return Err(Error::InvalidArgument(
                "buffer capacity must be a positive multiple of the alignment",
            ));
        }
        Ok(Buffer {
            data: vec![0; capacity],
            written: 0,
            committed: 0,
            auto_grow: auto_grow == AutoGrow::Yes,
            growable: true,
        })
    }

    /// Wraps already initialized item data. The whole vector counts as
    /// committed and the buffer will never reallocate it.
    pub fn from_data(data: Vec<u8>) -> Result<Buffer> {
        if data.is_empty() || data.len() % ALIGN != 0 {
            return Err(Error::InvalidArgument(
                "buffer data must be a positive multiple of the alignment",
            ));
        }
        let len = data.len();
        Ok(Buffer {
            data,
            written: len,
            committed: len,
            auto_grow: false,
            growable: false,
        })
    }

    /// The invalid buffer used to signal end-of-stream.
    pub fn invalid() -> Buffer {
        Buffer::default()
    }

    /// False only for the end-of-stream sentinel.
    pub fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of committed bytes.
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Number of written (committed plus pending) bytes.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn is_aligned(&self) -> bool {
        self.written % ALIGN == 0 && self.committed % ALIGN == 0
    }

    /// The committed item data.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.committed]
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Reserves `size` bytes and returns the offset of the reserved span.
    ///
    /// Grows internal storage by doubling if the buffer was created with
    /// [`AutoGrow::Yes`], otherwise fails with [`Error::BufferFull`].
    pub fn reserve_space(&mut self, size: usize) -> Result<usize> {
        if self.written + size > self.data.len() {
            if !self.growable || !self.auto_grow {
                return Err(Error::BufferFull);
            }
            let mut new_capacity = self.data.len() * 2;
            while self.written + size > new_capacity {
                new_capacity *= 2;
            }
            self.data.resize(new_capacity, 0);
        }
        let offset = self.written;
        self.written += size;
        Ok(offset)
    }

    /// Marks all written bytes as committed and returns the previous
    /// committed watermark, which addresses the freshly committed item.
    pub fn commit(&mut self) -> Result<usize> {
        if !self.is_aligned() {
            return Err(Error::Logic("commit on unaligned buffer"));
        }
        let offset = self.committed;
        self.committed = self.written;
        Ok(offset)
    }

    /// Discards written but uncommitted data.
    pub fn rollback(&mut self) {
        self.written = self.committed;
    }

    /// Resets both watermarks and returns the number of bytes that were
    /// committed.
    pub fn clear(&mut self) -> usize {
        let committed = self.committed;
        self.written = 0;
        self.committed = 0;
        committed
    }

    /// Copies a complete item into this buffer and returns its offset.
    /// The copy is not committed.
    pub fn add_item(&mut self, item: &ItemRef<'_>) -> Result<usize> {
        let bytes = item.bytes();
        let offset = self.reserve_space(bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(offset)
    }

    /// Copies the committed contents of another buffer into this one.
    /// The copy is not committed.
    pub fn add_buffer(&mut self, other: &Buffer) -> Result<()> {
        let bytes = other.data();
        let offset = self.reserve_space(bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Iterates over all committed items.
    pub fn items(&self) -> Items<'_> {
        Items {
            data: self.data(),
            pos: 0,
        }
    }

    /// Iterates over committed items starting at the given offset.
    pub fn items_from(&self, offset: usize) -> Items<'_> {
        debug_assert!(offset % ALIGN == 0);
        Items {
            data: self.data(),
            pos: offset.min(self.committed),
        }
    }

    /// Iterates over committed items, filtered to OSM objects.
    pub fn objects(&self) -> Objects<'_> {
        Objects { items: self.items() }
    }

    /// Compacts the buffer in place by dropping items whose removed flag is
    /// set. For every surviving item that shifts, `moving` is called with
    /// its (old, new) offsets before the move so external indexes can be
    /// patched. Invalidates all offsets into this buffer.
    pub fn purge_removed<F>(&mut self, mut moving: F)
    where
        F: FnMut(usize, usize),
    {
        let mut read = 0;
        let mut write = 0;
        while read < self.committed {
            let item = match ItemRef::parse(&self.data[read..self.committed]) {
                Ok(item) => item,
                Err(_) => {
                    debug_assert!(false, "corrupt item while purging");
                    break;
                }
            };
            let size = item.size();
            if !item.removed() {
                if read != write {
                    moving(read, write);
                    self.data.copy_within(read..read + size, write);
                }
                write += size;
            }
            read += size;
        }
        self.written = write;
        self.committed = write;
    }
}

/// Forward iterator over the items of a buffer.
#[derive(Debug, Clone)]
pub struct Items<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Items<'a> {
    /// Offset of the next item within the buffer.
    pub fn offset(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Items<'a> {
    type Item = ItemRef<'a>;

    fn next(&mut self) -> Option<ItemRef<'a>> {
        if self.pos >= self.data.len() {
            return None;
        }
        match ItemRef::parse(&self.data[self.pos..]) {
            Ok(item) => {
                self.pos += item.size();
                Some(item)
            }
            Err(_) => {
                debug_assert!(false, "corrupt item in buffer");
                self.pos = self.data.len();
                None
            }
        }
    }
}

/// Forward iterator over the OSM objects of a buffer, skipping other items.
#[derive(Debug, Clone)]
pub struct Objects<'a> {
    items: Items<'a>,
}

impl<'a> Iterator for Objects<'a> {
    type Item = ObjectRef<'a>;

    fn next(&mut self) -> Option<ObjectRef<'a>> {
        self.items.by_ref().find_map(|item| item.as_object())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::NodeBuilder;
    use crate::item::{ItemType, HEADER_SIZE};
    use crate::osm::{Location, OsmObject};

    fn buffer_with_nodes(ids: &[i64]) -> Buffer {
        let mut buffer = Buffer::new(1024, AutoGrow::Yes).unwrap();
        for &id in ids {
            let mut node = NodeBuilder::new(&mut buffer).unwrap();
            node.set_id(id);
            node.set_version(1);
            node.finish().unwrap();
            buffer.commit().unwrap();
        }
        buffer
    }

    #[test]
    fn invalid_buffer_is_sentinel() {
        let buffer = Buffer::invalid();
        assert!(!buffer.is_valid());
        assert_eq!(buffer.capacity(), 0);
        assert_eq!(buffer.items().count(), 0);
    }

    #[test]
    fn capacity_must_be_aligned() {
        assert!(Buffer::new(12, AutoGrow::No).is_err());
        assert!(Buffer::new(0, AutoGrow::No).is_err());
        assert!(Buffer::new(64, AutoGrow::No).is_ok());
    }

    #[test]
    fn reserve_commit_rollback() {
        let mut buffer = Buffer::new(64, AutoGrow::No).unwrap();
        let offset = buffer.reserve_space(16).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(buffer.written(), 16);
        assert_eq!(buffer.committed(), 0);

        assert_eq!(buffer.commit().unwrap(), 0);
        assert_eq!(buffer.committed(), 16);

        buffer.reserve_space(8).unwrap();
        buffer.rollback();
        assert_eq!(buffer.written(), 16);

        assert_eq!(buffer.clear(), 16);
        assert_eq!(buffer.written(), 0);
    }

    #[test]
    fn commit_requires_alignment() {
        let mut buffer = Buffer::new(64, AutoGrow::No).unwrap();
        buffer.reserve_space(3).unwrap();
        assert!(matches!(buffer.commit(), Err(Error::Logic(_))));
    }

    #[test]
    fn full_without_auto_grow() {
        let mut buffer = Buffer::new(16, AutoGrow::No).unwrap();
        buffer.reserve_space(16).unwrap();
        assert!(matches!(buffer.reserve_space(1), Err(Error::BufferFull)));
    }

    #[test]
    fn grows_by_doubling() {
        let mut buffer = Buffer::new(8, AutoGrow::Yes).unwrap();
        buffer.reserve_space(100).unwrap();
        assert!(buffer.capacity() >= 104);
        assert_eq!(buffer.written(), 100);
    }

    #[test]
    fn from_data_never_grows() {
        let buffer = buffer_with_nodes(&[1]);
        let bytes = buffer.data().to_vec();
        let mut external = Buffer::from_data(bytes).unwrap();
        assert_eq!(external.committed(), buffer.committed());
        assert!(matches!(
            external.reserve_space(8),
            Err(Error::BufferFull)
        ));
    }

    #[test]
    fn iteration_is_aligned() {
        let buffer = buffer_with_nodes(&[1, 2, 3]);
        let mut iter = buffer.items();
        let mut count = 0;
        loop {
            let offset = iter.offset();
            assert_eq!(offset % ALIGN, 0);
            let Some(item) = iter.next() else { break };
            assert!(item.size() >= HEADER_SIZE);
            assert_eq!(item.size() % ALIGN, 0);
            assert_eq!(item.kind(), ItemType::Node);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn objects_yield_in_order() {
        let buffer = buffer_with_nodes(&[10, 12, 11]);
        let ids: Vec<i64> = buffer.objects().map(|o| o.id()).collect();
        assert_eq!(ids, vec![10, 12, 11]);
    }

    #[test]
    fn add_buffer_copies_committed_bytes() {
        let source = buffer_with_nodes(&[5, 6]);
        let mut target = Buffer::new(1024, AutoGrow::Yes).unwrap();
        target.add_buffer(&source).unwrap();
        target.commit().unwrap();
        let ids: Vec<i64> = target.objects().map(|o| o.id()).collect();
        assert_eq!(ids, vec![5, 6]);
    }

    #[test]
    fn add_item_copies_one_item() {
        let source = buffer_with_nodes(&[7, 8]);
        let item = source.items().nth(1).unwrap();
        let mut target = Buffer::new(1024, AutoGrow::Yes).unwrap();
        target.add_item(&item).unwrap();
        target.commit().unwrap();
        let ids: Vec<i64> = target.objects().map(|o| o.id()).collect();
        assert_eq!(ids, vec![8]);
    }

    #[test]
    fn purge_removed_compacts_and_reports_moves() {
        let mut buffer = Buffer::new(1024, AutoGrow::Yes).unwrap();
        for id in 1..=3 {
            let mut node = NodeBuilder::new(&mut buffer).unwrap();
            node.set_id(id);
            node.set_location(Location::from_degrees(1.0, 2.0));
            if id == 2 {
                node.set_removed(true);
            }
            node.finish().unwrap();
            buffer.commit().unwrap();
        }

        let mut moves = Vec::new();
        buffer.purge_removed(|old, new| moves.push((old, new)));

        let ids: Vec<i64> = buffer.objects().map(|o| o.id()).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(moves.len(), 1);
        assert!(moves[0].0 > moves[0].1);

        // idempotent on a buffer without removed items
        let committed = buffer.committed();
        buffer.purge_removed(|_, _| panic!("nothing should move"));
        assert_eq!(buffer.committed(), committed);
    }

    #[test]
    fn exact_fit_succeeds_then_overflows() {
        let mut small = Buffer::new(48, AutoGrow::No).unwrap();
        {
            let mut node = NodeBuilder::new(&mut small).unwrap();
            node.set_id(1);
            node.finish().unwrap();
        }
        small.commit().unwrap();
        assert_eq!(small.committed(), 48);
        assert!(matches!(small.reserve_space(1), Err(Error::BufferFull)));
    }
}
