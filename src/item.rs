//! Self-describing item records.
//!
//! Every entity stored in a [`Buffer`](crate::Buffer) starts with the same
//! 8-byte header: the padded total size of the item, its type tag and the
//! number of trailing padding bytes. Items are always aligned to [`ALIGN`]
//! and contain no pointers, so whole buffers can be moved, copied and handed
//! between threads as plain byte spans.

use crate::error::{Error, Result};
use crate::osm::{Changeset, Node, ObjectRef, OsmObject, Relation, Way};

/// Alignment of all items in a buffer, in bytes.
pub const ALIGN: usize = 8;

/// Size of the common item header, in bytes.
pub const HEADER_SIZE: usize = 8;

/// Rounds `n` up to the next multiple of [`ALIGN`].
pub const fn padded_length(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Type tag stored in every item header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ItemType {
    Node = 0x01,
    Way = 0x02,
    Relation = 0x03,
    Changeset = 0x04,
    TagList = 0x11,
    NodeRefList = 0x12,
    RelationMemberList = 0x13,
    RelationMember = 0x14,
    InnerRing = 0x20,
    OuterRing = 0x21,
    Discussion = 0x30,
    Comment = 0x31,
    UserName = 0x40,
    Role = 0x41,
}

impl ItemType {
    pub fn from_u8(value: u8) -> Option<ItemType> {
        use ItemType::*;
        match value {
            0x01 => Some(Node),
            0x02 => Some(Way),
            0x03 => Some(Relation),
            0x04 => Some(Changeset),
            0x11 => Some(TagList),
            0x12 => Some(NodeRefList),
            0x13 => Some(RelationMemberList),
            0x14 => Some(RelationMember),
            0x20 => Some(InnerRing),
            0x21 => Some(OuterRing),
            0x30 => Some(Discussion),
            0x31 => Some(Comment),
            0x40 => Some(UserName),
            0x41 => Some(Role),
            _ => None,
        }
    }

    /// True for the four top-level OSM object types.
    pub fn is_object(self) -> bool {
        matches!(
            self,
            ItemType::Node | ItemType::Way | ItemType::Relation | ItemType::Changeset
        )
    }

    /// Lowercase name as used in XML `member type` attributes.
    pub fn name(self) -> &'static str {
        match self {
            ItemType::Node => "node",
            ItemType::Way => "way",
            ItemType::Relation => "relation",
            ItemType::Changeset => "changeset",
            ItemType::TagList => "tag_list",
            ItemType::NodeRefList => "node_ref_list",
            ItemType::RelationMemberList => "relation_member_list",
            ItemType::RelationMember => "relation_member",
            ItemType::InnerRing => "inner_ring",
            ItemType::OuterRing => "outer_ring",
            ItemType::Discussion => "discussion",
            ItemType::Comment => "comment",
            ItemType::UserName => "user_name",
            ItemType::Role => "role",
        }
    }
}

// little-endian field accessors used by all item views

pub(crate) fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

pub(crate) fn read_i32(data: &[u8], off: usize) -> i32 {
    read_u32(data, off) as i32
}

pub(crate) fn read_i64(data: &[u8], off: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[off..off + 8]);
    i64::from_le_bytes(raw)
}

pub(crate) fn write_u32(data: &mut [u8], off: usize, value: u32) {
    data[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_i32(data: &mut [u8], off: usize, value: i32) {
    write_u32(data, off, value as u32);
}

pub(crate) fn write_i64(data: &mut [u8], off: usize, value: i64) {
    data[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// Decoded form of the common 8-byte item header.
///
/// `size` is the exact padded footprint of the item including this header,
/// all nested sub-items and `tail_pad` trailing padding bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ItemHeader {
    pub size: u32,
    pub kind: ItemType,
    pub tail_pad: u8,
}

impl ItemHeader {
    pub fn read(data: &[u8]) -> Result<ItemHeader> {
        if data.len() < HEADER_SIZE {
            return Err(Error::format("truncated item header"));
        }
        let size = read_u32(data, 0);
        let kind = ItemType::from_u8(data[4])
            .ok_or_else(|| Error::Format(format!("unknown item type tag {:#x}", data[4])))?;
        let tail_pad = data[5];
        if (size as usize) < HEADER_SIZE
            || size as usize % ALIGN != 0
            || tail_pad as usize >= ALIGN
            || (size as usize) < HEADER_SIZE + tail_pad as usize
        {
            return Err(Error::format("corrupt item header"));
        }
        Ok(ItemHeader {
            size,
            kind,
            tail_pad,
        })
    }

    pub fn write(self, data: &mut [u8]) {
        write_u32(data, 0, self.size);
        data[4] = self.kind as u8;
        data[5] = self.tail_pad;
        data[6] = 0;
        data[7] = 0;
    }
}

/// Borrowed view of a single item: its full padded byte span.
#[derive(Debug, Clone, Copy)]
pub struct ItemRef<'a> {
    data: &'a [u8],
    kind: ItemType,
    tail_pad: u8,
}

impl<'a> ItemRef<'a> {
    /// Parses the item starting at the beginning of `data` and borrows
    /// exactly its span.
    pub(crate) fn parse(data: &'a [u8]) -> Result<ItemRef<'a>> {
        let header = ItemHeader::read(data)?;
        let size = header.size as usize;
        if size > data.len() {
            return Err(Error::format("item size exceeds buffer"));
        }
        Ok(ItemRef {
            data: &data[..size],
            kind: header.kind,
            tail_pad: header.tail_pad,
        })
    }

    pub fn kind(&self) -> ItemType {
        self.kind
    }

    /// Padded total footprint in bytes. Advancing by this lands on the next
    /// item.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Full item span including header and padding.
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Item payload without header and without trailing padding.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[HEADER_SIZE..self.data.len() - self.tail_pad as usize]
    }

    /// True if this is an OSM object with its removed flag set.
    pub fn removed(&self) -> bool {
        self.as_object().map(|o| o.removed()).unwrap_or(false)
    }

    pub fn as_object(&self) -> Option<ObjectRef<'a>> {
        match self.kind {
            ItemType::Node => Some(ObjectRef::Node(Node::new(self.data))),
            ItemType::Way => Some(ObjectRef::Way(Way::new(self.data))),
            ItemType::Relation => Some(ObjectRef::Relation(Relation::new(self.data))),
            ItemType::Changeset => Some(ObjectRef::Changeset(Changeset::new(self.data))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding() {
        assert_eq!(padded_length(0), 0);
        assert_eq!(padded_length(1), 8);
        assert_eq!(padded_length(8), 8);
        assert_eq!(padded_length(9), 16);
        assert_eq!(padded_length(41), 48);
    }

    #[test]
    fn header_roundtrip() {
        let mut raw = [0u8; 8];
        let header = ItemHeader {
            size: 48,
            kind: ItemType::Node,
            tail_pad: 0,
        };
        header.write(&mut raw);
        assert_eq!(ItemHeader::read(&raw).unwrap(), header);
    }

    #[test]
    fn header_rejects_unknown_tag() {
        let mut raw = [0u8; 8];
        ItemHeader {
            size: 16,
            kind: ItemType::TagList,
            tail_pad: 2,
        }
        .write(&mut raw);
        raw[4] = 0xff;
        assert!(matches!(ItemHeader::read(&raw), Err(Error::Format(_))));
    }

    #[test]
    fn header_rejects_unaligned_size() {
        let mut raw = [0u8; 8];
        ItemHeader {
            size: 16,
            kind: ItemType::TagList,
            tail_pad: 0,
        }
        .write(&mut raw);
        raw[0] = 12;
        assert!(ItemHeader::read(&raw).is_err());
    }
}
