//! Builders append one item, possibly with nested sub-items, to a buffer.
//!
//! A builder reserves its header on construction and back-patches the final
//! size on `finish()`. Sub-builders are strictly LIFO: they mutably borrow
//! their parent, so the borrow checker enforces the nesting the format
//! requires. Dropping any unfinished builder rolls the buffer back to the
//! last committed state, so a half-built item never becomes visible.
//!
//! `finish()` does not commit: the caller decides when the buffer content
//! becomes permanent, mirroring the reserve/commit split of the buffer
//! itself.

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::item::{padded_length, ItemHeader, ItemType, write_i32, write_i64, write_u32, ALIGN, HEADER_SIZE};
use crate::osm::layout::*;
use crate::osm::Location;

/// Canonical sub-item order: user name, tags, object-specific list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Fresh,
    User,
    Tags,
    Specific,
}

/// Appends a complete small item (header, payload parts, zeroed padding).
fn append_blob_item(buffer: &mut Buffer, kind: ItemType, parts: &[&[u8]]) -> Result<()> {
    let payload_len: usize = parts.iter().map(|p| p.len()).sum();
    let unpadded = HEADER_SIZE + payload_len;
    let size = padded_length(unpadded);
    let tail_pad = (size - unpadded) as u8;
    let offset = buffer.reserve_space(size)?;
    let data = buffer.bytes_mut();
    ItemHeader {
        size: size as u32,
        kind,
        tail_pad,
    }
    .write(&mut data[offset..]);
    let mut pos = offset + HEADER_SIZE;
    for part in parts {
        data[pos..pos + part.len()].copy_from_slice(part);
        pos += part.len();
    }
    for byte in &mut data[pos..offset + size] {
        *byte = 0;
    }
    Ok(())
}

struct ObjectBuilder<'a> {
    buffer: &'a mut Buffer,
    start: usize,
    stage: Stage,
    finished: bool,
}

impl<'a> ObjectBuilder<'a> {
    fn new(buffer: &'a mut Buffer, kind: ItemType) -> Result<ObjectBuilder<'a>> {
        debug_assert!(kind.is_object());
        let fixed_size = if kind == ItemType::Node {
            FIXED_SIZE_NODE
        } else {
            FIXED_SIZE_OBJECT
        };
        let start = buffer.reserve_space(fixed_size)?;
        debug_assert!(start % ALIGN == 0);
        let data = buffer.bytes_mut();
        for byte in &mut data[start..start + fixed_size] {
            *byte = 0;
        }
        ItemHeader {
            size: fixed_size as u32,
            kind,
            tail_pad: 0,
        }
        .write(&mut data[start..]);
        write_u32(data, start + OFF_FLAGS, FLAG_VISIBLE);
        if kind == ItemType::Node {
            write_i32(data, start + OFF_LOCATION, i32::MIN);
            write_i32(data, start + OFF_LOCATION + 4, i32::MIN);
        }
        Ok(ObjectBuilder {
            buffer,
            start,
            stage: Stage::Fresh,
            finished: false,
        })
    }

    fn advance_stage(&mut self, next: Stage) -> Result<()> {
        if next <= self.stage {
            return Err(Error::Logic("sub-items must follow the canonical order"));
        }
        self.stage = next;
        Ok(())
    }

    fn set_i64(&mut self, offset: usize, value: i64) {
        write_i64(self.buffer.bytes_mut(), self.start + offset, value);
    }

    fn set_i32(&mut self, offset: usize, value: i32) {
        write_i32(self.buffer.bytes_mut(), self.start + offset, value);
    }

    fn set_flag(&mut self, flag: u32, on: bool) {
        let data = self.buffer.bytes_mut();
        let mut flags = crate::item::read_u32(data, self.start + OFF_FLAGS);
        if on {
            flags |= flag;
        } else {
            flags &= !flag;
        }
        write_u32(data, self.start + OFF_FLAGS, flags);
    }

    fn set_user(&mut self, user: &str) -> Result<()> {
        self.advance_stage(Stage::User)?;
        append_blob_item(self.buffer, ItemType::UserName, &[user.as_bytes()])
    }

    fn finish(mut self) -> Result<usize> {
        let size = self
            .buffer
            .written()
            .checked_sub(self.start)
            .ok_or(Error::Logic("builder state out of sync with buffer"))?;
        debug_assert!(size % ALIGN == 0);
        let data = self.buffer.bytes_mut();
        write_u32(data, self.start, size as u32);
        self.finished = true;
        Ok(self.start)
    }
}

impl Drop for ObjectBuilder<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.buffer.rollback();
        }
    }
}

macro_rules! object_builder {
    ($name:ident, $kind:expr) => {
        pub struct $name<'a> {
            inner: ObjectBuilder<'a>,
        }

        impl<'a> $name<'a> {
            pub fn new(buffer: &'a mut Buffer) -> Result<$name<'a>> {
                Ok($name {
                    inner: ObjectBuilder::new(buffer, $kind)?,
                })
            }

            pub fn set_id(&mut self, id: i64) -> &mut Self {
                self.inner.set_i64(OFF_ID, id);
                self
            }

            /// UNIX seconds; 0 means absent.
            pub fn set_timestamp(&mut self, timestamp: i64) -> &mut Self {
                self.inner.set_i64(OFF_TIMESTAMP, timestamp);
                self
            }

            pub fn set_changeset(&mut self, changeset: i32) -> &mut Self {
                self.inner.set_i32(OFF_CHANGESET, changeset);
                self
            }

            pub fn set_uid(&mut self, uid: i32) -> &mut Self {
                self.inner.set_i32(OFF_UID, uid);
                self
            }

            pub fn set_version(&mut self, version: u32) -> &mut Self {
                self.inner
                    .set_i32(OFF_VERSION, version as i32);
                self
            }

            pub fn set_visible(&mut self, visible: bool) -> &mut Self {
                self.inner.set_flag(FLAG_VISIBLE, visible);
                self
            }

            pub fn set_removed(&mut self, removed: bool) -> &mut Self {
                self.inner.set_flag(FLAG_REMOVED, removed);
                self
            }

            /// Adds the user name sub-item. Must precede tags and lists.
            pub fn set_user(&mut self, user: &str) -> Result<&mut Self> {
                self.inner.set_user(user)?;
                Ok(self)
            }

            /// Opens the tag list sub-builder. At most once per object.
            pub fn tags(&mut self) -> Result<TagListBuilder<'_>> {
                self.inner.advance_stage(Stage::Tags)?;
                ListBuilder::open(self.inner.buffer, ItemType::TagList).map(TagListBuilder)
            }

            /// Writes the final item size. The buffer still has to be
            /// committed by the caller.
            pub fn finish(self) -> Result<usize> {
                self.inner.finish()
            }
        }
    };
}

object_builder!(NodeBuilder, ItemType::Node);
object_builder!(WayBuilder, ItemType::Way);
object_builder!(RelationBuilder, ItemType::Relation);
object_builder!(ChangesetBuilder, ItemType::Changeset);

impl<'a> NodeBuilder<'a> {
    pub fn set_location(&mut self, location: Location) -> &mut Self {
        self.inner.set_i32(OFF_LOCATION, location.lat_e7());
        self.inner.set_i32(OFF_LOCATION + 4, location.lon_e7());
        self
    }
}

impl<'a> WayBuilder<'a> {
    /// Opens the node reference list sub-builder.
    pub fn node_refs(&mut self) -> Result<NodeRefListBuilder<'_>> {
        self.inner.advance_stage(Stage::Specific)?;
        ListBuilder::open(self.inner.buffer, ItemType::NodeRefList).map(NodeRefListBuilder)
    }
}

impl<'a> RelationBuilder<'a> {
    /// Opens the member list sub-builder.
    pub fn members(&mut self) -> Result<RelationMemberListBuilder<'_>> {
        self.inner.advance_stage(Stage::Specific)?;
        ListBuilder::open(self.inner.buffer, ItemType::RelationMemberList)
            .map(RelationMemberListBuilder)
    }
}

impl<'a> ChangesetBuilder<'a> {
    /// Opens the discussion sub-builder.
    pub fn discussion(&mut self) -> Result<DiscussionBuilder<'_>> {
        self.inner.advance_stage(Stage::Specific)?;
        ListBuilder::open(self.inner.buffer, ItemType::Discussion).map(DiscussionBuilder)
    }
}

/// Shared core of the list sub-builders: a header slot whose size and
/// padding are patched on finish.
struct ListBuilder<'b> {
    buffer: &'b mut Buffer,
    start: usize,
    finished: bool,
}

impl<'b> ListBuilder<'b> {
    fn open(buffer: &'b mut Buffer, kind: ItemType) -> Result<ListBuilder<'b>> {
        let start = buffer.reserve_space(HEADER_SIZE)?;
        ItemHeader {
            size: HEADER_SIZE as u32,
            kind,
            tail_pad: 0,
        }
        .write(&mut buffer.bytes_mut()[start..]);
        Ok(ListBuilder {
            buffer,
            start,
            finished: false,
        })
    }

    fn close(&mut self) -> Result<()> {
        let unpadded = self
            .buffer
            .written()
            .checked_sub(self.start)
            .ok_or(Error::Logic("builder state out of sync with buffer"))?;
        let size = padded_length(unpadded);
        let tail_pad = size - unpadded;
        let pad_offset = self.buffer.reserve_space(tail_pad)?;
        let data = self.buffer.bytes_mut();
        for byte in &mut data[pad_offset..pad_offset + tail_pad] {
            *byte = 0;
        }
        write_u32(data, self.start, size as u32);
        data[self.start + 5] = tail_pad as u8;
        self.finished = true;
        Ok(())
    }
}

impl Drop for ListBuilder<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.buffer.rollback();
        }
    }
}

pub struct TagListBuilder<'b>(ListBuilder<'b>);

impl<'b> TagListBuilder<'b> {
    pub fn add_tag(&mut self, key: &str, value: &str) -> Result<&mut Self> {
        if key.as_bytes().contains(&0) || value.as_bytes().contains(&0) {
            return Err(Error::InvalidArgument("tag strings must not contain NUL"));
        }
        let size = key.len() + value.len() + 2;
        let offset = self.0.buffer.reserve_space(size)?;
        let data = self.0.buffer.bytes_mut();
        let key_end = offset + key.len();
        data[offset..key_end].copy_from_slice(key.as_bytes());
        data[key_end] = 0;
        data[key_end + 1..key_end + 1 + value.len()].copy_from_slice(value.as_bytes());
        data[key_end + 1 + value.len()] = 0;
        Ok(self)
    }

    pub fn finish(mut self) -> Result<()> {
        self.0.close()
    }
}

pub struct NodeRefListBuilder<'b>(ListBuilder<'b>);

impl<'b> NodeRefListBuilder<'b> {
    pub fn add_ref(&mut self, id: i64) -> Result<&mut Self> {
        let offset = self.0.buffer.reserve_space(8)?;
        write_i64(self.0.buffer.bytes_mut(), offset, id);
        Ok(self)
    }

    pub fn finish(mut self) -> Result<()> {
        self.0.close()
    }
}

pub struct RelationMemberListBuilder<'b>(ListBuilder<'b>);

impl<'b> RelationMemberListBuilder<'b> {
    pub fn add_member(&mut self, kind: ItemType, member_ref: i64, role: &str) -> Result<&mut Self> {
        if !matches!(kind, ItemType::Node | ItemType::Way | ItemType::Relation) {
            return Err(Error::InvalidArgument(
                "relation members must be nodes, ways or relations",
            ));
        }
        append_blob_item(
            self.0.buffer,
            ItemType::RelationMember,
            &[&member_ref.to_le_bytes(), &[kind as u8, 0], role.as_bytes()],
        )?;
        Ok(self)
    }

    pub fn finish(mut self) -> Result<()> {
        self.0.close()
    }
}

pub struct DiscussionBuilder<'b>(ListBuilder<'b>);

impl<'b> DiscussionBuilder<'b> {
    pub fn add_comment(
        &mut self,
        timestamp: i64,
        uid: i32,
        user: &str,
        text: &str,
    ) -> Result<&mut Self> {
        if user.as_bytes().contains(&0) {
            return Err(Error::InvalidArgument("user name must not contain NUL"));
        }
        append_blob_item(
            self.0.buffer,
            ItemType::Comment,
            &[
                &timestamp.to_le_bytes(),
                &uid.to_le_bytes(),
                user.as_bytes(),
                &[0],
                text.as_bytes(),
            ],
        )?;
        Ok(self)
    }

    pub fn finish(mut self) -> Result<()> {
        self.0.close()
    }
}
