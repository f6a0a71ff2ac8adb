//! Zero-copy typed views over the items of a buffer.
//!
//! A view borrows the byte span of one item and decodes fields on access.
//! Nothing here allocates; lists are iterated directly out of the underlying
//! buffer bytes.

use std::str;

use crate::item::{read_i32, read_i64, read_u32, ItemRef, ItemType};

/// Fixed field offsets shared by all OSM objects, relative to the item start.
pub(crate) mod layout {
    pub const OFF_ID: usize = 8;
    pub const OFF_TIMESTAMP: usize = 16;
    pub const OFF_CHANGESET: usize = 24;
    pub const OFF_UID: usize = 28;
    pub const OFF_VERSION: usize = 32;
    pub const OFF_FLAGS: usize = 36;
    pub const OFF_LOCATION: usize = 40;

    pub const FIXED_SIZE_OBJECT: usize = 40;
    pub const FIXED_SIZE_NODE: usize = 48;

    pub const FLAG_VISIBLE: u32 = 1;
    pub const FLAG_REMOVED: u32 = 2;

    /// Relation member payload: ref (8), member type (1), flags (1), role.
    pub const MEMBER_ROLE_OFFSET: usize = 10;
    pub const MEMBER_FLAG_FULL: u8 = 1;

    /// Comment payload: timestamp (8), uid (4), user NUL text.
    pub const COMMENT_USER_OFFSET: usize = 12;
}

use layout::*;

/// A geographic position in units of 1e-7 degrees.
///
/// `(i32::MIN, i32::MIN)` is the "undefined" sentinel used for nodes without
/// coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    lat: i32,
    lon: i32,
}

/// Coordinate scale: stored units per degree.
pub const COORDINATE_PRECISION: f64 = 10_000_000.0;

impl Location {
    pub fn new(lat_e7: i32, lon_e7: i32) -> Location {
        Location {
            lat: lat_e7,
            lon: lon_e7,
        }
    }

    pub fn from_degrees(lat: f64, lon: f64) -> Location {
        Location {
            lat: (lat * COORDINATE_PRECISION).round() as i32,
            lon: (lon * COORDINATE_PRECISION).round() as i32,
        }
    }

    pub fn undefined() -> Location {
        Location {
            lat: i32::MIN,
            lon: i32::MIN,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.lat != i32::MIN || self.lon != i32::MIN
    }

    pub fn lat_e7(&self) -> i32 {
        self.lat
    }

    pub fn lon_e7(&self) -> i32 {
        self.lon
    }

    pub fn lat(&self) -> f64 {
        f64::from(self.lat) / COORDINATE_PRECISION
    }

    pub fn lon(&self) -> f64 {
        f64::from(self.lon) / COORDINATE_PRECISION
    }
}

impl Default for Location {
    fn default() -> Location {
        Location::undefined()
    }
}

fn subitems(bytes: &[u8], fixed_size: usize) -> SubItems<'_> {
    SubItems {
        data: &bytes[fixed_size..],
    }
}

fn find_subitem<'a>(bytes: &'a [u8], fixed_size: usize, kind: ItemType) -> Option<ItemRef<'a>> {
    subitems(bytes, fixed_size).find(|item| item.kind() == kind)
}

/// Iterator over the sub-items in an object's tail.
struct SubItems<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for SubItems<'a> {
    type Item = ItemRef<'a>;

    fn next(&mut self) -> Option<ItemRef<'a>> {
        if self.data.is_empty() {
            return None;
        }
        match ItemRef::parse(self.data) {
            Ok(item) => {
                self.data = &self.data[item.size()..];
                Some(item)
            }
            Err(_) => {
                debug_assert!(false, "corrupt sub-item");
                self.data = &[];
                None
            }
        }
    }
}

/// Common accessors of the four OSM object types.
pub trait OsmObject {
    /// The object's full item span.
    fn item_bytes(&self) -> &[u8];

    /// Size of the fixed field area including the item header.
    fn fixed_size(&self) -> usize {
        FIXED_SIZE_OBJECT
    }

    fn id(&self) -> i64 {
        read_i64(self.item_bytes(), OFF_ID)
    }

    /// UNIX seconds; 0 means absent.
    fn timestamp(&self) -> i64 {
        read_i64(self.item_bytes(), OFF_TIMESTAMP)
    }

    fn changeset(&self) -> i32 {
        read_i32(self.item_bytes(), OFF_CHANGESET)
    }

    /// User id; 0 means anonymous.
    fn uid(&self) -> i32 {
        read_i32(self.item_bytes(), OFF_UID)
    }

    fn version(&self) -> u32 {
        read_u32(self.item_bytes(), OFF_VERSION)
    }

    fn visible(&self) -> bool {
        read_u32(self.item_bytes(), OFF_FLAGS) & FLAG_VISIBLE != 0
    }

    fn removed(&self) -> bool {
        read_u32(self.item_bytes(), OFF_FLAGS) & FLAG_REMOVED != 0
    }

    /// User name, empty if not set.
    fn user(&self) -> &str {
        find_subitem(self.item_bytes(), self.fixed_size(), ItemType::UserName)
            .and_then(|item| str::from_utf8(item.payload()).ok())
            .unwrap_or("")
    }

    fn tags(&self) -> Tags<'_> {
        let payload = find_subitem(self.item_bytes(), self.fixed_size(), ItemType::TagList)
            .map(|item| item.payload())
            .unwrap_or(&[]);
        Tags { data: payload }
    }
}

macro_rules! object_view {
    ($name:ident, $kind:expr) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name<'a> {
            data: &'a [u8],
        }

        impl<'a> $name<'a> {
            pub(crate) fn new(data: &'a [u8]) -> $name<'a> {
                $name { data }
            }
        }

        impl<'a> OsmObject for $name<'a> {
            fn item_bytes(&self) -> &[u8] {
                self.data
            }

            fn fixed_size(&self) -> usize {
                if $kind == ItemType::Node {
                    FIXED_SIZE_NODE
                } else {
                    FIXED_SIZE_OBJECT
                }
            }
        }
    };
}

object_view!(Node, ItemType::Node);
object_view!(Way, ItemType::Way);
object_view!(Relation, ItemType::Relation);
object_view!(Changeset, ItemType::Changeset);

impl<'a> Node<'a> {
    pub fn location(&self) -> Location {
        Location::new(
            read_i32(self.data, OFF_LOCATION),
            read_i32(self.data, OFF_LOCATION + 4),
        )
    }
}

impl<'a> Way<'a> {
    /// Ordered node references of this way.
    pub fn node_refs(&self) -> NodeRefs<'a> {
        let payload = find_subitem(self.data, FIXED_SIZE_OBJECT, ItemType::NodeRefList)
            .map(|item| item.payload())
            .unwrap_or(&[]);
        NodeRefs { data: payload }
    }
}

impl<'a> Relation<'a> {
    pub fn members(&self) -> Members<'a> {
        let payload = find_subitem(self.data, FIXED_SIZE_OBJECT, ItemType::RelationMemberList)
            .map(|item| item.payload())
            .unwrap_or(&[]);
        Members { data: payload }
    }
}

impl<'a> Changeset<'a> {
    pub fn discussion(&self) -> Comments<'a> {
        let payload = find_subitem(self.data, FIXED_SIZE_OBJECT, ItemType::Discussion)
            .map(|item| item.payload())
            .unwrap_or(&[]);
        Comments { data: payload }
    }

    pub fn num_comments(&self) -> usize {
        self.discussion().count()
    }
}

/// One of the four concrete OSM object views.
#[derive(Debug, Clone, Copy)]
pub enum ObjectRef<'a> {
    Node(Node<'a>),
    Way(Way<'a>),
    Relation(Relation<'a>),
    Changeset(Changeset<'a>),
}

impl<'a> ObjectRef<'a> {
    pub fn kind(&self) -> ItemType {
        match self {
            ObjectRef::Node(_) => ItemType::Node,
            ObjectRef::Way(_) => ItemType::Way,
            ObjectRef::Relation(_) => ItemType::Relation,
            ObjectRef::Changeset(_) => ItemType::Changeset,
        }
    }
}

impl<'a> OsmObject for ObjectRef<'a> {
    fn item_bytes(&self) -> &[u8] {
        match self {
            ObjectRef::Node(o) => o.item_bytes(),
            ObjectRef::Way(o) => o.item_bytes(),
            ObjectRef::Relation(o) => o.item_bytes(),
            ObjectRef::Changeset(o) => o.item_bytes(),
        }
    }

    fn fixed_size(&self) -> usize {
        match self {
            ObjectRef::Node(_) => FIXED_SIZE_NODE,
            _ => FIXED_SIZE_OBJECT,
        }
    }
}

/// Iterator over the key/value pairs of a tag list.
#[derive(Debug, Clone)]
pub struct Tags<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Tags<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<(&'a str, &'a str)> {
        if self.data.is_empty() {
            return None;
        }
        let key_end = self.data.iter().position(|&b| b == 0)?;
        let value_end = key_end + 1 + self.data[key_end + 1..].iter().position(|&b| b == 0)?;
        let key = str::from_utf8(&self.data[..key_end]).ok()?;
        let value = str::from_utf8(&self.data[key_end + 1..value_end]).ok()?;
        self.data = &self.data[value_end + 1..];
        Some((key, value))
    }
}

/// Iterator over the packed node ids of a way.
#[derive(Debug, Clone)]
pub struct NodeRefs<'a> {
    data: &'a [u8],
}

impl<'a> NodeRefs<'a> {
    pub fn len(&self) -> usize {
        self.data.len() / 8
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<'a> Iterator for NodeRefs<'a> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.data.len() < 8 {
            return None;
        }
        let value = read_i64(self.data, 0);
        self.data = &self.data[8..];
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len(), Some(self.len()))
    }
}

impl<'a> ExactSizeIterator for NodeRefs<'a> {}

/// View of a single relation member.
#[derive(Debug, Clone, Copy)]
pub struct RelationMemberRef<'a> {
    payload: &'a [u8],
    rest: &'a [u8],
}

impl<'a> RelationMemberRef<'a> {
    pub fn member_ref(&self) -> i64 {
        read_i64(self.payload, 0)
    }

    pub fn member_type(&self) -> ItemType {
        let kind = ItemType::from_u8(self.payload[8]);
        debug_assert!(kind.map(ItemType::is_object).unwrap_or(false));
        kind.unwrap_or(ItemType::Node)
    }

    pub fn role(&self) -> &'a str {
        str::from_utf8(&self.payload[MEMBER_ROLE_OFFSET..]).unwrap_or("")
    }

    /// True when the referenced object is stored inline after this member.
    pub fn is_full(&self) -> bool {
        self.payload[9] & MEMBER_FLAG_FULL != 0
    }

    /// The fully materialized member object, if stored inline.
    pub fn object(&self) -> Option<ObjectRef<'a>> {
        if !self.is_full() {
            return None;
        }
        ItemRef::parse(self.rest).ok().and_then(|i| i.as_object())
    }
}

/// Iterator over the members of a relation.
#[derive(Debug, Clone)]
pub struct Members<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Members<'a> {
    type Item = RelationMemberRef<'a>;

    fn next(&mut self) -> Option<RelationMemberRef<'a>> {
        if self.data.is_empty() {
            return None;
        }
        let item = ItemRef::parse(self.data).ok()?;
        debug_assert_eq!(item.kind(), ItemType::RelationMember);
        let rest = &self.data[item.size()..];
        let member = RelationMemberRef {
            payload: item.payload(),
            rest,
        };
        // a full member is followed by its object item, skip it
        self.data = if member.is_full() {
            match ItemRef::parse(rest) {
                Ok(object) => &rest[object.size()..],
                Err(_) => &[],
            }
        } else {
            rest
        };
        Some(member)
    }
}

/// View of a single changeset discussion comment.
#[derive(Debug, Clone, Copy)]
pub struct CommentRef<'a> {
    payload: &'a [u8],
}

impl<'a> CommentRef<'a> {
    pub fn timestamp(&self) -> i64 {
        read_i64(self.payload, 0)
    }

    pub fn uid(&self) -> i32 {
        read_i32(self.payload, 8)
    }

    pub fn user(&self) -> &'a str {
        let text = &self.payload[COMMENT_USER_OFFSET..];
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        str::from_utf8(&text[..end]).unwrap_or("")
    }

    pub fn text(&self) -> &'a str {
        let text = &self.payload[COMMENT_USER_OFFSET..];
        match text.iter().position(|&b| b == 0) {
            Some(nul) => str::from_utf8(&text[nul + 1..]).unwrap_or(""),
            None => "",
        }
    }
}

/// Iterator over the comments of a changeset discussion.
#[derive(Debug, Clone)]
pub struct Comments<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for Comments<'a> {
    type Item = CommentRef<'a>;

    fn next(&mut self) -> Option<CommentRef<'a>> {
        if self.data.is_empty() {
            return None;
        }
        let item = ItemRef::parse(self.data).ok()?;
        debug_assert_eq!(item.kind(), ItemType::Comment);
        self.data = &self.data[item.size()..];
        Some(CommentRef {
            payload: item.payload(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_sentinel() {
        assert!(!Location::undefined().is_defined());
        assert!(Location::new(0, 0).is_defined());
        assert!(Location::from_degrees(50.0, 10.0).is_defined());
    }

    #[test]
    fn location_precision() {
        let loc = Location::from_degrees(50.1234567, -10.7654321);
        assert_eq!(loc.lat_e7(), 501_234_567);
        assert_eq!(loc.lon_e7(), -107_654_321);
        assert!((loc.lat() - 50.1234567).abs() < 1e-9);
        assert!((loc.lon() + 10.7654321).abs() < 1e-9);
    }
}
