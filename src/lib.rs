//! Reading and writing OpenStreetMap data.
//!
//! `osmbuf` stores OSM objects (nodes, ways, relations and changesets)
//! in flat, pointer-free [`Buffer`]s of length-prefixed items and moves
//! those buffers through a multi-threaded read/write pipeline speaking the
//! OSM XML/osmChange dialect and the binary PBF dialect.
//!
//! The three contracts everything else builds on:
//!
//! 1. acquire a [`Buffer`] (from a [`Reader`](io::Reader) or by hand),
//! 2. iterate typed items ([`Buffer::objects`], [`apply`]),
//! 3. emit typed items through a builder ([`NodeBuilder`] and friends).
//!
//! ```no_run
//! use osmbuf::{io::Reader, OsmObject};
//!
//! # fn main() -> osmbuf::Result<()> {
//! let mut reader = Reader::open("extract.osm.pbf")?;
//! loop {
//!     let buffer = reader.read()?;
//!     if !buffer.is_valid() {
//!         break;
//!     }
//!     for object in buffer.objects() {
//!         println!("{} v{}", object.id(), object.version());
//!     }
//! }
//! reader.close()?;
//! # Ok(())
//! # }
//! ```

mod buffer;
mod builder;
mod delta;
mod error;
mod handler;
mod item;
mod osm;
mod osmpbf;
mod pool;
mod queue;
mod strings;

pub mod io;

pub use buffer::{AutoGrow, Buffer, Items, Objects};
pub use builder::{
    ChangesetBuilder, DiscussionBuilder, NodeBuilder, NodeRefListBuilder, RelationBuilder,
    RelationMemberListBuilder, TagListBuilder, WayBuilder,
};
pub use error::{Error, Result};
pub use handler::{apply, apply_items, Handler};
pub use item::{padded_length, ItemRef, ItemType, ALIGN};
pub use osm::{
    Changeset, CommentRef, Comments, Location, Members, Node, NodeRefs, ObjectRef, OsmObject,
    Relation, RelationMemberRef, Tags, Way,
};
