//! Visitor dispatch over buffer items.
//!
//! A handler implements one method per entity type it cares about; the
//! defaults do nothing. [`apply`] walks a buffer and dispatches on the type
//! tag stored in each item header, so there is no per-item allocation and no
//! dynamic dispatch on the hot path.

use crate::buffer::Buffer;
use crate::error::Result;
use crate::item::ItemRef;
use crate::osm::{Changeset, Node, ObjectRef, Relation, Way};

pub trait Handler {
    fn node(&mut self, _node: &Node<'_>) -> Result<()> {
        Ok(())
    }

    fn way(&mut self, _way: &Way<'_>) -> Result<()> {
        Ok(())
    }

    fn relation(&mut self, _relation: &Relation<'_>) -> Result<()> {
        Ok(())
    }

    fn changeset(&mut self, _changeset: &Changeset<'_>) -> Result<()> {
        Ok(())
    }

    /// Called for any item that is not an OSM object.
    fn item(&mut self, _item: &ItemRef<'_>) -> Result<()> {
        Ok(())
    }
}

/// Applies a handler to every committed item of a buffer.
pub fn apply<H: Handler + ?Sized>(buffer: &Buffer, handler: &mut H) -> Result<()> {
    apply_items(buffer.items(), handler)
}

/// Applies a handler to the items of any iterator.
pub fn apply_items<'a, I, H>(items: I, handler: &mut H) -> Result<()>
where
    I: IntoIterator<Item = ItemRef<'a>>,
    H: Handler + ?Sized,
{
    for item in items {
        match item.as_object() {
            Some(ObjectRef::Node(node)) => handler.node(&node)?,
            Some(ObjectRef::Way(way)) => handler.way(&way)?,
            Some(ObjectRef::Relation(relation)) => handler.relation(&relation)?,
            Some(ObjectRef::Changeset(changeset)) => handler.changeset(&changeset)?,
            None => handler.item(&item)?,
        }
    }
    Ok(())
}

/// Handlers compose: a pair forwards every item to both, left first.
impl<A: Handler, B: Handler> Handler for (A, B) {
    fn node(&mut self, node: &Node<'_>) -> Result<()> {
        self.0.node(node)?;
        self.1.node(node)
    }

    fn way(&mut self, way: &Way<'_>) -> Result<()> {
        self.0.way(way)?;
        self.1.way(way)
    }

    fn relation(&mut self, relation: &Relation<'_>) -> Result<()> {
        self.0.relation(relation)?;
        self.1.relation(relation)
    }

    fn changeset(&mut self, changeset: &Changeset<'_>) -> Result<()> {
        self.0.changeset(changeset)?;
        self.1.changeset(changeset)
    }

    fn item(&mut self, item: &ItemRef<'_>) -> Result<()> {
        self.0.item(item)?;
        self.1.item(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AutoGrow;
    use crate::builder::{NodeBuilder, WayBuilder};
    use crate::osm::OsmObject;

    #[derive(Default)]
    struct Counter {
        nodes: usize,
        ways: usize,
        ids: Vec<i64>,
    }

    impl Handler for Counter {
        fn node(&mut self, node: &Node<'_>) -> Result<()> {
            self.nodes += 1;
            self.ids.push(node.id());
            Ok(())
        }

        fn way(&mut self, way: &Way<'_>) -> Result<()> {
            self.ways += 1;
            self.ids.push(way.id());
            Ok(())
        }
    }

    fn mixed_buffer() -> Buffer {
        let mut buffer = Buffer::new(1024, AutoGrow::Yes).unwrap();
        let mut node = NodeBuilder::new(&mut buffer).unwrap();
        node.set_id(1);
        node.finish().unwrap();
        buffer.commit().unwrap();
        let mut way = WayBuilder::new(&mut buffer).unwrap();
        way.set_id(2);
        way.finish().unwrap();
        buffer.commit().unwrap();
        buffer
    }

    #[test]
    fn dispatch_by_type() {
        let buffer = mixed_buffer();
        let mut counter = Counter::default();
        apply(&buffer, &mut counter).unwrap();
        assert_eq!(counter.nodes, 1);
        assert_eq!(counter.ways, 1);
        assert_eq!(counter.ids, vec![1, 2]);
    }

    #[test]
    fn pair_forwards_in_order() {
        let buffer = mixed_buffer();
        let mut pair = (Counter::default(), Counter::default());
        apply(&buffer, &mut pair).unwrap();
        assert_eq!(pair.0.ids, pair.1.ids);
        assert_eq!(pair.0.nodes, 1);
        assert_eq!(pair.1.ways, 1);
    }
}
