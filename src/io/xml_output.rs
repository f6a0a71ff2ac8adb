//! XML encoder: each buffer becomes one pool task producing a UTF-8 chunk.

use std::fmt::Write as _;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::handler::{apply, Handler};
use crate::io::file::File;
use crate::io::{timestamp_to_iso, Header, OutputFormat};
use crate::osm::{Changeset, Node, OsmObject, Relation, Way};
use crate::pool::{Future, Pool};
use crate::queue::SharedQueue;

/// Escapes the five XML entities plus newline, carriage return and tab.
fn xml_escape(out: &mut String, input: &str) {
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            '\t' => out.push_str("&#x9;"),
            _ => out.push(c),
        }
    }
}

pub(crate) struct XmlOutput {
    queue: SharedQueue<Future<Vec<u8>>>,
    add_metadata: bool,
    write_visible_flag: bool,
    change_format: bool,
}

impl XmlOutput {
    pub fn new(file: &File, queue: SharedQueue<Future<Vec<u8>>>) -> XmlOutput {
        let change_format = file.is_true("xml_change_format");
        XmlOutput {
            queue,
            add_metadata: file.is_not_false("add_metadata"),
            write_visible_flag: (file.has_multiple_object_versions()
                || file.is_true("force_visible_flag"))
                && !change_format,
            change_format,
        }
    }

    fn push(&self, future: Future<Vec<u8>>) -> Result<()> {
        if self.queue.push(future) {
            Ok(())
        } else {
            Err(Error::Logic("output queue closed"))
        }
    }
}

impl OutputFormat for XmlOutput {
    fn write_header(&mut self, header: &Header) -> Result<()> {
        let mut out = String::from("<?xml version='1.0' encoding='UTF-8'?>\n");
        let root = if self.change_format { "osmChange" } else { "osm" };
        out.push_str("<");
        out.push_str(root);
        out.push_str(" version=\"0.6\"");
        if !self.change_format {
            if let Some(upload) = header.get("xml_josm_upload") {
                if upload == "true" || upload == "false" {
                    let _ = write!(out, " upload=\"{upload}\"");
                }
            }
        }
        out.push_str(" generator=\"");
        xml_escape(&mut out, header.get("generator").unwrap_or("osmbuf"));
        out.push_str("\">\n");

        if let Some(bounds) = header.bounds() {
            let _ = write!(
                out,
                "  <bounds minlon=\"{:.7}\" minlat=\"{:.7}\" maxlon=\"{:.7}\" maxlat=\"{:.7}\"/>\n",
                bounds.bottom_left().lon(),
                bounds.bottom_left().lat(),
                bounds.top_right().lon(),
                bounds.top_right().lat(),
            );
        }

        self.push(Future::ready(Ok(out.into_bytes())))
    }

    fn write_buffer(&mut self, buffer: Buffer) -> Result<()> {
        let block = XmlBlock {
            out: String::new(),
            last_op: Operation::None,
            add_metadata: self.add_metadata,
            write_visible_flag: self.write_visible_flag,
            change_format: self.change_format,
        };
        let future = Pool::global().submit(move || block.render(buffer));
        self.push(future)
    }

    fn close(&mut self) -> Result<()> {
        let root = if self.change_format {
            "</osmChange>\n"
        } else {
            "</osm>\n"
        };
        self.push(Future::ready(Ok(root.as_bytes().to_vec())))?;
        self.push(Future::ready(Ok(Vec::new())))
    }
}

/// osmChange operation wrappers, emitted only at transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    None,
    Create,
    Modify,
    Delete,
}

struct XmlBlock {
    out: String,
    last_op: Operation,
    add_metadata: bool,
    write_visible_flag: bool,
    change_format: bool,
}

impl XmlBlock {
    fn render(mut self, buffer: Buffer) -> Result<Vec<u8>> {
        apply(&buffer, &mut self)?;
        if self.change_format {
            self.open_close_op_tag(Operation::None);
        }
        Ok(self.out.into_bytes())
    }

    fn prefix(&self) -> &'static str {
        if self.change_format {
            "    "
        } else {
            "  "
        }
    }

    fn operation_for(object: &impl OsmObject) -> Operation {
        if !object.visible() {
            Operation::Delete
        } else if object.version() == 1 {
            Operation::Create
        } else {
            Operation::Modify
        }
    }

    fn open_close_op_tag(&mut self, op: Operation) {
        if op == self.last_op {
            return;
        }
        match self.last_op {
            Operation::None => {}
            Operation::Create => self.out.push_str("  </create>\n"),
            Operation::Modify => self.out.push_str("  </modify>\n"),
            Operation::Delete => self.out.push_str("  </delete>\n"),
        }
        match op {
            Operation::None => {}
            Operation::Create => self.out.push_str("  <create>\n"),
            Operation::Modify => self.out.push_str("  <modify>\n"),
            Operation::Delete => self.out.push_str("  <delete>\n"),
        }
        self.last_op = op;
    }

    fn write_meta(&mut self, object: &impl OsmObject) {
        let _ = write!(self.out, " id=\"{}\"", object.id());
        if !self.add_metadata {
            return;
        }
        if object.version() != 0 {
            let _ = write!(self.out, " version=\"{}\"", object.version());
        }
        if object.timestamp() != 0 {
            let _ = write!(
                self.out,
                " timestamp=\"{}\"",
                timestamp_to_iso(object.timestamp())
            );
        }
        if object.uid() != 0 {
            let _ = write!(self.out, " uid=\"{}\" user=\"", object.uid());
            xml_escape(&mut self.out, object.user());
            self.out.push('"');
        }
        if object.changeset() != 0 {
            let _ = write!(self.out, " changeset=\"{}\"", object.changeset());
        }
        if self.write_visible_flag {
            if object.visible() {
                self.out.push_str(" visible=\"true\"");
            } else {
                self.out.push_str(" visible=\"false\"");
            }
        }
    }

    fn write_tags(&mut self, object: &impl OsmObject) {
        for (key, value) in object.tags() {
            self.out.push_str("<tag k=\"");
            xml_escape(&mut self.out, key);
            self.out.push_str("\" v=\"");
            xml_escape(&mut self.out, value);
            self.out.push_str("\"/>");
        }
    }
}

impl Handler for XmlBlock {
    fn node(&mut self, node: &Node<'_>) -> Result<()> {
        if self.change_format {
            self.open_close_op_tag(Self::operation_for(node));
        }
        self.out.push_str(self.prefix());
        self.out.push_str("<node");
        self.write_meta(node);

        let location = node.location();
        if location.is_defined() {
            let _ = write!(
                self.out,
                " lat=\"{:.7}\" lon=\"{:.7}\"",
                location.lat(),
                location.lon()
            );
        }

        if node.tags().next().is_none() {
            self.out.push_str("/>\n");
            return Ok(());
        }
        self.out.push('>');
        self.write_tags(node);
        self.out.push_str("</node>\n");
        Ok(())
    }

    fn way(&mut self, way: &Way<'_>) -> Result<()> {
        if self.change_format {
            self.open_close_op_tag(Self::operation_for(way));
        }
        self.out.push_str(self.prefix());
        self.out.push_str("<way");
        self.write_meta(way);

        if way.node_refs().is_empty() && way.tags().next().is_none() {
            self.out.push_str("/>\n");
            return Ok(());
        }
        self.out.push('>');
        for node_ref in way.node_refs() {
            let _ = write!(self.out, "<nd ref=\"{node_ref}\"/>");
        }
        self.write_tags(way);
        self.out.push_str("</way>\n");
        Ok(())
    }

    fn relation(&mut self, relation: &Relation<'_>) -> Result<()> {
        if self.change_format {
            self.open_close_op_tag(Self::operation_for(relation));
        }
        self.out.push_str(self.prefix());
        self.out.push_str("<relation");
        self.write_meta(relation);

        let mut members = relation.members().peekable();
        if members.peek().is_none() && relation.tags().next().is_none() {
            self.out.push_str("/>\n");
            return Ok(());
        }
        self.out.push('>');
        for member in members {
            let _ = write!(
                self.out,
                "<member type=\"{}\" ref=\"{}\" role=\"",
                member.member_type().name(),
                member.member_ref()
            );
            xml_escape(&mut self.out, member.role());
            self.out.push_str("\"/>");
        }
        self.write_tags(relation);
        self.out.push_str("</relation>\n");
        Ok(())
    }

    fn changeset(&mut self, changeset: &Changeset<'_>) -> Result<()> {
        self.out.push_str(self.prefix());
        self.out.push_str("<changeset");
        let _ = write!(self.out, " id=\"{}\"", changeset.id());
        if changeset.timestamp() != 0 {
            let _ = write!(
                self.out,
                " created_at=\"{}\"",
                timestamp_to_iso(changeset.timestamp())
            );
        }
        if changeset.uid() != 0 {
            let _ = write!(self.out, " uid=\"{}\" user=\"", changeset.uid());
            xml_escape(&mut self.out, changeset.user());
            self.out.push('"');
        }
        let num_comments = changeset.num_comments();
        let _ = write!(self.out, " comments_count=\"{num_comments}\"");

        if changeset.tags().next().is_none() && num_comments == 0 {
            self.out.push_str("/>\n");
            return Ok(());
        }
        self.out.push('>');
        self.write_tags(changeset);
        if num_comments > 0 {
            self.out.push_str("<discussion>");
            for comment in changeset.discussion() {
                let _ = write!(
                    self.out,
                    "<comment uid=\"{}\" user=\"",
                    comment.uid()
                );
                xml_escape(&mut self.out, comment.user());
                let _ = write!(
                    self.out,
                    "\" date=\"{}\"><text>",
                    timestamp_to_iso(comment.timestamp())
                );
                xml_escape(&mut self.out, comment.text());
                self.out.push_str("</text></comment>");
            }
            self.out.push_str("</discussion>");
        }
        self.out.push_str("</changeset>\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AutoGrow;
    use crate::builder::NodeBuilder;
    use crate::osm::Location;

    fn render(buffer: Buffer, change_format: bool) -> String {
        let block = XmlBlock {
            out: String::new(),
            last_op: Operation::None,
            add_metadata: true,
            write_visible_flag: false,
            change_format,
        };
        String::from_utf8(block.render(buffer).unwrap()).unwrap()
    }

    #[test]
    fn node_with_tag_is_contiguous() {
        let mut buffer = Buffer::new(1024, AutoGrow::Yes).unwrap();
        {
            let mut node = NodeBuilder::new(&mut buffer).unwrap();
            node.set_id(1)
                .set_version(1)
                .set_location(Location::from_degrees(50.0, 10.0));
            let mut tags = node.tags().unwrap();
            tags.add_tag("natural", "peak").unwrap();
            tags.finish().unwrap();
            node.finish().unwrap();
        }
        buffer.commit().unwrap();

        let out = render(buffer, false);
        assert!(out.contains(
            "<node id=\"1\" version=\"1\" lat=\"50.0000000\" lon=\"10.0000000\">\
             <tag k=\"natural\" v=\"peak\"/></node>"
        ));
    }

    #[test]
    fn escaping_covers_entities_and_whitespace() {
        let mut out = String::new();
        xml_escape(&mut out, "a&b\"c'd<e>f\ng\rh\ti");
        assert_eq!(out, "a&amp;b&quot;c&apos;d&lt;e&gt;f&#xA;g&#xD;h&#x9;i");
    }

    #[test]
    fn change_format_emits_operation_transitions() {
        let mut buffer = Buffer::new(4096, AutoGrow::Yes).unwrap();
        for (id, version, visible) in [(1, 1, true), (2, 1, true), (3, 2, true), (4, 5, false)] {
            let mut node = NodeBuilder::new(&mut buffer).unwrap();
            node.set_id(id).set_version(version).set_visible(visible);
            node.finish().unwrap();
            buffer.commit().unwrap();
        }

        let out = render(buffer, true);
        assert_eq!(out.matches("<create>").count(), 1);
        assert_eq!(out.matches("</create>").count(), 1);
        assert_eq!(out.matches("<modify>").count(), 1);
        assert_eq!(out.matches("<delete>").count(), 1);
        assert_eq!(out.matches("</delete>").count(), 1);
        let create = out.find("<create>").unwrap();
        let modify = out.find("<modify>").unwrap();
        let delete = out.find("<delete>").unwrap();
        assert!(create < modify && modify < delete);
    }

    #[test]
    fn anonymous_and_absent_fields_are_omitted() {
        let mut buffer = Buffer::new(1024, AutoGrow::Yes).unwrap();
        {
            let mut node = NodeBuilder::new(&mut buffer).unwrap();
            node.set_id(9);
            node.finish().unwrap();
        }
        buffer.commit().unwrap();

        let out = render(buffer, false);
        assert!(out.contains("<node id=\"9\"/>"));
        assert!(!out.contains("timestamp"));
        assert!(!out.contains("uid"));
        assert!(!out.contains("lat"));
    }
}
