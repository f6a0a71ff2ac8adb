//! Streaming XML decoder.
//!
//! A single background thread drives the SAX-style parser and accumulates
//! objects into a write buffer. Completed buffers are enqueued as ready
//! futures; the queue provides the backpressure that ties parsing speed to
//! the consumer.

use std::io::BufRead;
use std::str::FromStr;

use log::trace;
use quick_xml::events::{BytesStart, Event};

use crate::buffer::{AutoGrow, Buffer};
use crate::builder::{ChangesetBuilder, NodeBuilder, RelationBuilder, WayBuilder};
use crate::error::{Error, Result};
use crate::io::{parse_iso_timestamp, Bounds, Header, MAX_ENTITIES_PER_BLOCK};
use crate::item::ItemType;
use crate::osm::Location;
use crate::pool::{Future, Promise};
use crate::queue::SharedQueue;

const XML_BUFFER_SIZE: usize = 10 * 1024 * 1024;
const XML_BUFFER_FILL: usize = XML_BUFFER_SIZE / 10 * 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeOp {
    None,
    Create,
    Modify,
    Delete,
}

/// One object being accumulated from attributes and child elements.
#[derive(Debug)]
struct Pending {
    kind: ItemType,
    id: i64,
    version: u32,
    changeset: i32,
    uid: i32,
    timestamp: i64,
    visible: bool,
    user: String,
    location: Location,
    tags: Vec<(String, String)>,
    refs: Vec<i64>,
    members: Vec<(ItemType, i64, String)>,
    comments: Vec<PendingComment>,
}

impl Pending {
    fn new(kind: ItemType) -> Pending {
        Pending {
            kind,
            id: 0,
            version: 0,
            changeset: 0,
            uid: 0,
            timestamp: 0,
            visible: true,
            user: String::new(),
            location: Location::undefined(),
            tags: Vec::new(),
            refs: Vec::new(),
            members: Vec::new(),
            comments: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct PendingComment {
    uid: i32,
    timestamp: i64,
    user: String,
    text: String,
}

enum StreamEnd {
    Eof,
    Cancelled,
}

pub(crate) fn run(
    read: Box<dyn BufRead + Send>,
    queue: SharedQueue<Future<Buffer>>,
    header_promise: Promise<Header>,
) {
    let buffer = match Buffer::new(XML_BUFFER_SIZE, AutoGrow::Yes) {
        Ok(buffer) => buffer,
        Err(e) => {
            header_promise.set(Err(Error::Logic("xml decoder failed to start")));
            queue.push(Future::ready(Err(e)));
            queue.push(Future::ready(Ok(Buffer::invalid())));
            return;
        }
    };
    let mut parser = XmlParser::new(read, buffer, queue, header_promise);
    match parser.parse() {
        Ok(StreamEnd::Eof) => {
            let _ = parser.flush_buffer();
            parser.fulfill_header();
            parser.push_end_of_stream();
        }
        Ok(StreamEnd::Cancelled) => {
            trace!("xml decode cancelled");
        }
        Err(e) => {
            parser.fulfill_header();
            parser.queue.push(Future::ready(Err(e)));
            parser.push_end_of_stream();
        }
    }
}

struct XmlParser {
    reader: quick_xml::Reader<Box<dyn BufRead + Send>>,
    queue: SharedQueue<Future<Buffer>>,
    header_promise: Option<Promise<Header>>,
    header: Header,
    buffer: Buffer,
    entities: usize,
    op: ChangeOp,
    current: Option<Pending>,
    comment: Option<PendingComment>,
    in_text: bool,
    cancelled: bool,
}

impl XmlParser {
    fn new(
        read: Box<dyn BufRead + Send>,
        buffer: Buffer,
        queue: SharedQueue<Future<Buffer>>,
        header_promise: Promise<Header>,
    ) -> XmlParser {
        let mut reader = quick_xml::Reader::from_reader(read);
        reader.trim_text(true);
        XmlParser {
            reader,
            queue,
            header_promise: Some(header_promise),
            header: Header::default(),
            buffer,
            entities: 0,
            op: ChangeOp::None,
            current: None,
            comment: None,
            in_text: false,
            cancelled: false,
        }
    }

    fn parse(&mut self) -> Result<StreamEnd> {
        let mut buf = Vec::new();
        loop {
            let event = self
                .reader
                .read_event_into(&mut buf)
                .map_err(|e| Error::Format(format!("malformed XML: {e}")))?;
            match event {
                Event::Start(e) => self.handle_element(&e, false)?,
                Event::Empty(e) => self.handle_element(&e, true)?,
                Event::End(e) => self.handle_end(e.name().as_ref())?,
                Event::Text(t) => {
                    if self.in_text {
                        let text = t
                            .unescape()
                            .map_err(|e| Error::Format(format!("malformed XML text: {e}")))?;
                        if let Some(comment) = &mut self.comment {
                            comment.text.push_str(&text);
                        }
                    }
                }
                Event::CData(t) => {
                    if self.in_text {
                        if let Some(comment) = &mut self.comment {
                            comment.text.push_str(&String::from_utf8_lossy(&t));
                        }
                    }
                }
                Event::Eof => return Ok(StreamEnd::Eof),
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            }
            if self.cancelled {
                return Ok(StreamEnd::Cancelled);
            }
            buf.clear();
        }
    }

    fn handle_element(&mut self, e: &BytesStart<'_>, is_empty: bool) -> Result<()> {
        match e.name().as_ref() {
            b"osm" | b"osmChange" => {
                for attr in attributes(e) {
                    let (key, value) = attr?;
                    match key.as_slice() {
                        b"generator" => {
                            self.header.set("generator", &value);
                        }
                        b"upload" => {
                            self.header.set("xml_josm_upload", &value);
                        }
                        _ => {}
                    }
                }
            }
            b"bounds" => self.handle_bounds(e)?,
            b"create" => self.op = ChangeOp::Create,
            b"modify" => self.op = ChangeOp::Modify,
            b"delete" => self.op = ChangeOp::Delete,
            b"node" => self.start_object(e, ItemType::Node, is_empty)?,
            b"way" => self.start_object(e, ItemType::Way, is_empty)?,
            b"relation" => self.start_object(e, ItemType::Relation, is_empty)?,
            b"changeset" => self.start_object(e, ItemType::Changeset, is_empty)?,
            b"tag" => self.handle_tag(e)?,
            b"nd" => self.handle_nd(e)?,
            b"member" => self.handle_member(e)?,
            b"discussion" => {}
            b"comment" => self.handle_comment(e)?,
            b"text" => self.in_text = !is_empty,
            name => {
                return Err(Error::Format(format!(
                    "unexpected XML element '{}'",
                    String::from_utf8_lossy(name)
                )))
            }
        }
        Ok(())
    }

    fn handle_end(&mut self, name: &[u8]) -> Result<()> {
        match name {
            b"node" | b"way" | b"relation" | b"changeset" => self.flush_object()?,
            b"create" | b"modify" | b"delete" => self.op = ChangeOp::None,
            b"comment" => {
                if let (Some(comment), Some(current)) = (self.comment.take(), &mut self.current) {
                    current.comments.push(comment);
                }
            }
            b"text" => self.in_text = false,
            _ => {}
        }
        Ok(())
    }

    fn handle_bounds(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let mut min_lat = 0.0;
        let mut min_lon = 0.0;
        let mut max_lat = 0.0;
        let mut max_lon = 0.0;
        for attr in attributes(e) {
            let (key, value) = attr?;
            match key.as_slice() {
                b"minlat" => min_lat = parse_number(&value)?,
                b"minlon" => min_lon = parse_number(&value)?,
                b"maxlat" => max_lat = parse_number(&value)?,
                b"maxlon" => max_lon = parse_number(&value)?,
                _ => {}
            }
        }
        self.header.set_bounds(Bounds::new(
            Location::from_degrees(min_lat, min_lon),
            Location::from_degrees(max_lat, max_lon),
        ));
        Ok(())
    }

    fn start_object(&mut self, e: &BytesStart<'_>, kind: ItemType, is_empty: bool) -> Result<()> {
        let mut pending = Pending::new(kind);
        let mut lat: Option<f64> = None;
        let mut lon: Option<f64> = None;
        for attr in attributes(e) {
            let (key, value) = attr?;
            match key.as_slice() {
                b"id" => pending.id = parse_number(&value)?,
                b"version" => pending.version = parse_number(&value)?,
                b"changeset" => pending.changeset = parse_number(&value)?,
                b"uid" => pending.uid = parse_number(&value)?,
                b"user" => pending.user = value,
                b"timestamp" | b"created_at" => {
                    pending.timestamp = parse_iso_timestamp(&value)?;
                }
                b"visible" => pending.visible = value != "false",
                b"lat" => lat = Some(parse_number(&value)?),
                b"lon" => lon = Some(parse_number(&value)?),
                // changeset bookkeeping attributes we do not store
                b"closed_at" | b"open" | b"num_changes" | b"comments_count" | b"min_lat"
                | b"min_lon" | b"max_lat" | b"max_lon" => {}
                _ => {}
            }
        }
        if let (Some(lat), Some(lon)) = (lat, lon) {
            pending.location = Location::from_degrees(lat, lon);
        }
        // everything inside an osmChange delete block is gone, whatever the
        // source attribute claims
        if self.op == ChangeOp::Delete {
            pending.visible = false;
        }
        self.current = Some(pending);
        if is_empty {
            self.flush_object()?;
        }
        Ok(())
    }

    fn handle_tag(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let mut key = String::new();
        let mut value = String::new();
        for attr in attributes(e) {
            let (name, attr_value) = attr?;
            match name.as_slice() {
                b"k" => key = attr_value,
                b"v" => value = attr_value,
                _ => {}
            }
        }
        if let Some(current) = &mut self.current {
            current.tags.push((key, value));
        }
        Ok(())
    }

    fn handle_nd(&mut self, e: &BytesStart<'_>) -> Result<()> {
        for attr in attributes(e) {
            let (name, value) = attr?;
            if name.as_slice() == b"ref" {
                if let Some(current) = &mut self.current {
                    current.refs.push(parse_number(&value)?);
                }
            }
        }
        Ok(())
    }

    fn handle_member(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let mut kind = None;
        let mut member_ref = 0i64;
        let mut role = String::new();
        for attr in attributes(e) {
            let (name, value) = attr?;
            match name.as_slice() {
                b"type" => {
                    kind = Some(match value.as_str() {
                        "node" => ItemType::Node,
                        "way" => ItemType::Way,
                        "relation" => ItemType::Relation,
                        other => {
                            return Err(Error::Format(format!(
                                "unknown member type '{other}'"
                            )))
                        }
                    })
                }
                b"ref" => member_ref = parse_number(&value)?,
                b"role" => role = value,
                _ => {}
            }
        }
        let kind = kind.ok_or_else(|| Error::format("member without type"))?;
        if let Some(current) = &mut self.current {
            current.members.push((kind, member_ref, role));
        }
        Ok(())
    }

    fn handle_comment(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let mut comment = PendingComment::default();
        for attr in attributes(e) {
            let (name, value) = attr?;
            match name.as_slice() {
                b"uid" => comment.uid = parse_number(&value)?,
                b"date" => comment.timestamp = parse_iso_timestamp(&value)?,
                b"user" => comment.user = value,
                _ => {}
            }
        }
        self.comment = Some(comment);
        Ok(())
    }

    /// Builds the accumulated object into the write buffer.
    fn flush_object(&mut self) -> Result<()> {
        let Some(pending) = self.current.take() else {
            return Ok(());
        };

        macro_rules! set_common {
            ($builder:expr, $pending:expr) => {{
                $builder
                    .set_id($pending.id)
                    .set_version($pending.version)
                    .set_changeset($pending.changeset)
                    .set_uid($pending.uid)
                    .set_timestamp($pending.timestamp)
                    .set_visible($pending.visible);
                if !$pending.user.is_empty() {
                    $builder.set_user(&$pending.user)?;
                }
                if !$pending.tags.is_empty() {
                    let mut tags = $builder.tags()?;
                    for (key, value) in &$pending.tags {
                        tags.add_tag(key, value)?;
                    }
                    tags.finish()?;
                }
            }};
        }

        match pending.kind {
            ItemType::Node => {
                let mut builder = NodeBuilder::new(&mut self.buffer)?;
                builder.set_location(pending.location);
                set_common!(builder, pending);
                builder.finish()?;
            }
            ItemType::Way => {
                let mut builder = WayBuilder::new(&mut self.buffer)?;
                set_common!(builder, pending);
                if !pending.refs.is_empty() {
                    let mut refs = builder.node_refs()?;
                    for &node_ref in &pending.refs {
                        refs.add_ref(node_ref)?;
                    }
                    refs.finish()?;
                }
                builder.finish()?;
            }
            ItemType::Relation => {
                let mut builder = RelationBuilder::new(&mut self.buffer)?;
                set_common!(builder, pending);
                if !pending.members.is_empty() {
                    let mut members = builder.members()?;
                    for (kind, member_ref, role) in &pending.members {
                        members.add_member(*kind, *member_ref, role)?;
                    }
                    members.finish()?;
                }
                builder.finish()?;
            }
            ItemType::Changeset => {
                let mut builder = ChangesetBuilder::new(&mut self.buffer)?;
                set_common!(builder, pending);
                if !pending.comments.is_empty() {
                    let mut discussion = builder.discussion()?;
                    for comment in &pending.comments {
                        discussion.add_comment(
                            comment.timestamp,
                            comment.uid,
                            &comment.user,
                            &comment.text,
                        )?;
                    }
                    discussion.finish()?;
                }
                builder.finish()?;
            }
            _ => return Err(Error::Logic("pending object with non-object type")),
        }
        self.buffer.commit()?;
        self.entities += 1;
        self.fulfill_header();

        if self.entities >= MAX_ENTITIES_PER_BLOCK || self.buffer.committed() >= XML_BUFFER_FILL {
            self.flush_buffer()?;
        }
        Ok(())
    }

    /// Enqueues the filled buffer as a ready future and starts a fresh one.
    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.committed() == 0 {
            return Ok(());
        }
        let fresh = Buffer::new(XML_BUFFER_SIZE, AutoGrow::Yes)?;
        let full = std::mem::replace(&mut self.buffer, fresh);
        self.entities = 0;
        if !self.queue.push(Future::ready(Ok(full))) {
            self.cancelled = true;
        }
        Ok(())
    }

    fn fulfill_header(&mut self) {
        if let Some(promise) = self.header_promise.take() {
            promise.set(Ok(self.header.clone()));
        }
    }

    fn push_end_of_stream(&mut self) {
        self.queue.push(Future::ready(Ok(Buffer::invalid())));
    }
}

/// Iterates an element's attributes as (name, unescaped value) pairs.
fn attributes<'a>(
    e: &'a BytesStart<'a>,
) -> impl Iterator<Item = Result<(Vec<u8>, String)>> + 'a {
    e.attributes().map(|attr| {
        let attr = attr.map_err(|e| Error::Format(format!("malformed XML attribute: {e}")))?;
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Format(format!("malformed XML attribute value: {e}")))?;
        Ok((attr.key.as_ref().to_vec(), value.into_owned()))
    })
}

fn parse_number<T: FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Format(format!("invalid number '{value}'")))
}
