//! PBF decoder: blob framing on the reader thread, block decoding on the
//! worker pool.
//!
//! The framing thread reads one record at a time: a 4-byte big-endian
//! length, a BlobHeader, then the Blob bytes. The OSMHeader blob is decoded
//! synchronously so the driver can resolve its header promise before any
//! data arrives; each OSMData blob becomes a pool task whose future is
//! pushed in file order, which is what keeps the output ordered even though
//! workers finish out of order.

use std::io::{BufRead, Read};

use byteorder::{ByteOrder, NetworkEndian};
use flate2::read::ZlibDecoder;
use log::warn;
use prost::Message;

use crate::buffer::{AutoGrow, Buffer};
use crate::builder::{ChangesetBuilder, NodeBuilder, RelationBuilder, WayBuilder};
use crate::delta::DeltaDecode;
use crate::error::{Error, Result};
use crate::io::{Bounds, Header, MAX_BLOB_HEADER_SIZE, MAX_UNCOMPRESSED_BLOB_SIZE};
use crate::item::{ItemType, ALIGN};
use crate::osm::Location;
use crate::osmpbf;
use crate::pool::{Future, Pool, Promise};
use crate::queue::SharedQueue;

/// Features this reader implements; anything else in `required_features`
/// makes the file unreadable.
const SUPPORTED_FEATURES: [&str; 3] = ["OsmSchema-V0.6", "DenseNodes", "HistoricalInformation"];

pub(crate) fn run(
    read: Box<dyn BufRead + Send>,
    queue: SharedQueue<Future<Buffer>>,
    header_promise: Promise<Header>,
) {
    let mut framing = Framing {
        read,
        queue,
        header_promise: Some(header_promise),
    };
    match framing.run_loop() {
        Ok(true) => {
            // clean end of stream
            if let Some(promise) = framing.header_promise.take() {
                promise.set(Err(Error::format("pbf file contains no header blob")));
            }
            framing.queue.push(Future::ready(Ok(Buffer::invalid())));
        }
        Ok(false) => {} // cancelled by close()
        Err(e) => {
            if let Some(promise) = framing.header_promise.take() {
                promise.set(Err(Error::Format(format!("pbf stream failed: {e}"))));
            }
            framing.queue.push(Future::ready(Err(e)));
            framing.queue.push(Future::ready(Ok(Buffer::invalid())));
        }
    }
}

struct Framing {
    read: Box<dyn BufRead + Send>,
    queue: SharedQueue<Future<Buffer>>,
    header_promise: Option<Promise<Header>>,
}

impl Framing {
    /// Returns Ok(true) at end of file, Ok(false) when cancelled.
    fn run_loop(&mut self) -> Result<bool> {
        loop {
            let blob_header_len = match self.read_length()? {
                Some(len) => len,
                None => return Ok(true),
            };
            if blob_header_len > MAX_BLOB_HEADER_SIZE {
                return Err(Error::format("BlobHeader exceeds maximum size"));
            }

            let mut blob_header_data = vec![0u8; blob_header_len];
            self.read.read_exact(&mut blob_header_data)?;
            let blob_header = osmpbf::BlobHeader::decode(blob_header_data.as_slice())
                .map_err(|e| Error::Format(format!("malformed BlobHeader: {e}")))?;

            let datasize = blob_header.datasize;
            // the Blob message wraps up to 32 MiB of content in a few bytes
            // of framing, so allow a little slack over the content limit
            if datasize < 0 || datasize as usize > MAX_UNCOMPRESSED_BLOB_SIZE + MAX_BLOB_HEADER_SIZE
            {
                return Err(Error::format("blob exceeds maximum size"));
            }
            let mut blob_data = vec![0u8; datasize as usize];
            self.read.read_exact(&mut blob_data)?;

            match blob_header.r#type.as_str() {
                "OSMHeader" => {
                    let raw = decode_blob(&blob_data)?;
                    let header = decode_header_block(&raw)?;
                    if let Some(promise) = self.header_promise.take() {
                        promise.set(Ok(header));
                    }
                }
                "OSMData" => {
                    if let Some(promise) = self.header_promise.take() {
                        warn!("pbf data blob before header blob");
                        promise.set(Ok(Header::default()));
                    }
                    let future = Pool::global().submit(move || {
                        let raw = decode_blob(&blob_data)?;
                        decode_primitive_block(&raw)
                    });
                    if !self.queue.push(future) {
                        return Ok(false);
                    }
                }
                other => {
                    return Err(Error::Format(format!("unknown blob type '{other}'")));
                }
            }
        }
    }

    /// Reads the 4-byte record length; `None` on clean end of file.
    fn read_length(&mut self) -> Result<Option<usize>> {
        let mut len = [0u8; 4];
        let n = self.read.read(&mut len)?;
        if n == 0 {
            return Ok(None);
        }
        if n < len.len() {
            self.read.read_exact(&mut len[n..])?;
        }
        Ok(Some(NetworkEndian::read_u32(&len) as usize))
    }
}

/// Extracts the uncompressed content of a blob.
fn decode_blob(data: &[u8]) -> Result<Vec<u8>> {
    let blob = osmpbf::Blob::decode(data)
        .map_err(|e| Error::Format(format!("malformed blob: {e}")))?;

    if let Some(raw) = blob.raw {
        if raw.len() > MAX_UNCOMPRESSED_BLOB_SIZE {
            return Err(Error::format("blob exceeds maximum uncompressed size"));
        }
        return Ok(raw);
    }
    if let Some(zlib_data) = blob.zlib_data {
        let raw_size = blob
            .raw_size
            .ok_or_else(|| Error::format("compressed blob without raw_size"))?;
        if raw_size < 0 || raw_size as usize > MAX_UNCOMPRESSED_BLOB_SIZE {
            return Err(Error::format("blob exceeds maximum uncompressed size"));
        }
        let raw_size = raw_size as usize;
        let mut raw = Vec::with_capacity(raw_size);
        ZlibDecoder::new(zlib_data.as_slice())
            .take(raw_size as u64 + 1)
            .read_to_end(&mut raw)?;
        if raw.len() != raw_size {
            return Err(Error::format("blob content does not match raw_size"));
        }
        return Ok(raw);
    }
    if blob.lzma_data.is_some() {
        return Err(Error::format("lzma-compressed blobs are not supported"));
    }
    Err(Error::format("blob carries no data"))
}

fn decode_header_block(data: &[u8]) -> Result<Header> {
    let block = osmpbf::HeaderBlock::decode(data)
        .map_err(|e| Error::Format(format!("malformed header block: {e}")))?;

    for feature in &block.required_features {
        if !SUPPORTED_FEATURES.contains(&feature.as_str()) {
            return Err(Error::Format(format!(
                "required feature not supported: '{feature}'"
            )));
        }
    }

    let mut header = Header::default();
    if block
        .required_features
        .iter()
        .any(|f| f == "HistoricalInformation")
    {
        header.set_has_multiple_object_versions(true);
    }
    if let Some(bbox) = block.bbox {
        // bbox is in nanodegrees
        header.set_bounds(Bounds::new(
            Location::new((bbox.bottom / 100) as i32, (bbox.left / 100) as i32),
            Location::new((bbox.top / 100) as i32, (bbox.right / 100) as i32),
        ));
    }
    if let Some(program) = block.writingprogram {
        header.set("generator", &program);
    }
    if let Some(source) = block.source {
        header.set("source", &source);
    }
    if let Some(timestamp) = block.osmosis_replication_timestamp {
        header.set(
            "osmosis_replication_timestamp",
            &crate::io::timestamp_to_iso(timestamp),
        );
    }
    if let Some(number) = block.osmosis_replication_sequence_number {
        header.set("osmosis_replication_sequence_number", &number.to_string());
    }
    if let Some(url) = block.osmosis_replication_base_url {
        header.set("osmosis_replication_base_url", &url);
    }
    Ok(header)
}

/// Per-block scaling parameters with their wire-format defaults.
struct BlockParams {
    granularity: i64,
    lat_offset: i64,
    lon_offset: i64,
    date_granularity: i64,
}

impl BlockParams {
    fn from(block: &osmpbf::PrimitiveBlock) -> BlockParams {
        BlockParams {
            granularity: i64::from(block.granularity.unwrap_or(100)),
            lat_offset: block.lat_offset.unwrap_or(0),
            lon_offset: block.lon_offset.unwrap_or(0),
            date_granularity: i64::from(block.date_granularity.unwrap_or(1000)),
        }
    }

    /// Converts a raw coordinate to 1e-7 degree units (100 nanodegrees).
    fn location(&self, lat: i64, lon: i64) -> Location {
        Location::new(
            ((self.lat_offset + self.granularity * lat) / 100) as i32,
            ((self.lon_offset + self.granularity * lon) / 100) as i32,
        )
    }

    /// Converts a raw timestamp to UNIX seconds.
    fn timestamp(&self, raw: i64) -> i64 {
        raw * self.date_granularity / 1000
    }
}

struct BlockStrings<'a> {
    strings: &'a [Vec<u8>],
}

impl<'a> BlockStrings<'a> {
    fn get(&self, idx: u32) -> Result<&'a str> {
        let bytes = self
            .strings
            .get(idx as usize)
            .ok_or_else(|| Error::format("string table index out of range"))?;
        std::str::from_utf8(bytes)
            .map_err(|_| Error::format("string table entry is not valid UTF-8"))
    }
}

/// Decodes one primitive block into a fresh buffer.
pub(crate) fn decode_primitive_block(data: &[u8]) -> Result<Buffer> {
    let block = osmpbf::PrimitiveBlock::decode(data)
        .map_err(|e| Error::Format(format!("malformed primitive block: {e}")))?;
    let params = BlockParams::from(&block);
    let strings = BlockStrings {
        strings: &block.stringtable.s,
    };

    let capacity = (data.len() * 2).next_multiple_of(ALIGN).max(4096);
    let mut buffer = Buffer::new(capacity, AutoGrow::Yes)?;

    for group in &block.primitivegroup {
        if let Some(dense) = &group.dense {
            decode_dense_nodes(dense, &params, &strings, &mut buffer)?;
        }
        for node in &group.nodes {
            decode_node(node, &params, &strings, &mut buffer)?;
        }
        for way in &group.ways {
            decode_way(way, &params, &strings, &mut buffer)?;
        }
        for relation in &group.relations {
            decode_relation(relation, &params, &strings, &mut buffer)?;
        }
        for changeset in &group.changesets {
            let mut builder = ChangesetBuilder::new(&mut buffer)?;
            builder.set_id(changeset.id);
            builder.finish()?;
            buffer.commit()?;
        }
    }
    Ok(buffer)
}

macro_rules! apply_info {
    ($builder:expr, $info:expr, $params:expr, $strings:expr) => {{
        if let Some(info) = $info {
            $builder
                .set_version(info.version.unwrap_or(0).max(0) as u32)
                .set_timestamp($params.timestamp(info.timestamp.unwrap_or(0)))
                .set_changeset(info.changeset.unwrap_or(0) as i32)
                .set_uid(info.uid.unwrap_or(0))
                .set_visible(info.visible.unwrap_or(true));
            let user = $strings.get(info.user_sid.unwrap_or(0))?;
            if !user.is_empty() {
                $builder.set_user(user)?;
            }
        }
    }};
}

fn decode_node(
    node: &osmpbf::Node,
    params: &BlockParams,
    strings: &BlockStrings<'_>,
    buffer: &mut Buffer,
) -> Result<()> {
    if node.keys.len() != node.vals.len() {
        return Err(Error::format("node keys and vals lengths differ"));
    }
    let mut builder = NodeBuilder::new(buffer)?;
    builder.set_id(node.id);
    builder.set_location(params.location(node.lat, node.lon));
    apply_info!(builder, &node.info, params, strings);
    if !node.keys.is_empty() {
        let mut tags = builder.tags()?;
        for (&k, &v) in node.keys.iter().zip(&node.vals) {
            tags.add_tag(strings.get(k)?, strings.get(v)?)?;
        }
        tags.finish()?;
    }
    builder.finish()?;
    buffer.commit()?;
    Ok(())
}

fn decode_dense_nodes(
    dense: &osmpbf::DenseNodes,
    params: &BlockParams,
    strings: &BlockStrings<'_>,
    buffer: &mut Buffer,
) -> Result<()> {
    let n = dense.id.len();
    if dense.lat.len() != n || dense.lon.len() != n {
        return Err(Error::format("dense node arrays have differing lengths"));
    }
    if let Some(info) = &dense.denseinfo {
        if info.version.len() != n
            || info.timestamp.len() != n
            || info.changeset.len() != n
            || info.uid.len() != n
            || info.user_sid.len() != n
        {
            return Err(Error::format("dense info arrays have differing lengths"));
        }
    }

    let mut id = DeltaDecode::default();
    let mut lat = DeltaDecode::default();
    let mut lon = DeltaDecode::default();
    let mut timestamp = DeltaDecode::default();
    let mut changeset = DeltaDecode::default();
    let mut uid = DeltaDecode::default();
    let mut user_sid = DeltaDecode::default();

    let mut tags_offset = 0usize;
    for i in 0..n {
        let mut builder = NodeBuilder::new(buffer)?;
        builder.set_id(id.update(dense.id[i]));
        builder.set_location(params.location(lat.update(dense.lat[i]), lon.update(dense.lon[i])));

        if let Some(info) = &dense.denseinfo {
            builder
                .set_version(info.version[i].max(0) as u32)
                .set_timestamp(params.timestamp(timestamp.update(info.timestamp[i])))
                .set_changeset(changeset.update(info.changeset[i]) as i32)
                .set_uid(uid.update(i64::from(info.uid[i])) as i32)
                .set_visible(info.visible.get(i).copied().unwrap_or(true));
            let sid = user_sid.update(i64::from(info.user_sid[i]));
            if sid < 0 || sid > i64::from(u32::MAX) {
                return Err(Error::format("dense info user_sid out of range"));
            }
            let user = strings.get(sid as u32)?;
            if !user.is_empty() {
                builder.set_user(user)?;
            }
        }

        // keys_vals interleaves string ids, 0 terminates each node's tags
        if tags_offset < dense.keys_vals.len() {
            if dense.keys_vals[tags_offset] == 0 {
                tags_offset += 1;
            } else {
                let mut tags = builder.tags()?;
                loop {
                    if tags_offset >= dense.keys_vals.len() {
                        return Err(Error::format("dense keys_vals ends mid-node"));
                    }
                    let k = dense.keys_vals[tags_offset];
                    tags_offset += 1;
                    if k == 0 {
                        break;
                    }
                    if tags_offset >= dense.keys_vals.len() {
                        return Err(Error::format("dense keys_vals ends mid-pair"));
                    }
                    let v = dense.keys_vals[tags_offset];
                    tags_offset += 1;
                    if k < 0 || v < 0 {
                        return Err(Error::format("negative string table index"));
                    }
                    tags.add_tag(strings.get(k as u32)?, strings.get(v as u32)?)?;
                }
                tags.finish()?;
            }
        }

        builder.finish()?;
        buffer.commit()?;
    }
    Ok(())
}

fn decode_way(
    way: &osmpbf::Way,
    params: &BlockParams,
    strings: &BlockStrings<'_>,
    buffer: &mut Buffer,
) -> Result<()> {
    if way.keys.len() != way.vals.len() {
        return Err(Error::format("way keys and vals lengths differ"));
    }
    let mut builder = WayBuilder::new(buffer)?;
    builder.set_id(way.id);
    apply_info!(builder, &way.info, params, strings);
    if !way.keys.is_empty() {
        let mut tags = builder.tags()?;
        for (&k, &v) in way.keys.iter().zip(&way.vals) {
            tags.add_tag(strings.get(k)?, strings.get(v)?)?;
        }
        tags.finish()?;
    }
    if !way.refs.is_empty() {
        let mut delta = DeltaDecode::default();
        let mut refs = builder.node_refs()?;
        for &node_ref in &way.refs {
            refs.add_ref(delta.update(node_ref))?;
        }
        refs.finish()?;
    }
    builder.finish()?;
    buffer.commit()?;
    Ok(())
}

fn decode_relation(
    relation: &osmpbf::Relation,
    params: &BlockParams,
    strings: &BlockStrings<'_>,
    buffer: &mut Buffer,
) -> Result<()> {
    if relation.keys.len() != relation.vals.len() {
        return Err(Error::format("relation keys and vals lengths differ"));
    }
    if relation.roles_sid.len() != relation.memids.len()
        || relation.memids.len() != relation.types.len()
    {
        return Err(Error::format("relation member arrays have differing lengths"));
    }
    let mut builder = RelationBuilder::new(buffer)?;
    builder.set_id(relation.id);
    apply_info!(builder, &relation.info, params, strings);
    if !relation.keys.is_empty() {
        let mut tags = builder.tags()?;
        for (&k, &v) in relation.keys.iter().zip(&relation.vals) {
            tags.add_tag(strings.get(k)?, strings.get(v)?)?;
        }
        tags.finish()?;
    }
    if !relation.memids.is_empty() {
        let mut delta = DeltaDecode::default();
        let mut members = builder.members()?;
        for i in 0..relation.memids.len() {
            let kind = match osmpbf::relation::MemberType::from_i32(relation.types[i]) {
                Some(osmpbf::relation::MemberType::Node) => ItemType::Node,
                Some(osmpbf::relation::MemberType::Way) => ItemType::Way,
                Some(osmpbf::relation::MemberType::Relation) => ItemType::Relation,
                None => return Err(Error::format("unknown relation member type")),
            };
            let role_sid = relation.roles_sid[i];
            if role_sid < 0 {
                return Err(Error::format("negative string table index"));
            }
            members.add_member(
                kind,
                delta.update(relation.memids[i]),
                strings.get(role_sid as u32)?,
            )?;
        }
        members.finish()?;
    }
    builder.finish()?;
    buffer.commit()?;
    Ok(())
}
