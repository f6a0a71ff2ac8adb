//! PBF encoder: primitive block accumulation, DenseNodes delta encoding
//! and blob framing.
//!
//! Objects stream into a block accumulator with a per-block string table.
//! A block is flushed when it approaches the blob size limit, hits the
//! entity cap, or the next object belongs to a different group kind.
//! Flushing hands a serialize task to the pool; the resulting framed bytes
//! travel through the output queue in submission order.

use byteorder::{ByteOrder, NetworkEndian};
use flate2::write::ZlibEncoder;
use prost::Message;
use std::io::Write as _;
use std::mem;

use crate::buffer::Buffer;
use crate::delta::DeltaEncode;
use crate::error::{Error, Result};
use crate::handler::{apply, Handler};
use crate::io::file::File;
use crate::io::{Header, OutputFormat, MAX_ENTITIES_PER_BLOCK, MAX_UNCOMPRESSED_BLOB_SIZE};
use crate::item::ItemType;
use crate::osm::{Changeset, Node, OsmObject, Relation, Way};
use crate::osmpbf;
use crate::pool::{Future, Pool};
use crate::queue::SharedQueue;
use crate::strings::StringTable;

/// Blocks are filled to about 95% and then written out, leaving room for
/// the string table.
const MAX_USED_BLOB_SIZE: usize = MAX_UNCOMPRESSED_BLOB_SIZE / 100 * 95;

#[derive(Debug, Clone, Copy)]
struct PbfOptions {
    dense_nodes: bool,
    compress: bool,
    add_metadata: bool,
    multi_version: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    Empty,
    Dense,
    Nodes,
    Ways,
    Relations,
    Changesets,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlobType {
    Header,
    Data,
}

/// Serializes a protobuf message into a framed record: 4-byte big-endian
/// length, BlobHeader, Blob with optionally zlib-compressed content.
fn serialize_blob(msg: Vec<u8>, blob_type: BlobType, compress: bool) -> Result<Vec<u8>> {
    if msg.len() > MAX_UNCOMPRESSED_BLOB_SIZE {
        return Err(Error::format("primitive block exceeds maximum blob size"));
    }

    let blob = if compress {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&msg)?;
        osmpbf::Blob {
            raw: None,
            raw_size: Some(msg.len() as i32),
            zlib_data: Some(encoder.finish()?),
            lzma_data: None,
        }
    } else {
        osmpbf::Blob {
            raw: Some(msg),
            raw_size: None,
            zlib_data: None,
            lzma_data: None,
        }
    };
    let blob_data = blob.encode_to_vec();

    let blob_header = osmpbf::BlobHeader {
        r#type: match blob_type {
            BlobType::Header => "OSMHeader".to_string(),
            BlobType::Data => "OSMData".to_string(),
        },
        indexdata: None,
        datasize: blob_data.len() as i32,
    };
    let blob_header_data = blob_header.encode_to_vec();

    let mut out = Vec::with_capacity(4 + blob_header_data.len() + blob_data.len());
    let mut len = [0u8; 4];
    NetworkEndian::write_u32(&mut len, blob_header_data.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(&blob_header_data);
    out.extend_from_slice(&blob_data);
    Ok(out)
}

/// Parallel arrays of one DenseNodes group, fields delta encoded as they
/// arrive.
#[derive(Debug, Default)]
struct DenseNodesAccum {
    ids: Vec<i64>,
    versions: Vec<i32>,
    timestamps: Vec<i64>,
    changesets: Vec<i64>,
    uids: Vec<i32>,
    user_sids: Vec<i32>,
    visibles: Vec<bool>,
    lats: Vec<i64>,
    lons: Vec<i64>,
    keys_vals: Vec<i32>,

    delta_id: DeltaEncode,
    delta_timestamp: DeltaEncode,
    delta_changeset: DeltaEncode,
    delta_uid: DeltaEncode,
    delta_user_sid: DeltaEncode,
    delta_lat: DeltaEncode,
    delta_lon: DeltaEncode,
}

impl DenseNodesAccum {
    fn add_node(&mut self, node: &Node<'_>, strings: &mut StringTable, options: &PbfOptions) {
        self.ids.push(self.delta_id.update(node.id()));

        if options.add_metadata {
            self.versions.push(node.version() as i32);
            self.timestamps
                .push(self.delta_timestamp.update(node.timestamp()));
            self.changesets
                .push(self.delta_changeset.update(i64::from(node.changeset())));
            self.uids
                .push(self.delta_uid.update(i64::from(node.uid())) as i32);
            let user_sid = strings.add(node.user().as_bytes());
            self.user_sids
                .push(self.delta_user_sid.update(i64::from(user_sid)) as i32);
            if options.multi_version {
                self.visibles.push(node.visible());
            }
        }

        let location = node.location();
        self.lats
            .push(self.delta_lat.update(i64::from(location.lat_e7())));
        self.lons
            .push(self.delta_lon.update(i64::from(location.lon_e7())));

        for (key, value) in node.tags() {
            self.keys_vals.push(strings.add(key.as_bytes()) as i32);
            self.keys_vals.push(strings.add(value.as_bytes()) as i32);
        }
        self.keys_vals.push(0);
    }

    fn size(&self) -> usize {
        self.ids.len() * 3 * 8 + self.keys_vals.len() * 4
    }

    fn serialize(&mut self, options: &PbfOptions) -> osmpbf::DenseNodes {
        let denseinfo = if options.add_metadata {
            Some(osmpbf::DenseInfo {
                version: mem::take(&mut self.versions),
                timestamp: mem::take(&mut self.timestamps),
                changeset: mem::take(&mut self.changesets),
                uid: mem::take(&mut self.uids),
                user_sid: mem::take(&mut self.user_sids),
                visible: mem::take(&mut self.visibles),
            })
        } else {
            None
        };
        let dense = osmpbf::DenseNodes {
            id: mem::take(&mut self.ids),
            denseinfo,
            lat: mem::take(&mut self.lats),
            lon: mem::take(&mut self.lons),
            keys_vals: mem::take(&mut self.keys_vals),
        };
        *self = DenseNodesAccum::default();
        dense
    }
}

/// One primitive block being accumulated.
struct PrimitiveBlockAccum {
    strings: StringTable,
    dense: DenseNodesAccum,
    nodes: Vec<osmpbf::Node>,
    ways: Vec<osmpbf::Way>,
    relations: Vec<osmpbf::Relation>,
    changesets: Vec<osmpbf::ChangeSet>,
    kind: GroupKind,
    count: usize,
    group_size: usize,
}

impl PrimitiveBlockAccum {
    fn new() -> PrimitiveBlockAccum {
        PrimitiveBlockAccum {
            strings: StringTable::new(),
            dense: DenseNodesAccum::default(),
            nodes: Vec::new(),
            ways: Vec::new(),
            relations: Vec::new(),
            changesets: Vec::new(),
            kind: GroupKind::Empty,
            count: 0,
            group_size: 0,
        }
    }

    fn size(&self) -> usize {
        self.group_size + self.strings.size_in_bytes() + self.dense.size()
    }

    fn can_add(&self, kind: GroupKind) -> bool {
        (self.kind == kind || self.kind == GroupKind::Empty)
            && self.count < MAX_ENTITIES_PER_BLOCK
            && self.size() < MAX_USED_BLOB_SIZE
    }

    fn serialize(&mut self, options: &PbfOptions) -> Vec<u8> {
        let mut group = osmpbf::PrimitiveGroup::default();
        match self.kind {
            GroupKind::Empty => {}
            GroupKind::Dense => group.dense = Some(self.dense.serialize(options)),
            GroupKind::Nodes => group.nodes = mem::take(&mut self.nodes),
            GroupKind::Ways => group.ways = mem::take(&mut self.ways),
            GroupKind::Relations => group.relations = mem::take(&mut self.relations),
            GroupKind::Changesets => group.changesets = mem::take(&mut self.changesets),
        }
        let block = osmpbf::PrimitiveBlock {
            stringtable: osmpbf::StringTable {
                s: self.strings.take(),
            },
            primitivegroup: vec![group],
            granularity: None,
            lat_offset: None,
            lon_offset: None,
            date_granularity: None,
        };
        self.kind = GroupKind::Empty;
        self.count = 0;
        self.group_size = 0;
        block.encode_to_vec()
    }
}

pub(crate) struct PbfOutput {
    queue: SharedQueue<Future<Vec<u8>>>,
    options: PbfOptions,
    block: PrimitiveBlockAccum,
}

impl PbfOutput {
    pub fn new(file: &File, queue: SharedQueue<Future<Vec<u8>>>) -> PbfOutput {
        let compression = file.get("pbf_compression");
        PbfOutput {
            queue,
            options: PbfOptions {
                dense_nodes: file.is_not_false("pbf_dense_nodes"),
                compress: compression != Some("none") && compression != Some("false"),
                add_metadata: file.is_not_false("pbf_add_metadata")
                    && file.is_not_false("add_metadata"),
                multi_version: file.has_multiple_object_versions(),
            },
            block: PrimitiveBlockAccum::new(),
        }
    }

    fn push(&self, future: Future<Vec<u8>>) -> Result<()> {
        if self.queue.push(future) {
            Ok(())
        } else {
            Err(Error::Logic("output queue closed"))
        }
    }

    fn store_block(&mut self) -> Result<()> {
        if self.block.count == 0 {
            return Ok(());
        }
        let msg = self.block.serialize(&self.options);
        let compress = self.options.compress;
        let future = Pool::global().submit(move || serialize_blob(msg, BlobType::Data, compress));
        self.push(future)
    }

    fn switch_group(&mut self, kind: GroupKind) -> Result<()> {
        if !self.block.can_add(kind) {
            self.store_block()?;
        }
        self.block.kind = kind;
        Ok(())
    }

    fn make_info<O: OsmObject>(&mut self, object: &O) -> Option<osmpbf::Info> {
        if !self.options.add_metadata {
            return None;
        }
        Some(osmpbf::Info {
            version: Some(object.version() as i32),
            timestamp: Some(object.timestamp()),
            changeset: Some(i64::from(object.changeset())),
            uid: Some(object.uid()),
            user_sid: Some(self.block.strings.add(object.user().as_bytes())),
            visible: self.options.multi_version.then(|| object.visible()),
        })
    }

    fn add_tags<O: OsmObject>(&mut self, object: &O) -> (Vec<u32>, Vec<u32>) {
        let mut keys = Vec::new();
        let mut vals = Vec::new();
        for (key, value) in object.tags() {
            keys.push(self.block.strings.add(key.as_bytes()));
            vals.push(self.block.strings.add(value.as_bytes()));
        }
        (keys, vals)
    }
}

impl OutputFormat for PbfOutput {
    fn write_header(&mut self, header: &Header) -> Result<()> {
        let mut block = osmpbf::HeaderBlock::default();

        if let Some(bounds) = header.bounds() {
            // header bbox is in nanodegrees
            block.bbox = Some(osmpbf::HeaderBBox {
                left: i64::from(bounds.bottom_left().lon_e7()) * 100,
                right: i64::from(bounds.top_right().lon_e7()) * 100,
                top: i64::from(bounds.top_right().lat_e7()) * 100,
                bottom: i64::from(bounds.bottom_left().lat_e7()) * 100,
            });
        }

        block.required_features.push("OsmSchema-V0.6".to_string());
        if self.options.dense_nodes {
            block.required_features.push("DenseNodes".to_string());
        }
        if self.options.multi_version {
            block
                .required_features
                .push("HistoricalInformation".to_string());
        }

        block.writingprogram = Some(header.get("generator").unwrap_or("osmbuf").to_string());
        if let Some(source) = header.get("source") {
            block.source = Some(source.to_string());
        }
        if let Some(timestamp) = header.get("osmosis_replication_timestamp") {
            block.osmosis_replication_timestamp = crate::io::parse_iso_timestamp(timestamp).ok();
        }
        if let Some(number) = header.get("osmosis_replication_sequence_number") {
            block.osmosis_replication_sequence_number = number.parse().ok();
        }
        if let Some(url) = header.get("osmosis_replication_base_url") {
            block.osmosis_replication_base_url = Some(url.to_string());
        }

        let msg = block.encode_to_vec();
        let compress = self.options.compress;
        let future = Pool::global().submit(move || serialize_blob(msg, BlobType::Header, compress));
        self.push(future)
    }

    fn write_buffer(&mut self, buffer: Buffer) -> Result<()> {
        apply(&buffer, self)
    }

    fn close(&mut self) -> Result<()> {
        self.store_block()?;
        self.push(Future::ready(Ok(Vec::new())))
    }
}

impl Handler for PbfOutput {
    fn node(&mut self, node: &Node<'_>) -> Result<()> {
        if self.options.dense_nodes {
            self.switch_group(GroupKind::Dense)?;
            let options = self.options;
            self.block
                .dense
                .add_node(node, &mut self.block.strings, &options);
            self.block.count += 1;
            return Ok(());
        }

        self.switch_group(GroupKind::Nodes)?;
        let (keys, vals) = self.add_tags(node);
        let location = node.location();
        let message = osmpbf::Node {
            id: node.id(),
            keys,
            vals,
            info: self.make_info(node),
            lat: i64::from(location.lat_e7()),
            lon: i64::from(location.lon_e7()),
        };
        self.block.group_size += message.encoded_len() + 4;
        self.block.nodes.push(message);
        self.block.count += 1;
        Ok(())
    }

    fn way(&mut self, way: &Way<'_>) -> Result<()> {
        self.switch_group(GroupKind::Ways)?;
        let (keys, vals) = self.add_tags(way);
        let mut delta = DeltaEncode::default();
        let message = osmpbf::Way {
            id: way.id(),
            keys,
            vals,
            info: self.make_info(way),
            refs: way.node_refs().map(|r| delta.update(r)).collect(),
        };
        self.block.group_size += message.encoded_len() + 4;
        self.block.ways.push(message);
        self.block.count += 1;
        Ok(())
    }

    fn relation(&mut self, relation: &Relation<'_>) -> Result<()> {
        self.switch_group(GroupKind::Relations)?;
        let (keys, vals) = self.add_tags(relation);

        let mut roles_sid = Vec::new();
        let mut memids = Vec::new();
        let mut types = Vec::new();
        let mut delta = DeltaEncode::default();
        for member in relation.members() {
            roles_sid.push(self.block.strings.add(member.role().as_bytes()) as i32);
            memids.push(delta.update(member.member_ref()));
            types.push(match member.member_type() {
                ItemType::Way => osmpbf::relation::MemberType::Way,
                ItemType::Relation => osmpbf::relation::MemberType::Relation,
                _ => osmpbf::relation::MemberType::Node,
            } as i32);
        }

        let message = osmpbf::Relation {
            id: relation.id(),
            keys,
            vals,
            info: self.make_info(relation),
            roles_sid,
            memids,
            types,
        };
        self.block.group_size += message.encoded_len() + 4;
        self.block.relations.push(message);
        self.block.count += 1;
        Ok(())
    }

    fn changeset(&mut self, changeset: &Changeset<'_>) -> Result<()> {
        self.switch_group(GroupKind::Changesets)?;
        let message = osmpbf::ChangeSet {
            id: changeset.id(),
        };
        self.block.group_size += message.encoded_len() + 4;
        self.block.changesets.push(message);
        self.block.count += 1;
        Ok(())
    }
}
