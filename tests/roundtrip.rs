//! End-to-end read/write scenarios through temporary files.

use osmbuf::io::{File, Header, Reader, Writer};
use osmbuf::{
    AutoGrow, Buffer, ChangesetBuilder, ItemType, Location, NodeBuilder, ObjectRef, OsmObject,
    RelationBuilder, WayBuilder,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn new_buffer() -> Buffer {
    Buffer::new(1024 * 1024, AutoGrow::Yes).unwrap()
}

fn add_node(buffer: &mut Buffer, id: i64, version: u32, tags: &[(&str, &str)]) {
    let mut node = NodeBuilder::new(buffer).unwrap();
    node.set_id(id)
        .set_version(version)
        .set_location(Location::from_degrees(50.0, 10.0));
    if !tags.is_empty() {
        let mut list = node.tags().unwrap();
        for (k, v) in tags {
            list.add_tag(k, v).unwrap();
        }
        list.finish().unwrap();
    }
    node.finish().unwrap();
    buffer.commit().unwrap();
}

/// Reads every buffer of a file and returns them concatenated.
fn read_all(path: &std::path::Path) -> Vec<Buffer> {
    let mut reader = Reader::open(path).unwrap();
    let mut buffers = Vec::new();
    loop {
        let buffer = reader.read().unwrap();
        if !buffer.is_valid() {
            break;
        }
        buffers.push(buffer);
    }
    reader.close().unwrap();
    buffers
}

fn all_ids(buffers: &[Buffer]) -> Vec<i64> {
    buffers
        .iter()
        .flat_map(|b| b.objects().map(|o| o.id()))
        .collect()
}

#[test]
fn pbf_node_roundtrip_dense_zlib() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.osm.pbf");

    let mut buffer = new_buffer();
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

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    let buffers = read_all(&path);
    let objects: Vec<ObjectRef> = buffers.iter().flat_map(|b| b.objects()).collect();
    assert_eq!(objects.len(), 1);
    let ObjectRef::Node(node) = &objects[0] else {
        panic!("expected node");
    };
    assert_eq!(node.id(), 1);
    assert_eq!(node.version(), 1);
    assert_eq!(node.location().lat_e7(), 500_000_000);
    assert_eq!(node.location().lon_e7(), 100_000_000);
    assert_eq!(node.tags().collect::<Vec<_>>(), vec![("natural", "peak")]);
    assert!(node.visible());
}

#[test]
fn pbf_roundtrip_without_dense_nodes() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.osm.pbf");

    let mut buffer = new_buffer();
    add_node(&mut buffer, 42, 7, &[("amenity", "bench")]);

    let mut file = File::new(&path).unwrap();
    file.set("pbf_dense_nodes", "false");
    let mut writer = Writer::new(file, &Header::default()).unwrap();
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    let buffers = read_all(&path);
    let ObjectRef::Node(node) = buffers[0].objects().next().unwrap() else {
        panic!("expected node");
    };
    assert_eq!(node.id(), 42);
    assert_eq!(node.version(), 7);
    assert_eq!(node.tags().collect::<Vec<_>>(), vec![("amenity", "bench")]);
}

#[test]
fn xml_node_byte_shape() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.osm");

    let mut buffer = new_buffer();
    add_node(&mut buffer, 1, 1, &[("natural", "peak")]);

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains(
        "<node id=\"1\" version=\"1\" lat=\"50.0000000\" lon=\"10.0000000\">\
         <tag k=\"natural\" v=\"peak\"/></node>"
    ));
    assert!(content.starts_with("<?xml version='1.0' encoding='UTF-8'?>\n<osm version=\"0.6\""));
    assert!(content.ends_with("</osm>\n"));
}

#[test]
fn pbf_way_refs_survive_delta_coding() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("way.osm.pbf");

    let mut buffer = new_buffer();
    {
        let mut way = WayBuilder::new(&mut buffer).unwrap();
        way.set_id(100).set_version(1);
        let mut refs = way.node_refs().unwrap();
        for id in [10, 12, 11] {
            refs.add_ref(id).unwrap();
        }
        refs.finish().unwrap();
        way.finish().unwrap();
    }
    buffer.commit().unwrap();

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    let buffers = read_all(&path);
    let ObjectRef::Way(way) = buffers[0].objects().next().unwrap() else {
        panic!("expected way");
    };
    assert_eq!(way.node_refs().collect::<Vec<_>>(), vec![10, 12, 11]);
}

#[test]
fn pbf_relation_members_keep_order_types_roles() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relation.osm.pbf");

    let mut buffer = new_buffer();
    {
        let mut relation = RelationBuilder::new(&mut buffer).unwrap();
        relation.set_id(5).set_version(2);
        let mut members = relation.members().unwrap();
        members.add_member(ItemType::Node, 5, "start").unwrap();
        members.add_member(ItemType::Way, 7, "via").unwrap();
        members.add_member(ItemType::Relation, 9, "end").unwrap();
        members.finish().unwrap();
        relation.finish().unwrap();
    }
    buffer.commit().unwrap();

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    let buffers = read_all(&path);
    let ObjectRef::Relation(relation) = buffers[0].objects().next().unwrap() else {
        panic!("expected relation");
    };
    let members: Vec<_> = relation
        .members()
        .map(|m| (m.member_type(), m.member_ref(), m.role().to_string()))
        .collect();
    assert_eq!(
        members,
        vec![
            (ItemType::Node, 5, "start".to_string()),
            (ItemType::Way, 7, "via".to_string()),
            (ItemType::Relation, 9, "end".to_string()),
        ]
    );
}

#[test]
fn xml_roundtrip_preserves_metadata_and_entities() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.osm");

    let mut buffer = new_buffer();
    {
        let mut node = NodeBuilder::new(&mut buffer).unwrap();
        node.set_id(3)
            .set_version(4)
            .set_changeset(77)
            .set_uid(12)
            .set_timestamp(1_500_000_000)
            .set_location(Location::from_degrees(-3.25, 141.0000001));
        node.set_user("mapper <&>").unwrap();
        let mut tags = node.tags().unwrap();
        tags.add_tag("name", "a&b\"c'd<e>f\ng\rh\ti").unwrap();
        tags.finish().unwrap();
        node.finish().unwrap();
    }
    buffer.commit().unwrap();

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    let buffers = read_all(&path);
    let ObjectRef::Node(node) = buffers[0].objects().next().unwrap() else {
        panic!("expected node");
    };
    assert_eq!(node.id(), 3);
    assert_eq!(node.version(), 4);
    assert_eq!(node.changeset(), 77);
    assert_eq!(node.uid(), 12);
    assert_eq!(node.timestamp(), 1_500_000_000);
    assert_eq!(node.user(), "mapper <&>");
    assert_eq!(node.location().lat_e7(), -32_500_000);
    assert_eq!(node.location().lon_e7(), 1_410_000_001);
    assert_eq!(
        node.tags().collect::<Vec<_>>(),
        vec![("name", "a&b\"c'd<e>f\ng\rh\ti")]
    );
}

#[test]
fn osmchange_roundtrip_forces_deleted_invisible() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("diff.osc");

    let mut buffer = new_buffer();
    // version 1 -> create, version 3 -> modify, invisible -> delete
    add_node(&mut buffer, 1, 1, &[]);
    add_node(&mut buffer, 2, 3, &[]);
    {
        let mut node = NodeBuilder::new(&mut buffer).unwrap();
        node.set_id(4)
            .set_version(6)
            .set_visible(false)
            .set_location(Location::from_degrees(1.0, 2.0));
        node.finish().unwrap();
    }
    buffer.commit().unwrap();

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("<osmChange version=\"0.6\""));
    assert!(content.contains("<create>"));
    assert!(content.contains("<modify>"));
    assert!(content.contains("<delete>"));

    let buffers = read_all(&path);
    let objects: Vec<(i64, u32, bool)> = buffers
        .iter()
        .flat_map(|b| b.objects())
        .map(|o| (o.id(), o.version(), o.visible()))
        .collect();
    assert_eq!(objects, vec![(1, 1, true), (2, 3, true), (4, 6, false)]);
}

#[test]
fn xml_changeset_with_discussion_roundtrip() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("changesets.osm");

    let mut buffer = new_buffer();
    {
        let mut changeset = ChangesetBuilder::new(&mut buffer).unwrap();
        changeset.set_id(900).set_uid(5).set_timestamp(1_400_000_000);
        changeset.set_user("author").unwrap();
        let mut tags = changeset.tags().unwrap();
        tags.add_tag("comment", "import").unwrap();
        tags.finish().unwrap();
        let mut discussion = changeset.discussion().unwrap();
        discussion
            .add_comment(1_400_000_500, 6, "reviewer", "please check")
            .unwrap();
        discussion.finish().unwrap();
        changeset.finish().unwrap();
    }
    buffer.commit().unwrap();

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    let buffers = read_all(&path);
    let ObjectRef::Changeset(changeset) = buffers[0].objects().next().unwrap() else {
        panic!("expected changeset");
    };
    assert_eq!(changeset.id(), 900);
    assert_eq!(changeset.uid(), 5);
    assert_eq!(changeset.timestamp(), 1_400_000_000);
    assert_eq!(changeset.user(), "author");
    assert_eq!(
        changeset.tags().collect::<Vec<_>>(),
        vec![("comment", "import")]
    );
    let comment = changeset.discussion().next().unwrap();
    assert_eq!(comment.uid(), 6);
    assert_eq!(comment.timestamp(), 1_400_000_500);
    assert_eq!(comment.user(), "reviewer");
    assert_eq!(comment.text(), "please check");
}

#[test]
fn pbf_reader_preserves_file_order_across_blocks() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ordered.osm.pbf");

    // three dense-node blocks (8000 entities each) plus a way block
    let total_nodes = 20_000i64;
    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    let mut written_ids = Vec::new();
    for chunk in 0..4 {
        let mut buffer = Buffer::new(4 * 1024 * 1024, AutoGrow::Yes).unwrap();
        for i in 0..(total_nodes / 4) {
            let id = chunk * (total_nodes / 4) + i + 1;
            let mut node = NodeBuilder::new(&mut buffer).unwrap();
            node.set_id(id)
                .set_version(1)
                .set_location(Location::from_degrees(
                    (id % 90) as f64,
                    (id % 180) as f64,
                ));
            node.finish().unwrap();
            buffer.commit().unwrap();
            written_ids.push(id);
        }
        writer.write(buffer).unwrap();
    }
    let mut way_buffer = new_buffer();
    {
        let mut way = WayBuilder::new(&mut way_buffer).unwrap();
        way.set_id(total_nodes + 1).set_version(1);
        let mut refs = way.node_refs().unwrap();
        refs.add_ref(1).unwrap();
        refs.add_ref(2).unwrap();
        refs.finish().unwrap();
        way.finish().unwrap();
    }
    way_buffer.commit().unwrap();
    written_ids.push(total_nodes + 1);
    writer.write(way_buffer).unwrap();
    writer.close().unwrap();

    let buffers = read_all(&path);
    assert!(buffers.len() >= 4, "expected several blocks");
    assert_eq!(all_ids(&buffers), written_ids);
}

#[test]
fn gzip_xml_roundtrip() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("map.osm.gz");

    let mut buffer = new_buffer();
    add_node(&mut buffer, 8, 1, &[("highway", "bus_stop")]);

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    let buffers = read_all(&path);
    assert_eq!(all_ids(&buffers), vec![8]);
}

#[test]
fn header_travels_through_pbf() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("header.osm.pbf");

    let mut header = Header::default();
    header.set("generator", "osmbuf-tests");
    header.set_bounds(osmbuf::io::Bounds::new(
        Location::from_degrees(-10.0, -20.0),
        Location::from_degrees(10.0, 20.0),
    ));

    let mut writer = Writer::create(&path, &header).unwrap();
    let mut buffer = new_buffer();
    add_node(&mut buffer, 1, 1, &[]);
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let read_header = reader.header().unwrap();
    assert_eq!(read_header.get("generator"), Some("osmbuf-tests"));
    let bounds = read_header.bounds().unwrap();
    assert_eq!(bounds.bottom_left().lat_e7(), -100_000_000);
    assert_eq!(bounds.top_right().lon_e7(), 200_000_000);
    reader.close().unwrap();
}

#[test]
fn truncated_pbf_surfaces_format_error_then_eof() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.osm.pbf");

    let mut buffer = new_buffer();
    add_node(&mut buffer, 1, 1, &[]);
    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    writer.write(buffer).unwrap();
    writer.close().unwrap();

    // chop the file mid-blob
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let mut saw_error = false;
    loop {
        match reader.read() {
            Ok(buffer) => {
                if !buffer.is_valid() {
                    break;
                }
            }
            Err(_) => saw_error = true,
        }
    }
    assert!(saw_error, "truncated input must surface an error");
    assert!(reader.eof());
    reader.close().unwrap();
}

#[test]
fn close_before_eof_joins_cleanly() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("early.osm.pbf");

    let mut writer = Writer::create(&path, &Header::default()).unwrap();
    for _ in 0..40 {
        let mut buffer = new_buffer();
        for id in 1..=1000 {
            add_node(&mut buffer, id, 1, &[]);
        }
        writer.write(buffer).unwrap();
    }
    writer.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let first = reader.read().unwrap();
    assert!(first.is_valid());
    // close with most of the stream still in flight
    reader.close().unwrap();
}
