//! Generated protobuf types for the PBF file format.

include!(concat!(env!("OUT_DIR"), "/osmpbf.rs"));
