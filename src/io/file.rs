//! File descriptors: format and compression detection plus per-file options.
//!
//! Formats are recognized by suffix only, never by sniffing content.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Xml,
    Pbf,
}

/// Transport compression around the whole file. PBF blobs carry their own
/// per-blob zlib compression independent of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

/// Describes one OSM file: where it lives, how it is encoded and the
/// format options the reader and writer honor.
///
/// Recognized option keys:
///
/// - `add_metadata`: emit version/timestamp/uid/user/changeset (default true)
/// - `xml_change_format`: XML encoder emits osmChange (default false,
///   implied by the `.osc` suffix)
/// - `force_visible_flag`: XML encoder always emits `visible="..."`
/// - `pbf_dense_nodes`: default true
/// - `pbf_compression`: `zlib` (default), `none` or `false`
/// - `pbf_add_metadata`: default true
/// - `has_multiple_object_versions`: file contains history
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
    format: FileFormat,
    compression: Compression,
    options: HashMap<String, String>,
}

impl File {
    /// Creates a descriptor, detecting format and compression by suffix.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<File> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(Error::InvalidArgument("file name is not valid UTF-8"))?;
        let (format, compression, change) = detect(name).ok_or_else(|| {
            Error::Format(format!("unknown file format suffix: '{name}'"))
        })?;
        let mut file = File::with_format(path, format, compression);
        if change {
            file.set("xml_change_format", "true");
        }
        Ok(file)
    }

    /// Creates a descriptor with an explicit format, bypassing detection.
    pub fn with_format<P: AsRef<Path>>(
        path: P,
        format: FileFormat,
        compression: Compression,
    ) -> File {
        File {
            path: path.as_ref().to_path_buf(),
            format,
            compression,
            options: HashMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> &mut File {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_true(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    /// False only if the option is explicitly set to "false".
    pub fn is_not_false(&self, key: &str) -> bool {
        self.get(key) != Some("false")
    }

    pub fn has_multiple_object_versions(&self) -> bool {
        self.is_true("has_multiple_object_versions")
    }
}

fn detect(name: &str) -> Option<(FileFormat, Compression, bool)> {
    let table: &[(&str, FileFormat, Compression, bool)] = &[
        (".osm.pbf", FileFormat::Pbf, Compression::None, false),
        (".pbf", FileFormat::Pbf, Compression::None, false),
        (".osm.gz", FileFormat::Xml, Compression::Gzip, false),
        (".osc.gz", FileFormat::Xml, Compression::Gzip, true),
        (".osm.bz2", FileFormat::Xml, Compression::Bzip2, false),
        (".osc.bz2", FileFormat::Xml, Compression::Bzip2, true),
        (".osm", FileFormat::Xml, Compression::None, false),
        (".osc", FileFormat::Xml, Compression::None, true),
    ];
    table
        .iter()
        .find(|(suffix, ..)| name.ends_with(suffix))
        .map(|&(_, format, compression, change)| (format, compression, change))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_by_suffix() {
        assert_eq!(File::new("planet.osm.pbf").unwrap().format(), FileFormat::Pbf);
        assert_eq!(File::new("extract.pbf").unwrap().format(), FileFormat::Pbf);
        assert_eq!(File::new("map.osm").unwrap().format(), FileFormat::Xml);

        let change = File::new("diff.osc").unwrap();
        assert_eq!(change.format(), FileFormat::Xml);
        assert!(change.is_true("xml_change_format"));

        let gz = File::new("map.osm.gz").unwrap();
        assert_eq!(gz.format(), FileFormat::Xml);
        assert_eq!(gz.compression(), Compression::Gzip);

        let bz2 = File::new("map.osm.bz2").unwrap();
        assert_eq!(bz2.compression(), Compression::Bzip2);
    }

    #[test]
    fn unknown_suffix_is_an_error() {
        assert!(matches!(File::new("map.json"), Err(Error::Format(_))));
    }

    #[test]
    fn option_defaults() {
        let file = File::new("map.osm").unwrap();
        assert!(file.is_not_false("add_metadata"));
        assert!(!file.is_true("force_visible_flag"));
        assert!(!file.has_multiple_object_versions());

        let mut file = file;
        file.set("add_metadata", "false");
        assert!(!file.is_not_false("add_metadata"));
    }
}
