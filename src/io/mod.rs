//! Reading and writing OSM files.
//!
//! A [`Reader`] owns a background thread that frames the input and feeds
//! decoded buffers through a bounded queue of futures; [`Reader::read`]
//! pops and awaits one future at a time, so buffers arrive in file order
//! even though decode work finishes out of order. A [`Writer`] is the
//! mirror image: encode tasks produce byte chunks whose futures a
//! background thread awaits and writes sequentially.

mod file;
mod pbf_input;
mod pbf_output;
mod xml_input;
mod xml_output;

pub use file::{Compression, File, FileFormat};

use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::thread::JoinHandle;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use log::debug;

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::osm::Location;
use crate::pool::{self, Future};
use crate::queue::{SharedQueue, MAX_QUEUE_SIZE};

/// A BlobHeader larger than this is rejected as malformed.
pub(crate) const MAX_BLOB_HEADER_SIZE: usize = 64 * 1024;

/// Hard limit on the uncompressed content of one PBF blob.
pub(crate) const MAX_UNCOMPRESSED_BLOB_SIZE: usize = 32 * 1024 * 1024;

/// Entity cap per primitive group and per decoded XML buffer.
pub(crate) const MAX_ENTITIES_PER_BLOCK: usize = 8000;

pub(crate) fn timestamp_to_iso(timestamp: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

pub(crate) fn parse_iso_timestamp(s: &str) -> Result<i64> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ")
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|_| Error::Format(format!("invalid timestamp '{s}'")))
}

/// Geographic extent of a file, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    bottom_left: Location,
    top_right: Location,
}

impl Bounds {
    pub fn new(bottom_left: Location, top_right: Location) -> Bounds {
        Bounds {
            bottom_left,
            top_right,
        }
    }

    pub fn bottom_left(&self) -> Location {
        self.bottom_left
    }

    pub fn top_right(&self) -> Location {
        self.top_right
    }
}

/// File-level metadata: bounds plus free-form key/value options such as
/// `generator` and the osmosis replication fields.
#[derive(Debug, Clone, Default)]
pub struct Header {
    bounds: Option<Bounds>,
    options: HashMap<String, String>,
    has_multiple_object_versions: bool,
}

impl Header {
    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn set_bounds(&mut self, bounds: Bounds) -> &mut Header {
        self.bounds = Some(bounds);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> &mut Header {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    pub fn has_multiple_object_versions(&self) -> bool {
        self.has_multiple_object_versions
    }

    pub fn set_has_multiple_object_versions(&mut self, value: bool) -> &mut Header {
        self.has_multiple_object_versions = value;
        self
    }
}

/// Reads OSM files buffer by buffer.
pub struct Reader {
    queue: SharedQueue<Future<Buffer>>,
    header_future: Option<Future<Header>>,
    header: Option<Header>,
    header_error: Option<String>,
    thread: Option<JoinHandle<()>>,
    eof: bool,
}

impl Reader {
    /// Opens a path, detecting the format by suffix.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Reader> {
        Reader::new(File::new(path)?)
    }

    /// Opens the described file and spawns its decode thread.
    pub fn new(file: File) -> Result<Reader> {
        let raw = std::fs::File::open(file.path())?;
        let read: Box<dyn BufRead + Send> = match file.compression() {
            Compression::None => Box::new(BufReader::with_capacity(64 * 1024, raw)),
            Compression::Gzip => Box::new(BufReader::new(GzDecoder::new(BufReader::new(raw)))),
            Compression::Bzip2 => {
                return Err(Error::Format(
                    "bzip2 transport is not supported".to_string(),
                ))
            }
        };

        debug!("starting reader for {:?}", file.path());
        let queue = SharedQueue::new(MAX_QUEUE_SIZE);
        let (header_promise, header_future) = pool::channel();
        let thread_queue = queue.clone();
        let thread = std::thread::Builder::new()
            .name("osmbuf-reader".to_string())
            .spawn(move || match file.format() {
                FileFormat::Xml => xml_input::run(read, thread_queue, header_promise),
                FileFormat::Pbf => pbf_input::run(read, thread_queue, header_promise),
            })?;

        Ok(Reader {
            queue,
            header_future: Some(header_future),
            header: None,
            header_error: None,
            thread: Some(thread),
            eof: false,
        })
    }

    /// The file header. Blocks until the decode thread has seen it.
    pub fn header(&mut self) -> Result<Header> {
        if let Some(header) = &self.header {
            return Ok(header.clone());
        }
        if let Some(message) = &self.header_error {
            return Err(Error::Format(message.clone()));
        }
        match self.header_future.take() {
            Some(future) => match future.get() {
                Ok(header) => {
                    self.header = Some(header.clone());
                    Ok(header)
                }
                Err(e) => {
                    self.header_error = Some(e.to_string());
                    Err(e)
                }
            },
            None => Err(Error::Logic("header future already consumed")),
        }
    }

    /// Returns the next buffer in file order, or the invalid buffer at
    /// end of stream. A decode error is re-raised here, on the calling
    /// thread; the stream ends after the error.
    pub fn read(&mut self) -> Result<Buffer> {
        if self.eof {
            return Ok(Buffer::invalid());
        }
        match self.queue.wait_and_pop() {
            Some(future) => {
                let buffer = future.get()?;
                if !buffer.is_valid() {
                    self.eof = true;
                }
                Ok(buffer)
            }
            None => {
                self.eof = true;
                Ok(Buffer::invalid())
            }
        }
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Stops the decode thread and discards any buffers still in flight.
    pub fn close(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.queue.shutdown();
        while self.queue.try_pop().is_some() {}
        thread
            .join()
            .map_err(|_| Error::Logic("reader thread panicked"))?;
        debug!("reader closed");
        Ok(())
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Per-format encoder behind a [`Writer`].
pub(crate) trait OutputFormat: Send {
    fn write_header(&mut self, header: &Header) -> Result<()>;
    fn write_buffer(&mut self, buffer: Buffer) -> Result<()>;
    /// Flushes pending state and pushes the end-of-stream sentinel.
    fn close(&mut self) -> Result<()>;
}

/// Writes OSM files buffer by buffer.
pub struct Writer {
    format: Box<dyn OutputFormat>,
    thread: Option<JoinHandle<Result<()>>>,
    closed: bool,
}

impl Writer {
    /// Creates the output file and spawns the write thread. The header is
    /// always written first.
    pub fn new(file: File, header: &Header) -> Result<Writer> {
        let raw = std::fs::File::create(file.path())?;
        let out: Box<dyn Write + Send> = match file.compression() {
            Compression::None => Box::new(BufWriter::with_capacity(64 * 1024, raw)),
            Compression::Gzip => Box::new(GzEncoder::new(
                BufWriter::new(raw),
                flate2::Compression::default(),
            )),
            Compression::Bzip2 => {
                return Err(Error::Format(
                    "bzip2 transport is not supported".to_string(),
                ))
            }
        };

        let queue: SharedQueue<Future<Vec<u8>>> = SharedQueue::new(MAX_QUEUE_SIZE);
        let thread_queue = queue.clone();
        let thread = std::thread::Builder::new()
            .name("osmbuf-writer".to_string())
            .spawn(move || run_write_thread(thread_queue, out))?;

        let mut format: Box<dyn OutputFormat> = match file.format() {
            FileFormat::Xml => Box::new(xml_output::XmlOutput::new(&file, queue.clone())),
            FileFormat::Pbf => Box::new(pbf_output::PbfOutput::new(&file, queue.clone())),
        };
        if let Err(e) = format.write_header(header) {
            queue.shutdown();
            let _ = thread.join();
            return Err(e);
        }
        debug!("writer started for {:?}", file.path());

        Ok(Writer {
            format,
            thread: Some(thread),
            closed: false,
        })
    }

    /// Opens a path, detecting the format by suffix.
    pub fn create<P: AsRef<std::path::Path>>(path: P, header: &Header) -> Result<Writer> {
        Writer::new(File::new(path)?, header)
    }

    /// Hands a buffer of objects to the encoder.
    pub fn write(&mut self, buffer: Buffer) -> Result<()> {
        self.format.write_buffer(buffer)
    }

    /// Flushes the final partial block and joins the write thread. Errors
    /// deferred by the write thread surface here.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let close_result = self.format.close();
        let thread_result = match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::Logic("writer thread panicked"))?,
            None => Ok(()),
        };
        debug!("writer closed");
        thread_result.and(close_result)
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run_write_thread(queue: SharedQueue<Future<Vec<u8>>>, mut out: Box<dyn Write + Send>) -> Result<()> {
    let mut first_error: Option<Error> = None;
    loop {
        let Some(future) = queue.wait_and_pop() else {
            break;
        };
        match future.get() {
            Ok(bytes) => {
                if bytes.is_empty() {
                    break;
                }
                if first_error.is_none() {
                    if let Err(e) = out.write_all(&bytes) {
                        first_error = Some(e.into());
                        // unblocks producers so close() can run
                        queue.shutdown();
                    }
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                    queue.shutdown();
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    out.flush()?;
    Ok(())
}
