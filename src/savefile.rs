//! pcap-format savefile writer (C2).
//!
//! The wire format is written by hand rather than through an FFI binding
//! to libpcap: the engine only ever produces savefiles, never reads or
//! live-captures through one, so there is nothing libpcap buys us here
//! that a couple of hand-laid-out headers don't already give us, and it
//! keeps the dependency stack on `libc` alone, same as the teacher crate.

use crate::error::{Result, RxtxError};
use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::sync::{Arc, Mutex};

const PCAP_MAGIC: u32 = 0xa1b2c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const SNAPLEN: u32 = 65535;
/// `DLT_EN10MB` -- Ethernet II link-layer header.
const LINKTYPE_ETHERNET: u32 = 1;

/// One pcap packet record header, matching `struct pcap_pkthdr`.
#[derive(Clone, Copy, Debug)]
pub struct PacketHeader {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub caplen: u32,
    pub len: u32,
}

impl PacketHeader {
    /// Builds a header for a just-received frame: `caplen == len` always,
    /// the engine never truncates to a snaplen, and `ts_usec` is always
    /// zero (only second-resolution timestamps are recorded).
    pub fn for_frame(frame_len: usize, ts_sec: u32) -> Self {
        PacketHeader {
            ts_sec,
            ts_usec: 0,
            caplen: frame_len as u32,
            len: frame_len as u32,
        }
    }
}

enum Sink {
    File(File),
    Stdout(Stdout),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::File(f) => f.write(buf),
            Sink::Stdout(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::File(f) => f.flush(),
            Sink::Stdout(s) => s.flush(),
        }
    }
}

struct Inner {
    name: String,
    sink: Option<Sink>,
}

impl Inner {
    fn dump(&mut self, header: &PacketHeader, packet: &[u8], flush: bool) -> Result<()> {
        let sink = self
            .sink
            .as_mut()
            .expect("dump called on a closed savefile");

        let mut record = [0u8; 16];
        record[0..4].copy_from_slice(&header.ts_sec.to_le_bytes());
        record[4..8].copy_from_slice(&header.ts_usec.to_le_bytes());
        record[8..12].copy_from_slice(&header.caplen.to_le_bytes());
        record[12..16].copy_from_slice(&header.len.to_le_bytes());

        sink.write_all(&record)
            .and_then(|_| sink.write_all(packet))
            .map_err(|e| RxtxError::Io(format!("error writing to savefile '{}': {e}", self.name)))?;

        if flush {
            sink.flush().map_err(|e| {
                RxtxError::Io(format!("error writing to savefile '{}': {e}", self.name))
            })?;
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.flush().map_err(|e| {
                RxtxError::Io(format!("error writing to savefile '{}': {e}", self.name))
            })?;
        }
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Best-effort: teardown errors are not actionable from a
        // destructor, but we still attempt the flush.
        let _ = self.close();
    }
}

/// A pcap-format sink. Cheaply [`Clone`]-able: clones share the same
/// underlying file/mutex, so a single savefile can be handed to several
/// rings when writing to standard output (§3, §4.2).
#[derive(Clone)]
pub struct Savefile {
    inner: Arc<Mutex<Inner>>,
}

impl Savefile {
    /// Opens `path` for writing, treating `-` as standard output, and
    /// writes the pcap global header.
    pub fn open(path: &str) -> Result<Self> {
        let sink = if path == "-" {
            Sink::Stdout(io::stdout())
        } else {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|e| RxtxError::Resource(format!("error opening savefile '{path}': {e}")))?;
            Sink::File(file)
        };

        let mut inner = Inner {
            name: path.to_string(),
            sink: Some(sink),
        };

        let mut header = [0u8; 24];
        header[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
        header[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
        // thiszone, sigfigs: always zero.
        header[8..12].copy_from_slice(&0u32.to_le_bytes());
        header[12..16].copy_from_slice(&0u32.to_le_bytes());
        header[16..20].copy_from_slice(&SNAPLEN.to_le_bytes());
        header[20..24].copy_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());

        inner
            .sink
            .as_mut()
            .unwrap()
            .write_all(&header)
            .map_err(|e| RxtxError::Resource(format!("error opening savefile '{path}': {e}")))?;

        Ok(Savefile {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Writes one pcap record, serialized against concurrent writers of
    /// the same savefile, and optionally flushes the write buffer.
    pub fn dump(&self, header: &PacketHeader, packet: &[u8], flush: bool) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| RxtxError::Resource("savefile mutex poisoned".into()))?;
        guard.dump(header, packet, flush)
    }

    /// Flushes and closes the underlying sink. Safe to call more than
    /// once or to skip entirely (the last clone's [`Drop`] does it too).
    pub fn close(&self) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| RxtxError::Resource("savefile mutex poisoned".into()))?;
        guard.close()
    }
}
