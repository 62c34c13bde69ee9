//! Data handles.
//!
//! An [`InformationPacket`] names one piece of data flowing between tasks by
//! its final path. Everything else is derived from that path:
//!
//! | path                    | meaning                                  |
//! |-------------------------|------------------------------------------|
//! | `<path>`                | committed content                        |
//! | `<path>.tmp`            | in-progress output, renamed on commit    |
//! | `<path>.fifo`           | named pipe for streaming handles         |
//! | `<path>.audit.json`     | provenance sidecar                       |
//!
//! A file-backed handle's content only appears at `<path>` through
//! [`atomize`](InformationPacket::atomize), a single `rename(2)`.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::OnceLock;

use super::audit::{AuditError, AuditInfo};

const TEMP_SUFFIX: &str = ".tmp";
const FIFO_SUFFIX: &str = ".fifo";
const AUDIT_SUFFIX: &str = ".audit.json";

/// A named, path-addressed unit of data.
///
/// Packets are shared between the producing task's outputs and consuming
/// tasks' inputs behind an `Arc`. The provenance record is set at most once,
/// by the producer when it commits.
#[derive(Debug)]
pub struct InformationPacket {
    path: String,
    do_stream: bool,
    audit_info: OnceLock<AuditInfo>,
}

impl InformationPacket {
    /// Create a file-backed packet for `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            do_stream: false,
            audit_info: OnceLock::new(),
        }
    }

    /// Create a packet realized as a named pipe.
    pub fn streaming(path: impl Into<String>) -> Self {
        Self {
            do_stream: true,
            ..Self::new(path)
        }
    }

    /// Create a packet for data that may already exist on disk, loading its
    /// provenance sidecar when one is present.
    pub fn from_existing(path: impl Into<String>) -> Result<Self, AuditError> {
        let packet = Self::new(path);
        packet.load_audit_log()?;
        Ok(packet)
    }

    /// Final path of the data.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path a producing command writes to before commit.
    pub fn temp_path(&self) -> String {
        format!("{}{}", self.path, TEMP_SUFFIX)
    }

    /// Path of the named pipe for streaming packets.
    pub fn fifo_path(&self) -> String {
        format!("{}{}", self.path, FIFO_SUFFIX)
    }

    /// Path of the provenance sidecar.
    pub fn audit_path(&self) -> String {
        format!("{}{}", self.path, AUDIT_SUFFIX)
    }

    /// Whether this packet is transferred through a named pipe.
    pub fn is_streaming(&self) -> bool {
        self.do_stream
    }

    /// Whether the committed file exists.
    pub fn exists(&self) -> bool {
        Path::new(&self.path).exists()
    }

    /// Whether an in-progress temp file exists.
    pub fn temp_exists(&self) -> bool {
        Path::new(&self.temp_path()).exists()
    }

    /// Whether the named pipe exists.
    pub fn fifo_exists(&self) -> bool {
        Path::new(&self.fifo_path()).exists()
    }

    /// Read the committed content.
    pub fn read(&self) -> io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }

    /// Create the named pipe at [`fifo_path`](Self::fifo_path).
    pub fn create_fifo(&self) -> io::Result<()> {
        let fifo = self.fifo_path();
        let c_path = CString::new(Path::new(&fifo).as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Remove the named pipe, if present.
    pub fn remove_fifo(&self) -> io::Result<()> {
        match std::fs::remove_file(self.fifo_path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Commit the temp file to the final path with a single rename.
    pub fn atomize(&self) -> io::Result<()> {
        std::fs::rename(self.temp_path(), &self.path)
    }

    /// Provenance record, once the producer has committed.
    pub fn audit_info(&self) -> Option<&AuditInfo> {
        self.audit_info.get()
    }

    /// Attach a provenance record. Returns `false` if one was already set.
    pub fn set_audit_info(&self, info: AuditInfo) -> bool {
        self.audit_info.set(info).is_ok()
    }

    /// Persist the attached record to [`audit_path`](Self::audit_path).
    pub fn write_audit_log(&self) -> Result<(), AuditError> {
        let info = self.audit_info().cloned().unwrap_or_default();
        info.to_file(self.audit_path())
    }

    /// Load the sidecar into this packet if it exists and no record is set.
    ///
    /// Returns `true` when a record was loaded.
    pub fn load_audit_log(&self) -> Result<bool, AuditError> {
        let audit_path = self.audit_path();
        if self.audit_info.get().is_some() || !Path::new(&audit_path).exists() {
            return Ok(false);
        }
        let info = AuditInfo::from_file(&audit_path)?;
        Ok(self.set_audit_info(info))
    }
}
