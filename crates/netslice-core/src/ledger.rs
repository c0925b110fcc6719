//! The tunnel ledger: the authoritative, crash-tolerant record of allocated
//! tunnels.
//!
//! Two on-disk formats are supported, chosen by file extension: a
//! line-oriented log (`.csv`, one `n1,…,nk,rate,tunnel_id,tcp_port` record
//! per line) and a structured document (`.json`, an array of tunnel
//! records). Both preserve insertion order and are rewritten on change.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use itertools::Itertools;

use crate::tunnel::{InvalidTunnel, Tunnel, TunnelId};
use crate::units::Mbps;

#[derive(Debug)]
pub struct TunnelLedger {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    format: Format,
    tunnels: Vec<Tunnel>,
    next_id: TunnelId,
    mtime: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Csv,
    Json,
}

impl TunnelLedger {
    /// Opens a ledger file, loading every record. A malformed record is
    /// fatal; a missing file yields an empty ledger.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("csv") => Format::Csv,
            Some("json") => Format::Json,
            _ => return Err(LedgerError::UnknownFileType(path)),
        };
        let (tunnels, mtime) = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            (parse(&contents, format)?, modified(&path))
        } else {
            (Vec::new(), None)
        };
        let next_id = next_after(&tunnels, TunnelId::ZERO);
        Ok(Self {
            inner: Mutex::new(Inner {
                path,
                format,
                tunnels,
                next_id,
                mtime,
            }),
        })
    }

    /// Returns a snapshot of all tunnels in insertion order.
    pub fn list(&self) -> Vec<Tunnel> {
        self.lock().tunnels.clone()
    }

    /// Returns the tunnel with the given ID, if present.
    pub fn get(&self, id: TunnelId) -> Option<Tunnel> {
        self.lock().tunnels.iter().find(|t| t.id == id).cloned()
    }

    /// Returns the number of active tunnels.
    pub fn len(&self) -> usize {
        self.lock().tunnels.len()
    }

    /// Whether the ledger has no active tunnels.
    pub fn is_empty(&self) -> bool {
        self.lock().tunnels.is_empty()
    }

    /// Reserves and returns the next tunnel ID. IDs are strictly increasing
    /// across calls and are never reused, even across restarts.
    pub fn next_id(&self) -> TunnelId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += TunnelId::ONE;
        id
    }

    /// Persists a new tunnel. The record must be structurally valid and must
    /// not collide with an existing ID or TCP port.
    pub fn append(&self, tunnel: Tunnel) -> Result<(), LedgerError> {
        tunnel.validate()?;
        let mut inner = self.lock();
        if inner.tunnels.iter().any(|t| t.id == tunnel.id) {
            return Err(LedgerError::DuplicateId(tunnel.id));
        }
        if inner.tunnels.iter().any(|t| t.tcp_port == tunnel.tcp_port) {
            return Err(LedgerError::DuplicatePort(tunnel.tcp_port));
        }
        let mut updated = inner.tunnels.clone();
        updated.push(tunnel);
        inner.commit(updated)?;
        inner.next_id = next_after(&inner.tunnels, inner.next_id);
        Ok(())
    }

    /// Persists the removal of a tunnel, returning the removed record.
    pub fn remove(&self, id: TunnelId) -> Result<Tunnel, LedgerError> {
        let mut inner = self.lock();
        let pos = inner
            .tunnels
            .iter()
            .position(|t| t.id == id)
            .ok_or(LedgerError::NotFound(id))?;
        let mut updated = inner.tunnels.clone();
        let tunnel = updated.remove(pos);
        inner.commit(updated)?;
        Ok(tunnel)
    }

    /// Reloads the file when it was modified externally. Returns whether the
    /// in-memory view changed. The ID allocator never moves backwards.
    pub fn refresh(&self) -> Result<bool, LedgerError> {
        let mut inner = self.lock();
        if !inner.path.exists() {
            return Ok(false);
        }
        let mtime = modified(&inner.path);
        if mtime == inner.mtime {
            return Ok(false);
        }
        let contents = std::fs::read_to_string(&inner.path)?;
        let tunnels = parse(&contents, inner.format)?;
        let changed = tunnels != inner.tunnels;
        inner.tunnels = tunnels;
        inner.next_id = next_after(&inner.tunnels, inner.next_id);
        inner.mtime = mtime;
        Ok(changed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Inner operations never panic while holding the lock.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Inner {
    fn commit(&mut self, tunnels: Vec<Tunnel>) -> Result<(), LedgerError> {
        let contents = match self.format {
            Format::Csv => tunnels
                .iter()
                .map(|t| {
                    format!(
                        "{},{},{},{}",
                        t.path.iter().join(","),
                        t.rate.into_u64(),
                        t.id,
                        t.tcp_port
                    )
                })
                .join("\n")
                + if tunnels.is_empty() { "" } else { "\n" },
            Format::Json => serde_json::to_string_pretty(&tunnels)?,
        };
        // Persist first; the in-memory commit happens only if the write
        // lands, so a disk failure leaves the ledger unchanged.
        std::fs::write(&self.path, contents)?;
        self.tunnels = tunnels;
        self.mtime = modified(&self.path);
        Ok(())
    }
}

fn parse(contents: &str, format: Format) -> Result<Vec<Tunnel>, LedgerError> {
    let tunnels = match format {
        Format::Csv => parse_csv(contents)?,
        Format::Json => serde_json::from_str::<Vec<Tunnel>>(contents)?,
    };
    for tunnel in &tunnels {
        tunnel.validate()?;
    }
    Ok(tunnels)
}

fn parse_csv(contents: &str) -> Result<Vec<Tunnel>, LedgerError> {
    let mut tunnels = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let corrupt = |reason: &str| LedgerError::Corrupt {
            line: i + 1,
            reason: reason.to_owned(),
        };
        let fields = line.split(',').map(str::trim).collect::<Vec<_>>();
        if fields.len() < 6 {
            return Err(corrupt("expected at least 6 fields"));
        }
        let (path_fields, tail) = fields.split_at(fields.len() - 3);
        let path = path_fields
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| corrupt("malformed node name"))?;
        let [rate, id, tcp_port] = tail else {
            return Err(corrupt("expected rate, tunnel id, and tcp port"));
        };
        let rate = rate
            .parse::<u64>()
            .map_err(|_| corrupt("non-integer rate"))?;
        let id = id
            .parse::<u64>()
            .map_err(|_| corrupt("non-integer tunnel id"))?;
        let tcp_port = tcp_port
            .parse::<u16>()
            .map_err(|_| corrupt("non-integer tcp port"))?;
        tunnels.push(Tunnel {
            id: TunnelId::new(id),
            path,
            rate: Mbps::new(rate),
            tcp_port,
            bidirectional: true,
        });
    }
    Ok(tunnels)
}

fn next_after(tunnels: &[Tunnel], floor: TunnelId) -> TunnelId {
    let max = tunnels.iter().map(|t| t.id).max().unwrap_or(TunnelId::ZERO);
    floor.max(max + TunnelId::ONE)
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// The ledger's error type. Parse failures at start are fatal by policy;
/// silent truncation is forbidden.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A malformed record in the line-oriented format.
    #[error("corrupt ledger record at line {line}: {reason}")]
    Corrupt {
        /// 1-based line number.
        line: usize,
        /// What was wrong with the record.
        reason: String,
    },

    /// A malformed structured document.
    #[error("corrupt ledger document")]
    Document(#[from] serde_json::Error),

    /// A structurally invalid tunnel record.
    #[error("invalid tunnel record")]
    InvalidRecord(#[from] InvalidTunnel),

    /// An ID collision on append.
    #[error("tunnel id {0} already exists")]
    DuplicateId(TunnelId),

    /// A TCP port collision on append.
    #[error("tcp port {0} already in use")]
    DuplicatePort(u16),

    /// The requested tunnel does not exist.
    #[error("tunnel {0} not found")]
    NotFound(TunnelId),

    /// The ledger path has no recognized extension.
    #[error("unknown ledger file type: {0}")]
    UnknownFileType(PathBuf),

    /// Filesystem failure.
    #[error("ledger I/O error")]
    Io(#[from] std::io::Error),
}
