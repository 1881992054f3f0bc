use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::ProtocolError;

/// Maximum frame size (10MB). Unit files and manifests are small, anything
/// beyond this is a malformed or hostile client.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// One chunk of a key diff as it travels over the wire. A push is a sequence
/// of fragments; the server merges them into a single [`KeyDiff`] before
/// applying anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffFragment {
    /// Filename -> file content for files that should be created
    #[serde(default)]
    pub inserts: HashMap<String, String>,
    /// Filename -> file content for files that should be overwritten
    #[serde(default)]
    pub updates: HashMap<String, String>,
    /// Filenames that should be removed
    #[serde(default)]
    pub deletions: Vec<String>,
}

impl DiffFragment {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletions.is_empty()
    }
}

/// A fully assembled key diff: the unit of change the agent applies in one
/// reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyDiff {
    pub inserts: HashMap<String, String>,
    pub updates: HashMap<String, String>,
    pub deletions: Vec<String>,
}

impl KeyDiff {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletions.is_empty()
    }
}

/// Client-to-server message. A push is zero or more `Fragment` frames
/// terminated by `Done`; a clean EOF is treated like `Done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PushFrame {
    Fragment(DiffFragment),
    Done,
}

/// Failure class reported to the controller. `InvalidArgument` means the
/// pushed data violated a contract rule and resending the same diff will
/// fail the same way; `Internal` means the host failed to apply it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    InvalidArgument,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal server-to-client message: one per push, sent after the whole
/// diff has been applied (or rejected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PushResponse {
    /// Empty acknowledgement: the diff was fully applied
    Ok,
    /// The diff was not (fully) applied
    Error {
        category: ErrorCategory,
        message: String,
    },
}

impl PushResponse {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        PushResponse::Error {
            category: ErrorCategory::InvalidArgument,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        PushResponse::Error {
            category: ErrorCategory::Internal,
            message: msg.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, PushResponse::Ok)
    }
}

/// Contract violation detected while merging fragments into one diff.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    #[error("malformed entry name {0:?} in diff fragment")]
    MalformedName(String),

    #[error("key {0:?} appears more than once across diff categories")]
    ConflictingKey(String),
}

/// Incremental assembler for a fragment stream.
///
/// Each fragment is merged as it arrives; contract checks (entry names must
/// be bare filenames, a key may appear in exactly one category once) fail
/// the whole push as soon as they are observed.
#[derive(Debug, Default)]
pub struct DiffAssembler {
    diff: KeyDiff,
    seen: std::collections::HashSet<String>,
}

impl DiffAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one fragment into the diff under assembly.
    pub fn push(&mut self, fragment: DiffFragment) -> Result<(), AssemblyError> {
        for (name, content) in fragment.inserts {
            self.accept(&name)?;
            self.diff.inserts.insert(name, content);
        }
        for (name, content) in fragment.updates {
            self.accept(&name)?;
            self.diff.updates.insert(name, content);
        }
        for name in fragment.deletions {
            self.accept(&name)?;
            self.diff.deletions.push(name);
        }
        Ok(())
    }

    /// Consume the assembler, yielding the merged diff.
    pub fn finish(self) -> KeyDiff {
        self.diff
    }

    fn accept(&mut self, name: &str) -> Result<(), AssemblyError> {
        if !is_valid_entry_name(name) {
            return Err(AssemblyError::MalformedName(name.to_string()));
        }
        if !self.seen.insert(name.to_string()) {
            return Err(AssemblyError::ConflictingKey(name.to_string()));
        }
        Ok(())
    }
}

/// Entry names are bare filenames: non-empty, no path separators, and not a
/// dot component. Anything else could escape the unit directory.
fn is_valid_entry_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && name != "."
        && name != ".."
}

/// Encode a push frame to length-prefixed bincode bytes
pub fn encode_push_frame(frame: &PushFrame) -> Result<Vec<u8>, ProtocolError> {
    encode(frame)
}

/// Decode a push frame from raw bincode payload (framing already stripped)
pub fn decode_push_frame(bytes: &[u8]) -> Result<PushFrame, ProtocolError> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}

/// Encode a push response to length-prefixed bincode bytes
pub fn encode_response(response: &PushResponse) -> Result<Vec<u8>, ProtocolError> {
    encode(response)
}

/// Decode a push response from raw bincode payload (framing already stripped)
pub fn decode_response(bytes: &[u8]) -> Result<PushResponse, ProtocolError> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let size = bincode::serialized_size(msg).map_err(ProtocolError::Encode)?;
    if size > MAX_MESSAGE_SIZE as u64 {
        return Err(ProtocolError::MessageTooLarge { size: size as usize });
    }
    let len = size as u32;
    let mut frame = Vec::with_capacity(4 + size as usize);
    frame.extend_from_slice(&len.to_be_bytes());
    bincode::serialize_into(&mut frame, msg).map_err(ProtocolError::Encode)?;
    Ok(frame)
}

/// Read one length-prefixed frame payload. Returns `None` on a clean EOF
/// before the length header (end of stream); EOF mid-frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let msg_len = u32::from_be_bytes(len_buf) as usize;

    if msg_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge { size: msg_len });
    }

    let mut payload = vec![0u8; msg_len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(ProtocolError::Io)?;
    Ok(Some(payload))
}
