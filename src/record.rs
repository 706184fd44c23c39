//! Record types shared by the builder, the merge path and the filter.
//!
//! A [`Record`] is an immutable message as the store hands it out. Records
//! reference their ancestors by [`RecordId`]; the chain is ordered from the
//! thread root down to the direct parent, so the nearest ancestor is last.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Returns the current time in milliseconds since the Unix epoch.
pub fn current_timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Opaque identifier of a record.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Creates a record id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id can be used to reference a record.
    ///
    /// Empty or whitespace-only ids show up in ancestor chains of damaged
    /// records and must not be looked up.
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Name of a board (collection of records threaded together).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardId(String);

impl BoardId {
    /// Creates a board id.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the board name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BoardId({})", self.0)
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BoardId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Trust classification assigned upstream by signature and identity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Unsigned or unverifiable.
    #[default]
    None,
    /// Sender explicitly distrusted.
    Bad,
    /// Sender known but unrated.
    Neutral,
    /// Sender trusted.
    Good,
    /// Sender on the friend list.
    Friend,
    /// Signature present but failed verification.
    Tampered,
}

impl TrustLevel {
    /// Returns true for classifications exempt from sender-count and keyword rules.
    pub fn is_trusted(&self) -> bool {
        matches!(self, TrustLevel::Good | TrustLevel::Friend)
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustLevel::None => write!(f, "none"),
            TrustLevel::Bad => write!(f, "bad"),
            TrustLevel::Neutral => write!(f, "neutral"),
            TrustLevel::Good => write!(f, "good"),
            TrustLevel::Friend => write!(f, "friend"),
            TrustLevel::Tampered => write!(f, "tampered"),
        }
    }
}

/// Identity of a record's author as known to the identity subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Unique identity string of the sender.
    pub identity: String,
    /// Number of messages ever accepted from this sender.
    pub accepted_messages: u64,
}

impl Sender {
    /// Creates a sender with the given lifetime message count.
    pub fn new(identity: impl Into<String>, accepted_messages: u64) -> Self {
        Self {
            identity: identity.into(),
            accepted_messages,
        }
    }
}

/// A stored message.
///
/// Everything except the read-state flag is fixed once the store has it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique id; legacy records may not carry one.
    pub id: Option<RecordId>,
    /// Board the record was posted to.
    pub board: BoardId,
    /// Creation timestamp in milliseconds since Unix epoch.
    pub timestamp: u64,
    /// Ancestor ids, thread root first and direct parent last.
    #[serde(default)]
    pub parents: Vec<RecordId>,
    /// Trust classification of the sender.
    #[serde(default)]
    pub trust: TrustLevel,
    /// Unread flag. The only field this crate ever changes.
    #[serde(default)]
    pub is_new: bool,
    /// User flagged the record.
    #[serde(default)]
    pub is_flagged: bool,
    /// User starred the record.
    #[serde(default)]
    pub is_starred: bool,
    /// Record was classified as junk.
    #[serde(default)]
    pub is_junk: bool,
    /// Subject line.
    #[serde(default)]
    pub subject: String,
    /// Raw extra headers, searched together with the subject.
    #[serde(default)]
    pub headers: String,
    /// Message body.
    #[serde(default)]
    pub body: String,
    /// Names of other boards advertised as attachments.
    #[serde(default)]
    pub attached_boards: Vec<String>,
    /// Author, if the record is signed by a known identity.
    #[serde(default)]
    pub sender: Option<Sender>,
    /// Recipient identity; present only on private records.
    #[serde(default)]
    pub recipient: Option<String>,
}

impl Record {
    /// Creates an unread record with the given id and ancestor chain.
    pub fn new(board: impl Into<BoardId>, id: impl Into<RecordId>, parents: &[&str]) -> Self {
        Self {
            id: Some(id.into()),
            board: board.into(),
            timestamp: current_timestamp_millis(),
            parents: parents.iter().map(|p| RecordId::new(*p)).collect(),
            trust: TrustLevel::None,
            is_new: true,
            is_flagged: false,
            is_starred: false,
            is_junk: false,
            subject: String::new(),
            headers: String::new(),
            body: String::new(),
            attached_boards: Vec::new(),
            sender: None,
            recipient: None,
        }
    }

    /// Creates a record that cannot be referenced by other records.
    pub fn without_id(board: impl Into<BoardId>) -> Self {
        Self {
            id: None,
            ..Self::new(board, "", &[])
        }
    }

    /// Sets the creation timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the trust classification.
    pub fn with_trust(mut self, trust: TrustLevel) -> Self {
        self.trust = trust;
        self
    }

    /// Sets the sender.
    pub fn with_sender(mut self, sender: Sender) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Marks the record as read.
    pub fn read(mut self) -> Self {
        self.is_new = false;
        self
    }

    /// Returns the direct parent id, if any.
    pub fn nearest_parent(&self) -> Option<&RecordId> {
        self.parents.last()
    }

    /// Returns true if the record is addressed to a single recipient.
    pub fn is_private(&self) -> bool {
        self.recipient.is_some()
    }
}
