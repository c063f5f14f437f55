use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// MIME type of every entry payload the delivery path understands
pub const MESSAGE_RFC822: &str = "message/rfc822";

/// Name of the child node holding an entry's payload
pub const CONTENT_NODE: &str = "content";

/// Identifier of a spooled entry
///
/// Either supplied by the producer or generated as a ULID. The identifier is
/// used verbatim as a path segment in the store, so it must be non-empty, may
/// not contain `/` (or `\`), and may not be `.` or `..`.
///
/// Identifiers starting with `.` are valid but hidden: the store keeps them
/// and the delivery queue never looks at them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    /// Validate and wrap a caller supplied identifier
    ///
    /// # Errors
    /// If the identifier is empty, contains a path separator or is a
    /// relative path component
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(ValidationError::InvalidId {
                id,
                reason: "must not be empty",
            });
        }

        if id.contains('/') || id.contains('\\') {
            return Err(ValidationError::InvalidId {
                id,
                reason: "must not contain a path separator",
            });
        }

        if id == "." || id == ".." {
            return Err(ValidationError::InvalidId {
                id,
                reason: "must not be a relative path component",
            });
        }

        Ok(Self(id))
    }

    /// Generate a new unique identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hidden entries are stored but never delivered
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.0.starts_with('.')
    }
}

impl TryFrom<String> for EntryId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntryId> for String {
    fn from(value: EntryId) -> Self {
        value.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Absolute, normalised path of a spool folder, e.g. `/var/spool/queue/mail`
///
/// Trailing slashes are dropped on construction, so `/var/spool/queue/mail/`
/// and `/var/spool/queue/mail` name the same folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SpoolPath(String);

impl SpoolPath {
    /// # Errors
    /// If the path is relative, is the root itself, or contains empty,
    /// `.` or `..` segments
    pub fn new(path: impl AsRef<str>) -> Result<Self, ValidationError> {
        let raw = path.as_ref();
        let invalid = |reason| ValidationError::InvalidPath {
            path: raw.to_string(),
            reason,
        };

        let Some(rest) = raw.strip_prefix('/') else {
            return Err(invalid("must be absolute"));
        };

        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(invalid("must name a folder below the root"));
        }

        for segment in rest.split('/') {
            match segment {
                "" => return Err(invalid("must not contain empty segments")),
                "." | ".." => return Err(invalid("must not contain relative segments")),
                _ if segment.contains('\\') => {
                    return Err(invalid("must not contain a backslash"));
                }
                _ => {}
            }
        }

        Ok(Self(format!("/{rest}")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments below the root
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').skip(1)
    }

    /// Reference to the entry `id` in this folder
    #[must_use]
    pub fn entry(&self, id: EntryId) -> EntryRef {
        EntryRef {
            folder: self.clone(),
            id,
        }
    }
}

impl Default for SpoolPath {
    fn default() -> Self {
        Self(String::from("/var/spool/queue/mail"))
    }
}

impl TryFrom<String> for SpoolPath {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SpoolPath> for String {
    fn from(value: SpoolPath) -> Self {
        value.0
    }
}

impl fmt::Display for SpoolPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of node a change notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// The entry node itself, carrying the retry metadata
    Entry,
    /// The payload-bearing child of an entry
    Content,
}

/// Who caused a change to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Application code spooling a message
    Producer,
    /// The delivery queue's own bookkeeping
    Queue,
    /// An operator or client acting on a queued entry
    Client,
    /// A process outside this one touching the backing storage directly
    External,
}

/// Location of an entry: its folder plus its identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryRef {
    pub folder: SpoolPath,
    pub id: EntryId,
}

impl EntryRef {
    /// Store path of the entry node
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}/{}", self.folder, self.id)
    }

    /// Store path of the entry's content child
    #[must_use]
    pub fn content_path(&self) -> String {
        format!("{}/{}/{CONTENT_NODE}", self.folder, self.id)
    }

    /// Resolve a store path below `folder` back into the entry it belongs to
    ///
    /// Accepts `{folder}/{id}` (an entry node) and `{folder}/{id}/content`
    /// (its content child).
    ///
    /// # Errors
    /// If the path is outside `folder`, has an unexpected shape or carries an
    /// invalid identifier
    pub fn parse_node(folder: &SpoolPath, path: &str) -> Result<(Self, NodeKind), ValidationError> {
        let invalid = |reason| ValidationError::InvalidPath {
            path: path.to_string(),
            reason,
        };

        let relative = path
            .strip_prefix(folder.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| invalid("not below the spool folder"))?;

        let mut parts = relative.split('/');
        let id = parts.next().ok_or_else(|| invalid("missing entry id"))?;
        let node = match (parts.next(), parts.next()) {
            (None, _) => NodeKind::Entry,
            (Some(CONTENT_NODE), None) => NodeKind::Content,
            _ => return Err(invalid("not an entry or content node")),
        };

        Ok((folder.entry(EntryId::new(id)?), node))
    }
}

impl fmt::Display for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.folder, self.id)
    }
}
