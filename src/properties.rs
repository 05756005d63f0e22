//! Creation property lists and query parameters.
//!
//! Semaphores are configured with an ordered sequence of `u64` words:
//! `(key, value)` pairs terminated by a zero sentinel. Two keys carry
//! variable-length sublists that are themselves terminated by a zero word.
//! The engine parses the words into a typed [`SemaphoreConfig`] for
//! validation, but also snapshots the raw words bit-for-bit so the
//! `Properties` query can round-trip exactly what the caller supplied.
//!
//! # Wire Layout
//!
//! ```text
//! [ PROP_TYPE, TYPE_BINARY,
//!   PROP_DEVICE_HANDLE_LIST, dev, dev, ..., 0,
//!   PROP_EXPORT_HANDLE_TYPES, HANDLE_TYPE_SYNC_FD, ..., 0,
//!   0 ]                                  <- list terminator, part of snapshot
//! ```
//!
//! An import list replaces the export sublist with a single
//! `(PROP_IMPORT_SYNC_FD, fd)` pair. Export and import keys in the same
//! list conflict and are rejected.

use crate::error::SemError;

// ----------------------------------------------------------------------------
// Property keys and well-known values
// ----------------------------------------------------------------------------

/// Terminates the property list and every embedded sublist.
pub const PROP_LIST_END: u64 = 0;
/// Key: semaphore kind. Mandatory. Value is a `SemaphoreType` word.
pub const PROP_TYPE: u64 = 0x1;
/// Key: restrict validity to the listed devices. Sublist, zero-terminated.
pub const PROP_DEVICE_HANDLE_LIST: u64 = 0x2;
/// Key: handle kinds this semaphore may be exported as. Sublist,
/// zero-terminated.
pub const PROP_EXPORT_HANDLE_TYPES: u64 = 0x3;
/// Key: construct the semaphore from a previously exported sync fd.
/// Value is the fd.
pub const PROP_IMPORT_SYNC_FD: u64 = 0x4;

/// Value for `PROP_TYPE`: binary (signaled/unsignaled) semaphore.
pub const TYPE_BINARY: u64 = 0x1;
/// Value for `PROP_EXPORT_HANDLE_TYPES`: OS-level sync fd.
pub const HANDLE_TYPE_SYNC_FD: u64 = 0x10;

/// Semaphore kind. Only binary semaphores exist today.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemaphoreType {
    Binary,
}

impl SemaphoreType {
    /// Wire word for this kind.
    #[inline]
    pub fn as_word(self) -> u64 {
        match self {
            Self::Binary => TYPE_BINARY,
        }
    }

    fn from_word(word: u64) -> Result<Self, SemError> {
        match word {
            TYPE_BINARY => Ok(Self::Binary),
            other => Err(SemError::invalid_property(format!(
                "unsupported semaphore type {other:#x}"
            ))),
        }
    }
}

/// External handle kind a semaphore can be exported as or imported from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleType {
    SyncFd,
}

impl HandleType {
    /// Wire word for this handle kind.
    #[inline]
    pub fn as_word(self) -> u64 {
        match self {
            Self::SyncFd => HANDLE_TYPE_SYNC_FD,
        }
    }

    fn from_word(word: u64) -> Result<Self, SemError> {
        match word {
            HANDLE_TYPE_SYNC_FD => Ok(Self::SyncFd),
            other => Err(SemError::invalid_property(format!(
                "unknown handle type {other:#x}"
            ))),
        }
    }
}

// ----------------------------------------------------------------------------
// Verbatim snapshot
// ----------------------------------------------------------------------------

/// Bit-for-bit copy of the creation property words, including the trailing
/// zero terminator.
///
/// The `Properties` query must return exactly the bytes the caller passed at
/// creation, so this type never normalizes or reorders anything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyList {
    words: Box<[u64]>,
}

impl PropertyList {
    pub(crate) fn from_words(words: &[u64]) -> Self {
        Self {
            words: words.into(),
        }
    }

    /// Raw words, terminator included.
    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Natural byte size of the `Properties` query result.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.words.len() * std::mem::size_of::<u64>()
    }

    /// Little-endian byte image of the words.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for w in self.words.iter() {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }
}

// ----------------------------------------------------------------------------
// Parsed configuration
// ----------------------------------------------------------------------------

/// Typed view of a validated property list.
#[derive(Debug)]
pub(crate) struct SemaphoreConfig {
    pub sem_type: SemaphoreType,
    /// Raw device words, in list order. Empty means "all devices in context".
    pub device_words: Vec<u64>,
    pub export_types: Vec<HandleType>,
    /// Raw fd word from `PROP_IMPORT_SYNC_FD`, if present.
    pub import_fd: Option<u64>,
}

/// Parses and validates a zero-terminated property list.
///
/// Rejected inputs (`InvalidProperty`): missing terminator, trailing words
/// after the terminator, unknown keys, duplicate keys, a missing or
/// non-binary type, and export types combined with an import handle.
pub(crate) fn parse(words: &[u64]) -> Result<SemaphoreConfig, SemError> {
    let mut sem_type = None;
    let mut device_words = None;
    let mut export_types: Option<Vec<HandleType>> = None;
    let mut import_fd = None;

    let mut i = 0;
    loop {
        let Some(&key) = words.get(i) else {
            return Err(SemError::invalid_property("missing list terminator"));
        };
        if key == PROP_LIST_END {
            if i + 1 != words.len() {
                return Err(SemError::invalid_property("words after list terminator"));
            }
            break;
        }
        i += 1;
        match key {
            PROP_TYPE => {
                let Some(&value) = words.get(i) else {
                    return Err(SemError::invalid_property("type key without value"));
                };
                i += 1;
                if sem_type.replace(SemaphoreType::from_word(value)?).is_some() {
                    return Err(SemError::invalid_property("duplicate type key"));
                }
            }
            PROP_DEVICE_HANDLE_LIST => {
                let (list, next) = read_sublist(words, i, "device handle list")?;
                i = next;
                if device_words.replace(list).is_some() {
                    return Err(SemError::invalid_property("duplicate device handle list"));
                }
            }
            PROP_EXPORT_HANDLE_TYPES => {
                let (list, next) = read_sublist(words, i, "export handle type list")?;
                i = next;
                let types = list
                    .into_iter()
                    .map(HandleType::from_word)
                    .collect::<Result<Vec<_>, _>>()?;
                if export_types.replace(types).is_some() {
                    return Err(SemError::invalid_property("duplicate export type list"));
                }
            }
            PROP_IMPORT_SYNC_FD => {
                let Some(&value) = words.get(i) else {
                    return Err(SemError::invalid_property("import key without value"));
                };
                i += 1;
                if import_fd.replace(value).is_some() {
                    return Err(SemError::invalid_property("duplicate import handle"));
                }
            }
            other => {
                return Err(SemError::invalid_property(format!(
                    "unknown property key {other:#x}"
                )));
            }
        }
    }

    let Some(sem_type) = sem_type else {
        return Err(SemError::invalid_property("missing semaphore type"));
    };
    let export_types = export_types.unwrap_or_default();
    if !export_types.is_empty() && import_fd.is_some() {
        return Err(SemError::invalid_property(
            "export handle types conflict with an import handle",
        ));
    }

    Ok(SemaphoreConfig {
        sem_type,
        device_words: device_words.unwrap_or_default(),
        export_types,
        import_fd,
    })
}

/// Reads a zero-terminated sublist starting at `start`; returns the values
/// and the index just past the sublist terminator.
fn read_sublist(
    words: &[u64],
    start: usize,
    what: &str,
) -> Result<(Vec<u64>, usize), SemError> {
    let mut values = Vec::new();
    let mut i = start;
    loop {
        let Some(&w) = words.get(i) else {
            return Err(SemError::invalid_property(format!(
                "{what} missing its terminator"
            )));
        };
        i += 1;
        if w == PROP_LIST_END {
            return Ok((values, i));
        }
        values.push(w);
    }
}

// ----------------------------------------------------------------------------
// Query parameters
// ----------------------------------------------------------------------------

/// Introspection parameters for [`crate::Semaphore::query_into`].
///
/// Every parameter has a natural byte size; scalar parameters are fixed-size
/// little-endian words, array parameters are the exact byte image of the
/// stored list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemaphoreQuery {
    /// Semaphore kind as a `u64` word.
    Type,
    /// Owning context id as a `u64` word.
    Context,
    /// Live reference count as a `u32`.
    ReferenceCount,
    /// Device list words, byte-for-byte.
    DeviceHandleList,
    /// Creation property words, byte-for-byte.
    Properties,
    /// Current payload (0 or 1) as a `u64` word.
    Payload,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_props() -> Vec<u64> {
        vec![PROP_TYPE, TYPE_BINARY, PROP_LIST_END]
    }

    #[test]
    fn parses_minimal_binary_list() {
        let cfg = parse(&binary_props()).unwrap();
        assert_eq!(cfg.sem_type, SemaphoreType::Binary);
        assert!(cfg.device_words.is_empty());
        assert!(cfg.export_types.is_empty());
        assert!(cfg.import_fd.is_none());
    }

    #[test]
    fn parses_device_and_export_sublists() {
        let words = [
            PROP_TYPE,
            TYPE_BINARY,
            PROP_DEVICE_HANDLE_LIST,
            7,
            9,
            PROP_LIST_END,
            PROP_EXPORT_HANDLE_TYPES,
            HANDLE_TYPE_SYNC_FD,
            PROP_LIST_END,
            PROP_LIST_END,
        ];
        let cfg = parse(&words).unwrap();
        assert_eq!(cfg.device_words, vec![7, 9]);
        assert_eq!(cfg.export_types, vec![HandleType::SyncFd]);
    }

    #[test]
    fn rejects_missing_type() {
        let err = parse(&[PROP_LIST_END]).unwrap_err();
        assert!(matches!(err, SemError::InvalidProperty { .. }));
    }

    #[test]
    fn rejects_unknown_key() {
        let err = parse(&[PROP_TYPE, TYPE_BINARY, 0xdead, 1, PROP_LIST_END]).unwrap_err();
        assert!(matches!(err, SemError::InvalidProperty { .. }));
    }

    #[test]
    fn rejects_duplicate_type() {
        let words = [PROP_TYPE, TYPE_BINARY, PROP_TYPE, TYPE_BINARY, PROP_LIST_END];
        assert!(parse(&words).is_err());
    }

    #[test]
    fn rejects_missing_terminator() {
        let err = parse(&[PROP_TYPE, TYPE_BINARY]).unwrap_err();
        assert!(matches!(err, SemError::InvalidProperty { .. }));
    }

    #[test]
    fn rejects_unterminated_sublist() {
        let err = parse(&[PROP_TYPE, TYPE_BINARY, PROP_DEVICE_HANDLE_LIST, 3]).unwrap_err();
        assert!(matches!(err, SemError::InvalidProperty { .. }));
    }

    #[test]
    fn rejects_export_import_conflict() {
        let words = [
            PROP_TYPE,
            TYPE_BINARY,
            PROP_EXPORT_HANDLE_TYPES,
            HANDLE_TYPE_SYNC_FD,
            PROP_LIST_END,
            PROP_IMPORT_SYNC_FD,
            5,
            PROP_LIST_END,
        ];
        let err = parse(&words).unwrap_err();
        assert!(matches!(err, SemError::InvalidProperty { .. }));
    }

    #[test]
    fn snapshot_preserves_words_and_bytes() {
        let words = [
            PROP_TYPE,
            TYPE_BINARY,
            PROP_DEVICE_HANDLE_LIST,
            0xfeed_beef,
            PROP_LIST_END,
            PROP_LIST_END,
        ];
        let snap = PropertyList::from_words(&words);
        assert_eq!(snap.words(), &words);
        assert_eq!(snap.byte_len(), words.len() * 8);

        let bytes = snap.to_bytes();
        assert_eq!(bytes.len(), snap.byte_len());
        assert_eq!(&bytes[24..32], &0xfeed_beef_u64.to_le_bytes());
    }
}
