//! Pagination tokens and forward-only result cursors.
//!
//! The document store pages with a skip offset while the key-value store hands out a
//! continuation key. Both are carried by [`StartKey`] and can be exchanged with clients as an
//! opaque token: URL-safe base64 of the JSON envelope `{"key": <offset|object|null>}`.

use crate::{error::Result, item::Item};

use base64::{
    Engine, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig, general_purpose::URL_SAFE},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

const TOKEN_DECODER: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Position a paged read resumes from.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StartKey {
    /// Number of matching items to skip.
    Offset(u64),
    /// Continuation key: storage names to key values in JSON form.
    Key(serde_json::Map<String, serde_json::Value>),
}

impl From<u64> for StartKey {
    fn from(offset: u64) -> Self {
        Self::Offset(offset)
    }
}

/// Optional resume position, convertible to and from an opaque token.
///
/// ```rust
/// use modular_sdk::cursor::{LastEvaluatedKey, StartKey};
///
/// let key = LastEvaluatedKey::new(Some(StartKey::Offset(20)));
/// let token = key.serialize();
/// assert_eq!(LastEvaluatedKey::deserialize(&token), key);
/// assert!(LastEvaluatedKey::deserialize("not a token").is_empty());
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LastEvaluatedKey(Option<StartKey>);

impl LastEvaluatedKey {
    /// Wraps a resume position.
    pub fn new(value: Option<StartKey>) -> Self {
        Self(value)
    }

    /// Resume position, if any.
    pub fn value(&self) -> Option<&StartKey> {
        self.0.as_ref()
    }

    /// Consumes the wrapper into the resume position.
    pub fn into_value(self) -> Option<StartKey> {
        self.0
    }

    /// Whether there is nothing to resume from.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Encodes the position as an opaque token.
    pub fn serialize(&self) -> String {
        URL_SAFE.encode(json!({ "key": &self.0 }).to_string())
    }

    /// Decodes a token produced by [`serialize`](Self::serialize).
    ///
    /// Tokens come from clients. Anything malformed yields an empty position and a warning,
    /// never an error.
    pub fn deserialize(token: &str) -> Self {
        match Self::try_deserialize(token.trim()) {
            Ok(value) => Self(value),
            Err(reason) => {
                tracing::warn!(reason = %reason, "ignoring malformed pagination token");
                Self(None)
            }
        }
    }

    fn try_deserialize(token: &str) -> std::result::Result<Option<StartKey>, String> {
        let bytes = TOKEN_DECODER
            .decode(token)
            .map_err(|error| format!("invalid base64: {error}"))?;
        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|error| format!("invalid envelope: {error}"))?;
        Ok(envelope.key)
    }
}

#[derive(Deserialize)]
struct Envelope {
    key: Option<StartKey>,
}

impl From<Option<StartKey>> for LastEvaluatedKey {
    fn from(value: Option<StartKey>) -> Self {
        Self(value)
    }
}

/// Item stream produced by a backend for a single read.
pub(crate) trait CursorSource {
    fn next_item(&mut self) -> Option<Result<Item>>;

    fn last_evaluated_key(&self) -> Option<StartKey>;
}

/// Forward-only, single-pass cursor over the items of a query or scan.
///
/// Once exhausted it keeps returning `None`. [`last_evaluated_key`](Self::last_evaluated_key)
/// reflects the items consumed so far.
pub struct ResultCursor {
    source: Box<dyn CursorSource>,
    consumed: u64,
    exhausted: bool,
}

impl ResultCursor {
    pub(crate) fn new(source: impl CursorSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            consumed: 0,
            exhausted: false,
        }
    }

    /// Position after the items consumed so far, empty when nothing is left.
    pub fn last_evaluated_key(&self) -> LastEvaluatedKey {
        LastEvaluatedKey(self.source.last_evaluated_key())
    }

    /// Number of items yielded so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl Iterator for ResultCursor {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        match self.source.next_item() {
            Some(item) => {
                self.consumed += 1;
                Some(item)
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

impl std::iter::FusedIterator for ResultCursor {}

impl std::fmt::Debug for ResultCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCursor")
            .field("consumed", &self.consumed)
            .field("exhausted", &self.exhausted)
            .finish_non_exhaustive()
    }
}

/// Skip-based source: more items remain while `skip + consumed < total`.
pub(crate) struct OffsetSource<I> {
    items: I,
    skip: u64,
    total: u64,
    consumed: u64,
}

impl<I: Iterator<Item = Result<Item>>> OffsetSource<I> {
    pub(crate) fn new(items: I, skip: u64, total: u64) -> Self {
        Self {
            items,
            skip,
            total,
            consumed: 0,
        }
    }
}

impl<I: Iterator<Item = Result<Item>>> CursorSource for OffsetSource<I> {
    fn next_item(&mut self) -> Option<Result<Item>> {
        let item = self.items.next()?;
        self.consumed += 1;
        Some(item)
    }

    fn last_evaluated_key(&self) -> Option<StartKey> {
        let position = self.skip.saturating_add(self.consumed);
        (position < self.total).then_some(StartKey::Offset(position))
    }
}
