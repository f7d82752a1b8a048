//! Side-channel key/value data that travels alongside a call's payload.
//!
//! The same container is used for request metadata, response headers and response trailers.

use std::{borrow::Cow, fmt};

use chrono::Local;
use faststr::FastStr;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use linked_hash_map::LinkedHashMap;
use thiserror::Error;

/// Carried in request metadata, response headers and response trailers, each time with a fresh
/// value taken at the point of sending.
pub const TIMESTAMP_KEY: &str = "timestamp";
/// Static service-location tag, carried only in response headers.
pub const LOCATION_KEY: &str = "location";
pub const DEFAULT_LOCATION: &str = "MTV";

/// Month, day and time of day with nanoseconds, e.g. `Jan  2 15:04:05.000000000`.
pub const TIMESTAMP_FORMAT: &str = "%b %e %H:%M:%S%.9f";

/// Returns the current local time formatted with [`TIMESTAMP_FORMAT`].
pub fn timestamp() -> FastStr {
    FastStr::from(Local::now().format(TIMESTAMP_FORMAT).to_string())
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata key `{0}` not found")]
    NotFound(FastStr),
    #[error("invalid metadata key `{0}`")]
    InvalidKey(FastStr),
    #[error("invalid value for metadata key `{0}`")]
    InvalidValue(FastStr),
}

/// An ordered multi-map from case-insensitive keys to lists of values.
///
/// Keys are stored lower-cased and iterate in insertion order; values under one key keep the
/// order they were added in. A key never maps to an empty list: looking up a key that was never
/// set (or whose values were cleared) yields `None`.
///
/// ```
/// # use echo_meta::metadata::MetadataMap;
/// let mut md = MetadataMap::new();
/// md.append("Timestamp", "a");
/// md.append("timestamp", "b");
///
/// let values: Vec<&str> = md.get("TIMESTAMP").unwrap().iter().map(|v| v.as_str()).collect();
/// assert_eq!(values, ["a", "b"]);
/// assert!(md.get("location").is_none());
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MetadataMap {
    entries: LinkedHashMap<FastStr, Vec<FastStr>>,
}

fn normalize(key: &str) -> Cow<'_, str> {
    if key.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(key.to_ascii_lowercase())
    } else {
        Cow::Borrowed(key)
    }
}

fn owned_key(key: impl Into<FastStr>) -> FastStr {
    let key = key.into();
    if key.bytes().any(|b| b.is_ascii_uppercase()) {
        FastStr::from(key.to_ascii_lowercase())
    } else {
        key
    }
}

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a container from `(key, value)` pairs, appending in order.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<FastStr>,
        V: Into<FastStr>,
    {
        pairs.into_iter().collect()
    }

    /// Replaces all values stored under `key`.
    ///
    /// Passing no values removes the key.
    pub fn set<K, V, I>(&mut self, key: K, values: I)
    where
        K: Into<FastStr>,
        V: Into<FastStr>,
        I: IntoIterator<Item = V>,
    {
        let key = owned_key(key);
        let values: Vec<FastStr> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            self.entries.remove(&key);
            return;
        }
        match self.entries.get_mut(&key) {
            Some(existing) => *existing = values,
            None => {
                self.entries.insert(key, values);
            }
        }
    }

    /// Adds one value after any existing values for `key`.
    pub fn append(&mut self, key: impl Into<FastStr>, value: impl Into<FastStr>) {
        let key = owned_key(key);
        let value = value.into();
        match self.entries.get_mut(&key) {
            Some(values) => values.push(value),
            None => {
                self.entries.insert(key, vec![value]);
            }
        }
    }

    /// Returns every value stored under `key` in insertion order.
    pub fn get(&self, key: &str) -> Option<&[FastStr]> {
        self.entries.get(normalize(key).as_ref()).map(Vec::as_slice)
    }

    /// Like [`MetadataMap::get`], but reports an absent key as an error.
    pub fn require(&self, key: &str) -> Result<&[FastStr], MetadataError> {
        self.get(key)
            .ok_or_else(|| MetadataError::NotFound(FastStr::new(normalize(key))))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(normalize(key).as_ref())
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<FastStr>> {
        self.entries.remove(normalize(key).as_ref())
    }

    /// Appends the values of every key in `other` after the values already present here.
    pub fn merge(&mut self, other: MetadataMap) {
        for (key, values) in other.entries {
            match self.entries.get_mut(&key) {
                Some(existing) => existing.extend(values),
                None => {
                    self.entries.insert(key, values);
                }
            }
        }
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(FastStr::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[FastStr])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Reads every header as one metadata value. Non-visible-ASCII values are rejected.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, MetadataError> {
        let mut md = MetadataMap::new();
        for (name, value) in headers {
            let value = value
                .to_str()
                .map_err(|_| MetadataError::InvalidValue(FastStr::new(name.as_str())))?;
            md.append(FastStr::new(name.as_str()), FastStr::new(value));
        }
        Ok(md)
    }

    /// Writes the container as HTTP headers, one header line per value.
    pub fn to_headers(&self) -> Result<HeaderMap, MetadataError> {
        let mut headers = HeaderMap::with_capacity(self.len());
        for (key, values) in self.iter() {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| MetadataError::InvalidKey(FastStr::new(key)))?;
            for value in values {
                let value = HeaderValue::from_str(value)
                    .map_err(|_| MetadataError::InvalidValue(FastStr::new(key)))?;
                headers.append(name.clone(), value);
            }
        }
        Ok(headers)
    }
}

impl<K, V> FromIterator<(K, V)> for MetadataMap
where
    K: Into<FastStr>,
    V: Into<FastStr>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = MetadataMap::new();
        md.extend(iter);
        md
    }
}

impl<K, V> Extend<(K, V)> for MetadataMap
where
    K: Into<FastStr>,
    V: Into<FastStr>,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.append(k, v);
        }
    }
}

impl fmt::Debug for MetadataMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
