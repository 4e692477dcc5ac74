//! Shared status buffer: the key/value area carrying observation parameters
//! in and counters out.
//!
//! A single mutex covers every multi-field read or write. The holder must
//! never perform I/O or wait on a ring while locked; all dataflow decisions
//! happen after the guard is dropped. `render_records` produces the
//! 80-character card images that finalize copies into the head of each raw
//! block.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::{Mutex, MutexGuard};

use crate::{STATUS_RECORD_SIZE, STATUS_TOTAL_SIZE};

/// A single status value. Everything the ingest reads or writes is one of
/// these three shapes; numeric strings coming from an operator are accepted
/// by the typed getters.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusValue {
    Int(i64),
    Real(f64),
    Str(String),
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Int(v) => write!(f, "{}", v),
            StatusValue::Real(v) => write!(f, "{}", v),
            StatusValue::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for StatusValue {
    fn from(v: i64) -> Self {
        StatusValue::Int(v)
    }
}

impl From<u64> for StatusValue {
    fn from(v: u64) -> Self {
        StatusValue::Int(v as i64)
    }
}

impl From<u32> for StatusValue {
    fn from(v: u32) -> Self {
        StatusValue::Int(v as i64)
    }
}

impl From<usize> for StatusValue {
    fn from(v: usize) -> Self {
        StatusValue::Int(v as i64)
    }
}

impl From<f64> for StatusValue {
    fn from(v: f64) -> Self {
        StatusValue::Real(v)
    }
}

impl From<&str> for StatusValue {
    fn from(v: &str) -> Self {
        StatusValue::Str(v.to_string())
    }
}

impl From<String> for StatusValue {
    fn from(v: String) -> Self {
        StatusValue::Str(v)
    }
}

/// The shared status area. One per ingest instance; operator control and
/// the ingest loop both go through [`StatusBuffer::lock`].
#[derive(Default)]
pub struct StatusBuffer {
    inner: Mutex<BTreeMap<String, StatusValue>>,
}

impl StatusBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the buffer. Multi-field updates must happen under a single
    /// acquisition so readers see a consistent snapshot.
    pub fn lock(&self) -> StatusGuard<'_> {
        StatusGuard {
            map: self.inner.lock(),
        }
    }
}

/// Guard over the locked status area with typed accessors.
pub struct StatusGuard<'a> {
    map: MutexGuard<'a, BTreeMap<String, StatusValue>>,
}

impl StatusGuard<'_> {
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.map.get(key)? {
            StatusValue::Int(v) => Some(*v),
            StatusValue::Real(v) => Some(*v as i64),
            StatusValue::Str(s) => s.trim().parse().ok(),
        }
    }

    pub fn get_real(&self, key: &str) -> Option<f64> {
        match self.map.get(key)? {
            StatusValue::Int(v) => Some(*v as f64),
            StatusValue::Real(v) => Some(*v),
            StatusValue::Str(s) => s.trim().parse().ok(),
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.map.get(key)? {
            StatusValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<StatusValue>,
    {
        self.map.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<StatusValue> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Consistent copy of the whole area, taken under the held lock.
    pub fn snapshot(&self) -> BTreeMap<String, StatusValue> {
        self.map.clone()
    }

    pub fn render_records(&self) -> Vec<u8> {
        render_records(&self.map)
    }
}

/// Render a status map into `STATUS_TOTAL_SIZE` bytes of 80-character card
/// images, ending with an `END` card. Keys are truncated to eight
/// characters; entries beyond the area's capacity are dropped.
pub fn render_records(map: &BTreeMap<String, StatusValue>) -> Vec<u8> {
    let mut out = Vec::with_capacity(STATUS_TOTAL_SIZE);
    let max_cards = STATUS_TOTAL_SIZE / STATUS_RECORD_SIZE - 1;

    for (key, value) in map.iter().take(max_cards) {
        let key: String = key.chars().take(8).collect();
        let card = match value {
            StatusValue::Str(s) => format!("{:<8}= '{}'", key, s),
            other => format!("{:<8}= {:>20}", key, other.to_string()),
        };
        push_card(&mut out, &card);
    }
    push_card(&mut out, "END");
    out.resize(STATUS_TOTAL_SIZE, b' ');
    out
}

fn push_card(out: &mut Vec<u8>, text: &str) {
    let mut bytes: Vec<u8> = text.bytes().take(STATUS_RECORD_SIZE).collect();
    bytes.resize(STATUS_RECORD_SIZE, b' ');
    out.extend_from_slice(&bytes);
}

/// Locate `key` in a rendered record area and return its trimmed value
/// text. Intended for consumers inspecting finalized block headers.
pub fn find_record(rendered: &[u8], key: &str) -> Option<String> {
    for card in rendered.chunks(STATUS_RECORD_SIZE) {
        let text = String::from_utf8_lossy(card);
        if text.starts_with("END ") || text.trim() == "END" {
            return None;
        }
        let Some((k, v)) = text.split_once('=') else {
            continue;
        };
        if k.trim() == key {
            return Some(v.trim().trim_matches('\'').to_string());
        }
    }
    None
}
