//! Aggregate shape classification.
//!
//! A guest table is an array iff its keys are exactly the integers `1..=n`.
//! Anything else (gaps, zero, negatives, duplicates, named keys) is an
//! object. The empty key set is an object; empty arrays are tagged by the
//! converter so that they survive a round trip.

/// A key as seen by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// An integral key (including integral floats).
    Index(i64),
    /// Any non-integral key.
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Contiguous `1..=len`.
    Array(usize),
    Object,
}

/// Classify a key set. Pure, single pass plus a bitmap check.
pub fn classify_keys<I>(keys: I) -> Shape
where
    I: IntoIterator<Item = KeyKind>,
{
    let mut indices = Vec::new();
    for key in keys {
        match key {
            KeyKind::Index(i) if i >= 1 => indices.push(i),
            _ => return Shape::Object,
        }
    }
    if indices.is_empty() {
        return Shape::Object;
    }

    let len = indices.len();
    let mut seen = vec![false; len];
    for i in indices {
        let slot = match usize::try_from(i) {
            Ok(n) if n <= len => n - 1,
            _ => return Shape::Object,
        };
        if seen[slot] {
            return Shape::Object;
        }
        seen[slot] = true;
    }
    Shape::Array(len)
}
