//! Ordered, unique-by-name property pairs for create/update request bodies.

use std::fmt;

use crate::codec::WireValue;

/// One `name=value` pair, value already in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPair {
    pub name: String,
    pub value: String,
}

impl PropertyPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for PropertyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// Insertion-ordered property list. Adding an existing name overwrites its
/// value in place.
///
/// Lists are small (tens of entries), so uniqueness is a linear scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyList {
    pairs: Vec<PropertyPair>,
}

impl PropertyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A list holding a single pair. An absent value (`None` date) yields an
    /// empty list.
    pub fn with<V: WireValue>(name: &str, value: V) -> Self {
        let mut list = Self::new();
        list.add(name, value);
        list
    }

    /// Encode `value` and store it under `name`. Values that encode to
    /// nothing (an absent date) leave the list untouched.
    pub fn add<V: WireValue>(&mut self, name: &str, value: V) -> &mut Self {
        let Some(encoded) = value.to_wire() else {
            return self;
        };
        match self.pairs.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = encoded,
            None => self.pairs.push(PropertyPair::new(name, encoded)),
        }
        self
    }

    /// True when `name` is present and holds the wire form of `value`.
    pub fn value_exists<V: WireValue>(&self, name: &str, value: V) -> bool {
        let Some(encoded) = value.to_wire() else {
            return false;
        };
        self.get(name).is_some_and(|v| v == encoded)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyPair> {
        let index = self.pairs.iter().position(|p| p.name == name)?;
        Some(self.pairs.remove(index))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PropertyPair> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// `name=value` strings in insertion order, for query clauses.
    pub fn to_wire_array(&self) -> Vec<String> {
        self.pairs
            .iter()
            .map(|p| format!("{}={}", p.name, p.value))
            .collect()
    }
}

impl<'a> IntoIterator for &'a PropertyList {
    type Item = &'a PropertyPair;
    type IntoIter = std::slice::Iter<'a, PropertyPair>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.iter()
    }
}

/// Multi-line `name:value` dump for logs; `{empty}` when there is nothing.
impl fmt::Display for PropertyList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pairs.is_empty() {
            return f.write_str("{empty}");
        }
        for (i, pair) in self.pairs.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{pair}")?;
        }
        Ok(())
    }
}
