// src/core/protocol/props.rs

//! The `KEY=VALUE` property mapping carried by every command line and by
//! session configurations.

use crate::core::SamError;
use std::collections::BTreeMap;
use std::str::FromStr;

/// An ordered property mapping. Keys are case-sensitive, as on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Props(BTreeMap<String, String>);

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the value for `key`, or a `MissingProperty` error.
    pub fn require(&self, key: &'static str) -> Result<&str, SamError> {
        match self.get(key) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(SamError::MissingProperty(key)),
        }
    }

    /// Parses the value for `key` if present.
    pub fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, SamError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| SamError::InvalidValue {
                    key,
                    value: raw.to_string(),
                }),
        }
    }

    /// `true` only for a case-insensitive `true` value.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Returns a mapping holding `defaults` overlaid with `self`.
    pub fn layered_over(&self, defaults: &Props) -> Props {
        let mut merged = defaults.clone();
        for (k, v) in self.iter() {
            merged.insert(k, v);
        }
        merged
    }

    /// Returns a copy without the keys in `excluded`.
    pub fn without(&self, excluded: &[&str]) -> Props {
        Props(
            self.0
                .iter()
                .filter(|(k, _)| !excluded.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(String, String)> for Props {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Props(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, String>> for Props {
    fn from(map: BTreeMap<String, String>) -> Self {
        Props(map)
    }
}
