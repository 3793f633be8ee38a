/// Key/value parameter store for external persistence
///
/// Keys are dotted paths built from the currently open structs and list
/// elements, e.g. `RateFree.prop`. Arrays are stored as one comma-separated
/// value. Writing the map to disk is left to the caller (it serializes with
/// serde).

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PhyloError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    entries: BTreeMap<String, String>,
    #[serde(skip)]
    prefix: String,
    #[serde(skip)]
    lists: Vec<(i64, usize)>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn has_key(&self, name: &str) -> bool {
        self.entries.contains_key(&self.key(name))
    }

    pub fn put<T: Display>(&mut self, name: &str, value: T) {
        let key = self.key(name);
        self.entries.insert(key, value.to_string());
    }

    /// `None` when the key is absent
    pub fn get<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        let key = self.key(name);
        match self.entries.get(&key) {
            None => Ok(None),
            Some(text) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| PhyloError::checkpoint(format!("invalid value '{text}' for key {key}"))),
        }
    }

    pub fn put_bool(&mut self, name: &str, value: bool) {
        self.put(name, value);
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        self.get(name)
    }

    pub fn put_array(&mut self, name: &str, values: &[f64]) {
        let text = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        self.put(name, text);
    }

    /// Restores exactly `len` values or fails
    pub fn get_array(&self, name: &str, len: usize) -> Result<Option<Vec<f64>>> {
        let key = self.key(name);
        let Some(text) = self.entries.get(&key) else {
            return Ok(None);
        };
        let values = text
            .split(',')
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .map_err(|_| PhyloError::checkpoint(format!("invalid number '{v}' in key {key}")))
            })
            .collect::<Result<Vec<f64>>>()?;
        if values.len() != len {
            return Err(PhyloError::checkpoint(format!(
                "key {key} holds {} values, expected {len}",
                values.len()
            )));
        }
        Ok(Some(values))
    }

    pub fn start_struct(&mut self, name: &str) {
        self.prefix.push_str(name);
        self.prefix.push('.');
    }

    pub fn end_struct(&mut self) {
        self.pop_component();
    }

    fn pop_component(&mut self) {
        let trimmed = &self.prefix[..self.prefix.len().saturating_sub(1)];
        match trimmed.rfind('.') {
            Some(pos) => self.prefix.truncate(pos + 1),
            None => self.prefix.clear(),
        }
    }

    /// Elements are keyed by zero-padded index wide enough for `n_elements`
    pub fn start_list(&mut self, n_elements: usize) {
        let width = n_elements.saturating_sub(1).max(1).to_string().len();
        self.lists.push((-1, width));
    }

    pub fn add_list_element(&mut self) -> Result<()> {
        let (index, width) = self
            .lists
            .last_mut()
            .ok_or_else(|| PhyloError::checkpoint("add_list_element outside a list"))?;
        *index += 1;
        let (index, width) = (*index, *width);
        if index > 0 {
            self.pop_component();
        }
        self.prefix.push_str(&format!("{index:0width$}."));
        Ok(())
    }

    pub fn end_list(&mut self) -> Result<()> {
        let (index, _) = self
            .lists
            .pop()
            .ok_or_else(|| PhyloError::checkpoint("end_list without start_list"))?;
        if index >= 0 {
            self.pop_component();
        }
        Ok(())
    }

    /// Entries whose key contains `partial_key`
    pub fn sub_checkpoint(&self, partial_key: &str) -> Checkpoint {
        Checkpoint {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| k.contains(partial_key))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            ..Checkpoint::default()
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_struct_keys() {
        let mut ckp = Checkpoint::new();
        ckp.start_struct("Model");
        ckp.start_struct("RateFree");
        ckp.put_array("prop", &[0.25, 0.75]);
        ckp.end_struct();
        ckp.put("name", "+R2");
        ckp.end_struct();
        ckp.put_bool("done", true);

        let keys: Vec<&str> = ckp.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Model.RateFree.prop", "Model.name", "done"]);
        assert_eq!(ckp.get_bool("done").unwrap(), Some(true));
    }

    #[test]
    fn test_array_round_trip_and_length_check() {
        let mut ckp = Checkpoint::new();
        ckp.put_array("rates", &[0.1, 1.0, 2.9]);
        assert_eq!(ckp.get_array("rates", 3).unwrap(), Some(vec![0.1, 1.0, 2.9]));
        assert!(ckp.get_array("rates", 2).is_err());
        assert_eq!(ckp.get_array("missing", 2).unwrap(), None);
    }

    #[test]
    fn test_list_elements_zero_padded() {
        let mut ckp = Checkpoint::new();
        ckp.start_struct("Trees");
        ckp.start_list(12);
        for i in 0..12 {
            ckp.add_list_element().unwrap();
            ckp.put("lh", -(i as f64));
        }
        ckp.end_list().unwrap();
        ckp.end_struct();
        assert!(ckp.sub_checkpoint("Trees.00.").has_key("Trees.00.lh"));
        assert_eq!(ckp.sub_checkpoint("Trees.11.lh").len(), 1);
        assert_eq!(ckp.len(), 12);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut ckp = Checkpoint::new();
        ckp.put("alpha", 0.5);
        let text = serde_json::to_string(&ckp).unwrap();
        let back: Checkpoint = serde_json::from_str(&text).unwrap();
        assert_eq!(back.get::<f64>("alpha").unwrap(), Some(0.5));
    }
}
