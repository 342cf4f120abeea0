//! Key layout in the coordination store
//!
//! presence: `<presence>/<vip>/<local_addr>` -> decimal priority, lease attached
//! availability: `<availability>/<local_addr>` -> timestamp, no lease
use std::fmt::Display;

use config::Prefixes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    presence: String,
    availability: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::from(&Prefixes::default())
    }
}

impl From<&Prefixes> for KeyLayout {
    fn from(prefixes: &Prefixes) -> Self {
        Self::new(&prefixes.presence, &prefixes.availability)
    }
}

fn dir(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_owned()
    } else {
        format!("{prefix}/")
    }
}

impl KeyLayout {
    pub fn new(presence: &str, availability: &str) -> Self {
        Self {
            presence: dir(presence),
            availability: dir(availability),
        }
    }

    /// Prefix holding every node's entry for `vip`. Ends in `/` so that
    /// `10.0.0.1` never matches entries of `10.0.0.10`.
    pub fn vip_prefix(&self, vip: impl Display) -> String {
        format!("{}{}/", self.presence, vip)
    }

    pub fn presence_key(&self, vip: impl Display, local_addr: impl Display) -> String {
        format!("{}{}/{}", self.presence, vip, local_addr)
    }

    pub fn availability_prefix(&self) -> &str {
        &self.availability
    }

    pub fn availability_key(&self, local_addr: impl Display) -> String {
        format!("{}{}", self.availability, local_addr)
    }
}
