use std::fmt;
use std::hash::{Hash, Hasher};

/// Character name a connection is bound to. Equality and hashing ignore
/// case; `as_str` keeps the casing the token carried.
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    key: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let key = fold_case(&name);
        Self { name, key }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }
}

/// Per-character uppercase fold. Characters whose uppercase form is longer
/// than one character (such as `ß`) are kept as they are.
fn fold_case(name: &str) -> String {
    name.chars()
        .map(|ch| {
            let mut upper = ch.to_uppercase();
            match (upper.next(), upper.next()) {
                (Some(single), None) => single,
                _ => ch,
            }
        })
        .collect()
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
