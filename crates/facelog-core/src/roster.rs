//! Identity roster: read-only reference data loaded once per session.

use crate::types::Identity;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("roster file not readable: {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("roster is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("roster entry {0} has an empty id")]
    EmptyId(usize),
    #[error("duplicate identity id in roster: {0}")]
    DuplicateId(String),
}

/// Immutable set of enrolled identities, indexed by id.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    identities: Vec<Identity>,
    index: HashMap<String, usize>,
}

impl Roster {
    /// Load a roster from a JSON file: `[{id, displayName, role, imageRefs}]`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| RosterError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let roster = Self::from_json(&raw)?;
        tracing::info!(path = %path.display(), identities = roster.len(), "roster loaded");
        Ok(roster)
    }

    pub fn from_json(raw: &str) -> Result<Self, RosterError> {
        let identities: Vec<Identity> = serde_json::from_str(raw)?;
        Self::from_identities(identities)
    }

    pub fn from_identities(identities: Vec<Identity>) -> Result<Self, RosterError> {
        let mut index = HashMap::with_capacity(identities.len());
        for (i, identity) in identities.iter().enumerate() {
            if identity.id.trim().is_empty() {
                return Err(RosterError::EmptyId(i));
            }
            if index.insert(identity.id.clone(), i).is_some() {
                return Err(RosterError::DuplicateId(identity.id.clone()));
            }
        }
        Ok(Self { identities, index })
    }

    pub fn get(&self, id: &str) -> Option<&Identity> {
        self.index.get(id).map(|&i| &self.identities[i])
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}
