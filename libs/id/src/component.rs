//! Component uuid announced on the bus.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::IdError;

/// Process-unique component identity.
///
/// Rendered as the simple (dash-less) uuid form, prefixed with the agent
/// index when one is configured.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentUuid {
    index: Option<u32>,
    uuid: Uuid,
}

impl ComponentUuid {
    /// Generates a fresh uuid, optionally bound to an agent index.
    #[must_use]
    pub fn generate(index: Option<u32>) -> Self {
        Self {
            index,
            uuid: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn index(&self) -> Option<u32> {
        self.index
    }
}

impl fmt::Display for ComponentUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}-{}", index, self.uuid.simple()),
            None => write!(f, "{}", self.uuid.simple()),
        }
    }
}

impl FromStr for ComponentUuid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let (index, hex) = match s.split_once('-') {
            Some((index, hex)) => {
                let index = index
                    .parse::<u32>()
                    .map_err(|_| IdError::InvalidUuid(s.to_string()))?;
                (Some(index), hex)
            }
            None => (None, s),
        };

        if hex.len() != 32 {
            return Err(IdError::InvalidUuid(s.to_string()));
        }

        let uuid = Uuid::try_parse(hex).map_err(|_| IdError::InvalidUuid(s.to_string()))?;
        Ok(Self { index, uuid })
    }
}

impl Serialize for ComponentUuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ComponentUuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
