use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SessionTokenError;

/// Read consistency guarantees, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    Session,
    ConsistentPrefix,
    Eventual,
}

impl ConsistencyLevel {
    /// Value of the `x-ms-consistency-level` header.
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ConsistencyLevel::Strong => "Strong",
            ConsistencyLevel::BoundedStaleness => "BoundedStaleness",
            ConsistencyLevel::Session => "Session",
            ConsistencyLevel::ConsistentPrefix => "ConsistentPrefix",
            ConsistencyLevel::Eventual => "Eventual",
        }
    }

    fn strength(&self) -> u8 {
        match self {
            ConsistencyLevel::Strong => 4,
            ConsistencyLevel::BoundedStaleness => 3,
            ConsistencyLevel::Session => 2,
            ConsistencyLevel::ConsistentPrefix => 1,
            ConsistencyLevel::Eventual => 0,
        }
    }

    pub fn is_stronger_than(&self, other: ConsistencyLevel) -> bool {
        self.strength() > other.strength()
    }

    /// The level a request runs at: the requested override when present, the account default
    /// otherwise. An override may only relax the account default.
    pub fn effective(
        account_default: ConsistencyLevel,
        requested: Option<ConsistencyLevel>,
    ) -> Result<ConsistencyLevel, ConsistencyViolation> {
        match requested {
            Some(requested) if requested.is_stronger_than(account_default) => {
                Err(ConsistencyViolation {
                    requested,
                    account_default,
                })
            }
            Some(requested) => Ok(requested),
            None => Ok(account_default),
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_header_value())
    }
}

impl FromStr for ConsistencyLevel {
    type Err = SessionTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strong" => Ok(ConsistencyLevel::Strong),
            "boundedstaleness" | "bounded_staleness" => Ok(ConsistencyLevel::BoundedStaleness),
            "session" => Ok(ConsistencyLevel::Session),
            "consistentprefix" | "consistent_prefix" => Ok(ConsistencyLevel::ConsistentPrefix),
            "eventual" => Ok(ConsistencyLevel::Eventual),
            _ => Err(SessionTokenError::UnknownConsistencyLevel(s.to_owned())),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error(
    "requested consistency level {requested} is stronger than the account default {account_default}"
)]
pub struct ConsistencyViolation {
    pub requested: ConsistencyLevel,
    pub account_default: ConsistencyLevel,
}
