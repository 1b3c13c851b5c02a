use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a managed node (a row in the node store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The server's own node. Tasks for it run in-process instead of over a connection.
    pub const SERVER: NodeId = NodeId(1);

    pub fn is_server_self(self) -> bool {
        self == Self::SERVER
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(NodeId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_self_predicate() {
        assert!(NodeId(1).is_server_self());
        assert!(!NodeId(2).is_server_self());
        assert_eq!("7".parse::<NodeId>().unwrap(), NodeId(7));
        assert!("abc".parse::<NodeId>().is_err());
    }
}
