//! Binlog replication position.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A position in the source's binary log: file name plus byte offset.
///
/// Positions are totally ordered: the file name compares lexicographically
/// (binlog files are numbered, e.g. `mysql-bin.000003`), then the offset
/// numerically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Binlog file name, e.g. `mysql-bin.000002`
    pub name: String,
    /// Byte offset within the file
    pub pos: u32,
}

impl Position {
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// An empty position means "no checkpoint yet"; it triggers the initial
    /// dump on startup.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.pos == 0
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.pos.cmp(&other.pos))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert!(Position::default().is_empty());
        assert!(!Position::new("mysql-bin.000001", 4).is_empty());
    }

    #[test]
    fn test_ordering() {
        let a = Position::new("mysql-bin.000001", 2000);
        let b = Position::new("mysql-bin.000002", 4);
        let c = Position::new("mysql-bin.000002", 120);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(c.cmp(&c), Ordering::Equal);
    }

    #[test]
    fn test_display() {
        let pos = Position::new("mysql-bin.000003", 1234);
        assert_eq!(pos.to_string(), "(mysql-bin.000003, 1234)");
    }
}
