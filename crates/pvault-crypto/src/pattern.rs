//! Unlock patterns: ordered node sequences on an N x N grid
//!
//! A direction change is a change in the reduced (row, col) step between
//! consecutive segments. `[0,6,12,18,24,20]` is four diagonal steps then one
//! step left: one change. `[4,8,12,16,20,24]` likewise has one. The default
//! minimum is 1 so that both are accepted; raising it to 2 rejects them.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::PatternError;

/// Domain tag prefixed to the KDF input so pattern bytes never collide with
/// phrase bytes.
const PATTERN_DOMAIN: &[u8] = b"pvault-pattern-v1";

/// Acceptance rules for a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternRules {
    pub grid_size: u8,
    pub min_nodes: usize,
    pub min_direction_changes: usize,
}

impl Default for PatternRules {
    fn default() -> Self {
        Self {
            grid_size: 5,
            min_nodes: 6,
            min_direction_changes: 1,
        }
    }
}

impl From<&pvault_core::config::PatternConfig> for PatternRules {
    fn from(cfg: &pvault_core::config::PatternConfig) -> Self {
        Self {
            grid_size: cfg.grid_size,
            min_nodes: cfg.min_nodes,
            min_direction_changes: cfg.min_direction_changes,
        }
    }
}

/// An ordered sequence of grid-node indices (`row * grid_size + col`).
///
/// Secret material: zeroized on drop and redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Pattern {
    grid_size: u8,
    nodes: Vec<u8>,
}

impl Pattern {
    pub fn new(grid_size: u8, nodes: Vec<u8>) -> Self {
        Self { grid_size, nodes }
    }

    /// Parse `"0,6,12,18,24,20"` (commas and/or whitespace).
    pub fn parse(grid_size: u8, input: &str) -> Result<Self, PatternError> {
        let nodes = input
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<u8>()
                    .map_err(|_| PatternError::Parse(format!("'{s}' is not a node index")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(grid_size, nodes))
    }

    pub fn grid_size(&self) -> u8 {
        self.grid_size
    }

    pub fn nodes(&self) -> &[u8] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check the pattern against `rules`. Must pass before any key derivation.
    pub fn validate(&self, rules: &PatternRules) -> Result<(), PatternError> {
        let grid = self.grid_size;
        if !(2..=15).contains(&grid) || grid != rules.grid_size {
            return Err(PatternError::BadGrid(grid));
        }
        let cells = u16::from(grid) * u16::from(grid);

        let mut seen = vec![false; cells as usize];
        for &node in &self.nodes {
            if u16::from(node) >= cells {
                return Err(PatternError::OutOfRange { node, grid });
            }
            if std::mem::replace(&mut seen[node as usize], true) {
                return Err(PatternError::DuplicateNode(node));
            }
        }

        if self.nodes.len() < rules.min_nodes {
            return Err(PatternError::TooShort {
                got: self.nodes.len(),
                min: rules.min_nodes,
            });
        }

        let changes = self.direction_changes();
        if changes < rules.min_direction_changes {
            return Err(PatternError::TooFewDirectionChanges {
                got: changes,
                min: rules.min_direction_changes,
            });
        }
        Ok(())
    }

    /// Number of times the reduced step direction changes between segments.
    pub fn direction_changes(&self) -> usize {
        let grid = i32::from(self.grid_size.max(1));
        let steps: Vec<(i32, i32)> = self
            .nodes
            .windows(2)
            .map(|w| {
                let (r0, c0) = (i32::from(w[0]) / grid, i32::from(w[0]) % grid);
                let (r1, c1) = (i32::from(w[1]) / grid, i32::from(w[1]) % grid);
                reduce(r1 - r0, c1 - c0)
            })
            .collect();
        steps.windows(2).filter(|s| s[0] != s[1]).count()
    }

    /// Canonical KDF input: domain || grid_size || nodes
    pub fn to_kdf_bytes(&self) -> zeroize::Zeroizing<Vec<u8>> {
        let mut out = Vec::with_capacity(PATTERN_DOMAIN.len() + 1 + self.nodes.len());
        out.extend_from_slice(PATTERN_DOMAIN);
        out.push(self.grid_size);
        out.extend_from_slice(&self.nodes);
        zeroize::Zeroizing::new(out)
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pattern")
            .field("grid_size", &self.grid_size)
            .field("nodes", &format!("[{} nodes REDACTED]", self.nodes.len()))
            .finish()
    }
}

fn reduce(dr: i32, dc: i32) -> (i32, i32) {
    let g = gcd(dr.abs(), dc.abs()).max(1);
    (dr / g, dc / g)
}

fn gcd(a: i32, b: i32) -> i32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}
