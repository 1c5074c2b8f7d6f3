//! Role of a connection in a ring pass.
//!
//! A plain ring pass uses every link. Pipelined passes rooted at one rank
//! (broadcast-like `FeedFrom`, reduce-like `FeedTo`) form a chain, so exactly
//! one link of the ring carries nothing and its proxy can be skipped.
//!
//! The integer form used on the wire is `0` for a ring, `root + 1` for
//! `FeedFrom` and `-(root + 1)` for `FeedTo`.

use crate::error::{Error, Result};
use crate::ring::RingInfo;
use crate::transport::Direction;

/// How data flows through the ring for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingPattern {
    /// Every rank sends to its successor.
    Ring,
    /// Data flows out of `root` along the ring.
    FeedFrom {
        /// Originating rank.
        root: usize,
    },
    /// Data flows along the ring into `root`.
    FeedTo {
        /// Destination rank.
        root: usize,
    },
}

impl RingPattern {
    /// Integer encoding. Fails if `root + 1` does not fit an `i32`.
    pub fn encode(self) -> Result<i32> {
        let shifted = |root: usize| {
            i32::try_from(root)
                .ok()
                .and_then(|r| r.checked_add(1))
                .ok_or(Error::PatternOutOfRange(root))
        };
        match self {
            RingPattern::Ring => Ok(0),
            RingPattern::FeedFrom { root } => shifted(root),
            RingPattern::FeedTo { root } => shifted(root).map(|code| -code),
        }
    }

    /// Decode an integer pattern. Every `i32` decodes.
    pub fn decode(code: i32) -> Self {
        match code {
            0 => RingPattern::Ring,
            c if c > 0 => RingPattern::FeedFrom {
                root: (c - 1) as usize,
            },
            // -(c + 1) cannot overflow for c < 0.
            c => RingPattern::FeedTo {
                root: (-(c + 1)) as usize,
            },
        }
    }

    /// Root rank, if the pattern has one.
    pub fn root(self) -> Option<usize> {
        match self {
            RingPattern::Ring => None,
            RingPattern::FeedFrom { root } | RingPattern::FeedTo { root } => Some(root),
        }
    }

    /// Whether the `direction` connector of `ring` carries data in this pattern.
    ///
    /// In a `FeedFrom` chain the root receives nothing and nobody sends to
    /// it; in a `FeedTo` chain the root sends nothing and nobody receives
    /// from it.
    pub fn needs_proxy(self, direction: Direction, ring: &RingInfo) -> bool {
        let skip_if = match (self, direction) {
            (RingPattern::Ring, _) => return true,
            (RingPattern::FeedFrom { root }, Direction::Recv) => (root, ring.rank()),
            (RingPattern::FeedFrom { root }, Direction::Send) => (root, ring.next()),
            (RingPattern::FeedTo { root }, Direction::Recv) => (root, ring.prev()),
            (RingPattern::FeedTo { root }, Direction::Send) => (root, ring.rank()),
        };
        let (root, rank) = skip_if;
        usize::try_from(rank).map_or(true, |rank| rank != root)
    }
}
