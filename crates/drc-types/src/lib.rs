#![forbid(unsafe_code)]
//! Identifiers shared by the duplicate request cache and its transport.
//!
//! Nothing in this crate owns state: these are the values the RPC layer hands
//! to the cache for every call (transaction id, checksum, peer, program
//! triple) plus the classification vocabulary the dispatch table speaks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::BitOr;

pub const NFS_PROGRAM: u32 = 100_003;
pub const MOUNT_PROGRAM: u32 = 100_005;
pub const RQUOTA_PROGRAM: u32 = 100_011;
pub const NLM_PROGRAM: u32 = 100_021;
pub const NFSACL_PROGRAM: u32 = 100_227;

pub const NFS_V3: u32 = 3;
pub const NFS_V4: u32 = 4;

/// NFSv3 procedure numbers (RFC 1813).
pub mod nfs3 {
    pub const NULL: u32 = 0;
    pub const GETATTR: u32 = 1;
    pub const SETATTR: u32 = 2;
    pub const LOOKUP: u32 = 3;
    pub const ACCESS: u32 = 4;
    pub const READLINK: u32 = 5;
    pub const READ: u32 = 6;
    pub const WRITE: u32 = 7;
    pub const CREATE: u32 = 8;
    pub const MKDIR: u32 = 9;
    pub const SYMLINK: u32 = 10;
    pub const MKNOD: u32 = 11;
    pub const REMOVE: u32 = 12;
    pub const RMDIR: u32 = 13;
    pub const RENAME: u32 = 14;
    pub const LINK: u32 = 15;
    pub const READDIR: u32 = 16;
    pub const READDIRPLUS: u32 = 17;
    pub const FSSTAT: u32 = 18;
    pub const FSINFO: u32 = 19;
    pub const PATHCONF: u32 = 20;
    pub const COMMIT: u32 = 21;
}

/// NFSv4 procedure numbers (RFC 7530).
pub mod nfs4 {
    pub const NULL: u32 = 0;
    pub const COMPOUND: u32 = 1;
}

/// Seed folded into peer-address hashes.
const PEER_HASH_SEED: u64 = 911;

/// RPC transaction id (`rm_xid`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid(pub u32);

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Checksum of the raw call body, computed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checksum(pub u64);

impl Checksum {
    pub const ZERO: Self = Self(0);
}

/// Stable identity of one stream connection for the lifetime of its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

/// Remote peer address (address and port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddr(pub SocketAddr);

impl PeerAddr {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Seeded content hash of address and port.
    ///
    /// Stable across processes; used to route a peer to a registry partition.
    #[must_use]
    pub fn hash_key(&self) -> u64 {
        let mut acc = PEER_HASH_SEED;
        match self.0.ip() {
            IpAddr::V4(ip) => acc = fold(acc, u64::from(u32::from(ip))),
            IpAddr::V6(ip) => {
                for chunk in ip.octets().chunks_exact(8) {
                    let mut word = [0_u8; 8];
                    word.copy_from_slice(chunk);
                    acc = fold(acc, u64::from_be_bytes(word));
                }
            }
        }
        fold(acc, u64::from(self.0.port()))
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Multiply-xorshift finalizer.
///
/// Spreads low-entropy inputs (sequential xids, small ports) across the
/// full word so `hash % n` partitions evenly.
#[must_use]
#[inline]
pub fn mix64(value: u64) -> u64 {
    let mixed = value.wrapping_mul(0x517c_c1b7_2722_0a95);
    mixed ^ (mixed >> 32)
}

#[inline]
fn fold(acc: u64, word: u64) -> u64 {
    mix64(acc ^ word)
}

/// Transport class a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Connectionless (UDP); retransmits may come from any socket.
    Datagram,
    /// Connection-oriented (TCP); one cache per peer.
    Stream,
}

/// Program/version/procedure triple of an RPC call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RpcCall {
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
}

impl RpcCall {
    #[must_use]
    pub const fn new(program: u32, version: u32, procedure: u32) -> Self {
        Self {
            program,
            version,
            procedure,
        }
    }

    #[must_use]
    pub const fn nfs3(procedure: u32) -> Self {
        Self::new(NFS_PROGRAM, NFS_V3, procedure)
    }

    #[must_use]
    pub const fn nfs4_compound() -> Self {
        Self::new(NFS_PROGRAM, NFS_V4, nfs4::COMPOUND)
    }
}

impl fmt::Display for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.program, self.version, self.procedure)
    }
}

/// Which cache flavour serves a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrcKind {
    /// The single process-wide cache for datagram traffic.
    Shared,
    /// Per-peer cache for stream connections carrying NFSv2/v3 traffic.
    PerConnectionV3,
    /// Per-peer cache for stream connections carrying NFSv4 traffic.
    PerConnectionV4,
}

impl DrcKind {
    #[must_use]
    pub fn for_call(transport: Transport, call: &RpcCall) -> Self {
        match transport {
            Transport::Datagram => Self::Shared,
            Transport::Stream if call.version == NFS_V4 => Self::PerConnectionV4,
            Transport::Stream => Self::PerConnectionV3,
        }
    }

    #[must_use]
    pub fn is_shared(self) -> bool {
        matches!(self, Self::Shared)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::PerConnectionV3 => "per_connection_v3",
            Self::PerConnectionV4 => "per_connection_v4",
        }
    }
}

impl fmt::Display for DrcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation classes found by scanning a COMPOUND before executing it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompoundLookahead(u32);

impl CompoundLookahead {
    pub const NONE: Self = Self(0);
    /// OPEN with create intent (OPEN4_CREATE).
    pub const CREATE: Self = Self(1 << 0);
    /// Any logical OPEN, including OPEN_CONFIRM and OPEN_DOWNGRADE.
    pub const OPEN: Self = Self(1 << 1);
    pub const CLOSE: Self = Self(1 << 2);
    /// LOCK and LOCKU.
    pub const LOCK: Self = Self(1 << 3);
    pub const READ: Self = Self(1 << 4);
    pub const READLINK: Self = Self(1 << 5);
    pub const READDIR: Self = Self(1 << 6);
    pub const WRITE: Self = Self(1 << 7);
    pub const REMOVE: Self = Self(1 << 8);
    pub const RENAME: Self = Self(1 << 9);
    pub const SETATTR: Self = Self(1 << 10);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for CompoundLookahead {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Shape of an NFSv4 COMPOUND as far as caching decisions care.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundShape {
    pub minor_version: u32,
    pub lookahead: CompoundLookahead,
}

impl CompoundShape {
    #[must_use]
    pub const fn new(minor_version: u32, lookahead: CompoundLookahead) -> Self {
        Self {
            minor_version,
            lookahead,
        }
    }
}
