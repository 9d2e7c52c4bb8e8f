//! Procedure classification.
//!
//! The RPC layer owns the knowledge of which procedures have side effects
//! worth suppressing on retransmit and how a stored response is torn down.
//! The cache consults it through [`Dispatch`].

use drc_types::{CompoundLookahead, CompoundShape, NFS_PROGRAM, NFS_V3, NFS_V4, RpcCall, nfs3, nfs4};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    Cacheable,
    NotCacheable,
}

impl Cacheability {
    #[must_use]
    pub fn is_cacheable(self) -> bool {
        matches!(self, Self::Cacheable)
    }
}

/// Classification and teardown hooks supplied by the RPC layer.
pub trait Dispatch<R>: Send + Sync {
    fn classify(&self, call: &RpcCall) -> Cacheability;

    /// Whether this particular COMPOUND may be cached.
    fn is_compound_cacheable(&self, call: &RpcCall, shape: &CompoundShape) -> bool {
        let _ = call;
        compound_cacheable(shape)
    }

    /// Called exactly once per stored or uncached response when its last
    /// holder lets go.
    fn release_response(&self, call: &RpcCall, response: Arc<R>) {
        let _ = (call, response);
    }
}

const UNCACHED_OPS: CompoundLookahead = CompoundLookahead::OPEN
    .union(CompoundLookahead::CLOSE)
    .union(CompoundLookahead::LOCK)
    .union(CompoundLookahead::READ)
    .union(CompoundLookahead::READLINK)
    .union(CompoundLookahead::READDIR);

/// The COMPOUND rule.
///
/// Minor versions above zero replay through their session slots instead.
/// A create-intent OPEN always caches since running it twice can create
/// twice. Operations whose reply is cheaper to recompute than to hold (bulk
/// reads, directory listings) or whose state lives elsewhere (opens, closes,
/// locks) do not.
#[must_use]
pub fn compound_cacheable(shape: &CompoundShape) -> bool {
    if shape.minor_version > 0 {
        return false;
    }
    if shape.lookahead.contains(CompoundLookahead::CREATE) {
        return true;
    }
    !shape.lookahead.intersects(UNCACHED_OPS)
}

/// Classification table for the NFS programs served by this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct NfsDispatchTable;

impl NfsDispatchTable {
    #[must_use]
    pub fn classify_call(call: &RpcCall) -> Cacheability {
        let cacheable = match (call.program, call.version) {
            (NFS_PROGRAM, NFS_V3) => matches!(
                call.procedure,
                nfs3::SETATTR
                    | nfs3::WRITE
                    | nfs3::CREATE
                    | nfs3::MKDIR
                    | nfs3::SYMLINK
                    | nfs3::MKNOD
                    | nfs3::REMOVE
                    | nfs3::RMDIR
                    | nfs3::RENAME
                    | nfs3::LINK
            ),
            (NFS_PROGRAM, NFS_V4) => call.procedure == nfs4::COMPOUND,
            // MOUNT, NLM, RQUOTA and NFSACL never cache.
            _ => false,
        };
        if cacheable {
            Cacheability::Cacheable
        } else {
            Cacheability::NotCacheable
        }
    }
}

impl<R> Dispatch<R> for NfsDispatchTable {
    fn classify(&self, call: &RpcCall) -> Cacheability {
        Self::classify_call(call)
    }
}

/// Whether `call` is one the transport should scan as a COMPOUND.
#[must_use]
pub fn is_compound(call: &RpcCall) -> bool {
    call.program == NFS_PROGRAM && call.version == NFS_V4 && call.procedure == nfs4::COMPOUND
}
