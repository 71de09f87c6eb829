use crate::Member;

/// The cursor value which both starts and terminates a scan.
///
/// A store signals that a scan is complete by handing back this value, which means
/// a scan can never resume from a genuine mid-iteration cursor of `0`.
pub const SCAN_START: u64 = 0;

/// The number of elements requested per scan page when the caller does not say.
pub const DEFAULT_SCAN_COUNT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A deferred mutation of a single set.
pub enum WriteOp {
    /// Add the given members, replying with the number of newly inserted members.
    Add(Vec<Member>),
    /// Remove the given members, replying with the number of members removed.
    Remove(Vec<Member>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A deferred read of a single set.
pub enum ReadOp {
    /// The number of members in the set, replies with [Reply::Count].
    Cardinality,
    /// Whether the member exists in the set, replies with [Reply::Bool].
    Contains(Member),
    /// Every member of the set, replies with [Reply::Members].
    Members,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An operation queued inside of an atomic block.
pub enum TxnOp {
    Write(WriteOp),
    Read(ReadOp),
}

impl From<WriteOp> for TxnOp {
    fn from(op: WriteOp) -> Self {
        Self::Write(op)
    }
}

impl From<ReadOp> for TxnOp {
    fn from(op: ReadOp) -> Self {
        Self::Read(op)
    }
}

impl TxnOp {
    /// The shape of reply the store must produce for this operation.
    pub fn reply_kind(&self) -> ReplyKind {
        match self {
            TxnOp::Write(_) => ReplyKind::Count,
            TxnOp::Read(ReadOp::Cardinality) => ReplyKind::Count,
            TxnOp::Read(ReadOp::Contains(_)) => ReplyKind::Bool,
            TxnOp::Read(ReadOp::Members) => ReplyKind::Members,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    Count,
    Bool,
    Members,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The resolved value of a single [TxnOp] once its block has committed.
pub enum Reply {
    Count(u64),
    Bool(bool),
    Members(Vec<Member>),
}

impl Reply {
    pub fn kind(&self) -> ReplyKind {
        match self {
            Reply::Count(_) => ReplyKind::Count,
            Reply::Bool(_) => ReplyKind::Bool,
            Reply::Members(_) => ReplyKind::Members,
        }
    }

    pub fn as_count(&self) -> Option<u64> {
        match self {
            Reply::Count(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Reply::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn into_members(self) -> Option<Vec<Member>> {
        match self {
            Reply::Members(members) => Some(members),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A single page produced by a cursor based scan.
pub struct ScanPage {
    /// The cursor to pass to the next scan call, [SCAN_START] once exhausted.
    pub cursor: u64,
    /// The members in this page.
    ///
    /// A page may be empty even when the scan is not yet complete, for example
    /// when a match pattern filters out every member the store looked at.
    pub members: Vec<Member>,
}

impl ScanPage {
    #[inline]
    /// Returns if this was the final page of the scan.
    pub fn is_last(&self) -> bool {
        self.cursor == SCAN_START
    }
}
