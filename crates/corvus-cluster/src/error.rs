//! Error types for cluster operations.

/// Errors surfaced by the cluster core.
///
/// The redirect variants (`Moved`, `Ask`) render exactly as the wire text a
/// client must receive, so the session layer can pass `Display` through.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    /// MOVED redirection: the slot permanently lives elsewhere.
    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: String },

    /// ASK redirection: the slot is mid-migration at the target.
    #[error("ASK {slot} {addr}")]
    Ask { slot: u16, addr: String },

    /// Keys in one request hash to different slots.
    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    /// The cluster cannot serve requests.
    #[error("CLUSTERDOWN The cluster is down")]
    ClusterDown,

    /// A malformed 40-hex-char node name.
    #[error("invalid node name: {0}")]
    BadNodeName(String),

    /// The named node is not in the arena.
    #[error("unknown node {0}")]
    UnknownNode(String),

    /// ADDSLOTS on a slot someone else owns.
    #[error("slot {slot} is already owned by {owner}")]
    SlotBusy { slot: u16, owner: String },

    /// The operation requires this node to be a slave.
    #[error("node is not a slave")]
    NotASlave,

    /// The operation requires this node to be a master.
    #[error("node is not a master")]
    NotAMaster,

    /// Unparseable nodes.conf content.
    #[error("bad cluster config line: {0}")]
    BadConfigLine(String),

    /// nodes.conf has no line flagged `myself`.
    #[error("cluster config has no myself node")]
    NoMyselfInConfig,

    /// Malformed bus message.
    #[error("bad cluster bus message: {0}")]
    BadMessage(String),

    /// Network failure talking to a peer.
    #[error("cluster network error: {0}")]
    Network(String),

    /// A migration precondition or step failed.
    #[error("migrate error: {0}")]
    Migrate(String),
}

impl ClusterError {
    /// True for MOVED/ASK, which are redirections rather than failures.
    pub fn is_redirect(&self) -> bool {
        matches!(self, ClusterError::Moved { .. } | ClusterError::Ask { .. })
    }
}
