//! Protocol message types for both taskgrid sub-protocols.

use serde::{Deserialize, Serialize};
use taskgrid_ident::Identifier;
use taskgrid_types::{FailureReason, NodeId, NodeInfo, ResultRef};

/// Protocol a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Peer discovery and gossip.
    Peer,
    /// Task demand-offer.
    Task,
}

impl Protocol {
    /// The fixed byte tag prepended to every frame of this protocol.
    pub fn tag(&self) -> [u8; 2] {
        match self {
            Protocol::Peer => *b"PD",
            Protocol::Task => *b"DO",
        }
    }

    /// Resolve a frame tag to its protocol.
    pub fn from_tag(tag: [u8; 2]) -> Option<Protocol> {
        match &tag {
            b"PD" => Some(Protocol::Peer),
            b"DO" => Some(Protocol::Task),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Peer => write!(f, "peer"),
            Protocol::Task => write!(f, "task"),
        }
    }
}

/// Message kind, scoped to its protocol by the wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    // Peer protocol
    /// Introduce this node to a peer.
    Hello,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Ask a peer for its known nodes.
    GetPeers,
    /// Known-nodes reply.
    Peers,

    // Task protocol
    /// Provider offers to compute a task (demand side of demand-offer).
    WantToCompute,
    /// Requestor assigns a subtask to a provider.
    TaskToCompute,
    /// Provider reports a computed result.
    ReportComputedTask,
    /// Requestor accepts results; settlement decision attached.
    ResultsAccepted,
    /// Requestor rejects results.
    ResultsRejected,
    /// Requestor cannot assign the requested task.
    CannotAssign,
    /// Deadline-forced result report (shortened lifetime class).
    ForceReport,
}

impl MessageKind {
    /// The protocol this kind belongs to.
    pub fn protocol(&self) -> Protocol {
        match self {
            MessageKind::Hello
            | MessageKind::Ping
            | MessageKind::Pong
            | MessageKind::GetPeers
            | MessageKind::Peers => Protocol::Peer,
            _ => Protocol::Task,
        }
    }

    /// Wire code within the protocol.
    pub fn code(&self) -> u8 {
        match self {
            MessageKind::Hello => 0x01,
            MessageKind::Ping => 0x02,
            MessageKind::Pong => 0x03,
            MessageKind::GetPeers => 0x04,
            MessageKind::Peers => 0x05,
            MessageKind::WantToCompute => 0x01,
            MessageKind::TaskToCompute => 0x02,
            MessageKind::ReportComputedTask => 0x03,
            MessageKind::ResultsAccepted => 0x04,
            MessageKind::ResultsRejected => 0x05,
            MessageKind::CannotAssign => 0x06,
            MessageKind::ForceReport => 0x07,
        }
    }

    /// Resolve a wire code within a protocol.
    pub fn from_code(protocol: Protocol, code: u8) -> Option<MessageKind> {
        match (protocol, code) {
            (Protocol::Peer, 0x01) => Some(MessageKind::Hello),
            (Protocol::Peer, 0x02) => Some(MessageKind::Ping),
            (Protocol::Peer, 0x03) => Some(MessageKind::Pong),
            (Protocol::Peer, 0x04) => Some(MessageKind::GetPeers),
            (Protocol::Peer, 0x05) => Some(MessageKind::Peers),
            (Protocol::Task, 0x01) => Some(MessageKind::WantToCompute),
            (Protocol::Task, 0x02) => Some(MessageKind::TaskToCompute),
            (Protocol::Task, 0x03) => Some(MessageKind::ReportComputedTask),
            (Protocol::Task, 0x04) => Some(MessageKind::ResultsAccepted),
            (Protocol::Task, 0x05) => Some(MessageKind::ResultsRejected),
            (Protocol::Task, 0x06) => Some(MessageKind::CannotAssign),
            (Protocol::Task, 0x07) => Some(MessageKind::ForceReport),
            _ => None,
        }
    }
}

/// Node introduction payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// The sending node.
    pub node: NodeInfo,
}

/// Known-nodes reply payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peers {
    /// Nodes the sender has seen recently.
    pub peers: Vec<NodeInfo>,
}

/// Provider's offer to compute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantToCompute {
    /// Offering provider.
    pub provider: NodeId,
    /// Task the offer targets.
    pub task_id: Identifier,
    /// Provider's declared performance score.
    pub performance: u64,
    /// Asking price per subtask.
    pub price: u64,
}

/// Subtask assignment sent to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskToCompute {
    /// Owning task.
    pub task_id: Identifier,
    /// Assigned subtask.
    pub subtask_id: Identifier,
    /// Resource bundle the provider must fetch.
    pub resources: ResultRef,
    /// Work item parameters (the sandbox `params` document).
    pub params: serde_json::Value,
    /// Attempt deadline, unix ms.
    pub deadline_ms: u64,
    /// Agreed price.
    pub price: u64,
}

/// Provider's result report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportComputedTask {
    /// Reported subtask.
    pub subtask_id: Identifier,
    /// Content handle of the result payload.
    pub result: ResultRef,
    /// blake3 hash of the result payload bytes.
    pub payload_hash: [u8; 32],
}

/// Acceptance decision; payment becomes eligible at the attached instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsAccepted {
    /// Accepted subtask.
    pub subtask_id: Identifier,
    /// Settlement eligibility instant, unix ms.
    pub payment_eligible_at_ms: u64,
}

/// Rejection decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsRejected {
    /// Rejected subtask.
    pub subtask_id: Identifier,
    /// Why the results were rejected.
    pub reason: FailureReason,
}

/// Assignment refusal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CannotAssign {
    /// Task that could not be assigned.
    pub task_id: Identifier,
    /// Refusal reason.
    pub reason: String,
}

/// Deadline-forced report; same content as a regular report but framed in
/// the shortened lifetime class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceReport {
    /// Reported subtask.
    pub subtask_id: Identifier,
    /// Content handle of the result payload.
    pub result: ResultRef,
    /// blake3 hash of the result payload bytes.
    pub payload_hash: [u8; 32],
}

/// Typed message body; the variant determines protocol and kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Hello(Hello),
    Ping,
    Pong,
    GetPeers,
    Peers(Peers),
    WantToCompute(WantToCompute),
    TaskToCompute(TaskToCompute),
    ReportComputedTask(ReportComputedTask),
    ResultsAccepted(ResultsAccepted),
    ResultsRejected(ResultsRejected),
    CannotAssign(CannotAssign),
    ForceReport(ForceReport),
}

impl MessageBody {
    /// The wire kind of this body.
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Hello(_) => MessageKind::Hello,
            MessageBody::Ping => MessageKind::Ping,
            MessageBody::Pong => MessageKind::Pong,
            MessageBody::GetPeers => MessageKind::GetPeers,
            MessageBody::Peers(_) => MessageKind::Peers,
            MessageBody::WantToCompute(_) => MessageKind::WantToCompute,
            MessageBody::TaskToCompute(_) => MessageKind::TaskToCompute,
            MessageBody::ReportComputedTask(_) => MessageKind::ReportComputedTask,
            MessageBody::ResultsAccepted(_) => MessageKind::ResultsAccepted,
            MessageBody::ResultsRejected(_) => MessageKind::ResultsRejected,
            MessageBody::CannotAssign(_) => MessageKind::CannotAssign,
            MessageBody::ForceReport(_) => MessageKind::ForceReport,
        }
    }
}

/// An immutable protocol unit: kind-tagged body plus creation timestamp.
///
/// The timestamp is carried on the wire and feeds the timing policy's
/// staleness decision; it is supplied by the caller so the codec itself
/// never reads the clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Creation time, unix ms.
    pub timestamp_ms: u64,
    /// Typed payload.
    pub body: MessageBody,
}

impl Message {
    /// Build a message stamped with the supplied creation time.
    pub fn new(body: MessageBody, timestamp_ms: u64) -> Self {
        Self { timestamp_ms, body }
    }

    /// The protocol this message travels on.
    pub fn protocol(&self) -> Protocol {
        self.body.kind().protocol()
    }

    /// The wire kind of this message.
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}
