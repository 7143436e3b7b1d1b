//! Protocol messages
//!
//! One request/response pair per RPC. Messages are immutable values: fields
//! are read through getters and values are assembled with a builder, e.g.
//! `VoteRequest::builder().term(2).candidate(1).build()`.

use std::fmt;

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::raft::cluster::{Member, MemberId};
use crate::raft::log::Entry;

/// Defines a message struct, its builder and `to_builder`.
macro_rules! message {
    (
        $(#[$meta:meta])*
        $name:ident, $builder:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Getters,
            CopyGetters,
        )]
        pub struct $name {
            $( $(#[$fmeta])* $field: $ty, )*
        }

        impl $name {
            pub fn builder() -> $builder {
                $builder::default()
            }

            /// Returns a builder initialised with a copy of this message.
            pub fn to_builder(&self) -> $builder {
                $builder { message: self.clone() }
            }
        }

        #[derive(Debug, Default)]
        pub struct $builder {
            message: $name,
        }

        impl $builder {
            $(
                pub fn $field(mut self, $field: $ty) -> Self {
                    self.message.$field = $field;
                    self
                }
            )*

            pub fn build(self) -> $name {
                self.message
            }
        }
    };
}

/// Defines a response message with the common `status` and `error` fields.
macro_rules! response {
    (
        $(#[$meta:meta])*
        $name:ident, $builder:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        message! {
            $(#[$meta])*
            $name, $builder {
                #[getset(get_copy = "pub")]
                status: Status,
                #[getset(get = "pub")]
                error: Option<RaftError>,
                $( $(#[$fmeta])* $field: $ty, )*
            }
        }

        impl $name {
            /// A failed response carrying `error`.
            pub fn failed(error: RaftError) -> Self {
                Self::builder().status(Status::Error).error(Some(error)).build()
            }

            pub fn is_ok(&self) -> bool {
                self.status == Status::Ok
            }

            /// Converts an `ERROR` response into `Err`.
            pub fn into_result(self) -> Result<Self> {
                match (self.status, &self.error) {
                    (Status::Ok, _) => Ok(self),
                    (Status::Error, Some(error)) => Err(error.clone()),
                    (Status::Error, None) => Err(RaftError::Transport(
                        format!("{} failed without an error", stringify!($name)),
                    )),
                }
            }
        }
    };
}

/// Outcome of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Ok,
    Error,
}

/// Read consistency requested by a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Consistency {
    /// Served from the leader's applied state without confirming leadership.
    Weak,
    /// Served after a majority confirms the leader is still current.
    #[default]
    Linearizable,
}

message! {
    /// Asks the cluster to add a member as PASSIVE.
    JoinRequest, JoinRequestBuilder {
        #[getset(get = "pub")]
        member: Member,
    }
}

response! {
    JoinResponse, JoinResponseBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        leader: Option<MemberId>,
        #[getset(get = "pub")]
        members: Vec<Member>,
    }
}

message! {
    /// Asks the cluster to make a passive member ACTIVE.
    PromoteRequest, PromoteRequestBuilder {
        #[getset(get_copy = "pub")]
        member: MemberId,
    }
}

response! {
    PromoteResponse, PromoteResponseBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        leader: Option<MemberId>,
        #[getset(get = "pub")]
        members: Vec<Member>,
    }
}

message! {
    /// Asks the cluster to remove a member.
    LeaveRequest, LeaveRequestBuilder {
        #[getset(get_copy = "pub")]
        member: MemberId,
    }
}

response! {
    LeaveResponse, LeaveResponseBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        leader: Option<MemberId>,
        #[getset(get = "pub")]
        members: Vec<Member>,
    }
}

message! {
    /// Sent by the leader to a passive member to confirm its progress.
    SyncRequest, SyncRequestBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        leader: MemberId,
    }
}

response! {
    SyncResponse, SyncResponseBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        last_index: u64,
        #[getset(get_copy = "pub")]
        commit_index: u64,
    }
}

message! {
    /// Pre-vote: "would you vote for me?". Never changes the receiver's term
    /// or vote.
    PollRequest, PollRequestBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        candidate: MemberId,
        #[getset(get_copy = "pub")]
        last_log_index: u64,
        #[getset(get_copy = "pub")]
        last_log_term: u64,
    }
}

response! {
    PollResponse, PollResponseBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        accepted: bool,
    }
}

message! {
    VoteRequest, VoteRequestBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        candidate: MemberId,
        #[getset(get_copy = "pub")]
        last_log_index: u64,
        #[getset(get_copy = "pub")]
        last_log_term: u64,
    }
}

response! {
    VoteResponse, VoteResponseBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        voted: bool,
    }
}

message! {
    /// Log replication; a heartbeat when `entries` is empty.
    AppendRequest, AppendRequestBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        leader: MemberId,
        #[getset(get_copy = "pub")]
        prev_log_index: u64,
        #[getset(get_copy = "pub")]
        prev_log_term: u64,
        #[getset(get = "pub")]
        entries: Vec<Entry>,
        #[getset(get_copy = "pub")]
        commit_index: u64,
    }
}

response! {
    AppendResponse, AppendResponseBuilder {
        #[getset(get_copy = "pub")]
        term: u64,
        #[getset(get_copy = "pub")]
        succeeded: bool,
        /// On success the last index known to match the leader; on failure a
        /// hint for where the leader should retry from.
        #[getset(get_copy = "pub")]
        last_log_index: u64,
    }
}

message! {
    CommandRequest, CommandRequestBuilder {
        #[getset(get = "pub")]
        command: Vec<u8>,
    }
}

response! {
    CommandResponse, CommandResponseBuilder {
        #[getset(get = "pub")]
        result: Vec<u8>,
    }
}

message! {
    QueryRequest, QueryRequestBuilder {
        #[getset(get = "pub")]
        query: Vec<u8>,
        #[getset(get_copy = "pub")]
        consistency: Consistency,
    }
}

response! {
    QueryResponse, QueryResponseBuilder {
        #[getset(get = "pub")]
        result: Vec<u8>,
    }
}

/// The RPC a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Join,
    Promote,
    Leave,
    Sync,
    Poll,
    Vote,
    Append,
    Command,
    Query,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Join => "join",
            RequestKind::Promote => "promote",
            RequestKind::Leave => "leave",
            RequestKind::Sync => "sync",
            RequestKind::Poll => "poll",
            RequestKind::Vote => "vote",
            RequestKind::Append => "append",
            RequestKind::Command => "command",
            RequestKind::Query => "query",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any protocol request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Request {
    Join(JoinRequest),
    Promote(PromoteRequest),
    Leave(LeaveRequest),
    Sync(SyncRequest),
    Poll(PollRequest),
    Vote(VoteRequest),
    Append(AppendRequest),
    Command(CommandRequest),
    Query(QueryRequest),
}

/// Any protocol response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Response {
    Join(JoinResponse),
    Promote(PromoteResponse),
    Leave(LeaveResponse),
    Sync(SyncResponse),
    Poll(PollResponse),
    Vote(VoteResponse),
    Append(AppendResponse),
    Command(CommandResponse),
    Query(QueryResponse),
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Join(_) => RequestKind::Join,
            Request::Promote(_) => RequestKind::Promote,
            Request::Leave(_) => RequestKind::Leave,
            Request::Sync(_) => RequestKind::Sync,
            Request::Poll(_) => RequestKind::Poll,
            Request::Vote(_) => RequestKind::Vote,
            Request::Append(_) => RequestKind::Append,
            Request::Command(_) => RequestKind::Command,
            Request::Query(_) => RequestKind::Query,
        }
    }

    /// The sender's term, for requests that carry one.
    pub fn term(&self) -> Option<u64> {
        match self {
            Request::Sync(r) => Some(r.term()),
            Request::Poll(r) => Some(r.term()),
            Request::Vote(r) => Some(r.term()),
            Request::Append(r) => Some(r.term()),
            _ => None,
        }
    }
}

impl Response {
    /// A failed response of the given kind.
    pub fn failed(kind: RequestKind, error: RaftError) -> Response {
        match kind {
            RequestKind::Join => Response::Join(JoinResponse::failed(error)),
            RequestKind::Promote => Response::Promote(PromoteResponse::failed(error)),
            RequestKind::Leave => Response::Leave(LeaveResponse::failed(error)),
            RequestKind::Sync => Response::Sync(SyncResponse::failed(error)),
            RequestKind::Poll => Response::Poll(PollResponse::failed(error)),
            RequestKind::Vote => Response::Vote(VoteResponse::failed(error)),
            RequestKind::Append => Response::Append(AppendResponse::failed(error)),
            RequestKind::Command => Response::Command(CommandResponse::failed(error)),
            RequestKind::Query => Response::Query(QueryResponse::failed(error)),
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Response::Join(_) => RequestKind::Join,
            Response::Promote(_) => RequestKind::Promote,
            Response::Leave(_) => RequestKind::Leave,
            Response::Sync(_) => RequestKind::Sync,
            Response::Poll(_) => RequestKind::Poll,
            Response::Vote(_) => RequestKind::Vote,
            Response::Append(_) => RequestKind::Append,
            Response::Command(_) => RequestKind::Command,
            Response::Query(_) => RequestKind::Query,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Response::Join(r) => r.status(),
            Response::Promote(r) => r.status(),
            Response::Leave(r) => r.status(),
            Response::Sync(r) => r.status(),
            Response::Poll(r) => r.status(),
            Response::Vote(r) => r.status(),
            Response::Append(r) => r.status(),
            Response::Command(r) => r.status(),
            Response::Query(r) => r.status(),
        }
    }

    pub fn error(&self) -> Option<&RaftError> {
        match self {
            Response::Join(r) => r.error().as_ref(),
            Response::Promote(r) => r.error().as_ref(),
            Response::Leave(r) => r.error().as_ref(),
            Response::Sync(r) => r.error().as_ref(),
            Response::Poll(r) => r.error().as_ref(),
            Response::Vote(r) => r.error().as_ref(),
            Response::Append(r) => r.error().as_ref(),
            Response::Command(r) => r.error().as_ref(),
            Response::Query(r) => r.error().as_ref(),
        }
    }

    /// The responder's term, for successful responses that carry one.
    pub fn term(&self) -> Option<u64> {
        if self.status() != Status::Ok {
            return None;
        }
        match self {
            Response::Sync(r) => Some(r.term()),
            Response::Poll(r) => Some(r.term()),
            Response::Vote(r) => Some(r.term()),
            Response::Append(r) => Some(r.term()),
            _ => None,
        }
    }
}

/// Unwraps a `Response` of the expected variant.
macro_rules! expect_response {
    ($response:expr, $variant:ident) => {
        match $response {
            $crate::raft::protocol::Response::$variant(r) => r.into_result(),
            other => Err($crate::error::RaftError::Codec(format!(
                "expected {} response, got {}",
                stringify!($variant),
                other.kind()
            ))),
        }
    };
}
pub(crate) use expect_response;
