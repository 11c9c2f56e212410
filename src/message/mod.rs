mod envelope;
mod kind;
mod location;
mod payloads;
mod status;
mod wire;

pub use envelope::{AgentId, Envelope};
pub use kind::MessageKind;
pub use location::Location;
pub use payloads::{
    AckPayload, AwaitPayload, CloseComputationPayload, CloseServerPayload, ErrorCode,
    ErrorPayload, FileTransferPayload, NodesQueryPayload, NodesQueryResponsePayload,
    PulsePayload, ResultPayload, RunAtPayload, RunEachPayload, RunPayload, SchedulePayload,
    ServersQueryPayload, ServersQueryResponsePayload, SetupPayload, StatusUpdatePayload,
    TerminatePayload,
};
pub use status::{CoroInfo, DiscoroStatus};
pub use wire::{MAX_MESSAGE_SIZE, decode, encode, now_millis};
