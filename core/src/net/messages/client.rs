//! Client -> Host messages

use bitcode::{Decode, Encode};

use crate::input::{PlayerId, QuantizedInput};
use crate::rollback::Frame;

use super::shared::StageSeq;

/// Local input for a single frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct InputFrame {
    pub stage_seq: StageSeq,
    pub frame: Frame,
    pub player: PlayerId,
    pub input: QuantizedInput,
    /// Newest host frame the client has received
    pub last_ack: Option<Frame>,
}

/// One entry of an input batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct InputEntry {
    pub frame: Frame,
    pub input: QuantizedInput,
}

/// Every unacknowledged local input in one packet
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct InputBatch {
    pub stage_seq: StageSeq,
    /// Newest host frame the client has received
    pub last_ack: Frame,
    pub entries: Vec<InputEntry>,
}
