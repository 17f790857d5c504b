//! Messages exchanged with the host: instrumentation requests coming in,
//! diagnostics (and shader exports) going out.

use serde::{Deserialize, Serialize};

/// Feature bit set, one bit per registered feature (see [`crate::features`]).
pub type FeatureBitSet = u64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    SetInstrumentationConfig {
        synchronous_recording: bool,
    },
    SetGlobalInstrumentation {
        feature_bit_set: FeatureBitSet,
    },
    SetShaderInstrumentation {
        shader_uid: u64,
        feature_bit_set: FeatureBitSet,
    },
    SetPipelineInstrumentation {
        pipeline_uid: u64,
        feature_bit_set: FeatureBitSet,
    },

    /// Outstanding compile jobs, sent whenever that number changes.
    JobDiagnostic {
        remaining: u32,
    },
}

/// Ordered sequence of messages.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStream {
    pub messages: Vec<Message>,
}

impl MessageStream {
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Move every message of `self` to the end of `other`.
    pub fn append_to(&mut self, other: &mut MessageStream) {
        other.messages.append(&mut self.messages);
    }
}

/// Message written by instrumented shaders, one dword per field, to the
/// export stream allocated for [`ShaderExportMessage::NAME`].
pub trait ShaderExportMessage: Sized {
    const NAME: &'static str;
    const DWORDS: usize;

    fn from_dwords(dwords: &[u32]) -> Option<Self>;
}

/// Access to a buffer/texture past its dimensions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceIndexOutOfBounds {
    /// Resource class (high 16 bits) and range id (low 16 bits).
    pub token: u32,

    /// First coordinate of the access.
    pub coordinate: u32,

    /// Instruction (record index in its function block), or `u32::MAX` if
    /// the access didn't come from the source program.
    pub source: u32,
}

impl ShaderExportMessage for ResourceIndexOutOfBounds {
    const NAME: &'static str = "ResourceIndexOutOfBounds";
    const DWORDS: usize = 3;

    fn from_dwords(dwords: &[u32]) -> Option<Self> {
        match *dwords {
            [token, coordinate, source] => Some(ResourceIndexOutOfBounds {
                token,
                coordinate,
                source,
            }),
            _ => None,
        }
    }
}

impl ResourceIndexOutOfBounds {
    pub fn class(&self) -> u32 {
        self.token >> 16
    }

    pub fn range_id(&self) -> u32 {
        self.token & 0xffff
    }
}
