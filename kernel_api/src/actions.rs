//! Asynchronous action descriptors
//!
//! A single `submit-async` call carries a sequence of actions. The sequence
//! is interpreted against a stack of lane endpoints: processing starts with
//! the root lane on the stack; each action targets the top of the stack and
//! pops it unless the *chain* flag is set; an offer or accept with the
//! *ancillary* flag pushes its child lane for subsequent actions. A
//! well-formed sequence leaves the stack empty after its last action.

use core_types::{Handle, KernelError, KernelResult, VirtAddr};
use serde::{Deserialize, Serialize};

use crate::records::RecordKind;

/// The primitive IPC operations a lane understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Offer,
    Accept,
    SendFromBuffer,
    RecvInline,
    RecvToBuffer,
    PushDescriptor,
    PullDescriptor,
}

/// One action within a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    /// Keep the target lane on the stack for the next action.
    pub chain: bool,
    /// Push the child lane of an offer/accept onto the stack.
    pub ancillary: bool,
    /// Payload for send-from-buffer.
    pub data: Vec<u8>,
    /// Destination for recv-to-buffer, in the caller's address space.
    pub buffer: VirtAddr,
    /// Capacity of the recv-to-buffer destination, in bytes.
    pub length: u64,
    /// Descriptor operand for push-descriptor.
    pub handle: Handle,
}

impl Action {
    fn bare(kind: ActionKind) -> Self {
        Self {
            kind,
            chain: false,
            ancillary: false,
            data: Vec::new(),
            buffer: VirtAddr::new(0),
            length: 0,
            handle: Handle::NULL,
        }
    }

    /// An offer; pairs with a peer accept and spawns a child lane.
    pub fn offer() -> Self {
        Self::bare(ActionKind::Offer)
    }

    /// An accept; pairs with a peer offer and spawns a child lane.
    pub fn accept() -> Self {
        Self::bare(ActionKind::Accept)
    }

    /// Sends the given bytes; pairs with either receive form.
    pub fn send(data: impl Into<Vec<u8>>) -> Self {
        let mut action = Self::bare(ActionKind::SendFromBuffer);
        action.data = data.into();
        action
    }

    /// Receives into a kernel buffer delivered inline in the record.
    pub fn recv_inline() -> Self {
        Self::bare(ActionKind::RecvInline)
    }

    /// Receives into `length` bytes at `buffer` in the caller's space.
    pub fn recv_to_buffer(buffer: VirtAddr, length: u64) -> Self {
        let mut action = Self::bare(ActionKind::RecvToBuffer);
        action.buffer = buffer;
        action.length = length;
        action
    }

    /// Pushes the descriptor named by `handle` to the peer.
    pub fn push_descriptor(handle: Handle) -> Self {
        let mut action = Self::bare(ActionKind::PushDescriptor);
        action.handle = handle;
        action
    }

    /// Pulls a descriptor pushed by the peer into the caller's universe.
    pub fn pull_descriptor() -> Self {
        Self::bare(ActionKind::PullDescriptor)
    }

    /// Sets the chain flag.
    pub fn chained(mut self) -> Self {
        self.chain = true;
        self
    }

    /// Sets the ancillary flag.
    pub fn with_ancillary(mut self) -> Self {
        self.ancillary = true;
        self
    }

    /// The record kind this action completes with.
    pub fn record_kind(&self) -> RecordKind {
        match self.kind {
            ActionKind::Offer => RecordKind::Simple,
            ActionKind::Accept => RecordKind::Handle,
            ActionKind::SendFromBuffer => RecordKind::Simple,
            ActionKind::RecvInline => RecordKind::Inline,
            ActionKind::RecvToBuffer => RecordKind::Length,
            ActionKind::PushDescriptor => RecordKind::Simple,
            ActionKind::PullDescriptor => RecordKind::Handle,
        }
    }
}

/// Validates the shape of an action sequence before any side effect.
///
/// Checks the stack discipline (the sequence must consume exactly the root
/// lane plus every ancillary lane it creates) and that the ancillary flag
/// only appears on offer or accept.
pub fn validate_sequence(actions: &[Action]) -> KernelResult<()> {
    if actions.is_empty() {
        return Err(KernelError::IllegalArgs);
    }

    let mut depth: usize = 1;
    for action in actions {
        if depth == 0 {
            return Err(KernelError::IllegalArgs);
        }
        if action.ancillary
            && !matches!(action.kind, ActionKind::Offer | ActionKind::Accept)
        {
            return Err(KernelError::IllegalArgs);
        }
        if !action.chain {
            depth -= 1;
        }
        if action.ancillary {
            depth += 1;
        }
    }

    if depth != 0 {
        return Err(KernelError::IllegalArgs);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_action_is_valid() {
        assert!(validate_sequence(&[Action::send(b"x".to_vec())]).is_ok());
    }

    #[test]
    fn test_empty_sequence_rejected() {
        assert!(validate_sequence(&[]).is_err());
    }

    #[test]
    fn test_offer_ancillary_then_send() {
        let actions = [Action::offer().with_ancillary(), Action::send(b"hi".to_vec())];
        assert!(validate_sequence(&actions).is_ok());
    }

    #[test]
    fn test_chain_keeps_lane() {
        let actions = [
            Action::send(b"a".to_vec()).chained(),
            Action::send(b"b".to_vec()),
        ];
        assert!(validate_sequence(&actions).is_ok());
    }

    #[test]
    fn test_leftover_stack_rejected() {
        // The ancillary lane is never consumed.
        let actions = [Action::offer().with_ancillary().chained(), Action::send(vec![1])];
        assert!(validate_sequence(&actions).is_err());
    }

    #[test]
    fn test_underflow_rejected() {
        let actions = [Action::send(vec![1]), Action::send(vec![2])];
        assert!(validate_sequence(&actions).is_err());
    }

    #[test]
    fn test_ancillary_only_on_offer_accept() {
        let actions = [Action::send(vec![1]).with_ancillary(), Action::recv_inline()];
        assert!(validate_sequence(&actions).is_err());
    }

    #[test]
    fn test_record_kinds() {
        assert_eq!(Action::offer().record_kind(), RecordKind::Simple);
        assert_eq!(Action::accept().record_kind(), RecordKind::Handle);
        assert_eq!(Action::recv_inline().record_kind(), RecordKind::Inline);
        assert_eq!(
            Action::recv_to_buffer(VirtAddr::new(0), 8).record_kind(),
            RecordKind::Length
        );
        assert_eq!(
            Action::pull_descriptor().record_kind(),
            RecordKind::Handle
        );
    }
}
