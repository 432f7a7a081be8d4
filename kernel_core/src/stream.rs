//! Streams and lanes
//!
//! A stream is a pair of lanes, each with a FIFO of pending actions.
//! Submissions on one lane pair with the head of the peer lane's queue: a
//! matching head completes both actions together, an empty peer queue
//! suspends the submission, and a head that can never match poisons the
//! whole stream. At any instant at most one of the two queues is non-empty.
//!
//! Offer and accept spawn a child stream. The side that suspends creates
//! the child and stashes the peer's endpoint with the pending action; the
//! side that arrives second receives that endpoint. The acceptor's endpoint
//! is also delivered as a handle in its completion record.
//!
//! A queued action holds a reference to its lane, so work submitted before
//! the last handle went away still pairs. A lane closes once it has neither
//! handles nor queued actions; from then on the peer's pending and future
//! actions complete as closed-remotely, and descriptors riding in unpaired
//! pushes are dropped cleanly.

use core_types::{error::CODE_NONE, KernelError, StreamId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::address_space::ForeignAccessor;
use crate::universe::{Descriptor, Universe};
use crate::writer::{Completer, EventWriter};

/// An action being submitted on a lane.
pub(crate) enum Incoming {
    Offer {
        completer: Completer,
    },
    Accept {
        completer: Completer,
        universe: Weak<Universe>,
    },
    Send {
        completer: Completer,
        data: Vec<u8>,
    },
    RecvInline {
        completer: Completer,
    },
    RecvBuffer {
        completer: Completer,
        accessor: ForeignAccessor,
    },
    Push {
        completer: Completer,
        descriptor: Descriptor,
    },
    Pull {
        completer: Completer,
        universe: Weak<Universe>,
    },
}

enum Pending {
    Offer {
        completer: Completer,
        peer_lane: LaneHandle,
    },
    Accept {
        completer: Completer,
        universe: Weak<Universe>,
        own_lane: LaneHandle,
        peer_lane: LaneHandle,
    },
    Send {
        completer: Completer,
        data: Vec<u8>,
    },
    RecvInline {
        completer: Completer,
    },
    RecvBuffer {
        completer: Completer,
        accessor: ForeignAccessor,
    },
    Push {
        completer: Completer,
        descriptor: Descriptor,
    },
    Pull {
        completer: Completer,
        universe: Weak<Universe>,
    },
}

impl Pending {
    /// Error completion shaped to the record kind the submitter will parse.
    fn fail(self, error: KernelError) -> Vec<(Completer, EventWriter)> {
        let code = error.code();
        match self {
            Pending::Offer { completer, .. } | Pending::Send { completer, .. } | Pending::Push { completer, .. } => {
                vec![(completer, EventWriter::Simple { error: code })]
            }
            Pending::Accept {
                completer, universe, ..
            }
            | Pending::Pull { completer, universe } => vec![(
                completer,
                EventWriter::Handle {
                    error: code,
                    universe,
                    descriptor: None,
                },
            )],
            Pending::RecvInline { completer } => vec![(
                completer,
                EventWriter::Inline {
                    error: code,
                    data: Vec::new(),
                },
            )],
            Pending::RecvBuffer { completer, .. } => vec![(
                completer,
                EventWriter::Length {
                    error: code,
                    length: 0,
                },
            )],
        }
    }
}

impl Incoming {
    fn fail(self, error: KernelError) -> Vec<(Completer, EventWriter)> {
        let code = error.code();
        match self {
            Incoming::Offer { completer } | Incoming::Send { completer, .. } | Incoming::Push { completer, .. } => {
                vec![(completer, EventWriter::Simple { error: code })]
            }
            Incoming::Accept {
                completer, universe, ..
            }
            | Incoming::Pull { completer, universe } => vec![(
                completer,
                EventWriter::Handle {
                    error: code,
                    universe,
                    descriptor: None,
                },
            )],
            Incoming::RecvInline { completer } => vec![(
                completer,
                EventWriter::Inline {
                    error: code,
                    data: Vec::new(),
                },
            )],
            Incoming::RecvBuffer { completer, .. } => vec![(
                completer,
                EventWriter::Length {
                    error: code,
                    length: 0,
                },
            )],
        }
    }

    fn wants_branch(&self) -> bool {
        matches!(self, Incoming::Offer { .. } | Incoming::Accept { .. })
    }
}

enum Effect {
    Complete(Completer, EventWriter),
    /// Buffer-to-buffer copy, run outside the stream lock because the store
    /// may fault.
    Transfer {
        data: Vec<u8>,
        accessor: ForeignAccessor,
        receiver: Completer,
        sender: Completer,
    },
}

fn run_effects(effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Complete(completer, writer) => completer.complete(writer),
            Effect::Transfer {
                data,
                accessor,
                receiver,
                sender,
            } => {
                if data.len() as u64 > accessor.length() {
                    receiver.complete(EventWriter::Length {
                        error: KernelError::BufferTooSmall.code(),
                        length: 0,
                    });
                } else {
                    match accessor.store(0, &data) {
                        Ok(()) => receiver.complete(EventWriter::Length {
                            error: CODE_NONE,
                            length: data.len() as u64,
                        }),
                        Err(error) => receiver.complete(EventWriter::Length {
                            error: error.code(),
                            length: 0,
                        }),
                    }
                }
                sender.complete(EventWriter::ok());
            }
        }
    }
}

struct StreamState {
    queues: [VecDeque<Pending>; 2],
    /// Live references per lane: handle clones plus queued actions.
    refs: [usize; 2],
    closed: [bool; 2],
    poisoned: bool,
}

impl StreamState {
    /// Drops one reference; at zero the lane is closed and the peer's
    /// queue is drained for cancellation by the caller.
    fn release(&mut self, lane: usize) -> Option<Vec<Pending>> {
        self.refs[lane] -= 1;
        if self.refs[lane] > 0 || self.closed[lane] {
            return None;
        }
        self.closed[lane] = true;
        debug_assert!(self.queues[lane].is_empty());
        let peer: Vec<Pending> = self.queues[1 - lane].drain(..).collect();
        self.refs[1 - lane] -= peer.len();
        if self.refs[1 - lane] == 0 {
            self.closed[1 - lane] = true;
        }
        Some(peer)
    }
}

/// A bidirectional IPC stream.
pub struct Stream {
    id: StreamId,
    state: Mutex<StreamState>,
}

impl Stream {
    /// Creates a stream and returns its two endpoints.
    pub fn create() -> (LaneHandle, LaneHandle) {
        let stream = Arc::new(Stream {
            id: StreamId::new(),
            state: Mutex::new(StreamState {
                queues: [VecDeque::new(), VecDeque::new()],
                refs: [1, 1],
                closed: [false, false],
                poisoned: false,
            }),
        });
        (
            LaneHandle {
                stream: stream.clone(),
                lane: 0,
            },
            LaneHandle { stream, lane: 1 },
        )
    }

    pub fn id(&self) -> StreamId {
        self.id
    }
}

/// One endpoint of a stream. Clones track endpoint liveness; dropping the
/// last clone closes the endpoint.
pub struct LaneHandle {
    stream: Arc<Stream>,
    lane: usize,
}

/// A fresh endpoint whose peer is already gone; handed out when an offer or
/// accept can no longer produce a live child.
fn dead_branch() -> LaneHandle {
    let (local, peer) = Stream::create();
    drop(peer);
    local
}

impl Clone for LaneHandle {
    fn clone(&self) -> Self {
        let mut state = self.stream.state.lock().expect("stream lock");
        state.refs[self.lane] += 1;
        LaneHandle {
            stream: self.stream.clone(),
            lane: self.lane,
        }
    }
}

impl Drop for LaneHandle {
    fn drop(&mut self) {
        let cancelled = {
            let mut state = self.stream.state.lock().expect("stream lock");
            match state.release(self.lane) {
                Some(peer) => peer,
                None => return,
            }
        };

        let mut effects = Vec::new();
        for pending in cancelled {
            for (completer, writer) in pending.fail(KernelError::ClosedRemotely) {
                effects.push(Effect::Complete(completer, writer));
            }
        }
        run_effects(effects);
    }
}

impl LaneHandle {
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Submits one action. For offer/accept the returned handle is the
    /// local endpoint of the child stream.
    pub(crate) fn submit(&self, incoming: Incoming) -> Option<LaneHandle> {
        let lane = self.lane;
        let peer = 1 - lane;
        let mut branch = None;
        let mut effects: Vec<Effect> = Vec::new();

        {
            let mut state = self.stream.state.lock().expect("stream lock");

            if state.poisoned || state.closed[peer] {
                let error = if state.poisoned {
                    KernelError::IllegalArgs
                } else {
                    KernelError::ClosedRemotely
                };
                if incoming.wants_branch() {
                    branch = Some(dead_branch());
                }
                for (completer, writer) in incoming.fail(error) {
                    effects.push(Effect::Complete(completer, writer));
                }
            } else if !state.queues[lane].is_empty() || state.queues[peer].is_empty() {
                // Suspend behind our own queue, or wait for the peer.
                let pending = match incoming {
                    Incoming::Offer { completer } => {
                        let (local, remote) = Stream::create();
                        branch = Some(local);
                        Pending::Offer {
                            completer,
                            peer_lane: remote,
                        }
                    }
                    Incoming::Accept {
                        completer,
                        universe,
                    } => {
                        let (local, remote) = Stream::create();
                        branch = Some(local.clone());
                        Pending::Accept {
                            completer,
                            universe,
                            own_lane: local,
                            peer_lane: remote,
                        }
                    }
                    Incoming::Send { completer, data } => Pending::Send { completer, data },
                    Incoming::RecvInline { completer } => Pending::RecvInline { completer },
                    Incoming::RecvBuffer {
                        completer,
                        accessor,
                    } => Pending::RecvBuffer {
                        completer,
                        accessor,
                    },
                    Incoming::Push {
                        completer,
                        descriptor,
                    } => Pending::Push {
                        completer,
                        descriptor,
                    },
                    Incoming::Pull {
                        completer,
                        universe,
                    } => Pending::Pull {
                        completer,
                        universe,
                    },
                };
                state.queues[lane].push_back(pending);
                state.refs[lane] += 1;
            } else {
                let head = state.queues[peer].pop_front().expect("non-empty peer queue");
                match Self::pair(incoming, head, &mut branch, &mut effects) {
                    Ok(()) => {
                        // The popped action no longer holds its lane open.
                        let drained = state.release(peer);
                        debug_assert!(drained.map_or(true, |peer_queue| peer_queue.is_empty()));
                    }
                    Err((incoming, head)) => {
                        // Heads that can never match poison the stream.
                        state.poisoned = true;
                        state.refs[peer] -= 1;
                        if incoming.wants_branch() {
                            branch = Some(dead_branch());
                        }
                        for (completer, writer) in incoming.fail(KernelError::IllegalArgs) {
                            effects.push(Effect::Complete(completer, writer));
                        }
                        for (completer, writer) in head.fail(KernelError::IllegalArgs) {
                            effects.push(Effect::Complete(completer, writer));
                        }
                        for queue_index in 0..2 {
                            let drained: Vec<Pending> =
                                state.queues[queue_index].drain(..).collect();
                            state.refs[queue_index] -= drained.len();
                            for pending in drained {
                                for (completer, writer) in
                                    pending.fail(KernelError::IllegalArgs)
                                {
                                    effects.push(Effect::Complete(completer, writer));
                                }
                            }
                        }
                    }
                }
            }
        }

        run_effects(effects);
        branch
    }

    /// Pairs an arriving action with the peer's head; on mismatch both are
    /// handed back.
    fn pair(
        incoming: Incoming,
        head: Pending,
        branch: &mut Option<LaneHandle>,
        effects: &mut Vec<Effect>,
    ) -> Result<(), (Incoming, Pending)> {
        match (incoming, head) {
            (
                Incoming::Accept {
                    completer,
                    universe,
                },
                Pending::Offer {
                    completer: offer_completer,
                    peer_lane,
                },
            ) => {
                *branch = Some(peer_lane.clone());
                effects.push(Effect::Complete(offer_completer, EventWriter::ok()));
                effects.push(Effect::Complete(
                    completer,
                    EventWriter::Handle {
                        error: CODE_NONE,
                        universe,
                        descriptor: Some(Descriptor::Lane(peer_lane)),
                    },
                ));
                Ok(())
            }
            (
                Incoming::Offer { completer },
                Pending::Accept {
                    completer: accept_completer,
                    universe,
                    own_lane,
                    peer_lane,
                },
            ) => {
                *branch = Some(peer_lane);
                effects.push(Effect::Complete(completer, EventWriter::ok()));
                effects.push(Effect::Complete(
                    accept_completer,
                    EventWriter::Handle {
                        error: CODE_NONE,
                        universe,
                        descriptor: Some(Descriptor::Lane(own_lane)),
                    },
                ));
                Ok(())
            }
            (
                Incoming::RecvInline { completer },
                Pending::Send {
                    completer: send_completer,
                    data,
                },
            ) => {
                effects.push(Effect::Complete(
                    completer,
                    EventWriter::Inline {
                        error: CODE_NONE,
                        data,
                    },
                ));
                effects.push(Effect::Complete(send_completer, EventWriter::ok()));
                Ok(())
            }
            (
                Incoming::RecvBuffer {
                    completer,
                    accessor,
                },
                Pending::Send {
                    completer: send_completer,
                    data,
                },
            ) => {
                effects.push(Effect::Transfer {
                    data,
                    accessor,
                    receiver: completer,
                    sender: send_completer,
                });
                Ok(())
            }
            (
                Incoming::Send { completer, data },
                Pending::RecvInline {
                    completer: recv_completer,
                },
            ) => {
                effects.push(Effect::Complete(
                    recv_completer,
                    EventWriter::Inline {
                        error: CODE_NONE,
                        data,
                    },
                ));
                effects.push(Effect::Complete(completer, EventWriter::ok()));
                Ok(())
            }
            (
                Incoming::Send { completer, data },
                Pending::RecvBuffer {
                    completer: recv_completer,
                    accessor,
                },
            ) => {
                effects.push(Effect::Transfer {
                    data,
                    accessor,
                    receiver: recv_completer,
                    sender: completer,
                });
                Ok(())
            }
            (
                Incoming::Pull {
                    completer,
                    universe,
                },
                Pending::Push {
                    completer: push_completer,
                    descriptor,
                },
            ) => {
                effects.push(Effect::Complete(
                    completer,
                    EventWriter::Handle {
                        error: CODE_NONE,
                        universe,
                        descriptor: Some(descriptor),
                    },
                ));
                effects.push(Effect::Complete(push_completer, EventWriter::ok()));
                Ok(())
            }
            (
                Incoming::Push {
                    completer,
                    descriptor,
                },
                Pending::Pull {
                    completer: pull_completer,
                    universe,
                },
            ) => {
                effects.push(Effect::Complete(
                    pull_completer,
                    EventWriter::Handle {
                        error: CODE_NONE,
                        universe,
                        descriptor: Some(descriptor),
                    },
                ));
                effects.push(Effect::Complete(completer, EventWriter::ok()));
                Ok(())
            }
            (incoming, head) => Err((incoming, head)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use core_types::{Handle, PAGE_SIZE};
    use kernel_api::AllocateSettings;

    fn collect() -> (Completer, Arc<Mutex<Vec<EventWriter>>>) {
        let sink = Arc::new(Mutex::new(Vec::new()));
        (Completer::Collect(sink.clone()), sink)
    }

    fn first_error(sink: &Arc<Mutex<Vec<EventWriter>>>) -> u32 {
        let writers = sink.lock().unwrap();
        match &writers[0] {
            EventWriter::Simple { error }
            | EventWriter::Handle { error, .. }
            | EventWriter::Length { error, .. }
            | EventWriter::Inline { error, .. }
            | EventWriter::Observe { error, .. }
            | EventWriter::Manage { error, .. } => *error,
        }
    }

    #[test]
    fn test_send_then_recv_inline() {
        let (left, right) = Stream::create();
        let (send_completer, send_sink) = collect();
        let (recv_completer, recv_sink) = collect();

        left.submit(Incoming::Send {
            completer: send_completer,
            data: b"hello".to_vec(),
        });
        assert!(send_sink.lock().unwrap().is_empty());

        right.submit(Incoming::RecvInline {
            completer: recv_completer,
        });

        assert_eq!(first_error(&send_sink), CODE_NONE);
        let recv = recv_sink.lock().unwrap();
        assert!(
            matches!(&recv[0], EventWriter::Inline { error: 0, data } if data == b"hello")
        );
    }

    #[test]
    fn test_sends_pair_in_submission_order() {
        let (left, right) = Stream::create();
        for payload in [b"one".to_vec(), b"two".to_vec()] {
            let (completer, _sink) = collect();
            left.submit(Incoming::Send {
                completer,
                data: payload,
            });
        }

        let (first_recv, first_sink) = collect();
        right.submit(Incoming::RecvInline {
            completer: first_recv,
        });
        let (second_recv, second_sink) = collect();
        right.submit(Incoming::RecvInline {
            completer: second_recv,
        });

        assert!(matches!(
            &first_sink.lock().unwrap()[0],
            EventWriter::Inline { data, .. } if data == b"one"
        ));
        assert!(matches!(
            &second_sink.lock().unwrap()[0],
            EventWriter::Inline { data, .. } if data == b"two"
        ));
    }

    #[test]
    fn test_offer_accept_creates_usable_child() {
        let (left, right) = Stream::create();
        let (offer_completer, offer_sink) = collect();
        let left_child = left
            .submit(Incoming::Offer {
                completer: offer_completer,
            })
            .expect("offer branch");

        let universe = Universe::new();
        let (accept_completer, accept_sink) = collect();
        let right_child = right
            .submit(Incoming::Accept {
                completer: accept_completer,
                universe: Arc::downgrade(&universe),
            })
            .expect("accept branch");

        assert_eq!(first_error(&offer_sink), CODE_NONE);

        // The accept record attaches the child endpoint in the universe.
        let writer = accept_sink.lock().unwrap().pop().unwrap();
        let bytes = writer.render();
        let raw = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        assert!(universe.get(Handle::from_raw(raw)).is_ok());

        // The two branches are peers on one child stream.
        let (send_completer, _send_sink) = collect();
        left_child.submit(Incoming::Send {
            completer: send_completer,
            data: b"via child".to_vec(),
        });
        let (recv_completer, recv_sink) = collect();
        right_child.submit(Incoming::RecvInline {
            completer: recv_completer,
        });
        assert!(matches!(
            &recv_sink.lock().unwrap()[0],
            EventWriter::Inline { data, .. } if data == b"via child"
        ));
    }

    #[test]
    fn test_accept_first_then_offer() {
        let (left, right) = Stream::create();
        let universe = Universe::new();
        let (accept_completer, accept_sink) = collect();
        let right_child = right
            .submit(Incoming::Accept {
                completer: accept_completer,
                universe: Arc::downgrade(&universe),
            })
            .expect("accept branch");
        assert!(accept_sink.lock().unwrap().is_empty());

        let (offer_completer, offer_sink) = collect();
        let left_child = left
            .submit(Incoming::Offer {
                completer: offer_completer,
            })
            .expect("offer branch");

        assert_eq!(first_error(&offer_sink), CODE_NONE);
        assert_eq!(first_error(&accept_sink), CODE_NONE);

        let (send_completer, _send_sink) = collect();
        right_child.submit(Incoming::Send {
            completer: send_completer,
            data: b"reverse".to_vec(),
        });
        let (recv_completer, recv_sink) = collect();
        left_child.submit(Incoming::RecvInline {
            completer: recv_completer,
        });
        assert!(matches!(
            &recv_sink.lock().unwrap()[0],
            EventWriter::Inline { data, .. } if data == b"reverse"
        ));
    }

    #[test]
    fn test_push_pull_preserves_object_identity() {
        let (left, right) = Stream::create();
        let memory =
            Memory::allocate(PAGE_SIZE, AllocateSettings::parse(0).unwrap()).unwrap();
        let id = memory.id();

        let (push_completer, push_sink) = collect();
        left.submit(Incoming::Push {
            completer: push_completer,
            descriptor: Descriptor::Memory(memory),
        });

        let universe = Universe::new();
        let (pull_completer, pull_sink) = collect();
        right.submit(Incoming::Pull {
            completer: pull_completer,
            universe: Arc::downgrade(&universe),
        });

        assert_eq!(first_error(&push_sink), CODE_NONE);
        let writer = pull_sink.lock().unwrap().pop().unwrap();
        let bytes = writer.render();
        let raw = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let pulled = universe
            .get(Handle::from_raw(raw))
            .unwrap()
            .into_memory()
            .unwrap();
        assert_eq!(pulled.id(), id);
    }

    #[test]
    fn test_close_fails_peer_pendings_remotely() {
        let (left, right) = Stream::create();
        let (recv_completer, recv_sink) = collect();
        right.submit(Incoming::RecvInline {
            completer: recv_completer,
        });

        drop(left);
        assert_eq!(
            first_error(&recv_sink),
            KernelError::ClosedRemotely.code()
        );

        // And future submissions fail the same way.
        let (late_completer, late_sink) = collect();
        right.submit(Incoming::RecvInline {
            completer: late_completer,
        });
        assert_eq!(
            first_error(&late_sink),
            KernelError::ClosedRemotely.code()
        );
    }

    #[test]
    fn test_queued_action_survives_handle_close() {
        let (left, right) = Stream::create();
        let (send_completer, send_sink) = collect();
        left.submit(Incoming::Send {
            completer: send_completer,
            data: b"in flight".to_vec(),
        });

        // The queued send keeps the lane open after its handle goes away.
        drop(left);
        assert!(send_sink.lock().unwrap().is_empty());

        let (recv_completer, recv_sink) = collect();
        right.submit(Incoming::RecvInline {
            completer: recv_completer,
        });
        assert_eq!(first_error(&send_sink), CODE_NONE);
        assert!(matches!(
            &recv_sink.lock().unwrap()[0],
            EventWriter::Inline { data, .. } if data == b"in flight"
        ));

        // With the queue drained and no handles left, the lane is closed.
        let (late_completer, late_sink) = collect();
        right.submit(Incoming::RecvInline {
            completer: late_completer,
        });
        assert_eq!(
            first_error(&late_sink),
            KernelError::ClosedRemotely.code()
        );
    }

    #[test]
    fn test_cancelled_send_completes_closed_remotely() {
        let (left, right) = Stream::create();
        let (send_completer, send_sink) = collect();
        left.submit(Incoming::Send {
            completer: send_completer,
            data: b"never delivered".to_vec(),
        });

        drop(left);
        drop(right);
        assert_eq!(
            first_error(&send_sink),
            KernelError::ClosedRemotely.code()
        );
    }

    #[test]
    fn test_mismatched_heads_poison_stream() {
        let (left, right) = Stream::create();
        let (offer_completer, offer_sink) = collect();
        left.submit(Incoming::Offer {
            completer: offer_completer,
        });

        let (send_completer, send_sink) = collect();
        right.submit(Incoming::Send {
            completer: send_completer,
            data: b"mismatch".to_vec(),
        });

        assert_eq!(first_error(&offer_sink), KernelError::IllegalArgs.code());
        assert_eq!(first_error(&send_sink), KernelError::IllegalArgs.code());

        // The stream stays dead.
        let (late_completer, late_sink) = collect();
        left.submit(Incoming::RecvInline {
            completer: late_completer,
        });
        assert_eq!(first_error(&late_sink), KernelError::IllegalArgs.code());
    }

    #[test]
    fn test_exactly_one_completion_per_action() {
        let (left, right) = Stream::create();
        let (send_completer, send_sink) = collect();
        let (recv_completer, recv_sink) = collect();
        left.submit(Incoming::Send {
            completer: send_completer,
            data: b"once".to_vec(),
        });
        right.submit(Incoming::RecvInline {
            completer: recv_completer,
        });
        assert_eq!(send_sink.lock().unwrap().len(), 1);
        assert_eq!(recv_sink.lock().unwrap().len(), 1);

        drop(left);
        drop(right);
        assert_eq!(send_sink.lock().unwrap().len(), 1);
        assert_eq!(recv_sink.lock().unwrap().len(), 1);
    }
}
