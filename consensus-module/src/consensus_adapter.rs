//! `ConsensusPublisher` / `ConsensusAdapter` (spec.md §2): the thin framing
//! layer over [`crate::wire::ConsensusMessage`] and the underlying
//! [`crate::transport::Publication`]/[`crate::transport::Image`], the same
//! split drawn between `RaftNetwork` (send) and the replication
//! stream's inbound event channel (receive).

use tracing::trace;

use crate::transport::FragmentAction;
use crate::transport::Image;
use crate::transport::OfferError;
use crate::transport::Publication;
use crate::wire::ConsensusMessage;

/// Serializes outbound control messages onto a [`Publication`] and reports
/// back-pressure the way the source's `offer` negative result codes do
/// (spec.md §6).
pub struct ConsensusPublisher<P: Publication> {
    publication: P,
}

impl<P: Publication> ConsensusPublisher<P> {
    pub fn new(publication: P) -> Self {
        Self { publication }
    }

    #[tracing::instrument(level = "trace", skip(self, message))]
    pub fn publish(&mut self, message: &ConsensusMessage) -> Result<i64, OfferError> {
        let bytes = message.encode();
        trace!(len = bytes.len(), "publish consensus message");
        self.publication.offer(&bytes)
    }

    pub fn is_connected(&self) -> bool {
        self.publication.is_connected()
    }
}

/// Deserializes inbound control messages polled off an [`Image`] and hands
/// each to `handler` (spec.md §4.1 "Consensus control poll").
pub struct ConsensusAdapter<I: Image> {
    image: I,
}

impl<I: Image> ConsensusAdapter<I> {
    pub fn new(image: I) -> Self {
        Self { image }
    }

    #[tracing::instrument(level = "trace", skip(self, handler))]
    pub fn poll(&mut self, fragment_limit: usize, handler: &mut dyn FnMut(ConsensusMessage)) -> usize {
        self.image.poll(fragment_limit, &mut |bytes, _position| match ConsensusMessage::decode(bytes) {
            Ok(message) => {
                handler(message);
                FragmentAction::Continue
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode consensus message, skipping fragment");
                FragmentAction::Continue
            }
        })
    }

    pub fn position(&self) -> u64 {
        self.image.position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OfferResult;
    use crate::wire::HeartbeatRequest;
    use std::collections::VecDeque;

    struct FakePublication {
        sent: Vec<Vec<u8>>,
        connected: bool,
    }

    impl Publication for FakePublication {
        fn offer(&mut self, buffer: &[u8]) -> OfferResult {
            self.sent.push(buffer.to_vec());
            Ok(self.sent.len() as i64 * 64)
        }
        fn position(&self) -> u64 {
            self.sent.len() as u64 * 64
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    struct FakeImage {
        frames: VecDeque<Vec<u8>>,
        pos: u64,
    }

    impl Image for FakeImage {
        fn position(&self) -> u64 {
            self.pos
        }
        fn join_position(&self) -> u64 {
            0
        }
        fn end_position(&self) -> u64 {
            self.pos
        }
        fn is_closed(&self) -> bool {
            false
        }
        fn poll(&mut self, fragment_limit: usize, handler: &mut dyn FnMut(&[u8], u64) -> FragmentAction) -> usize {
            let mut polled = 0;
            while polled < fragment_limit {
                match self.frames.pop_front() {
                    Some(frame) => {
                        self.pos += frame.len() as u64;
                        handler(&frame, self.pos);
                        polled += 1;
                    }
                    None => break,
                }
            }
            polled
        }
    }

    #[test]
    fn publish_then_poll_round_trips() {
        let msg = ConsensusMessage::HeartbeatRequest(HeartbeatRequest {
            leadership_term_id: 5,
            leader_member_id: 1,
        });
        let mut publisher = ConsensusPublisher::new(FakePublication { sent: Vec::new(), connected: true });
        publisher.publish(&msg).unwrap();

        let mut adapter = ConsensusAdapter::new(FakeImage {
            frames: publisher.publication.sent.clone().into(),
            pos: 0,
        });
        let mut received = None;
        let count = adapter.poll(10, &mut |m| received = Some(m));
        assert_eq!(count, 1);
        assert_eq!(received, Some(msg));
    }
}
