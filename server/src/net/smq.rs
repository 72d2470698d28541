use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use log::trace;

use loka_shared::{frame, ObjectId, Port, ServerId, ServerMessage};

use super::fair_queue::FairQueue;
use super::token_bucket::TokenBucket;
use crate::config::SmqKind;
use crate::exec::{Inbox, Mailbox};
use crate::telemetry::{Counters, CountersHandle};

/// Who produced an outbound message; the fair scheduler's flow key, so one
/// chatty object cannot starve its neighbors on a shared peer link.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SourceTag {
    Object(ObjectId),
    Service(Port),
    /// Migration/directory control traffic.
    Control,
}

/// Commands handed to the network executor.
#[derive(Debug)]
pub enum NetCmd {
    SendTo { peer: ServerId, frame: Vec<u8> },
    Shutdown,
}

enum PeerQueue {
    Fair(FairQueue<SourceTag, ServerMessage>),
    Fifo(VecDeque<(usize, ServerMessage)>),
}

impl PeerQueue {
    fn len(&self) -> usize {
        match self {
            PeerQueue::Fair(q) => q.len(),
            PeerQueue::Fifo(q) => q.len(),
        }
    }

    fn front_size(&self) -> Option<usize> {
        match self {
            PeerQueue::Fair(q) => q.front_size(),
            PeerQueue::Fifo(q) => q.front().map(|&(size, _)| size),
        }
    }

    fn pop(&mut self) -> Option<ServerMessage> {
        match self {
            PeerQueue::Fair(q) => q.pop().map(|(_, m)| m),
            PeerQueue::Fifo(q) => q.pop_front().map(|(_, m)| m),
        }
    }
}

/// Outbound fair queues and token buckets for every peer, plus the local
/// loopback. `push` applies backpressure by returning `false`; `service`
/// moves whatever the buckets allow to the network executor.
pub struct ServerMessageQueue {
    id: ServerId,
    kind: SmqKind,
    queue_len: usize,
    send_rate: u64,
    weights: HashMap<SourceTag, f64>,
    queues: HashMap<ServerId, (PeerQueue, TokenBucket)>,
    /// Self-addressed messages; infinite rate, but still bounded.
    local: VecDeque<ServerMessage>,
    net: Mailbox<NetCmd>,
    inbound: Inbox<(ServerId, ServerMessage)>,
    counters: CountersHandle,
}

impl ServerMessageQueue {
    pub fn new(
        id: ServerId,
        kind: SmqKind,
        queue_len: usize,
        send_rate: u64,
        net: Mailbox<NetCmd>,
        inbound: Inbox<(ServerId, ServerMessage)>,
        counters: CountersHandle,
    ) -> Self {
        Self {
            id,
            kind,
            queue_len: queue_len.max(1),
            send_rate,
            weights: HashMap::new(),
            queues: HashMap::new(),
            local: VecDeque::new(),
            net,
            inbound,
            counters,
        }
    }

    pub fn set_weight(&mut self, tag: SourceTag, weight: f64) {
        self.weights.insert(tag, weight);
    }

    pub fn clear_source(&mut self, tag: &SourceTag) {
        self.weights.remove(tag);
        for (queue, _) in self.queues.values_mut() {
            if let PeerQueue::Fair(q) = queue {
                q.remove_flow(tag);
            }
        }
    }

    /// Enqueue toward `dest`. `false` means the queue is full and the caller
    /// must back off (or shed); nothing was taken.
    pub fn push(
        &mut self,
        dest: ServerId,
        tag: SourceTag,
        msg: ServerMessage,
        now: Instant,
    ) -> bool {
        if dest == self.id {
            if self.local.len() >= self.queue_len {
                Counters::bump(&self.counters.send_rejects);
                return false;
            }
            self.local.push_back(msg);
            return true;
        }

        let kind = self.kind;
        let send_rate = self.send_rate;
        let (queue, _) = self.queues.entry(dest).or_insert_with(|| {
            let queue = match kind {
                SmqKind::Fair => PeerQueue::Fair(FairQueue::new()),
                SmqKind::Fifo => PeerQueue::Fifo(VecDeque::new()),
            };
            (queue, TokenBucket::new(send_rate, now))
        });
        if queue.len() >= self.queue_len {
            Counters::bump(&self.counters.send_rejects);
            return false;
        }
        let size = msg.encoded_len();
        match queue {
            PeerQueue::Fair(q) => {
                let weight = self.weights.get(&tag).copied().unwrap_or(1.0);
                q.set_weight(&tag, weight);
                q.push(tag, size, msg);
            }
            PeerQueue::Fifo(q) => q.push_back((size, msg)),
        }
        true
    }

    /// Hand rate-permitted messages to the network executor, per peer: a
    /// blocked or slow peer never affects another peer's budget.
    pub fn service(&mut self, now: Instant) {
        for (&peer, (queue, bucket)) in self.queues.iter_mut() {
            while let Some(size) = queue.front_size() {
                if !bucket.try_consume(size, now) {
                    break;
                }
                let msg = queue.pop().unwrap();
                trace!("smq: {} bytes to {}", size, peer);
                if !self.net.post(NetCmd::SendTo { peer, frame: frame(&msg.encode()) }) {
                    return;
                }
            }
        }
    }

    /// Next received message: the local loopback first (infinite rate), then
    /// whatever peers delivered.
    pub fn receive(&mut self) -> Option<(ServerId, ServerMessage)> {
        if let Some(msg) = self.local.pop_front() {
            return Some((self.id, msg));
        }
        self.inbound.try_recv()
    }

    /// Outbound backlog across every peer queue; zero when drained.
    pub fn pending(&self) -> usize {
        self.local.len() + self.queues.values().map(|(q, _)| q.len()).sum::<usize>()
    }
}
