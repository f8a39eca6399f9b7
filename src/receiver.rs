//! The inbound demultiplexer.
//!
//! A single task reads datagrams off the channel and routes each one:
//! payload goes to the per-peer inbox its reader drains, control
//! significance goes to whichever waiter holds a matching template. Control
//! messages nobody is waiting for yet are parked in a bounded pending set
//! so a late waiter can still pick them up.
use crate::error::{Error, Result};
use crate::factory;
use crate::message::{ControlMessage, Matcher};
use crate::segment::{Segment, SegmentType};
use crate::sender::Sender;
use bytes::BytesMut;
use channel::Datagram;
use crossbeam::atomic::AtomicCell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Instant;
use tracing::{trace, warn};

struct Waiter {
    id: u64,
    matchers: Vec<Matcher>,
    slot: Arc<Mutex<Option<ControlMessage>>>,
}

#[derive(Default)]
struct Inbox {
    deliveries: VecDeque<BytesMut>,
    fin_seen: bool,
}

pub(crate) struct Receiver<D> {
    channel: Arc<D>,
    sender: Arc<Sender<D>>,
    local: SocketAddr,
    waiters: Mutex<Vec<Waiter>>,
    pending: Mutex<VecDeque<ControlMessage>>,
    inboxes: Mutex<HashMap<SocketAddr, Inbox>>,
    replays: Mutex<HashMap<(SocketAddr, SegmentType), (ControlMessage, ControlMessage)>>,
    pending_capacity: usize,
    next_waiter: AtomicCell<u64>,
    stopped: Arc<AtomicCell<bool>>,
}

impl<D: Datagram + 'static> Receiver<D> {
    pub fn new(
        channel: Arc<D>,
        sender: Arc<Sender<D>>,
        local: SocketAddr,
        pending_capacity: usize,
        stopped: Arc<AtomicCell<bool>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            sender,
            local,
            waiters: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            inboxes: Mutex::new(HashMap::new()),
            replays: Mutex::new(HashMap::new()),
            pending_capacity,
            next_waiter: AtomicCell::new(0),
            stopped,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let receiver = self.clone();
        async_std::task::spawn(async move { receiver.run().await });
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.stopped.load() {
                break;
            }
            let (bytes, src) = match self.channel.recv().await {
                Ok(datagram) => datagram,
                Err(err) => {
                    warn!("demultiplexer stopping: {}", err);
                    self.stopped.store(true);
                    break;
                }
            };
            // a zero-length datagram is the shutdown nudge
            if bytes.is_empty() {
                continue;
            }
            if let Err(err) = self.process(bytes, src).await {
                trace!("dropping datagram from {}: {}", src, err);
            }
        }
    }

    async fn process(&self, bytes: BytesMut, src: SocketAddr) -> Result<()> {
        let segment = Segment::parse(bytes)?;
        let ty = segment.ty();
        if segment.payload().is_empty() && ty != SegmentType::Ordinary {
            let message = factory::split_control(&segment, src, self.local)?;
            trace!("control {} from {}", message.ty, src);
            self.dispatch_control(message).await;
            return Ok(());
        }
        // a data segment, possibly carrying a merged control message
        if ty != SegmentType::Ordinary {
            let message = factory::split_control(&segment, src, self.local)?;
            self.dispatch_control(message).await;
        }
        if !segment.payload().is_empty() {
            let mut inboxes = self.inboxes.lock().unwrap();
            inboxes
                .entry(src)
                .or_insert_with(Inbox::default)
                .deliveries
                .push_back(BytesMut::from(segment.payload()));
        }
        // every received ordinary segment is acknowledged exactly once
        let ack = factory::data_ack(segment.seq_num(), self.local, src);
        self.sender.send_once(&ack).await
    }

    async fn dispatch_control(&self, message: ControlMessage) {
        if message.ty == SegmentType::Fin {
            // end-of-stream for this peer; wake blocked readers
            let mut inboxes = self.inboxes.lock().unwrap();
            inboxes.entry(message.src).or_insert_with(Inbox::default).fin_seen = true;
        }
        let slot = {
            let mut waiters = self.waiters.lock().unwrap();
            let target = waiters
                .iter()
                .position(|waiter| waiter.matchers.iter().any(|m| m.matches(&message)));
            target.map(|i| waiters.remove(i).slot)
        };
        if let Some(slot) = slot {
            *slot.lock().unwrap() = Some(message);
            return;
        }
        if message.ty == SegmentType::Ack {
            if !self.sender.acknowledge(&message) {
                trace!("unmatched ack {} from {}", message.ack, message.src);
            }
            return;
        }
        if message.ty.is_ack() {
            // a SYNACK/FINACK retransmitted after its handshake finished
            // means our one-shot final ACK was lost; repeat it
            let replay = {
                let replays = self.replays.lock().unwrap();
                replays.get(&(message.src, message.ty)).and_then(|(reply, ack)| {
                    if *reply == message {
                        Some(ack.clone())
                    } else {
                        None
                    }
                })
            };
            if let Some(ack) = replay {
                trace!("replaying final ack to {}", message.src);
                self.sender.send_once(&ack).await.ok();
                return;
            }
        }
        let mut pending = self.pending.lock().unwrap();
        if pending.contains(&message) {
            return;
        }
        if pending.len() == self.pending_capacity {
            pending.pop_front();
        }
        pending.push_back(message);
    }
}

impl<D> Receiver<D> {
    /// Blocks until a control message matching one of `matchers` arrives.
    ///
    /// The pending set is consulted first so a message that arrived before
    /// the waiter registered is not lost. Dropping the returned future
    /// deregisters the waiter; passing `deadline` bounds the wait with
    /// [`Error::Cancelled`].
    pub fn await_control(
        &self,
        matchers: Vec<Matcher>,
        deadline: Option<Instant>,
    ) -> AwaitControl<D> {
        let slot = Arc::new(Mutex::new(None));
        let id = self.next_waiter.fetch_add(1);
        {
            let mut waiters = self.waiters.lock().unwrap();
            let mut pending = self.pending.lock().unwrap();
            let parked = pending
                .iter()
                .position(|message| matchers.iter().any(|m| m.matches(message)));
            match parked {
                Some(i) => *slot.lock().unwrap() = pending.remove(i),
                None => waiters.push(Waiter {
                    id,
                    matchers,
                    slot: slot.clone(),
                }),
            }
        }
        AwaitControl {
            receiver: self,
            id,
            slot,
            deadline,
            finished: false,
        }
    }

    /// Takes a parked control message matching `matcher`, if one arrived.
    pub fn try_take_pending(&self, matcher: &Matcher) -> Option<ControlMessage> {
        let mut pending = self.pending.lock().unwrap();
        let i = pending.iter().position(|message| matcher.matches(message))?;
        pending.remove(i)
    }

    /// Records the final ACK sent for `reply` so a retransmission of
    /// `reply` can be answered again.
    pub fn record_replay(&self, reply: &ControlMessage, ack: &ControlMessage) {
        self.replays
            .lock()
            .unwrap()
            .insert((reply.src, reply.ty), (reply.clone(), ack.clone()));
    }

    /// Blocks until payload from `remote` is available.
    ///
    /// Resolves to `None` once the peer has signalled end-of-stream and the
    /// inbox is drained.
    pub fn read(&self, remote: SocketAddr, deadline: Option<Instant>) -> ReadData<D> {
        ReadData {
            receiver: self,
            remote,
            deadline,
        }
    }

    fn forget_waiter(&self, id: u64) {
        self.waiters.lock().unwrap().retain(|waiter| waiter.id != id);
    }
}

/// Future resolving to the control message a waiter blocked on.
pub(crate) struct AwaitControl<'a, D> {
    receiver: &'a Receiver<D>,
    id: u64,
    slot: Arc<Mutex<Option<ControlMessage>>>,
    deadline: Option<Instant>,
    finished: bool,
}

impl<'a, D> Future for AwaitControl<'a, D> {
    type Output = Result<ControlMessage>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let slotted = self.slot.lock().unwrap().take();
        if let Some(message) = slotted {
            self.finished = true;
            return Poll::Ready(Ok(message));
        }
        if self.receiver.stopped.load() {
            self.finished = true;
            self.receiver.forget_waiter(self.id);
            return Poll::Ready(Err(Error::ChannelClosed));
        }
        if self.deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            self.finished = true;
            self.receiver.forget_waiter(self.id);
            return Poll::Ready(Err(Error::Cancelled));
        }
        cx.waker().clone().wake();
        Poll::Pending
    }
}

impl<'a, D> Drop for AwaitControl<'a, D> {
    fn drop(&mut self) {
        if !self.finished {
            self.receiver.forget_waiter(self.id);
        }
    }
}

/// Future resolving to the next payload delivery from a peer.
pub(crate) struct ReadData<'a, D> {
    receiver: &'a Receiver<D>,
    remote: SocketAddr,
    deadline: Option<Instant>,
}

impl<'a, D> Future for ReadData<'a, D> {
    type Output = Result<Option<BytesMut>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        {
            let mut inboxes = self.receiver.inboxes.lock().unwrap();
            let inbox = inboxes.entry(self.remote).or_insert_with(Inbox::default);
            if let Some(bytes) = inbox.deliveries.pop_front() {
                return Poll::Ready(Ok(Some(bytes)));
            }
            if inbox.fin_seen {
                return Poll::Ready(Ok(None));
            }
        }
        if self.receiver.stopped.load() {
            return Poll::Ready(Err(Error::ChannelClosed));
        }
        if self.deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            return Poll::Ready(Err(Error::Cancelled));
        }
        cx.waker().clone().wake();
        Poll::Pending
    }
}
