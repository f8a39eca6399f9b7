//! The outbound dispatcher.
//!
//! Owns the two retransmission queues and the task that drains them. Every
//! queued unit is resent continuously until its acknowledgement is observed:
//! control messages until their counterpart reply, data segments until the
//! ACK matching their sequence number. Control messages take priority and
//! are opportunistically merged onto a compatible queued data segment so a
//! single transmission serves both purposes.
use crate::error::{Error, Result};
use crate::factory;
use crate::message::ControlMessage;
use crate::segment::Segment;
use channel::Datagram;
use crossbeam::atomic::AtomicCell;
use futures_timer::Delay;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Pause between polls of the queues when there is nothing to transmit.
const IDLE_WAIT: Duration = Duration::from_millis(1);

struct DataEntry {
    segment: Segment,
    dst: SocketAddr,
    carried: Option<ControlMessage>,
    last_tx: Option<Instant>,
}

struct ControlEntry {
    message: ControlMessage,
    last_tx: Option<Instant>,
}

/// Time until `last_tx + rtx`, or `None` if the unit is due now.
fn backoff(last_tx: Option<Instant>, rtx: Duration, now: Instant) -> Option<Duration> {
    let next = last_tx? + rtx;
    if next <= now {
        None
    } else {
        Some(next - now)
    }
}

enum Step {
    Transmit(Vec<u8>, SocketAddr),
    Wait(Duration),
}

pub(crate) struct Sender<D> {
    channel: Arc<D>,
    data: Mutex<VecDeque<DataEntry>>,
    control: Mutex<VecDeque<ControlEntry>>,
    capacity: usize,
    rtx: Duration,
    stopped: Arc<AtomicCell<bool>>,
}

impl<D: Datagram + 'static> Sender<D> {
    pub fn new(
        channel: Arc<D>,
        capacity: usize,
        rtx: Duration,
        stopped: Arc<AtomicCell<bool>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            data: Mutex::new(VecDeque::new()),
            control: Mutex::new(VecDeque::new()),
            capacity,
            rtx,
            stopped,
        })
    }

    pub fn start(self: &Arc<Self>) {
        let sender = self.clone();
        async_std::task::spawn(async move { sender.run().await });
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.stopped.load() {
                break;
            }
            match self.step() {
                Step::Transmit(bytes, dst) => {
                    if let Err(err) = self.channel.send(&bytes, dst).await {
                        warn!("dispatcher stopping: {}", err);
                        self.stopped.store(true);
                        break;
                    }
                }
                Step::Wait(duration) => Delay::new(duration).await,
            }
        }
    }

    /// Picks the next unit to transmit.
    ///
    /// Queue rotation happens here, under the locks, so a unit is always in
    /// exactly one place when `remove_control`/`acknowledge` look for it.
    /// The actual send runs on a copy after the locks are released.
    fn step(&self) -> Step {
        let now = Instant::now();
        let mut control = self.control.lock().unwrap();
        if let Some(head) = control.front() {
            if let Some(wait) = backoff(head.last_tx, self.rtx, now) {
                return Step::Wait(wait.min(IDLE_WAIT));
            }
            let mut data = self.data.lock().unwrap();
            let target = data.iter().position(|entry| {
                entry.carried.is_none()
                    && factory::can_merge(&entry.segment, entry.dst, &head.message)
            });
            if let Some(i) = target {
                let message = control.pop_front().unwrap().message;
                let mut entry = data.remove(i).unwrap();
                trace!("merge {} into data seq {}", message.ty, entry.segment.seq_num());
                factory::merge(&mut entry.segment, &message);
                entry.carried = Some(message);
                entry.last_tx = Some(now);
                let bytes = entry.segment.bytes().to_vec();
                let dst = entry.dst;
                data.push_back(entry);
                return Step::Transmit(bytes, dst);
            }
            drop(data);
            let mut entry = control.pop_front().unwrap();
            let bytes = factory::control_segment(&entry.message).bytes().to_vec();
            let dst = entry.message.dst;
            entry.last_tx = Some(now);
            control.push_back(entry);
            return Step::Transmit(bytes, dst);
        }
        drop(control);
        let mut data = self.data.lock().unwrap();
        if let Some(head) = data.front() {
            if let Some(wait) = backoff(head.last_tx, self.rtx, now) {
                return Step::Wait(wait.min(IDLE_WAIT));
            }
            let mut entry = data.pop_front().unwrap();
            entry.last_tx = Some(now);
            let bytes = entry.segment.bytes().to_vec();
            let dst = entry.dst;
            data.push_back(entry);
            return Step::Transmit(bytes, dst);
        }
        Step::Wait(IDLE_WAIT)
    }

    /// Enqueues a data segment, waiting while the queue is full.
    pub async fn put_data(&self, segment: Segment, dst: SocketAddr) -> Result<()> {
        PutData {
            sender: self,
            entry: Some(DataEntry {
                segment,
                dst,
                carried: None,
                last_tx: None,
            }),
        }
        .await
    }

    /// Enqueues a control message, waiting while the queue is full.
    pub async fn put_control(&self, message: ControlMessage) -> Result<()> {
        PutControl {
            sender: self,
            entry: Some(ControlEntry {
                message,
                last_tx: None,
            }),
        }
        .await
    }

    /// Transmits a control message exactly once, bypassing both queues.
    pub async fn send_once(&self, message: &ControlMessage) -> Result<()> {
        let segment = factory::control_segment(message);
        self.channel.send(segment.bytes(), message.dst).await?;
        Ok(())
    }

    /// Removes the data segment acknowledged by `ack`, if any.
    ///
    /// A segment is removed at most once; repeated ACKs find nothing. Any
    /// control message the segment carried is confirmed along with it.
    pub fn acknowledge(&self, ack: &ControlMessage) -> bool {
        let mut data = self.data.lock().unwrap();
        let target = data
            .iter()
            .position(|entry| entry.dst == ack.src && entry.segment.seq_num() == ack.ack);
        match target {
            Some(i) => {
                let entry = data.remove(i).unwrap();
                trace!("data seq {} acknowledged", entry.segment.seq_num());
                true
            }
            None => false,
        }
    }

    /// Removes a control message whose reply has been observed, or whose
    /// merge must be invalidated.
    ///
    /// Looks in the control queue first; failing that, finds the data
    /// segment carrying the message and unmerges it, leaving the segment
    /// ordinary again.
    pub fn remove_control(&self, message: &ControlMessage) -> bool {
        {
            let mut control = self.control.lock().unwrap();
            if let Some(i) = control.iter().position(|entry| entry.message == *message) {
                control.remove(i);
                return true;
            }
        }
        let mut data = self.data.lock().unwrap();
        for entry in data.iter_mut() {
            if entry.carried.as_ref() == Some(message) {
                debug_assert!(factory::is_merged_with(&entry.segment, message));
                factory::unmerge(&mut entry.segment);
                entry.carried = None;
                return true;
            }
        }
        false
    }

    /// Number of unacknowledged data segments addressed to `remote`.
    pub fn data_in_flight(&self, remote: SocketAddr) -> usize {
        self.data
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.dst == remote)
            .count()
    }
}

struct PutData<'a, D> {
    sender: &'a Sender<D>,
    entry: Option<DataEntry>,
}

impl<'a, D: Datagram> Future for PutData<'a, D> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        if self.sender.stopped.load() {
            return Poll::Ready(Err(Error::ChannelClosed));
        }
        let mut data = self.sender.data.lock().unwrap();
        if data.len() < self.sender.capacity {
            data.push_back(self.entry.take().unwrap());
            return Poll::Ready(Ok(()));
        }
        cx.waker().clone().wake();
        Poll::Pending
    }
}

struct PutControl<'a, D> {
    sender: &'a Sender<D>,
    entry: Option<ControlEntry>,
}

impl<'a, D: Datagram> Future for PutControl<'a, D> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        if self.sender.stopped.load() {
            return Poll::Ready(Err(Error::ChannelClosed));
        }
        let mut control = self.sender.control.lock().unwrap();
        if control.len() < self.sender.capacity {
            control.push_back(self.entry.take().unwrap());
            return Poll::Ready(Ok(()));
        }
        cx.waker().clone().wake();
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentType;
    use async_std::task;
    use channel::LoopbackNet;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn setup(capacity: usize) -> (Arc<Sender<channel::LoopbackEndpoint>>, channel::LoopbackEndpoint) {
        let net = LoopbackNet::new();
        let endpoint = Arc::new(net.endpoint(addr(1)));
        let peer = net.endpoint(addr(2));
        let stopped = Arc::new(AtomicCell::new(false));
        let sender = Sender::new(endpoint, capacity, Duration::from_millis(0), stopped);
        (sender, peer)
    }

    fn syn(seq: u16) -> ControlMessage {
        ControlMessage {
            ty: SegmentType::Syn,
            src: addr(1),
            dst: addr(2),
            seq,
            ack: 0,
        }
    }

    async fn recv_segment(peer: &channel::LoopbackEndpoint) -> Segment {
        let (bytes, _) = peer.recv().await.unwrap();
        Segment::parse(bytes).unwrap()
    }

    async fn control_blocks_data() -> Result<()> {
        let (sender, peer) = setup(8);
        let data = factory::data_segment(5, addr(1), addr(2), b"payload");
        sender.put_data(data, addr(2)).await?;
        let message = syn(9); // seq differs from the data segment, no merge
        sender.put_control(message.clone()).await?;
        sender.start();

        // while the control message is pending, data never goes out
        for _ in 0..10 {
            let segment = recv_segment(&peer).await;
            assert_eq!(segment.ty(), SegmentType::Syn);
        }
        assert!(sender.remove_control(&message));
        loop {
            let segment = recv_segment(&peer).await;
            if segment.ty() == SegmentType::Ordinary {
                assert_eq!(segment.seq_num(), 5);
                assert_eq!(segment.payload(), b"payload");
                break;
            }
        }
        sender.stopped.store(true);
        Ok(())
    }

    #[test]
    fn test_control_blocks_data() {
        task::block_on(control_blocks_data()).unwrap();
    }

    async fn merge_piggybacks_on_data() -> Result<()> {
        let (sender, peer) = setup(8);
        let data = factory::data_segment(5, addr(1), addr(2), b"payload");
        sender.put_data(data, addr(2)).await?;
        let ack = factory::data_ack(77, addr(1), addr(2));
        sender.put_control(ack.clone()).await?;
        sender.start();

        let segment = recv_segment(&peer).await;
        assert_eq!(segment.ty(), SegmentType::Ack);
        assert_eq!(segment.ack_num(), 77);
        assert_eq!(segment.payload(), b"payload");

        // invalidating the merge restores the ordinary segment
        assert!(sender.remove_control(&ack));
        loop {
            let segment = recv_segment(&peer).await;
            if segment.ty() == SegmentType::Ordinary {
                assert_eq!(segment.ack_num(), 0);
                assert_eq!(segment.payload(), b"payload");
                break;
            }
        }
        sender.stopped.store(true);
        Ok(())
    }

    #[test]
    fn test_merge_piggybacks_on_data() {
        task::block_on(merge_piggybacks_on_data()).unwrap();
    }

    async fn data_round_robin() -> Result<()> {
        let (sender, peer) = setup(8);
        sender
            .put_data(factory::data_segment(1, addr(1), addr(2), b"a"), addr(2))
            .await?;
        sender
            .put_data(factory::data_segment(2, addr(1), addr(2), b"b"), addr(2))
            .await?;
        sender.start();

        let first = recv_segment(&peer).await.seq_num();
        let second = recv_segment(&peer).await.seq_num();
        let third = recv_segment(&peer).await.seq_num();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(third, 1); // back to the head: continuous retransmission
        sender.stopped.store(true);
        Ok(())
    }

    #[test]
    fn test_data_round_robin() {
        task::block_on(data_round_robin()).unwrap();
    }

    #[test]
    fn test_acknowledge_removes_exactly_once() {
        task::block_on(async {
            let (sender, _peer) = setup(8);
            sender
                .put_data(factory::data_segment(5, addr(1), addr(2), b"x"), addr(2))
                .await
                .unwrap();
            assert_eq!(sender.data_in_flight(addr(2)), 1);
            let ack = ControlMessage {
                ty: SegmentType::Ack,
                src: addr(2),
                dst: addr(1),
                seq: 0,
                ack: 5,
            };
            assert!(sender.acknowledge(&ack));
            assert_eq!(sender.data_in_flight(addr(2)), 0);
            assert!(!sender.acknowledge(&ack));
        });
    }

    #[test]
    fn test_send_once_bypasses_queues() {
        task::block_on(async {
            let (sender, peer) = setup(8);
            sender.send_once(&syn(3)).await.unwrap();
            let segment = recv_segment(&peer).await;
            assert_eq!(segment.ty(), SegmentType::Syn);
            assert_eq!(segment.seq_num(), 3);
            assert_eq!(sender.data_in_flight(addr(2)), 0);
        });
    }

    #[test]
    fn test_put_blocks_when_full() {
        task::block_on(async {
            let (sender, _peer) = setup(1);
            sender
                .put_data(factory::data_segment(1, addr(1), addr(2), b"a"), addr(2))
                .await
                .unwrap();
            let queued = Arc::new(AtomicCell::new(false));
            let flag = queued.clone();
            let blocked = sender.clone();
            task::spawn(async move {
                blocked
                    .put_data(factory::data_segment(2, addr(1), addr(2), b"b"), addr(2))
                    .await
                    .unwrap();
                flag.store(true);
            });
            Delay::new(Duration::from_millis(20)).await;
            assert!(!queued.load());
            let ack = ControlMessage {
                ty: SegmentType::Ack,
                src: addr(2),
                dst: addr(1),
                seq: 0,
                ack: 1,
            };
            assert!(sender.acknowledge(&ack));
            Delay::new(Duration::from_millis(20)).await;
            assert!(queued.load());
        });
    }
}
