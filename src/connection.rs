//! Connection lifecycle: state machine, handshake and teardown.
//!
//! The open handshake follows the classic three steps. The active side
//! sends SYN with a random sequence number A and blocks for a SYNACK
//! acknowledging A+1; the passive side blocks for any SYN, answers with
//! SYNACK carrying its own random sequence number B and ack A+1, and blocks
//! for the final ACK (seq A+1, ack B+1). Teardown mirrors the same exchange
//! with FIN and FINACK, completed here where the reference left it open:
//! in-flight data drains first, a concurrent peer FIN is answered instead
//! of deadlocking, and the wait for the non-retransmitted final ACK is
//! bounded.
use crate::error::{Error, Result};
use crate::factory;
use crate::message::{ControlMessage, Matcher};
use crate::receiver::Receiver;
use crate::segment::{seq_add, SegmentType};
use crate::sender::Sender;
use crate::Config;
use channel::Datagram;
use crossbeam::atomic::AtomicCell;
use futures_timer::Delay;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// The lifecycle states of a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnState {
    /// No connection exists.
    Closed,
    /// A local endpoint is attached.
    Bound,
    /// Passively waiting for incoming connections.
    Listen,
    /// Active open: SYN sent, awaiting SYNACK.
    SynSent,
    /// Passive open: SYN received, SYNACK sent, awaiting the final ACK.
    SynReceived,
    /// Handshake complete; data may flow.
    Established,
    /// Active teardown: FIN sent, awaiting FINACK.
    FinSent,
    /// Passive teardown: peer FIN received, FINACK sent, awaiting the
    /// final ACK.
    FinReceived,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ConnState::Closed => "CLOSED",
            ConnState::Bound => "BOUND",
            ConnState::Listen => "LISTEN",
            ConnState::SynSent => "SYN_SENT",
            ConnState::SynReceived => "SYN_RECEIVED",
            ConnState::Established => "ESTABLISHED",
            ConnState::FinSent => "FIN_SENT",
            ConnState::FinReceived => "FIN_RECEIVED",
        };
        write!(f, "{}", name)
    }
}

/// Atomically moves `state` from `expected` to `next`.
pub(crate) fn transition(
    state: &AtomicCell<ConnState>,
    expected: ConnState,
    next: ConnState,
) -> Result<()> {
    let found = state.compare_and_swap(expected, next);
    if found == expected {
        Ok(())
    } else {
        Err(Error::InvalidState { expected, found })
    }
}

/// Everything a connection handle shares: the channel, the two worker
/// tasks and the configuration.
pub(crate) struct Core<D> {
    pub channel: Arc<D>,
    pub sender: Arc<Sender<D>>,
    pub receiver: Arc<Receiver<D>>,
    pub local: SocketAddr,
    pub config: Config,
    stopped: Arc<AtomicCell<bool>>,
    started: AtomicCell<bool>,
}

impl<D: Datagram + 'static> Core<D> {
    pub fn new(channel: D, config: Config) -> Result<Arc<Self>> {
        let local = channel.local_addr()?;
        let channel = Arc::new(channel);
        let stopped = Arc::new(AtomicCell::new(false));
        let sender = Sender::new(
            channel.clone(),
            config.queue_capacity,
            config.rtx,
            stopped.clone(),
        );
        let receiver = Receiver::new(
            channel.clone(),
            sender.clone(),
            local,
            config.pending_capacity,
            stopped.clone(),
        );
        Ok(Arc::new(Self {
            channel,
            sender,
            receiver,
            local,
            config,
            stopped,
            started: AtomicCell::new(false),
        }))
    }

    /// Starts the dispatcher and demultiplexer tasks, once.
    pub fn start(&self) {
        if !self.started.swap(true) {
            self.sender.start();
            self.receiver.start();
        }
    }

    /// Stops both worker tasks and releases the channel.
    pub async fn stop(&self) {
        if self.stopped.swap(true) {
            return;
        }
        // nudge the demultiplexer out of its blocking recv
        self.channel.send(&[], self.local).await.ok();
    }

    fn handshake_deadline(&self) -> Option<Instant> {
        self.config.handshake.map(|timeout| Instant::now() + timeout)
    }

    /// Active open. Returns the first data sequence number.
    pub async fn open_active(&self, remote: SocketAddr) -> Result<u16> {
        self.start();
        let syn = factory::open_or_close(SegmentType::Syn, self.local, remote);
        debug!("SYN seq {} -> {}", syn.seq, remote);
        self.sender.put_control(syn.clone()).await?;
        let deadline = self.handshake_deadline();
        let synack = match self
            .receiver
            .await_control(vec![factory::reply_matcher(&syn)], deadline)
            .await
        {
            Ok(message) => message,
            Err(err) => {
                // leave no trace of the cancelled attempt
                self.sender.remove_control(&syn);
                return Err(err);
            }
        };
        self.sender.remove_control(&syn);
        let ack = factory::final_ack(&synack);
        self.sender.send_once(&ack).await?;
        self.receiver.record_replay(&synack, &ack);
        debug!("established with {}", remote);
        Ok(seq_add(syn.seq, 2))
    }

    /// Passive open. Returns the peer endpoint and the first data sequence
    /// number once the handshake completes.
    pub async fn open_passive(
        &self,
        state: &AtomicCell<ConnState>,
    ) -> Result<(SocketAddr, u16)> {
        self.start();
        let syn = self
            .receiver
            .await_control(
                vec![factory::open_matcher(SegmentType::Syn, self.local)],
                None,
            )
            .await?;
        state.store(ConnState::SynReceived);
        debug!("SYN seq {} from {}", syn.seq, syn.src);
        let synack = factory::reply(self.local, &syn);
        self.sender.put_control(synack.clone()).await?;
        let deadline = self.handshake_deadline();
        let matcher = factory::final_ack_matcher(&syn, &synack);
        if let Err(err) = self.receiver.await_control(vec![matcher], deadline).await {
            self.sender.remove_control(&synack);
            return Err(err);
        }
        self.sender.remove_control(&synack);
        debug!("established with {}", syn.src);
        Ok((syn.src, seq_add(synack.seq, 2)))
    }

    /// Runs the FIN exchange with `remote` and leaves `state` at
    /// [`ConnState::Closed`] when it returns successfully.
    pub async fn teardown(
        &self,
        remote: SocketAddr,
        state: &AtomicCell<ConnState>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.config.close;
        // finish in-flight sends best-effort before signalling FIN
        while self.sender.data_in_flight(remote) > 0 && Instant::now() < deadline {
            Delay::new(Duration::from_millis(1)).await;
        }
        let mut fin_matcher = factory::open_matcher(SegmentType::Fin, self.local);
        fin_matcher.src = Some(remote);
        let result = match self.receiver.try_take_pending(&fin_matcher) {
            Some(fin) => {
                state.store(ConnState::FinReceived);
                self.answer_fin(&fin, deadline).await
            }
            None => {
                state.store(ConnState::FinSent);
                self.close_active(remote, fin_matcher, deadline).await
            }
        };
        state.store(ConnState::Closed);
        match result {
            // an exchange that ran out its deadline still counts as closed;
            // the peer is either gone or converging on its own deadline
            Err(Error::Cancelled) => Ok(()),
            other => other,
        }
    }

    /// Initiator side of the teardown. Also answers a FIN the peer sends
    /// concurrently, so two peers closing at once both converge.
    async fn close_active(
        &self,
        remote: SocketAddr,
        fin_matcher: Matcher,
        deadline: Instant,
    ) -> Result<()> {
        let fin = factory::open_or_close(SegmentType::Fin, self.local, remote);
        debug!("FIN seq {} -> {}", fin.seq, remote);
        self.sender.put_control(fin.clone()).await?;
        let finack_matcher = factory::reply_matcher(&fin);
        let mut answered: Option<(ControlMessage, Matcher)> = None;
        let cleanup = |answered: &Option<(ControlMessage, Matcher)>| {
            self.sender.remove_control(&fin);
            if let Some((sent, _)) = answered {
                self.sender.remove_control(sent);
            }
        };
        let finack = loop {
            let message = match self
                .receiver
                .await_control(
                    vec![finack_matcher.clone(), fin_matcher.clone()],
                    Some(deadline),
                )
                .await
            {
                Ok(message) => message,
                Err(err) => {
                    cleanup(&answered);
                    return Err(err);
                }
            };
            match message.ty {
                SegmentType::FinAck => break message,
                SegmentType::Fin if answered.is_none() => {
                    // simultaneous close: answer the peer and keep waiting
                    // for the FINACK of our own FIN
                    let reply = factory::reply(self.local, &message);
                    if let Err(err) = self.sender.put_control(reply.clone()).await {
                        cleanup(&answered);
                        return Err(err);
                    }
                    let matcher = factory::final_ack_matcher(&message, &reply);
                    answered = Some((reply, matcher));
                }
                _ => {}
            }
        };
        self.sender.remove_control(&fin);
        let ack = factory::final_ack(&finack);
        self.sender.send_once(&ack).await?;
        self.receiver.record_replay(&finack, &ack);
        match answered {
            Some((sent, matcher)) => self.await_final_ack(&sent, matcher, deadline).await?,
            None => {
                // the peer may have initiated its own close meanwhile
                if let Some(peer_fin) = self.receiver.try_take_pending(&fin_matcher) {
                    self.answer_fin(&peer_fin, deadline).await?;
                }
            }
        }
        Ok(())
    }

    /// Responder side of the teardown: FINACK the peer's FIN and wait for
    /// its final ACK.
    async fn answer_fin(&self, fin: &ControlMessage, deadline: Instant) -> Result<()> {
        debug!("FINACK -> {}", fin.src);
        let reply = factory::reply(self.local, fin);
        self.sender.put_control(reply.clone()).await?;
        let matcher = factory::final_ack_matcher(fin, &reply);
        self.await_final_ack(&reply, matcher, deadline).await
    }

    /// Waits for the final ACK confirming `sent`.
    ///
    /// The peer does not retransmit that ACK, so the wait is bounded: at
    /// the deadline the FINACK is dropped from the queue and the teardown
    /// counts as complete anyway.
    async fn await_final_ack(
        &self,
        sent: &ControlMessage,
        matcher: Matcher,
        deadline: Instant,
    ) -> Result<()> {
        let result = self.receiver.await_control(vec![matcher], Some(deadline)).await;
        self.sender.remove_control(sent);
        match result {
            Ok(_) | Err(Error::Cancelled) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
