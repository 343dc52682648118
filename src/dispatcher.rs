//! Command dispatch: outbound commands with acknowledgment tracking and
//! retries, inbound frames through the protocol's descriptor table.

use crate::codec::Frame;
use crate::config::Backoff;
use crate::error::{Result, SessionError};
use crate::protocol::{Direction, Params, Protocol, StateUpdate};
use crate::session::Session;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Continuation resolved with the acknowledging frame, or `None` for
/// commands that are not acknowledged.
pub type Reply = oneshot::Sender<Result<Option<Frame>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Wait after transmission `attempt` (0 for the first send).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.timeout,
            Backoff::Linear => self.timeout.saturating_mul(attempt + 1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(5),
            backoff: Backoff::Fixed,
        }
    }
}

/// A command waiting for its acknowledgment.
#[derive(Debug)]
pub struct PendingCommand {
    pub cmd: u32,
    pub frame: Frame,
    pub sent_at: Instant,
    pub retry_count: u32,
    pub deadline: Instant,
    reply: Option<Reply>,
}

impl PendingCommand {
    fn resolve(mut self, result: Result<Option<Frame>>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

#[derive(Debug)]
struct Queued {
    cmd: u32,
    frame: Frame,
    reply: Option<Reply>,
}

/// What an inbound frame requires, in the order it must happen.
#[derive(Debug, Default)]
pub struct Inbound {
    /// Acknowledgment to write before anything else.
    pub ack: Option<Frame>,
    /// Queued commands released by a resolved acknowledgment.
    pub released: Vec<Frame>,
    pub updates: Vec<StateUpdate>,
    pub follow_ups: Vec<(u32, Params)>,
}

pub struct Dispatcher {
    protocol: Arc<dyn Protocol>,
    policy: RetryPolicy,
    seqno: u32,
    pending: HashMap<u32, PendingCommand>,
    queued: HashMap<u32, VecDeque<Queued>>,
}

impl Dispatcher {
    pub fn new(protocol: Arc<dyn Protocol>, policy: RetryPolicy) -> Self {
        Self {
            protocol,
            policy,
            seqno: 1,
            pending: HashMap::new(),
            queued: HashMap::new(),
        }
    }

    /// Sequence numbers restart with every connection.
    pub fn reset(&mut self) {
        self.seqno = 1;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Builds a command and returns the frame to write now.
    ///
    /// Returns `Ok(None)` when the command was queued behind another one with
    /// the same correlation id. On error the reply has already been failed.
    pub fn send(
        &mut self,
        session: &Session,
        cmd: u32,
        params: &Params,
        reply: Option<Reply>,
        now: Instant,
    ) -> Result<Option<Frame>> {
        match self.prepare(session, cmd, params) {
            Ok((frame, ack_required)) => Ok(self.submit(cmd, frame, ack_required, reply, now)),
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e.clone()));
                }
                Err(e)
            }
        }
    }

    fn prepare(&mut self, session: &Session, cmd: u32, params: &Params) -> Result<(Frame, bool)> {
        let descriptor = self
            .protocol
            .descriptor(cmd, Direction::Outbound)
            .ok_or(SessionError::UnknownCommandType(cmd))?;
        if !descriptor.handshake && !session.is_ready() {
            return Err(SessionError::NotReady);
        }
        let mut frame = self.protocol.build(cmd, params, session)?;
        frame.seqno = self.seqno;
        self.seqno = self.seqno.wrapping_add(1);
        debug!(
            "Dispatching {} (0x{:02X}) seqno={} to {}",
            descriptor.name,
            frame.cmd,
            frame.seqno,
            session.device_id()
        );
        Ok((frame, descriptor.ack_required))
    }

    fn submit(
        &mut self,
        cmd: u32,
        frame: Frame,
        ack_required: bool,
        reply: Option<Reply>,
        now: Instant,
    ) -> Option<Frame> {
        if !ack_required {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(None));
            }
            return Some(frame);
        }
        let id = self.protocol.correlation_out(&frame);
        if self.pending.contains_key(&id) {
            debug!("Correlation id {} busy, queueing 0x{:02X}", id, cmd);
            self.queued
                .entry(id)
                .or_default()
                .push_back(Queued { cmd, frame, reply });
            return None;
        }
        self.track(id, cmd, frame.clone(), reply, now);
        Some(frame)
    }

    fn track(&mut self, id: u32, cmd: u32, frame: Frame, reply: Option<Reply>, now: Instant) {
        self.pending.insert(
            id,
            PendingCommand {
                cmd,
                frame,
                sent_at: now,
                retry_count: 0,
                deadline: now + self.policy.delay(0),
                reply,
            },
        );
    }

    /// Moves the next queued command for `id` into flight.
    fn release(&mut self, id: u32, now: Instant) -> Option<Frame> {
        let queue = self.queued.get_mut(&id)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.queued.remove(&id);
        }
        let next = next?;
        self.track(id, next.cmd, next.frame.clone(), next.reply, now);
        Some(next.frame)
    }

    /// Routes an inbound frame.
    ///
    /// Errors mean the frame was unusable and has been dropped without an
    /// acknowledgment.
    pub fn on_frame(&mut self, session: &Session, frame: Frame, now: Instant) -> Result<Inbound> {
        let frame = self.protocol.open(frame, session)?;
        let descriptor = match self.protocol.descriptor(frame.cmd, Direction::Inbound) {
            Some(d) => d,
            None => {
                debug!(
                    "Unknown command type 0x{:02X} from {}, using fallback",
                    frame.cmd,
                    session.device_id()
                );
                self.protocol.fallback()
            }
        };
        if !descriptor.accepts_len(frame.payload.len()) {
            return Err(SessionError::FrameLengthMismatch {
                declared: descriptor.payload_len,
                actual: frame.payload.len(),
            });
        }

        let mut inbound = Inbound::default();
        if descriptor.ack_required && !self.protocol.is_ack(&frame) {
            inbound.ack = self.protocol.ack_for(&frame);
        }

        if let Some(id) = self.protocol.correlation_in(&frame) {
            if let Some(pending) = self.pending.remove(&id) {
                debug!(
                    "0x{:02X} acknowledged after {:?}",
                    pending.cmd,
                    now.saturating_duration_since(pending.sent_at)
                );
                pending.resolve(Ok(Some(frame.clone())));
                inbound.released.extend(self.release(id, now));
            }
        }

        match (descriptor.handler)(&frame) {
            Ok(outcome) => {
                inbound.updates = outcome.updates;
                inbound.follow_ups = outcome.follow_ups;
            }
            Err(e) => warn!(
                "Handler for {} (0x{:02X}) failed on {}: {}",
                descriptor.name,
                frame.cmd,
                session.device_id(),
                e
            ),
        }
        Ok(inbound)
    }

    /// Retransmits or expires commands whose deadline has passed and returns
    /// the frames to write.
    pub fn on_timer(&mut self, now: Instant) -> Vec<Frame> {
        let mut due: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        due.sort_unstable();

        let mut out = Vec::new();
        for id in due {
            let Some(pending) = self.pending.get_mut(&id) else {
                continue;
            };
            if pending.retry_count < self.policy.max_retries {
                pending.retry_count += 1;
                pending.sent_at = now;
                pending.deadline = now + self.policy.delay(pending.retry_count);
                debug!(
                    "Retransmitting 0x{:02X} (retry {}/{})",
                    pending.cmd, pending.retry_count, self.policy.max_retries
                );
                out.push(pending.frame.clone());
            } else if let Some(pending) = self.pending.remove(&id) {
                let err = SessionError::CommandTimeout {
                    code: pending.cmd,
                    attempts: pending.retry_count + 1,
                };
                warn!("{}", err);
                pending.resolve(Err(err));
                out.extend(self.release(id, now));
            }
        }
        out
    }

    /// Fails every pending and queued command with `err`.
    pub fn cancel_all(&mut self, err: &SessionError) {
        for (_, pending) in self.pending.drain() {
            pending.resolve(Err(err.clone()));
        }
        for (_, queue) in self.queued.drain() {
            for queued in queue {
                if let Some(reply) = queued.reply {
                    let _ = reply.send(Err(err.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::powermax::{PowermaxProtocol, ReceiveType};
    use crate::session::ConnectionState;
    use crate::tuya::{self, CommandType, TuyaProtocol, Version};
    use serde_json::json;

    fn ready(session: &mut Session) {
        session.set_state(ConnectionState::Ready);
    }

    fn panel() -> (Dispatcher, Session) {
        let mut session = Session::new("panel", "1", Vec::new());
        ready(&mut session);
        let dispatcher = Dispatcher::new(Arc::new(PowermaxProtocol::new()), RetryPolicy::default());
        (dispatcher, session)
    }

    #[test]
    fn rejects_commands_before_ready() {
        let protocol = Arc::new(TuyaProtocol::new(Version::V3_4));
        let mut dispatcher = Dispatcher::new(protocol, RetryPolicy::default());
        let session = Session::new("dev", "3.4", b"0123456789abcdef".to_vec());
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        let err = dispatcher
            .send(&session, CommandType::DpQuery as u32, &Params::None, Some(tx), now)
            .unwrap_err();
        assert_eq!(err, SessionError::NotReady);
        assert_eq!(rx.try_recv().unwrap(), Err(SessionError::NotReady));

        let hello = dispatcher
            .send(
                &session,
                CommandType::SessKeyNegStart as u32,
                &Params::Raw(vec![1; 16]),
                None,
                now,
            )
            .unwrap();
        assert!(hello.is_some());
    }

    #[test]
    fn ack_precedes_updates() {
        let (mut dispatcher, session) = panel();
        let payload = vec![1, 0, 4, 0x03, 0, 0, 0, 0, 0, 0, 0];
        let inbound = dispatcher
            .on_frame(&session, Frame::new(ReceiveType::Panel as u32, payload), Instant::now())
            .unwrap();
        assert_eq!(inbound.ack, Some(Frame::new(0x02, Vec::new())));
        assert_eq!(
            inbound.updates,
            vec![StateUpdate::Event { kind: "panel", source: 4, code: 0x03 }]
        );
    }

    #[test]
    fn ack_is_never_acknowledged() {
        let (mut dispatcher, session) = panel();
        let inbound = dispatcher
            .on_frame(&session, Frame::new(0x02, Vec::new()), Instant::now())
            .unwrap();
        assert!(inbound.ack.is_none());
    }

    #[test]
    fn unknown_inbound_uses_fallback() {
        let (mut dispatcher, session) = panel();
        let inbound = dispatcher
            .on_frame(&session, Frame::new(0x77, vec![9]), Instant::now())
            .unwrap();
        assert!(inbound.ack.is_some(), "unknown panel messages are still acknowledged");
        assert!(inbound.updates.is_empty());
    }

    #[test]
    fn descriptor_length_is_enforced() {
        let (mut dispatcher, session) = panel();
        let err = dispatcher
            .on_frame(&session, Frame::new(ReceiveType::Panel as u32, vec![0; 4]), Instant::now())
            .unwrap_err();
        assert_eq!(err, SessionError::FrameLengthMismatch { declared: 11, actual: 4 });
    }

    #[test]
    fn ack_resolves_pending_and_releases_queue() {
        let (mut dispatcher, session) = panel();
        let now = Instant::now();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();

        let first = dispatcher.send(&session, 0xA2, &Params::None, Some(tx1), now).unwrap();
        assert!(first.is_some());
        let second = dispatcher.send(&session, 0xA0, &Params::None, Some(tx2), now).unwrap();
        assert!(second.is_none());
        assert_eq!(dispatcher.queued_count(), 1);

        let inbound = dispatcher
            .on_frame(&session, Frame::new(0x02, Vec::new()), now)
            .unwrap();
        assert!(matches!(rx1.try_recv(), Ok(Ok(Some(_)))));
        assert_eq!(inbound.released.len(), 1);
        assert_eq!(inbound.released[0].cmd, 0xA0);
        assert!(rx2.try_recv().is_err());
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[test]
    fn retries_then_times_out() {
        let (mut dispatcher, session) = panel();
        let start = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        dispatcher.send(&session, 0xA2, &Params::None, Some(tx), start).unwrap();

        let mut retransmissions = 0;
        let mut now = start;
        for _ in 0..10 {
            now += Duration::from_secs(5);
            retransmissions += dispatcher.on_timer(now).len();
        }
        assert_eq!(retransmissions, 3);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(SessionError::CommandTimeout { code: 0xA2, attempts: 4 })
        );
        assert!(dispatcher.next_deadline().is_none());
    }

    #[test]
    fn linear_backoff_grows() {
        let policy = RetryPolicy {
            backoff: Backoff::Linear,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(15));
    }

    #[test]
    fn tuya_reply_resolves_by_seqno() {
        let protocol = Arc::new(TuyaProtocol::new(Version::V3_4));
        let mut dispatcher = Dispatcher::new(protocol, RetryPolicy::default());
        let mut session = Session::new("dev", "3.4", b"0123456789abcdef".to_vec());
        ready(&mut session);
        let now = Instant::now();

        let (tx, mut rx) = oneshot::channel();
        let frame = dispatcher
            .send(
                &session,
                CommandType::Control as u32,
                &tuya::set_dps(json!({"1": true})),
                Some(tx),
                now,
            )
            .unwrap()
            .unwrap();

        let push = Frame::new(CommandType::Status as u32, br#"{"dps":{"1":true}}"#.to_vec())
            .with_seqno(frame.seqno);
        let inbound = dispatcher.on_frame(&session, push, now).unwrap();
        assert_eq!(inbound.updates.len(), 1);
        assert!(rx.try_recv().is_err(), "reports do not resolve commands");

        let reply = Frame::new(CommandType::ControlNew as u32, Vec::new()).with_seqno(frame.seqno);
        dispatcher.on_frame(&session, reply, now).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Ok(Some(_)))));
    }

    #[test]
    fn cancel_all_fails_everything() {
        let (mut dispatcher, session) = panel();
        let now = Instant::now();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        dispatcher.send(&session, 0xA2, &Params::None, Some(tx1), now).unwrap();
        dispatcher.send(&session, 0xA2, &Params::None, Some(tx2), now).unwrap();
        dispatcher.cancel_all(&SessionError::Cancelled);
        assert_eq!(rx1.try_recv().unwrap(), Err(SessionError::Cancelled));
        assert_eq!(rx2.try_recv().unwrap(), Err(SessionError::Cancelled));
        assert_eq!(dispatcher.pending_count() + dispatcher.queued_count(), 0);
    }
}
