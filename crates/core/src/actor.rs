// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cooperative actors on top of [`TaskCenter`].
//!
//! An actor owns its state and processes one message at a time. Messages arrive through
//! its mailbox (from [`ActorHandle`]s), from itself ([`ActorContext::submit`]) or from its
//! timer queue ([`ActorContext::schedule`]). The actor's state is never touched outside of
//! its own turns, so callbacks of one actor execute strictly sequentially.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use keel_types::identifiers::PartitionId;

use crate::metric_definitions::{ACTOR_MESSAGES, ACTOR_TIMERS_FIRED, ACTOR_TURN_DURATION};
use crate::{cancellation_token, ShutdownError, TaskCenter, TaskId, TaskKind};

#[async_trait]
pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;

    fn name(&self) -> &'static str;

    /// Runs once before the first message is handled. Returning an error stops the actor
    /// without calling [`Actor::on_stop`].
    async fn on_start(&mut self, _ctx: &mut ActorContext<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handles a single message. Returning an error stops the actor.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext<Self>,
    ) -> anyhow::Result<()>;

    /// Runs once after the last message was handled.
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self>) {}
}

/// The sending half of a [`ActorHandle::call`]. The actor completes the call by sending
/// the result on its own turn.
#[derive(Debug)]
pub struct Reply<T>(oneshot::Sender<T>);

impl<T> Reply<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Completes the call. Ignores callers that gave up waiting.
    pub fn send(self, value: T) {
        let _ = self.0.send(value);
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// A cloneable reference to a running actor.
pub struct ActorHandle<A: Actor> {
    sender: mpsc::Sender<A::Message>,
}

impl<A: Actor> Clone for ActorHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Actor> ActorHandle<A> {
    /// Enqueues a message, waiting for mailbox capacity.
    pub async fn submit(&self, msg: A::Message) -> Result<(), ShutdownError> {
        self.sender.send(msg).await.map_err(|_| ShutdownError)
    }

    /// Enqueues a message if the mailbox has capacity. Returns the message back otherwise.
    pub fn try_submit(&self, msg: A::Message) -> Result<(), TrySubmitError<A::Message>> {
        self.sender.try_send(msg).map_err(|err| match err {
            mpsc::error::TrySendError::Full(msg) => TrySubmitError::Full(msg),
            mpsc::error::TrySendError::Closed(msg) => TrySubmitError::Stopped(msg),
        })
    }

    /// Sends a request and waits for the actor to answer it on its own turn.
    pub async fn call<T>(
        &self,
        make_msg: impl FnOnce(Reply<T>) -> A::Message,
    ) -> Result<T, ShutdownError> {
        let (reply, rx) = Reply::new();
        self.submit(make_msg(reply)).await?;
        rx.await.map_err(|_| ShutdownError)
    }

    /// Whether the actor stopped.
    pub fn is_stopped(&self) -> bool {
        self.sender.is_closed()
    }

    /// Completes once the actor stopped and dropped its mailbox.
    pub async fn stopped(&self) {
        self.sender.closed().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrySubmitError<M> {
    #[error("actor mailbox is full")]
    Full(M),
    #[error("actor has stopped")]
    Stopped(M),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
#[display("timer-{_0}")]
pub struct TimerId(u64);

enum TimerPayload<M> {
    Once(M),
    Interval {
        period: Duration,
        make_msg: Box<dyn FnMut() -> M + Send>,
    },
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    deadline: Instant,
    id: TimerId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.id.0.cmp(&other.id.0))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimerEntry {}

struct Timers<M> {
    next_id: u64,
    queue: BinaryHeap<Reverse<TimerEntry>>,
    payloads: HashMap<TimerId, TimerPayload<M>>,
}

impl<M> Timers<M> {
    fn new() -> Self {
        Self {
            next_id: 0,
            queue: BinaryHeap::new(),
            payloads: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    fn insert(&mut self, deadline: Instant, payload: TimerPayload<M>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.queue.push(Reverse(TimerEntry { deadline, id }));
        self.payloads.insert(id, payload);
        id
    }

    fn cancel(&mut self, id: TimerId) -> bool {
        // the queue entry is skipped once it surfaces
        self.payloads.remove(&id).is_some()
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        loop {
            let Reverse(head) = *self.queue.peek()?;
            if self.payloads.contains_key(&head.id) {
                return Some(head.deadline);
            }
            // cancelled
            self.queue.pop();
        }
    }

    /// Pops the earliest live timer if its deadline is not after `now`.
    fn pop_expired(&mut self, now: Instant) -> Option<M> {
        let deadline = self.next_deadline()?;
        if deadline > now {
            return None;
        }
        let Reverse(head) = self.queue.pop()?;
        match self.payloads.remove(&head.id)? {
            TimerPayload::Once(msg) => Some(msg),
            TimerPayload::Interval {
                period,
                mut make_msg,
            } => {
                let msg = make_msg();
                self.queue.push(Reverse(TimerEntry {
                    deadline: head.deadline + period,
                    id: head.id,
                }));
                self.payloads
                    .insert(head.id, TimerPayload::Interval { period, make_msg });
                Some(msg)
            }
        }
    }

    /// Waits for the earliest live timer. Cancel safe: no timer is consumed before its
    /// deadline has passed.
    async fn next_expired(&mut self) -> M {
        loop {
            let Some(deadline) = self.next_deadline() else {
                return futures::future::pending().await;
            };
            tokio::time::sleep_until(deadline).await;
            if let Some(msg) = self.pop_expired(Instant::now()) {
                return msg;
            }
        }
    }
}

/// Gives an actor access to its own mailbox and timers during a turn.
pub struct ActorContext<A: Actor> {
    name: &'static str,
    self_sender: mpsc::WeakSender<A::Message>,
    local_queue: VecDeque<A::Message>,
    timers: Timers<A::Message>,
    cancellation: CancellationToken,
    stop_requested: bool,
}

impl<A: Actor> ActorContext<A> {
    /// Schedules `msg` to be handled by this actor in a later turn. Messages submitted to self
    /// are handled in submission order, interleaved with mailbox messages.
    pub fn submit(&mut self, msg: A::Message) {
        self.local_queue.push_back(msg);
    }

    /// Delivers `msg` to this actor once `delay` has passed.
    pub fn schedule(&mut self, delay: Duration, msg: A::Message) -> TimerId {
        self.timers
            .insert(Instant::now() + delay, TimerPayload::Once(msg))
    }

    /// Delivers a message created by `make_msg` every `period`, starting one period from now.
    pub fn schedule_at_interval(
        &mut self,
        period: Duration,
        make_msg: impl FnMut() -> A::Message + Send + 'static,
    ) -> TimerId {
        self.timers.insert(
            Instant::now() + period,
            TimerPayload::Interval {
                period,
                make_msg: Box::new(make_msg),
            },
        )
    }

    /// Cancels a scheduled message. Returns false if it already fired (one-shot timers) or
    /// was cancelled before.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Stops the actor after the current turn.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// A handle to this actor, e.g. for background work that reports back. None if the actor
    /// is stopping.
    pub fn handle(&self) -> Option<ActorHandle<A>> {
        self.self_sender
            .upgrade()
            .map(|sender| ActorHandle { sender })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl TaskCenter {
    /// Spawns `actor` as a task of `kind` with a mailbox of `mailbox_capacity` messages.
    pub fn spawn_actor<A: Actor>(
        &self,
        kind: TaskKind,
        partition_id: Option<PartitionId>,
        mailbox_capacity: usize,
        actor: A,
    ) -> Result<(ActorHandle<A>, TaskId), ShutdownError> {
        let (sender, mailbox) = mpsc::channel(mailbox_capacity.max(1));
        let name = actor.name();
        let self_sender = sender.downgrade();
        let task_id = self.spawn(kind, name, partition_id, async move {
            let ctx = ActorContext {
                name,
                self_sender,
                local_queue: VecDeque::new(),
                timers: Timers::new(),
                cancellation: cancellation_token(),
                stop_requested: false,
            };
            run_actor(actor, ctx, mailbox).await
        })?;
        Ok((ActorHandle { sender }, task_id))
    }
}

enum Turn<M> {
    Message(M),
    Timer(M),
    MailboxClosed,
    Stop,
}

impl<A: Actor> ActorContext<A> {
    /// Picks work that is ready right now. Mailbox messages go first so that control
    /// messages are not starved by an actor that keeps submitting to itself.
    fn next_ready(&mut self, mailbox: &mut mpsc::Receiver<A::Message>) -> Option<Turn<A::Message>> {
        if let Ok(msg) = mailbox.try_recv() {
            return Some(Turn::Message(msg));
        }
        if let Some(msg) = self.timers.pop_expired(Instant::now()) {
            return Some(Turn::Timer(msg));
        }
        self.local_queue.pop_front().map(Turn::Message)
    }

    async fn wait_for_turn(
        &mut self,
        mailbox: &mut mpsc::Receiver<A::Message>,
        mailbox_open: bool,
    ) -> Turn<A::Message> {
        let has_timers = !self.timers.is_empty();
        if !mailbox_open && !has_timers {
            return Turn::Stop;
        }
        tokio::select! {
            _ = self.cancellation.cancelled() => Turn::Stop,
            msg = mailbox.recv(), if mailbox_open => match msg {
                Some(msg) => Turn::Message(msg),
                None => Turn::MailboxClosed,
            },
            msg = self.timers.next_expired(), if has_timers => Turn::Timer(msg),
        }
    }
}

async fn run_actor<A: Actor>(
    mut actor: A,
    mut ctx: ActorContext<A>,
    mut mailbox: mpsc::Receiver<A::Message>,
) -> anyhow::Result<()> {
    debug!(actor = ctx.name, "Actor started");
    actor.on_start(&mut ctx).await?;

    let mut result = Ok(());
    // once every handle is gone the actor keeps running while it has timers
    let mut mailbox_open = true;
    while !ctx.stop_requested && !ctx.cancellation.is_cancelled() {
        let turn = match ctx.next_ready(&mut mailbox) {
            Some(turn) => turn,
            None => ctx.wait_for_turn(&mut mailbox, mailbox_open).await,
        };

        let msg = match turn {
            Turn::Message(msg) => msg,
            Turn::Timer(msg) => {
                counter!(ACTOR_TIMERS_FIRED, "actor" => ctx.name).increment(1);
                msg
            }
            Turn::MailboxClosed => {
                mailbox_open = false;
                continue;
            }
            Turn::Stop => break,
        };

        counter!(ACTOR_MESSAGES, "actor" => ctx.name).increment(1);
        let start = std::time::Instant::now();
        let handled = actor.handle(msg, &mut ctx).await;
        histogram!(ACTOR_TURN_DURATION, "actor" => ctx.name).record(start.elapsed());
        if let Err(err) = handled {
            warn!(actor = ctx.name, "Actor failed: {err:#}");
            result = Err(err);
            break;
        }
        trace!(actor = ctx.name, "Turn completed");
    }

    // refuse new messages, then let the actor clean up
    mailbox.close();
    actor.on_stop(&mut ctx).await;
    debug!(actor = ctx.name, "Actor stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::TaskCenterBuilder;

    enum CounterMsg {
        Add(u64),
        AddLater(Duration, u64),
        Get(Reply<u64>),
        Tick,
        Stop,
    }

    struct Counter {
        value: u64,
        ticks: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl Actor for Counter {
        type Message = CounterMsg;

        fn name(&self) -> &'static str {
            "counter"
        }

        async fn handle(
            &mut self,
            msg: Self::Message,
            ctx: &mut ActorContext<Self>,
        ) -> anyhow::Result<()> {
            match msg {
                CounterMsg::Add(n) => self.value += n,
                CounterMsg::AddLater(delay, n) => {
                    ctx.schedule(delay, CounterMsg::Add(n));
                }
                CounterMsg::Get(reply) => reply.send(self.value),
                CounterMsg::Tick => self.ticks.lock().push(self.value),
                CounterMsg::Stop => ctx.stop(),
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_handled_in_order() -> googletest::Result<()> {
        let tc = TaskCenterBuilder::default_for_tests().build()?;
        let (handle, _) = tc.spawn_actor(
            TaskKind::Actor,
            None,
            16,
            Counter {
                value: 0,
                ticks: Arc::default(),
            },
        )?;

        for n in 1..=10 {
            handle.submit(CounterMsg::Add(n)).await?;
        }
        let value = handle.call(CounterMsg::Get).await?;
        assert_eq!(55, value);

        handle.submit(CounterMsg::Stop).await?;
        handle.stopped().await;
        assert!(handle.call(CounterMsg::Get).await.is_err());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_messages_fire_after_delay() -> googletest::Result<()> {
        let tc = TaskCenterBuilder::default_for_tests().build()?;
        let (handle, _) = tc.spawn_actor(
            TaskKind::Actor,
            None,
            16,
            Counter {
                value: 0,
                ticks: Arc::default(),
            },
        )?;

        handle
            .submit(CounterMsg::AddLater(Duration::from_secs(5), 7))
            .await?;
        assert_eq!(0, handle.call(CounterMsg::Get).await?);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(7, handle.call(CounterMsg::Get).await?);
        Ok(())
    }

    struct Ticker {
        ticks: Arc<Mutex<Vec<u64>>>,
        timer: Option<TimerId>,
        count: u64,
    }

    #[async_trait]
    impl Actor for Ticker {
        type Message = CounterMsg;

        fn name(&self) -> &'static str {
            "ticker"
        }

        async fn on_start(&mut self, ctx: &mut ActorContext<Self>) -> anyhow::Result<()> {
            self.timer = Some(ctx.schedule_at_interval(Duration::from_secs(1), || {
                CounterMsg::Tick
            }));
            Ok(())
        }

        async fn handle(
            &mut self,
            msg: Self::Message,
            ctx: &mut ActorContext<Self>,
        ) -> anyhow::Result<()> {
            if let CounterMsg::Tick = msg {
                self.count += 1;
                self.ticks.lock().push(self.count);
                if self.count == 3 {
                    if let Some(timer) = self.timer.take() {
                        assert!(ctx.cancel_timer(timer));
                    }
                }
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interval_timer_can_be_cancelled() -> googletest::Result<()> {
        let tc = TaskCenterBuilder::default_for_tests().build()?;
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let (_handle, _) = tc.spawn_actor(
            TaskKind::Actor,
            None,
            16,
            Ticker {
                ticks: ticks.clone(),
                timer: None,
                count: 0,
            },
        )?;

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(vec![1, 2, 3], ticks.lock().clone());
        Ok(())
    }
}
