// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.


use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use googletest::prelude::*;
use test_log::test;

use keel_core::clock::{Clock, ControllableClock, MockClock};
use keel_core::{Actor, ActorContext, Reply, TaskCenterBuilder, TaskKind};
use keel_types::time::MillisSinceEpoch;

/// Records a deadline per request and reports which ones are due according to its clock.
struct DeadlineTracker {
    clock: ControllableClock,
    deadlines: Vec<(u32, MillisSinceEpoch)>,
    fired: Vec<u32>,
}

enum TrackerMsg {
    Track(u32, Duration),
    Check,
    Fired(Reply<Vec<u32>>),
}

#[async_trait]
impl Actor for DeadlineTracker {
    type Message = TrackerMsg;

    fn name(&self) -> &'static str {
        "deadline-tracker"
    }

    async fn on_start(&mut self, ctx: &mut ActorContext<Self>) -> anyhow::Result<()> {
        ctx.schedule_at_interval(Duration::from_secs(1), || TrackerMsg::Check);
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: Self::Message,
        _ctx: &mut ActorContext<Self>,
    ) -> anyhow::Result<()> {
        match msg {
            TrackerMsg::Track(id, after) => {
                self.deadlines.push((id, self.clock.now() + after));
            }
            TrackerMsg::Check => {
                let now = self.clock.now();
                let (due, pending): (Vec<_>, Vec<_>) =
                    self.deadlines.drain(..).partition(|(_, at)| *at <= now);
                self.deadlines = pending;
                self.fired.extend(due.into_iter().map(|(id, _)| id));
            }
            TrackerMsg::Fired(reply) => reply.send(self.fired.clone()),
        }
        Ok(())
    }
}

#[test(tokio::test(start_paused = true))]
async fn deadlines_follow_the_controllable_clock() -> googletest::Result<()> {
    let tc = TaskCenterBuilder::default()
        .default_runtime_handle(tokio::runtime::Handle::current())
        .build()?;
    let source = MockClock::with_timestamp(MillisSinceEpoch::new(1_000_000));
    let clock = ControllableClock::new(Arc::new(source.clone()));

    let (handle, _) = tc.spawn_actor(
        TaskKind::Actor,
        None,
        8,
        DeadlineTracker {
            clock: clock.clone(),
            deadlines: Vec::new(),
            fired: Vec::new(),
        },
    )?;

    handle
        .submit(TrackerMsg::Track(1, Duration::from_secs(10)))
        .await?;
    handle
        .submit(TrackerMsg::Track(2, Duration::from_secs(60)))
        .await?;

    // the source clock does not move, so nothing is due however long we wait
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_that!(handle.call(TrackerMsg::Fired).await?, empty());

    clock.offset_by(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_that!(handle.call(TrackerMsg::Fired).await?, elements_are![eq(1u32)]);

    clock.pin_at(MillisSinceEpoch::new(1_000_000 + 61_000));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_that!(
        handle.call(TrackerMsg::Fired).await?,
        elements_are![eq(1u32), eq(2u32)]
    );

    tc.cancel_tasks(Some(TaskKind::Actor), None).await;
    assert!(handle.is_stopped());
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn concurrent_callers_observe_sequential_turns() -> googletest::Result<()> {
    struct Register(Vec<u64>);

    #[async_trait]
    impl Actor for Register {
        type Message = (u64, Reply<usize>);

        fn name(&self) -> &'static str {
            "register"
        }

        async fn handle(
            &mut self,
            (value, reply): Self::Message,
            _ctx: &mut ActorContext<Self>,
        ) -> anyhow::Result<()> {
            self.0.push(value);
            // yield in the middle of the turn; no other message may interleave
            tokio::task::yield_now().await;
            reply.send(self.0.len());
            Ok(())
        }
    }

    let tc = TaskCenterBuilder::default()
        .default_runtime_handle(tokio::runtime::Handle::current())
        .build()?;
    let (handle, _) = tc.spawn_actor(TaskKind::Actor, None, 4, Register(Vec::new()))?;

    let mut callers = Vec::new();
    for value in 0..32u64 {
        let handle = handle.clone();
        callers.push(tokio::spawn(async move {
            handle.call(|reply| (value, reply)).await
        }));
    }
    let mut lengths = Vec::new();
    for caller in callers {
        lengths.push(caller.await??);
    }
    lengths.sort_unstable();
    assert_that!(lengths, eq((1..=32).collect::<Vec<usize>>()));
    Ok(())
}
