use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::OrchestrationContext;

/// Future returned by `OrchestrationContext::schedule_activity`.
///
/// The first poll claims a sequence number: during replay it is the seq of
/// the next recorded `ActivityScheduled` event (which must carry the same
/// name and input), otherwise a new schedule is recorded. Later polls look
/// up the completion for that seq, so completions may arrive in any order.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    name: String,
    input: String,
    seq: Option<u64>,
}

impl DurableFuture {
    pub(crate) fn new(ctx: OrchestrationContext, name: String, input: String) -> Self {
        Self {
            ctx,
            name,
            input,
            seq: None,
        }
    }

    /// Sequence number claimed by this call, once it has been polled.
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }
}

impl Future for DurableFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let seq = match this.seq {
            Some(seq) => seq,
            None => match this.ctx.claim_activity(&this.name, &this.input) {
                Some(seq) => {
                    this.seq = Some(seq);
                    seq
                }
                // Replay mismatch: the turn is abandoned, stay pending
                None => return Poll::Pending,
            },
        };
        match this.ctx.completion_for(seq) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

/// Aggregate future for `OrchestrationContext::join`.
///
/// Every child is polled on each poll, so all of them are scheduled in the
/// same turn in vector order. Results are returned in vector order.
pub struct JoinFuture {
    children: Vec<(DurableFuture, Option<Result<String, String>>)>,
}

impl JoinFuture {
    pub(crate) fn new(futures: Vec<DurableFuture>) -> Self {
        Self {
            children: futures.into_iter().map(|f| (f, None)).collect(),
        }
    }
}

impl Future for JoinFuture {
    type Output = Vec<Result<String, String>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_ready = true;
        for (fut, slot) in this.children.iter_mut() {
            if slot.is_some() {
                continue;
            }
            match Pin::new(fut).poll(cx) {
                Poll::Ready(result) => *slot = Some(result),
                Poll::Pending => all_ready = false,
            }
        }
        if !all_ready {
            return Poll::Pending;
        }
        Poll::Ready(this.children.iter_mut().filter_map(|(_, slot)| slot.take()).collect())
    }
}

/// Future returned by `OrchestrationContext::schedule_timer`.
///
/// Claims its seq on first poll like `DurableFuture` and resolves once a
/// `TimerFired` event for that seq is in history.
pub struct TimerFuture {
    ctx: OrchestrationContext,
    delay_ms: u64,
    seq: Option<u64>,
}

impl TimerFuture {
    pub(crate) fn new(ctx: OrchestrationContext, delay_ms: u64) -> Self {
        Self {
            ctx,
            delay_ms,
            seq: None,
        }
    }

    pub fn seq(&self) -> Option<u64> {
        self.seq
    }
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.seq.is_none() {
            this.seq = this.ctx.claim_timer(this.delay_ms);
        }
        match this.seq {
            Some(seq) if this.ctx.timer_fired(seq) => Poll::Ready(()),
            _ => Poll::Pending,
        }
    }
}
