use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A durable timer armed for one instance run. Ordered by `fire_at_ms` first
/// so the service can keep a min-heap of them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerTask {
    pub fire_at_ms: u64,
    pub instance: String,
    pub execution_id: String,
    pub seq: u64,
}

/// In-process timer service.
///
/// Keeps armed timers in a min-heap and sends each one on the `fired`
/// channel once the wall clock reaches its `fire_at_ms`. Timers due in the
/// past fire right away, which is what happens after a restart.
pub struct TimerService {
    intake: mpsc::UnboundedSender<TimerTask>,
    handle: JoinHandle<()>,
}

impl TimerService {
    pub fn start(fired: mpsc::UnboundedSender<TimerTask>) -> Self {
        let (intake, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, fired));
        Self { intake, handle }
    }

    pub fn schedule(&self, task: TimerTask) {
        debug!(instance=%task.instance, seq=task.seq, fire_at_ms=task.fire_at_ms, "arm timer");
        if self.intake.send(task).is_err() {
            debug!("timer service stopped; dropping timer");
        }
    }

    /// Stop firing. Armed timers are forgotten; history still records them.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

async fn run(mut intake: mpsc::UnboundedReceiver<TimerTask>, fired: mpsc::UnboundedSender<TimerTask>) {
    let mut heap: BinaryHeap<Reverse<TimerTask>> = BinaryHeap::new();
    loop {
        let now = crate::wall_clock_ms();
        while heap.peek().is_some_and(|Reverse(next)| next.fire_at_ms <= now) {
            if let Some(Reverse(due)) = heap.pop()
                && fired.send(due).is_err()
            {
                return;
            }
        }

        let next = match heap.peek() {
            Some(Reverse(next)) => Duration::from_millis(next.fire_at_ms.saturating_sub(now).max(1)),
            None => match intake.recv().await {
                Some(task) => {
                    heap.push(Reverse(task));
                    continue;
                }
                None => return,
            },
        };
        tokio::select! {
            _ = tokio::time::sleep(next) => {}
            task = intake.recv() => match task {
                Some(task) => heap.push(Reverse(task)),
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(seq: u64, fire_at_ms: u64) -> TimerTask {
        TimerTask {
            fire_at_ms,
            instance: "i".into(),
            execution_id: "e".into(),
            seq,
        }
    }

    #[tokio::test]
    async fn fires_due_timers_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let svc = TimerService::start(tx);
        let now = crate::wall_clock_ms();
        svc.schedule(timer(1, now));
        svc.schedule(timer(2, now + 40));
        svc.schedule(timer(3, now + 20));

        let mut fired = Vec::new();
        while fired.len() < 3 {
            let t = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(crate::wall_clock_ms() >= t.fire_at_ms);
            fired.push(t.seq);
        }
        assert_eq!(fired, vec![1, 3, 2]);
        svc.shutdown();
    }

    #[tokio::test]
    async fn past_due_timer_fires_immediately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let svc = TimerService::start(tx);
        svc.schedule(timer(7, 1));
        let t = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.seq, 7);
        svc.shutdown();
    }
}
