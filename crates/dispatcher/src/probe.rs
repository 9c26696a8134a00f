//! Timer-coalesced "who holds this fingerprint?" queries.
//!
//! Dispatching requests submit a fingerprint and get a [`ProbeTicket`]. A
//! single worker task collects submissions and, once per period, sends every
//! pending fingerprint to every agent in one batch RPC per agent. Replies are
//! correlated to requests by position in the batch and land in a per-request
//! slot vector indexed by agent id.
use std::{
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use tokio::{
    sync::{
        mpsc,
        Notify,
    },
    time::{
        Instant,
        MissedTickBehavior,
    },
};

use crate::{
    metrics::{
        log_probe_agent_failure,
        log_probe_deadline_exceeded,
        log_probe_round,
        log_probe_round_size,
    },
    AgentId,
    AgentRpc,
};

/// One agent's answer for one fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The agent does not hold the fingerprint.
    Miss,
    /// The agent holds a finished reply; these are its bytes.
    Cached(Bytes),
    /// The agent holds the artifact named by the fingerprint (file-caching
    /// mode).
    Holder(AgentId),
    /// The agent could not be probed this round.
    Unreachable,
}

#[derive(Clone, Copy, Debug)]
pub struct ProbeConfig {
    pub period: Duration,
    pub deadline: Duration,
    pub channel_capacity: usize,
    pub file_caching_mode: bool,
}

struct RepliesState {
    slots: Vec<Option<ProbeOutcome>>,
    arrivals: Vec<AgentId>,
}

struct ProbeReplies {
    state: Mutex<RepliesState>,
    notify: Notify,
}

impl ProbeReplies {
    fn new(num_agents: usize) -> Self {
        Self {
            state: Mutex::new(RepliesState {
                slots: vec![None; num_agents],
                arrivals: Vec::with_capacity(num_agents),
            }),
            notify: Notify::new(),
        }
    }

    fn deliver(&self, agent: AgentId, outcome: ProbeOutcome) {
        {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(agent) else {
                return;
            };
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
            state.arrivals.push(agent);
        }
        self.notify.notify_waiters();
    }

    fn fail_remaining(&self) {
        let num_agents = self.state.lock().slots.len();
        for agent in 0..num_agents {
            self.deliver(agent, ProbeOutcome::Unreachable);
        }
    }
}

struct ProbeRecord {
    fingerprint: String,
    replies: Arc<ProbeReplies>,
}

impl ProbeRecord {
    fn abandoned(&self) -> bool {
        Arc::strong_count(&self.replies) == 1
    }
}

/// Handle on one submitted probe. Yields agent replies in arrival order.
pub struct ProbeTicket {
    replies: Arc<ProbeReplies>,
    cursor: usize,
    deadline: Instant,
}

impl ProbeTicket {
    /// Waits for the next agent reply. Returns `None` once every agent has
    /// answered, or when the probe deadline passes.
    pub async fn next(&mut self) -> Option<(AgentId, ProbeOutcome)> {
        loop {
            let notified = self.replies.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.replies.state.lock();
                if let Some(&agent) = state.arrivals.get(self.cursor) {
                    self.cursor += 1;
                    let outcome = state.slots[agent]
                        .clone()
                        .unwrap_or(ProbeOutcome::Unreachable);
                    return Some((agent, outcome));
                }
                if self.cursor >= state.slots.len() {
                    return None;
                }
            }
            if tokio::time::timeout_at(self.deadline, notified).await.is_err() {
                log_probe_deadline_exceeded();
                tracing::debug!(
                    "Batch probe deadline passed after {} replies",
                    self.cursor
                );
                return None;
            }
        }
    }
}

/// Submission side of the batch probe. Dropping it stops the worker.
pub struct BatchProber {
    tx: mpsc::Sender<ProbeRecord>,
    num_agents: usize,
    deadline: Duration,
}

impl BatchProber {
    /// Starts the probe worker on the current tokio runtime.
    pub fn start(rpc: Arc<dyn AgentRpc>, addresses: Vec<String>, config: ProbeConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let num_agents = addresses.len();
        let worker = ProbeWorker {
            rpc,
            addresses: addresses.into(),
            file_caching_mode: config.file_caching_mode,
            pending: Vec::new(),
        };
        tokio::spawn(worker.run(rx, config.period));
        Self {
            tx,
            num_agents,
            deadline: config.deadline,
        }
    }

    /// Queues `fingerprint` for the next round. Waits for room when the
    /// queue is full.
    pub async fn submit(&self, fingerprint: String) -> anyhow::Result<ProbeTicket> {
        let replies = Arc::new(ProbeReplies::new(self.num_agents));
        let deadline = Instant::now() + self.deadline;
        self.tx
            .send(ProbeRecord {
                fingerprint,
                replies: replies.clone(),
            })
            .await
            .map_err(|_| {
                anyhow::anyhow!(ErrorMetadata::internal(
                    "BatchProbeUnavailable",
                    "Batch probe worker has shut down",
                ))
            })?;
        Ok(ProbeTicket {
            replies,
            cursor: 0,
            deadline,
        })
    }
}

struct ProbeWorker {
    rpc: Arc<dyn AgentRpc>,
    addresses: Arc<[String]>,
    file_caching_mode: bool,
    pending: Vec<ProbeRecord>,
}

impl ProbeWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<ProbeRecord>, period: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                record = rx.recv() => match record {
                    Some(record) => self.pending.push(record),
                    None => break,
                },
                _ = ticker.tick() => self.send_round(),
            }
        }
        for record in self.pending.drain(..) {
            record.replies.fail_remaining();
        }
        tracing::debug!("Batch probe worker exiting");
    }

    fn send_round(&mut self) {
        self.pending.retain(|record| !record.abandoned());
        if self.pending.is_empty() {
            return;
        }
        let batch: Arc<[ProbeRecord]> = self.pending.drain(..).collect();
        let fingerprints: Vec<String> = batch.iter().map(|r| r.fingerprint.clone()).collect();
        log_probe_round();
        log_probe_round_size(batch.len());
        for (agent, address) in self.addresses.iter().enumerate() {
            let rpc = self.rpc.clone();
            let address = address.clone();
            let batch = batch.clone();
            let fingerprints = fingerprints.clone();
            let file_caching_mode = self.file_caching_mode;
            tokio::spawn(async move {
                let result = rpc.probe(&address, fingerprints).await.and_then(|slots| {
                    anyhow::ensure!(
                        slots.len() == batch.len(),
                        "Agent answered {} slots for {} fingerprints",
                        slots.len(),
                        batch.len()
                    );
                    Ok(slots)
                });
                match result {
                    Ok(slots) => {
                        for (record, slot) in batch.iter().zip(slots) {
                            let outcome = if slot.is_empty() {
                                ProbeOutcome::Miss
                            } else if file_caching_mode {
                                ProbeOutcome::Holder(agent)
                            } else {
                                ProbeOutcome::Cached(slot)
                            };
                            record.replies.deliver(agent, outcome);
                        }
                    },
                    Err(e) => {
                        log_probe_agent_failure();
                        tracing::warn!("Batch probe to agent {agent} at {address} failed: {e:#}");
                        for record in batch.iter() {
                            record.replies.deliver(agent, ProbeOutcome::Unreachable);
                        }
                    },
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use errors::ErrorMetadataAnyhowExt;
    use pretty_assertions::assert_eq;

    use super::{
        BatchProber,
        ProbeConfig,
        ProbeOutcome,
    };
    use crate::testing::FakeAgents;

    fn config(file_caching_mode: bool) -> ProbeConfig {
        ProbeConfig {
            period: Duration::from_millis(10),
            deadline: Duration::from_secs(5),
            channel_capacity: 16,
            file_caching_mode,
        }
    }

    async fn drain(mut ticket: super::ProbeTicket) -> Vec<(usize, ProbeOutcome)> {
        let mut replies = vec![];
        while let Some(reply) = ticket.next().await {
            replies.push(reply);
        }
        replies.sort_by_key(|(agent, _)| *agent);
        replies
    }

    #[tokio::test]
    async fn test_every_agent_replies_once() -> anyhow::Result<()> {
        let fake = FakeAgents::new(3);
        fake.prime(2, "f1", Bytes::from_static(b"reply"));
        let prober = BatchProber::start(fake.clone(), fake.addresses(), config(false));
        let t1 = prober.submit("f1".to_owned()).await?;
        let t2 = prober.submit("f2".to_owned()).await?;
        assert_eq!(
            drain(t1).await,
            vec![
                (0, ProbeOutcome::Miss),
                (1, ProbeOutcome::Miss),
                (2, ProbeOutcome::Cached(Bytes::from_static(b"reply"))),
            ]
        );
        assert_eq!(
            drain(t2).await,
            vec![
                (0, ProbeOutcome::Miss),
                (1, ProbeOutcome::Miss),
                (2, ProbeOutcome::Miss),
            ]
        );
        // Both fingerprints went out in the same round.
        assert_eq!(fake.probe_calls(0), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_caching_reports_holder() -> anyhow::Result<()> {
        let fake = FakeAgents::new(2);
        fake.prime(1, "blob", Bytes::from_static(b"x"));
        let prober = BatchProber::start(fake.clone(), fake.addresses(), config(true));
        let replies = drain(prober.submit("blob".to_owned()).await?).await;
        assert_eq!(
            replies,
            vec![(0, ProbeOutcome::Miss), (1, ProbeOutcome::Holder(1))]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_agent_reports_unreachable() -> anyhow::Result<()> {
        let fake = FakeAgents::new(2);
        fake.fail_probes(0);
        let prober = BatchProber::start(fake.clone(), fake.addresses(), config(false));
        let replies = drain(prober.submit("f".to_owned()).await?).await;
        assert_eq!(
            replies,
            vec![(0, ProbeOutcome::Unreachable), (1, ProbeOutcome::Miss)]
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_come_in_arrival_order() -> anyhow::Result<()> {
        let fake = FakeAgents::new(3);
        fake.prime(0, "f", Bytes::from_static(b"late"));
        fake.delay_probes(0, Duration::from_millis(100));
        fake.delay_probes(1, Duration::from_millis(50));
        fake.prime(2, "f", Bytes::from_static(b"early"));
        let prober = BatchProber::start(fake.clone(), fake.addresses(), config(false));
        let mut ticket = prober.submit("f".to_owned()).await?;
        let mut replies = vec![];
        while let Some(reply) = ticket.next().await {
            replies.push(reply);
        }
        assert_eq!(
            replies,
            vec![
                (2, ProbeOutcome::Cached(Bytes::from_static(b"early"))),
                (1, ProbeOutcome::Miss),
                (0, ProbeOutcome::Cached(Bytes::from_static(b"late"))),
            ]
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_ticket_is_not_sent() -> anyhow::Result<()> {
        let fake = FakeAgents::new(2);
        let prober = BatchProber::start(fake.clone(), fake.addresses(), config(false));
        drop(prober.submit("gone".to_owned()).await?);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fake.probe_calls(0), 0);
        assert_eq!(fake.probe_calls(1), 0);

        let ticket = prober.submit("kept".to_owned()).await?;
        assert_eq!(
            drain(ticket).await,
            vec![(0, ProbeOutcome::Miss), (1, ProbeOutcome::Miss)]
        );
        assert_eq!(fake.probe_calls(0), 1);
        assert_eq!(fake.probe_calls(1), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded_by_deadline() -> anyhow::Result<()> {
        let fake = FakeAgents::new(2);
        fake.hang_probes(1);
        let prober = BatchProber::start(
            fake.clone(),
            fake.addresses(),
            ProbeConfig {
                deadline: Duration::from_millis(200),
                ..config(false)
            },
        );
        let mut ticket = prober.submit("f".to_owned()).await?;
        assert_eq!(ticket.next().await, Some((0, ProbeOutcome::Miss)));
        assert_eq!(ticket.next().await, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_tagged() {
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);
        let prober = BatchProber {
            tx,
            num_agents: 1,
            deadline: Duration::from_secs(1),
        };
        let Err(err) = prober.submit("f".to_owned()).await else {
            panic!("submit succeeded without a worker");
        };
        assert_eq!(err.http_status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.short_msg(), "BatchProbeUnavailable");
        assert_eq!(err.msg(), "Batch probe worker has shut down");
    }

    #[tokio::test]
    async fn test_worker_stops_when_prober_dropped() -> anyhow::Result<()> {
        let fake = FakeAgents::new(1);
        let prober = BatchProber::start(
            fake.clone(),
            fake.addresses(),
            ProbeConfig {
                period: Duration::from_secs(3600),
                ..config(false)
            },
        );
        let ticket = prober.submit("f".to_owned()).await?;
        drop(prober);
        assert_eq!(drain(ticket).await, vec![(0, ProbeOutcome::Unreachable)]);
        assert_eq!(fake.probe_calls(0), 0);
        Ok(())
    }
}
