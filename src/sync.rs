//! Keeps the per-address ledger in step with the explorer.
//!
//! Addresses go into a de-duplicated FIFO queue drained by at most one
//! worker task. The worker exits when the queue is empty and the next
//! [`SyncEngine::enqueue`] starts a new one.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    time::Instant,
};

use crate::{
    db::TransactionStore,
    explorer::Explorer,
    txdetails::reduce,
    types::{AddressTransaction, AddressTransactionToken, RawTransaction, TxState},
    utils::{attachment::attachment_text, now_millis},
};

pub mod refresh;

use refresh::Refresh;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// confirmations after which a transaction is final
    pub secure_confirmations: u32,
    /// how long a transaction may go unseen before it counts as cancelled
    pub cancel_grace: Duration,
    pub debounce: Duration,
    pub page_size: usize,
    /// records loaded at most when nothing is known about the address yet
    pub first_sync_cap: usize,
    pub mempool_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            secure_confirmations: 72,
            cancel_grace: Duration::from_secs(600),
            debounce: Duration::from_secs(30),
            page_size: 20,
            first_sync_cap: 500,
            mempool_page_size: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    Started { address: String },
    Progress { address: String, loaded: usize },
    Finished { address: String },
    Failed { address: String, error: String },
    Idle,
}

#[derive(Debug)]
struct Job {
    address: String,
    full: bool,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    running: bool,
    /// address the worker is refreshing right now
    in_flight: Option<String>,
    last_refresh: HashMap<String, Instant>,
}

impl Queue {
    fn is_pending(&self, address: &str) -> bool {
        self.in_flight.as_deref() == Some(address)
            || self.jobs.iter().any(|j| j.address == address)
    }

    fn refreshed_within(&self, address: &str, window: Duration) -> bool {
        self.last_refresh
            .get(address)
            .map(|t| t.elapsed() < window)
            .unwrap_or(false)
    }
}

struct Inner {
    explorer: Arc<dyn Explorer>,
    store: Arc<dyn TransactionStore>,
    config: SyncConfig,
    queue: Mutex<Queue>,
    events: broadcast::Sender<SyncEvent>,
    busy: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
    runtime: Handle,
}

impl SyncEngine {
    pub fn new(
        explorer: Arc<dyn Explorer>,
        store: Arc<dyn TransactionStore>,
        config: SyncConfig,
        runtime: Handle,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                explorer,
                store,
                config,
                queue: Mutex::new(Queue::default()),
                events,
                busy,
            }),
            runtime,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        *self.inner.busy.borrow()
    }

    /// Resolves once the worker has drained the queue
    pub async fn wait_idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    /// Schedules a refresh of `address`. Returns false when the address is
    /// already queued or was refreshed within the debounce window.
    pub fn enqueue(&self, address: &str) -> bool {
        let mut queue = self.inner.queue.lock();
        if queue.is_pending(address) {
            return false;
        }
        if queue.refreshed_within(address, self.inner.config.debounce) {
            tracing::debug!("{address} refreshed recently");
            return false;
        }
        queue.jobs.push_back(Job {
            address: address.to_string(),
            full: false,
        });
        self.start_worker(&mut queue);
        true
    }

    /// Wipes the address and loads its whole history again. Only accepted
    /// while nothing else is running.
    pub fn download_all(&self, address: &str) -> bool {
        let mut queue = self.inner.queue.lock();
        if queue.running {
            return false;
        }
        queue.jobs.push_back(Job {
            address: address.to_string(),
            full: true,
        });
        self.start_worker(&mut queue);
        true
    }

    fn start_worker(&self, queue: &mut Queue) {
        if queue.running {
            return;
        }
        queue.running = true;
        self.inner.busy.send_replace(true);
        let inner = self.inner.clone();
        self.runtime.spawn(async move {
            inner.drain().await;
        });
    }

    /// Records a transaction the wallet just broadcast so that it shows
    /// before the explorer knows about it
    pub fn record_submitted(
        &self,
        address: &str,
        tx: &RawTransaction,
        message: Option<&str>,
    ) -> Result<()> {
        match to_address_transaction(
            address,
            tx,
            None,
            now_millis(),
            TxState::Submitted,
            message.map(str::to_string),
        )? {
            Some((row, tokens)) => {
                self.inner.store.store_transaction(&row, &tokens)?;
            }
            None => tracing::warn!("Transaction {} does not involve {address}", tx.id),
        }
        Ok(())
    }
}

impl Inner {
    async fn drain(&self) {
        tracing::info!("Sync worker started");
        loop {
            let job = {
                let mut queue = self.queue.lock();
                queue.in_flight = None;
                match queue.jobs.pop_front() {
                    Some(job) => {
                        if !job.full && queue.refreshed_within(&job.address, self.config.debounce)
                        {
                            tracing::debug!("Skipping {}: refreshed recently", job.address);
                            continue;
                        }
                        queue.in_flight = Some(job.address.clone());
                        job
                    }
                    None => {
                        queue.running = false;
                        let _ = self.events.send(SyncEvent::Idle);
                        self.busy.send_replace(false);
                        break;
                    }
                }
            };
            self.run(job).await;
        }
        tracing::info!("Sync worker stopped");
    }

    async fn run(&self, job: Job) {
        let Job { address, full } = job;
        tracing::info!("Refreshing {address} (full: {full})");
        let _ = self.events.send(SyncEvent::Started {
            address: address.clone(),
        });
        let refresh = Refresh {
            explorer: &*self.explorer,
            store: &*self.store,
            config: &self.config,
            events: &self.events,
        };
        let res = if full {
            refresh.download_all(&address).await
        } else {
            refresh.refresh(&address).await
        };
        match res {
            Ok(()) => {
                self.queue
                    .lock()
                    .last_refresh
                    .insert(address.clone(), Instant::now());
                let _ = self.events.send(SyncEvent::Finished { address });
            }
            Err(e) => {
                tracing::warn!("Refresh of {address} failed: {e:#}");
                let _ = self.events.send(SyncEvent::Failed {
                    address,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Nets `tx` and keeps what concerns `address`. `None` when the address
/// neither spends nor receives anything in it.
///
/// Without a `message`, the row takes the text attached to the first output
/// to `address`, or else to the first output.
pub fn to_address_transaction(
    address: &str,
    tx: &RawTransaction,
    inclusion_height: Option<u32>,
    timestamp: u64,
    state: TxState,
    message: Option<String>,
) -> Result<Option<(AddressTransaction, Vec<AddressTransactionToken>)>> {
    let summary = reduce(&tx.to_summary())?;
    let input = summary
        .inputs
        .iter()
        .find(|b| b.address.as_deref() == Some(address));
    let output = summary
        .outputs
        .iter()
        .find(|b| b.address.as_deref() == Some(address));
    if input.is_none() && output.is_none() {
        return Ok(None);
    }

    let erg_delta = output.map(|b| b.value).unwrap_or_default()
        - input.map(|b| b.value).unwrap_or_default();
    let mut tokens = vec![];
    let sides = input.map(|b| (b, -1)).into_iter().chain(output.map(|b| (b, 1)));
    for (b, sign) in sides {
        for t in b.tokens.iter() {
            tokens.push(AddressTransactionToken {
                id: 0,
                address: address.to_string(),
                tx_id: tx.id.clone(),
                token_id: t.token_id.clone(),
                token_name: t.name.clone().unwrap_or_default(),
                token_delta: t.amount * sign,
                decimals: t.decimals.unwrap_or_default(),
            });
        }
    }
    let message = message.or_else(|| {
        tx.outputs
            .iter()
            .find(|b| b.address.as_deref() == Some(address))
            .and_then(attachment_text)
            .or_else(|| tx.outputs.first().and_then(attachment_text))
    });
    let row = AddressTransaction {
        id: 0,
        address: address.to_string(),
        tx_id: tx.id.clone(),
        inclusion_height,
        timestamp,
        erg_delta,
        message,
        state,
    };
    Ok(Some((row, tokens)))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        tests::{boxed, memory_store, raw_tx, MockExplorer},
        utils::attachment::tests::with_note,
    };

    fn engine(explorer: Arc<MockExplorer>) -> SyncEngine {
        SyncEngine::new(
            explorer,
            Arc::new(memory_store()),
            SyncConfig::default(),
            Handle::current(),
        )
    }

    fn payment(id: &str, height: u32) -> RawTransaction {
        raw_tx(
            id,
            Some(height),
            3,
            1_000,
            vec![boxed(Some("i1"), "A", 1000, &[("tk", 5)])],
            vec![
                boxed(Some("o1"), "A", 890, &[("tk", 3)]),
                boxed(Some("o2"), "B", 100, &[("tk", 2)]),
                boxed(Some("o3"), "fee", 10, &[]),
            ],
        )
    }

    #[test]
    fn ledger_row_for_address() {
        let tx = payment("t1", 10);
        let (row, tokens) = to_address_transaction(
            "A",
            &tx,
            Some(10),
            1_000,
            TxState::ConfirmedUnsecure,
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(row.erg_delta, -110);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].token_delta, -2);

        let (row, tokens) =
            to_address_transaction("B", &tx, Some(10), 1_000, TxState::Waiting, None)
                .unwrap()
                .unwrap();
        assert_eq!(row.erg_delta, 100);
        assert_eq!(tokens[0].token_delta, 2);

        assert!(
            to_address_transaction("C", &tx, None, 0, TxState::Waiting, None)
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn debounce() {
        let explorer = Arc::new(MockExplorer::default());
        explorer.confirmed.lock().push(payment("t1", 10));
        let engine = engine(explorer.clone());
        let mut events = engine.subscribe();

        assert!(engine.enqueue("A"));
        engine.wait_idle().await;
        assert!(!engine.enqueue("A"));
        engine.wait_idle().await;
        assert_eq!(explorer.confirmed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(explorer.mempool_calls.load(Ordering::SeqCst), 1);

        let mut seen = vec![];
        while let Ok(e) = events.try_recv() {
            seen.push(e);
        }
        assert_eq!(
            seen,
            vec![
                SyncEvent::Started {
                    address: "A".to_string()
                },
                SyncEvent::Progress {
                    address: "A".to_string(),
                    loaded: 1
                },
                SyncEvent::Finished {
                    address: "A".to_string()
                },
                SyncEvent::Idle,
            ]
        );

        // another address is not affected
        assert!(engine.enqueue("B"));
        engine.wait_idle().await;
        assert_eq!(explorer.confirmed_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn attached_note_becomes_message() {
        let mut tx = payment("t1", 10);
        tx.outputs[1] = with_note(tx.outputs[1].clone(), "for B");
        let (row, _) =
            to_address_transaction("B", &tx, Some(10), 1_000, TxState::Waiting, None)
                .unwrap()
                .unwrap();
        assert_eq!(row.message.as_deref(), Some("for B"));

        // A has no note of its own, falls back to the first output
        let (row, _) =
            to_address_transaction("A", &tx, Some(10), 1_000, TxState::Waiting, None)
                .unwrap()
                .unwrap();
        assert_eq!(row.message, None);
        tx.outputs[0] = with_note(tx.outputs[0].clone(), "change");
        let (row, _) =
            to_address_transaction("B", &tx, Some(10), 1_000, TxState::Waiting, None)
                .unwrap()
                .unwrap();
        assert_eq!(row.message.as_deref(), Some("for B"));
        tx.outputs[1].registers.clear();
        let (row, _) =
            to_address_transaction("B", &tx, Some(10), 1_000, TxState::Waiting, None)
                .unwrap()
                .unwrap();
        assert_eq!(row.message.as_deref(), Some("change"));

        // a local message wins
        let (row, _) = to_address_transaction(
            "B",
            &tx,
            Some(10),
            1_000,
            TxState::Waiting,
            Some("mine".to_string()),
        )
        .unwrap()
        .unwrap();
        assert_eq!(row.message.as_deref(), Some("mine"));
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_during_refresh() {
        let explorer = Arc::new(MockExplorer::default());
        explorer.confirmed.lock().push(payment("t1", 10));
        *explorer.delay.lock() = Some(Duration::from_millis(300));
        let engine = engine(explorer.clone());

        assert!(engine.enqueue("A"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.is_busy());
        assert!(!engine.enqueue("A"));
        engine.wait_idle().await;
        assert_eq!(explorer.confirmed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(explorer.mempool_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_window_expires() {
        let explorer = Arc::new(MockExplorer::default());
        let engine = engine(explorer.clone());

        assert!(engine.enqueue("A"));
        engine.wait_idle().await;
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!engine.enqueue("A"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(engine.enqueue("A"));
        engine.wait_idle().await;
        assert_eq!(explorer.confirmed_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_refresh_can_be_retried() {
        let explorer = Arc::new(MockExplorer::default());
        explorer.fail_mempool.store(true, Ordering::SeqCst);
        let engine = engine(explorer.clone());
        let mut events = engine.subscribe();

        assert!(engine.enqueue("A"));
        engine.wait_idle().await;
        assert!(matches!(events.recv().await, Ok(SyncEvent::Started { .. })));
        assert!(matches!(events.recv().await, Ok(SyncEvent::Progress { .. })));
        assert!(matches!(events.recv().await, Ok(SyncEvent::Failed { .. })));

        explorer.fail_mempool.store(false, Ordering::SeqCst);
        assert!(engine.enqueue("A"));
        engine.wait_idle().await;
        assert_eq!(explorer.mempool_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn download_all_reloads_everything() {
        let explorer = Arc::new(MockExplorer::default());
        explorer.confirmed.lock().push(payment("t1", 10));
        let store = Arc::new(memory_store());
        let engine = SyncEngine::new(
            explorer.clone(),
            store.clone(),
            SyncConfig::default(),
            Handle::current(),
        );

        let stale = payment("gone", 5);
        engine.record_submitted("A", &stale, Some("rent")).unwrap();
        let row = store.get_transaction("A", "gone").unwrap().unwrap();
        assert_eq!(row.state, TxState::Submitted);
        assert_eq!(row.inclusion_height, None);
        assert_eq!(row.message.as_deref(), Some("rent"));

        assert!(engine.download_all("A"));
        engine.wait_idle().await;
        let rows = store.list_transactions("A").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tx_id, "t1");
        assert_eq!(store.list_tokens("A", "t1").unwrap().len(), 1);
    }
}
