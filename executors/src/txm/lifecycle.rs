use std::{collections::HashMap, sync::Arc};

use alloy::primitives::Address;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use txm_core::{
    chain::ChainRpc,
    gas::GasEstimator,
    signer::{KeySet, TxSigner},
    transaction::Head,
};

use crate::{
    shutdown::{ShutdownHandle, WorkerHandle},
    txm::{
        admission::{AdmissionGate, WakeRegistry},
        broadcaster::Broadcaster,
        config::TxmConfig,
        confirmer::Confirmer,
        context::TxmContext,
        error::{AdmissionError, TxmError},
        error_classifier::SendErrorClassifier,
        head_tracker::HeadTracker,
        queue_strategy::QueueStrategy,
        reaper::Reaper,
        resender::Resender,
        store::{TransactionStoreError, TxStore},
        types::{Attempt, NewTransaction, Transaction},
    },
};

struct Running {
    workers: ShutdownHandle,
    supervisor: WorkerHandle,
}

/// Owns the workers of one transaction manager (one chain, one key set).
///
/// `start` spawns the head tracker, confirmer, resender, reaper and a
/// supervisor that keeps exactly one broadcaster per managed address.
/// `stop` lets each worker finish its current unit of work and waits for all
/// of them.
pub struct TxManager<C, T, K, S, G> {
    ctx: TxmContext<C, T, S, G>,
    keys: Arc<K>,
    admission: AdmissionGate<S>,
    wake: WakeRegistry,
    heads: Arc<watch::Sender<Option<Head>>>,
    running: Mutex<Option<Running>>,
    fatal_tx: mpsc::UnboundedSender<TxmError>,
    fatal_rx: Mutex<mpsc::UnboundedReceiver<TxmError>>,
}

impl<C, T, K, S, G> TxManager<C, T, K, S, G>
where
    C: ChainRpc,
    T: TxSigner,
    K: KeySet,
    S: TxStore,
    G: GasEstimator,
{
    pub fn new(
        chain: Arc<C>,
        signer: Arc<T>,
        keys: Arc<K>,
        store: Arc<S>,
        gas: Arc<G>,
        config: TxmConfig,
    ) -> Result<Self, TxmError> {
        config.validate()?;

        let classifier = SendErrorClassifier::new(config.send_error_patterns.clone());
        let wake = WakeRegistry::new();
        let admission = AdmissionGate::new(
            store.clone(),
            chain.chain_id(),
            config.queue_depth_limit,
            wake.clone(),
        );
        let (heads, _) = watch::channel(None);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Ok(Self {
            ctx: TxmContext {
                chain,
                signer,
                store,
                gas,
                config: Arc::new(config),
                classifier: Arc::new(classifier),
            },
            keys,
            admission,
            wake,
            heads: Arc::new(heads),
            running: Mutex::new(None),
            fatal_tx,
            fatal_rx: Mutex::new(fatal_rx),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.ctx.store
    }

    pub fn config(&self) -> &TxmConfig {
        &self.ctx.config
    }

    pub fn chain_id(&self) -> u64 {
        self.ctx.chain_id()
    }

    /// Latest head seen by the head tracker.
    pub fn latest_head(&self) -> Option<Head> {
        *self.heads.borrow()
    }

    pub fn confirmer(&self) -> Confirmer<C, S> {
        Confirmer::new(
            self.ctx.chain.clone(),
            self.ctx.store.clone(),
            self.ctx.config.clone(),
        )
    }

    pub fn resender(&self) -> Resender<C, S> {
        Resender::new(
            self.ctx.chain.clone(),
            self.ctx.store.clone(),
            self.ctx.config.clone(),
            self.ctx.classifier.clone(),
        )
    }

    pub fn reaper(&self) -> Reaper<S> {
        Reaper::new(
            self.ctx.chain_id(),
            self.ctx.store.clone(),
            self.ctx.config.clone(),
        )
    }

    /// Whether `from` is in the current key set.
    pub fn manages(&self, from: Address) -> bool {
        self.keys.addresses().contains(&from)
    }

    pub fn broadcaster(&self, from: Address) -> Broadcaster<C, T, S, G> {
        Broadcaster::new(self.ctx.clone(), from)
    }

    pub async fn create_transaction<Q: QueueStrategy>(
        &self,
        request: NewTransaction,
        strategy: &Q,
    ) -> Result<Transaction, AdmissionError> {
        self.admission.create_transaction(request, strategy).await
    }

    /// Explicit wake of an address's broadcaster. Returns false if none runs.
    pub async fn trigger(&self, from: Address) -> bool {
        self.wake.wake(from).await
    }

    pub async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<(Transaction, Vec<Attempt>)>, TransactionStoreError> {
        match self.ctx.store.get_transaction(transaction_id).await? {
            Some(tx) => {
                let attempts = self.ctx.store.attempts_for(transaction_id).await?;
                Ok(Some((tx, attempts)))
            }
            None => Ok(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn start(&self) -> Result<(), TxmError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(TxmError::AlreadyRunning);
        }

        let mut workers = ShutdownHandle::new();

        let head_tracker = HeadTracker::new(
            self.ctx.chain.clone(),
            self.ctx.config.clone(),
            self.heads.clone(),
        );
        workers.add_worker(WorkerHandle::spawn("head_tracker", |shutdown| {
            head_tracker.run(shutdown)
        }));

        let confirmer = self.confirmer();
        let heads = self.heads.subscribe();
        workers.add_worker(WorkerHandle::spawn(
            "confirmer",
            escalating(self.fatal_tx.clone(), |shutdown| confirmer.run(heads, shutdown)),
        ));

        let resender = self.resender();
        workers.add_worker(WorkerHandle::spawn(
            "resender",
            escalating(self.fatal_tx.clone(), |shutdown| resender.run(shutdown)),
        ));

        let reaper = self.reaper();
        workers.add_worker(WorkerHandle::spawn(
            "reaper",
            escalating(self.fatal_tx.clone(), |shutdown| reaper.run(shutdown)),
        ));

        let supervisor = Supervisor {
            ctx: self.ctx.clone(),
            wake: self.wake.clone(),
            fatal_tx: self.fatal_tx.clone(),
            broadcasters: HashMap::new(),
        };
        let addresses = self.keys.subscribe();
        let supervisor =
            WorkerHandle::spawn("supervisor", |shutdown| supervisor.run(addresses, shutdown));

        *running = Some(Running {
            workers,
            supervisor,
        });
        tracing::info!(chain_id = self.chain_id(), "Transaction manager started");
        Ok(())
    }

    /// Stop every worker and wait for all of them. Broadcasters stop first so
    /// no new transaction is sent while the sweeps shut down.
    pub async fn stop(&self) -> Result<(), TxmError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        let supervisor_result = running.supervisor.shutdown().await;
        let workers_result = running.workers.shutdown().await;

        tracing::info!(chain_id = self.chain_id(), "Transaction manager stopped");
        supervisor_result.and(workers_result)
    }

    /// Resolves with the first error a worker escalated as fatal to the process.
    pub async fn wait_fatal(&self) -> Option<TxmError> {
        self.fatal_rx.lock().await.recv().await
    }
}

/// Forward errors that must end the process to the lifecycle controller.
fn escalating<F, Fut>(
    fatal_tx: mpsc::UnboundedSender<TxmError>,
    worker: F,
) -> impl FnOnce(oneshot::Receiver<()>) -> futures::future::BoxFuture<'static, Result<(), TxmError>>
where
    F: FnOnce(oneshot::Receiver<()>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), TxmError>> + Send + 'static,
{
    move |shutdown| {
        Box::pin(async move {
            let result = worker(shutdown).await;
            if let Err(e) = &result {
                if e.is_fatal_to_process() {
                    tracing::error!(error = ?e, "Worker hit an unrecoverable error");
                    let _ = fatal_tx.send(e.clone());
                }
            }
            result
        })
    }
}

/// Keeps one broadcaster per managed address, following the key set.
struct Supervisor<C, T, S, G> {
    ctx: TxmContext<C, T, S, G>,
    wake: WakeRegistry,
    fatal_tx: mpsc::UnboundedSender<TxmError>,
    broadcasters: HashMap<Address, WorkerHandle>,
}

impl<C, T, S, G> Supervisor<C, T, S, G>
where
    C: ChainRpc,
    T: TxSigner,
    S: TxStore,
    G: GasEstimator,
{
    async fn run(
        mut self,
        mut addresses: watch::Receiver<Vec<Address>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), TxmError> {
        let initial = addresses.borrow_and_update().clone();
        self.reconcile(&initial).await;

        let period = self.ctx.config.broadcaster_poll_interval();
        let mut restart_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        restart_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut key_set_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                changed = addresses.changed(), if key_set_open => {
                    if changed.is_err() {
                        tracing::warn!("Key set provider closed, keeping current broadcasters");
                        key_set_open = false;
                        continue;
                    }
                    let current = addresses.borrow_and_update().clone();
                    self.reconcile(&current).await;
                }
                _ = restart_tick.tick() => {
                    if self.broadcasters.values().any(WorkerHandle::is_finished) {
                        let current = addresses.borrow().clone();
                        self.reconcile(&current).await;
                    }
                }
            }
        }

        let mut shutdown = ShutdownHandle::new();
        for (from, worker) in self.broadcasters.drain() {
            self.wake.unregister(from).await;
            shutdown.add_worker(worker);
        }
        shutdown.shutdown().await
    }

    /// Stop broadcasters of removed addresses, collect the ones that exited on
    /// their own, then start one for every managed address without a live one.
    async fn reconcile(&mut self, addresses: &[Address]) {
        let stale: Vec<Address> = self
            .broadcasters
            .iter()
            .filter(|(from, worker)| !addresses.contains(from) || worker.is_finished())
            .map(|(from, _)| *from)
            .collect();

        for from in stale {
            self.wake.unregister(from).await;
            let Some(worker) = self.broadcasters.remove(&from) else {
                continue;
            };

            if worker.is_finished() {
                match worker.join().await {
                    Ok(()) => tracing::warn!(from = %from, "Broadcaster exited"),
                    Err(e) => tracing::warn!(from = %from, error = ?e, "Broadcaster exited with error"),
                }
            } else {
                tracing::info!(from = %from, "Address removed from key set, stopping broadcaster");
                if let Err(e) = worker.shutdown().await {
                    tracing::warn!(from = %from, error = ?e, "Broadcaster stopped with error");
                }
            }
        }

        for &from in addresses {
            if self.broadcasters.contains_key(&from) {
                continue;
            }

            let wake_rx = self.wake.register(from).await;
            let broadcaster = Broadcaster::new(self.ctx.clone(), from);
            let worker = WorkerHandle::spawn(
                format!("broadcaster:{from}"),
                escalating(self.fatal_tx.clone(), move |shutdown| {
                    broadcaster.run(wake_rx, shutdown)
                }),
            );
            tracing::info!(from = %from, "Started broadcaster");
            self.broadcasters.insert(from, worker);
        }
    }
}
