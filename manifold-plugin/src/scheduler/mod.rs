//! The scheduler.
//!
//! Drives all handler invocations: periodic read passes, the write
//! dispatch loop, and one supervised task per listen-capable device.
//! Readings flow out through a bounded channel into the state
//! pipeline; when the consumer falls behind, the read loop blocks
//! rather than dropping data. Writes arrive on a bounded channel
//! from the RPC surface and advance their transactions as they are
//! processed.

use crate::config::{Mode, Settings};
use crate::device::DeviceManager;
use crate::transaction::Transaction;
use futures::future;
use manifold_api::{
    device::{Device, DEFAULT_WRITE_TIMEOUT},
    types::{ReadContext, Reading, WriteData},
    Error, Result,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub mod limiter;

use limiter::RateLimiter;

// Listener restart backoff: start at one second, double up to a
// minute, and treat thirty seconds of uptime as a recovery.

const LISTEN_INITIAL_DELAY: Duration = Duration::from_secs(1);
const LISTEN_MAX_DELAY: Duration = Duration::from_secs(60);
const LISTEN_STABLE_UPTIME: Duration = Duration::from_secs(30);

const LISTEN_CHAN_SIZE: usize = 32;

/// One queued write: the transaction to advance, the target device,
/// and the payload.
pub struct WriteJob {
    transaction: Arc<Transaction>,
    device: Arc<Device>,
    data: WriteData,
}

pub struct Scheduler {
    mode: Mode,
    read_interval: Duration,
    write_interval: Duration,
    write_max: usize,
    write_buffer: usize,
    read_enabled: bool,
    write_enabled: bool,
    devices: Arc<DeviceManager>,
    limiter: Option<RateLimiter>,
    read_tx: mpsc::Sender<ReadContext>,
    write_tx: mpsc::Sender<WriteJob>,
    write_rx: Mutex<Option<mpsc::Receiver<WriteJob>>>,
}

impl Scheduler {
    /// Creates the scheduler. The returned receiver is the read
    /// pipeline; the caller wires it to the state manager.
    pub fn new(
        settings: &Settings,
        devices: Arc<DeviceManager>,
    ) -> Result<(Scheduler, mpsc::Receiver<ReadContext>)> {
        let mode = settings.mode()?;
        let (read_tx, read_rx) = mpsc::channel(settings.read.buffer);
        let (write_tx, write_rx) = mpsc::channel(settings.write.buffer);

        Ok((
            Scheduler {
                mode,
                read_interval: settings.read.interval(),
                write_interval: settings.write.interval(),
                write_max: settings.write.max,
                write_buffer: settings.write.buffer,
                read_enabled: !settings.read.disable,
                write_enabled: !settings.write.disable,
                devices,
                limiter: settings
                    .limiter
                    .map(|l| RateLimiter::new(l.rate, l.burst)),
                read_tx,
                write_tx,
                write_rx: Mutex::new(Some(write_rx)),
            },
            read_rx,
        ))
    }

    /// Accepts a write for dispatch. The transaction moves to
    /// `PENDING` once the job is queued; a full channel blocks the
    /// caller.
    pub async fn enqueue_write(
        &self,
        device: Arc<Device>,
        mut data: WriteData,
        transaction: Arc<Transaction>,
    ) -> Result<()> {
        if !self.write_enabled {
            return Err(Error::UnsupportedCommand(
                "writes are disabled on this plugin".into(),
            ));
        }

        data.transaction = Some(transaction.id().into());
        transaction.set_status_pending();
        self.write_tx
            .send(WriteJob {
                transaction,
                device,
                data,
            })
            .await
            .map_err(Error::from)
    }

    /// Runs the scheduler until the shutdown signal fires, then
    /// drains outstanding writes.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut tasks = vec![];

        if self.read_enabled {
            tasks.push(tokio::spawn(
                self.clone()
                    .read_loop(shutdown.clone())
                    .instrument(info_span!("read")),
            ));

            for device in self.devices.all_devices() {
                if device.handler.has_listen() {
                    tasks.push(tokio::spawn(
                        self.clone()
                            .listener(device.clone(), shutdown.clone())
                            .instrument(info_span!(
                                "listener",
                                device = %device.id
                            )),
                    ));
                }
            }
        }

        if self.write_enabled {
            tasks.push(tokio::spawn(
                self.clone()
                    .write_loop(shutdown.clone())
                    .instrument(info_span!("write")),
            ));
        }

        let _ = future::join_all(tasks).await;
        info!("scheduler stopped")
    }

    // -----------------------------------------------------------------
    // Read path.

    async fn read_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.read_interval);

        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("starting read loop");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            self.clone().read_pass(Instant::now() + self.read_interval).await
        }
        info!("read loop stopped")
    }

    // One full read pass. Devices partition by handler: bulk-read
    // handlers get a single call with all their devices, read
    // handlers go device-by-device. A failing handler only loses its
    // own readings for the tick.

    async fn read_pass(self: Arc<Self>, deadline: Instant) {
        let mut partitions: HashMap<String, Vec<Arc<Device>>> = HashMap::new();

        for device in self.devices.all_devices() {
            if device.handler.has_bulk_read() || device.handler.has_read() {
                partitions
                    .entry(device.handler.name().into())
                    .or_default()
                    .push(device)
            }
        }

        for (name, devices) in partitions {
            let handler = devices[0].handler.clone();

            if handler.has_bulk_read() {
                if !self.acquire(deadline).await {
                    warn!(handler = %name, "rate limited; skipping bulk read");
                    continue;
                }

                let Some(fut) = handler.bulk_read(devices) else {
                    continue;
                };

                match fut.await {
                    Ok(contexts) => {
                        for ctx in contexts {
                            self.emit_context(ctx).await
                        }
                    }
                    Err(e) => {
                        error!(handler = %name, "bulk read failed -- {}", e)
                    }
                }
            } else {
                match self.mode {
                    Mode::Parallel => {
                        let mut set = JoinSet::new();

                        for device in devices {
                            let sched = self.clone();

                            set.spawn(async move {
                                sched.read_device(device, deadline).await
                            });
                        }
                        while set.join_next().await.is_some() {}
                    }
                    Mode::Serial => {
                        for device in devices {
                            self.read_device(device, deadline).await
                        }
                    }
                }
            }
        }
    }

    async fn read_device(&self, device: Arc<Device>, deadline: Instant) {
        if !self.acquire(deadline).await {
            warn!(device = %device.id, "rate limited; dropping read");
            return;
        }

        let Some(fut) = device.handler.read(&device) else {
            return;
        };

        match fut.await {
            Ok(readings) => self.emit(&device, readings).await,
            Err(e) => error!(device = %device.id, "read failed -- {}", e),
        }
    }

    // Finalizes readings for a device and pushes them into the read
    // pipeline. Transforms run in declared order; a reading whose
    // transform fails is dropped, not the batch. The send blocks
    // when the pipeline is full: back-pressure, not loss.

    async fn emit(&self, device: &Arc<Device>, readings: Vec<Reading>) {
        let mut finalized = Vec::with_capacity(readings.len());

        for mut reading in readings {
            let mut failed = false;

            for transform in &device.transforms {
                match transform.apply(&reading.value) {
                    Ok(value) => reading.value = value,
                    Err(e) => {
                        error!(
                            device = %device.id,
                            "transform {} failed -- {}", transform, e
                        );
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                continue;
            }

            reading.device = device.id.clone();
            if reading.kind.is_empty() {
                if let Some(output) = &device.output {
                    reading.kind = output.clone()
                }
            }

            // The output type supplies the unit the handler didn't,
            // and bounds float precision.

            if let Some(output) = self.devices.get_output(&reading.kind) {
                if reading.unit.is_none() {
                    reading.unit = output.unit.clone()
                }
                reading.value = output.apply_precision(reading.value)
            }

            reading.timestamp = chrono::Utc::now();
            finalized.push(reading)
        }

        if finalized.is_empty() {
            return;
        }

        let ctx = ReadContext {
            device: device.id.clone(),
            readings: finalized,
            tags: device.tags.clone(),
        };

        if self.read_tx.send(ctx).await.is_err() {
            warn!("read pipeline closed; dropping readings")
        }
    }

    // Routes a handler-assembled batch (bulk read or listen) through
    // the owning device so its transforms and tag snapshot apply.

    async fn emit_context(&self, ctx: ReadContext) {
        match self.devices.get_device(&ctx.device) {
            Some(device) => self.emit(&device, ctx.readings).await,
            None => {
                warn!(
                    device = %ctx.device,
                    "readings for unknown device; dropping"
                )
            }
        }
    }

    async fn acquire(&self, deadline: Instant) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.acquire(deadline).await,
            None => true,
        }
    }

    // -----------------------------------------------------------------
    // Listen path.

    // Supervises one device's listen handler for the life of the
    // plugin. When the handler returns, it restarts after an
    // exponential backoff.

    async fn listener(
        self: Arc<Self>,
        device: Arc<Device>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut delay = LISTEN_INITIAL_DELAY;

        info!("starting listener");

        loop {
            let (tx, mut rx) = mpsc::channel(LISTEN_CHAN_SIZE);
            let Some(mut fut) = device.handler.listen(&device, tx) else {
                return;
            };
            let started = Instant::now();
            let mut listen_done = false;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    ctx = rx.recv() => match ctx {
                        Some(ctx) => self.emit_context(ctx).await,
                        // The handler dropped its sender; the batch
                        // backlog is drained.
                        None => break,
                    },
                    result = &mut fut, if !listen_done => {
                        listen_done = true;
                        match result {
                            Ok(()) => warn!("listener exited"),
                            Err(e) => error!("listener failed -- {}", e),
                        }
                    }
                }
            }

            if started.elapsed() >= LISTEN_STABLE_UPTIME {
                delay = LISTEN_INITIAL_DELAY
            }

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = std::cmp::min(delay * 2, LISTEN_MAX_DELAY);
            debug!("restarting listener")
        }
    }

    // -----------------------------------------------------------------
    // Write path.

    async fn write_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = match self.write_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                error!("write loop started twice");
                return;
            }
        };

        info!("starting write loop");

        match self.mode {
            // Serial mode works in batches: up to `write_max` queued
            // writes per tick, FIFO.
            Mode::Serial => {
                let mut ticker = interval(self.write_interval);

                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {}
                    }

                    for _ in 0..self.write_max {
                        match rx.try_recv() {
                            Ok(job) => self.do_write(job).await,
                            Err(_) => break,
                        }
                    }
                }

                self.drain_writes(&mut rx).await
            }

            // Parallel mode dispatches each job to a worker task,
            // capped at `write_buffer` concurrent writers.
            Mode::Parallel => {
                let semaphore = Arc::new(Semaphore::new(self.write_buffer));
                let mut set = JoinSet::new();

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        job = rx.recv() => match job {
                            Some(job) => {
                                while set.try_join_next().is_some() {}

                                let Ok(permit) = semaphore
                                    .clone()
                                    .acquire_owned()
                                    .await
                                else {
                                    break;
                                };
                                let sched = self.clone();

                                set.spawn(async move {
                                    sched.do_write(job).await;
                                    drop(permit)
                                });
                            }
                            None => break,
                        }
                    }
                }

                self.drain_writes(&mut rx).await;

                // In-flight writers get the shutdown grace to
                // finish.

                let wait = async {
                    while set.join_next().await.is_some() {}
                };

                if timeout(self.drain_grace(), wait).await.is_err() {
                    warn!("in-flight writes outlived the shutdown grace")
                }
            }
        }
        info!("write loop stopped")
    }

    // Processes whatever is still queued at shutdown, bounded by the
    // drain grace.

    async fn drain_writes(&self, rx: &mut mpsc::Receiver<WriteJob>) {
        let drain = async {
            while let Ok(job) = rx.try_recv() {
                self.do_write(job).await
            }
        };

        if timeout(self.drain_grace(), drain).await.is_err() {
            warn!("queued writes outlived the shutdown grace")
        }
    }

    fn drain_grace(&self) -> Duration {
        self.devices
            .all_devices()
            .iter()
            .map(|d| d.write_timeout)
            .max()
            .unwrap_or(DEFAULT_WRITE_TIMEOUT)
            + Duration::from_secs(1)
    }

    // Executes one write. The device's write lock is held for the
    // whole handler call, so a device never sees two writes at once;
    // the handler itself runs under the device's write timeout.

    async fn do_write(&self, job: WriteJob) {
        let WriteJob {
            transaction,
            device,
            data,
        } = job;

        transaction.set_status_writing();

        if let Some(limiter) = &self.limiter {
            if !limiter.acquire(Instant::now() + device.write_timeout).await {
                warn!(device = %device.id, "rate limited; dropping write");
                transaction.set_state_error("rate limited; write dropped");
                transaction.set_status_done();
                return;
            }
        }

        let _guard = device.lock_for_write().await;

        let Some(fut) = device.handler.write(&device, data) else {
            transaction.set_state_error("device does not support writes");
            transaction.set_status_done();
            return;
        };

        match timeout(device.write_timeout, fut).await {
            Ok(Ok(())) => transaction.set_status_done(),
            Ok(Err(e)) => {
                error!(device = %device.id, "write failed -- {}", e);
                transaction.set_state_error(&e.to_string());
                transaction.set_status_done()
            }
            Err(_) => {
                error!(device = %device.id, "write timed out");
                transaction.set_state_error("write timeout");
                transaction.set_status_done()
            }
        }
    }
}
