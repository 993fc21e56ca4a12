//! The plugin lifecycle.
//!
//! A `Plugin` owns every sub-manager: configuration, the device
//! manager, the state manager, the scheduler, the transaction cache,
//! and the RPC service. Plugin authors construct one, register their
//! handlers and actions, and hand control to `execute`, which runs
//! setup, starts the runtime, blocks on the termination signal, and
//! shuts down in order.
//!
//! There is no process-wide state anywhere in the framework; tests
//! (and embedders with unusual needs) drive the same `setup` /
//! `start` / `shutdown` pieces that `execute` uses.

use crate::config::{self, Config};
use crate::device::{
    builder, DeviceAction, DeviceDataValidator, DeviceManager,
    DeviceSetupAction, DynamicConfigRegistrar, DynamicDeviceRegistrar,
};
use crate::meta::{PluginMetadata, VersionInfo};
use crate::rpc::PluginService;
use crate::scheduler::Scheduler;
use crate::state::{self, StateManager};
use crate::transaction::Cache;
use async_trait::async_trait;
use manifold_api::{
    handler::{Fut, Handler},
    types::MultiError,
    Error, Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A plugin-registered callback run at a lifecycle boundary: pre-run
/// actions before the scheduler starts (failures abort startup),
/// post-run actions during shutdown (failures aggregate into the
/// exit status).
#[async_trait]
pub trait PluginAction: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<()>;
}

/// The hook through which the external wire layer serves the RPC
/// surface. It receives the service and the shutdown signal; the
/// future runs for the life of the plugin.
pub type ServeFn = Box<
    dyn FnOnce(Arc<PluginService>, watch::Receiver<bool>) -> Fut<Result<()>>
        + Send,
>;

pub struct Plugin {
    cfg: Config,
    metadata: PluginMetadata,
    version: VersionInfo,
    manager: DeviceManager,
    pre_run: Vec<Box<dyn PluginAction>>,
    post_run: Vec<Box<dyn PluginAction>>,
    setup_actions: Vec<DeviceSetupAction>,
    config_registrar: Option<DynamicConfigRegistrar>,
    device_registrar: Option<DynamicDeviceRegistrar>,
    serve: Option<ServeFn>,
}

impl Plugin {
    /// Creates a plugin from the discovered configuration (search
    /// paths and `PLUGIN_CONFIG`).
    pub async fn new(
        metadata: PluginMetadata,
        version: VersionInfo,
    ) -> Result<Plugin> {
        let cfg = config::load().await?;

        Ok(Plugin::with_config(cfg, metadata, version))
    }

    /// Creates a plugin from an explicit configuration.
    pub fn with_config(
        cfg: Config,
        metadata: PluginMetadata,
        version: VersionInfo,
    ) -> Plugin {
        // The plugin identity seeds the device id namespace: the
        // configured id when present, the metadata tag otherwise.

        let identity = cfg
            .id
            .clone()
            .unwrap_or_else(|| metadata.tag());
        let namespace = builder::plugin_namespace(&identity);

        Plugin {
            cfg,
            metadata,
            version,
            manager: DeviceManager::new(namespace),
            pre_run: vec![],
            post_run: vec![],
            setup_actions: vec![],
            config_registrar: None,
            device_registrar: None,
            serve: None,
        }
    }

    pub fn register_handler(&mut self, handler: Handler) -> Result<()> {
        self.manager.register_handler(handler)
    }

    /// Registers an output type beyond the built-in set.
    pub fn register_output(&mut self, output: crate::output::Output) -> Result<()> {
        self.manager.register_output(output)
    }

    pub fn register_pre_run_action(&mut self, action: Box<dyn PluginAction>) {
        self.pre_run.push(action)
    }

    pub fn register_post_run_action(&mut self, action: Box<dyn PluginAction>) {
        self.post_run.push(action)
    }

    /// Registers an action to run once per matching device after
    /// device assembly. The filter is validated immediately.
    pub fn register_device_setup_action(
        &mut self,
        filter: HashMap<String, Vec<String>>,
        action: Arc<dyn DeviceAction>,
    ) -> Result<()> {
        let setup = DeviceSetupAction { filter, action };

        setup.validate()?;
        self.setup_actions.push(setup);
        Ok(())
    }

    pub fn register_dynamic_config_registrar(
        &mut self,
        registrar: DynamicConfigRegistrar,
    ) {
        self.config_registrar = Some(registrar)
    }

    pub fn register_dynamic_device_registrar(
        &mut self,
        registrar: DynamicDeviceRegistrar,
    ) {
        self.device_registrar = Some(registrar)
    }

    pub fn set_device_data_validator(&mut self, validator: DeviceDataValidator) {
        self.manager.set_device_data_validator(validator)
    }

    /// Registers the wire layer.
    pub fn register_server(&mut self, serve: ServeFn) {
        self.serve = Some(serve)
    }

    /// Runs all of setup: static device configs, dynamic
    /// registration, state and caches, the scheduler, pre-run
    /// actions (fail-fast), and device setup actions.
    pub async fn setup(mut self) -> Result<Runtime> {
        info!(plugin = %self.metadata.tag(), "setting up plugin");

        for type_cfg in config::load_types().await? {
            for output in &type_cfg.types {
                self.manager
                    .register_output(crate::output::Output::from(output))?
            }
        }

        let device_cfgs = config::load_devices().await?;

        self.manager.load_config(&device_cfgs)?;
        self.manager.run_dynamic_registration(
            &self.cfg.dynamic_registration,
            self.config_registrar.as_ref(),
            self.device_registrar.as_ref(),
        )?;

        if self.manager.device_count() == 0 {
            warn!("no devices are configured")
        }

        let manager = Arc::new(self.manager);
        let transactions =
            Arc::new(Cache::new(self.cfg.settings.transaction.ttl()));
        let state = Arc::new(StateManager::new(
            self.cfg
                .settings
                .cache
                .enabled
                .then(|| self.cfg.settings.cache.ttl()),
        ));
        let (scheduler, read_rx) =
            Scheduler::new(&self.cfg.settings, manager.clone())?;
        let scheduler = Arc::new(scheduler);

        for action in &self.pre_run {
            info!(action = action.name(), "running pre-run action");
            action.run().await.map_err(|e| {
                Error::Config(format!(
                    "pre-run action \"{}\" failed: {}",
                    action.name(),
                    e
                ))
            })?
        }

        manager.run_setup_actions(&self.setup_actions).await?;

        let healthy = Arc::new(AtomicBool::new(false));
        let service = Arc::new(PluginService::new(
            self.metadata.clone(),
            self.version.clone(),
            self.cfg.network.clone(),
            manager.clone(),
            state.clone(),
            scheduler.clone(),
            transactions.clone(),
            healthy.clone(),
        ));

        Ok(Runtime {
            service,
            state,
            scheduler,
            transactions,
            read_rx,
            healthy,
            post_run: self.post_run,
            serve: self.serve,
        })
    }

    /// The full lifecycle, mapped to the process exit code: 0 for a
    /// clean shutdown or dry run, 1 for post-run failures, 2 for a
    /// startup failure.
    pub async fn execute(self) -> i32 {
        let args = config::from_cmdline();

        if args.version {
            println!("{}", self.version);
            return 0;
        }

        init_logging(&self.cfg, args.debug);

        let runtime = match self.setup().await {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("plugin setup failed -- {}", e);
                return 2;
            }
        };

        if args.dry_run {
            info!("dry run requested; setup verified");
            return 0;
        }

        let running = runtime.start();

        wait_for_termination().await;
        info!("termination signal received");

        match running.shutdown().await {
            Ok(()) => 0,
            Err(e) => {
                error!("shutdown finished with errors -- {}", e);
                1
            }
        }
    }
}

fn init_logging(cfg: &Config, debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        cfg.get_log_level()
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Unable to set global default subscriber");
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

/// A fully set-up plugin, ready to start.
pub struct Runtime {
    service: Arc<PluginService>,
    state: Arc<StateManager>,
    scheduler: Arc<Scheduler>,
    transactions: Arc<Cache>,
    read_rx: tokio::sync::mpsc::Receiver<manifold_api::types::ReadContext>,
    healthy: Arc<AtomicBool>,
    post_run: Vec<Box<dyn PluginAction>>,
    serve: Option<ServeFn>,
}

impl Runtime {
    pub fn service(&self) -> Arc<PluginService> {
        self.service.clone()
    }

    /// Starts the runtime tasks: the state updater, the transaction
    /// sweeper, the scheduler loops, and the wire layer if one is
    /// registered.
    pub fn start(self) -> RunningPlugin {
        let (stop_tx, stop_rx) = watch::channel(false);

        let updater = tokio::spawn(state::run_updater(
            self.state.clone(),
            self.read_rx,
        ));
        let sweeper = tokio::spawn(self.transactions.clone().run_cleanup());
        let scheduler = tokio::spawn(self.scheduler.clone().run(stop_rx.clone()));

        let server = self.serve.map(|serve| {
            let service = self.service.clone();
            let stop_rx = stop_rx.clone();

            tokio::spawn(async move {
                if let Err(e) = serve(service, stop_rx).await {
                    error!("server exited with error -- {}", e)
                }
            })
        });

        self.healthy.store(true, Ordering::Relaxed);
        info!("plugin is running");

        RunningPlugin {
            service: self.service,
            healthy: self.healthy,
            stop_tx,
            scheduler,
            aux: {
                let mut aux = vec![updater, sweeper];

                aux.extend(server);
                aux
            },
            post_run: self.post_run,
        }
    }
}

/// Handle to a running plugin. `shutdown` performs the ordered
/// teardown; dropping the handle instead leaves the spawned tasks to
/// the runtime.
pub struct RunningPlugin {
    service: Arc<PluginService>,
    healthy: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    scheduler: JoinHandle<()>,
    aux: Vec<JoinHandle<()>>,
    post_run: Vec<Box<dyn PluginAction>>,
}

impl RunningPlugin {
    pub fn service(&self) -> Arc<PluginService> {
        self.service.clone()
    }

    /// Ordered shutdown: signal every loop, wait for the scheduler
    /// to drain its writes, stop the auxiliary tasks, then run the
    /// post-run actions and aggregate their failures.
    pub async fn shutdown(self) -> Result<()> {
        self.healthy.store(false, Ordering::Relaxed);
        let _ = self.stop_tx.send(true);

        if self.scheduler.await.is_err() {
            warn!("scheduler task ended abnormally")
        }
        for task in self.aux {
            task.abort()
        }

        let mut errs = MultiError::new();

        for action in &self.post_run {
            info!(action = action.name(), "running post-run action");

            let _ = errs.absorb(action.run().await.map_err(|e| {
                Error::Config(format!(
                    "post-run action \"{}\" failed: {}",
                    action.name(),
                    e
                ))
            }));
        }

        info!("plugin stopped");
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceInstance, DeviceProto, DynamicRegistration};
    use crate::device::Selector;
    use manifold_api::types::transaction::Status;
    use manifold_api::types::{Reading, WriteData};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_plugin() -> Plugin {
        let mut cfg: Config = toml::from_str(
            r#"
id = "test-plugin"

[settings.read]
interval = 0.01

[settings.write]
interval = 0.01
"#,
        )
        .unwrap();

        cfg.dynamic_registration = DynamicRegistration {
            policy: "required".into(),
            config: vec![
                [(
                    String::from("address"),
                    toml::Value::String("10.0.0.1".into()),
                )]
                .into_iter()
                .collect(),
                [(
                    String::from("address"),
                    toml::Value::String("10.0.0.2".into()),
                )]
                .into_iter()
                .collect(),
            ],
        };

        let mut plugin = Plugin::with_config(
            cfg,
            PluginMetadata::new("example", "vapor", "test plugin", ""),
            VersionInfo::new("0.0.1"),
        );

        plugin
            .register_handler(
                Handler::new("led")
                    .with_read(|_| {
                        Box::pin(async { Ok(vec![Reading::new(1i32)]) })
                    })
                    .with_write(|_, _| Box::pin(async { Ok(()) }))
                    .with_actions(&["state"]),
            )
            .unwrap();

        plugin.register_dynamic_config_registrar(Box::new(|entry| {
            Ok(vec![DeviceProto {
                device_type: "led".into(),
                instances: vec![DeviceInstance {
                    data: entry.clone(),
                    ..DeviceInstance::default()
                }],
                ..DeviceProto::default()
            }])
        }));

        plugin
    }

    struct Counter(String, Arc<AtomicUsize>);

    #[async_trait]
    impl PluginAction for Counter {
        fn name(&self) -> &str {
            &self.0
        }

        async fn run(&self) -> Result<()> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl PluginAction for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self) -> Result<()> {
            Err(Error::Handler("broken".into()))
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let mut plugin = test_plugin();
        let pre = Arc::new(AtomicUsize::new(0));
        let post = Arc::new(AtomicUsize::new(0));

        plugin.register_pre_run_action(Box::new(Counter(
            "pre".into(),
            pre.clone(),
        )));
        plugin.register_post_run_action(Box::new(Counter(
            "post".into(),
            post.clone(),
        )));

        let runtime = plugin.setup().await.unwrap();

        assert_eq!(pre.load(Ordering::SeqCst), 1);
        assert_eq!(post.load(Ordering::SeqCst), 0);

        let service = runtime.service();
        let running = runtime.start();

        // Both dynamically registered devices exist and the
        // scheduler produces readings for them.

        use tokio_stream::StreamExt;

        let devices: Vec<_> = service
            .devices(&Selector::default())
            .unwrap()
            .collect()
            .await;

        assert_eq!(devices.len(), 2);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);

        loop {
            let readings: Vec<_> = service
                .read(&Selector::default())
                .unwrap()
                .collect()
                .await;

            if readings.len() == 2 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "no readings produced"
            );
            tokio::time::sleep(Duration::from_millis(10)).await
        }

        // A write runs to completion through the live scheduler.

        let accepted = service
            .write(
                &Selector::by_id(&devices[0].id),
                vec![WriteData::new("state", b"on")],
            )
            .await
            .unwrap();

        while service.transaction(&accepted[0].id).unwrap().status
            != Status::Done
        {
            assert!(
                std::time::Instant::now() < deadline,
                "write never completed"
            );
            tokio::time::sleep(Duration::from_millis(10)).await
        }

        running.shutdown().await.unwrap();
        assert_eq!(post.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pre_run_failure_aborts_setup() {
        let mut plugin = test_plugin();

        plugin.register_pre_run_action(Box::new(Failing));

        match plugin.setup().await {
            Err(Error::Config(msg)) => {
                assert!(msg.contains("pre-run action"));
                assert!(msg.contains("failing"))
            }
            other => panic!(
                "unexpected result: {:?}",
                other.map(|_| "runtime")
            ),
        }
    }

    #[tokio::test]
    async fn test_post_run_failures_aggregate() {
        let mut plugin = test_plugin();

        plugin.register_post_run_action(Box::new(Failing));

        let running = plugin.setup().await.unwrap().start();

        assert!(running.shutdown().await.is_err());
    }

    #[tokio::test]
    async fn test_setup_action_filter_validated_at_registration() {
        struct Noop;

        #[async_trait]
        impl DeviceAction for Noop {
            fn name(&self) -> &str {
                "noop"
            }

            async fn run(
                &self,
                _: &Arc<manifold_api::device::Device>,
            ) -> Result<()> {
                Ok(())
            }
        }

        let mut plugin = test_plugin();

        assert!(plugin
            .register_device_setup_action(
                [(String::from("serial"), vec![String::from("*")])]
                    .into_iter()
                    .collect(),
                Arc::new(Noop),
            )
            .is_err());
        assert!(plugin
            .register_device_setup_action(
                [(String::from("type"), vec![String::from("led")])]
                    .into_iter()
                    .collect(),
                Arc::new(Noop),
            )
            .is_ok());
    }

    #[tokio::test]
    async fn test_required_policy_enforced_in_setup() {
        let mut plugin = test_plugin();

        // Replace the registrar with one that finds nothing.

        plugin.register_dynamic_config_registrar(Box::new(|_| Ok(vec![])));

        match plugin.setup().await {
            Err(Error::PolicyViolation(_)) => {}
            other => panic!(
                "unexpected result: {:?}",
                other.map(|_| "runtime")
            ),
        }
    }
}
