//! Kafka REST Gateway CLI
//!
//! Supports two modes:
//! - Discovery: resolve and watch brokers through ZooKeeper
//! - Static: run against a fixed broker list

use broker_watcher::{
    register_gateway, BrokerResolver, BrokerWatcher, Registration, ZkCoordination,
};
use clap::Parser;
use kafka_rest_core::{BrokerSet, CoordinationAddress, CoordinationClient, GatewayConfig, RetryPolicy};
use kafka_rest_gateway::{
    bind, run_admin_server, serve, AdminState, Gateway, GatewayOptions, KafkaProducerFactory,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "kafka-rest-gateway")]
#[command(about = "HTTP to Kafka gateway with ZooKeeper broker discovery")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "CONFIG")]
    config: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // HTTP
    // ─────────────────────────────────────────────────────────────────────────
    /// Listen address, also the advertised address when registering
    #[arg(long, env = "ADDR")]
    addr: Option<String>,

    // ─────────────────────────────────────────────────────────────────────────
    // Broker discovery
    // ─────────────────────────────────────────────────────────────────────────
    /// ZooKeeper servers and root, e.g. `zk1:2181,zk2:2181/kafka`
    #[arg(long, env = "ZOOKEEPER")]
    zookeeper: Option<String>,

    /// Static broker list, used when no ZooKeeper address is set
    #[arg(long, env = "BROKERS")]
    brokers: Option<String>,

    /// Advertise this gateway in ZooKeeper
    #[arg(long, env = "REGISTER")]
    register: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Producers
    // ─────────────────────────────────────────────────────────────────────────
    /// Retries before a data-path send fails
    #[arg(long, env = "RETRY")]
    retry: Option<u32>,

    /// Access-log topic
    #[arg(long, env = "LOGTOPIC")]
    logtopic: Option<String>,

    /// Enable Kafka client debug logging
    #[arg(long, env = "VERBOSE")]
    verbose: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Admin API
    // ─────────────────────────────────────────────────────────────────────────
    /// Debug/admin listen address
    #[arg(long, env = "DEBUG_LISTEN")]
    debug_listen: Option<String>,

    /// Disable admin API
    #[arg(long, env = "ADMIN_DISABLED")]
    admin_disabled: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// `json` or `pretty`
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(addr) = &self.addr {
            config.server.listen = addr.clone();
        }
        if let Some(zookeeper) = &self.zookeeper {
            config.coordination.address = zookeeper.clone();
        }
        if self.register {
            config.coordination.register = true;
        }
        if let Some(retry) = self.retry {
            config.producer.retry_connecting = retry;
        }
        if let Some(topic) = &self.logtopic {
            config.producer.log_topic = topic.clone();
        }
        if self.verbose {
            config.producer.verbose = true;
        }
        if let Some(listen) = &self.debug_listen {
            config.admin.listen = listen.clone();
        }
        if self.admin_disabled {
            config.admin.enabled = false;
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.observability.log_format = format.clone();
        }
    }
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    if config.observability.log_format == "pretty" {
        tracing_subscriber::registry()
            .with(fmt::layer().pretty())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen,
        "Starting kafka-rest-gateway"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    // ─────────────────────────────────────────────────────────────────────────
    // Initial broker set
    // ─────────────────────────────────────────────────────────────────────────
    let coordination: Option<(Arc<ZkCoordination>, CoordinationAddress)> =
        match config.coordination_address()? {
            Some(address) => {
                let zk = ZkCoordination::connect(&address.servers, config.coordination.session_timeout)
                    .await?;
                Some((Arc::new(zk), address))
            }
            None => None,
        };

    let brokers = match &coordination {
        Some((zk, address)) => BrokerResolver::new(zk.clone(), address).resolve().await?,
        None => {
            let list = args.brokers.as_deref().ok_or_else(|| {
                anyhow::anyhow!("either --zookeeper or --brokers must be given")
            })?;
            BrokerSet::parse_list(list)?
        }
    };
    info!(brokers = %brokers, "Resolved initial brokers");

    // ─────────────────────────────────────────────────────────────────────────
    // Producers and listeners
    // ─────────────────────────────────────────────────────────────────────────
    let gateway = Arc::new(
        Gateway::start(
            Arc::new(KafkaProducerFactory::new()),
            brokers,
            GatewayOptions::from(&config),
        )
        .await?,
    );

    let listener = bind(&config.server.listen).await?;
    let server = tokio::spawn({
        let gateway = gateway.clone();
        let cancel = cancel.clone();
        async move {
            let result = serve(gateway, listener, cancel.clone()).await;
            if let Err(e) = &result {
                error!(error = %e, "Ingest API failed");
                cancel.cancel();
            }
            result
        }
    });

    if config.coordination.register {
        if let Some((zk, address)) = &coordination {
            register_gateway(
                &**zk,
                address,
                &config.coordination.registration_namespace,
                &config.server.listen,
            )
            .await?;
        } else {
            warn!("Registration requested without a ZooKeeper address, skipping");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Membership watch
    // ─────────────────────────────────────────────────────────────────────────
    let watcher_cancel = CancellationToken::new();
    let mut watcher = coordination.as_ref().map(|(zk, address)| {
        let mut watcher = BrokerWatcher::new(
            zk.clone(),
            address,
            RetryPolicy::from(&config.coordination.reconnect),
        );
        if config.coordination.register {
            watcher = watcher.with_registration(Registration {
                namespace: config.coordination.registration_namespace.clone(),
                advertised: config.server.listen.clone(),
            });
        }
        watcher.spawn(watcher_cancel.clone())
    });

    let admin = if config.admin.enabled {
        let watcher_state = watcher.as_ref().map(|handle| {
            let state = handle.state_watch();
            Arc::new(move || format!("{:?}", *state.borrow())) as Arc<dyn Fn() -> String + Send + Sync>
        });
        let state = AdminState {
            gateway: gateway.clone(),
            watcher: watcher_state,
        };
        Some(tokio::spawn(run_admin_server(
            config.admin.listen.clone(),
            state,
            cancel.clone(),
        )))
    } else {
        None
    };

    // serve until shutdown, even after the watcher gives up
    match &mut watcher {
        Some(handle) => gateway.follow_membership(handle, &cancel).await,
        None => cancel.cancelled().await,
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    cancel.cancel();
    info!("Shutting down");

    match tokio::time::timeout(config.server.drain_timeout, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "Ingest API stopped with error"),
        Ok(Err(e)) => error!(error = %e, "Ingest API task failed"),
        Err(_) => warn!("In-flight requests still running after drain timeout"),
    }

    gateway.close().await;

    if let Some(handle) = watcher {
        watcher_cancel.cancel();
        handle.stop().await;
    }

    if let Some(admin) = admin {
        match admin.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Admin API stopped with error"),
            Err(e) => error!(error = %e, "Admin API task failed"),
        }
    }

    if let Some((zk, _)) = coordination {
        zk.close().await;
    }

    info!(stats = ?gateway.stats(), "kafka-rest-gateway stopped");
    Ok(())
}
