// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use app_metadata::{discover_info, AppCache, AppResolver, CfClient, EmptyResolver, SledStore};
use event_routing::{
    cache_needed, has_ignore_field, not_in_certain_orgs, not_in_certain_spaces,
    parse_extra_fields, parse_space_filters, setup_event_routing, EventFilter, JsonLinesSink,
    Router, Sink,
};
use firehose_nozzle::{Nozzle, RlpStreamer, Stats, TokenRefresher, UaaTokenRefresher};

use crate::config::Config;

const STATS_PERIOD: Duration = Duration::from_secs(1);

#[tokio::main]
pub async fn main() -> ExitCode {
    init_tracing(&config::log_level());
    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");
}

async fn run() -> Result<ExitCode> {
    let config = Config::from_env()?;
    info!("Starting firehose-to-syslog {}", env!("CARGO_PKG_VERSION"));

    let selected = setup_event_routing(&config.events)?;
    let extra_fields = parse_extra_fields(&config.extra_fields)?;

    let uaa_endpoint = match &config.uaa_endpoint {
        Some(endpoint) => endpoint.clone(),
        None => {
            discover_info(&config.api_endpoint, config.skip_ssl_validation)
                .await
                .context("failed to discover the token endpoint")?
                .token_endpoint
        }
    };
    let token_refresher: Arc<dyn TokenRefresher> = Arc::new(UaaTokenRefresher::new(
        &uaa_endpoint,
        config.client_id.clone(),
        config.client_secret.clone(),
        config.skip_ssl_validation,
    )?);

    let cache = if cache_needed(&selected) {
        let client = CfClient::new(
            config.api_endpoint.clone(),
            Arc::clone(&token_refresher),
            config.skip_ssl_validation,
        )?
        .with_rate_limit(config.cc_rps);
        let cache = Arc::new(AppCache::new(
            config.cache_config(),
            Arc::new(client),
            Arc::new(SledStore::new(&config.boltdb_path)),
        ));
        cache.open().await.context("failed to open the app cache")?;
        Some(cache)
    } else {
        info!("No selected event carries an app id, app metadata is disabled");
        None
    };
    let resolver: Arc<dyn AppResolver> = match &cache {
        Some(cache) => Arc::clone(cache) as Arc<dyn AppResolver>,
        None => Arc::new(EmptyResolver),
    };

    let cancel_token = CancellationToken::new();
    let stats = Arc::new(Stats::new());
    tokio::spawn({
        let stats = Arc::clone(&stats);
        let cancel_token = cancel_token.clone();
        async move { stats.per_sec(STATS_PERIOD, cancel_token).await }
    });

    let filters: Vec<EventFilter> = vec![
        Box::new(has_ignore_field),
        not_in_certain_orgs(&config.cf_orgs),
        not_in_certain_spaces(parse_space_filters(&config.cf_spaces)),
    ];
    let sink: Arc<dyn Sink> = Arc::new(JsonLinesSink::stdout());
    let router = Arc::new(
        Router::new(selected, resolver, sink, Arc::clone(&stats))
            .with_extra_fields(extra_fields)
            .with_filters(filters),
    );
    if !config.log_event_totals_time.is_zero() {
        let router = Arc::clone(&router);
        let period = config.log_event_totals_time;
        let cancel_token = cancel_token.clone();
        tokio::spawn(async move { router.report_totals(period, cancel_token).await });
    }

    let rlp_endpoint = config.rlp_endpoint();
    info!("Using {rlp_endpoint} as log stream endpoint");
    let streamer = RlpStreamer::new(rlp_endpoint, token_refresher, config.rlp_config())?;
    let mut nozzle = Nozzle::new(
        config.nozzle_config(),
        Arc::new(streamer),
        router,
        Arc::clone(&stats),
    );
    let fatal = nozzle.start().await?;

    let mut exit_code = tokio::select! {
        () = shutdown_signal() => {
            info!("Signal received, stop reading and start draining");
            ExitCode::SUCCESS
        }
        result = fatal => match result {
            Ok(e) => {
                error!("Firehose nozzle stopped: {e}");
                ExitCode::FAILURE
            }
            Err(_) => ExitCode::SUCCESS,
        },
    };

    if let Err(e) = nozzle.stop_reading().await {
        warn!("Failed to stop reading: {e}");
    }
    match nozzle.draining(config.drain_timeout).await {
        Ok(drained) => info!("Drained {drained} buffered envelopes"),
        Err(e) => warn!("Drain did not complete: {e}"),
    }
    cancel_token.cancel();

    if let Some(cache) = cache {
        if let Err(e) = cache.close().await {
            error!("Failed to close the app cache: {e}");
            exit_code = ExitCode::FAILURE;
        }
    }
    debug!("Final stats: {:?}", stats.snapshot());
    Ok(exit_code)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for interrupts: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
