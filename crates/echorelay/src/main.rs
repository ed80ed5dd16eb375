//! `EchoRelay`
//!
//! Subscribes to one MQTT topic on the local broker and answers every message
//! with a JSON envelope on `<topic>/response`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use echorelay::broker::{Broker, MqttBroker};
use echorelay::relay::{EchoRelay, RelayOptions};
use echorelay_core::config::{Config, load_config};
use echorelay_core::topic::validate_topic;
use echorelay_core::tracing_init::{default_filter, init_tracing};
use echorelay_core::Error;

#[derive(Parser, Debug)]
#[command(name = "echorelay")]
#[command(version, about = "Echo every message on a topic back to <topic>/response")]
struct Args {
    /// Topic to subscribe to.
    topic: Option<String>,

    /// JSON settings file.
    #[arg(long, env = "ECHORELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Broker host.
    #[arg(long)]
    host: Option<String>,

    /// Broker port.
    #[arg(long)]
    port: Option<u16>,

    /// MQTT client id (generated when unset).
    #[arg(long)]
    client_id: Option<String>,

    /// Username for broker authentication.
    #[arg(long)]
    username: Option<String>,

    /// Password for broker authentication.
    #[arg(long)]
    password: Option<String>,

    /// Seconds to wait for subscribe and publish acknowledgements.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Maximum publishes waiting for acknowledgement at once.
    #[arg(long)]
    max_in_flight: Option<usize>,

    /// Re-subscribe with backoff when the broker closes the subscription.
    #[arg(long)]
    resubscribe: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

impl Args {
    /// Command-line flags take precedence over every other source.
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.broker.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.broker.port = port;
        }
        if self.client_id.is_some() {
            config.broker.client_id.clone_from(&self.client_id);
        }
        if self.username.is_some() {
            config.broker.username.clone_from(&self.username);
        }
        if self.password.is_some() {
            config.broker.password.clone_from(&self.password);
        }
        if let Some(secs) = self.timeout_secs {
            config.relay.operation_timeout_secs = secs;
        }
        if let Some(n) = self.max_in_flight {
            config.relay.max_in_flight_publishes = n;
        }
        if self.resubscribe {
            config.relay.resubscribe.enabled = true;
        }
        if let Some(level) = &self.log_level {
            config.log.level.clone_from(level);
        }
        if self.log_json {
            config.log.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(&default_filter(&config.log.level), config.log.json);

    let Some(topic) = args.topic else {
        return Err(Error::Configuration("missing required <TOPIC> argument".into()).into());
    };
    validate_topic(&topic)?;
    let options = RelayOptions::from_settings(topic, &config.relay);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.broker.host,
        port = config.broker.port,
        "Starting echorelay"
    );

    let broker = Arc::new(MqttBroker::connect(&config.broker));
    let relay = EchoRelay::new(broker.clone(), options)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = relay.run(cancel).await;
    if let Err(e) = &result {
        error!(error = %e, kind = e.kind(), "Relay failed");
    }

    if let Err(e) = broker.disconnect().await {
        warn!(error = %e, "Disconnect from broker failed");
    }

    result?;
    info!("Relay stopped");
    Ok(())
}

/// Cancel `token` on Ctrl-C or, on Unix, SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
    cancel_when(shutdown_signal(), token).await;
}

/// Cancel `token` once `signal` fires. When no signal listener could be
/// installed the relay keeps serving until the process is killed.
async fn cancel_when(signal: impl Future<Output = std::io::Result<()>>, token: CancellationToken) {
    match signal.await {
        Ok(()) => {
            info!("Received shutdown signal");
            token.cancel();
        }
        Err(e) => {
            error!(error = %e, "Cannot listen for shutdown signals");
            std::future::pending::<()>().await;
        }
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                return tokio::signal::ctrl_c().await;
            }
        };

        let ctrl_c = tokio::select! {
            result = tokio::signal::ctrl_c() => Some(result),
            _ = term.recv() => None,
        };
        if let Some(Err(e)) = ctrl_c {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            term.recv().await;
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn signal_cancels_token() {
        let token = CancellationToken::new();
        cancel_when(async { Ok(()) }, token.clone()).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn failed_signal_listener_keeps_relay_running() {
        let token = CancellationToken::new();
        let waiter = tokio::spawn(cancel_when(
            async { Err(std::io::Error::other("signal driver unavailable")) },
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_cancelled());
        assert!(!waiter.is_finished());
        waiter.abort();
    }

    #[test]
    fn flags_override_settings() {
        let args = Args::parse_from([
            "echorelay",
            "--host",
            "broker.local",
            "--timeout-secs",
            "3",
            "--resubscribe",
            "sensors/temp",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.relay.operation_timeout_secs, 3);
        assert!(config.relay.resubscribe.enabled);
        assert_eq!(args.topic.as_deref(), Some("sensors/temp"));
    }
}
