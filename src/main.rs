//! CLI for topicbus
//!
//! Subcommands:
//! - `sub`: subscribe to a filter on the configured broker and print messages
//! - `pub`: publish a single message

use std::sync::Arc;

use clap::Parser;
use topicbus::broker::{ExternalBroker, Publisher};
use topicbus::config::{Settings, load_config};
use topicbus::protocol::QoS;
use topicbus::router::{Ctx, TopicRegistrar, handler, recover};
use topicbus::utils::{Error, Result, logging};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "topicbus")]
enum Command {
    /// Subscribe to a topic filter and print every message until Ctrl-C
    Sub {
        #[arg(long)]
        filter: String,
        /// Overrides the configured broker endpoint
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        client_id: Option<String>,
    },
    /// Publish one message
    Pub {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        payload: String,
        #[arg(long, default_value_t = 0)]
        qos: u8,
        #[arg(long)]
        retain: bool,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        client_id: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.log.level);

    let result = match cmd {
        Command::Sub {
            filter,
            endpoint,
            client_id,
        } => run_sub(settings, &filter, endpoint, client_id).await,
        Command::Pub {
            topic,
            payload,
            qos,
            retain,
            endpoint,
            client_id,
        } => run_pub(settings, &topic, payload, qos, retain, endpoint, client_id).await,
    };

    if let Err(e) = result {
        error!("topicbus failed: {}", e);
        std::process::exit(1);
    }
}

fn connect_broker(
    mut settings: Settings,
    endpoint: Option<String>,
    client_id: Option<String>,
) -> Result<Arc<ExternalBroker>> {
    if let Some(endpoint) = endpoint {
        settings.external.endpoint = endpoint;
    }
    let client_id = client_id
        .or_else(|| Some(settings.external.client_id.clone()).filter(|id| !id.is_empty()))
        .unwrap_or_else(|| format!("topicbus-{}", uuid::Uuid::new_v4()));
    let broker = ExternalBroker::new(settings.external_config(Some(&client_id)))?;
    Ok(Arc::new(broker))
}

async fn run_sub(
    settings: Settings,
    filter: &str,
    endpoint: Option<String>,
    client_id: Option<String>,
) -> Result<()> {
    let acl = settings.acl_config();
    let broker = connect_broker(settings, endpoint, client_id)?;
    let registrar = TopicRegistrar::for_broker(broker.clone()).acl(acl).build();
    registrar.use_middleware([recover()]);

    registrar
        .handle(
            filter,
            handler(|ctx: Ctx| async move {
                println!("{} {}", ctx.topic(), String::from_utf8_lossy(ctx.payload()));
                Ok(())
            }),
        )
        .await?;

    broker.start().await?;
    info!(filter, endpoint = %broker.config().endpoint, "subscribed");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutdown signal received. Exiting gracefully.");

    let stopped = registrar.stop().await;
    broker.stop().await?;
    stopped
}

async fn run_pub(
    settings: Settings,
    topic: &str,
    payload: String,
    qos: u8,
    retain: bool,
    endpoint: Option<String>,
    client_id: Option<String>,
) -> Result<()> {
    let qos = QoS::try_from(qos)?;
    if qos == QoS::ExactlyOnce {
        return Err(Error::InvalidConfig("qos 2 is not supported".to_string()));
    }
    let broker = connect_broker(settings, endpoint, client_id)?;
    broker.start().await?;
    let published = broker.publish(topic, payload.into(), retain, qos).await;
    broker.stop().await?;
    published?;
    info!(topic, "published");
    Ok(())
}
