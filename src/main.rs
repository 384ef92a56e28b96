use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use chat_relay::relay::auth::{HmacIdentity, IdentityResolver, StaticIdentity};
use chat_relay::relay::broker::{InboxTransport, MemoryBroker, RedisBroker};
use chat_relay::relay::collab::{MemoryDirectory, MemoryMessageStore};
use chat_relay::relay::instance::resolve_instance_id;
use chat_relay::relay::server::{RelayConfig, RelayNode};
use chat_relay::relay::store::{MemoryStore, RedisStore, SharedStore};

#[derive(Parser)]
#[command(
    name = "chat-relay",
    version,
    about = "Multi-instance STOMP-over-WebSocket chat relay"
)]
struct Cli {
    /// Listen address for WebSocket clients
    #[arg(long, default_value = "127.0.0.1:9021", value_name = "ADDR")]
    bind: String,

    /// Redis URL backing presence and the instance inboxes; omit to run
    /// single-instance on in-memory state
    #[arg(long, value_name = "URL")]
    redis_url: Option<String>,

    /// Explicit instance id; defaults to the hostname
    #[arg(long, value_name = "ID")]
    instance_id: Option<String>,

    /// Presence TTL in seconds
    #[arg(long, default_value_t = 3600, value_name = "SECS")]
    presence_ttl_secs: u64,

    /// Server heartbeat interval in milliseconds
    #[arg(long, default_value_t = 300_000, value_name = "MS")]
    heartbeat_ms: u64,

    /// HMAC secret verifying bearer tokens; omit to reject every
    /// authenticated connect (anonymous connects still pass)
    #[arg(long, value_name = "SECRET")]
    auth_secret: Option<String>,
}

#[tokio::main]
async fn main() -> chat_relay::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let instance_id = resolve_instance_id(cli.instance_id.as_deref());
    let mut config = RelayConfig::new(instance_id.as_str());
    config.presence_ttl = Duration::from_secs(cli.presence_ttl_secs);
    config.heartbeat = Duration::from_millis(cli.heartbeat_ms);

    let identity: Arc<dyn IdentityResolver> = match cli.auth_secret {
        Some(secret) => Arc::new(HmacIdentity::new(secret)),
        None => {
            info!("[relay] no auth secret configured, bearer tokens will be rejected");
            Arc::new(StaticIdentity::new())
        }
    };

    // Out-of-scope collaborators run on their in-memory stand-ins.
    let directory = Arc::new(MemoryDirectory::new());
    let messages = Arc::new(MemoryMessageStore::new());

    let (store, broker): (Arc<dyn SharedStore>, Arc<dyn InboxTransport>) = match cli.redis_url {
        Some(url) => {
            info!("[relay] using redis at {url}");
            let store = RedisStore::connect(&url).await?;
            (Arc::new(store), Arc::new(RedisBroker::new(url)))
        }
        None => {
            info!("[relay] no redis url, running single-instance on in-memory state");
            (Arc::new(MemoryStore::new()), Arc::new(MemoryBroker::new()))
        }
    };

    let node = RelayNode::new(
        config,
        store,
        identity,
        directory.clone(),
        directory,
        messages,
        broker,
    );
    let addr = node.start(&cli.bind).await?;
    info!("[relay] instance {instance_id} serving on {addr}");

    tokio::signal::ctrl_c().await?;
    info!("[relay] shutting down");
    node.shutdown();
    Ok(())
}
