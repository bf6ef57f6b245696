use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use mirror_proxy::{spawn_proxy, ProxyConfig, RetryPolicy, RewritePolicy};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mirror-proxy", about = "Rewriting forwarding proxy")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "MIRROR_PROXY_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Which references the rewrite pass routes back through the proxy.
    #[arg(long, env = "MIRROR_PROXY_POLICY", value_enum, default_value = "proxy-all")]
    policy: PolicyArg,

    /// Ceiling on fetched body size in bytes.
    #[arg(long, env = "MIRROR_PROXY_MAX_BODY_BYTES", default_value_t = 16 * 1024 * 1024)]
    max_body_bytes: usize,

    /// Upstream fetch attempts before giving up (including the first).
    #[arg(long, env = "MIRROR_PROXY_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    /// Proxy every resolvable reference, cross-origin included.
    ProxyAll,
    /// Proxy only references sharing the target's origin.
    SameOrigin,
}

impl From<PolicyArg> for RewritePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::ProxyAll => RewritePolicy::ProxyAll,
            PolicyArg::SameOrigin => RewritePolicy::SameOriginOnly,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ProxyConfig {
        bind_addr: cli.bind,
        policy: cli.policy.into(),
        max_body_bytes: cli.max_body_bytes,
        retry: RetryPolicy {
            max_attempts: cli.max_attempts,
            ..RetryPolicy::default()
        },
    };

    let handle = spawn_proxy(config).await?;
    info!(addr = %handle.addr, "mirror-proxy listening");

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}
