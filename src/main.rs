use anyhow::Result;
use rpc_tap::{JsonLinesSink, Proxy, ProxyContext, resolve_config, shutdown_notice};
use std::{path::PathBuf, sync::Arc};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Event records own stdout; diagnostics go to stderr.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = resolve_config(config_path.as_deref())?;
    info!(
        websocket = config.websocket.enabled,
        ipc = config.ipc.enabled,
        runtime_dir = %config.ipc.runtime_dir().display(),
        binary_encoding = config.events.binary_encoding.as_str(),
        "Configuration loaded"
    );

    let ctx = ProxyContext::new(&config, Arc::new(JsonLinesSink::stdout()));
    let mut proxy = Proxy::start(&config, ctx).await?;

    tokio::signal::ctrl_c().await?;
    for transport in proxy.close_listeners().await {
        println!("{}", shutdown_notice(transport));
    }

    let open = proxy.open_sessions();
    if open > 0 {
        info!(open, "Waiting for open sessions, interrupt again to exit now");
        tokio::select! {
            () = proxy.drain_sessions() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    Ok(())
}
