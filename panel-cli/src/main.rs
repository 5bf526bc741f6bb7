//! NodePanel CLI - 节点会话命令行入口

use agent_client::{
    HttpCredentialBroker, PanelConfig, SocketTransportFactory, TlsConfig, TransportConfig,
};
use anyhow::Result;
use clap::Parser;
use panel_logic::{attach_default_projectors, NotificationLevel, SessionController, ServerState};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// NodePanel session CLI
#[derive(Parser, Debug)]
#[command(name = "nodepanel")]
#[command(version, about = "Live session watcher for a NodePanel-managed server")]
struct Args {
    /// Server identifier to attach to
    server_id: String,

    /// Panel API base URL (falls back to PANEL_API_URL)
    #[arg(short, long)]
    panel_url: Option<String>,

    /// Panel API key (falls back to PANEL_API_KEY)
    #[arg(short = 'k', long)]
    api_key: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// CA certificate path for TLS
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Client certificate path for mTLS
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Client key path for mTLS (not needed for P12)
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// P12 password (for PKCS#12 format client cert)
    #[arg(long)]
    p12_password: Option<String>,

    /// Skip TLS certificate verification (DEVELOPMENT ONLY)
    #[arg(long, default_value = "false")]
    insecure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting NodePanel session watcher...");
    info!("Server: {}", args.server_id);

    // 凭证来源：命令行 > 环境变量
    let mut panel_config = PanelConfig::default();
    if let Some(panel_url) = args.panel_url {
        panel_config.base_url = panel_url;
    }
    if args.api_key.is_some() {
        panel_config.api_key = args.api_key;
    }
    let broker = Arc::new(HttpCredentialBroker::new(panel_config));

    // 构建 TLS 配置
    let tls_config = TlsConfig {
        ca_cert_path: args.ca_cert,
        client_cert_path: args.client_cert,
        client_key_path: args.client_key,
        client_p12_password: args.p12_password,
        danger_accept_invalid_certs: args.insecure,
    };

    let dispatcher = Arc::new(agent_client::EventDispatcher::new());
    let factory = Arc::new(SocketTransportFactory::new(
        TransportConfig { tls: tls_config },
        dispatcher.clone(),
    ));

    let state = Arc::new(ServerState::new());
    let controller = Arc::new(SessionController::new(
        &args.server_id,
        broker,
        factory,
        dispatcher.clone(),
        state.clone(),
    ));

    // 投影器把事件流折叠成状态，通知打到日志上
    let _projector_handles = attach_default_projectors(
        state,
        Arc::new(|notification| match notification.level {
            NotificationLevel::Success | NotificationLevel::Info => {
                info!("{}", notification.message)
            }
            NotificationLevel::Error => error!("{}", notification.message),
        }),
        &dispatcher,
    );

    // 创建 shutdown 信号
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 致命错误（凭证被拒、连接丢失）直接触发退出
    {
        let shutdown_tx = shutdown_tx.clone();
        controller.set_fatal_callback(Arc::new(move |e| {
            error!("Session failed: {}", e);
            let _ = shutdown_tx.send(true);
        }));
    }

    // 建立会话
    controller.start().await?;

    // 在后台运行控制循环
    let controller_clone = controller.clone();
    let mut shutdown_rx_clone = shutdown_rx.clone();
    let control_loop = tokio::spawn(async move {
        loop {
            tokio::select! {
                // 优先检查 shutdown 信号
                _ = shutdown_rx_clone.changed() => {
                    if *shutdown_rx_clone.borrow() {
                        info!("Control loop received shutdown signal");
                        break;
                    }
                }
                // 处理控制信号（续期 / 迁移 / 关闭）
                result = controller_clone.run_once() => {
                    if let Err(e) = result {
                        warn!("Control signal error: {:?}", e);
                    }
                }
            }
        }
    });

    // 等待 Ctrl+C 或致命错误
    info!("Session running. Press Ctrl+C to stop.");
    let mut fatal_rx = shutdown_rx.clone();
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = fatal_rx.changed() => {}
    }

    // 发送 shutdown 信号
    let _ = shutdown_tx.send(true);

    // 等待控制循环结束
    let _ = tokio::time::timeout(
        tokio::time::Duration::from_secs(5),
        control_loop,
    ).await;

    // 卸载会话
    controller.shutdown().await;

    info!("Session stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panel_url_flag_only_overrides_when_given() {
        // 未给 --panel-url 时不覆盖，环境变量配置得以生效
        let args = Args::try_parse_from(["nodepanel", "srv-1"]).unwrap();
        assert!(args.panel_url.is_none());

        let args =
            Args::try_parse_from(["nodepanel", "srv-1", "--panel-url", "http://panel:9000"])
                .unwrap();
        assert_eq!(args.panel_url.as_deref(), Some("http://panel:9000"));
    }
}
