use anyhow::{Context, Result};
use tokio::sync::watch;
use tunroute::logger::{init_env_logger, init_logger};
use tunroute::{Config, Daemon, TunDevice};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let config = Config::from_file(&config_path)?;

    match &config.log {
        Some(section) => {
            init_logger(section.to_log_config()?).context("初始化日志系统失败")?;
        }
        None => init_env_logger(),
    }

    log::info!("配置文件: {}", config_path);
    log::info!(
        "上游 DNS: {} 个, 代理: {} 个",
        config.dns.nameserver.len(),
        config.proxy.len()
    );

    let geoip = Daemon::load_geoip(&config)?;
    let device = TunDevice::attach(&config.general.tun_name)
        .with_context(|| format!("无法附着 tun 设备 {}", config.general.tun_name))?;
    let daemon = Daemon::new(config, geoip)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("🛑 收到 Ctrl-C，开始关闭");
            let _ = shutdown_tx.send(true);
        }
    });

    daemon.run_with_shutdown(device, shutdown_rx).await
}
