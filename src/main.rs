//! NTRIP 监测客户端入口

use clap::Parser;
use tracing::info;

/// NTRIP 监测客户端参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, env = "NTRIP_LOG_LEVEL")]
    log_level: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = ntrip_monitor::config::load(&args.config)?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    let _guard = ntrip_monitor::init_logging(&config.log)?;
    info!("NTRIP monitor starting with config: {}", args.config);

    let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(ntrip_monitor::run(config))?;
    Ok(())
}
