use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

use clustered_singleton::demo::{DemoCluster, DemoOptions};
use clustered_singleton::shutdown::{wait_for_shutdown_signal, ShutdownManager};
use clustered_singleton::{init_logging, LogConfig, LogLevel, OutputFormat, SchedulerConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Json,
    Pretty,
    Compact,
}

impl From<LogFormatArg> for OutputFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Json => OutputFormat::Json,
            LogFormatArg::Pretty => OutputFormat::Pretty,
            LogFormatArg::Compact => OutputFormat::Compact,
        }
    }
}

/// 集群单例任务调度演示
#[derive(Debug, Parser)]
#[command(name = "singleton-demo", version, about = "集群单例任务调度演示")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 模拟节点数量
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// 单例任务名称
    #[arg(short, long, default_value = "report")]
    task: String,

    /// 任务周期（毫秒）
    #[arg(long, default_value_t = 500)]
    period_ms: u64,

    /// 演示时长（秒），到一半时杀掉当前持有者
    #[arg(short, long, default_value_t = 10)]
    duration_secs: u64,

    /// 日志级别
    #[arg(short, long, default_value = "info", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: String,

    /// 日志格式
    #[arg(long, value_enum, default_value_t = LogFormatArg::Pretty)]
    log_format: LogFormatArg,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level: LogLevel = cli.log_level.parse()?;
    init_logging(
        &LogConfig::default()
            .with_level(level)
            .with_format(cli.log_format.into()),
    )?;

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("安装Prometheus指标记录器失败")?;

    let config = SchedulerConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认配置>")
        )
    })?;

    info!("启动集群单例调度演示");
    info!("节点数量: {}, 任务: {}", cli.nodes, cli.task);

    let cluster = DemoCluster::start(
        DemoOptions {
            nodes: cli.nodes.max(1),
            task_name: cli.task.clone(),
            period: Duration::from_millis(cli.period_ms.max(1)),
            ..DemoOptions::default()
        },
        config,
    )
    .await?;

    let shutdown_manager = ShutdownManager::new();
    let mut shutdown_rx = shutdown_manager.subscribe().await;
    let signal_manager = shutdown_manager.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_manager.shutdown().await;
    });

    let half = Duration::from_secs(cli.duration_secs) / 2;
    let interrupted = tokio::select! {
        _ = tokio::time::sleep(half) => false,
        _ = shutdown_rx.recv() => true,
    };

    if !interrupted {
        match cluster.kill_owner().await {
            Some(owner) => info!("已杀掉任务持有者 {owner}，等待其他节点接管"),
            None => warn!("当前没有节点持有任务 {}", cli.task),
        }
        tokio::select! {
            _ = tokio::time::sleep(half) => {}
            _ = shutdown_rx.recv() => info!("收到关闭信号，提前结束演示"),
        }
    } else {
        info!("收到关闭信号，提前结束演示");
    }

    if let Some(owner) = cluster.current_owner().await {
        info!("当前任务持有者: {owner}");
    }
    for (node_id, runs) in cluster.runs_per_node() {
        info!(node.id = %node_id, runs, "节点执行次数");
    }

    cluster.shutdown().await;
    shutdown_manager.shutdown().await;

    println!("{}", metrics.render());
    info!("集群单例调度演示已退出");
    Ok(())
}
