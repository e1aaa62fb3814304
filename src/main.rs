use anyhow::{Context, Result};
use checkin::{init_logging, Application};
use checkin_config::{AppConfig, LogLevel, OutputFormat};
use clap::{Arg, ArgMatches, Command};
use tracing::{error, info};

fn cli() -> Command {
    Command::new("checkin")
        .version("1.0.0")
        .about("群组签到任务系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时按默认位置查找")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(Command::new("migrate").about("创建或升级数据库表结构"))
        .subcommand(Command::new("health").about("检查数据库和缓存连通性"))
}

/// 命令行参数覆盖配置文件中的日志设置
fn apply_overrides(config: &mut AppConfig, matches: &ArgMatches) -> Result<()> {
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level
            .parse::<LogLevel>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format
            .parse::<OutputFormat>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config_path = matches.get_one::<String>("config").map(String::as_str);

    let mut config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;
    apply_overrides(&mut config, &matches)?;

    init_logging(config.observability.log_level, config.observability.log_format)?;

    match matches.subcommand() {
        Some(("migrate", _)) => {
            // build 内部会执行迁移
            let app = Application::build(&config).await?;
            info!("数据库迁移完成: {}", config.database.url);
            app.shutdown().await;
        }
        Some(("health", _)) => {
            let app = Application::build(&config).await?;
            let report = app.health_check().await;
            app.shutdown().await;
            if report.is_healthy() {
                info!(database = report.database, cache = ?report.cache, "健康检查通过");
            } else {
                error!(database = report.database, cache = ?report.cache, "健康检查失败");
                return Err(anyhow::anyhow!("健康检查失败"));
            }
        }
        _ => return Err(anyhow::anyhow!("未知子命令")),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_log_settings() {
        let matches = cli()
            .try_get_matches_from(["checkin", "--log-level", "debug", "health", "--log-format", "pretty"])
            .unwrap();
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &matches).unwrap();
        assert_eq!(config.observability.log_level, LogLevel::Debug);
        assert_eq!(config.observability.log_format, OutputFormat::Pretty);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(cli().try_get_matches_from(["checkin"]).is_err());
        assert!(cli().try_get_matches_from(["checkin", "serve"]).is_err());
    }
}
