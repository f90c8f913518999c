use anyhow::{anyhow, Context, Result};
use api_token::{
    auth::{SessionValue, TokenStore},
    cli::{Cli, Commands},
    config::{AppConfig, DEFAULT_CONFIG_TOML},
    http::{HttpServer, HttpServerState},
    infra::{metrics, MemoryBackend, RedisBackend, SessionBackend},
    logging,
};
use std::fs;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    // 解析命令行参数
    let cli = Cli::parse();

    // 不需要存储后端的子命令
    match &cli.command {
        Some(Commands::GenerateConfig { path }) => return generate_config(path),
        Some(Commands::ValidateConfig { path }) => return validate_config(path),
        Some(Commands::ShowConfig) => return show_config(&cli),
        _ => {}
    }

    // 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    let config = AppConfig::load(&cli).context("加载配置失败")?;

    let _log_guard = logging::init_logging(
        &config.logging.level,
        config.logging.format.as_deref(),
        config.logging.file.as_deref(),
        cli.quiet,
    )?;

    let store = match build_store(&cli, &config).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("❌ 存储初始化失败: {:#}", e);
            tracing::error!("💡 请检查 Redis 连接配置，或使用 --memory 以内存模式运行");
            process::exit(1);
        }
    };

    let command = cli.command.clone().unwrap_or(Commands::Serve {
        host: None,
        port: None,
        enable_metrics: false,
    });

    match command {
        Commands::Serve {
            host,
            port,
            enable_metrics,
        } => serve(&config, store, host, port, enable_metrics).await,
        Commands::Issue {
            uid,
            client_id,
            session,
            reuse,
        } => {
            let value = SessionValue::new(uid, client_id).with_session(session);
            let token = if reuse {
                store.create_or_reuse(&value).await?
            } else {
                store.create(&value).await?
            };
            println!("{}", token);
            Ok(())
        }
        Commands::Resume { token } => {
            match store.resume(&token).await? {
                Some(value) => {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                    if let Some(ttl) = store.remaining_ttl(&token).await? {
                        println!("⏳ 剩余有效期: {}s", ttl.as_secs());
                    }
                }
                None => println!("❌ token 不存在或已过期"),
            }
            Ok(())
        }
        Commands::List { uid } => {
            let devices = store.find_devices(&uid).await?;
            println!("📱 用户 {} 共 {} 个在线设备", uid, devices.len());
            for (client_id, token) in devices {
                println!("  - {}\t{}", client_id, token);
            }
            Ok(())
        }
        Commands::Logout { token } => {
            if store.delete(&token).await? {
                println!("✅ 已退出登录");
            } else {
                println!("ℹ️ token 不存在或已过期");
            }
            Ok(())
        }
        Commands::Revoke { uid, client_id } => {
            if store.delete_client_for_user(&uid, &client_id).await? {
                println!("✅ 已踢下线: uid={}, client_id={}", uid, client_id);
            } else {
                println!("ℹ️ 设备不存在: uid={}, client_id={}", uid, client_id);
            }
            Ok(())
        }
        Commands::RevokeAll { uid } => {
            let count = store.delete_all_for_user(&uid).await?;
            println!("✅ 已撤销用户 {} 的 {} 个设备 token", uid, count);
            Ok(())
        }
        Commands::GenerateConfig { .. } | Commands::ValidateConfig { .. } | Commands::ShowConfig => {
            Ok(())
        }
    }
}

/// 根据命令行选择存储后端并创建 TokenStore
async fn build_store(cli: &Cli, config: &AppConfig) -> Result<TokenStore> {
    let backend: Arc<dyn SessionBackend> = if cli.use_memory_backend() {
        tracing::warn!("⚠️ 使用内存存储：数据不持久化，仅用于开发调试");
        Arc::new(MemoryBackend::new())
    } else {
        Arc::new(
            RedisBackend::new(&config.redis)
                .await
                .with_context(|| format!("连接 Redis 失败: {}", config.redis.url))?,
        )
    };
    Ok(TokenStore::new(backend, &config.token)?)
}

async fn serve(
    config: &AppConfig,
    store: TokenStore,
    host: Option<String>,
    port: Option<u16>,
    enable_metrics: bool,
) -> Result<()> {
    if enable_metrics {
        metrics::init().map_err(|e| anyhow!("初始化监控指标失败: {}", e))?;
        tracing::info!("📈 Prometheus 监控指标已启用: GET /metrics");
    }

    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);

    // 显示配置信息
    tracing::info!("📊 Token Configuration:");
    tracing::info!("  - Max TTL: {} days", config.token.max_ttl_days);
    tracing::info!(
        "  - Devices: min={}, max={}",
        config.token.min_devices,
        config.token.max_devices
    );
    tracing::info!("  - Admin API: {}", config.server.admin_key.is_some());

    let state = HttpServerState::new(store, config.server.admin_key.clone());
    let server = HttpServer::new(state, host, port);

    if let Err(e) = server.start().await {
        tracing::error!("❌ HTTP 服务运行失败: {}", e);
        process::exit(1);
    }
    Ok(())
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    fs::write(path, DEFAULT_CONFIG_TOML).with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = AppConfig::from_toml_file(path)
        .with_context(|| format!("配置文件验证失败: {}", path))?;
    config
        .validate()
        .with_context(|| format!("配置文件验证失败: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - Max TTL: {} days", config.token.max_ttl_days);
    println!(
        "  - Devices: min={}, max={}",
        config.token.min_devices, config.token.max_devices
    );
    println!("  - Redis: {}", config.redis.url);
    println!("  - HTTP: {}:{}", config.server.host, config.server.port);

    Ok(())
}

/// 显示最终配置（合并后的配置）
fn show_config(cli: &Cli) -> Result<()> {
    // 初始化基本日志（用于显示配置）
    let _guard = logging::init_logging("info", None, None, cli.quiet)?;

    let mut config = AppConfig::load(cli).context("加载配置失败")?;
    if config.server.admin_key.is_some() {
        config.server.admin_key = Some("******".to_string());
    }

    println!("📊 最终配置（合并后的配置）:");
    println!("{}", serde_json::to_string_pretty(&config)?);

    Ok(())
}
