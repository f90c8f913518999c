use clap::{Parser, Subcommand};

// 确保 Parser trait 被使用
impl Cli {
    /// 解析命令行参数
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// api-token - 基于 Redis 的 API token 签发与设备管理
#[derive(Parser, Debug)]
#[command(name = "api-token")]
#[command(version)]
#[command(about = "签发、恢复、撤销 API token，并限制每个用户的设备数", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(long, value_name = "FILE", help = "指定配置文件路径")]
    pub config_file: Option<String>,

    /// Redis 连接 URL
    #[arg(long, value_name = "URL", help = "Redis 连接字符串")]
    pub redis_url: Option<String>,

    /// 使用进程内存储代替 Redis（数据不持久化，仅用于开发调试）
    #[arg(long, help = "使用内存存储代替 Redis")]
    pub memory: bool,

    /// 日志级别
    #[arg(
        long,
        value_name = "LEVEL",
        help = "日志级别: trace, debug, info, warn, error"
    )]
    pub log_level: Option<String>,

    /// 日志格式
    #[arg(long, value_name = "FORMAT", help = "日志格式: pretty, json, compact")]
    pub log_format: Option<String>,

    /// 日志文件路径
    #[arg(long, value_name = "PATH", help = "日志输出文件路径")]
    pub log_file: Option<String>,

    /// 详细输出（可重复使用：-v, -vv, -vvv）
    #[arg(short, action = clap::ArgAction::Count, help = "详细输出级别")]
    pub verbose: u8,

    /// 静默模式
    #[arg(long, short = 'q', help = "静默模式（不输出日志）")]
    pub quiet: bool,

    /// 开发模式（等同于 --memory --log-level debug --log-format pretty）
    #[arg(long, help = "启用开发模式")]
    pub dev: bool,

    /// 子命令（缺省为 serve）
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// 启动 HTTP 服务
    Serve {
        /// 监听地址
        #[arg(long, value_name = "ADDRESS")]
        host: Option<String>,
        /// 监听端口
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
        /// 启用 Prometheus 监控指标（GET /metrics）
        #[arg(long)]
        enable_metrics: bool,
    },
    /// 为用户设备签发 token
    Issue {
        uid: String,
        client_id: String,
        /// 自定义会话数据
        #[arg(long, default_value = "")]
        session: String,
        /// 该设备已有有效 token 时沿用（默认签发新 token 顶掉旧会话）
        #[arg(long)]
        reuse: bool,
    },
    /// 查看 token 对应的 Session 记录
    Resume { token: String },
    /// 列出用户所有在线设备
    List { uid: String },
    /// 删除 token（退出登录）
    Logout { token: String },
    /// 踢下线用户的单个设备
    Revoke { uid: String, client_id: String },
    /// 退出用户所有设备
    RevokeAll { uid: String },
    /// 生成默认配置文件
    GenerateConfig {
        /// 输出文件路径
        #[arg(value_name = "PATH", default_value = "config.toml")]
        path: String,
    },
    /// 验证配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(value_name = "PATH", default_value = "config.toml")]
        path: String,
    },
    /// 显示最终配置（合并后的配置）
    ShowConfig,
}

impl Cli {
    /// 获取日志级别（考虑 verbose 和 quiet）
    pub fn get_log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }

        if self.dev {
            return Some("debug".to_string());
        }

        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }

        // 根据 verbose 级别设置
        match self.verbose {
            0 => None, // 使用默认或配置文件
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// 获取日志格式
    pub fn get_log_format(&self) -> Option<String> {
        if self.dev {
            return Some("pretty".to_string());
        }
        self.log_format.clone()
    }

    /// 是否使用内存存储
    pub fn use_memory_backend(&self) -> bool {
        self.memory || self.dev
    }
}
