use anyhow::{anyhow, Context, Result};
use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

const DEFAULT_LOG_FILE: &str = "logs/tunroute.log";

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub show_timestamp: bool,
    pub show_module: bool,
    /// 仅对终端输出生效
    pub use_color: bool,
    pub output: LogOutput,
}

/// 日志输出目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File(PathBuf),
    /// 同时输出到标准输出和文件
    Both(PathBuf),
    /// 按大小轮转的文件输出
    RotatingFile {
        path: PathBuf,
        /// 单个文件最大大小（字节）
        max_size: u64,
        /// 保留的备份数量
        max_backups: usize,
    },
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(anyhow!("未知的日志级别: {}", s)),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        })
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_timestamp: true,
            show_module: true,
            use_color: true,
            output: LogOutput::Stdout,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, show: bool) -> Self {
        self.show_timestamp = show;
        self
    }

    pub fn with_module(mut self, show: bool) -> Self {
        self.show_module = show;
        self
    }

    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }
}

/// 配置文件中的 `log` 段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    /// off, error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
    /// stdout, file, both
    #[serde(default = "default_log_output")]
    pub output: String,
    /// output 为 file 或 both 时使用
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub enable_rotation: bool,
    /// 单个日志文件最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default = "default_true")]
    pub show_timestamp: bool,
    #[serde(default = "default_true")]
    pub show_module: bool,
    #[serde(default = "default_true")]
    pub use_color: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_max_backups() -> usize {
    5
}

fn default_true() -> bool {
    true
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            output: default_log_output(),
            file_path: None,
            enable_rotation: false,
            max_size_mb: default_max_size_mb(),
            max_backups: default_max_backups(),
            show_timestamp: true,
            show_module: true,
            use_color: true,
        }
    }
}

impl LogSection {
    pub fn to_log_config(&self) -> Result<LogConfig> {
        let level: LogLevel = self.level.parse()?;
        let path = PathBuf::from(self.file_path.as_deref().unwrap_or(DEFAULT_LOG_FILE));

        let output = match self.output.to_lowercase().as_str() {
            "stdout" => LogOutput::Stdout,
            "file" | "both" if self.enable_rotation => LogOutput::RotatingFile {
                path,
                max_size: self.max_size_mb * 1024 * 1024,
                max_backups: self.max_backups,
            },
            "file" => LogOutput::File(path),
            "both" => LogOutput::Both(path),
            other => return Err(anyhow!("未知的日志输出目标: {}", other)),
        };

        Ok(LogConfig::new(level)
            .with_timestamp(self.show_timestamp)
            .with_module(self.show_module)
            .with_color(self.use_color)
            .with_output(output))
    }
}

struct FileWriter {
    file: File,
    current_size: u64,
    path: PathBuf,
    max_size: Option<u64>,
    max_backups: usize,
}

/// `tunroute.log` 的第 n 个备份为 `tunroute.log.n`
fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

impl FileWriter {
    fn open(path: PathBuf, max_size: Option<u64>, max_backups: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            file,
            current_size,
            path,
            max_size,
            max_backups,
        })
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if let Some(max_size) = self.max_size {
            if self.current_size > 0 && self.current_size + len > max_size {
                self.rotate()?;
            }
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.current_size += len;
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.max_backups == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.current_size = 0;
            return Ok(());
        }

        let _ = std::fs::remove_file(backup_path(&self.path, self.max_backups));
        for i in (1..self.max_backups).rev() {
            let old = backup_path(&self.path, i);
            if old.exists() {
                let _ = std::fs::rename(&old, backup_path(&self.path, i + 1));
            }
        }
        std::fs::rename(&self.path, backup_path(&self.path, 1))?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

struct CustomLogger {
    config: LogConfig,
    file_writer: Option<Mutex<FileWriter>>,
}

impl CustomLogger {
    fn format_log(&self, record: &Record, use_color: bool) -> String {
        let timestamp = if self.config.show_timestamp {
            format!("[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        let level = if use_color {
            match record.level() {
                log::Level::Error => "\x1b[31mERROR\x1b[0m",
                log::Level::Warn => "\x1b[33mWARN \x1b[0m",
                log::Level::Info => "\x1b[32mINFO \x1b[0m",
                log::Level::Debug => "\x1b[36mDEBUG\x1b[0m",
                log::Level::Trace => "\x1b[35mTRACE\x1b[0m",
            }
        } else {
            match record.level() {
                log::Level::Error => "ERROR",
                log::Level::Warn => "WARN ",
                log::Level::Info => "INFO ",
                log::Level::Debug => "DEBUG",
                log::Level::Trace => "TRACE",
            }
        };

        let module = match record.module_path() {
            Some(path) if self.config.show_module => format!("[{}] ", path),
            _ => String::new(),
        };

        format!("{}{} {}{}", timestamp, level, module, record.args())
    }

    fn writes_stdout(&self) -> bool {
        matches!(self.config.output, LogOutput::Stdout | LogOutput::Both(_))
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level.to_level_filter()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if self.writes_stdout() {
            let line = self.format_log(record, self.config.use_color);
            let _ = writeln!(io::stdout().lock(), "{}", line);
        }

        // 文件中不使用颜色
        if let Some(writer) = &self.file_writer {
            let line = self.format_log(record, false);
            let mut w = writer.lock().unwrap_or_else(|e| e.into_inner());
            let _ = w.write_line(&line);
        }
    }

    fn flush(&self) {
        let _ = io::stdout().flush();
        if let Some(writer) = &self.file_writer {
            let mut w = writer.lock().unwrap_or_else(|e| e.into_inner());
            let _ = w.file.flush();
        }
    }
}

/// 安装进程日志器，只能调用一次
///
/// ```no_run
/// use tunroute::logger::{init_logger, LogConfig, LogLevel, LogOutput};
///
/// let config = LogConfig::new(LogLevel::Debug).with_output(LogOutput::RotatingFile {
///     path: "logs/tunroute.log".into(),
///     max_size: 10 * 1024 * 1024,
///     max_backups: 5,
/// });
/// init_logger(config).unwrap();
/// ```
pub fn init_logger(config: LogConfig) -> Result<()> {
    let file_writer = match &config.output {
        LogOutput::Stdout => None,
        LogOutput::File(path) | LogOutput::Both(path) => {
            Some(FileWriter::open(path.clone(), None, 0))
        }
        LogOutput::RotatingFile {
            path,
            max_size,
            max_backups,
        } => Some(FileWriter::open(path.clone(), Some(*max_size), *max_backups)),
    }
    .transpose()
    .context("无法创建日志文件")?
    .map(Mutex::new);

    let level = config.level.to_level_filter();
    log::set_boxed_logger(Box::new(CustomLogger {
        config,
        file_writer,
    }))
    .map_err(|e| anyhow!("设置日志器失败: {}", e))?;
    log::set_max_level(level);
    Ok(())
}

/// 没有 `log` 配置段时使用 env_logger，读取 RUST_LOG，默认 info
pub fn init_env_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
