//! 文件共享服务配置模块
//!
//! 管理端口、监听地址等配置，支持从配置文件读取和保存。

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::log_broker::DEFAULT_LOG_CAPACITY;

/// 默认端口号
pub const DEFAULT_PORT: u16 = 8000;

/// 默认停止等待时间（秒）
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 3;

/// 配置文件名
const CONFIG_FILENAME: &str = "settings.yaml";

/// 文件共享服务配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareConfig {
    /// 监听端口，0 表示由系统分配
    #[serde(default = "default_port")]
    pub port: u16,
    /// 监听地址，默认所有网卡（局域网可访问）
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// 停止时等待进行中请求完成的最长时间
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// 日志缓冲容量
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// 单次上传大小上限（字节），None 表示不限制
    #[serde(default)]
    pub max_upload_bytes: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: default_bind_address(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            log_capacity: DEFAULT_LOG_CAPACITY,
            max_upload_bytes: None,
        }
    }
}

impl ShareConfig {
    /// 从配置目录加载配置
    ///
    /// # Arguments
    /// * `config_dir` - 配置目录路径
    ///
    /// # Returns
    /// 配置对象，如果文件不存在或无法解析则返回默认配置
    pub fn load(config_dir: &Path) -> Self {
        let config_path = config_dir.join(CONFIG_FILENAME);

        if !config_path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&config_path) {
            Ok(content) => serde_yaml::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// 保存配置到配置目录
    pub fn save(&self, config_dir: &Path) -> Result<(), String> {
        let config_path = config_dir.join(CONFIG_FILENAME);

        if !config_dir.exists() {
            fs::create_dir_all(config_dir)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let content = serde_yaml::to_string(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        fs::write(&config_path, content)
            .map_err(|e| format!("Failed to write config file: {}", e))
    }

    /// 验证端口是否有效
    ///
    /// 0 表示系统分配；否则必须 >= 1024（移动端无法绑定特权端口）
    pub fn validate_port(port: u16) -> Result<(), String> {
        if port != 0 && port < 1024 {
            return Err("Port must be 0 or >= 1024 (non-privileged ports)".to_string());
        }
        Ok(())
    }

    /// 停止等待时间
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// 获取配置文件的完整路径
    pub fn get_config_path(config_dir: &Path) -> PathBuf {
        config_dir.join(CONFIG_FILENAME)
    }
}
