//! HTTP Server 实现
//!
//! 使用 axum 创建文件共享 Server，支持启动、停止和状态查询。
//! 生命周期：Stopped → Starting → Running → Stopping → Stopped（绑定失败时 Starting → Stopped）。

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use uuid::Uuid;

use super::config::ShareConfig;
use super::handlers;
use super::network;
use super::paths::PathResolver;
use super::state::{ServerStats, ShareState, SharedState};
use crate::error::ShareError;
use crate::log_broker::LogBroker;

const SERVER_NAME: &str = concat!("dirshare/", env!("CARGO_PKG_VERSION"));

/// 写权限检查文件前缀
const WRITE_CHECK_PREFIX: &str = ".dirshare_write_test_";

const LISTEN_BACKLOG: u32 = 1024;

/// Server 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Server 控制句柄
///
/// 用于控制后台服务任务的生命周期
pub struct ServerHandle {
    /// 关闭信号发送器
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// 后台服务任务
    task: Option<JoinHandle<()>>,
    /// 实际绑定的端口
    port: u16,
}

impl ServerHandle {
    /// 获取当前端口
    pub fn port(&self) -> u16 {
        self.port
    }

    /// 发送关闭信号并在限定时间内等待服务任务结束
    ///
    /// # Returns
    /// 进行中的请求是否在限定时间内全部完成
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        let Some(mut task) = self.task.take() else {
            return true;
        };

        match tokio::time::timeout(grace, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                task.abort();
                let _ = task.await;
                false
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// 当前运行的会话
struct ServerSession {
    root: PathBuf,
    started_at: DateTime<Local>,
    stats: Arc<ServerStats>,
    handle: ServerHandle,
}

struct Lifecycle {
    state: ServerState,
    session: Option<ServerSession>,
}

/// Server 状态快照
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// 是否正在运行
    pub running: bool,
    pub state: ServerState,
    /// 共享根目录
    pub directory: Option<PathBuf>,
    /// 当前端口
    pub port: Option<u16>,
    /// 局域网访问地址
    pub url: Option<String>,
    pub requests_served: u64,
    pub bytes_uploaded: u64,
    pub started_at: Option<DateTime<Local>>,
}

/// 生命周期操作结果，供界面层直接展示
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlOutcome {
    pub ok: bool,
    pub message: String,
}

impl From<Result<String, ShareError>> for ControlOutcome {
    fn from(result: Result<String, ShareError>) -> Self {
        match result {
            Ok(message) => Self { ok: true, message },
            Err(e) => Self {
                ok: false,
                message: e.to_string(),
            },
        }
    }
}

/// Server 管理器
///
/// 独占监听 socket 与后台服务任务。`start`/`stop` 通过同一把生命周期锁串行化，
/// 锁只在状态迁移时持有，从不跨越 await。
pub struct ServerManager {
    config: ShareConfig,
    log: Arc<LogBroker>,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

impl ServerManager {
    /// 创建新的 ServerManager
    pub fn new(config: ShareConfig, log: Arc<LogBroker>) -> Self {
        Self {
            config,
            log,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                session: None,
            })),
        }
    }

    /// 使用默认配置创建 ServerManager
    pub fn with_defaults(log: Arc<LogBroker>) -> Self {
        Self::new(ShareConfig::default(), log)
    }

    /// 共享的日志缓冲
    pub fn log(&self) -> &Arc<LogBroker> {
        &self.log
    }

    pub fn config(&self) -> &ShareConfig {
        &self.config
    }

    /// 启动 Server
    ///
    /// # Arguments
    /// * `directory` - 共享根目录
    /// * `port` - 端口号，0 表示由系统分配
    ///
    /// # Errors
    /// 非 Stopped 状态下立即返回 `AlreadyRunning`，不排队也不阻塞。
    pub async fn start(
        &self,
        directory: impl AsRef<Path>,
        port: u16,
    ) -> Result<String, ShareError> {
        {
            let mut lifecycle = self.lock();
            if lifecycle.state != ServerState::Stopped {
                let state = lifecycle.state;
                drop(lifecycle);
                self.log
                    .warning(format!("Start requested while server is {}", state));
                return Err(ShareError::AlreadyRunning);
            }
            lifecycle.state = ServerState::Starting;
        }

        match self.launch(directory.as_ref(), port) {
            Ok(session) => {
                let bound_port = session.handle.port();
                let root = session.root.display().to_string();
                {
                    let mut lifecycle = self.lock();
                    lifecycle.session = Some(session);
                    lifecycle.state = ServerState::Running;
                }
                self.log.info(format!(
                    "Server started on port {} serving {}",
                    bound_port, root
                ));
                Ok(format!("Server started successfully on port {}", bound_port))
            }
            Err(e) => {
                self.lock().state = ServerState::Stopped;
                self.log.error(e.to_string());
                Err(e)
            }
        }
    }

    /// 停止 Server
    ///
    /// 停止接受新连接，进行中的请求最多等待 `shutdown_grace_secs` 秒，
    /// 超时后强制结束服务任务。
    ///
    /// 等待与最终的状态迁移在独立任务中完成，调用方丢弃返回的 future
    /// 不影响 Server 回到 Stopped。
    pub async fn stop(&self) -> Result<String, ShareError> {
        let session = {
            let mut lifecycle = self.lock();
            if lifecycle.state != ServerState::Running {
                let state = lifecycle.state;
                drop(lifecycle);
                self.log
                    .warning(format!("Stop requested while server is {}", state));
                return Err(ShareError::NotRunning);
            }
            lifecycle.state = ServerState::Stopping;
            lifecycle.session.take()
        };

        let Some(session) = session else {
            self.lock().state = ServerState::Stopped;
            return Err(ShareError::NotRunning);
        };

        let port = session.handle.port();
        let grace = self.config.shutdown_grace();
        let log = self.log.clone();
        let lifecycle = self.lifecycle.clone();

        let finish = tokio::spawn(async move {
            let drained = session.handle.shutdown(grace).await;
            if !drained {
                log.warning(format!(
                    "In-flight requests did not finish within {}s, forcing shutdown",
                    grace.as_secs()
                ));
            }
            lock_lifecycle(&lifecycle).state = ServerState::Stopped;
            log.info(format!("Server on port {} stopped", port));
        });

        if let Err(e) = finish.await {
            // 任务异常结束时 session 已被丢弃，关闭信号也已发出
            self.lock().state = ServerState::Stopped;
            return Err(ShareError::server(format!("Shutdown task failed: {}", e)));
        }

        Ok("Server stopped successfully".to_string())
    }

    /// 当前生命周期状态
    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// 获取 Server 状态
    pub fn status(&self) -> ServerStatus {
        let (state, snapshot) = {
            let lifecycle = self.lock();
            let snapshot = lifecycle.session.as_ref().map(|session| {
                (
                    session.root.clone(),
                    session.handle.port(),
                    session.stats.requests_served(),
                    session.stats.bytes_uploaded(),
                    session.started_at,
                )
            });
            (lifecycle.state, snapshot)
        };

        let running = state == ServerState::Running;
        match snapshot {
            Some((root, port, requests, uploaded, started_at)) => ServerStatus {
                running,
                state,
                directory: Some(root),
                port: Some(port),
                url: running.then(|| share_url_for(port)),
                requests_served: requests,
                bytes_uploaded: uploaded,
                started_at: Some(started_at),
            },
            None => ServerStatus {
                running,
                state,
                directory: None,
                port: None,
                url: None,
                requests_served: 0,
                bytes_uploaded: 0,
                started_at: None,
            },
        }
    }

    /// 本机局域网地址
    pub fn local_address() -> String {
        network::local_address()
    }

    /// 运行中时返回 `http://<局域网地址>:<端口>/`
    pub fn share_url(&self) -> Option<String> {
        let port = {
            let lifecycle = self.lock();
            if lifecycle.state != ServerState::Running {
                return None;
            }
            lifecycle.session.as_ref().map(|s| s.handle.port())
        };
        port.map(share_url_for)
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        lock_lifecycle(&self.lifecycle)
    }

    /// 校验目录、绑定端口并在后台启动服务任务
    fn launch(&self, directory: &Path, port: u16) -> Result<ServerSession, ShareError> {
        if !directory.is_dir() {
            return Err(ShareError::InvalidDirectory(
                directory.display().to_string(),
            ));
        }
        check_write_access(directory, &self.log)?;

        let resolver = PathResolver::new(directory)?;
        let root = resolver.root().to_path_buf();

        let listener = bind_listener(SocketAddr::new(self.config.bind_address, port))?;
        let bound_port = listener.local_addr().map(|a| a.port()).unwrap_or(port);

        let stats = Arc::new(ServerStats::new());
        let state: SharedState = Arc::new(ShareState {
            resolver,
            log: self.log.clone(),
            stats: stats.clone(),
        });
        let app = build_router(state, self.config.max_upload_bytes);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let log = self.log.clone();
        let task = tokio::spawn(async move {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

            if let Err(e) = server.await {
                log.error(format!("Server error: {}", e));
            }
        });

        Ok(ServerSession {
            root,
            started_at: Local::now(),
            stats,
            handle: ServerHandle {
                shutdown_tx: Some(shutdown_tx),
                task: Some(task),
                port: bound_port,
            },
        })
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        let mut lifecycle = self.lock();
        // 丢弃句柄即发送关闭信号
        if lifecycle.session.take().is_some() {
            lifecycle.state = ServerState::Stopped;
        }
    }
}

fn lock_lifecycle(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    lifecycle
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn share_url_for(port: u16) -> String {
    format!("http://{}:{}/", network::local_address(), port)
}

/// 在目录中创建并删除一个标记文件，确认可写
fn check_write_access(directory: &Path, log: &LogBroker) -> Result<(), ShareError> {
    let marker = directory.join(format!("{}{}", WRITE_CHECK_PREFIX, Uuid::new_v4().simple()));
    fs::write(&marker, b"")
        .map_err(|e| ShareError::NoWriteAccess(format!("{}: {}", directory.display(), e)))?;
    if let Err(e) = fs::remove_file(&marker) {
        log.warning(format!(
            "Could not remove write check file {}: {}",
            marker.display(),
            e
        ));
    }
    Ok(())
}

/// 绑定监听 socket
///
/// 设置地址复用，保证停止后能立即在同一端口重启。
fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ShareError> {
    let bind_error = |e: io::Error| {
        if e.kind() == io::ErrorKind::AddrInUse {
            ShareError::PortInUse(addr.port())
        } else {
            ShareError::BindError(format!("{}: {}", addr, e))
        }
    };

    let socket = match addr.ip() {
        IpAddr::V4(_) => TcpSocket::new_v4(),
        IpAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(bind_error)?;

    // Windows 上 SO_REUSEADDR 允许重复绑定同一端口
    #[cfg(not(windows))]
    socket.set_reuseaddr(true).map_err(bind_error)?;

    socket.bind(addr).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)
}

/// 构建路由
///
/// 显式路由只接管各自的方法，其余方法回落到 `browse`（GET 浏览、OPTIONS 200、其它 404）。
pub(crate) fn build_router(state: SharedState, max_upload_bytes: Option<u64>) -> Router {
    let upload_limit = match max_upload_bytes {
        Some(limit) => DefaultBodyLimit::max(usize::try_from(limit).unwrap_or(usize::MAX)),
        None => DefaultBodyLimit::disable(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route(
            "/favicon.ico",
            get(handlers::favicon).fallback(handlers::browse),
        )
        .route(
            "/download",
            get(handlers::download).fallback(handlers::browse),
        )
        .route(
            "/download/",
            get(handlers::download).fallback(handlers::browse),
        )
        .route(
            "/download/{*path}",
            get(handlers::download).fallback(handlers::browse),
        )
        .route(
            "/upload",
            post(handlers::upload)
                .fallback(handlers::browse)
                .layer(upload_limit),
        )
        .route(
            "/create_directory",
            post(handlers::create_directory).fallback(handlers::browse),
        )
        .fallback(handlers::browse)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::access_log,
        ))
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("*"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
        .with_state(state)
}
