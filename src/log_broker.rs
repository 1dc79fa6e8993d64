//! 日志缓冲模块
//!
//! 线程安全、有容量上限的日志缓冲区，带订阅通知。
//! 请求处理器与生命周期管理器共享同一个实例（进程内唯一，显式注入）。

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use chrono::{DateTime, Local};
use serde::Serialize;

/// 默认日志容量
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单条日志，创建后不可变
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, level: LogLevel) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] {}",
            self.timestamp.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// 订阅 ID，用于取消订阅
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&LogEntry) + Send + Sync + 'static>;
type Subscribers = Arc<Mutex<Vec<(SubscriptionId, Callback)>>>;

/// 日志缓冲区
///
/// - 追加与读取在同一把锁内互斥，超出容量时在追加的锁内淘汰最旧条目
/// - 订阅回调在释放锁之后，由独立的分发线程依次调用
/// - 待分发队列与缓冲区同容量；订阅者处理不过来时丢弃新的通知（缓冲区本身不受影响）
pub struct LogBroker {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    subscribers: Subscribers,
    next_id: AtomicU64,
    dispatch_tx: Option<mpsc::SyncSender<LogEntry>>,
    dropped_notifications: AtomicU64,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl LogBroker {
    /// 创建默认容量的日志缓冲区
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// 创建指定容量的日志缓冲区（容量至少为 1）
    pub fn with_capacity(capacity: usize) -> Self {
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::sync_channel::<LogEntry>(capacity.max(1));

        let dispatch_subscribers = subscribers.clone();
        let spawned = thread::Builder::new()
            .name("log-dispatch".to_string())
            .spawn(move || {
                for entry in rx {
                    notify_all(&dispatch_subscribers, &entry);
                }
            });

        // 线程创建失败时退化为在追加线程上同步通知
        let (dispatch_tx, dispatcher) = match spawned {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                tracing::warn!("failed to spawn log dispatcher: {}", e);
                (None, None)
            }
        };

        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            subscribers,
            next_id: AtomicU64::new(1),
            dispatch_tx,
            dropped_notifications: AtomicU64::new(0),
            dispatcher,
        }
    }

    /// 容量上限
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 因订阅者处理过慢而未送达的通知数
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications.load(Ordering::Relaxed)
    }

    /// 追加一条日志
    pub fn append(&self, message: impl Into<String>, level: LogLevel) {
        let entry = LogEntry::new(message, level);

        {
            let mut entries = self.lock_entries();
            entries.push_back(entry.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }

        match level {
            LogLevel::Info => tracing::info!("{}", entry.message),
            LogLevel::Warning => tracing::warn!("{}", entry.message),
            LogLevel::Error => tracing::error!("{}", entry.message),
        }

        match &self.dispatch_tx {
            Some(tx) => {
                if let Err(mpsc::TrySendError::Full(_)) = tx.try_send(entry) {
                    let dropped = self.dropped_notifications.fetch_add(1, Ordering::Relaxed);
                    if dropped == 0 {
                        tracing::warn!("log subscribers are falling behind, dropping notifications");
                    }
                }
            }
            None => notify_all(&self.subscribers, &entry),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(message, LogLevel::Info);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.append(message, LogLevel::Warning);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(message, LogLevel::Error);
    }

    /// 注册订阅回调
    ///
    /// 回调运行在分发线程上，调用时日志列表可能已经变化。
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).push((id, Arc::new(callback)));
        id
    }

    /// 取消订阅，返回是否找到该订阅
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// 所有日志拼接为文本（按到达顺序，换行分隔）
    pub fn snapshot(&self) -> String {
        self.lock_entries()
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 当前日志条目的副本
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock_entries().iter().cloned().collect()
    }

    /// 按关键字过滤（不区分大小写，匹配整行渲染结果）
    pub fn filter(&self, term: &str) -> Vec<LogEntry> {
        let needle = term.to_lowercase();
        self.lock_entries()
            .iter()
            .filter(|e| e.to_string().to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// 清空所有日志
    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    /// 导出日志到文件
    pub fn export(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut content = self.snapshot();
        content.push('\n');
        fs::write(path, content)
    }

    fn lock_entries(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        lock(&self.entries)
    }
}

impl Default for LogBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LogBroker {
    fn drop(&mut self) {
        // 关闭通道后分发线程会处理完剩余条目再退出
        self.dispatch_tx.take();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn notify_all(subscribers: &Subscribers, entry: &LogEntry) {
    let callbacks: Vec<Callback> = lock(subscribers)
        .iter()
        .map(|(_, cb)| cb.clone())
        .collect();

    for callback in callbacks {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(entry))).is_err() {
            tracing::error!("log subscriber panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_snapshot() {
        let broker = LogBroker::new();
        broker.info("Server started on port 8000");
        broker.error("Download error: boom");

        let snapshot = broker.snapshot();
        let lines: Vec<&str> = snapshot.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] Server started on port 8000"));
        assert!(lines[1].ends_with("[ERROR] Download error: boom"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn test_capacity_evicts_oldest_first() {
        let broker = LogBroker::with_capacity(3);
        for i in 0..5 {
            broker.info(format!("msg {}", i));
        }

        let messages: Vec<String> = broker.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["msg 2", "msg 3", "msg 4"]);
        assert_eq!(broker.len(), 3);
    }

    #[test]
    fn test_default_capacity() {
        let broker = LogBroker::new();
        assert_eq!(broker.capacity(), DEFAULT_LOG_CAPACITY);
        for i in 0..(DEFAULT_LOG_CAPACITY + 10) {
            broker.info(format!("line {}", i));
        }
        assert_eq!(broker.len(), DEFAULT_LOG_CAPACITY);
        assert_eq!(broker.entries()[0].message, "line 10");
    }

    #[test]
    fn test_clear() {
        let broker = LogBroker::new();
        broker.warning("something");
        assert!(!broker.is_empty());
        broker.clear();
        assert!(broker.is_empty());
        assert_eq!(broker.snapshot(), "");
    }

    #[test]
    fn test_subscriber_receives_entries_in_order() {
        let broker = LogBroker::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        broker.subscribe(move |entry| {
            let _ = tx.lock().unwrap().send(entry.message.clone());
        });

        broker.info("first");
        broker.warning("second");

        let timeout = Duration::from_secs(2);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "first");
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "second");
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let broker = LogBroker::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let id = broker.subscribe(move |entry| {
            let _ = tx.lock().unwrap().send(entry.message.clone());
        });

        assert!(broker.unsubscribe(id));
        assert!(!broker.unsubscribe(id));

        broker.info("ignored");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_panicking_subscriber_does_not_block_others() {
        let broker = LogBroker::new();
        broker.subscribe(|_| panic!("bad subscriber"));

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        broker.subscribe(move |entry| {
            let _ = tx.lock().unwrap().send(entry.level);
        });

        broker.error("boom");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            LogLevel::Error
        );
        assert_eq!(broker.len(), 1);
    }

    #[test]
    fn test_slow_subscriber_does_not_queue_unbounded() {
        let broker = LogBroker::with_capacity(4);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let delivered = Arc::new(AtomicU64::new(0));

        let counter = delivered.clone();
        broker.subscribe(move |_| {
            let _ = lock(&gate_rx).recv_timeout(Duration::from_secs(5));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // 订阅者被阻塞期间追加远超容量的条目，追加本身不阻塞
        for i in 0..50 {
            broker.info(format!("line {}", i));
        }
        assert_eq!(broker.len(), 4);
        assert!(broker.dropped_notifications() > 0);

        for _ in 0..50 {
            let _ = gate_tx.send(());
        }
        drop(broker);

        // 最多一条正在处理，加上队列中的条目
        let delivered = delivered.load(Ordering::SeqCst);
        assert!(delivered >= 1);
        assert!(delivered <= 5, "delivered {}", delivered);
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let broker = LogBroker::new();
        broker.info("File downloaded: Report.PDF");
        broker.info("Folder downloaded as zip: photos");
        broker.error("Upload rejected");

        let hits = broker.filter("report.pdf");
        assert_eq!(hits.len(), 1);
        assert_eq!(broker.filter("DOWNLOADED").len(), 2);
        assert_eq!(broker.filter("error").len(), 1);
        assert!(broker.filter("nothing-matches").is_empty());
    }

    #[test]
    fn test_export_writes_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("export.txt");

        let broker = LogBroker::new();
        broker.info("exported line");
        broker.export(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[INFO] exported line"));
    }

    #[test]
    fn test_concurrent_appends_respect_capacity() {
        let broker = Arc::new(LogBroker::with_capacity(50));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let broker = broker.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        broker.info(format!("thread {} line {}", t, i));
                        assert!(broker.len() <= 50);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(broker.len(), 50);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..64, appends in 0usize..200) {
            let broker = LogBroker::with_capacity(capacity);
            for i in 0..appends {
                broker.info(format!("{}", i));
                prop_assert!(broker.len() <= capacity);
            }

            let expected_first = appends.saturating_sub(capacity);
            let entries = broker.entries();
            prop_assert_eq!(entries.len(), appends.min(capacity));
            if let Some(first) = entries.first() {
                prop_assert_eq!(first.message.clone(), expected_first.to_string());
            }
        }
    }
}
