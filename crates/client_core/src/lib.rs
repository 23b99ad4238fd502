//! Session controller for the crawler operator console.
//!
//! Bootstraps the in-memory view model from the control plane, bridges
//! the live event feed into it, and falls back to interval polling while
//! the stream is down. The view model has exactly one writer: the stream
//! client only hands events to callbacks registered here.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use reqwest::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use shared::domain::{JobStatus, LogLevel};
use shared::error::{ApiError, ApiRejection};
use shared::protocol::{JobConfig, LogEntry, LogsResponse, StatusResponse};

pub mod stream;

use stream::{StreamClient, StreamError, StreamTransport};

/// The log buffer keeps the most recent entries only; the oldest entry is
/// evicted first once this bound is reached.
pub const MAX_LOG_BUFFER: usize = 500;
pub const BOOTSTRAP_LOG_LIMIT: u32 = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(3000);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Current status plus the bounded log tail, as presented to the UI layer.
#[derive(Debug, Clone)]
pub struct ViewModel {
    pub current_status: JobStatus,
    pub log_buffer: VecDeque<LogEntry>,
}

impl Default for ViewModel {
    fn default() -> Self {
        Self {
            current_status: JobStatus::Idle,
            log_buffer: VecDeque::new(),
        }
    }
}

/// Applied view-model mutation, re-broadcast for rendering.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Log(LogEntry),
    Status(JobStatus),
}

pub struct SessionController {
    http: Client,
    server_url: String,
    stream: Arc<StreamClient>,
    view: Mutex<ViewModel>,
    events: broadcast::Sender<SessionEvent>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(server_url: impl Into<String>) -> Result<Arc<Self>, StreamError> {
        let server_url = server_url.into();
        let stream = StreamClient::new(&server_url)?;
        Ok(Self::with_stream(server_url, stream))
    }

    pub fn with_transport(
        server_url: impl Into<String>,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Arc<Self>, StreamError> {
        let server_url = server_url.into();
        let stream = StreamClient::with_transport(&server_url, transport)?;
        Ok(Self::with_stream(server_url, stream))
    }

    pub fn with_stream(server_url: impl Into<String>, stream: Arc<StreamClient>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            stream,
            view: Mutex::new(ViewModel::default()),
            events,
            poll_task: Mutex::new(None),
        })
    }

    pub fn stream(&self) -> &Arc<StreamClient> {
        &self.stream
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn current_status(&self) -> JobStatus {
        lock(&self.view).current_status
    }

    pub fn log_buffer(&self) -> Vec<LogEntry> {
        lock(&self.view).log_buffer.iter().cloned().collect()
    }

    pub fn clear_logs(&self) {
        lock(&self.view).log_buffer.clear();
    }

    /// Fetch current status and the recent log backlog before the stream
    /// is live. The two calls fail independently: either failure is
    /// reported to the log sink and the other result is still applied.
    pub async fn bootstrap(&self) {
        match self.fetch_status().await {
            Ok(status) => self.apply_status_event(status),
            Err(err) => warn!("bootstrap status fetch failed: {err:#}"),
        }

        match self.fetch_recent_logs(BOOTSTRAP_LOG_LIMIT).await {
            Ok(logs) => {
                for entry in logs {
                    self.apply_log_event(entry);
                }
            }
            Err(err) => warn!("bootstrap log fetch failed: {err:#}"),
        }
    }

    /// Register view-model observers on the stream client and open the
    /// connection. Streamed events flow through the same apply operations
    /// as bootstrap and polling.
    pub fn connect_stream(self: &Arc<Self>) {
        let controller = Arc::downgrade(self);
        self.stream.on_log(move |entry| {
            if let Some(controller) = Weak::upgrade(&controller) {
                controller.apply_log_event(entry);
            }
        });

        let controller = Arc::downgrade(self);
        self.stream.on_status(move |payload| {
            if let Some(controller) = Weak::upgrade(&controller) {
                controller.apply_status_event(payload.status);
            }
        });

        self.stream.connect();
    }

    /// Append one log entry, evicting the oldest past the buffer bound.
    pub fn apply_log_event(&self, entry: LogEntry) {
        {
            let mut view = lock(&self.view);
            view.log_buffer.push_back(entry.clone());
            while view.log_buffer.len() > MAX_LOG_BUFFER {
                view.log_buffer.pop_front();
            }
        }
        let _ = self.events.send(SessionEvent::Log(entry));
    }

    /// Overwrite the current status. Statuses are idempotent snapshots;
    /// streamed, polled, and bootstrap values all land here and the last
    /// write wins.
    pub fn apply_status_event(&self, status: JobStatus) {
        {
            let mut view = lock(&self.view);
            view.current_status = status;
        }
        let _ = self.events.send(SessionEvent::Status(status));
    }

    /// Fallback while the stream is down: every `interval`, if the stream
    /// client reports not connected, fetch status and apply it as if it
    /// had been streamed. Restarting replaces the previous polling task.
    pub fn start_polling(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(controller) = Weak::upgrade(&weak) else {
                    return;
                };
                if controller.stream.is_connected() {
                    continue;
                }
                match controller.fetch_status().await {
                    Ok(status) => controller.apply_status_event(status),
                    Err(err) => warn!("status poll failed: {err:#}"),
                }
            }
        });

        if let Some(previous) = lock(&self.poll_task).replace(task) {
            previous.abort();
        }
    }

    pub fn stop_polling(&self) {
        if let Some(task) = lock(&self.poll_task).take() {
            task.abort();
        }
    }

    /// Ask the backend to start a crawl. On acceptance the status flips to
    /// running immediately; the streamed status will confirm or correct
    /// it. Rejections surface as an error-level entry in the log buffer.
    pub async fn start_job(&self, config: &JobConfig) -> Result<()> {
        if let Err(err) = self.post_start(config).await {
            self.apply_log_event(feedback_entry(LogLevel::Error, format!("{err:#}")));
            return Err(err);
        }

        self.apply_status_event(JobStatus::Running);
        self.apply_log_event(feedback_entry(LogLevel::Success, "crawler started"));
        info!("crawler start accepted");
        Ok(())
    }

    /// Ask the backend to stop the running crawl.
    pub async fn stop_job(&self) -> Result<()> {
        if let Err(err) = self.post_stop().await {
            self.apply_log_event(feedback_entry(LogLevel::Error, format!("{err:#}")));
            return Err(err);
        }

        self.apply_status_event(JobStatus::Stopping);
        self.apply_log_event(feedback_entry(LogLevel::Warning, "stopping crawler..."));
        info!("crawler stop accepted");
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        match self
            .http
            .get(format!("{}/api/health", self.server_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn fetch_status(&self) -> Result<JobStatus> {
        let response: StatusResponse = self
            .http
            .get(format!("{}/api/crawler/status", self.server_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.status)
    }

    async fn fetch_recent_logs(&self, limit: u32) -> Result<Vec<LogEntry>> {
        let response: LogsResponse = self
            .http
            .get(format!("{}/api/crawler/logs", self.server_url))
            .query(&[("limit", limit)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.logs)
    }

    async fn post_start(&self, config: &JobConfig) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/api/crawler/start", self.server_url))
            .json(config)
            .send()
            .await?;
        reject_on_error(response, "failed to start crawler").await
    }

    async fn post_stop(&self) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/api/crawler/stop", self.server_url))
            .send()
            .await?;
        reject_on_error(response, "failed to stop crawler").await
    }
}

async fn reject_on_error(response: reqwest::Response, fallback: &str) -> Result<()> {
    if response.status().is_success() {
        return Ok(());
    }
    let detail = response
        .json::<ApiError>()
        .await
        .map(|err| err.detail)
        .unwrap_or_else(|_| fallback.to_string());
    Err(ApiRejection::new(detail).into())
}

fn feedback_entry(level: LogLevel, message: impl Into<String>) -> LogEntry {
    LogEntry {
        timestamp: Local::now().format("%H:%M:%S").to_string(),
        level,
        message: message.into(),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
