use serde::{Deserialize, Serialize};

use crate::domain::{JobStatus, LogLevel};

/// One log line produced by the crawler backend.
///
/// `timestamp` is a preformatted wall-clock string (`HH:MM:SS`); the
/// backend owns formatting so backlog and streamed entries render alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: JobStatus,
}

/// Inbound frame on the live event feed: `{"type": "log"|"status", "data": {...}}`.
///
/// Frames with an unrecognized `type`, or a `data` payload that does not
/// decode, fail deserialization as a whole and are dropped by the stream
/// client without affecting the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamFrame {
    Log(LogEntry),
    Status(StatusPayload),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<LogEntry>,
}

/// Crawl configuration submitted with a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub platform: String,
    pub login_type: String,
    pub crawler_type: String,
    pub keywords: String,
    pub specified_ids: String,
    pub creator_ids: String,
    pub start_page: u32,
    pub enable_comments: bool,
    pub enable_sub_comments: bool,
    pub save_option: String,
    pub cookies: String,
    pub headless: bool,
    pub min_time: String,
    pub ip_location: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            platform: String::new(),
            login_type: "qrcode".to_string(),
            crawler_type: "search".to_string(),
            keywords: String::new(),
            specified_ids: String::new(),
            creator_ids: String::new(),
            start_page: 1,
            enable_comments: false,
            enable_sub_comments: false,
            save_option: "json".to_string(),
            cookies: String::new(),
            headless: true,
            min_time: String::new(),
            ip_location: String::new(),
        }
    }
}
