use crate::config::SmtpConfig;
use crate::error::{AlertError, ConfigError};
use crate::events::{ServerId, ThresholdKey};
use crate::monitoring::PipelineStats;
use crate::BoxFuture;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const MAX_SUBJECT_LENGTH: usize = 256;
const MAX_BODY_LENGTH: usize = 4096;
const MAX_EXCERPT_LENGTH: usize = 512;

pub const BLOCKING_ERROR_SUBJECT: &str = "Blocking error detected";
pub const THRESHOLD_SUBJECT: &str = "Error threshold reached";

/// Outbound channel for alert mails
pub trait Mailer: Send + Sync {
    fn send<'a>(
        &'a self,
        recipient: &'a str,
        subject: &'a str,
        body: &'a str,
    ) -> BoxFuture<'a, Result<(), AlertError>>;

    fn name(&self) -> &str;
}

/// SMTP mailer built on lettre's tokio transport
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_config(smtp: &SmtpConfig) -> Result<Self, ConfigError> {
        let mut builder = if smtp.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host).map_err(|e| {
                ConfigError::ValidationError(format!("Invalid SMTP host {}: {}", smtp.host, e))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
        };

        builder = builder
            .port(smtp.port)
            .timeout(Some(Duration::from_secs(smtp.timeout_seconds)));

        if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let from: Mailbox = smtp.from.parse().map_err(|e| {
            ConfigError::ValidationError(format!("Invalid sender address {}: {}", smtp.from, e))
        })?;

        info!("SMTP mailer configured for {}:{}", smtp.host, smtp.port);
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

impl Mailer for SmtpMailer {
    fn send<'a>(
        &'a self,
        recipient: &'a str,
        subject: &'a str,
        body: &'a str,
    ) -> BoxFuture<'a, Result<(), AlertError>> {
        Box::pin(async move {
            let to: Mailbox = recipient
                .parse()
                .map_err(|_| AlertError::InvalidAddress(recipient.to_string()))?;

            let message = Message::builder()
                .from(self.from.clone())
                .to(to)
                .subject(subject)
                .header(ContentType::TEXT_PLAIN)
                .body(body.to_string())
                .map_err(|e| AlertError::NotificationFailed(format!("Invalid message: {}", e)))?;

            self.transport
                .send(message)
                .await
                .map_err(|e| AlertError::NotificationFailed(format!("SMTP error: {}", e)))?;
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

/// A mail handed to [`LogMailer`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Mails kept by a [`LogMailer`] by default
pub const LOG_MAILER_HISTORY: usize = 100;

/// Mailer that only logs and remembers the last mails it would have sent
///
/// Used when no SMTP relay is configured.
#[derive(Debug)]
pub struct LogMailer {
    sent: Mutex<VecDeque<SentMail>>,
    history: usize,
}

impl Default for LogMailer {
    fn default() -> Self {
        Self::with_history(LOG_MAILER_HISTORY)
    }
}

impl LogMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `history` mails, dropping the oldest first
    pub fn with_history(history: usize) -> Self {
        Self {
            sent: Mutex::new(VecDeque::new()),
            history,
        }
    }

    /// Remembered mails, oldest first
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Mailer for LogMailer {
    fn send<'a>(
        &'a self,
        recipient: &'a str,
        subject: &'a str,
        body: &'a str,
    ) -> BoxFuture<'a, Result<(), AlertError>> {
        Box::pin(async move {
            info!(
                "MAIL (not sent) - To: {}, Subject: {}, Body: {}",
                recipient, subject, body
            );
            if self.history == 0 {
                return Ok(());
            }
            let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
            while sent.len() >= self.history {
                sent.pop_front();
            }
            sent.push_back(SentMail {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Formats alert mails and delivers them through a [`Mailer`]
pub struct AlertDispatcher {
    mailer: Arc<dyn Mailer>,
    timeout: Duration,
    stats: Arc<PipelineStats>,
}

impl AlertDispatcher {
    pub fn new(mailer: Arc<dyn Mailer>, stats: Arc<PipelineStats>) -> Self {
        Self {
            mailer,
            timeout: Duration::from_secs(30),
            stats,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a blocking-error alert for a line that matched `keyword`
    pub async fn blocking_error(
        &self,
        server_id: ServerId,
        recipient: &str,
        keyword: &str,
        line: &str,
    ) -> Result<(), AlertError> {
        let body = Self::blocking_error_body(server_id, keyword, line);
        self.dispatch(recipient, BLOCKING_ERROR_SUBJECT, &body).await
    }

    /// Send an error-threshold alert for one bucket
    pub async fn threshold_reached(
        &self,
        key: &ThresholdKey,
        count: usize,
        threshold: u32,
        recipient: &str,
    ) -> Result<(), AlertError> {
        let body = Self::threshold_body(key, count, threshold);
        self.dispatch(recipient, THRESHOLD_SUBJECT, &body).await
    }

    /// Deliver a mail, bounded by the dispatcher timeout
    pub async fn dispatch(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), AlertError> {
        let subject = Self::truncate_text(subject, MAX_SUBJECT_LENGTH);
        let body = Self::truncate_text(body, MAX_BODY_LENGTH);

        debug!("Sending '{}' to {} via {}", subject, recipient, self.mailer.name());
        let result = tokio::time::timeout(self.timeout, self.mailer.send(recipient, &subject, &body))
            .await
            .map_err(|_| AlertError::Timeout)
            .and_then(|sent| sent);

        match &result {
            Ok(()) => {
                self.stats.record_alert_sent();
                info!("Alert '{}' sent to {}", subject, recipient);
            }
            Err(e) => warn!("Alert '{}' to {} failed: {}", subject, recipient, e),
        }
        result
    }

    fn blocking_error_body(server_id: ServerId, keyword: &str, line: &str) -> String {
        format!(
            "A blocking error was detected in server log and it might lead to server stopping.\n\n\
             Server: {}\nKeyword: {}\nLine: {}",
            server_id,
            keyword,
            Self::truncate_text(line.trim(), MAX_EXCERPT_LENGTH)
        )
    }

    fn threshold_body(key: &ThresholdKey, count: usize, threshold: u32) -> String {
        format!(
            "Error threshold reached for server {} for error type : {}\n\n\
             {} errors in the monitoring window (threshold {}).",
            key.server_id,
            key.problem_label(),
            count,
            threshold
        )
    }

    /// Truncate text to a maximum byte length, ending with "..." when cut
    fn truncate_text(text: &str, max_length: usize) -> String {
        if text.len() <= max_length {
            return text.to_string();
        }

        let mut truncate_at = max_length.saturating_sub(3);
        while truncate_at > 0 && !text.is_char_boundary(truncate_at) {
            truncate_at -= 1;
        }
        format!("{}...", &text[..truncate_at])
    }
}
