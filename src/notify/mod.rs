//! Outbound alert delivery.
//!
//! `AlertMessage` composes the subject and body an observer receives; a
//! `Notifier` delivers it. Delivery is best effort: callers log failures and
//! never retry.

mod mqtt;
mod smtp;

use anyhow::Result;

use crate::catalog::StreamInfo;

pub use mqtt::{MqttConfig, MqttNotifier};
pub use smtp::{SmtpConfig, SmtpNotifier};

pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

/// Subject and body of one alert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
}

impl AlertMessage {
    pub fn compose(class_name: &str, count: usize, stream: &StreamInfo) -> Self {
        let subject = format!("Detected object in: {}", stream.name);
        let body = format!(
            "{} {}'s detected at the stream of {}\n\n\
             Check stream at: {}\n\n\
             ***You are receiving this automatic notification because you have subscribed \
             to the observer list of said stream***\n\n\
             Br,\nDetection agent",
            count_word(count),
            class_name,
            stream.name,
            stream.link
        );
        Self { subject, body }
    }
}

fn count_word(count: usize) -> String {
    match count {
        1 => "One".to_string(),
        2 => "Two".to_string(),
        3 => "Three".to_string(),
        4 => "Four".to_string(),
        5 => "Five".to_string(),
        n => n.to_string(),
    }
}

/// Logs alerts instead of delivering them.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        log::info!("alert for {}: {}\n{}", recipient, subject, body);
        Ok(())
    }
}
