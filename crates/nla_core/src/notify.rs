//! Interfaces to the external collaborators: user notification mail and the
//! archive search index.
//!
//! Both transports live outside this system. The traits here define what the
//! control plane needs; the shipped implementations log the notification and
//! POST index batches to a configured endpoint.

use log::{error, info};
use serde::Serialize;

use crate::model::TapeRequest;

/// Sends request lifecycle notifications to users.
pub trait Notifier {
    /// Deliver one message. Implementations must not fail the calling task.
    fn send(&self, to: &str, subject: &str, body: &str);

    /// "Request started" notification, sent once per request.
    fn request_started(&self, request: &TapeRequest, files: &[String]) {
        let Some(to) = request.notify_first.as_deref().filter(|s| !s.is_empty()) else {
            return;
        };
        let subject = format!("[NLA] - Tape request {} has started", request.id);
        self.send(to, &subject, &file_listing_body(files));
    }

    /// "Request finished" notification.
    fn request_finished(&self, request: &TapeRequest, files: &[String]) {
        let Some(to) = request.notify_last.as_deref().filter(|s| !s.is_empty()) else {
            return;
        };
        let subject = format!("[NLA] - Tape request {} has finished", request.id);
        self.send(to, &subject, &file_listing_body(files));
    }
}

fn file_listing_body(files: &[String]) -> String {
    let mut body = String::from("Request contains files: ");
    for file in files {
        body.push('\n');
        body.push_str(file);
    }
    body
}

/// Notifier that records the mail in the task log; delivery is handled by
/// the operators' mail relay watching that log in deployments without SMTP.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, to: &str, subject: &str, body: &str) {
        info!("notify {to}: {subject}\n{body}");
    }
}

/// Pushes file location changes to the external search index.
pub trait IndexUpdater {
    /// Record the paths as on disk (restored) or back on tape.
    ///
    /// Failures are logged by the implementation and never propagated; the
    /// index converges on the next reconciliation pass.
    fn set_locations(&self, paths: &[String], on_disk: bool);
}

/// No configured index endpoint: updates are dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopIndexUpdater;

impl IndexUpdater for NoopIndexUpdater {
    fn set_locations(&self, _paths: &[String], _on_disk: bool) {}
}

#[derive(Serialize)]
struct LocationUpdate<'a> {
    paths: &'a [String],
    location: &'static str,
}

/// POSTs location batches to the index endpoint.
#[derive(Debug)]
pub struct HttpIndexUpdater {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpIndexUpdater {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl IndexUpdater for HttpIndexUpdater {
    fn set_locations(&self, paths: &[String], on_disk: bool) {
        if paths.is_empty() {
            return;
        }
        let update = LocationUpdate {
            paths,
            location: if on_disk { "on_disk" } else { "on_tape" },
        };
        match self.client.post(&self.url).json(&update).send() {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                error!(
                    "failed updating search index for {} file(s): status {}",
                    paths.len(),
                    response.status()
                );
            }
            Err(err) => {
                error!("failed updating search index for {} file(s): {err}", paths.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn send(&self, to: &str, subject: &str, _body: &str) {
            self.sent.lock().unwrap().push((to.to_string(), subject.to_string()));
        }
    }

    fn request(notify_first: Option<&str>, notify_last: Option<&str>) -> TapeRequest {
        TapeRequest {
            id: 7,
            label: None,
            quota_id: 1,
            retention: chrono::Utc::now(),
            request_date: chrono::Utc::now(),
            active: true,
            request_files: vec![],
            request_patterns: None,
            notify_first: notify_first.map(str::to_string),
            notify_last: notify_last.map(str::to_string),
            storaged_start: None,
            storaged_end: None,
            first_on_disk: None,
            last_on_disk: None,
        }
    }

    #[test]
    fn notifications_go_to_the_configured_addresses() {
        let notifier = RecordingNotifier::default();
        let req = request(Some("fred@example.ac.uk"), Some("ops@example.ac.uk"));
        notifier.request_started(&req, &["/badc/a/x.dat".into()]);
        notifier.request_finished(&req, &["/badc/a/x.dat".into()]);
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![
                (
                    "fred@example.ac.uk".to_string(),
                    "[NLA] - Tape request 7 has started".to_string()
                ),
                (
                    "ops@example.ac.uk".to_string(),
                    "[NLA] - Tape request 7 has finished".to_string()
                ),
            ]
        );
    }

    #[test]
    fn missing_addresses_suppress_notifications() {
        let notifier = RecordingNotifier::default();
        let req = request(None, Some(""));
        notifier.request_started(&req, &[]);
        notifier.request_finished(&req, &[]);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }
}
