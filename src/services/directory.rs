//! Directory reconciler
//!
//! Consumes the published phonebook XML and reconciles the live user
//! table against it: every artifact entry exists and is directory-known,
//! a leading `*` on a name means inactive, and users that disappeared
//! from the artifact are deactivated unless a live registration keeps
//! them current. Runs on the ingestor's notify signal or on a wall-clock
//! interval, whichever comes first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::config::PhonebookConfig;
use crate::core::state::SharedState;
use crate::services::health::Heartbeat;
use crate::utils::read_if_present;
use crate::Result;

/// One `(name, telephone)` pair from the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub telephone: String,
}

fn xml_unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Extract `(name, telephone)` pairs from the IP-phone directory XML.
/// The artifact is machine-written, so a forgiving tag scan is enough;
/// entries missing either field are skipped.
pub fn parse_directory_xml(xml: &str) -> Vec<DirectoryEntry> {
    let mut entries = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<DirectoryEntry>") {
        let Some(end) = rest[start..].find("</DirectoryEntry>") else {
            break;
        };
        let block = &rest[start..start + end];
        let name = tag_text(block, "Name");
        let telephone = tag_text(block, "Telephone");
        if let (Some(name), Some(telephone)) = (name, telephone) {
            if !telephone.is_empty() {
                entries.push(DirectoryEntry { name, telephone });
            }
        }
        rest = &rest[start + end + "</DirectoryEntry>".len()..];
    }
    entries
}

fn tag_text(block: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    Some(xml_unescape(block[start..end].trim()))
}

pub struct DirectoryReconciler {
    config: PhonebookConfig,
    state: Arc<SharedState>,
    signal: Arc<Notify>,
    heartbeat: Heartbeat,
}

impl DirectoryReconciler {
    pub fn new(
        config: PhonebookConfig,
        state: Arc<SharedState>,
        signal: Arc<Notify>,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            config,
            state,
            signal,
            heartbeat,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Directory reconciler started (interval {}s)",
            self.config.status_update_interval_seconds
        );
        let interval = Duration::from_secs(self.config.status_update_interval_seconds);
        loop {
            self.heartbeat.beat();
            if let Err(e) = self.reconcile_once().await {
                warn!("Directory reconciliation failed: {}", e);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.signal.notified() => {
                    debug!("Reconciler woken by ingestor signal");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Directory reconciler shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One reconciliation pass over the published artifact. A missing
    /// artifact is not an error; there is simply nothing to do yet.
    pub async fn reconcile_once(&self) -> Result<()> {
        let Some(xml) = read_if_present(&self.config.xml_path)? else {
            debug!(
                "Directory artifact {} absent; skipping",
                self.config.xml_path.display()
            );
            return Ok(());
        };
        let entries = parse_directory_xml(&xml);

        let mut present: HashSet<String> = HashSet::new();
        for entry in &entries {
            let (name, active) = match entry.name.strip_prefix('*') {
                Some(stripped) => (stripped.trim(), false),
                None => (entry.name.as_str(), true),
            };
            present.insert(entry.telephone.clone());
            self.state
                .users
                .upsert_directory(&entry.telephone, name, active)
                .await?;
        }

        let deactivated = self.state.users.deactivate_missing(&present).await;
        if deactivated > 0 {
            info!(
                "Reconciled directory: {} entries, {} users deactivated",
                entries.len(),
                deactivated
            );
        } else {
            debug!("Reconciled directory: {} entries", entries.len());
        }
        Ok(())
    }
}
