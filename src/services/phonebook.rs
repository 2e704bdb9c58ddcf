//! Phonebook directory ingestor
//!
//! Fetches the mesh phonebook CSV from an ordered list of HTTP sources,
//! detects change with a cheap content fingerprint, repopulates the
//! directory-known user entries, and publishes the IP-phone XML
//! directory atomically. The reconciler is woken through a shared
//! notify handle after every publication.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::config::{PhonebookConfig, PhonebookSource};
use crate::core::state::SharedState;
use crate::services::health::Heartbeat;
use crate::utils::{read_if_present, sleep_or_shutdown, write_atomic};
use crate::{Error, Result};

/// One usable phonebook row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRow {
    pub display_name: String,
    pub telephone: String,
    /// Leading `*` on a name marks the entry inactive; the marker is
    /// preserved into the XML for the reconciler to interpret.
    pub inactive: bool,
}

/// Additive-rotating 32-bit content fingerprint, hex-encoded. Only used
/// to decide whether a fetched body differs from the previous one.
pub fn fingerprint(body: &[u8]) -> String {
    let mut sum: u32 = 0;
    for &byte in body {
        sum = (sum.rotate_left(5) ^ byte as u32).wrapping_add(byte as u32);
    }
    hex::encode(sum.to_be_bytes())
}

/// Parse the phonebook CSV: `FirstName,LastName,Callsign,Location,Telephone`.
/// Rows without a numeric telephone are dropped.
pub fn parse_csv(body: &str) -> Vec<DirectoryRow> {
    let mut rows = Vec::new();
    for line in body.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 5 {
            continue;
        }
        let telephone = fields[4];
        if telephone.is_empty() || !telephone.bytes().all(|b| b.is_ascii_digit()) {
            debug!("Skipping phonebook row without telephone: {:?}", line);
            continue;
        }

        let mut inactive = false;
        let mut strip = |name: &str| -> String {
            match name.strip_prefix('*') {
                Some(rest) => {
                    inactive = true;
                    rest.trim().to_string()
                }
                None => name.to_string(),
            }
        };
        let first = strip(fields[0]);
        let last = strip(fields[1]);
        let callsign = strip(fields[2]);

        let display_name = format!("{} {} ({})", first, last, callsign)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        rows.push(DirectoryRow {
            display_name,
            telephone: telephone.to_string(),
            inactive,
        });
    }
    rows
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render the IP-phone directory artifact. Deterministic: same rows in,
/// same bytes out.
pub fn render_xml(rows: &[DirectoryRow]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<IPPhoneDirectory>\n");
    for row in rows {
        let marker = if row.inactive { "*" } else { "" };
        out.push_str("<DirectoryEntry>\n");
        out.push_str(&format!(
            "<Name>{}{}</Name>\n",
            marker,
            xml_escape(&row.display_name)
        ));
        out.push_str(&format!(
            "<Telephone>{}</Telephone>\n",
            xml_escape(&row.telephone)
        ));
        out.push_str("</DirectoryEntry>\n");
    }
    out.push_str("</IPPhoneDirectory>\n");
    out
}

pub struct PhonebookIngestor {
    config: PhonebookConfig,
    state: Arc<SharedState>,
    signal: Arc<Notify>,
    heartbeat: Heartbeat,
    client: reqwest::Client,
}

impl PhonebookIngestor {
    pub fn new(
        config: PhonebookConfig,
        state: Arc<SharedState>,
        signal: Arc<Notify>,
        heartbeat: Heartbeat,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            config,
            state,
            signal,
            heartbeat,
            client,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Phonebook ingestor started ({} sources, every {}s)",
            self.config.sources.len(),
            self.config.interval_seconds
        );
        loop {
            self.heartbeat.beat();
            match self.ingest_once().await {
                Ok(true) => info!("Phonebook updated and published"),
                Ok(false) => debug!("Phonebook unchanged"),
                Err(e) => warn!("Phonebook ingestion failed: {}", e),
            }
            if sleep_or_shutdown(
                Duration::from_secs(self.config.interval_seconds),
                &mut shutdown,
            )
            .await
            {
                info!("Phonebook ingestor shutting down");
                return;
            }
        }
    }

    /// One ingestion pass. Returns `true` when a new artifact was
    /// published.
    pub async fn ingest_once(&self) -> Result<bool> {
        let body = self.fetch_first_source().await?;
        self.process_body(&body).await
    }

    /// First source returning a non-empty body wins. The user-table lock
    /// is never held across this I/O.
    async fn fetch_first_source(&self) -> Result<Vec<u8>> {
        if self.config.sources.is_empty() {
            return Err(Error::phonebook("no phonebook sources configured"));
        }
        for source in &self.config.sources {
            match self.fetch_source(source).await {
                Ok(body) if !body.is_empty() => return Ok(body),
                Ok(_) => {
                    warn!("Phonebook source {} returned an empty body", source.url());
                }
                Err(e) => {
                    warn!("Phonebook source {} failed: {}", source.url(), e);
                }
            }
        }
        Err(Error::phonebook("all phonebook sources failed"))
    }

    async fn fetch_source(&self, source: &PhonebookSource) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(source.url())
            .header(reqwest::header::CONNECTION, "close")
            .send()
            .await
            .map_err(|e| Error::http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::http(format!("status {}", response.status())));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::http(e.to_string()))?;
        Ok(body.to_vec())
    }

    /// Fingerprint, parse, repopulate, publish, signal.
    pub async fn process_body(&self, body: &[u8]) -> Result<bool> {
        let new_fingerprint = fingerprint(body);
        let stored = read_if_present(&self.config.fingerprint_path)?
            .map(|s| s.trim().to_string());
        if stored.as_deref() == Some(new_fingerprint.as_str())
            && !self.state.users.is_empty().await
        {
            return Ok(false);
        }

        let text = String::from_utf8_lossy(body);
        let rows = parse_csv(&text);
        if rows.is_empty() {
            return Err(Error::phonebook("phonebook body parsed to zero rows"));
        }

        let mut seen: HashSet<String> = HashSet::new();
        for row in &rows {
            if !seen.insert(row.telephone.clone()) {
                continue;
            }
            if let Err(e) = self
                .state
                .users
                .upsert_directory(&row.telephone, &row.display_name, !row.inactive)
                .await
            {
                warn!("Directory import of {} failed: {}", row.telephone, e);
            }
        }

        let xml = render_xml(&rows);
        write_atomic(&self.config.xml_path, xml.as_bytes())?;
        write_atomic(&self.config.fingerprint_path, new_fingerprint.as_bytes())?;
        self.signal.notify_one();
        info!("Published {} directory entries", rows.len());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    const CSV: &str = "\
Alice,Example,KD7ABC,Hilltop,1234
Bob,Other,N0CALL,Valley,5678
*Carol,Quiet,W1XYZ,Ridge,9012
No,Phone,XX1XX,Nowhere,
Header,Row,CALL,Place,phone
";

    #[test]
    fn test_fingerprint_stable_and_sensitive() {
        let a = fingerprint(b"hello phonebook");
        assert_eq!(a, fingerprint(b"hello phonebook"));
        assert_ne!(a, fingerprint(b"hello phonebooK"));
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_parse_csv() {
        let rows = parse_csv(CSV);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].display_name, "Alice Example (KD7ABC)");
        assert_eq!(rows[0].telephone, "1234");
        assert!(!rows[0].inactive);
        // Leading `*` marks inactive and is stripped from the name.
        assert_eq!(rows[2].display_name, "Carol Quiet (W1XYZ)");
        assert!(rows[2].inactive);
    }

    #[test]
    fn test_render_xml_escapes_and_preserves_marker() {
        let rows = vec![
            DirectoryRow {
                display_name: "A & B <quoted> (C)".to_string(),
                telephone: "42".to_string(),
                inactive: false,
            },
            DirectoryRow {
                display_name: "Carol Quiet (W1XYZ)".to_string(),
                telephone: "9012".to_string(),
                inactive: true,
            },
        ];
        let xml = render_xml(&rows);
        assert!(xml.contains("<Name>A &amp; B &lt;quoted&gt; (C)</Name>"));
        assert!(xml.contains("<Name>*Carol Quiet (W1XYZ)</Name>"));
        assert!(xml.contains("<Telephone>42</Telephone>"));
        // Deterministic output.
        assert_eq!(xml, render_xml(&rows));
    }

    fn ingestor_fixture(dir: &std::path::Path) -> (PhonebookIngestor, Arc<SharedState>) {
        let config = AgentConfig::default_config();
        let state = SharedState::new(&config);
        let mut pb_config = config.phonebook.clone();
        pb_config.xml_path = dir.join("phonebook.xml");
        pb_config.fingerprint_path = dir.join("phonebook.fingerprint");
        let ingestor = PhonebookIngestor::new(
            pb_config,
            Arc::clone(&state),
            Arc::new(Notify::new()),
            Heartbeat::new("phonebook"),
        );
        (ingestor, state)
    }

    #[tokio::test]
    async fn test_process_body_publishes_and_populates() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, state) = ingestor_fixture(dir.path());

        let published = ingestor.process_body(CSV.as_bytes()).await.unwrap();
        assert!(published);

        let alice = state.users.get("1234").await.unwrap();
        assert!(alice.known_from_directory);
        assert_eq!(alice.display_name, "Alice Example (KD7ABC)");
        assert!(alice.active);
        let carol = state.users.get("9012").await.unwrap();
        assert!(!carol.active);

        let xml = std::fs::read_to_string(dir.path().join("phonebook.xml")).unwrap();
        assert!(xml.contains("<Telephone>5678</Telephone>"));
        let fp = std::fs::read_to_string(dir.path().join("phonebook.fingerprint")).unwrap();
        assert_eq!(fp, fingerprint(CSV.as_bytes()));
    }

    #[tokio::test]
    async fn test_identical_body_skips_republication() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, _state) = ingestor_fixture(dir.path());

        assert!(ingestor.process_body(CSV.as_bytes()).await.unwrap());
        let xml_path = dir.path().join("phonebook.xml");
        let first_mtime = std::fs::metadata(&xml_path).unwrap().modified().unwrap();

        // Same content again: fingerprint matches, nothing is rewritten.
        assert!(!ingestor.process_body(CSV.as_bytes()).await.unwrap());
        let second_mtime = std::fs::metadata(&xml_path).unwrap().modified().unwrap();
        assert_eq!(first_mtime, second_mtime);

        // Changed content publishes again.
        let changed = CSV.replace("Alice", "Alicia");
        assert!(ingestor.process_body(changed.as_bytes()).await.unwrap());
    }

    #[tokio::test]
    async fn test_matching_fingerprint_with_empty_table_republishes() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, _state) = ingestor_fixture(dir.path());

        // A stale fingerprint from a previous process run must not stop
        // an empty user table from being repopulated.
        std::fs::write(
            &ingestor.config.fingerprint_path,
            fingerprint(CSV.as_bytes()),
        )
        .unwrap();
        assert!(ingestor.process_body(CSV.as_bytes()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unparseable_body_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, _state) = ingestor_fixture(dir.path());
        let result = ingestor.process_body(b"not,a,phonebook").await;
        assert!(result.is_err());
        assert!(!dir.path().join("phonebook.xml").exists());
    }

    #[tokio::test]
    async fn test_invalid_utf8_sanitised() {
        let dir = tempfile::tempdir().unwrap();
        let (ingestor, state) = ingestor_fixture(dir.path());
        let mut body = b"Al".to_vec();
        body.push(0xFF);
        body.extend_from_slice(b"ce,Example,KD7ABC,Hilltop,1234\n");
        assert!(ingestor.process_body(&body).await.unwrap());
        let alice = state.users.get("1234").await.unwrap();
        assert!(alice.display_name.contains('\u{FFFD}'));
    }
}
