//! Utility helpers shared across the agent

pub mod logger;
pub mod resolver;
pub mod scanner;

pub use logger::setup_logging;
pub use resolver::{discover_source_ip, DnsResolver, MeshResolver, StaticResolver};
pub use scanner::scan_string_fields;

use std::path::Path;
use std::time::Duration;

use tokio::sync::watch;

use crate::Result;

/// Publish a file atomically: write the full content to `<path>.tmp`,
/// then rename over the destination. Readers never observe a partial
/// document.
pub fn write_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a published file, treating absence as `None`.
pub fn read_if_present<P: AsRef<Path>>(path: P) -> Result<Option<String>> {
    match std::fs::read_to_string(path.as_ref()) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Sleep for `duration` in chunks of at most one second, returning early
/// (with `true`) as soon as shutdown is signalled. Every long-running
/// component sleeps through this so shutdown latency stays bounded.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let mut remaining = duration;
    while remaining > Duration::ZERO {
        let chunk = remaining.min(Duration::from_secs(1));
        tokio::select! {
            _ = tokio::time::sleep(chunk) => {}
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
        remaining = remaining.saturating_sub(chunk);
    }
    *shutdown.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        write_atomic(&path, b"{\"a\":2}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        // No temp file left behind.
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_read_if_present_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.txt");
        assert!(read_if_present(&missing).unwrap().is_none());
        std::fs::write(dir.path().join("yes.txt"), "hello").unwrap();
        assert_eq!(
            read_if_present(dir.path().join("yes.txt")).unwrap().as_deref(),
            Some("hello")
        );
    }

    #[tokio::test]
    async fn test_sleep_or_shutdown_returns_early() {
        let (tx, mut rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move {
            sleep_or_shutdown(Duration::from_secs(30), &mut rx).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let interrupted = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(interrupted);
    }

    #[test]
    fn test_sleep_or_shutdown_completes() {
        tokio_test::block_on(async {
            let (_tx, mut rx) = tokio::sync::watch::channel(false);
            let interrupted = sleep_or_shutdown(Duration::from_millis(20), &mut rx).await;
            assert!(!interrupted);
        });
    }
}
