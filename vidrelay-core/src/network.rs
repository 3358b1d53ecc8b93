use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::RelayConfig;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPath {
    Proxied(String),
    Direct,
}

impl NetworkPath {
    pub fn proxy(&self) -> Option<&str> {
        match self {
            NetworkPath::Proxied(host) => Some(host),
            NetworkPath::Direct => None,
        }
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkPath::Proxied(host) => write!(f, "proxy {host}"),
            NetworkPath::Direct => f.write_str("direct"),
        }
    }
}

/// Runs `attempt` through the proxy when one is configured, then once more
/// directly on any failure. When both fail the direct error is returned.
pub async fn with_proxy_fallback<T, E, F, Fut>(
    label: &str,
    proxy: Option<&str>,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut(NetworkPath) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    if let Some(host) = proxy {
        match attempt(NetworkPath::Proxied(host.to_string())).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(target: "network", stage = label, proxy = host, error = %err, "proxied attempt failed, retrying direct");
            }
        }
    }
    let result = attempt(NetworkPath::Direct).await;
    if result.is_ok() && proxy.is_some() {
        info!(target: "network", stage = label, "direct attempt succeeded");
    }
    result
}

/// HTTP client for one network path with a browser User-Agent.
pub fn http_client(path: &NetworkPath, timeout: Duration) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(BROWSER_USER_AGENT)
        .timeout(timeout);
    builder = match path.proxy() {
        Some(host) => builder.proxy(reqwest::Proxy::all(host)?),
        None => builder.no_proxy(),
    };
    builder.build()
}

/// Where the downloader takes its cookies from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieSource {
    File(PathBuf),
    Browser(String),
}

impl CookieSource {
    /// Resolves in order: `<config dir>/cookies.txt`, `./cookies.txt`, then
    /// the browser store.
    pub fn resolve(config: &RelayConfig) -> Self {
        Self::resolve_from(
            &config.config_dir(),
            Path::new("."),
            &config.downloader.cookie_browser,
        )
    }

    pub fn resolve_from(config_dir: &Path, working_dir: &Path, browser: &str) -> Self {
        for candidate in [config_dir.join("cookies.txt"), working_dir.join("cookies.txt")] {
            if candidate.is_file() {
                let absolute = std::fs::canonicalize(&candidate).unwrap_or(candidate);
                return CookieSource::File(absolute);
            }
        }
        CookieSource::Browser(browser.to_string())
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            CookieSource::File(path) => vec!["--cookies".into(), path.display().to_string()],
            CookieSource::Browser(browser) => {
                vec!["--cookies-from-browser".into(), browser.clone()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn proxy_failure_retries_direct_with_same_input() {
        let seen = Mutex::new(Vec::new());
        let result: Result<&str, String> =
            with_proxy_fallback("test", Some("http://proxy:1"), |path| {
                seen.lock().unwrap().push(path.clone());
                async move {
                    match path {
                        NetworkPath::Proxied(_) => Err("proxy down".to_string()),
                        NetworkPath::Direct => Ok("ok"),
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![NetworkPath::Proxied("http://proxy:1".into()), NetworkPath::Direct]
        );
    }

    #[tokio::test]
    async fn both_failing_reports_direct_error() {
        let result: Result<(), String> = with_proxy_fallback("test", Some("p"), |path| async move {
            Err(format!("{path} failed"))
        })
        .await;
        assert_eq!(result.unwrap_err(), "direct failed");
    }

    #[tokio::test]
    async fn no_proxy_means_single_direct_attempt() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = with_proxy_fallback("test", None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cookie_file_precedence() {
        let config_dir = tempfile::tempdir().unwrap();
        let working_dir = tempfile::tempdir().unwrap();
        assert_eq!(
            CookieSource::resolve_from(config_dir.path(), working_dir.path(), "chrome"),
            CookieSource::Browser("chrome".into())
        );

        std::fs::write(working_dir.path().join("cookies.txt"), "# cookies").unwrap();
        let source = CookieSource::resolve_from(config_dir.path(), working_dir.path(), "chrome");
        assert!(matches!(source, CookieSource::File(ref path) if path.starts_with(std::fs::canonicalize(working_dir.path()).unwrap())));

        std::fs::write(config_dir.path().join("cookies.txt"), "# cookies").unwrap();
        let source = CookieSource::resolve_from(config_dir.path(), working_dir.path(), "chrome");
        assert_eq!(source.args()[0], "--cookies");
        assert!(matches!(source, CookieSource::File(ref path) if path.starts_with(std::fs::canonicalize(config_dir.path()).unwrap())));
    }
}
