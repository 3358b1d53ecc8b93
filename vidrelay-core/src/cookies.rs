use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use walkdir::WalkDir;

const HEADER: &str = "# Netscape HTTP Cookie File\n# This is a generated file! Do not edit.\n";
const DEFAULT_DOMAIN: &str = ".youtube.com";
pub const ARCHIVE_KEEP: usize = 10;

/// Cookie as exported by browser extensions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserCookie {
    pub domain: String,
    pub expiration_date: f64,
    pub host_only: bool,
    pub name: String,
    pub path: String,
    pub secure: bool,
    pub value: String,
}

impl BrowserCookie {
    fn netscape_line(&self) -> String {
        let domain = if self.domain.is_empty() {
            DEFAULT_DOMAIN
        } else {
            &self.domain
        };
        let path = if self.path.is_empty() { "/" } else { &self.path };
        let expiration = if self.expiration_date > 0.0 {
            (self.expiration_date as i64).to_string()
        } else {
            "0".to_string()
        };
        format!(
            "{domain}\t{}\t{path}\t{}\t{expiration}\t{}\t{}",
            flag(!self.host_only),
            flag(self.secure),
            self.name,
            self.value
        )
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "TRUE"
    } else {
        "FALSE"
    }
}

/// Converts a JSON cookie array, or a `name=value; name2=value2` header
/// string, into Netscape cookie-file text.
pub fn to_netscape(raw: &str) -> String {
    let lines: Vec<String> = match serde_json::from_str::<Vec<BrowserCookie>>(raw) {
        Ok(cookies) => cookies.iter().map(BrowserCookie::netscape_line).collect(),
        Err(_) => raw
            .split(';')
            .filter_map(|part| part.trim().split_once('='))
            .filter(|(name, _)| !name.trim().is_empty())
            .map(|(name, value)| {
                format!(
                    "{DEFAULT_DOMAIN}\tTRUE\t/\tFALSE\t0\t{}\t{}",
                    name.trim(),
                    value.trim()
                )
            })
            .collect(),
    };
    let mut out = String::from(HEADER);
    out.push('\n');
    out.push_str(&lines.join("\n"));
    out.push('\n');
    out
}

#[derive(Debug, Clone)]
pub struct CookieImport {
    pub active: PathBuf,
    pub archived: PathBuf,
    pub pruned: usize,
}

/// Writes the converted cookies to `<config_dir>/cookies.txt`, keeps a
/// timestamped copy under `archive_dir`, and prunes the archive.
pub fn import(raw: &str, config_dir: &Path, archive_dir: &Path) -> io::Result<CookieImport> {
    let content = to_netscape(raw);
    std::fs::create_dir_all(config_dir)?;
    std::fs::create_dir_all(archive_dir)?;

    let active = config_dir.join("cookies.txt");
    std::fs::write(&active, &content)?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
    let archived = archive_dir.join(format!("cookies_{stamp}.txt"));
    std::fs::write(&archived, &content)?;
    info!(target: "cookies", path = %active.display(), archive = %archived.display(), "cookies imported");

    let pruned = prune_archive(archive_dir, ARCHIVE_KEEP)?;
    Ok(CookieImport {
        active,
        archived,
        pruned,
    })
}

/// Removes the oldest `cookies_*.txt` files beyond `keep`. Names embed the
/// timestamp, so lexical order is age order.
pub fn prune_archive(dir: &Path, keep: usize) -> io::Result<usize> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.starts_with("cookies_") && name.ends_with(".txt")
        })
        .map(|entry| entry.into_path())
        .collect();
    if files.len() <= keep {
        return Ok(0);
    }
    files.sort();
    let excess = files.len() - keep;
    let mut removed = 0;
    for path in files.into_iter().take(excess) {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => {
                warn!(target: "cookies", path = %path.display(), error = %err, "failed to prune cookie archive")
            }
        }
    }
    Ok(removed)
}
