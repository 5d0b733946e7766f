//! Site list: the probe targets.
//!
//! Stored as a flat file, one record per line:
//! `name<TAB>url<TAB>block_pattern<TAB>success_pattern`. Blank lines and
//! lines starting with `#` are ignored. A single-field line is a bare domain.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;

use super::error::WatchdogError;
use super::probe::normalize_url;

/// Block pattern the admin panel writes for every domain it saves.
pub const DEFAULT_BLOCK_PATTERN: &str =
    "blocked|access.denied|captcha|cf-browser|challenge|verify";

/// One probe target.
#[derive(Debug, Clone)]
pub struct Site {
    pub name: String,
    /// Bare domain or full URL; bare domains are probed over `https://`.
    pub url: String,
    pub block_pattern: Option<Regex>,
    pub success_pattern: Option<Regex>,
}

impl Site {
    /// A pattern-less site that is healthy whenever it is reachable.
    pub fn bare(domain: &str) -> Self {
        Self {
            name: slug(domain),
            url: domain.to_string(),
            block_pattern: None,
            success_pattern: None,
        }
    }
}

/// Parse one record. `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> std::result::Result<Option<Site>, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    let field = |i: usize| fields.get(i).copied().unwrap_or("");

    let url = if field(1).is_empty() { field(0) } else { field(1) };
    if url.is_empty() {
        return Err("missing url".into());
    }
    check_url(url)?;

    let name = if field(0).is_empty() || fields.len() == 1 {
        slug(url)
    } else {
        field(0).to_string()
    };

    Ok(Some(Site {
        name,
        url: url.to_string(),
        block_pattern: compile_pattern(field(2), "block")?,
        success_pattern: compile_pattern(field(3), "success")?,
    }))
}

fn check_url(url: &str) -> std::result::Result<(), String> {
    let normalized = normalize_url(url);
    let parsed =
        reqwest::Url::parse(&normalized).map_err(|e| format!("unusable url '{url}': {e}"))?;
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(format!("url '{url}' has no host"));
    }
    Ok(())
}

fn compile_pattern(raw: &str, which: &str) -> std::result::Result<Option<Regex>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    Regex::new(raw)
        .map(Some)
        .map_err(|e| format!("invalid {which} pattern '{raw}': {e}"))
}

/// First DNS label of a url's host: `https://www.reddit.com/r` -> `www`.
fn slug(url: &str) -> String {
    let host = host_part(url);
    host.split('.')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(host)
        .to_string()
}

fn host_part(url: &str) -> &str {
    let lower = url.to_ascii_lowercase();
    let rest = if lower.starts_with("https://") {
        &url[8..]
    } else if lower.starts_with("http://") {
        &url[7..]
    } else {
        url
    };
    rest.split('/').next().unwrap_or(rest).trim()
}

/// Parse a site list, skipping (and logging) records that do not parse.
pub fn parse_sites(content: &str) -> Vec<Site> {
    let mut sites = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        match parse_line(line) {
            Ok(Some(site)) => sites.push(site),
            Ok(None) => {}
            Err(e) => tracing::warn!("skipping site list line {}: {e}", idx + 1),
        }
    }
    sites
}

/// Reject a site list if any record does not parse.
pub fn validate_site_list(content: &str) -> std::result::Result<(), WatchdogError> {
    let problems: Vec<String> = content
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| parse_line(line).err().map(|e| format!("line {}: {e}", idx + 1)))
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(WatchdogError::ConfigValidation(problems.join("; ")))
    }
}

/// Strip trailing whitespace per line and end with a single newline.
pub fn normalize_content(content: &str) -> String {
    let lines: Vec<&str> = content.lines().map(str::trim_end).collect();
    let mut out = lines.join("\n");
    let trimmed_len = out.trim_end_matches('\n').len();
    out.truncate(trimmed_len);
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Render the record the admin panel stores for a plain domain entry.
pub fn site_line_for_domain(entry: &str) -> String {
    let domain = host_part(entry);
    let domain = if domain.is_empty() { entry.trim() } else { domain };
    let slug = slug(domain);
    format!("{slug}\t{domain}\t{DEFAULT_BLOCK_PATTERN}\t{slug}")
}

/// The site-list file on disk.
#[derive(Debug, Clone)]
pub struct SiteStore {
    path: PathBuf,
}

impl SiteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw file content; a missing file reads as empty.
    pub async fn read_raw(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e)
                .with_context(|| format!("failed to read site list {}", self.path.display())),
        }
    }

    /// Parsed sites, in file order.
    pub async fn load(&self) -> Result<Vec<Site>> {
        Ok(parse_sites(&self.read_raw().await?))
    }

    /// Validate and atomically replace the file. Nothing is written on a
    /// validation failure.
    pub async fn write(&self, content: &str) -> Result<()> {
        validate_site_list(content)?;
        let normalized = normalize_content(content);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, normalized.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_record() {
        let site = parse_line("reddit\treddit.com\tblocked|captcha\treddit")
            .unwrap()
            .unwrap();
        assert_eq!(site.name, "reddit");
        assert_eq!(site.url, "reddit.com");
        assert_eq!(site.block_pattern.unwrap().as_str(), "blocked|captcha");
        assert_eq!(site.success_pattern.unwrap().as_str(), "reddit");
    }

    #[test]
    fn bare_domain_line() {
        let site = parse_line("wikipedia.org").unwrap().unwrap();
        assert_eq!(site.name, "wikipedia");
        assert_eq!(site.url, "wikipedia.org");
        assert!(site.block_pattern.is_none());
        assert!(site.success_pattern.is_none());
    }

    #[test]
    fn empty_url_column_falls_back_to_name() {
        let site = parse_line("youtube.com\t\t\tyoutube").unwrap().unwrap();
        assert_eq!(site.url, "youtube.com");
        assert_eq!(site.name, "youtube.com");
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("# comment\turl").unwrap().is_none());
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let err = parse_line("a\ta.test\t(unclosed\t").unwrap_err();
        assert!(err.contains("block pattern"));
    }

    #[test]
    fn unusable_url_is_rejected() {
        assert!(parse_line("a\thttps://\t\t").is_err());
        assert!(parse_line("a\thas space.com\t\t").is_err());
    }

    #[test]
    fn parse_sites_keeps_order_and_skips_bad_lines() {
        let content = "# header\nb\tb.test\t\t\n\nbad\thttps://\t\t\na\ta.test\t\tOK\n";
        let sites = parse_sites(content);
        let names: Vec<_> = sites.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn validate_reports_line_numbers() {
        let err = validate_site_list("ok\tok.test\t\t\n\tx\t(\t\n").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("line 2"), "{msg}");
        assert!(matches!(err, WatchdogError::ConfigValidation(_)));
    }

    #[test]
    fn normalize_strips_trailing_whitespace() {
        assert_eq!(normalize_content("a\ta.test  \r\nb\tb.test\n\n\n"), "a\ta.test\nb\tb.test\n");
        assert_eq!(normalize_content(""), "");
    }

    #[test]
    fn panel_domain_record() {
        assert_eq!(
            site_line_for_domain("https://reddit.com/r/rust"),
            format!("reddit\treddit.com\t{DEFAULT_BLOCK_PATTERN}\treddit")
        );
        let line = site_line_for_domain("youtube.com");
        let site = parse_line(&line).unwrap().unwrap();
        assert_eq!(site.name, "youtube");
    }

    #[tokio::test]
    async fn store_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SiteStore::new(dir.path().join("etc").join("sites.conf"));
        let content = "reddit\treddit.com\tblocked\treddit\nwiki\thttps://wikipedia.org\t\tWikipedia\n";
        store.write(content).await.unwrap();
        assert_eq!(store.read_raw().await.unwrap(), content);
        assert_eq!(store.load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn store_rejects_invalid_content_without_touching_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SiteStore::new(dir.path().join("sites.conf"));
        store.write("a\ta.test\t\t\n").await.unwrap();
        assert!(store.write("a\ta.test\t[\t\n").await.is_err());
        assert_eq!(store.read_raw().await.unwrap(), "a\ta.test\n");
    }

    #[tokio::test]
    async fn store_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SiteStore::new(dir.path().join("nope.conf"));
        assert_eq!(store.read_raw().await.unwrap(), "");
        assert!(store.load().await.unwrap().is_empty());
    }
}
