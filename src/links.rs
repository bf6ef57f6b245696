//! Link-list utilities: order-preserving dedup and batch reachability
//! probing of media URLs.

use std::collections::HashSet;

use futures_util::future;
use http::header;
use serde::Serialize;
use serde_json::{json, Value};
use url::Url;

use crate::fetch::Fetcher;

/// Splits a comma-separated `url` parameter value into its entries. The
/// value has already been percent-decoded once by the query parser.
pub fn split_url_list(param: &str) -> Vec<String> {
    param
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Debug, Serialize)]
pub struct DedupReport {
    pub total: usize,
    pub unique: Vec<String>,
    pub duplicates: Vec<String>,
}

/// First occurrence wins; later repeats land in `duplicates` in the order
/// they were seen.
pub fn dedup_report(urls: Vec<String>) -> DedupReport {
    let total = urls.len();
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    let mut duplicates = Vec::new();
    for url in urls {
        if seen.insert(url.clone()) {
            unique.push(url);
        } else {
            duplicates.push(url);
        }
    }
    DedupReport {
        total,
        unique,
        duplicates,
    }
}

impl DedupReport {
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "TOTAL: {}\nDUPLICATES: {}\nUNIQUE: {}\n",
            self.total,
            self.duplicates.len(),
            self.unique.len()
        );
        if !self.unique.is_empty() {
            out.push_str("\nCLEANED LINKS:\n");
            for url in &self.unique {
                out.push_str(&format!("\"{url}\",\n"));
            }
        }
        if !self.duplicates.is_empty() {
            out.push_str("\nDUPLICATES REMOVED:\n");
            for url in &self.duplicates {
                out.push_str(&format!("\"{url}\",\n"));
            }
        }
        out.trim_end().to_string()
    }
}

#[derive(Debug, Serialize)]
pub struct BrokenLink {
    pub url: String,
    /// Upstream status code as text, or `ERROR` for transport failures and
    /// unparseable URLs.
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub total: usize,
    pub working: Vec<String>,
    pub broken: Vec<BrokenLink>,
}

/// Probes every URL with a concurrent HEAD request. A link is working when
/// the response is a success and its content-type mentions `video`.
pub async fn probe_urls(fetcher: &Fetcher, urls: &[String]) -> CheckReport {
    let probes = urls.iter().map(|raw| probe_one(fetcher, raw));
    let results = future::join_all(probes).await;

    let mut working = Vec::new();
    let mut broken = Vec::new();
    for (raw, result) in urls.iter().zip(results) {
        match result {
            Ok(()) => working.push(raw.clone()),
            Err(status) => broken.push(BrokenLink {
                url: raw.clone(),
                status,
            }),
        }
    }
    CheckReport {
        total: urls.len(),
        working,
        broken,
    }
}

async fn probe_one(fetcher: &Fetcher, raw: &str) -> Result<(), String> {
    let target = Url::parse(raw).map_err(|_| "ERROR".to_string())?;
    match fetcher.probe_head(&target).await {
        Ok(resp) => {
            let content_type = resp
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            if resp.status.is_success() && content_type.contains("video") {
                Ok(())
            } else {
                Err(resp.status.as_u16().to_string())
            }
        }
        Err(_) => Err("ERROR".to_string()),
    }
}

impl CheckReport {
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "TOTAL: {}\nWORKING: {}\nBROKEN: {}\n",
            self.total,
            self.working.len(),
            self.broken.len()
        );
        if !self.working.is_empty() {
            out.push_str("\nWORKING:\n");
            for url in &self.working {
                out.push_str(&format!("\"{url}\",\n"));
            }
        }
        if !self.broken.is_empty() {
            out.push_str("\nBROKEN:\n");
            for link in &self.broken {
                out.push_str(&format!("\"{}\", {}\n", link.url, link.status));
            }
        }
        out.trim_end().to_string()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "total": self.total,
            "working": { "count": self.working.len(), "urls": self.working },
            "broken": { "count": self.broken.len(), "urls": self.broken },
        })
    }
}
