//! The bundled anonymous search/fetch backend: DuckDuckGo's HTML
//! endpoint plus a readable-text page fetcher, both routed through Tor
//! with circuit rotation between blocked attempts. Swappable through the
//! [`SearchProvider`] seam.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use ghost_domain::{Error, Result};
use ghost_tools::tor::{proxied_client, rotate_and_wait};
use ghost_tools::{SearchHit, SearchProvider};
use regex::Regex;

const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);
const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Result anchor + snippet in the DDG HTML SERP.
static RESULT_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a[^>]+class="result__a"[^>]+href="([^"]+)"[^>]*>(.*?)</a>"#).unwrap()
});
static RESULT_SNIPPET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a[^>]+class="result__snippet"[^>]*>(.*?)</a>"#).unwrap()
});
static TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

fn strip_tags(html: &str) -> String {
    let text = TAGS.replace_all(html, "");
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .trim()
        .to_string()
}

/// DDG wraps outbound links through `/l/?uddg=<encoded>`.
fn unwrap_redirect(href: &str) -> String {
    if let Some(pos) = href.find("uddg=") {
        let tail = &href[pos + 5..];
        let encoded = tail.split('&').next().unwrap_or(tail);
        return percent_decode(encoded);
    }
    href.to_string()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub struct AnonymousSearch {
    tor_proxy: Option<String>,
}

impl AnonymousSearch {
    pub fn new(tor_proxy: Option<String>) -> Self {
        Self { tor_proxy }
    }

    fn parse_serp(html: &str, max_results: usize) -> Vec<SearchHit> {
        let snippets: Vec<String> = RESULT_SNIPPET
            .captures_iter(html)
            .map(|c| strip_tags(&c[1]))
            .collect();

        RESULT_LINK
            .captures_iter(html)
            .take(max_results)
            .enumerate()
            .map(|(i, caps)| SearchHit {
                title: strip_tags(&caps[2]),
                url: unwrap_redirect(&caps[1]),
                snippet: snippets.get(i).cloned().unwrap_or_default(),
            })
            .collect()
    }
}

#[async_trait]
impl SearchProvider for AnonymousSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let client = proxied_client(self.tor_proxy.as_deref(), SEARCH_TIMEOUT);
        let via_tor = self.tor_proxy.is_some();
        let mut last_error = String::new();

        for attempt in 0..3 {
            tracing::info!(query, attempt, "anonymous search");
            let resp = client
                .post("https://html.duckduckgo.com/html/")
                .form(&[("q", query)])
                .send()
                .await;

            match resp {
                Ok(resp) if resp.status().is_success() => {
                    let html = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
                    return Ok(Self::parse_serp(&html, max_results));
                }
                Ok(resp) => {
                    last_error = format!("HTTP {}", resp.status().as_u16());
                    if via_tor {
                        rotate_and_wait().await;
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    if via_tor {
                        rotate_and_wait().await;
                    } else {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        Err(Error::Http(format!("search failed after 3 retries: {last_error}")))
    }

    async fn fetch_page(&self, url: &str) -> Result<String> {
        let client = proxied_client(self.tor_proxy.as_deref(), FETCH_TIMEOUT);
        let via_tor = self.tor_proxy.is_some();
        let mut last_error = String::new();

        for _attempt in 0..3 {
            match client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if matches!(status, 401 | 403 | 503) && via_tor {
                        last_error = format!(
                            "Access Denied ({status}) via Tor. The site likely blocks Tor exit \
                             nodes."
                        );
                        rotate_and_wait().await;
                        continue;
                    }
                    if status != 200 {
                        return Err(Error::Http(format!("received status {status} from {url}")));
                    }
                    let html = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
                    let text = html2text::from_read(html.as_bytes(), 120);
                    let cleaned: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    if cleaned.is_empty() {
                        return Err(Error::Http(format!("no text content extracted from {url}")));
                    }
                    return Ok(cleaned);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if via_tor {
                        rotate_and_wait().await;
                    }
                }
            }
        }
        Err(Error::Http(format!("error reading {url}: {last_error}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serp_results() {
        let html = r##"
            <a rel="nofollow" class="result__a" href="/l/?uddg=https%3A%2F%2Fexample.com%2Fdocs&rut=x">Example <b>Docs</b></a>
            <a class="result__snippet" href="#">The official <b>documentation</b>.</a>
            <a rel="nofollow" class="result__a" href="https://plain.example/page">Plain Result</a>
        "##;
        let hits = AnonymousSearch::parse_serp(html, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Example Docs");
        assert_eq!(hits[0].url, "https://example.com/docs");
        assert_eq!(hits[0].snippet, "The official documentation.");
        assert_eq!(hits[1].url, "https://plain.example/page");
    }

    #[test]
    fn respects_max_results() {
        let html = r#"
            <a class="result__a" href="https://a.example">A</a>
            <a class="result__a" href="https://b.example">B</a>
            <a class="result__a" href="https://c.example">C</a>
        "#;
        assert_eq!(AnonymousSearch::parse_serp(html, 2).len(), 2);
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("https%3A%2F%2Fx.y%2Fz"), "https://x.y/z");
        assert_eq!(percent_decode("plain"), "plain");
    }
}
