use anyhow::{Context, Result};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Fetch a source's sitemap (following one level of sitemap index) and
/// return the product URLs matching `pattern`. Child sitemaps are not
/// requested after cancellation.
pub async fn fetch_product_urls(
    client: &reqwest::Client,
    sitemap_url: &str,
    pattern: Option<&Regex>,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    if cancel.is_cancelled() {
        return Ok(Vec::new());
    }
    info!("Fetching sitemap: {}", sitemap_url);
    let xml = fetch_text(client, sitemap_url).await?;
    let parsed = parse_sitemap(&xml)?;

    let mut all_urls = parsed.urls;
    for child in parsed.children {
        if cancel.is_cancelled() {
            warn!("Cancelled; not fetching child sitemap {}", child);
            break;
        }
        match fetch_text(client, &child).await {
            Ok(body) => match parse_sitemap(&body) {
                Ok(p) => all_urls.extend(p.urls),
                Err(e) => warn!("Skipping unparsable child sitemap {}: {}", child, e),
            },
            Err(e) => warn!("Skipping child sitemap {}: {}", child, e),
        }
    }
    info!("Total URLs in sitemap: {}", all_urls.len());

    let filtered = filter_urls(all_urls, pattern);
    info!("Product pages after filtering: {}", filtered.len());
    Ok(filtered)
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String> {
    client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
        .with_context(|| format!("Failed to fetch sitemap {url}"))
}

pub fn filter_urls(urls: Vec<String>, pattern: Option<&Regex>) -> Vec<String> {
    urls.into_iter()
        .filter(|u| pattern.map_or(true, |re| re.is_match(u)))
        .collect()
}

#[derive(Debug, Default, PartialEq)]
pub struct ParsedSitemap {
    /// `<url><loc>` entries.
    pub urls: Vec<String>,
    /// `<sitemap><loc>` entries of a sitemap index.
    pub children: Vec<String>,
}

/// Parse a urlset or sitemapindex document.
pub fn parse_sitemap(xml: &str) -> Result<ParsedSitemap> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut out = ParsedSitemap::default();
    let mut in_url = false;
    let mut in_sitemap = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"url" => in_url = true,
                b"sitemap" => in_sitemap = true,
                b"loc" if in_url || in_sitemap => in_loc = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(e)) if in_loc => {
                let loc = e.unescape()?.trim().to_string();
                if loc.is_empty() {
                    continue;
                }
                if in_sitemap {
                    out.children.push(loc);
                } else {
                    out.urls.push(loc);
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"loc" => in_loc = false,
                b"url" => in_url = false,
                b"sitemap" => in_sitemap = false,
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
