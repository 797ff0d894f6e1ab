use async_trait::async_trait;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use scraper::{ElementRef, Html, Node, Selector};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Result, SyncError};
use crate::pool::{ResourceFactory, ResourcePool};
use crate::providers::TextExtractor;
use crate::track_cleaning::{clean_track_name, slugify};
use crate::types::PlaybackSnapshot;

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Sessions are retired after this long or this many pages
const MAX_SESSION_AGE: Duration = Duration::from_secs(30 * 60);
const MAX_PAGES_PER_SESSION: u32 = 200;

pub struct ScraperSession {
    client: Client,
    started_at: Instant,
    pages_served: AtomicU32,
}

impl ScraperSession {
    fn is_fresh(&self) -> bool {
        self.started_at.elapsed() < MAX_SESSION_AGE
            && self.pages_served.load(Ordering::Relaxed) < MAX_PAGES_PER_SESSION
    }

    async fn fetch_page(&self, url: &str) -> Result<Option<String>> {
        self.pages_served.fetch_add(1, Ordering::Relaxed);
        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.text().await?)),
            status => Err(SyncError::transient(format!(
                "lyrics page returned HTTP {}",
                status
            ))),
        }
    }
}

pub struct ScraperSessionFactory {
    timeout: Duration,
}

impl ScraperSessionFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ResourceFactory for ScraperSessionFactory {
    type Resource = ScraperSession;

    async fn create(&self) -> Result<ScraperSession> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .cookie_store(true)
            .timeout(self.timeout)
            .build()
            .map_err(|e| SyncError::unavailable(format!("cannot start scraper session: {}", e)))?;
        info!("Started scraper session");
        Ok(ScraperSession {
            client,
            started_at: Instant::now(),
            pages_served: AtomicU32::new(0),
        })
    }

    async fn is_alive(&self, session: &ScraperSession) -> bool {
        session.is_fresh()
    }

    async fn shutdown(&self, session: &ScraperSession) {
        info!(
            "Closing scraper session after {} pages",
            session.pages_served.load(Ordering::Relaxed)
        );
    }
}

/// Fills a page template such as `https://lyrics.example/{creator}-{title}-lyrics`.
///
/// `{creator}` and `{title}` are slugified, `{query}` is the URL-encoded
/// "creator title" search string.
pub fn page_url(template: &str, item: &PlaybackSnapshot) -> String {
    let title = clean_track_name(&item.title);
    template
        .replace("{creator}", &slugify(&item.creator))
        .replace("{title}", &slugify(&title))
        .replace(
            "{query}",
            &urlencoding::encode(&format!("{} {}", item.creator, title)),
        )
}

pub fn extract_lyrics_from_html(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    for css in [r#"[data-lyrics-container="true"]"#, ".lyrics"] {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        let blocks: Vec<String> = document
            .select(&selector)
            .map(element_text)
            .filter(|text| !text.is_empty())
            .collect();
        if !blocks.is_empty() {
            return Some(blocks.join("\n"));
        }
    }
    None
}

fn element_text(element: ElementRef<'_>) -> String {
    let mut raw = String::new();
    for node in element.descendants() {
        match node.value() {
            Node::Text(text) => raw.push_str(text),
            Node::Element(el) if el.name() == "br" => raw.push('\n'),
            _ => {}
        }
    }

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Text extractor backed by the pooled scraper session
pub struct PageScraper {
    pool: ResourcePool<ScraperSessionFactory>,
    template: String,
}

impl PageScraper {
    pub fn new(pool: ResourcePool<ScraperSessionFactory>, template: String) -> Self {
        Self { pool, template }
    }
}

#[async_trait]
impl TextExtractor for PageScraper {
    async fn fetch_text(&self, item: &PlaybackSnapshot) -> Result<Option<String>> {
        if item.is_idle() {
            return Ok(None);
        }
        let url = page_url(&self.template, item);
        debug!("Scraping lyrics page {}", url);

        let session = self.pool.acquire().await?;
        let page = session.fetch_page(&url).await;
        session.release();

        Ok(page?.as_deref().and_then(extract_lyrics_from_html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_lyric_containers() {
        let html = r#"<html><body>
            <div class="header">Menu</div>
            <div data-lyrics-container="true" class="x">[Verse 1]<br/>Is this the <i>real</i> life?<br>Is this just fantasy?</div>
            <p>ad</p>
            <div data-lyrics-container="true">Caught in a landslide &amp; no escape</div>
        </body></html>"#;
        let text = extract_lyrics_from_html(html).unwrap();
        assert_eq!(
            text,
            "[Verse 1]\nIs this the real life?\nIs this just fantasy?\nCaught in a landslide & no escape"
        );
    }

    #[test]
    fn nested_markup_keeps_every_line() {
        let html = r#"<div data-lyrics-container="true">Line one<br/><div class="annot">Line two</div><br/>Line three</div>"#;
        assert_eq!(
            extract_lyrics_from_html(html).as_deref(),
            Some("Line one\nLine two\nLine three")
        );
    }

    #[test]
    fn falls_back_to_lyrics_class_and_gives_up_cleanly() {
        let html = r#"<pre class="song lyrics">line one
line two</pre>"#;
        assert_eq!(extract_lyrics_from_html(html).as_deref(), Some("line one\nline two"));
        assert_eq!(extract_lyrics_from_html("<div>nothing here</div>"), None);
    }

    #[test]
    fn fills_page_template() {
        let item = PlaybackSnapshot {
            identity: "id".into(),
            title: "Bohemian Rhapsody - Remastered 2011".into(),
            creator: "Queen".into(),
            ..Default::default()
        };
        assert_eq!(
            page_url("https://lyrics.example/{creator}-{title}-lyrics", &item),
            "https://lyrics.example/queen-bohemian-rhapsody-lyrics"
        );
        assert_eq!(
            page_url("https://lyrics.example/search?q={query}", &item),
            "https://lyrics.example/search?q=Queen%20Bohemian%20Rhapsody"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_retire_with_age() {
        let factory = ScraperSessionFactory::new(Duration::from_secs(5));
        let session = factory.create().await.unwrap();
        assert!(factory.is_alive(&session).await);

        tokio::time::advance(MAX_SESSION_AGE).await;
        assert!(!factory.is_alive(&session).await);
    }
}
