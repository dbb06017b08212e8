use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use sepet_storage::HttpFetcher;
use tracing::debug;

use crate::{BrowsingSession, SessionError};

/// Plain GETs through the unlocking proxy. The proxy renders the page, so
/// there is nothing to scroll and no next button to click.
pub struct ProxiedFetchSession {
    fetcher: Arc<HttpFetcher>,
    shop: String,
    current: Option<String>,
}

impl ProxiedFetchSession {
    pub fn new(fetcher: Arc<HttpFetcher>, shop: String) -> Self {
        Self {
            fetcher,
            shop,
            current: None,
        }
    }

    fn loaded(&self) -> Result<&str, SessionError> {
        self.current.as_deref().ok_or(SessionError::NoPage)
    }
}

fn count_matches(content: &str, selector: &str) -> Result<usize, SessionError> {
    let selector = Selector::parse(selector)
        .map_err(|err| SessionError::Command(format!("invalid selector {selector:?}: {err}")))?;
    Ok(Html::parse_document(content).select(&selector).count())
}

#[async_trait]
impl BrowsingSession for ProxiedFetchSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.current = None;
        let response = self.fetcher.fetch_bytes(&self.shop, url).await?;
        debug!(shop = %self.shop, bytes = response.body.len(), "proxied page fetched");
        self.current = Some(response.text());
        Ok(())
    }

    // The document is complete once fetched, so there is nothing to wait for.
    async fn wait_for(&mut self, selector: &str, _timeout: Duration) -> Result<bool, SessionError> {
        Ok(count_matches(self.loaded()?, selector)? > 0)
    }

    async fn count(&mut self, selector: &str) -> Result<usize, SessionError> {
        count_matches(self.loaded()?, selector)
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn click_next(&mut self, _selector: &str) -> Result<bool, SessionError> {
        Ok(false)
    }

    async fn content(&mut self) -> Result<String, SessionError> {
        self.loaded().map(str::to_string)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.current = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sepet_storage::HttpClientConfig;

    fn session_with(content: Option<&str>) -> ProxiedFetchSession {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let mut session = ProxiedFetchSession::new(Arc::new(fetcher), "Onurmarket".into());
        session.current = content.map(str::to_string);
        session
    }

    #[tokio::test]
    async fn counts_and_waits_against_the_fetched_document() {
        let mut session = session_with(Some(
            r#"<div id="ProductPageProductList"><div class="productItem"></div><div class="productItem"></div></div>"#,
        ));
        assert_eq!(session.count("div.productItem").await.unwrap(), 2);
        assert!(session
            .wait_for("#ProductPageProductList", Duration::from_secs(15))
            .await
            .unwrap());
        assert!(!session.wait_for("div.empty", Duration::from_secs(15)).await.unwrap());
        assert!(!session.click_next("a.next").await.unwrap());
    }

    #[tokio::test]
    async fn nothing_loaded_is_an_error() {
        let mut session = session_with(None);
        assert!(matches!(session.count("div").await, Err(SessionError::NoPage)));
        session.close().await.unwrap();
        assert!(matches!(session.content().await, Err(SessionError::NoPage)));
    }

    #[tokio::test]
    async fn bad_selector_is_a_command_error() {
        let mut session = session_with(Some("<p></p>"));
        assert!(matches!(session.count("p[").await, Err(SessionError::Command(_))));
    }
}
