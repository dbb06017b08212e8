use std::time::Duration;

use sepet_adapters::{Pagination, SearchRequest};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{BrowsingSession, SessionError};

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Pause after each scroll or click before the page is polled again.
    pub scroll_interval: Duration,
    pub max_scroll_iterations: usize,
    pub max_pages: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            scroll_interval: Duration::from_secs(2),
            max_scroll_iterations: 60,
            max_pages: 50,
        }
    }
}

/// Final page content of one search. Click-through pagination yields one
/// entry per visited page, the other strategies exactly one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedPages {
    pub pages: Vec<String>,
    pub item_count: usize,
    pub scrolls: usize,
}

#[derive(Debug, Error)]
pub enum PageLoadError {
    #[error("{selector:?} did not appear within {waited:?}")]
    Timeout { selector: String, waited: Duration },
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Default)]
pub struct PageLoader {
    config: LoaderConfig,
}

impl PageLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub async fn load(
        &self,
        session: &mut dyn BrowsingSession,
        request: &SearchRequest,
    ) -> Result<LoadedPages, PageLoadError> {
        session.navigate(&request.url).await?;
        if !session
            .wait_for(&request.ready_selector, request.ready_timeout)
            .await?
        {
            return Err(PageLoadError::Timeout {
                selector: request.ready_selector.clone(),
                waited: request.ready_timeout,
            });
        }

        match &request.pagination {
            Pagination::ScrollUntilStable => self.scroll_until_stable(session, request).await,
            Pagination::ClickNextUntilAbsent { next_selector } => {
                self.click_until_absent(session, request, next_selector).await
            }
            Pagination::SinglePage => Ok(LoadedPages {
                item_count: session.count(&request.item_selector).await?,
                pages: vec![session.content().await?],
                scrolls: 0,
            }),
        }
    }

    async fn scroll_until_stable(
        &self,
        session: &mut dyn BrowsingSession,
        request: &SearchRequest,
    ) -> Result<LoadedPages, PageLoadError> {
        let mut previous: Option<usize> = None;
        let mut scrolls = 0;
        let item_count = loop {
            let count = session.count(&request.item_selector).await?;
            if previous == Some(count) {
                break count;
            }
            if scrolls >= self.config.max_scroll_iterations {
                warn!(
                    url = %request.url,
                    scrolls,
                    items = count,
                    "scroll cap reached before the item count settled"
                );
                break count;
            }
            debug!(items = count, scrolls, "scrolling for more results");
            previous = Some(count);
            session.scroll_to_bottom().await?;
            tokio::time::sleep(self.config.scroll_interval).await;
            scrolls += 1;
        };

        Ok(LoadedPages {
            pages: vec![session.content().await?],
            item_count,
            scrolls,
        })
    }

    async fn click_until_absent(
        &self,
        session: &mut dyn BrowsingSession,
        request: &SearchRequest,
        next_selector: &str,
    ) -> Result<LoadedPages, PageLoadError> {
        let mut loaded = LoadedPages {
            item_count: session.count(&request.item_selector).await?,
            pages: vec![session.content().await?],
            scrolls: 0,
        };

        loop {
            if loaded.pages.len() >= self.config.max_pages {
                warn!(url = %request.url, pages = loaded.pages.len(), "page cap reached");
                break;
            }
            if !session.click_next(next_selector).await? {
                break;
            }
            tokio::time::sleep(self.config.scroll_interval).await;
            loaded.item_count += session.count(&request.item_selector).await?;
            loaded.pages.push(session.content().await?);
        }

        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;

    use super::*;

    /// Replays scripted item counts; every call to `content` returns the page number.
    #[derive(Default)]
    struct ScriptedSession {
        ready: bool,
        counts: VecDeque<usize>,
        next_clicks: usize,
        scrolls: usize,
        page: usize,
        navigated: Vec<String>,
    }

    #[async_trait]
    impl BrowsingSession for ScriptedSession {
        async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
            self.navigated.push(url.to_string());
            Ok(())
        }

        async fn wait_for(&mut self, _selector: &str, _timeout: Duration) -> Result<bool, SessionError> {
            Ok(self.ready)
        }

        async fn count(&mut self, _selector: &str) -> Result<usize, SessionError> {
            // the last scripted value repeats once the script runs out
            match self.counts.len() {
                0 => Ok(0),
                1 => Ok(self.counts[0]),
                _ => Ok(self.counts.pop_front().unwrap_or_default()),
            }
        }

        async fn scroll_to_bottom(&mut self) -> Result<(), SessionError> {
            self.scrolls += 1;
            Ok(())
        }

        async fn click_next(&mut self, _selector: &str) -> Result<bool, SessionError> {
            if self.next_clicks == 0 {
                return Ok(false);
            }
            self.next_clicks -= 1;
            self.page += 1;
            Ok(true)
        }

        async fn content(&mut self) -> Result<String, SessionError> {
            Ok(format!("page {}", self.page))
        }

        async fn close(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn request(pagination: Pagination) -> SearchRequest {
        SearchRequest {
            url: "https://www.a101.com.tr/arama?k=S%C3%BCt".into(),
            ready_selector: "article".into(),
            item_selector: "article".into(),
            pagination,
            ready_timeout: Duration::from_secs(10),
        }
    }

    fn loader(max_scroll_iterations: usize, max_pages: usize) -> PageLoader {
        PageLoader::new(LoaderConfig {
            scroll_interval: Duration::ZERO,
            max_scroll_iterations,
            max_pages,
        })
    }

    #[tokio::test]
    async fn scrolling_stops_at_the_first_repeated_count() {
        let mut session = ScriptedSession {
            ready: true,
            counts: VecDeque::from([0, 5, 12, 12]),
            ..ScriptedSession::default()
        };
        let loaded = loader(60, 50)
            .load(&mut session, &request(Pagination::ScrollUntilStable))
            .await
            .expect("loaded");

        assert_eq!(loaded.item_count, 12);
        assert_eq!(loaded.scrolls, 3);
        assert_eq!(session.scrolls, 3);
        assert_eq!(loaded.pages, vec!["page 0".to_string()]);
    }

    #[tokio::test]
    async fn scrolling_gives_up_at_the_cap_with_what_it_has() {
        let mut session = ScriptedSession {
            ready: true,
            counts: (1..=100).collect(),
            ..ScriptedSession::default()
        };
        let loaded = loader(4, 50)
            .load(&mut session, &request(Pagination::ScrollUntilStable))
            .await
            .expect("loaded");

        assert_eq!(loaded.scrolls, 4);
        assert_eq!(loaded.item_count, 5);
    }

    #[tokio::test]
    async fn missing_ready_selector_is_a_timeout() {
        let mut session = ScriptedSession::default();
        let err = loader(60, 50)
            .load(&mut session, &request(Pagination::ScrollUntilStable))
            .await
            .expect_err("timeout");

        assert!(matches!(
            err,
            PageLoadError::Timeout { ref selector, waited } if selector == "article" && waited == Duration::from_secs(10)
        ));
        assert_eq!(session.scrolls, 0);
    }

    #[tokio::test]
    async fn click_through_collects_every_page_until_next_disappears() {
        let mut session = ScriptedSession {
            ready: true,
            counts: VecDeque::from([30]),
            next_clicks: 2,
            ..ScriptedSession::default()
        };
        let loaded = loader(60, 50)
            .load(
                &mut session,
                &request(Pagination::ClickNextUntilAbsent {
                    next_selector: "#pagination-button-next".into(),
                }),
            )
            .await
            .expect("loaded");

        assert_eq!(loaded.pages, ["page 0", "page 1", "page 2"]);
        assert_eq!(loaded.item_count, 90);
    }

    #[tokio::test]
    async fn click_through_respects_the_page_cap() {
        let mut session = ScriptedSession {
            ready: true,
            next_clicks: 10,
            ..ScriptedSession::default()
        };
        let loaded = loader(60, 3)
            .load(
                &mut session,
                &request(Pagination::ClickNextUntilAbsent {
                    next_selector: "#pagination-button-next".into(),
                }),
            )
            .await
            .expect("loaded");

        assert_eq!(loaded.pages.len(), 3);
        assert_eq!(session.next_clicks, 8);
    }

    #[tokio::test]
    async fn single_page_returns_the_loaded_document_once() {
        let mut session = ScriptedSession {
            ready: true,
            counts: VecDeque::from([7]),
            next_clicks: 3,
            ..ScriptedSession::default()
        };
        let loaded = loader(60, 50)
            .load(&mut session, &request(Pagination::SinglePage))
            .await
            .expect("loaded");

        assert_eq!(loaded.pages, ["page 0"]);
        assert_eq!(loaded.item_count, 7);
        assert_eq!(session.navigated.len(), 1);
    }
}
