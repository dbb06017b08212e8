use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::{BrowsingSession, SessionError, SessionSettings};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

// The page footer swallows scroll events, so stop short of the very bottom.
const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight - 1000);";

/// Headless Chrome with automation hints and images turned off.
pub struct ChromeSession {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Page,
}

impl ChromeSession {
    pub async fn launch(settings: &SessionSettings) -> Result<Self, SessionError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .request_timeout(settings.request_timeout)
            .args([
                format!("--user-agent={}", settings.user_agent),
                "--disable-blink-features=AutomationControlled".to_string(),
                "--blink-settings=imagesEnabled=false".to_string(),
                "--disable-plugins-discovery".to_string(),
                "--disable-gpu".to_string(),
                "--start-maximized".to_string(),
            ]);
        if !settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &settings.chrome_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(SessionError::Launch)?;

        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "browser handler event error");
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                handler.abort();
                return Err(SessionError::Launch(err.to_string()));
            }
        };
        page.set_user_agent(settings.user_agent.as_str())
            .await
            .map_err(command)?;

        Ok(Self {
            browser,
            handler,
            page,
        })
    }
}

fn command(err: chromiumoxide::error::CdpError) -> SessionError {
    SessionError::Command(err.to_string())
}

#[async_trait]
impl BrowsingSession for ChromeSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.page
            .goto(url)
            .await
            .map(|_| ())
            .map_err(|err| SessionError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            })
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.count(selector).await? > 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn count(&mut self, selector: &str) -> Result<usize, SessionError> {
        let elements = self.page.find_elements(selector).await.map_err(command)?;
        Ok(elements.len())
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), SessionError> {
        self.page.evaluate(SCROLL_SCRIPT).await.map_err(command)?;
        Ok(())
    }

    async fn click_next(&mut self, selector: &str) -> Result<bool, SessionError> {
        let literal = serde_json::to_string(selector)
            .map_err(|err| SessionError::Command(err.to_string()))?;
        let script = format!(
            "(() => {{
                const el = document.querySelector({literal});
                if (!el || el.disabled || el.getAttribute('aria-disabled') === 'true' || el.offsetParent === null) {{
                    return false;
                }}
                el.click();
                return true;
            }})()"
        );
        let result = self.page.evaluate(script).await.map_err(command)?;
        result
            .into_value::<bool>()
            .map_err(|err| SessionError::Command(err.to_string()))
    }

    async fn content(&mut self) -> Result<String, SessionError> {
        self.page.content().await.map_err(command)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        let closed = self.browser.close().await.map(|_| ()).map_err(command);
        let _ = self.browser.wait().await;
        self.handler.abort();
        closed
    }
}
