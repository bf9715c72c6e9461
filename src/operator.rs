use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::browser::{Browser, BrowserConfig};
use crate::error::{DeskError, Result};
use crate::plan::{ActionKind, AgentAction};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    pub id: String,
    pub mime_type: String,
    pub data_base64: String,
    pub captured_at_ms: u128,
}

impl Screenshot {
    pub fn png(data_base64: impl Into<String>) -> Self {
        Self {
            id: nanoid!(),
            mime_type: "image/png".into(),
            data_base64: data_base64.into(),
            captured_at_ms: now_ms(),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_base64)
    }
}

// ========================= Collaborators =========================

/// `Ok(None)` means there is no surface to capture; callers carry on without one.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Option<Screenshot>>;
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, actions: &[AgentAction]) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopOperator;

#[async_trait]
impl ScreenCapture for NoopOperator {
    async fn capture(&self) -> Result<Option<Screenshot>> {
        Ok(None)
    }
}

#[async_trait]
impl ActionExecutor for NoopOperator {
    async fn execute(&self, actions: &[AgentAction]) -> Result<()> {
        debug!(steps = actions.len(), "noop operator skipping actions");
        Ok(())
    }
}

// ========================= Chromium Adapter =========================

/// Drives a Chromium page: screenshots it and replays plans onto it.
pub struct ChromiumOperator {
    browser: Browser,
    // Clicks land where the last move left the pointer.
    cursor: Mutex<(i64, i64)>,
    scroll_step: i64,
}

impl ChromiumOperator {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let browser = Browser::launch(cfg)
            .await
            .map_err(|e| DeskError::ExecutionFailed(e.to_string()))?;
        Ok(Self::from_browser(browser))
    }

    pub async fn connect(ws_url: &str, cfg: BrowserConfig) -> Result<Self> {
        let browser = Browser::connect(ws_url, cfg)
            .await
            .map_err(|e| DeskError::ExecutionFailed(e.to_string()))?;
        Ok(Self::from_browser(browser))
    }

    fn from_browser(browser: Browser) -> Self {
        Self { browser, cursor: Mutex::new((0, 0)), scroll_step: 100 }
    }

    async fn act(&self, action: &AgentAction) -> anyhow::Result<()> {
        match &action.kind {
            ActionKind::Move { x, y } => {
                self.browser.move_mouse(*x, *y).await?;
                *self.cursor.lock().await = (*x, *y);
            }
            ActionKind::Click { button, double } => {
                let (x, y) = *self.cursor.lock().await;
                let count = if *double { 2 } else { 1 };
                self.browser.click(x, y, *button, count).await?;
            }
            ActionKind::Scroll { amount } => {
                let dy = scroll_delta(*amount, self.scroll_step);
                if dy != 0 {
                    self.browser.scroll(0, dy).await?;
                }
            }
            ActionKind::Input { text } => {
                if !text.is_empty() {
                    self.browser.type_text(text).await?;
                }
            }
            ActionKind::Drag { from, to } => {
                self.browser.drag((from.x, from.y), (to.x, to.y)).await?;
                *self.cursor.lock().await = (to.x, to.y);
            }
            ActionKind::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ScreenCapture for ChromiumOperator {
    async fn capture(&self) -> Result<Option<Screenshot>> {
        let b64 = self
            .browser
            .screenshot_b64()
            .await
            .map_err(|e| DeskError::Capture(e.to_string()))?;
        Ok(Some(Screenshot::png(b64)))
    }
}

#[async_trait]
impl ActionExecutor for ChromiumOperator {
    async fn execute(&self, actions: &[AgentAction]) -> Result<()> {
        for action in actions {
            info!(id = %action.id, kind = ?action.kind, "executing action");
            self.act(action)
                .await
                .map_err(|e| DeskError::ExecutionFailed(format!("{} ({}): {}", action.id, action.description, e)))?;
        }
        Ok(())
    }
}

/// Page pixels to scroll for a plan amount. Positive amounts scroll up, and
/// whatever the model asked for saturates instead of overflowing.
fn scroll_delta(amount: i64, step: i64) -> i64 {
    amount.saturating_neg().saturating_mul(step)
}

pub(crate) fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
