use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;

use crate::plan::MouseButton as PlanButton;

#[derive(Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub start_url: Option<String>,
    pub viewport: (u32, u32),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, start_url: None, viewport: (1600, 900) }
    }
}

/// A single Chromium page acting as the surface the agent sees and drives.
pub struct Browser {
    page: Page,
    viewport: (u32, u32),
    _browser: OxideBrowser,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique profile dir per launch; Chromium refuses to share a locked profile.
        let ts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("multidesk-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Self::open(browser, cfg).await
    }

    pub async fn connect(ws_url: &str, cfg: BrowserConfig) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        Self::open(browser, cfg).await
    }

    async fn open(browser: OxideBrowser, cfg: BrowserConfig) -> Result<Self> {
        let url = cfg.start_url.as_deref().unwrap_or("about:blank");
        let page = browser.new_page(url).await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let this = Self { page, viewport: cfg.viewport, _browser: browser };
        this.apply_viewport().await?;
        Ok(this)
    }

    // A zero-sized viewport makes screenshots fail.
    async fn apply_viewport(&self) -> Result<()> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.0 as i64)
            .height(self.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(metrics).await?;
        Ok(())
    }

    pub async fn move_mouse(&self, x: i64, y: i64) -> Result<()> {
        self.page.move_mouse(Point { x: x as f64, y: y as f64 }).await?;
        Ok(())
    }

    pub async fn click(&self, x: i64, y: i64, button: PlanButton, click_count: i64) -> Result<()> {
        let btn = match button {
            PlanButton::Left => MouseButton::Left,
            PlanButton::Right => MouseButton::Right,
            PlanButton::Middle => MouseButton::Middle,
        };
        let cmd = DispatchMouseEventParams::builder()
            .x(x as f64)
            .y(y as f64)
            .button(btn)
            .click_count(click_count);
        let pressed = cmd.clone().r#type(DispatchMouseEventType::MousePressed).build().map_err(|e| anyhow!(e))?;
        let released = cmd.r#type(DispatchMouseEventType::MouseReleased).build().map_err(|e| anyhow!(e))?;
        self.page.execute(pressed).await?;
        self.page.execute(released).await?;
        Ok(())
    }

    pub async fn scroll(&self, dx: i64, dy: i64) -> Result<()> {
        let eval = EvaluateParams::builder()
            .expression(format!("window.scrollBy({dx}, {dy});"))
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(eval).await?;
        Ok(())
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.page.execute(InsertTextParams { text: text.to_string() }).await?;
        Ok(())
    }

    pub async fn drag(&self, from: (i64, i64), to: (i64, i64)) -> Result<()> {
        let cmd = DispatchMouseEventParams::builder().button(MouseButton::Left).click_count(1);
        let pressed = cmd
            .clone()
            .x(from.0 as f64)
            .y(from.1 as f64)
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(|e| anyhow!(e))?;
        let released = cmd
            .x(to.0 as f64)
            .y(to.1 as f64)
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.move_mouse(from.0, from.1).await?;
        self.page.execute(pressed).await?;
        self.move_mouse(to.0, to.1).await?;
        self.page.execute(released).await?;
        Ok(())
    }

    pub async fn screenshot_b64(&self) -> Result<String> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(false).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(STANDARD.encode(bytes)),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    // Re-apply the viewport and retry once.
                    self.apply_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    let bytes = take().await?;
                    return Ok(STANDARD.encode(bytes));
                }
                Err(anyhow!(e))
            }
        }
    }
}
