//! Chrome launcher.
//!
//! Builds per-instance launch configuration from [`BrowserOptions`] and
//! starts the subprocess via CDP, returning a [`BrowserHandle`] that owns
//! the connection and its event-handler task.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BrowserOptions;

/// Well-known Chrome/Chromium install locations, probed in order.
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

/// Launch options for one browser instance. Instance `i` of a pool gets
/// its own data dir suffix and debug port so processes never collide.
#[derive(Debug, Clone)]
pub struct LauncherOptions {
    pub bin: Option<PathBuf>,
    pub user_data_dir: PathBuf,
    pub headless: bool,
    pub incognito: bool,
    pub no_sandbox: bool,
    pub remote_debugging_port: u16,
    pub window_width: u32,
    pub window_height: u32,
    pub user_agent: Option<String>,
    pub extra_args: Vec<String>,
    pub kill_on_drop: bool,
    pub trace: bool,
}

impl LauncherOptions {
    /// Derive the options for pool instance `instance_id`.
    pub fn for_instance(options: &BrowserOptions, instance_id: usize) -> Self {
        let mut extra_args = Vec::new();
        if !options.disable_blink_features.is_empty() {
            extra_args.push(format!(
                "--disable-blink-features={}",
                options.disable_blink_features
            ));
        }
        if options.disable_dev_shm_usage {
            extra_args.push("--disable-dev-shm-usage".to_string());
        }
        if options.disable_background_networking {
            extra_args.push("--disable-background-networking".to_string());
        }
        if options.disable_background_timer_throttling {
            extra_args.push("--disable-background-timer-throttling".to_string());
        }
        Self {
            bin: (!options.bin.is_empty()).then(|| PathBuf::from(&options.bin)),
            user_data_dir: options
                .user_data_dir
                .join(format!("instance_{instance_id}")),
            headless: options.headless,
            incognito: options.incognito,
            no_sandbox: options.no_sandbox,
            remote_debugging_port: options.basic_remote_debugging_port + instance_id as u16,
            window_width: options.default_page_width,
            window_height: options.default_page_height,
            user_agent: (!options.user_agent.is_empty()).then(|| options.user_agent.clone()),
            extra_args,
            kill_on_drop: options.leakless,
            trace: options.trace,
        }
    }
}

/// A launched browser: the CDP connection plus the handler task driving it.
#[derive(Debug)]
pub struct BrowserHandle {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

impl BrowserHandle {
    /// DevTools websocket endpoint of this instance.
    pub fn websocket_address(&self) -> &str {
        self.browser.websocket_address()
    }

    pub async fn new_page(&self) -> Result<Page> {
        self.browser
            .new_page("about:blank")
            .await
            .context("failed to open page")
    }

    /// Close the browser process and stop its handler task.
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!("browser close returned error: {e}");
        }
        self.handler_task.abort();
    }
}

/// Find a Chrome binary: probe well-known paths, then `$PATH`.
fn find_chrome() -> Result<PathBuf> {
    for path in CHROME_PATHS {
        let p = std::path::Path::new(path);
        if p.exists() {
            return Ok(p.to_path_buf());
        }
    }
    for cmd in &[
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
    ] {
        if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Ok(PathBuf::from(path));
                }
            }
        }
    }
    anyhow::bail!("Chrome/Chromium binary not found; install it or set browser.bin")
}

/// Start one browser subprocess. Binary discovery, directory creation and
/// port-bind failures are terminal; the caller does not retry.
pub async fn launch(opts: &LauncherOptions) -> Result<BrowserHandle> {
    std::fs::create_dir_all(&opts.user_data_dir).with_context(|| {
        format!(
            "failed to create user data dir {}",
            opts.user_data_dir.display()
        )
    })?;

    let bin = match &opts.bin {
        Some(path) => {
            anyhow::ensure!(path.exists(), "browser binary {} not found", path.display());
            path.clone()
        }
        None => find_chrome()?,
    };

    let mut builder = BrowserConfig::builder()
        .chrome_executable(bin.clone())
        .user_data_dir(opts.user_data_dir.clone())
        .window_size(opts.window_width, opts.window_height)
        .arg(format!(
            "--remote-debugging-port={}",
            opts.remote_debugging_port
        ));
    if !opts.headless {
        builder = builder.with_head();
    }
    if opts.incognito {
        builder = builder.arg("--incognito");
    }
    if opts.no_sandbox {
        builder = builder.no_sandbox();
    }
    if let Some(ref ua) = opts.user_agent {
        builder = builder.arg(format!("--user-agent={ua}"));
    }
    for arg in &opts.extra_args {
        builder = builder.arg(arg);
    }
    let config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("invalid browser config: {e}"))?;

    info!(
        port = opts.remote_debugging_port,
        data_dir = %opts.user_data_dir.display(),
        headless = opts.headless,
        "launching browser"
    );

    let (browser, mut handler) = Browser::launch(config).await.with_context(|| {
        format!(
            "failed to launch browser on port {} (binary {}, port already bound?)",
            opts.remote_debugging_port,
            bin.display()
        )
    })?;

    let trace = opts.trace;
    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if trace {
                debug!(?event, "cdp handler event");
            }
            if event.is_err() {
                break;
            }
        }
    });

    info!(endpoint = %browser.websocket_address(), "browser ready");

    Ok(BrowserHandle {
        browser,
        handler_task,
    })
}
