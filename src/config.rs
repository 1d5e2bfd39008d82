use clap::Parser;

use crate::notify::ChatSettings;
use crate::windows::WINDOWS;

/// Prediction-market mover detection pipeline
#[derive(Parser, Debug, Clone)]
#[command(name = "market-mover-watch", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "movers.db")]
    pub database_path: String,

    /// Read API listen address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    pub api_addr: String,

    /// Pipeline tick interval in milliseconds
    #[arg(long, env = "WORKER_INTERVAL_MS", default_value = "60000")]
    pub worker_interval_ms: u64,

    /// Enable the Kalshi adapter
    #[arg(long, env = "ENABLE_KALSHI", default_value = "true")]
    pub enable_kalshi: bool,

    /// Kalshi API base URL
    #[arg(
        long,
        env = "KALSHI_API_URL",
        default_value = "https://api.elections.kalshi.com"
    )]
    pub kalshi_api_url: String,

    /// Polymarket Gamma (markets) API base URL
    #[arg(
        long,
        env = "POLYMARKET_GAMMA_URL",
        default_value = "https://gamma-api.polymarket.com"
    )]
    pub polymarket_gamma_url: String,

    /// Polymarket CLOB (order book) base URL
    #[arg(
        long,
        env = "POLYMARKET_CLOB_URL",
        default_value = "https://clob.polymarket.com"
    )]
    pub polymarket_clob_url: String,

    /// Enable the Opinion adapter (also requires OPINION_API_KEY)
    #[arg(long, env = "ENABLE_OPINION", default_value = "false")]
    pub enable_opinion: bool,

    /// Opinion API base URL
    #[arg(long, env = "OPINION_API_URL", default_value = "https://api.opinion.trade")]
    pub opinion_api_url: String,

    /// Opinion API key
    #[arg(long, env = "OPINION_API_KEY")]
    pub opinion_api_key: Option<String>,

    /// Spot-price source base URL
    #[arg(long, env = "SPOT_API_URL", default_value = "https://api.binance.com")]
    pub spot_api_url: String,

    /// Path of the anchor classifier artifact (hot-reloaded)
    #[arg(long, env = "ANCHOR_MODEL_PATH", default_value = "anchor_model.json")]
    pub anchor_model_path: String,

    /// Seconds between anchor model reload attempts
    #[arg(long, env = "MODEL_RELOAD_SECS", default_value = "180")]
    pub model_reload_secs: u64,

    /// Markets profiled per cycle at most
    #[arg(long, env = "PROFILE_BATCH_SIZE", default_value = "600")]
    pub profile_batch_size: i64,

    /// Minimum outcome liquidity (USD) for alerting
    #[arg(long, env = "ALERT_MIN_LIQUIDITY", default_value = "1000.0")]
    pub alert_min_liquidity: f64,

    /// Maximum outcome spread (pp) for alerting
    #[arg(long, env = "ALERT_MAX_SPREAD_PP", default_value = "10.0")]
    pub alert_max_spread_pp: f64,

    /// Minutes before the same alert signature may fire again
    #[arg(long, env = "ALERT_COOLDOWN_MINUTES", default_value = "30")]
    pub alert_cooldown_minutes: i64,

    /// Chat transport preference: "bot" or "user"
    #[arg(long, env = "CHAT_MODE", default_value = "bot")]
    pub chat_mode: String,

    /// Telegram Bot API base URL
    #[arg(long, env = "TELEGRAM_API_URL", default_value = "https://api.telegram.org")]
    pub telegram_api_url: String,

    /// Telegram bot token (bot transport)
    #[arg(long, env = "TELEGRAM_BOT_TOKEN")]
    pub telegram_bot_token: Option<String>,

    /// Telegram chat id (bot transport)
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    pub telegram_chat_id: Option<String>,

    /// Gateway base URL (user transport)
    #[arg(long, env = "CHAT_USER_API_URL")]
    pub chat_user_api_url: Option<String>,

    /// Gateway access token (user transport)
    #[arg(long, env = "CHAT_USER_TOKEN")]
    pub chat_user_token: Option<String>,

    /// Gateway channel (user transport)
    #[arg(long, env = "CHAT_USER_CHANNEL")]
    pub chat_user_channel: Option<String>,

    /// Hours of snapshot/delta/classification history to keep
    #[arg(long, env = "RETENTION_HOURS", default_value = "48")]
    pub retention_hours: i64,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_interval_ms < 5_000 {
            anyhow::bail!("worker_interval_ms must be at least 5000");
        }
        if self.alert_cooldown_minutes <= 0 {
            anyhow::bail!("alert_cooldown_minutes must be positive");
        }
        let largest_window_minutes = WINDOWS[WINDOWS.len() - 1].minutes;
        if self.retention_hours * 60 < largest_window_minutes {
            anyhow::bail!(
                "retention_hours must cover the largest lookback window ({} minutes)",
                largest_window_minutes
            );
        }
        if !matches!(self.chat_mode.as_str(), "bot" | "user") {
            anyhow::bail!("chat_mode must be \"bot\" or \"user\"");
        }
        if self.profile_batch_size <= 0 {
            anyhow::bail!("profile_batch_size must be positive");
        }
        Ok(())
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            mode: self.chat_mode.clone(),
            bot_api_url: self.telegram_api_url.clone(),
            bot_token: self.telegram_bot_token.clone(),
            bot_chat_id: self.telegram_chat_id.clone(),
            user_base_url: self.chat_user_api_url.clone(),
            user_access_token: self.chat_user_token.clone(),
            user_channel: self.chat_user_channel.clone(),
        }
    }
}
