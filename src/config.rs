use std::env;
use std::net::SocketAddr;

/// One admission tier: `limit` tokens, consumed during the dispatcher's
/// admission walk and held by a task only while its own duration exceeds
/// `bound`. Ordered loosest-bound-first; must be strictly decreasing by
/// `bound` (see `parse_tiers`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierLevel {
    pub bound: f64,
    pub limit: usize,
}

pub struct FrontendConfig {
    pub listen_addr: SocketAddr,
    pub backends: Vec<SocketAddr>,
    pub tiers: Vec<TierLevel>,
    pub standalone: bool,
    /// Only read when `standalone` is set — the frontend then renders
    /// locally instead of dispatching to a backend pool.
    pub renderer_bin: String,
}

pub struct ExecutorConfig {
    pub listen_addr: SocketAddr,
    pub renderer_bin: String,
    pub max_duration_secs: f64,
    pub max_concurrency: usize,
}

const DEFAULT_FRONTEND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_EXECUTOR_ADDR: &str = "127.0.0.1:8081";
const DEFAULT_RENDERER_BIN: &str = "/usr/bin/asy";
pub const DEFAULT_MAX_DURATION: f64 = 30.0;

impl FrontendConfig {
    pub fn from_env() -> Self {
        let listen_addr = env::var("RENDERD_FRONTEND_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| DEFAULT_FRONTEND_ADDR.parse().unwrap());

        let standalone = env::var("RENDERD_STANDALONE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let backends = match env::var("RENDERD_BACKENDS") {
            Ok(raw) => parse_addrs(&raw),
            Err(_) if standalone => Vec::new(),
            Err(_) => {
                tracing::warn!(
                    "RENDERD_BACKENDS not set — falling back to localhost:8081"
                );
                vec![DEFAULT_EXECUTOR_ADDR.parse().unwrap()]
            }
        };

        let tiers = match env::var("RENDERD_TIERS") {
            Ok(raw) => parse_tiers(&raw).unwrap_or_else(|err| {
                tracing::warn!(%err, "RENDERD_TIERS malformed — using default tiers");
                default_tiers(backends.len().max(1))
            }),
            Err(_) => default_tiers(backends.len().max(1)),
        };

        let renderer_bin = env::var("RENDERD_RENDERER_BIN").unwrap_or_else(|_| {
            if standalone {
                tracing::warn!(
                    "RENDERD_RENDERER_BIN not set — defaulting to {DEFAULT_RENDERER_BIN}"
                );
            }
            DEFAULT_RENDERER_BIN.to_string()
        });

        Self {
            listen_addr,
            backends,
            tiers,
            standalone,
            renderer_bin,
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let listen_addr = env::var("RENDERD_EXECUTOR_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| DEFAULT_EXECUTOR_ADDR.parse().unwrap());

        let renderer_bin = env::var("RENDERD_RENDERER_BIN").unwrap_or_else(|_| {
            tracing::warn!(
                "RENDERD_RENDERER_BIN not set — defaulting to {DEFAULT_RENDERER_BIN}"
            );
            DEFAULT_RENDERER_BIN.to_string()
        });

        let max_duration_secs = env::var("RENDERD_MAX_DURATION")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_DURATION);

        let max_concurrency = env::var("RENDERD_MAX_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            listen_addr,
            renderer_bin,
            max_duration_secs,
            max_concurrency,
        }
    }
}

fn default_tiers(backend_count: usize) -> Vec<TierLevel> {
    vec![
        TierLevel {
            bound: DEFAULT_MAX_DURATION,
            limit: backend_count,
        },
        TierLevel {
            bound: 5.0,
            limit: 1,
        },
    ]
}

fn parse_addrs(raw: &str) -> Vec<SocketAddr> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(addr) => Some(addr),
            Err(err) => {
                tracing::warn!(addr = s, %err, "skipping unparsable backend address");
                None
            }
        })
        .collect()
}

fn parse_tiers(raw: &str) -> Result<Vec<TierLevel>, String> {
    let mut levels = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (bound, limit) = part
            .split_once(':')
            .ok_or_else(|| format!("expected dur:limit, got {part:?}"))?;
        let bound: f64 = bound
            .parse()
            .map_err(|_| format!("bad duration {bound:?}"))?;
        let limit: usize = limit.parse().map_err(|_| format!("bad limit {limit:?}"))?;
        levels.push(TierLevel { bound, limit });
    }
    if levels.is_empty() {
        return Err("no tiers given".to_string());
    }
    for pair in levels.windows(2) {
        if pair[1].bound >= pair[0].bound {
            return Err("tiers must be strictly decreasing by duration".to_string());
        }
    }
    Ok(levels)
}
