/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use http::HeaderMap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::Mutex;

use crate::clock::now_ms;

const WINDOW_MS: i64 = 60_000;
const MAX_TRACKED: usize = 10_000;

#[derive(Clone, Copy)]
struct WindowCounter {
    window_start_ms: i64,
    count: u32,
}

#[derive(Clone, Copy)]
struct NoisyState {
    strikes: u32,
    blocked_until_ms: i64,
    last_hit_ms: i64,
}

/// Fixed one-minute window per (bucket, ip), with an escalating block for
/// peers that keep hitting the limit. A `per_minute` of 0 disables a bucket.
pub struct RateLimiter {
    inner: Mutex<HashMap<String, WindowCounter>>,
    noisy: Mutex<HashMap<String, NoisyState>>,
    noisy_backoff_base_secs: u64,
    noisy_backoff_max_secs: u64,
}

impl RateLimiter {
    pub fn new(noisy_backoff_base_secs: u64, noisy_backoff_max_secs: u64) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            noisy: Mutex::new(HashMap::new()),
            noisy_backoff_base_secs,
            noisy_backoff_max_secs,
        }
    }

    pub async fn check(&self, ip: &str, bucket: &str, per_minute: u32) -> bool {
        self.check_at(ip, bucket, per_minute, now_ms()).await
    }

    async fn check_at(&self, ip: &str, bucket: &str, per_minute: u32, now: i64) -> bool {
        if per_minute == 0 {
            return true;
        }
        if self.is_blocked(ip, now).await {
            return false;
        }
        let mut map = self.inner.lock().await;
        if map.len() > MAX_TRACKED {
            let cutoff = now - 2 * WINDOW_MS;
            map.retain(|_, v| v.window_start_ms >= cutoff);
        }
        let win = map.entry(format!("{bucket}:{ip}")).or_insert(WindowCounter {
            window_start_ms: now,
            count: 0,
        });
        if now - win.window_start_ms > WINDOW_MS {
            win.window_start_ms = now;
            win.count = 0;
        }
        if win.count >= per_minute {
            drop(map);
            self.register_noisy(ip, now).await;
            return false;
        }
        win.count += 1;
        true
    }

    async fn is_blocked(&self, ip: &str, now: i64) -> bool {
        if self.noisy_backoff_base_secs == 0 {
            return false;
        }
        let mut noisy = self.noisy.lock().await;
        if noisy.len() > MAX_TRACKED {
            let cutoff = now - 24 * 3600 * 1000;
            noisy.retain(|_, v| v.last_hit_ms >= cutoff);
        }
        noisy.get(ip).is_some_and(|s| s.blocked_until_ms > now)
    }

    async fn register_noisy(&self, ip: &str, now: i64) {
        if self.noisy_backoff_base_secs == 0 {
            return;
        }
        let mut noisy = self.noisy.lock().await;
        let entry = noisy.entry(ip.to_string()).or_insert(NoisyState {
            strikes: 0,
            blocked_until_ms: 0,
            last_hit_ms: now,
        });
        if now - entry.last_hit_ms > 10 * WINDOW_MS {
            entry.strikes = 0;
        }
        entry.strikes = entry.strikes.saturating_add(1);
        let shift = entry.strikes.saturating_sub(1).min(10);
        let backoff = self
            .noisy_backoff_base_secs
            .saturating_mul(1u64 << shift)
            .min(self.noisy_backoff_max_secs.max(self.noisy_backoff_base_secs));
        entry.blocked_until_ms = now + (backoff as i64).saturating_mul(1000);
        entry.last_hit_ms = now;
    }
}

/// Address used for rate limiting. Proxy headers are honoured only when the
/// deployment puts a trusted reverse proxy in front that overwrites them.
pub fn client_ip(trust_proxy_headers: bool, peer: &SocketAddr, headers: &HeaderMap) -> String {
    if trust_proxy_headers {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        if let Some(ip) = header("X-Real-IP").and_then(parse_ip) {
            return ip;
        }
        if let Some(ip) = header("X-Forwarded-For").and_then(|v| v.split(',').find_map(parse_ip)) {
            return ip;
        }
    }
    peer.ip().to_string()
}

fn parse_ip(raw: &str) -> Option<String> {
    let s = raw.trim().trim_matches('"');
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Some(ip.to_string());
    }
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr.ip().to_string());
    }
    None
}
