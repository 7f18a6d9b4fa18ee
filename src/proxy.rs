//! Proxy clearing for direct connections. Grounded on
//! `original_source/main.py`'s `proxy_keys` save/remove/restore blocks in
//! `fetch_board_snapshot`/`get_token`/`handle_websocket`; spec §6 requires
//! the painter to force direct connections by clearing HTTP_PROXY/
//! HTTPS_PROXY/ALL_PROXY (any case) for the duration of its traffic and to
//! extend NO_PROXY to cover the service host and loopback.

use std::env;

const PROXY_KEYS: &[&str] = &[
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "ALL_PROXY",
    "all_proxy",
];

/// RAII guard: clears proxy env vars on construction, restores the saved
/// values (only the ones that existed) on drop. `std::env::set_var` is
/// process-global, so callers must serialize use of this guard — the
/// painter only ever calls it from the single supervisor task at startup
/// and from the periodic snapshot-retry path, never concurrently.
pub struct DirectConnectionGuard {
    saved: Vec<(&'static str, String)>,
    saved_no_proxy: Option<String>,
}

impl DirectConnectionGuard {
    pub fn install(host: &str) -> Self {
        let mut saved = Vec::new();
        for &key in PROXY_KEYS {
            if let Ok(value) = env::var(key) {
                saved.push((key, value));
                // SAFETY: single-threaded install/restore pairing, see struct doc.
                unsafe { env::remove_var(key) };
            }
        }

        let saved_no_proxy = env::var("NO_PROXY").ok();
        let mut no_proxy = saved_no_proxy.clone().unwrap_or_default();
        for extra in ["localhost", "127.0.0.1", host] {
            if !no_proxy.split(',').any(|existing| existing == extra) {
                if !no_proxy.is_empty() {
                    no_proxy.push(',');
                }
                no_proxy.push_str(extra);
            }
        }
        unsafe { env::set_var("NO_PROXY", no_proxy) };

        Self {
            saved,
            saved_no_proxy,
        }
    }
}

impl Drop for DirectConnectionGuard {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            unsafe { env::set_var(key, value) };
        }
        match &self.saved_no_proxy {
            Some(value) => unsafe { env::set_var("NO_PROXY", value) },
            None => unsafe { env::remove_var("NO_PROXY") },
        }
    }
}
