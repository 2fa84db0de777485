use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use super::{FeedFailure, FetchError, Shared};
use crate::entity::{feed, item, Entity, Feed, SqlTime};
use crate::store::Store;
use crate::{parse, quirks};

const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

// Some hosts penalise an empty user agent; Reddit in particular tells a
// bare client to retry in a few seconds forever.
const USER_AGENT: &str = "Wget/1.19.5 (freebsd11.1)";

// Cloudflare challenge pages carry one of these titles in the first few
// hundred bytes.
const WAF_TITLES: [&str; 2] =
    ["<title>Attention Required! | Cloudflare</title>", "<title>Just a moment...</title>"];

/// One worker owns exactly one feed: fetch, parse, merge, persist, sleep,
/// repeat. On failure it records `failing_since`, reports to the
/// supervisor, and exits; the supervisor resumes it after backoff.
pub(super) struct Worker {
    feed: Feed,
    store: Store,
    client: reqwest::Client,
    shared: Arc<Shared>,
    kill: watch::Receiver<bool>,
    rerun: mpsc::Receiver<()>,
    errors: mpsc::Sender<FeedFailure>,
}

impl Worker {
    pub(super) fn new(
        feed: Feed,
        store: Store,
        client: reqwest::Client,
        shared: Arc<Shared>,
        kill: watch::Receiver<bool>,
        rerun: mpsc::Receiver<()>,
        errors: mpsc::Sender<FeedFailure>,
    ) -> Self {
        Self { feed, store, client, shared, kill, rerun, errors }
    }

    pub(super) async fn run(mut self) {
        tracing::debug!(feed = %self.feed, "worker running");

        loop {
            // The feed may have been edited; the supervisor's map is the
            // source of truth. Absence means we were reconciled away.
            let Some(current) = self.shared.feed(self.feed.id()) else {
                tracing::debug!(feed = %self.feed, "worker stopping, feed removed");
                return;
            };
            self.feed = current;

            match self.poll().await {
                Ok(Some(sleep)) => {
                    self.shared.reset_backoff(self.feed.id());
                    if !self.wait(sleep).await {
                        tracing::debug!(feed = %self.feed, "worker killed");
                        return;
                    }
                }
                Ok(None) => {
                    tracing::debug!(feed = %self.feed, "worker killed mid-fetch");
                    return;
                }
                Err(error) => {
                    self.fail(error).await;
                    return;
                }
            }
        }
    }

    /// Restart entry point after a failure: park until the backoff delay
    /// elapses or someone pokes us, then resume the normal loop.
    pub(super) async fn run_after(mut self, delay: Duration) {
        tracing::debug!(feed = %self.feed, ?delay, "worker parked for backoff");

        let resume = tokio::select! {
            _ = self.kill.changed() => false,
            poke = self.rerun.recv() => poke.is_some(),
            _ = self.shared.rerun_failing.notified() => true,
            _ = tokio::time::sleep(delay) => true,
        };

        if resume {
            self.run().await;
        } else {
            tracing::debug!(feed = %self.feed, "worker killed before restart");
        }
    }

    fn killed(&self) -> bool {
        *self.kill.borrow() || self.kill.has_changed().is_err()
    }

    /// One full iteration. `Ok(None)` means the worker observed its kill
    /// signal and must return without writing.
    async fn poll(&mut self) -> Result<Option<Duration>, FetchError> {
        let body = if self.feed.url.starts_with('!') {
            self.run_command().await?
        } else {
            self.fetch_http().await?
        };
        let Some(body) = body else { return Ok(None) };

        let body = quirks::rewrite_body(&self.feed, body);
        if self.killed() {
            return Ok(None);
        }

        if looks_like_waf_challenge(&body) {
            return Err(FetchError::Waf);
        }

        let parsed = parse::parse_feed(&body).inspect_err(|error| {
            tracing::error!(feed = %self.feed, %error, "failed to parse feed document");
            tracing::warn!(body = %String::from_utf8_lossy(&body), "offending body");
        })?;

        let merge = feed::merge_parsed(&parsed);
        self.feed = self.store.mutate(self.feed.id(), |f| Ok(merge(f))).await?;

        let inserted = self.store.insert_items(&item::build_items(&self.feed, &parsed)).await?;
        if inserted > 0 {
            tracing::info!(feed = %self.feed, inserted, "new items");
        }

        self.feed = self
            .store
            .mutate(self.feed.id(), |f| Ok(feed::set_fetch_success(f)))
            .await?;

        Ok(Some(self.sleep_duration(&parsed)))
    }

    /// `!command` feeds: run the command through the shell and treat its
    /// stdout as the document. Serialised per executable so one scraper
    /// binary is never run concurrently with itself, except that
    /// `!rss-scrapers <site>` keys on the first two tokens to let that one
    /// helper serve many feeds in parallel.
    async fn run_command(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        let key = command_lock_key(&self.feed.url);
        let lock = self.shared.host_lock(&key);

        let _guard = tokio::select! {
            guard = lock.lock() => guard,
            _ = self.kill.changed() => return Ok(None),
        };
        if self.killed() {
            return Ok(None);
        }

        tracing::debug!(feed = %self.feed, "running feed command");
        let command = self.feed.url[1..].to_owned();
        let run = tokio::process::Command::new("sh").arg("-c").arg(&command).output();

        let output = tokio::select! {
            output = run => output.map_err(|e| FetchError::Command(e.to_string()))?,
            _ = self.kill.changed() => return Ok(None),
        };

        if !output.status.success() {
            tracing::error!(
                feed = %self.feed,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "feed command failed"
            );
            return Err(FetchError::Command(output.status.to_string()));
        }

        Ok(Some(output.stdout))
    }

    /// HTTP(S) feeds: serialise per DNS host, honour the quirks host delay,
    /// and stream the body in with a hard size cap.
    async fn fetch_http(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        let host = http_lock_key(&self.feed.url);
        let lock = self.shared.host_lock(&host);

        let _guard = tokio::select! {
            guard = lock.lock() => guard,
            _ = self.kill.changed() => return Ok(None),
        };
        if self.killed() {
            return Ok(None);
        }

        if let Some(delay) = quirks::host_delay(&host) {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.kill.changed() => return Ok(None),
            }
        }

        let fetch_timeout = self.shared.options.fetch_timeout;
        let request = self
            .client
            .get(&self.feed.url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .header(reqwest::header::USER_AGENT, USER_AGENT);

        let fetch = async move {
            let response = tokio::time::timeout(fetch_timeout, request.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            if !response.status().is_success() {
                return Err(FetchError::Status(response.status().as_u16()));
            }

            read_limited(response, MAX_BODY_SIZE).await
        };

        tokio::select! {
            body = fetch => body.map(Some),
            _ = self.kill.changed() => Ok(None),
        }
    }

    /// Records the failure and hands the worker back to the supervisor.
    /// Never writes after kill; the store refusing with `Closed` during
    /// shutdown is routine and not worth a log line.
    async fn fail(&mut self, error: FetchError) {
        if self.killed() {
            return;
        }
        tracing::error!(feed = %self.feed, %error, "fetch failed");

        let failed = feed::set_fetch_failed(SqlTime::now());
        match self.store.mutate(self.feed.id(), |f| Ok(failed(f))).await {
            Ok(updated) => self.feed = updated,
            Err(crate::store::StoreError::Closed) => {}
            Err(store_error) => {
                tracing::error!(feed = %self.feed, error = %store_error, "failed to record failure");
            }
        }

        let failure = FeedFailure { feed_id: self.feed.id(), error };
        tokio::select! {
            _ = self.errors.send(failure) => {}
            _ = self.kill.changed() => {}
        }
    }

    /// Sleeps until the next poll is due, a rerun is requested, or the
    /// worker is killed. Returns false on kill.
    async fn wait(&mut self, sleep: Duration) -> bool {
        tracing::debug!(feed = %self.feed, ?sleep, "waiting until next poll");
        tokio::select! {
            _ = self.kill.changed() => false,
            poke = self.rerun.recv() => poke.is_some(),
            _ = tokio::time::sleep(sleep) => true,
        }
    }

    // TTL can stretch the cadence but never shrink it below the floor.
    fn sleep_duration(&self, parsed: &parse::ParsedFeed) -> Duration {
        let floor = self.shared.options.min_poll_period;
        match parsed.ttl_minutes {
            Some(minutes) => floor.max(Duration::from_secs(u64::from(minutes) * 60)),
            None => floor,
        }
    }
}

fn looks_like_waf_challenge(body: &[u8]) -> bool {
    if body.len() < 500 {
        return false;
    }
    let head = String::from_utf8_lossy(&body[..500]);
    WAF_TITLES.iter().any(|title| head.contains(title))
}

fn command_lock_key(url: &str) -> String {
    let tokens: Vec<&str> = url.splitn(3, ' ').collect();
    if tokens[0] == "!rss-scrapers" && tokens.len() > 2 {
        format!("{} {}", tokens[0], tokens[1])
    } else {
        tokens[0].to_owned()
    }
}

fn http_lock_key(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_else(|| {
            tracing::error!(url, "feed url has no parseable host");
            String::new()
        })
}

async fn read_limited(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, FetchError> {
    if let Some(length) = response.content_length() {
        if length as usize > limit {
            return Err(FetchError::TooLarge);
        }
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if body.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::TooLarge);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_keys_on_executable() {
        assert_eq!(command_lock_key("!my-scraper --feed x"), "!my-scraper");
        assert_eq!(command_lock_key("!my-scraper"), "!my-scraper");
    }

    #[test]
    fn rss_scrapers_keys_on_two_tokens() {
        assert_eq!(
            command_lock_key("!rss-scrapers somesite --arg more"),
            "!rss-scrapers somesite"
        );
        // Only the executable when there is nothing after the site
        assert_eq!(command_lock_key("!rss-scrapers somesite"), "!rss-scrapers");
    }

    #[test]
    fn http_keys_on_literal_host() {
        assert_eq!(http_lock_key("https://www.example.com/feed"), "www.example.com");
        assert_eq!(http_lock_key("https://feeds.example.com/rss"), "feeds.example.com");
        assert_eq!(http_lock_key("not a url"), "");
    }

    #[test]
    fn small_bodies_are_never_waf_challenges() {
        assert!(!looks_like_waf_challenge(b"<title>Just a moment...</title>"));

        let mut page = b"<html><head><title>Just a moment...</title></head>".to_vec();
        page.resize(4096, b' ');
        assert!(looks_like_waf_challenge(&page));
    }
}
