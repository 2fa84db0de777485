//! The add-feed pipeline: URL rewrites, feed probing, and HTML feed
//! discovery for URLs that turn out to be ordinary pages.

use std::sync::LazyLock;

use axum::extract::State;
use axum::Json;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{ApiError, ApiJson, ApiResult, AppState};
use crate::entity::Feed;
use crate::parse;

#[derive(Deserialize, Debug)]
pub(super) struct Request {
    url: String,
    #[serde(default, rename = "title")]
    user_title: String,
    /// Insert even when the URL does not look like a feed. The
    /// unconditional rewrites still apply.
    #[serde(default)]
    force: bool,
}

#[derive(Serialize, Debug)]
#[serde(tag = "status", rename_all = "camelCase")]
pub(super) enum Response {
    Success { feed: Feed },
}

pub(super) async fn handle(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<Request>,
) -> ApiResult<Json<Response>> {
    let url = if req.force {
        // Even forced feeds must be plausible URLs
        parse_url(req.url.trim())?
    } else {
        probe_feed_url(&state.client, req.url.trim()).await?
    };

    let feed = state.store.insert_feed(url.as_str(), &req.user_title).await?;
    state.fetch.inform_feed_changed();
    tracing::info!(feed = %feed, "feed added");

    Ok(Json(Response::Success { feed }))
}

static YOUTUBE_CHANNEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https://www\.youtube\.com/channel/(UC[a-zA-Z0-9_-]+)").unwrap());
// Dropping the query string prevents duplicate feeds; the parameters do not
// change the documents served.
static MANGADEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https://mangadex\.org/[^?]+").unwrap());
static YANDERE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https://yande\.re/post\?(?:.*&)?tags=([^?&]+)").unwrap());

/// Rewrites that always apply, even under `force`, so they must be limited
/// to cases where the original URL is plainly wrong as a feed.
fn unconditional_rewrites(url: &str) -> String {
    if let Some(groups) = YOUTUBE_CHANNEL.captures(url) {
        return format!(
            "https://www.youtube.com/feeds/videos.xml?channel_id={}",
            &groups[1]
        );
    }
    if let Some(groups) = YANDERE.captures(url) {
        return format!(
            "https://yande.re/post/atom?tags={}",
            groups[1].trim_end_matches('+')
        );
    }
    if let Some(m) = MANGADEX.find(url) {
        return m.as_str().to_owned();
    }
    url.to_owned()
}

fn parse_url(raw: &str) -> Result<Url, ApiError> {
    let rewritten = unconditional_rewrites(raw);
    let url =
        Url::parse(&rewritten).map_err(|e| ApiError::Bad(format!("invalid url: {e}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ApiError::Bad("url scheme must be http or https".into()));
    }
    Ok(url)
}

/// Fetches the candidate URL and checks it parses as a feed. When it is an
/// HTML page instead, looks for an advertised feed link: exactly one is
/// followed (and itself verified); several is an error until a selection
/// UI exists.
async fn probe_feed_url(client: &reqwest::Client, raw: &str) -> Result<Url, ApiError> {
    let url = parse_url(raw)?;

    tracing::info!(%url, "probing candidate feed");
    let body = fetch_body(client, &url).await?;
    if parse::parse_feed(&body).is_ok() {
        return Ok(url);
    }

    tracing::info!(%url, "candidate is not a feed, scanning HTML for feed links");
    let links = feed_links_in_html(&String::from_utf8_lossy(&body));
    let href = match links.as_slice() {
        [] => return Err(ApiError::Bad("no feed found at that URL".into())),
        [href] => href,
        _ => {
            return Err(ApiError::Bad(
                "found multiple feeds in HTML, selection is unimplemented".into(),
            ))
        }
    };

    let resolved = url
        .join(href)
        .map_err(|e| ApiError::Bad(format!("advertised feed link is invalid: {e}")))?;
    let resolved = parse_url(resolved.as_str())?;

    tracing::info!(%resolved, "verifying advertised feed");
    let body = fetch_body(client, &resolved).await?;
    parse::parse_feed(&body)
        .map_err(|e| ApiError::Bad(format!("advertised feed does not parse: {e}")))?;

    Ok(resolved)
}

async fn fetch_body(client: &reqwest::Client, url: &Url) -> Result<Vec<u8>, ApiError> {
    let response = client
        .get(url.clone())
        .header(reqwest::header::CACHE_CONTROL, "no-cache")
        .header(reqwest::header::USER_AGENT, "Wget/1.19.5 (freebsd11.1)")
        .send()
        .await
        .map_err(|e| ApiError::Bad(format!("could not fetch url: {e}")))?;

    if !response.status().is_success() {
        return Err(ApiError::Bad(format!("url returned status {}", response.status())));
    }

    response
        .bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|e| ApiError::Bad(format!("could not read url: {e}")))
}

/// Scans HTML text for `<link>` tags typed as RSS or Atom and returns their
/// hrefs in document order. A string scan is plenty here; the tags appear
/// verbatim in the head of real pages.
fn feed_links_in_html(html: &str) -> Vec<String> {
    // ASCII-only lowering keeps byte offsets valid in the original text
    let lower = html.to_ascii_lowercase();
    let mut hrefs = Vec::new();
    let mut from = 0;

    while let Some(start) = lower[from..].find("<link") {
        let start = from + start;
        let Some(end) = lower[start..].find('>') else { break };
        let end = start + end;
        from = end + 1;

        let tag_lower = &lower[start..end];
        if !tag_lower.contains("application/rss+xml")
            && !tag_lower.contains("application/atom+xml")
        {
            continue;
        }

        // Slice the href out of the original-case tag
        let tag = &html[start..end];
        if let Some(href) = attribute_value(tag, tag_lower, "href") {
            hrefs.push(href);
        }
    }

    hrefs
}

fn attribute_value(tag: &str, tag_lower: &str, name: &str) -> Option<String> {
    let at = tag_lower.find(&format!("{name}="))? + name.len() + 1;
    let rest = &tag[at..];
    let quote = rest.chars().next()?;

    if quote == '"' || quote == '\'' {
        let rest = &rest[1..];
        let close = rest.find(quote)?;
        Some(rest[..close].to_owned())
    } else {
        let close = rest.find([' ', '/', '>']).unwrap_or(rest.len());
        Some(rest[..close].to_owned())
    }
}
