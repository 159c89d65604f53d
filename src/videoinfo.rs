#![forbid(unsafe_code)]

//! Video metadata lookup for pasted Bilibili / YouTube links.
//!
//! Bilibili links resolve to a BV id (following `b23.tv` short links through
//! their redirect) and then hit the public view API; YouTube links go
//! through the noembed oembed service. Bilibili endpoints check referer and
//! user agent, so requests carry browser-looking headers.

use anyhow::Context;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const BROWSER_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const BILIBILI_REFERER: &str = "https://www.bilibili.com";

const BILIBILI_VIEW_API: &str = "https://api.bilibili.com/x/web-interface/view";
const NOEMBED_API: &str = "https://noembed.com/embed";

static BVID: Lazy<Regex> = Lazy::new(|| Regex::new(r"BV[a-zA-Z0-9]+").expect("valid BV regex"));

#[derive(Debug, Error)]
pub enum VideoInfoError {
    #[error("无法解析 BV 号")]
    BvidNotFound,
    /// Upstream said no; message is forwarded to the user.
    #[error("{0}")]
    Rejected(String),
    #[error("YouTube 链接无效")]
    InvalidYouTube,
    #[error("不支持的链接格式")]
    UnsupportedUrl,
    #[error("服务器错误")]
    Fetch(#[from] anyhow::Error),
}

/// Normalized metadata for either platform. YouTube lookups only fill the
/// oembed subset, so most fields are optional.
#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub platform: &'static str,
    pub title: String,
    pub uploader: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub views: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bvid: Option<String>,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct BiliViewResponse {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<BiliViewData>,
}

#[derive(Debug, Deserialize)]
struct BiliViewData {
    title: String,
    #[serde(default)]
    desc: String,
    #[serde(default)]
    pic: String,
    #[serde(default)]
    duration: u64,
    owner: BiliOwner,
    stat: BiliStat,
}

#[derive(Debug, Deserialize)]
struct BiliOwner {
    name: String,
    #[serde(default)]
    face: String,
}

#[derive(Debug, Deserialize)]
struct BiliStat {
    #[serde(default)]
    view: u64,
    #[serde(default)]
    like: u64,
}

pub fn extract_bvid(url: &str) -> Option<String> {
    if !url.contains("BV") {
        return None;
    }
    BVID.find(url).map(|m| m.as_str().to_string())
}

fn is_bilibili(url: &str) -> bool {
    url.contains("bilibili.com") || url.contains("b23.tv")
}

fn is_youtube(url: &str) -> bool {
    url.contains("youtube.com") || url.contains("youtu.be")
}

/// Looks up metadata for any supported link.
pub async fn lookup_video_info(
    client: &reqwest::Client,
    url: &str,
) -> Result<VideoInfo, VideoInfoError> {
    if is_bilibili(url) {
        return lookup_bilibili(client, url).await;
    }
    if is_youtube(url) {
        return lookup_youtube(client, url).await;
    }
    Err(VideoInfoError::UnsupportedUrl)
}

async fn lookup_bilibili(
    client: &reqwest::Client,
    url: &str,
) -> Result<VideoInfo, VideoInfoError> {
    let bvid = match extract_bvid(url) {
        Some(bvid) => bvid,
        None if url.contains("b23.tv") => resolve_short_link(client, url)
            .await?
            .ok_or(VideoInfoError::BvidNotFound)?,
        None => return Err(VideoInfoError::BvidNotFound),
    };

    let response: BiliViewResponse = client
        .get(BILIBILI_VIEW_API)
        .query(&[("bvid", bvid.as_str())])
        .header("User-Agent", BROWSER_UA)
        .header("Referer", BILIBILI_REFERER)
        .send()
        .await
        .context("calling bilibili view API")?
        .json()
        .await
        .context("parsing bilibili view response")?;

    bilibili_info_from(bvid, response)
}

/// `b23.tv` links redirect to the full video URL; the BV id sits in the
/// final location.
async fn resolve_short_link(
    client: &reqwest::Client,
    url: &str,
) -> Result<Option<String>, VideoInfoError> {
    let response = client
        .get(url)
        .header("User-Agent", BROWSER_UA)
        .send()
        .await
        .context("resolving b23.tv short link")?;
    let final_url = response.url().as_str().to_string();
    debug!("short link {url} resolved to {final_url}");
    Ok(extract_bvid(&final_url))
}

fn bilibili_info_from(
    bvid: String,
    response: BiliViewResponse,
) -> Result<VideoInfo, VideoInfoError> {
    if response.code != 0 {
        let message = if response.message.is_empty() {
            "B站 API 调用失败".to_string()
        } else {
            response.message
        };
        return Err(VideoInfoError::Rejected(message));
    }
    let data = response
        .data
        .ok_or_else(|| VideoInfoError::Rejected("B站 API 调用失败".to_string()))?;

    Ok(VideoInfo {
        platform: "bilibili",
        title: data.title,
        uploader: data.owner.name,
        avatar: Some(data.owner.face),
        duration: Some(data.duration),
        views: Some(data.stat.view),
        likes: Some(data.stat.like),
        description: Some(data.desc),
        thumbnail: Some(data.pic),
        url: format!("https://www.bilibili.com/video/{bvid}"),
        bvid: Some(bvid),
    })
}

async fn lookup_youtube(
    client: &reqwest::Client,
    url: &str,
) -> Result<VideoInfo, VideoInfoError> {
    let oembed: Value = client
        .get(format!("{NOEMBED_API}?url={}", urlencoding::encode(url)))
        .send()
        .await
        .context("calling noembed")?
        .json()
        .await
        .context("parsing noembed response")?;

    youtube_info_from(url, oembed)
}

fn youtube_info_from(url: &str, oembed: Value) -> Result<VideoInfo, VideoInfoError> {
    if oembed.get("error").is_some() {
        return Err(VideoInfoError::InvalidYouTube);
    }
    Ok(VideoInfo {
        platform: "youtube",
        title: oembed["title"].as_str().unwrap_or_default().to_string(),
        uploader: oembed["author_name"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        avatar: None,
        duration: None,
        views: None,
        likes: None,
        description: None,
        thumbnail: oembed["thumbnail_url"].as_str().map(str::to_string),
        bvid: None,
        url: url.to_string(),
    })
}
