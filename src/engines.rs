#![forbid(unsafe_code)]

//! The tutorial generation engines and their dispatch policy.
//!
//! Two interchangeable upstream summarizers sit behind the [`Summarizer`]
//! trait: BibiGPT turns a video URL into one complete summary, SiliconFlow
//! streams a tutorial generated from subtitle text. The [`EngineStack`]
//! tries them in order and short-circuits on the first usable result;
//! engines that cannot run (missing credential, missing input, upstream
//! hiccup) step aside silently, while real rejections from the engine that
//! did run are surfaced to the client.

use anyhow::anyhow;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::Settings;
use crate::prompt::{self, SYSTEM_PROMPT};
use crate::stream::TokenStream;
use crate::subtitles;
use crate::think::strip_think_blocks;

const BIBIGPT_BASE: &str = "https://api.bibigpt.co";
const SILICONFLOW_BASE: &str = "https://api.siliconflow.cn/v1";

/// Current SiliconFlow model. Free tier, OpenAI-compatible; swap here when a
/// better free model ships.
pub const SILICONFLOW_MODEL: &str = "Qwen/Qwen3-8B";

/// Bound on upstream error text quoted back to the client.
const UPSTREAM_ERROR_CHARS: usize = 200;

/// One tutorial generation request, as posted by the frontend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TutorialRequest {
    pub subtitle_url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub video_url: Option<String>,
}

/// What a successful engine hands back: either one complete text (replayed
/// through the artificial chunker) or a live upstream token stream.
pub enum EngineOutcome {
    Complete(String),
    Stream(TokenStream),
}

// Manual impl: the boxed stream has no Debug of its own.
impl std::fmt::Debug for EngineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineOutcome::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            EngineOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// No subtitle text and no description; user-correctable, HTTP 400.
    #[error("该视频没有字幕，无法生成教程。请选择有字幕的视频。")]
    NoCaptions,
    /// Required credential missing; operator-correctable, HTTP 500.
    #[error("AI 服务未配置。")]
    Unconfigured,
    /// The engine that ran rejected the request; HTTP 502.
    #[error("AI 引擎调用失败: {0}")]
    UpstreamRejected(String),
    /// This engine could not produce a result; the dispatcher moves on.
    #[error("engine unavailable: {0}")]
    Unavailable(#[from] anyhow::Error),
}

/// A summarization strategy. Implementations must not leak partial output:
/// either a usable [`EngineOutcome`] or an error.
#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(&self, request: &TutorialRequest) -> Result<EngineOutcome, EngineError>;
}

/// Ordered list of summarizers; first usable result wins.
pub struct EngineStack {
    engines: Vec<Box<dyn Summarizer>>,
}

impl EngineStack {
    pub fn new(engines: Vec<Box<dyn Summarizer>>) -> Self {
        Self { engines }
    }

    pub fn from_settings(settings: &Settings, client: reqwest::Client) -> Self {
        Self::new(vec![
            Box::new(BibiGpt::new(client.clone(), settings.bibigpt_token.clone())),
            Box::new(SiliconFlow::new(client, settings.siliconflow_key.clone())),
        ])
    }

    /// Runs the engines in order. `Unavailable` moves on to the next engine;
    /// every other error is final for this request.
    pub async fn dispatch(&self, request: &TutorialRequest) -> Result<EngineOutcome, EngineError> {
        let mut last = None;
        for engine in &self.engines {
            match engine.attempt(request).await {
                Ok(outcome) => {
                    info!("tutorial request served by engine {}", engine.name());
                    return Ok(outcome);
                }
                Err(EngineError::Unavailable(err)) => {
                    debug!("engine {} unavailable: {err:#}", engine.name());
                    last = Some(EngineError::Unavailable(err));
                }
                Err(err) => return Err(err),
            }
        }
        Err(last
            .unwrap_or_else(|| EngineError::Unavailable(anyhow!("no summarization engine configured"))))
    }
}

#[derive(Debug, Default, Deserialize)]
struct BibiGptResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    summary: Option<String>,
}

/// Engine A. One call does subtitle extraction and summarization on the
/// provider side; the result comes back complete.
pub struct BibiGpt {
    client: reqwest::Client,
    token: Option<String>,
    base: String,
}

impl BibiGpt {
    pub fn new(client: reqwest::Client, token: Option<String>) -> Self {
        Self {
            client,
            token,
            base: BIBIGPT_BASE.to_string(),
        }
    }

    fn usable_summary(response: BibiGptResponse) -> Option<String> {
        if !response.success {
            return None;
        }
        let summary = strip_think_blocks(response.summary.as_deref()?);
        if summary.is_empty() { None } else { Some(summary) }
    }

    async fn summarize_post(&self, token: &str, video_url: &str) -> anyhow::Result<reqwest::Response> {
        let body = json!({
            "url": video_url,
            "includeDetail": true,
            "promptConfig": {
                "showEmoji": true,
                "detailLevel": 800,
                "outputLanguage": "zh-CN",
            },
        });
        Ok(self
            .client
            .post(format!("{}/api/v1/summarizeWithConfig", self.base))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?)
    }

    /// Legacy GET endpoint used when the POST shape is rejected. The
    /// provider puts the credential in the URL path here; that is their
    /// contract, not ours to change.
    async fn summarize_get(&self, token: &str, video_url: &str) -> anyhow::Result<String> {
        let url = format!(
            "{}/api/open/{}?url={}",
            self.base,
            token,
            urlencoding::encode(video_url)
        );
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("BibiGPT GET fallback returned {}", response.status()));
        }
        Self::usable_summary(response.json().await?)
            .ok_or_else(|| anyhow!("BibiGPT GET fallback returned no summary"))
    }
}

#[async_trait]
impl Summarizer for BibiGpt {
    fn name(&self) -> &'static str {
        "bibigpt"
    }

    async fn attempt(&self, request: &TutorialRequest) -> Result<EngineOutcome, EngineError> {
        let Some(token) = self.token.as_deref() else {
            return Err(anyhow!("BIBIGPT_API_TOKEN not configured").into());
        };
        let video_url = request
            .video_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow!("request carries no video url"))?;

        let response = self
            .summarize_post(token, video_url)
            .await
            .map_err(EngineError::Unavailable)?;

        let summary = if response.status().is_success() {
            let parsed: BibiGptResponse = response
                .json()
                .await
                .map_err(|err| EngineError::Unavailable(err.into()))?;
            Self::usable_summary(parsed)
                .ok_or_else(|| anyhow!("BibiGPT returned no usable summary"))?
        } else {
            debug!("BibiGPT POST rejected with {}, trying GET", response.status());
            self.summarize_get(token, video_url).await?
        };

        Ok(EngineOutcome::Complete(summary))
    }
}

/// Engine B. We assemble the prompt from subtitles ourselves and stream the
/// completion back token by token.
pub struct SiliconFlow {
    client: reqwest::Client,
    key: Option<String>,
    base: String,
}

impl SiliconFlow {
    pub fn new(client: reqwest::Client, key: Option<String>) -> Self {
        Self {
            client,
            key,
            base: SILICONFLOW_BASE.to_string(),
        }
    }

    /// Subtitle document first, description second; `None` when neither
    /// yields text.
    async fn resolve_source_text(&self, request: &TutorialRequest) -> Option<String> {
        if let Some(url) = request
            .subtitle_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            && let Some(text) = subtitles::fetch_subtitle_text(&self.client, url).await
        {
            return Some(text);
        }
        request
            .description
            .clone()
            .filter(|text| !text.trim().is_empty())
    }
}

#[async_trait]
impl Summarizer for SiliconFlow {
    fn name(&self) -> &'static str {
        "siliconflow"
    }

    async fn attempt(&self, request: &TutorialRequest) -> Result<EngineOutcome, EngineError> {
        let source_text = self
            .resolve_source_text(request)
            .await
            .ok_or(EngineError::NoCaptions)?;
        let key = self.key.as_deref().ok_or(EngineError::Unconfigured)?;

        let prompt =
            prompt::build_tutorial_prompt(&source_text, request.title.as_deref().unwrap_or(""));
        let body = json!({
            "model": SILICONFLOW_MODEL,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "stream": true,
            "temperature": 0.7,
            "max_tokens": 4096,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base))
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|err| EngineError::Unavailable(err.into()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::UpstreamRejected(truncate_chars(
                &format!("HTTP {status} {}", detail.trim()),
                UPSTREAM_ERROR_CHARS,
            )));
        }

        let stream: TokenStream = response.bytes_stream().map_err(anyhow::Error::from).boxed();
        Ok(EngineOutcome::Stream(stream))
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{OutboundEvent, relay_chat_stream};
    use mockito::Matcher;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedEngine {
        calls: Arc<AtomicUsize>,
        result: fn() -> Result<EngineOutcome, EngineError>,
    }

    impl FixedEngine {
        fn boxed(result: fn() -> Result<EngineOutcome, EngineError>) -> (Box<Self>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Box::new(Self {
                    calls: calls.clone(),
                    result,
                }),
                calls,
            )
        }
    }

    #[async_trait]
    impl Summarizer for FixedEngine {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn attempt(
            &self,
            _request: &TutorialRequest,
        ) -> Result<EngineOutcome, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn complete_ok() -> Result<EngineOutcome, EngineError> {
        Ok(EngineOutcome::Complete("summary".into()))
    }

    fn unavailable() -> Result<EngineOutcome, EngineError> {
        Err(EngineError::Unavailable(anyhow!("down")))
    }

    fn no_captions() -> Result<EngineOutcome, EngineError> {
        Err(EngineError::NoCaptions)
    }

    #[test]
    fn outcome_debug_covers_both_variants() {
        let complete = EngineOutcome::Complete("summary".into());
        assert_eq!(format!("{complete:?}"), "Complete(\"summary\")");

        let stream = EngineOutcome::Stream(futures::stream::empty().boxed());
        assert_eq!(format!("{stream:?}"), "Stream(..)");
    }

    #[tokio::test]
    async fn first_engine_success_short_circuits() {
        let (primary, _) = FixedEngine::boxed(complete_ok);
        let (secondary, secondary_calls) = FixedEngine::boxed(complete_ok);
        let stack = EngineStack::new(vec![primary, secondary]);

        let outcome = stack.dispatch(&TutorialRequest::default()).await.unwrap();
        assert!(matches!(outcome, EngineOutcome::Complete(text) if text == "summary"));
        // The fallback engine must never have been invoked.
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unavailable_engine_falls_through_to_next() {
        let (primary, primary_calls) = FixedEngine::boxed(unavailable);
        let (secondary, secondary_calls) = FixedEngine::boxed(complete_ok);
        let stack = EngineStack::new(vec![primary, secondary]);
        let outcome = stack.dispatch(&TutorialRequest::default()).await.unwrap();
        assert!(matches!(outcome, EngineOutcome::Complete(_)));
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_error_stops_dispatch() {
        let (primary, _) = FixedEngine::boxed(unavailable);
        let (secondary, _) = FixedEngine::boxed(no_captions);
        let stack = EngineStack::new(vec![primary, secondary]);
        let err = stack.dispatch(&TutorialRequest::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::NoCaptions));
    }

    #[tokio::test]
    async fn exhausted_stack_reports_unavailable() {
        let (only, _) = FixedEngine::boxed(unavailable);
        let stack = EngineStack::new(vec![only]);
        let err = stack.dispatch(&TutorialRequest::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    fn video_request() -> TutorialRequest {
        TutorialRequest {
            video_url: Some("https://www.bilibili.com/video/BV1xx411c7mD".into()),
            ..TutorialRequest::default()
        }
    }

    fn bibigpt_with_base(base: String, token: Option<&str>) -> BibiGpt {
        BibiGpt {
            client: reqwest::Client::new(),
            token: token.map(String::from),
            base,
        }
    }

    #[tokio::test]
    async fn bibigpt_without_token_is_unavailable() {
        let engine = bibigpt_with_base("http://127.0.0.1:1".into(), None);
        let err = engine.attempt(&video_request()).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    #[tokio::test]
    async fn bibigpt_without_video_url_is_unavailable() {
        let engine = bibigpt_with_base("http://127.0.0.1:1".into(), Some("tok"));
        let err = engine.attempt(&TutorialRequest::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    #[tokio::test]
    async fn bibigpt_post_success_strips_think_blocks() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/summarizeWithConfig")
            .with_status(200)
            .with_body(r#"{"success": true, "summary": "<think>hidden</think>  教程内容  "}"#)
            .create_async()
            .await;

        let engine = bibigpt_with_base(server.url(), Some("tok"));
        let outcome = engine.attempt(&video_request()).await.unwrap();
        assert!(matches!(outcome, EngineOutcome::Complete(text) if text == "教程内容"));
    }

    #[tokio::test]
    async fn bibigpt_falls_back_to_get_when_post_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/summarizeWithConfig")
            .with_status(500)
            .create_async()
            .await;
        server
            .mock("GET", "/api/open/tok")
            .match_query(Matcher::UrlEncoded(
                "url".into(),
                "https://www.bilibili.com/video/BV1xx411c7mD".into(),
            ))
            .with_status(200)
            .with_body(r#"{"success": true, "summary": "via get"}"#)
            .create_async()
            .await;

        let engine = bibigpt_with_base(server.url(), Some("tok"));
        let outcome = engine.attempt(&video_request()).await.unwrap();
        assert!(matches!(outcome, EngineOutcome::Complete(text) if text == "via get"));
    }

    #[tokio::test]
    async fn bibigpt_unusable_result_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/summarizeWithConfig")
            .with_status(200)
            .with_body(r#"{"success": false}"#)
            .create_async()
            .await;

        let engine = bibigpt_with_base(server.url(), Some("tok"));
        let err = engine.attempt(&video_request()).await.unwrap_err();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }

    fn siliconflow_with_base(base: String, key: Option<&str>) -> SiliconFlow {
        SiliconFlow {
            client: reqwest::Client::new(),
            key: key.map(String::from),
            base,
        }
    }

    fn described_request() -> TutorialRequest {
        TutorialRequest {
            description: Some("视频简介".into()),
            title: Some("标题".into()),
            ..TutorialRequest::default()
        }
    }

    #[tokio::test]
    async fn siliconflow_without_source_text_is_no_captions() {
        let engine = siliconflow_with_base("http://127.0.0.1:1".into(), Some("sk"));
        let err = engine.attempt(&TutorialRequest::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::NoCaptions));
    }

    #[tokio::test]
    async fn siliconflow_without_key_is_unconfigured() {
        let engine = siliconflow_with_base("http://127.0.0.1:1".into(), None);
        let err = engine.attempt(&described_request()).await.unwrap_err();
        assert!(matches!(err, EngineError::Unconfigured));
    }

    #[tokio::test]
    async fn siliconflow_rejection_carries_truncated_detail() {
        let mut server = mockito::Server::new_async().await;
        let long_error = "e".repeat(1000);
        server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(&long_error)
            .create_async()
            .await;

        let engine = siliconflow_with_base(server.url(), Some("sk"));
        let err = engine.attempt(&described_request()).await.unwrap_err();
        match err {
            EngineError::UpstreamRejected(detail) => {
                assert!(detail.contains("401"));
                assert!(detail.chars().count() <= UPSTREAM_ERROR_CHARS);
            }
            other => panic!("expected UpstreamRejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn siliconflow_streams_filtered_tokens_end_to_end() {
        let mut server = mockito::Server::new_async().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"<think>plan</think>你好\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"世界\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        server
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": SILICONFLOW_MODEL,
                "stream": true,
            })))
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let engine = siliconflow_with_base(server.url(), Some("sk"));
        let outcome = engine.attempt(&described_request()).await.unwrap();
        let EngineOutcome::Stream(upstream) = outcome else {
            panic!("expected a token stream");
        };

        let (tx, mut rx) = tokio::sync::mpsc::channel(16);
        relay_chat_stream(upstream, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                OutboundEvent::Text("你好".into()),
                OutboundEvent::Text("世界".into()),
                OutboundEvent::Done,
            ]
        );
    }
}
