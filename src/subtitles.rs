#![forbid(unsafe_code)]

//! Subtitle fetching for the fallback tutorial engine.
//!
//! Bilibili subtitle documents are JSON of the form
//! `{"body": [{"content": "line"}, ...]}`. Fetch or parse failures are local:
//! the caller falls back to the video description instead.

use log::debug;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SubtitleDocument {
    #[serde(default)]
    body: Vec<SubtitleLine>,
}

#[derive(Debug, Deserialize)]
struct SubtitleLine {
    #[serde(default)]
    content: String,
}

/// Joins every caption line into one newline-separated string. Returns
/// `None` when the document is empty or not in the expected shape.
fn flatten(document: SubtitleDocument) -> Option<String> {
    if document.body.is_empty() {
        return None;
    }
    let text = document
        .body
        .into_iter()
        .map(|line| line.content)
        .collect::<Vec<_>>()
        .join("\n");
    if text.trim().is_empty() { None } else { Some(text) }
}

/// Downloads and flattens a subtitle document. Any network or parse error
/// yields `None`; the error is logged, never surfaced.
pub async fn fetch_subtitle_text(client: &reqwest::Client, url: &str) -> Option<String> {
    let document = match client.get(url).send().await {
        Ok(resp) => match resp.json::<SubtitleDocument>().await {
            Ok(document) => document,
            Err(err) => {
                debug!("subtitle document at {url} did not parse: {err}");
                return None;
            }
        },
        Err(err) => {
            debug!("subtitle fetch from {url} failed: {err}");
            return None;
        }
    };
    flatten(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Option<String> {
        serde_json::from_str::<SubtitleDocument>(raw).ok().and_then(flatten)
    }

    #[test]
    fn concatenates_caption_lines_with_newlines() {
        let raw = r#"{"body": [{"content": "你好"}, {"content": "世界"}, {"content": "end"}]}"#;
        assert_eq!(parse(raw).as_deref(), Some("你好\n世界\nend"));
    }

    #[test]
    fn empty_or_missing_body_yields_none() {
        assert!(parse(r#"{"body": []}"#).is_none());
        assert!(parse(r#"{}"#).is_none());
        assert!(parse(r#"{"body": [{"content": "  "}]}"#).is_none());
    }

    #[test]
    fn malformed_document_yields_none() {
        assert!(parse("not json").is_none());
        assert!(parse(r#"{"body": "nope"}"#).is_none());
    }

    #[tokio::test]
    async fn fetches_and_flattens_over_http() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/subs.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"body": [{"content": "a"}, {"content": "b"}]}"#)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let text = fetch_subtitle_text(&client, &format!("{}/subs.json", server.url())).await;
        assert_eq!(text.as_deref(), Some("a\nb"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_error_yields_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/subs.json")
            .with_status(500)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let text = fetch_subtitle_text(&client, &format!("{}/subs.json", server.url())).await;
        assert!(text.is_none());
    }
}
