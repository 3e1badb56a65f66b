use async_trait::async_trait;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{StreamExt, stream::FuturesUnordered};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;

/// Destination of forwarded files.
#[async_trait]
pub trait FileSink: Send + Sync {
    async fn put(&self, file_name: &str, body: reqwest::Body) -> Result<(), Error>;
}

/// Forwards each file as `POST {base}/files/{file name}` with the raw bytes
/// as the request body.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpSink {
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid sink url {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!("sink url {base_url} cannot be a base")));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }

    /// The file name becomes a single percent-encoded path segment.
    pub fn file_url(&self, file_name: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("files").push(file_name);
        }
        url
    }
}

#[async_trait]
impl FileSink for HttpSink {
    async fn put(&self, file_name: &str, body: reqwest::Body) -> Result<(), Error> {
        let url = self.file_url(file_name);
        debug!("Forwarding {:?} to {}", file_name, url);

        let response = self
            .client
            .post(url)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Forwarding(format!("{file_name}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Forwarding(format!(
                "{file_name}: downstream answered {status}"
            )));
        }

        let ack = response
            .bytes()
            .await
            .map_err(|e| Error::Forwarding(format!("{file_name}: {e}")))?;
        debug!("Downstream accepted {:?}: {:?}", file_name, String::from_utf8_lossy(&ack));
        Ok(())
    }
}

/// One file ready to leave the process.
#[derive(Debug)]
pub struct Upload {
    pub file_name: String,
    pub body: reqwest::Body,
}

impl Upload {
    pub fn new(file_name: impl Into<String>, body: impl Into<reqwest::Body>) -> Self {
        Self {
            file_name: file_name.into(),
            body: body.into(),
        }
    }
}

/// Issues every forward at once and waits for all of them to settle.
///
/// A failure never cancels the others. If any forward failed the whole batch
/// is reported as failed, even though some files may already have been
/// accepted downstream. Names are returned in completion order.
pub async fn forward_all(sink: &dyn FileSink, uploads: Vec<Upload>) -> Result<Vec<String>, Error> {
    let total = uploads.len();
    let mut pending: FuturesUnordered<_> = uploads
        .into_iter()
        .map(|upload| async move {
            let result = sink.put(&upload.file_name, upload.body).await;
            (upload.file_name, result)
        })
        .collect();

    let mut uploaded = Vec::with_capacity(total);
    let mut failed = Vec::new();
    while let Some((file_name, result)) = pending.next().await {
        match result {
            Ok(()) => uploaded.push(file_name),
            Err(e) => {
                error!("Forwarding {:?} failed: {}", file_name, e);
                failed.push(file_name);
            }
        }
    }

    if failed.is_empty() {
        debug!("Forwarded {} files: {:?}", total, uploaded);
        Ok(uploaded)
    } else {
        Err(Error::Forwarding(format!(
            "{} of {} files were not accepted: {}",
            failed.len(),
            total,
            failed.join(", ")
        )))
    }
}

/// Body of a successful upload response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub uploaded: Vec<String>,
}

impl IntoResponse for UploadSummary {
    fn into_response(self) -> Response {
        (StatusCode::CREATED, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::RecordingSink;
    use maplit::hashset;
    use std::collections::HashSet;

    #[test]
    fn test_file_url_is_percent_encoded() {
        let sink = HttpSink::new("http://127.0.0.1:8000").unwrap();
        assert_eq!(
            sink.file_url("my photo #1.png").as_str(),
            "http://127.0.0.1:8000/files/my%20photo%20%231.png"
        );
        assert_eq!(
            sink.file_url("a/b.png").as_str(),
            "http://127.0.0.1:8000/files/a%2Fb.png"
        );

        let sink = HttpSink::new("http://sink.local/api/").unwrap();
        assert_eq!(
            sink.file_url("x.gif").as_str(),
            "http://sink.local/api/files/x.gif"
        );
    }

    #[test]
    fn test_rejects_unusable_sink_url() {
        assert!(matches!(HttpSink::new("not a url"), Err(Error::Config(_))));
        assert!(matches!(
            HttpSink::new("mailto:files@example.com"),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_all_reports_every_name() {
        let sink = RecordingSink::default();
        let uploads = vec![
            Upload::new("sky.png", "one"),
            Upload::new("me.jpg", "two"),
        ];

        let uploaded = forward_all(&sink, uploads).await.unwrap();

        let uploaded: HashSet<_> = uploaded.into_iter().collect();
        assert_eq!(uploaded, hashset! {"sky.png".to_string(), "me.jpg".to_string()});
        assert_eq!(sink.received().len(), 2);
    }

    #[tokio::test]
    async fn test_forward_all_waits_for_every_call() {
        let sink = RecordingSink::failing(["sky.png"]);
        let uploads = vec![
            Upload::new("sky.png", "one"),
            Upload::new("me.jpg", "two"),
        ];

        let err = forward_all(&sink, uploads).await.unwrap_err();

        match err {
            Error::Forwarding(msg) => {
                assert!(msg.contains("1 of 2"), "{msg}");
                assert!(msg.contains("sky.png"), "{msg}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        let attempted: HashSet<_> = sink.attempted().into_iter().collect();
        assert_eq!(attempted, hashset! {"sky.png".to_string(), "me.jpg".to_string()});
    }

    #[tokio::test]
    async fn test_forward_nothing() {
        let sink = RecordingSink::default();
        assert_eq!(forward_all(&sink, Vec::new()).await.unwrap(), Vec::<String>::new());
    }
}
