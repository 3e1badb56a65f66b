//! Upload strategy that decodes the raw body itself.
//!
//! Parts are pulled from a [`Dispenser`] in body order and collected, the
//! whole set is validated once, then every file is forwarded concurrently.

use std::fmt::Display;

use axum::extract::{Request, State};
use bytes::Bytes;
use futures_util::Stream;
use log::{debug, info};

use crate::{
    AppState, CollectedPart, Dispenser, Error, FormPart, Upload, UploadLimits, UploadSummary,
    forward_all, multipart_boundary,
};

#[axum::debug_handler]
pub async fn upload(
    State(state): State<AppState>,
    request: Request,
) -> Result<UploadSummary, Error> {
    let (parts, body) = request.into_parts();
    let boundary = multipart_boundary(&parts.headers)?;

    let collected = collect(body.into_data_stream(), &boundary, state.limits).await?;
    state.schema.validate(&collected)?;

    let uploaded = forward_all(state.sink.as_ref(), into_uploads(collected)).await?;
    info!("Streamed and forwarded {:?}", uploaded);
    Ok(UploadSummary { uploaded })
}

/// Runs the dispenser to the end, keeping every part in body order.
pub async fn collect<S, E>(
    stream: S,
    boundary: &str,
    limits: UploadLimits,
) -> Result<Vec<CollectedPart>, Error>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    let mut dispenser = Dispenser::new(stream, boundary)?.with_limits(limits);
    let mut collected = Vec::new();
    while let Some(part) = dispenser.next_part().await? {
        collected.push(part.collect().await?);
    }
    debug!("Collected {} parts", collected.len());
    Ok(collected)
}

/// Only parts that carry a file leave the process.
pub(crate) fn into_uploads(parts: Vec<CollectedPart>) -> Vec<Upload> {
    parts
        .into_iter()
        .filter(|part| part.is_file())
        .map(|part| Upload::new(part.file_name, part.content))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn test_collect_keeps_body_order() {
        let body = "--b\r\n\
            Content-Disposition: form-data; name=\"profile\"; filename=\"2.png\"\r\n\
            \r\n\
            two\r\n\
            --b\r\n\
            Content-Disposition: form-data; name=\"background\"; filename=\"1.png\"\r\n\
            \r\n\
            one\r\n\
            --b--";
        let chunks: Vec<Result<Bytes, Infallible>> = body
            .as_bytes()
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let parts = collect(stream::iter(chunks), "b", UploadLimits::unlimited())
            .await
            .unwrap();

        let order: Vec<_> = parts.iter().map(|p| p.file_name.as_str()).collect();
        assert_eq!(order, vec!["2.png", "1.png"]);
    }

    #[test]
    fn test_text_parts_are_not_forwarded() {
        let parts = vec![
            CollectedPart {
                name: "background".into(),
                file_name: "sky.png".into(),
                headers: Default::default(),
                content: Bytes::from_static(b"png"),
            },
            CollectedPart {
                name: "note".into(),
                file_name: String::new(),
                headers: Default::default(),
                content: Bytes::from_static(b"hello"),
            },
        ];

        let uploads = into_uploads(parts);
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].file_name, "sky.png");
    }
}
