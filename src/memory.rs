//! Upload strategy that buffers every part in memory.

use axum::extract::{Request, State};
use log::{debug, info};

use crate::{
    AppState, CollectedPart, Error, UploadSummary, forward_all, multipart_boundary,
    stream::into_uploads,
};

#[axum::debug_handler]
pub async fn upload(
    State(state): State<AppState>,
    request: Request,
) -> Result<UploadSummary, Error> {
    let (parts, body) = request.into_parts();
    let boundary = multipart_boundary(&parts.headers)?;
    let mut multipart = multer::Multipart::with_constraints(
        body.into_data_stream(),
        boundary,
        state.limits.constraints(),
    );

    let mut collected = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        debug!("Failed to read multipart field: {}", e);
        Error::from(e)
    })? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().unwrap_or_default().to_string();
        let headers = field.headers().clone();
        let content = field.bytes().await?;
        debug!(
            "Buffered field {:?} ({:?}, {} bytes)",
            name,
            file_name,
            content.len()
        );

        collected.push(CollectedPart {
            name,
            file_name,
            headers,
            content,
        });
    }

    state.schema.validate(&collected)?;

    let uploaded = forward_all(state.sink.as_ref(), into_uploads(collected)).await?;
    info!("Buffered and forwarded {:?}", uploaded);
    Ok(UploadSummary { uploaded })
}
