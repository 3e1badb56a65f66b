//! Upload strategy that spools file parts to temp files and forwards them
//! from disk.

use axum::{
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use log::{debug, info};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::{
    AppState, Cleanup, Error, FormPart, Upload, UploadFile, UploadSummary, forward_all,
    multipart_boundary,
};

/// A received field: either spooled to disk or a plain text value.
#[derive(Debug)]
pub enum Received {
    File(UploadFile),
    Text { field: String },
}

impl FormPart for Received {
    fn field_name(&self) -> &str {
        match self {
            Received::File(file) => file.field_name(),
            Received::Text { field } => field,
        }
    }

    fn file_name(&self) -> &str {
        match self {
            Received::File(file) => file.file_name(),
            Received::Text { .. } => "",
        }
    }
}

/// A response that still owns the request's temp files. Turning it into a
/// response hands the files to a background cleanup task.
pub struct WithCleanup<R> {
    pub response: R,
    pub cleanup: Cleanup,
}

impl<R: IntoResponse> IntoResponse for WithCleanup<R> {
    fn into_response(self) -> Response {
        if !self.cleanup.is_empty() {
            debug!("Scheduling removal of {} temp files", self.cleanup.len());
            let _ = self.cleanup.spawn();
        }
        self.response.into_response()
    }
}

#[axum::debug_handler]
pub async fn upload(
    State(state): State<AppState>,
    request: Request,
) -> WithCleanup<Result<UploadSummary, Error>> {
    let mut cleanup = Cleanup::default();
    let response = spool_and_forward(&state, request, &mut cleanup).await;
    WithCleanup { response, cleanup }
}

async fn spool_and_forward(
    state: &AppState,
    request: Request,
    cleanup: &mut Cleanup,
) -> Result<UploadSummary, Error> {
    let (parts, body) = request.into_parts();
    let boundary = multipart_boundary(&parts.headers)?;
    let mut multipart = multer::Multipart::with_constraints(
        body.into_data_stream(),
        boundary,
        state.limits.constraints(),
    );

    let mut received = Vec::new();
    while let Some(mut field) = multipart.next_field().await? {
        let field_name = field.name().unwrap_or_default().to_string();

        match field.file_name().map(str::to_string) {
            Some(file_name) if !file_name.is_empty() => {
                let content_type = field
                    .content_type()
                    .map(|ct| ct.to_string())
                    .unwrap_or_else(|| mime::APPLICATION_OCTET_STREAM.to_string());

                let temp_file = NamedTempFile::new_in(state.spool_dir.as_path())
                    .map_err(|e| Error::IOError(format!("Failed to create temp file: {e}")))?;
                let temp_file_path = temp_file.path().to_path_buf();
                cleanup.push(temp_file);
                debug!("Created temp file at: {:?}", temp_file_path);

                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&temp_file_path)
                    .await
                    .map_err(|e| Error::IOError(format!("Failed to open temp file: {e}")))?;

                let mut total_bytes = 0;
                while let Some(chunk) = field.chunk().await? {
                    total_bytes += chunk.len();
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| Error::IOError(format!("Failed to write to temp file: {e}")))?;
                }
                file.sync_all()
                    .await
                    .map_err(|e| Error::IOError(format!("Failed to sync temp file: {e}")))?;
                debug!("Total bytes written to file: {}", total_bytes);

                received.push(Received::File(UploadFile {
                    field: field_name,
                    name: file_name,
                    content_type,
                    temp_file_path,
                }));
            }
            _ => {
                let value = field.text().await?;
                debug!("Text field {:?} ({} bytes)", field_name, value.len());
                received.push(Received::Text { field: field_name });
            }
        }
    }

    state.schema.validate(&received)?;

    let mut uploads = Vec::new();
    for part in &received {
        if let Received::File(file) = part {
            let reader = file.open().await?;
            debug!("Forwarding {:?} ({}) from disk", file.name, file.content_type);
            uploads.push(Upload::new(
                file.name.clone(),
                reqwest::Body::wrap_stream(ReaderStream::new(reader)),
            ));
        }
    }

    let uploaded = forward_all(state.sink.as_ref(), uploads).await?;
    info!("Spooled and forwarded {:?}", uploaded);
    Ok(UploadSummary { uploaded })
}
