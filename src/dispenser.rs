//! Pull-style multipart decoder.
//!
//! [`Dispenser`] turns a body stream into a sequence of [`Part`]s that the
//! caller pulls one at a time. Only the current part's unread bytes plus a
//! short look-back tail are ever held in memory, so the body is never
//! buffered as a whole.
//!
//! A delimiter is `CRLF "--" boundary`. The body is seeded with a CRLF so the
//! first delimiter, which usually opens the body without one, is found by the
//! same search as every later delimiter.

use std::fmt::Display;

use axum::http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{CONTENT_DISPOSITION, CONTENT_TYPE},
};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use log::debug;
use memchr::memmem;

use crate::{Error, FormPart, UploadLimits};

const CRLF: &[u8] = b"\r\n";
const CLOSE: &[u8] = b"--";
const MAX_HEADER_SIZE: usize = 8 * 1024;
const MAX_HEADERS: usize = 16;

/// Extracts the boundary from a `multipart/form-data` content type.
///
/// Any other media type is rejected with [`Error::UnsupportedMediaType`],
/// while a multipart type without a usable boundary is a malformed body.
pub fn multipart_boundary(headers: &HeaderMap) -> Result<String, Error> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .ok_or_else(|| Error::UnsupportedMediaType("content type is missing".to_string()))?
        .to_str()
        .map_err(|_| Error::UnsupportedMediaType("content type is not valid text".to_string()))?;
    debug!("Content-Type: {:?}", content_type);

    let mime: mime::Mime = content_type
        .parse()
        .map_err(|e| Error::UnsupportedMediaType(format!("{content_type}: {e}")))?;
    if mime.type_() != mime::MULTIPART || mime.subtype() != mime::FORM_DATA {
        return Err(Error::UnsupportedMediaType(content_type.to_string()));
    }

    match mime.get_param(mime::BOUNDARY) {
        Some(boundary) if !boundary.as_str().is_empty() => Ok(boundary.as_str().to_string()),
        _ => Err(Error::malformed("boundary is missing from the content type")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Preamble,
    AfterDelimiter,
    Headers,
    Body,
    Eof,
}

pub struct Dispenser<S> {
    stream: S,
    delimiter: Vec<u8>,
    buffer: BytesMut,
    stage: Stage,
    exhausted: bool,
    dispensed: usize,
    limits: UploadLimits,
    body_size: u64,
    part_size: u64,
}

impl<S, E> Dispenser<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(stream: S, boundary: impl AsRef<str>) -> Result<Self, Error> {
        let boundary = boundary.as_ref();
        if boundary.is_empty() {
            return Err(Error::malformed("boundary is missing"));
        }
        debug!("Creating dispenser with boundary: {:?}", boundary);

        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(CRLF);
        delimiter.extend_from_slice(CLOSE);
        delimiter.extend_from_slice(boundary.as_bytes());

        let mut buffer = BytesMut::with_capacity(8 * 1024);
        buffer.extend_from_slice(CRLF);

        Ok(Self {
            stream,
            delimiter,
            buffer,
            stage: Stage::Preamble,
            exhausted: false,
            dispensed: 0,
            limits: UploadLimits::unlimited(),
            body_size: 0,
            part_size: 0,
        })
    }

    pub fn with_limits(mut self, limits: UploadLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Yields the next part in body order, or `None` after the closing
    /// delimiter. Unread content of the previous part is discarded first.
    pub async fn next_part(&mut self) -> Result<Option<Part<'_, S>>, Error> {
        loop {
            match self.stage {
                Stage::Preamble => {
                    if let Some(i) = memmem::find(&self.buffer, &self.delimiter) {
                        self.buffer.advance(i + self.delimiter.len());
                        self.stage = Stage::AfterDelimiter;
                    } else {
                        self.keep_tail();
                        self.fill_or_fail("before the first boundary").await?;
                    }
                }
                Stage::AfterDelimiter => {
                    if self.buffer.len() < 2 {
                        self.fill_or_fail("right after a boundary").await?;
                        continue;
                    }
                    match &self.buffer[..2] {
                        b"\r\n" => {
                            self.buffer.advance(2);
                            self.stage = Stage::Headers;
                        }
                        b"--" => {
                            // The epilogue is ignored.
                            self.buffer.clear();
                            self.stage = Stage::Eof;
                            debug!("Dispensed {} parts", self.dispensed);
                        }
                        other => {
                            return Err(Error::malformed(format!(
                                "boundary must be followed by CRLF or `--`, found {:?}",
                                String::from_utf8_lossy(other)
                            )));
                        }
                    }
                }
                Stage::Headers => {
                    let meta = self.read_headers().await?;
                    self.stage = Stage::Body;
                    self.part_size = 0;
                    self.dispensed += 1;
                    debug!(
                        "Dispensing part #{}: name={:?} filename={:?}",
                        self.dispensed, meta.name, meta.file_name
                    );
                    return Ok(Some(Part {
                        meta,
                        dispenser: self,
                    }));
                }
                Stage::Body => {
                    let mut skipped = 0;
                    while let Some(chunk) = self.read_body().await? {
                        skipped += chunk.len();
                    }
                    debug!("Skipped {} unread bytes of part #{}", skipped, self.dispensed);
                }
                Stage::Eof => return Ok(None),
            }
        }
    }

    async fn read_headers(&mut self) -> Result<PartMeta, Error> {
        loop {
            let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
            match httparse::parse_headers(&self.buffer, &mut raw) {
                Ok(httparse::Status::Complete((len, parsed))) => {
                    if len > MAX_HEADER_SIZE {
                        return Err(Error::malformed("part headers are too large"));
                    }
                    let meta = PartMeta::from_raw(parsed)?;
                    self.buffer.advance(len);
                    return Ok(meta);
                }
                Ok(httparse::Status::Partial) => {
                    if self.buffer.len() > MAX_HEADER_SIZE {
                        return Err(Error::malformed("part headers are too large"));
                    }
                    self.fill_or_fail("inside part headers").await?;
                }
                Err(e) => return Err(Error::malformed(format!("invalid part headers: {e}"))),
            }
        }
    }

    /// Next piece of the current part's content, or `None` once its
    /// terminating delimiter has been consumed.
    async fn read_body(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            if self.stage != Stage::Body {
                return Ok(None);
            }
            if let Some(i) = memmem::find(&self.buffer, &self.delimiter) {
                let chunk = self.buffer.split_to(i).freeze();
                self.buffer.advance(self.delimiter.len());
                self.stage = Stage::AfterDelimiter;
                self.count_part_bytes(chunk.len())?;
                return Ok((!chunk.is_empty()).then_some(chunk));
            }
            // A delimiter may start in the last `len - 1` bytes, hold those back.
            let keep = self.delimiter.len() - 1;
            if self.buffer.len() > keep {
                let ready = self.buffer.len() - keep;
                self.count_part_bytes(ready)?;
                return Ok(Some(self.buffer.split_to(ready).freeze()));
            }
            self.fill_or_fail("inside a part body").await?;
        }
    }

    fn count_part_bytes(&mut self, len: usize) -> Result<(), Error> {
        self.part_size += len as u64;
        if self.part_size > self.limits.per_part {
            return Err(Error::PayloadTooLarge(format!(
                "part #{} exceeds {} bytes",
                self.dispensed, self.limits.per_part
            )));
        }
        Ok(())
    }

    fn keep_tail(&mut self) {
        let keep = self.delimiter.len() - 1;
        if self.buffer.len() > keep {
            let discard = self.buffer.len() - keep;
            self.buffer.advance(discard);
        }
    }

    /// Pulls one more chunk from the transport. Returns `false` once the
    /// stream has ended.
    async fn fill(&mut self) -> Result<bool, Error> {
        if self.exhausted {
            return Ok(false);
        }
        match self.stream.next().await {
            Some(Ok(chunk)) => {
                self.body_size += chunk.len() as u64;
                if self.body_size > self.limits.whole_body {
                    return Err(Error::PayloadTooLarge(format!(
                        "body exceeds {} bytes",
                        self.limits.whole_body
                    )));
                }
                self.buffer.extend_from_slice(&chunk);
                Ok(true)
            }
            Some(Err(e)) => Err(Error::ReadError(e.to_string())),
            None => {
                self.exhausted = true;
                Ok(false)
            }
        }
    }

    async fn fill_or_fail(&mut self, position: &str) -> Result<(), Error> {
        if self.fill().await? {
            Ok(())
        } else {
            Err(Error::malformed(format!("body ended {position}")))
        }
    }
}

#[derive(Debug, Clone)]
struct PartMeta {
    name: String,
    file_name: String,
    headers: HeaderMap,
}

impl PartMeta {
    fn from_raw(raw: &[httparse::Header<'_>]) -> Result<Self, Error> {
        let mut headers = HeaderMap::with_capacity(raw.len());
        for header in raw {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| Error::malformed(format!("invalid part header name: {e}")))?;
            let value = HeaderValue::from_bytes(header.value)
                .map_err(|e| Error::malformed(format!("invalid part header value: {e}")))?;
            headers.append(name, value);
        }

        let disposition = headers
            .get(CONTENT_DISPOSITION)
            .ok_or_else(|| Error::malformed("part has no Content-Disposition header"))?;
        // Browsers send raw UTF-8 file names, which `to_str` would refuse.
        let disposition = std::str::from_utf8(disposition.as_bytes())
            .map_err(|_| Error::malformed("Content-Disposition is not valid UTF-8"))?;
        let (name, file_name) = parse_disposition(disposition)?;

        Ok(Self {
            name,
            file_name: file_name.unwrap_or_default(),
            headers,
        })
    }
}

/// Returns the `name` and `filename` parameters of a `form-data` disposition.
fn parse_disposition(value: &str) -> Result<(String, Option<String>), Error> {
    let (kind, rest) = value.split_once(';').unwrap_or((value, ""));
    if !kind.trim().eq_ignore_ascii_case("form-data") {
        return Err(Error::malformed(format!(
            "unexpected Content-Disposition {:?}",
            kind.trim()
        )));
    }

    let mut name = None;
    let mut file_name = None;
    for (key, value) in disposition_params(rest) {
        match key.as_str() {
            "name" => name = Some(value),
            "filename" => file_name = Some(value),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| Error::malformed("Content-Disposition has no name"))?;
    Ok((name, file_name))
}

fn disposition_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ';').is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ';') {
            key.push(c);
        }

        let mut value = String::new();
        if chars.next_if_eq(&'=').is_some() {
            if chars.next_if_eq(&'"').is_some() {
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => value.extend(chars.next()),
                        '"' => break,
                        c => value.push(c),
                    }
                }
            } else {
                while let Some(c) = chars.next_if(|c| *c != ';') {
                    value.push(c);
                }
                value = value.trim().to_string();
            }
        }

        params.push((key.trim().to_ascii_lowercase(), value));
    }

    params
}

pub struct Part<'a, S> {
    meta: PartMeta,
    dispenser: &'a mut Dispenser<S>,
}

impl<S> Part<'_, S> {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn file_name(&self) -> &str {
        &self.meta.file_name
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.meta.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.meta
            .headers
            .get(CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
    }
}

impl<S, E> Part<'_, S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    /// Reads the next piece of content. Content can be read only once.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        self.dispenser.read_body().await
    }

    pub async fn bytes(self) -> Result<Bytes, Error> {
        Ok(self.collect().await?.content)
    }

    /// Drains the content so the part outlives the dispenser borrow.
    pub async fn collect(mut self) -> Result<CollectedPart, Error> {
        let mut content = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            content.extend_from_slice(&chunk);
        }
        debug!(
            "Collected {} bytes for part {:?}",
            content.len(),
            self.meta.name
        );

        Ok(CollectedPart {
            name: self.meta.name,
            file_name: self.meta.file_name,
            headers: self.meta.headers,
            content: content.freeze(),
        })
    }
}

/// A part whose content has been read to completion.
#[derive(Debug, Clone)]
pub struct CollectedPart {
    pub name: String,
    pub file_name: String,
    pub headers: HeaderMap,
    pub content: Bytes,
}

impl FormPart for CollectedPart {
    fn field_name(&self) -> &str {
        &self.name
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }
}
