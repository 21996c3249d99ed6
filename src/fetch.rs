use std::collections::BTreeMap;
use std::io::Cursor;

use image::DynamicImage;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{RawImage, Session};
use crate::codec;
use crate::error::{EncodeError, FetchError};
use crate::request::Request;

/// Text field under which the request snapshot is embedded.
pub const METADATA_KEY: &str = "prompt";

/// An encoded PNG carrying a snapshot of the request that produced it.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    filename: String,
    metadata: Request,
    data: Cursor<Vec<u8>>,
}

impl GeneratedImage {
    /// Traceability token, `distillery_<uuid>.png`. Nothing is written to disk.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Request snapshot taken when the image was fetched.
    pub fn metadata(&self) -> &Request {
        &self.metadata
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.get_ref()
    }

    /// Encoded buffer, positioned at its start.
    pub fn into_reader(self) -> Cursor<Vec<u8>> {
        self.data
    }

    pub fn decode(&self) -> Result<DynamicImage, EncodeError> {
        codec::decode(self.bytes())
    }

    pub fn embedded_fields(&self) -> Result<BTreeMap<String, String>, EncodeError> {
        codec::read_text_fields(self.bytes())
    }
}

/// Run `request` against `session` and embed provenance into every image.
///
/// Calls the backend `batch_count` times and returns the images flattened in
/// call order, then within-call order. Any backend or encoding failure is
/// returned as is; recovery belongs to the retry layer.
pub fn fetch<S: Session + ?Sized>(
    session: &mut S,
    request: &Request,
) -> Result<Vec<GeneratedImage>, FetchError> {
    if request.batch_count() == 0 {
        return Err(FetchError::InvalidRequest(
            "batch count must be at least 1".into(),
        ));
    }

    let mut images = Vec::new();
    for batch in 0..request.batch_count() {
        let raw = session.generate(request.backend_payload())?;
        debug!(batch, images = raw.len(), "backend call returned");
        for image in &raw {
            images.push(embed(image, request)?);
        }
    }
    Ok(images)
}

fn embed(raw: &RawImage, request: &Request) -> Result<GeneratedImage, FetchError> {
    let filename = format!("distillery_{}.png", Uuid::new_v4());
    let snapshot = request.clone();
    let text = snapshot.to_metadata().map_err(EncodeError::from)?;
    let fields = BTreeMap::from([(METADATA_KEY.to_string(), text)]);
    let data = codec::encode_png(raw, &fields)?;
    debug!(filename, bytes = data.get_ref().len(), "embedded request metadata");
    Ok(GeneratedImage {
        filename,
        metadata: snapshot,
        data,
    })
}
