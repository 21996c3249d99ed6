//! PNG encoding with embedded text fields, and the matching readers.

use std::collections::BTreeMap;
use std::io::Cursor;

use image::DynamicImage;

use crate::error::EncodeError;

/// Encode `image` as 8-bit RGBA PNG, writing one text chunk per field.
///
/// Latin-1 text goes into `tEXt`; anything else into `iTXt`. The returned
/// cursor is positioned at the start of the buffer.
pub fn encode_png(
    image: &DynamicImage,
    fields: &BTreeMap<String, String>,
) -> Result<Cursor<Vec<u8>>, EncodeError> {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        for (keyword, text) in fields {
            if is_latin1(text) {
                encoder.add_text_chunk(keyword.clone(), text.clone())?;
            } else {
                encoder.add_itxt_chunk(keyword.clone(), text.clone())?;
            }
        }
        let mut writer = encoder.write_header()?;
        writer.write_image_data(rgba.as_raw())?;
        writer.finish()?;
    }
    Ok(Cursor::new(out))
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, EncodeError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Read every text field stored ahead of the image data.
pub fn read_text_fields(bytes: &[u8]) -> Result<BTreeMap<String, String>, EncodeError> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_ignore_text_chunk(false);
    let reader = decoder.read_info()?;
    let info = reader.info();
    let mut fields = BTreeMap::new();
    for chunk in &info.uncompressed_latin1_text {
        fields.insert(chunk.keyword.clone(), chunk.text.clone());
    }
    for chunk in &info.compressed_latin1_text {
        fields.insert(chunk.keyword.clone(), chunk.get_text()?);
    }
    for chunk in &info.utf8_text {
        fields.insert(chunk.keyword.clone(), chunk.get_text()?);
    }
    Ok(fields)
}

#[inline]
fn is_latin1(text: &str) -> bool {
    text.chars().all(|c| (c as u32) <= 0xFF)
}
