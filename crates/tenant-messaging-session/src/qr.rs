//! Rendering raw pairing challenges into displayable images.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use qrcode::{QrCode, render::svg};
use thiserror::Error;

/// QR rendering error.
#[derive(Debug, Error)]
pub enum QrError {
    #[error("Failed to encode QR: {0}")]
    Encode(String),
}

/// Turns a raw challenge into something a browser can display.
pub trait QrRenderer: Send + Sync {
    /// Render `challenge`.
    ///
    /// # Errors
    /// Returns error if the challenge cannot be encoded.
    fn render(&self, challenge: &str) -> Result<String, QrError>;
}

/// Renders an SVG QR code as a `data:` URL.
#[derive(Debug, Clone, Copy)]
pub struct SvgDataUrlRenderer {
    size: u32,
}

impl SvgDataUrlRenderer {
    #[must_use]
    pub const fn new(size: u32) -> Self {
        Self { size }
    }
}

impl Default for SvgDataUrlRenderer {
    fn default() -> Self {
        Self::new(256)
    }
}

impl QrRenderer for SvgDataUrlRenderer {
    fn render(&self, challenge: &str) -> Result<String, QrError> {
        let code = QrCode::new(challenge.as_bytes()).map_err(|e| QrError::Encode(e.to_string()))?;
        let image = code
            .render::<svg::Color<'_>>()
            .min_dimensions(self.size, self.size)
            .build();
        Ok(format!("data:image/svg+xml;base64,{}", BASE64.encode(image)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_svg_data_url() {
        let url = SvgDataUrlRenderer::default()
            .render("2@abc,def,ghi,1")
            .unwrap();
        let encoded = url.strip_prefix("data:image/svg+xml;base64,").unwrap();
        let svg = String::from_utf8(BASE64.decode(encoded).unwrap()).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn test_same_challenge_renders_identically() {
        let renderer = SvgDataUrlRenderer::new(128);
        assert_eq!(renderer.render("abc").unwrap(), renderer.render("abc").unwrap());
    }
}
