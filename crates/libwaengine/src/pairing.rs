use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use qrcode::QrCode;
use qrcode::render::svg;

const MIN_DIMENSION: u32 = 256;

/// Render a pairing code as a QR image usable by any viewer transport:
/// an SVG wrapped in a `data:` URL.
pub fn render_data_url(code: &str) -> Result<String, qrcode::types::QrError> {
    let qr = QrCode::new(code.as_bytes())?;
    let image = qr
        .render()
        .min_dimensions(MIN_DIMENSION, MIN_DIMENSION)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        STANDARD.encode(image.as_bytes())
    ))
}

/// Render a pairing code for a terminal, for operators tailing the log.
pub fn render_terminal(code: &str) -> Option<String> {
    qr2term::generate_qr_string(code).ok()
}
