//! QR payload for out-of-band pairing.
//!
//! The payload is a `portico://pair` URI carrying host, port, the pairing
//! token and the root certificate fingerprint, so the client can pin the
//! root before trusting anything the daemon serves.

use serde::{Deserialize, Serialize};

pub const PAIR_URI_SCHEME: &str = "portico";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub host: String,
    pub port: u16,
    pub token: String,
    pub root_fingerprint: String,
}

impl DiscoveryPayload {
    pub fn to_uri(&self) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("host", &self.host)
            .append_pair("port", &self.port.to_string())
            .append_pair("token", &self.token)
            .append_pair("fp", &self.root_fingerprint)
            .finish();
        format!("{PAIR_URI_SCHEME}://pair?{query}")
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        let url = url::Url::parse(uri).ok()?;
        if url.scheme() != PAIR_URI_SCHEME || url.host_str() != Some("pair") {
            return None;
        }
        let mut host = None;
        let mut port = None;
        let mut token = None;
        let mut fp = None;
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "host" => host = Some(v.into_owned()),
                "port" => port = v.parse::<u16>().ok(),
                "token" => token = Some(v.into_owned()),
                "fp" => fp = Some(v.into_owned()),
                _ => {}
            }
        }
        Some(Self {
            host: host?,
            port: port?,
            token: token?,
            root_fingerprint: fp?,
        })
    }
}

/// Render the payload as a Unicode QR code for terminal display.
pub fn qr_code_unicode(payload: &DiscoveryPayload) -> String {
    use qrcode::render::unicode;
    use qrcode::QrCode;

    let uri = payload.to_uri();
    match QrCode::new(uri.as_bytes()) {
        Ok(code) => code
            .render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build(),
        Err(e) => {
            tracing::warn!(error = %e, "QR code generation failed");
            format!("(QR code unavailable: {e})")
        }
    }
}
