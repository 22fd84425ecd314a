use reqwest::Method;
use ring::digest::{digest, SHA256};

/// Top-level resources whose id is a major parameter: two requests that
/// differ only in this id never share a rate-limit bucket.
const MAJOR_RESOURCES: [&str; 3] = ["channels", "guilds", "webhooks"];

/// `(method, route template with the major id kept)`, e.g.
/// `GET /channels/123/messages/{id}` for `GET /channels/123/messages/456`.
pub fn bucket_key(method: &Method, path: &str) -> String {
    let path = path.split('?').next().unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    // Webhook tokens are credentials, and keys get logged.
    let token_tag = match segments.as_slice() {
        ["webhooks", _, token, ..] => token_digest(token),
        _ => String::new(),
    };
    let mut template: Vec<&str> = Vec::with_capacity(segments.len());
    for (index, segment) in segments.iter().copied().enumerate() {
        let root = segments.first().copied().unwrap_or_default();
        let is_major = MAJOR_RESOURCES.contains(&root)
            && (index == 1 || (root == "webhooks" && index == 2));

        if is_major && index == 2 {
            template.push(&token_tag);
        } else if is_major {
            template.push(segment);
        } else if segment == "reactions" {
            template.push("reactions");
            if index + 1 < segments.len() {
                template.push("{emoji}");
            }
            break;
        } else if segment.bytes().all(|b| b.is_ascii_digit()) {
            template.push("{id}");
        } else {
            template.push(segment);
        }
    }

    format!("{} /{}", method, template.join("/"))
}

/// Stable stand-in for a webhook token: `{token:` + 16 hex digits of its
/// SHA-256 + `}`.
fn token_digest(token: &str) -> String {
    let hash = digest(&SHA256, token.as_bytes());
    let hex: String = hash.as_ref()[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{{token:{hex}}}")
}
