use axum::http::{HeaderMap, Uri, header};

/// Pull the caller's credential from the places clients put it, in order:
/// bearer, x-api-key, x-goog-api-key, `?key=`.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(text) = value.to_str()
    {
        let text = text.trim();
        let prefix = "Bearer ";
        if text.len() > prefix.len() && text[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = text[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name)
            && let Ok(text) = value.to_str()
        {
            let text = text.trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }

    let query = query?;
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(query).ok()?;
    pairs
        .into_iter()
        .find(|(name, _)| name == "key")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Downstream auth material must never reach an upstream or a log line.
pub fn strip_auth_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
    headers.remove("x-goog-api-key");
}

pub fn strip_auth_query(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) else {
        return Some(query.to_string());
    };
    let filtered: Vec<(String, String)> =
        pairs.into_iter().filter(|(name, _)| name != "key").collect();
    if filtered.is_empty() {
        return None;
    }
    serde_urlencoded::to_string(&filtered).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer tok-1"),
        );
        assert_eq!(
            extract_token(&headers, Some("key=tok-2")).as_deref(),
            Some("tok-1")
        );
    }

    #[test]
    fn query_key_is_the_last_resort() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_token(&headers, Some("alt=sse&key=tok-q")).as_deref(),
            Some("tok-q")
        );
        assert_eq!(extract_token(&headers, None), None);
    }

    #[test]
    fn key_param_is_stripped_from_query() {
        let uri: Uri = "/hub/v1beta/models/g:generateContent?key=secret&alt=sse"
            .parse()
            .unwrap();
        assert_eq!(strip_auth_query(&uri).as_deref(), Some("alt=sse"));

        let uri: Uri = "/hub/v1/chat/completions?key=secret".parse().unwrap();
        assert_eq!(strip_auth_query(&uri), None);
    }
}
