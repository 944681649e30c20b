use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Description of one observed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedExchange {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub client_addr: Option<String>,
    /// Header names lowercased; repeated headers joined with `, `.
    pub headers: BTreeMap<String, String>,
    pub parsed_query_params: BTreeMap<String, Vec<String>>,
    /// `null` when the body was empty or not buffered.
    pub parsed_body: Value,
}

impl CapturedExchange {
    pub fn new(
        method: impl Into<String>,
        scheme: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
        query: Option<&str>,
    ) -> Self {
        Self {
            method: method.into(),
            scheme: scheme.into(),
            host: host.into(),
            path: path.into(),
            client_addr: None,
            headers: BTreeMap::new(),
            parsed_query_params: query.map(parse_query).unwrap_or_default(),
            parsed_body: Value::Null,
        }
    }

    pub fn with_client_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.client_addr = addr.map(|a| a.ip().to_string());
        self
    }

    pub fn with_headers<'a, I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in headers {
            self.headers
                .entry(name.to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        self
    }

    /// Attach a buffered body, interpreted using the recorded content type.
    pub fn with_body(mut self, body: &[u8]) -> Self {
        let content_type = self.headers.get("content-type").map(String::as_str);
        self.parsed_body = parse_body(body, content_type);
        self
    }
}

/// Parse a query string into a multi-valued map.
pub fn parse_query(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        params
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    params
}

/// Interpret a request body for capture.
///
/// JSON bodies are kept structured, urlencoded forms become a string map and
/// anything else is stored as (lossy) UTF-8 text.
pub fn parse_body(body: &[u8], content_type: Option<&str>) -> Value {
    if body.is_empty() {
        return Value::Null;
    }

    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        return json;
    }

    let is_form = content_type
        .map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
        .unwrap_or(false);
    if is_form {
        let form = url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
            .collect::<serde_json::Map<_, _>>();
        return Value::Object(form);
    }

    Value::String(String::from_utf8_lossy(body).into_owned())
}
